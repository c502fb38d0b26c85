//! Per-compile diagnostic accumulator.
//!
//! Parse and check errors are collected here instead of being raised. A
//! [`Diagnostics`] value is created fresh for every compile and returned to the
//! caller alongside the artifact or the failure, so concurrent compiles never
//! share counters.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// Byte range into the combined (prelude + user) source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start: start as u32,
            end: end as u32,
        }
    }

    /// Smallest span covering both `self` and `other`.
    pub fn to(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// Where a diagnostic points to, resolved against the source it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Prelude { line: usize, column: usize },
    User { line: usize, column: usize },
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Prelude { line, column } => write!(f, "<prelude>:{}:{}", line, column),
            Location::User { line, column } => write!(f, "{}:{}", line, column),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub location: Location,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{}: {}: {}", self.location, kind, self.message)
    }
}

/// Warning/error counters plus the messages behind them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
    errors: usize,
    warnings: usize,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        match diagnostic.severity {
            Severity::Error => self.errors += 1,
            Severity::Warning => self.warnings += 1,
        }
        self.entries.push(diagnostic);
    }

    pub fn errors(&self) -> usize {
        self.errors
    }

    pub fn warnings(&self) -> usize {
        self.warnings
    }

    pub fn has_errors(&self) -> bool {
        self.errors != 0
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter()
    }

    /// Messages of all error-level diagnostics, in report order.
    pub fn error_messages(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .map(|d| d.message.as_str())
            .collect()
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for diagnostic in &self.entries {
            writeln!(f, "{}", diagnostic)?;
        }
        write!(f, "{} error(s), {} warning(s)", self.errors, self.warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_follow_severity() {
        let mut diags = Diagnostics::new();
        diags.push(Diagnostic {
            severity: Severity::Warning,
            message: "unused variable `x`".into(),
            location: Location::User { line: 1, column: 5 },
        });
        diags.push(Diagnostic {
            severity: Severity::Error,
            message: "unknown name `y`".into(),
            location: Location::User { line: 2, column: 1 },
        });

        assert_eq!(diags.errors(), 1);
        assert_eq!(diags.warnings(), 1);
        assert!(diags.has_errors());
        assert_eq!(diags.error_messages(), vec!["unknown name `y`"]);
    }

    #[test]
    fn test_display_includes_locations() {
        let mut diags = Diagnostics::new();
        diags.push(Diagnostic {
            severity: Severity::Error,
            message: "bad".into(),
            location: Location::Prelude { line: 3, column: 7 },
        });
        let text = diags.to_string();
        assert!(text.contains("<prelude>:3:7: error: bad"));
        assert!(text.ends_with("1 error(s), 0 warning(s)"));
    }
}

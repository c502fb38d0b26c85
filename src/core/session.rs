// This module provides the per-compile session used by the JIT pipeline. A CompileSession
// owns everything one compile needs to account for: the bumpalo arena holding the assembled
// source text (prelude followed by user code) and the interned identifiers the frontend
// produces, the Diagnostics accumulator whose warning and error counters start at zero for
// every compile, and SessionStats recording functions emitted, instruction counts around the
// optimizer and per-stage timings. Because the session is created by the compile call and
// threaded explicitly through parser and checker, concurrent compiles never share counters.
// Spans are resolved to prelude or user line/column positions when a diagnostic is reported.

//! Arena-based compilation session management.
//!
//! All frontend objects borrow from the session arena and share the session
//! lifetime, which ends when the compile call returns.

use crate::core::diagnostics::{Diagnostic, Diagnostics, Location, Severity, Span};
use bumpalo::Bump;
use hashbrown::HashSet;
use std::fmt;
use std::time::Duration;

/// State for one compile: source, arena, diagnostics and statistics.
pub struct CompileSession<'arena> {
    /// Arena allocator for source text and interned names.
    arena: &'arena Bump,

    /// Prelude followed by the user source.
    source: &'arena str,

    /// Byte length of the prelude part of `source`.
    prelude_len: usize,

    /// Interned identifier strings.
    interned: HashSet<&'arena str>,

    diagnostics: Diagnostics,

    stats: SessionStats,
}

impl<'arena> CompileSession<'arena> {
    /// Create a session whose source is `prelude` followed by `user`.
    pub fn new(arena: &'arena Bump, prelude: &str, user: &str) -> Self {
        let mut text =
            bumpalo::collections::String::with_capacity_in(prelude.len() + user.len() + 1, arena);
        text.push_str(prelude);
        if !prelude.is_empty() && !prelude.ends_with('\n') {
            text.push('\n');
        }
        let prelude_len = text.len();
        text.push_str(user);

        Self {
            arena,
            source: text.into_bump_str(),
            prelude_len,
            interned: HashSet::new(),
            diagnostics: Diagnostics::new(),
            stats: SessionStats::default(),
        }
    }

    /// Get access to the arena allocator.
    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// The full source handed to the parser.
    pub fn source(&self) -> &'arena str {
        self.source
    }

    pub fn prelude_len(&self) -> usize {
        self.prelude_len
    }

    /// Intern a string in the arena.
    pub fn intern_str(&mut self, s: &str) -> &'arena str {
        if let Some(&interned) = self.interned.get(s) {
            return interned;
        }

        let interned = self.arena.alloc_str(s);
        self.interned.insert(interned);
        interned
    }

    /// Report an error at `span`.
    pub fn error(&mut self, span: Span, message: impl Into<String>) {
        self.report(Severity::Error, span, message.into());
    }

    /// Report a warning at `span`.
    pub fn warning(&mut self, span: Span, message: impl Into<String>) {
        self.report(Severity::Warning, span, message.into());
    }

    fn report(&mut self, severity: Severity, span: Span, message: String) {
        let location = self.locate(span);
        log::debug!("{}: {:?}: {}", location, severity, message);
        self.diagnostics.push(Diagnostic {
            severity,
            message,
            location,
        });
    }

    /// Resolve a span start to a prelude or user line/column (1-based).
    pub fn locate(&self, span: Span) -> Location {
        let offset = (span.start as usize).min(self.source.len());
        let (base, origin_prelude) = if offset < self.prelude_len {
            (0, true)
        } else {
            (self.prelude_len, false)
        };

        let text = &self.source[base..offset];
        let line = text.matches('\n').count() + 1;
        let column = match text.rfind('\n') {
            Some(nl) => offset - (base + nl + 1) + 1,
            None => offset - base + 1,
        };

        if origin_prelude {
            Location::Prelude { line, column }
        } else {
            Location::User { line, column }
        }
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn error_count(&self) -> usize {
        self.diagnostics.errors()
    }

    pub fn warning_count(&self) -> usize {
        self.diagnostics.warnings()
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut SessionStats {
        &mut self.stats
    }

    /// Record how long a pipeline stage took.
    pub fn record_stage(&mut self, stage: &'static str, elapsed: Duration) {
        self.stats.stage_times.push((stage, elapsed));
    }

    /// Consume the session, keeping what outlives the compile.
    pub fn finish(self) -> (Diagnostics, SessionStats) {
        (self.diagnostics, self.stats)
    }
}

/// Compilation session statistics.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SessionStats {
    /// Functions in the module after emission.
    pub functions_emitted: usize,

    /// IR instructions right after emission.
    pub instructions_emitted: usize,

    /// IR instructions after cleanup/opt/codegen_prepare.
    pub instructions_optimized: usize,

    /// External functions the generated module imports.
    pub externs_resolved: usize,

    /// Wall time per pipeline stage, in execution order.
    pub stage_times: Vec<(&'static str, Duration)>,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Session Statistics:")?;
        writeln!(f, "  Functions emitted: {}", self.functions_emitted)?;
        writeln!(f, "  Instructions emitted: {}", self.instructions_emitted)?;
        writeln!(f, "  Instructions after optimization: {}", self.instructions_optimized)?;
        writeln!(f, "  External symbols resolved: {}", self.externs_resolved)?;

        if !self.stage_times.is_empty() {
            writeln!(f, "  Stage timings:")?;
            for (stage, elapsed) in &self.stage_times {
                writeln!(f, "    {}: {:?}", stage, elapsed)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_assembles_source() {
        let arena = Bump::new();
        let session = CompileSession::new(&arena, "fn a() {}", "fn b() {}");

        assert_eq!(session.source(), "fn a() {}\nfn b() {}");
        assert_eq!(session.prelude_len(), 10);
        assert_eq!(session.error_count(), 0);
        assert_eq!(session.warning_count(), 0);
    }

    #[test]
    fn test_string_interning() {
        let arena = Bump::new();
        let mut session = CompileSession::new(&arena, "", "");

        let s1 = session.intern_str("hello");
        let s2 = session.intern_str("hello");
        let s3 = session.intern_str("world");

        assert_eq!(s1.as_ptr(), s2.as_ptr());
        assert_ne!(s1.as_ptr(), s3.as_ptr());
    }

    #[test]
    fn test_locations_split_prelude_and_user() {
        let arena = Bump::new();
        let mut session = CompileSession::new(&arena, "a\nbc\n", "x\n  y");

        // "c" sits on prelude line 2, column 2.
        assert_eq!(session.locate(Span::new(3, 4)), Location::Prelude { line: 2, column: 2 });
        // "y" sits on user line 2, column 3.
        let y = session.source().rfind('y').unwrap();
        assert_eq!(session.locate(Span::new(y, y + 1)), Location::User { line: 2, column: 3 });

        session.error(Span::new(y, y + 1), "unexpected `y`");
        session.warning(Span::new(0, 1), "odd prelude");
        assert_eq!(session.error_count(), 1);
        assert_eq!(session.warning_count(), 1);
    }

    #[test]
    fn test_statistics_display() {
        let arena = Bump::new();
        let mut session = CompileSession::new(&arena, "", "");

        session.stats_mut().functions_emitted = 2;
        session.stats_mut().instructions_emitted = 17;
        session.record_stage("parse", Duration::from_micros(5));

        let output = format!("{}", session.stats());
        assert!(output.contains("Functions emitted: 2"));
        assert!(output.contains("Instructions emitted: 17"));
        assert!(output.contains("parse:"));
    }
}

//! Source prepended to every compile unless disabled.
//!
//! Declares the libm functions the process already links and a few integer
//! helpers. Unused prelude functions are removed by `cleanup`, so the prelude
//! adds nothing to modules that do not call into it.

/// Built-in prelude text.
pub const PRELUDE: &str = "\
extern fn sqrt(x: f64) -> f64;
extern fn sin(x: f64) -> f64;
extern fn cos(x: f64) -> f64;
extern fn exp(x: f64) -> f64;
extern fn log(x: f64) -> f64;
extern fn pow(x: f64, y: f64) -> f64;
extern fn fabs(x: f64) -> f64;
extern fn floor(x: f64) -> f64;
extern fn ceil(x: f64) -> f64;

fn min(a: i64, b: i64) -> i64 {
    if a < b { a } else { b }
}

fn max(a: i64, b: i64) -> i64 {
    if a > b { a } else { b }
}

fn abs(a: i64) -> i64 {
    if a < 0 { -a } else { a }
}
";

/// Prelude a [`Jit`](super::Jit) prepends to user source.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PreludeSource {
    #[default]
    Builtin,
    Custom(String),
    Disabled,
}

impl PreludeSource {
    pub fn text(&self) -> &str {
        match self {
            PreludeSource::Builtin => PRELUDE,
            PreludeSource::Custom(text) => text,
            PreludeSource::Disabled => "",
        }
    }
}

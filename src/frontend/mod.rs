// The frontend turns kernel-language source into a checked AST. The lexer and parser report
// syntax problems to the compile session and keep going, the checker resolves names and
// assigns a type to every expression. Nothing here allocates process-wide state: all names
// are interned in the session arena and all diagnostics land in the session.

//! Kernel-language frontend: lexing, parsing and checking.

pub mod ast;
pub mod check;
pub mod lexer;
pub mod parser;

pub use ast::Module;
pub use check::{check_module, TypeTable};
pub use parser::parse_module;

//! Scanner and single-pass Pratt compiler for the Dragon language
//! (`spec.md` §4.3-4.4). Turns source text directly into a [`dragon_core::Function`]
//! living on a [`dragon_core::Heap`] — no intermediate AST.

pub mod compiler;
pub mod error;
pub mod scanner;
pub mod token;

pub use compiler::compile;
pub use error::CompileError;
pub use scanner::Scanner;
pub use token::{Token, TokenKind};

//! Compile-time diagnostics (`spec.md` §7).

use std::fmt;

#[derive(Debug, Clone)]
pub struct CompileError {
    pub line: u32,
    pub message: String,
    /// Set when the error was produced during panic-mode synchronization
    /// rather than at the original failure point, so callers can choose to
    /// suppress secondary noise if they want to.
    pub cascaded: bool,
}

impl CompileError {
    pub fn new(line: u32, message: impl Into<String>) -> Self {
        CompileError {
            line,
            message: message.into(),
            cascaded: false,
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] Error: {}", self.line, self.message)
    }
}

impl std::error::Error for CompileError {}

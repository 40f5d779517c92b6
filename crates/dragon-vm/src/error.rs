//! The three error planes named in `spec.md` §7: compile errors live in
//! `dragon-compiler::CompileError`; runtime exceptions are thrown `Instance`
//! values unwound by `exception.rs`, not a Rust error type; this module
//! holds only the third plane, corrupt-state aborts that are not part of the
//! language's own exception mechanism.

use std::fmt;

/// Something the interpreter loop itself cannot recover from: a dangling
/// reference, an empty value stack read, a module-id out of range. These
/// indicate a bug in the VM, not a user program error, and are never
/// catchable from Dragon code.
#[derive(Debug)]
pub enum FatalVmError {
    StackUnderflow,
    InvalidModule(usize),
    CorruptBytecode(&'static str),
}

impl fmt::Display for FatalVmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalVmError::StackUnderflow => write!(f, "value stack underflow"),
            FatalVmError::InvalidModule(id) => write!(f, "invalid module id {id}"),
            FatalVmError::CorruptBytecode(msg) => write!(f, "corrupt bytecode: {msg}"),
        }
    }
}

impl std::error::Error for FatalVmError {}

/// Outcome of running a closure to completion (`spec.md` §4.6 step 3/4 and
/// §6's CLI exit-code contract).
#[derive(Debug)]
pub enum InterpretResult {
    Ok,
    /// An exception reached the top of the call stack uncaught; the
    /// formatted trace (header line + `[line] in fn` lines) is attached.
    RuntimeError(String),
}

/// The two error planes `Vm::run_source` can fail with; kept distinct so the
/// CLI can map them to the separate exit codes `spec.md` §6 specifies (121
/// vs 122). The third plane, [`FatalVmError`], never reaches this type — it
/// aborts instead of unwinding through a `Result`.
#[derive(Debug)]
pub enum RunError {
    Compile(String),
    Runtime(String),
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::Compile(msg) => write!(f, "{msg}"),
            RunError::Runtime(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for RunError {}

//! `dragon`: the file runner and REPL for the Dragon language (`spec.md` §6).
//!
//! Exit codes mirror the reference `Dragon.c` driver exactly: `120` for a
//! usage error or an unreadable file, `121` for a compile error, `122` for an
//! uncaught runtime exception, `0` otherwise. `clap` only describes the
//! argument shape here — its own usage-error exit code doesn't match `120`,
//! so anything beyond "zero or one path" is rejected by hand before we ever
//! let it print its own error and exit.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use dragon_vm::{RunError, Vm, VmConfig};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

const EXIT_USAGE: u8 = 120;
const EXIT_COMPILE_ERROR: u8 = 121;
const EXIT_RUNTIME_ERROR: u8 = 122;

/// Run a `.dgn` script, or start the REPL if no path is given.
#[derive(Parser, Debug)]
#[command(name = "dragon", version, about, disable_help_flag = true)]
struct Cli {
    /// Path to a `.dgn` source file.
    path: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    match cli.path {
        Some(path) => run_file(path),
        None => run_repl(),
    }
}

fn run_file(path: PathBuf) -> ExitCode {
    let source = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Could not read file '{}': {e}", path.display());
            return ExitCode::from(EXIT_USAGE);
        }
    };
    let directory = path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));

    let mut vm = Vm::new(VmConfig::default());
    let module = vm.create_module(directory);
    match vm.run_source(module, &source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Compile(msg)) => {
            eprintln!("{msg}");
            ExitCode::from(EXIT_COMPILE_ERROR)
        }
        Err(RunError::Runtime(msg)) => {
            eprintln!("{msg}");
            ExitCode::from(EXIT_RUNTIME_ERROR)
        }
    }
}

/// A plain read-eval-print loop, one line at a time, rooted at the current
/// directory for `import` resolution. A runtime error prints its trace to
/// stderr but never ends the session — only EOF does (`Dragon.c`'s `repl()`
/// never exits on `interpret()` returning an error either). No history file
/// is persisted: `spec.md` §6 names no persisted state for the REPL.
fn run_repl() -> ExitCode {
    let mut vm = Vm::new(VmConfig::default());
    let module = vm.create_module(PathBuf::from("."));

    let mut editor = match DefaultEditor::new() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("Could not start line editor: {e}");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                let _ = editor.add_history_entry(line.as_str());
                match vm.run_source(module, &line) {
                    Ok(()) => {}
                    Err(RunError::Compile(msg)) => eprintln!("{msg}"),
                    Err(RunError::Runtime(msg)) => eprintln!("{msg}"),
                }
            }
            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => break,
            Err(e) => {
                eprintln!("Readline error: {e}");
                break;
            }
        }
    }
    ExitCode::SUCCESS
}

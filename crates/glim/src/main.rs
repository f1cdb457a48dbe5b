use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use glim::{GlimError, Session};

/// Exit codes follow the sysexits convention: 64 for usage and I/O
/// problems, 65 for compile errors, 70 for runtime errors.
const EX_USAGE: u8 = 64;
const EX_DATAERR: u8 = 65;
const EX_SOFTWARE: u8 = 70;

#[derive(Parser)]
#[command(name = "glim", about = "Glim: a bytecode-compiled scripting language", version)]
struct Cli {
    /// Script file to execute; omit to start a REPL
    file: Option<PathBuf>,

    /// Dump compiled bytecode and trace each executed instruction
    #[arg(short = 'D', long)]
    debug: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut session = Session::new();
    session.set_debug(cli.debug);

    match cli.file {
        Some(path) => run_file(&mut session, &path),
        None => repl(&mut session),
    }
}

fn run_file(session: &mut Session, path: &PathBuf) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Error reading {}: {err}", path.display());
            return ExitCode::from(EX_USAGE);
        }
    };

    match session.eval(&source, &mut std::io::stdout()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err @ GlimError::Compile { .. }) => {
            eprintln!("{err}");
            ExitCode::from(EX_DATAERR)
        }
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(EX_SOFTWARE)
        }
    }
}

fn repl(session: &mut Session) -> ExitCode {
    let mut rl = match DefaultEditor::new() {
        Ok(rl) => rl,
        Err(err) => {
            eprintln!("Error starting line editor: {err}");
            return ExitCode::from(EX_USAGE);
        }
    };

    println!("Glim v{}", env!("CARGO_PKG_VERSION"));

    loop {
        match rl.readline("glim> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line);
                // Errors are reported and the prompt continues; globals
                // defined so far survive.
                if let Err(err) = session.eval(line, &mut std::io::stdout()) {
                    eprintln!("{err}");
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Read error: {err}");
                return ExitCode::from(EX_USAGE);
            }
        }
    }
    ExitCode::SUCCESS
}

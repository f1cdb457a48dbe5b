//! Glim — a small, dynamically typed, class-based scripting language
//! compiled to bytecode and run on a stack VM.
//!
//! This crate provides the CLI binary and a thin embedding API:
//!
//! ```no_run
//! use glim::Session;
//!
//! let mut session = Session::new();
//! session
//!     .eval("print 1 + 2;", &mut std::io::stdout())
//!     .unwrap();
//! ```

use std::io::Write;

pub use glim_core::{GlimError, Value};
use glim_vm::{compile, disasm, natives, VM};

/// A compile-and-run session. Globals persist across `eval` calls, which is
/// what makes the REPL work; a runtime error resets the stacks but keeps
/// the globals.
pub struct Session {
    vm: VM,
    debug: bool,
}

impl Session {
    pub fn new() -> Self {
        let mut vm = VM::new();
        natives::install(&mut vm);
        Session { vm, debug: false }
    }

    /// Enable bytecode dumps after compilation and per-instruction tracing
    /// during execution (both on stderr).
    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
        self.vm.set_trace(debug);
    }

    /// Compile and execute one program. PRINT output goes to `out`.
    pub fn eval(&mut self, source: &str, out: &mut impl Write) -> Result<(), GlimError> {
        let function = compile(source)?;
        if self.debug {
            eprint!("{}", disasm::disassemble_program(&function));
        }
        self.vm.interpret(function, out)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

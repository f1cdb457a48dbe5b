use glim::{GlimError, Session};

/// Run a program and return its PRINT output.
pub fn run_ok(source: &str) -> String {
    let mut session = Session::new();
    let mut out = Vec::new();
    session
        .eval(source, &mut out)
        .unwrap_or_else(|e| panic!("program failed for `{source}`: {e}"));
    String::from_utf8(out).expect("valid utf-8 output")
}

/// Run a program that is expected to fail and return the error.
pub fn run_err(source: &str) -> GlimError {
    let mut session = Session::new();
    let mut out = Vec::new();
    session
        .eval(source, &mut out)
        .expect_err(&format!("expected an error for `{source}`"))
}

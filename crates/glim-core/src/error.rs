use std::fmt;
use std::rc::Rc;

/// A single frame in a runtime stack trace, innermost first.
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub line: u32,
    /// Function name; empty for the top-level script.
    pub name: Rc<str>,
}

/// A captured call-stack trace, walked from the innermost frame outward.
#[derive(Debug, Clone)]
pub struct StackTrace(pub Vec<TraceFrame>);

impl fmt::Display for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, frame) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            if frame.name.is_empty() {
                write!(f, "[line {}] in script", frame.line)?;
            } else {
                write!(f, "[line {}] in {}()", frame.line, frame.name)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GlimError {
    /// Compilation failed. Individual diagnostics have already been written
    /// to stderr by the parser; this carries only the count.
    #[error("compilation failed with {count} error(s)")]
    Compile { count: usize },

    #[error("{message}\n{trace}")]
    Runtime { message: String, trace: StackTrace },

    #[error("IO error: {0}")]
    Io(String),
}

impl GlimError {
    pub fn runtime(message: impl Into<String>) -> Self {
        GlimError::Runtime {
            message: message.into(),
            trace: StackTrace(Vec::new()),
        }
    }

    /// The bare message of a runtime error, or the full rendering otherwise.
    pub fn message(&self) -> String {
        match self {
            GlimError::Runtime { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_renders_innermost_first() {
        let trace = StackTrace(vec![
            TraceFrame { line: 2, name: Rc::from("b") },
            TraceFrame { line: 1, name: Rc::from("a") },
            TraceFrame { line: 3, name: Rc::from("") },
        ]);
        let rendered = trace.to_string();
        assert_eq!(
            rendered,
            "[line 2] in b()\n[line 1] in a()\n[line 3] in script"
        );
    }

    #[test]
    fn runtime_error_displays_message_then_trace() {
        let err = GlimError::Runtime {
            message: "Operands must be numbers.".to_string(),
            trace: StackTrace(vec![TraceFrame { line: 1, name: Rc::from("") }]),
        };
        assert_eq!(
            err.to_string(),
            "Operands must be numbers.\n[line 1] in script"
        );
    }
}

pub mod chunk;
pub mod error;
pub mod value;

pub use chunk::{Chunk, Function, MAX_CONSTANTS};
pub use error::{GlimError, StackTrace, TraceFrame};
pub use value::{BoundMethod, Class, Closure, Instance, NativeFn, Upvalue, UpvalueState, Value};

pub type Result<T> = std::result::Result<T, GlimError>;

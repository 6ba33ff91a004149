use crate::{Oop, Value};

/// Failures raised by object memory operations.
///
/// None of these are fatal to the VM: primitives turn them into a
/// primitive failure so the method's fallback code runs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("shape mismatch: {0}")]
    ShapeMismatch(&'static str),
    #[error("index {index} out of bounds (size {size})")]
    IndexOutOfBounds { index: usize, size: usize },
    #[error("{value:?} cannot be stored in a {strategy} region")]
    NotRepresentable { value: Value, strategy: &'static str },
    #[error("object is not indexable")]
    NotIndexable,
    #[error("{0:?} does not name a live object")]
    InvalidOop(Oop),
    #[error("immediate value {0:?} has no heap record")]
    NotAnObject(Value),
    #[error("{0:?} is not a class")]
    NotAClass(Value),
    #[error("special object `{0}` is missing or malformed")]
    MissingSpecialObject(&'static str),
}

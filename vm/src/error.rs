use std::fmt;

use object::MemoryError;
use thiserror::Error;

/// Conditions that stop the interpreter.
///
/// Everything recoverable (primitive failure, unknown selectors, shape
/// mismatches raised by primitives) is handled inside the image and never
/// becomes a `VmError`.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("corrupt image: {0}")]
    CorruptImage(String),

    #[error("image invariant violated: {0}")]
    ImageInvariantViolated(String),

    #[error("scheduler invariant violated: {0}")]
    SchedulerInvariantViolated(String),

    #[error("object memory: {0}")]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl VmError {
    pub(crate) fn corrupt(message: impl Into<String>) -> Self {
        Self::CorruptImage(message.into())
    }

    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        Self::ImageInvariantViolated(message.into())
    }

    pub(crate) fn scheduler(message: impl Into<String>) -> Self {
        Self::SchedulerInvariantViolated(message.into())
    }
}

/// Outcome of a primitive that did not complete.
#[derive(Debug)]
pub enum PrimitiveError {
    /// Operands were rejected; the method body runs instead.
    Failed,
    /// Something the image cannot recover from.
    Fatal(VmError),
}

impl From<MemoryError> for PrimitiveError {
    fn from(_: MemoryError) -> Self {
        PrimitiveError::Failed
    }
}

impl From<VmError> for PrimitiveError {
    fn from(err: VmError) -> Self {
        PrimitiveError::Fatal(err)
    }
}

/// Diagnostic report returned by `VM::run` when a fatal condition stops
/// the interpreter.
#[derive(Debug, Error)]
pub struct Halt {
    #[source]
    pub error: VmError,
    /// The bytecode being executed, if the interpreter had fetched one.
    pub bytecode: Option<u8>,
    pub pc: usize,
    /// Innermost context first.
    pub chain: Vec<String>,
}

impl fmt::Display for Halt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        if let Some(byte) = self.bytecode {
            write!(f, " (bytecode {byte} at pc {})", self.pc)?;
        }
        for line in &self.chain {
            write!(f, "\n  {line}")?;
        }
        Ok(())
    }
}

//! Error types for devcache-core operations

use devcache_backends::BackendError;

/// Result type for devcache-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in devcache-core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Context or buffer creation refused by the device
    #[error("Allocation failed (code {code}): {reason}")]
    AllocationFailure { code: i32, reason: String },

    /// Host data larger than the buffer
    #[error("Write of {len} elements exceeds buffer capacity {capacity}")]
    SizeExceeded { len: usize, capacity: usize },

    /// Read destination cannot hold the buffer contents
    #[error("Read destination holds {available} elements, buffer has {required}")]
    DestinationTooSmall { required: usize, available: usize },

    /// Program build failed; `log` is the compiler diagnostic text verbatim
    #[error("Program compilation failed (code {code}):\n{log}")]
    CompileFailure { code: i32, log: String },

    /// Entry point could not be resolved in a built program
    #[error("Kernel '{entry_point}' could not be created (code {code}): {reason}")]
    KernelCreateFailure {
        entry_point: String,
        code: i32,
        reason: String,
    },

    /// Kernel launch failed
    #[error("Kernel '{entry_point}' failed to execute (code {code})")]
    ExecuteFailure { entry_point: String, code: i32 },

    /// Argument slot outside `0..MAX_ARGS`
    #[error("Argument slot {slot} out of range: programs have {max} slots")]
    InvalidSlot { slot: usize, max: usize },

    /// Operation not valid in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Device refused a kernel-argument bind
    #[error("Binding argument slot {slot} failed (code {code})")]
    ArgBindFailure { slot: usize, code: i32 },

    /// Device refused an upload or download
    #[error("Device transfer failed (code {code}): {reason}")]
    TransferFailure { code: i32, reason: String },

    /// Launch range with a bad dimension or an empty extent
    #[error("Invalid work range: {0}")]
    InvalidWorkRange(String),

    /// Registry lookup by name found nothing
    #[error("Unknown {kind} '{name}'")]
    UnknownResource { kind: &'static str, name: String },

    /// Configuration could not be parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Device call failed outside the operations above (teardown)
    #[error(transparent)]
    Backend(BackendError),
}

impl Error {
    /// Device status code carried by this error, if any
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::AllocationFailure { code, .. }
            | Self::CompileFailure { code, .. }
            | Self::KernelCreateFailure { code, .. }
            | Self::ExecuteFailure { code, .. }
            | Self::ArgBindFailure { code, .. }
            | Self::TransferFailure { code, .. } => Some(*code),
            Self::Backend(err) => Some(err.code()),
            _ => None,
        }
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub(crate) fn allocation(err: BackendError) -> Self {
        Self::AllocationFailure {
            code: err.code(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn transfer(err: BackendError) -> Self {
        Self::TransferFailure {
            code: err.code(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn compile(err: BackendError) -> Self {
        match err {
            BackendError::BuildFailed { code, log } => Self::CompileFailure { code, log },
            other => Self::CompileFailure {
                code: other.code(),
                log: other.to_string(),
            },
        }
    }
}

impl From<BackendError> for Error {
    fn from(err: BackendError) -> Self {
        match err {
            // `WorkRange::new(..)?` lands here.
            BackendError::InvalidWorkRange(msg) => Self::InvalidWorkRange(msg),
            other => Self::Backend(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devcache_backends::{status, WorkRange};

    #[test]
    fn work_range_errors_convert_to_invalid_work_range() {
        let result: Result<WorkRange> = WorkRange::new(4, &[0; 4], &[1; 4]).map_err(Error::from);
        assert!(matches!(result, Err(Error::InvalidWorkRange(_))));
    }

    #[test]
    fn build_log_survives_conversion() {
        let err = Error::compile(BackendError::build_failed("1:1: error: program source is empty"));
        match &err {
            Error::CompileFailure { code, log } => {
                assert_eq!(*code, status::BUILD_PROGRAM_FAILURE);
                assert_eq!(log, "1:1: error: program source is empty");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.code(), Some(status::BUILD_PROGRAM_FAILURE));
    }

    #[test]
    fn non_build_errors_become_compile_failures() {
        let err = Error::compile(BackendError::InvalidContext(3));
        assert_eq!(err.code(), Some(status::INVALID_CONTEXT));
        assert!(Error::invalid_state("closed").code().is_none());
    }
}

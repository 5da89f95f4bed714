//! Error types for compute-API calls

/// Result type for compute-API calls
pub type Result<T> = std::result::Result<T, BackendError>;

/// Device status codes reported by [`BackendError::code`].
///
/// The values follow the OpenCL status-code table so that logs from every
/// backend read the same way.
pub mod status {
    pub const SUCCESS: i32 = 0;
    pub const DEVICE_NOT_FOUND: i32 = -1;
    pub const DEVICE_NOT_AVAILABLE: i32 = -2;
    pub const MEM_OBJECT_ALLOCATION_FAILURE: i32 = -4;
    pub const OUT_OF_RESOURCES: i32 = -5;
    pub const BUILD_PROGRAM_FAILURE: i32 = -11;
    pub const INVALID_VALUE: i32 = -30;
    pub const INVALID_CONTEXT: i32 = -34;
    pub const INVALID_MEM_OBJECT: i32 = -38;
    pub const INVALID_PROGRAM: i32 = -44;
    pub const INVALID_KERNEL_NAME: i32 = -46;
    pub const INVALID_KERNEL: i32 = -48;
    pub const INVALID_ARG_INDEX: i32 = -49;
    pub const INVALID_KERNEL_ARGS: i32 = -52;
    pub const INVALID_WORK_DIMENSION: i32 = -53;
    pub const INVALID_GLOBAL_OFFSET: i32 = -56;
    pub const INVALID_BUFFER_SIZE: i32 = -61;
}

/// Errors reported by a [`crate::ComputeApi`] implementation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// No device could produce a context
    #[error("device unavailable: {reason}")]
    DeviceUnavailable { code: i32, reason: String },

    /// Unknown or already freed context handle
    #[error("invalid context handle: {0}")]
    InvalidContext(u64),

    /// Unknown or already freed memory handle
    #[error("invalid memory object: {0}")]
    InvalidMemObject(u64),

    /// Unknown or already freed program handle
    #[error("invalid program handle: {0}")]
    InvalidProgram(u64),

    /// Unknown or already freed kernel handle
    #[error("invalid kernel handle: {0}")]
    InvalidKernel(u64),

    /// Requested allocation size is zero or unrepresentable
    #[error("invalid buffer size: {0} bytes")]
    InvalidBufferSize(usize),

    /// Device memory exhausted
    #[error("allocation of {requested} bytes failed: {available} bytes available")]
    OutOfDeviceMemory { requested: usize, available: usize },

    /// Host transfer larger than the device allocation
    #[error("transfer of {size} bytes exceeds buffer size {buffer_size}")]
    BufferOutOfBounds { size: usize, buffer_size: usize },

    /// Program source failed to build; `log` is the compiler output verbatim
    #[error("program build failed:\n{log}")]
    BuildFailed { code: i32, log: String },

    /// Entry point not present in the built program
    #[error("kernel '{name}' not found in program")]
    KernelNotFound { name: String },

    /// Argument index beyond the kernel's parameter list
    #[error("argument index {index} out of range (kernel takes {arity})")]
    InvalidArgIndex { index: u32, arity: u32 },

    /// Launch attempted while an argument has not been set
    #[error("kernel argument {index} is not set")]
    UnboundArgument { index: u32 },

    /// Work range dimension outside 1..=3 or with an empty extent
    #[error("invalid work range: {0}")]
    InvalidWorkRange(String),

    /// Driver call failed with a raw status code
    #[error("driver call {op} failed with code {code}")]
    Driver { op: &'static str, code: i32 },

    /// Operation this backend cannot express
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl BackendError {
    /// Device status code for this error
    pub fn code(&self) -> i32 {
        match self {
            Self::DeviceUnavailable { code, .. } => *code,
            Self::InvalidContext(_) => status::INVALID_CONTEXT,
            Self::InvalidMemObject(_) => status::INVALID_MEM_OBJECT,
            Self::InvalidProgram(_) => status::INVALID_PROGRAM,
            Self::InvalidKernel(_) => status::INVALID_KERNEL,
            Self::InvalidBufferSize(_) => status::INVALID_BUFFER_SIZE,
            Self::OutOfDeviceMemory { .. } => status::MEM_OBJECT_ALLOCATION_FAILURE,
            Self::BufferOutOfBounds { .. } => status::INVALID_VALUE,
            Self::BuildFailed { code, .. } => *code,
            Self::KernelNotFound { .. } => status::INVALID_KERNEL_NAME,
            Self::InvalidArgIndex { .. } => status::INVALID_ARG_INDEX,
            Self::UnboundArgument { .. } => status::INVALID_KERNEL_ARGS,
            Self::InvalidWorkRange(_) => status::INVALID_WORK_DIMENSION,
            Self::Driver { code, .. } => *code,
            Self::Unsupported(_) => status::INVALID_VALUE,
        }
    }

    /// Create a build failure carrying the compiler log
    pub fn build_failed(log: impl Into<String>) -> Self {
        Self::BuildFailed {
            code: status::BUILD_PROGRAM_FAILURE,
            log: log.into(),
        }
    }

    /// Create an unsupported-operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_status_table() {
        assert_eq!(BackendError::InvalidMemObject(3).code(), status::INVALID_MEM_OBJECT);
        assert_eq!(
            BackendError::UnboundArgument { index: 1 }.code(),
            status::INVALID_KERNEL_ARGS
        );
        assert_eq!(
            BackendError::build_failed("1:1: error: expected '}'").code(),
            status::BUILD_PROGRAM_FAILURE
        );
        assert_eq!(BackendError::Driver { op: "cuInit", code: 100 }.code(), 100);
    }

    #[test]
    fn build_log_is_kept_verbatim() {
        let log = "line 3, column 1: error: unmatched '}'";
        let err = BackendError::build_failed(log);
        assert!(err.to_string().ends_with(log));
    }
}

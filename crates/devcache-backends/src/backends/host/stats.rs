//! Call counters and fault injection for the host backend

use std::fmt;

/// Counts of successful device calls made against a [`super::HostBackend`]
///
/// Failed calls, including injected faults, are not counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStats {
    pub contexts_created: u64,
    pub contexts_freed: u64,
    pub buffers_created: u64,
    pub buffers_freed: u64,
    pub writes: u64,
    pub bytes_written: u64,
    pub reads: u64,
    pub bytes_read: u64,
    pub programs_built: u64,
    pub build_failures: u64,
    pub programs_freed: u64,
    pub kernels_created: u64,
    pub kernels_freed: u64,
    pub global_binds: u64,
    pub local_binds: u64,
    pub launches: u64,
    pub ranged_launches: u64,
}

impl HostStats {
    /// Argument binds of either kind
    pub fn binds(&self) -> u64 {
        self.global_binds + self.local_binds
    }

    /// Launches with or without an explicit range
    pub fn total_launches(&self) -> u64 {
        self.launches + self.ranged_launches
    }
}

/// Device call that can be made to fail with [`super::HostBackend::fail_next`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostOp {
    ContextCreate,
    ContextFree,
    BufferCreate,
    BufferFree,
    BufferWrite,
    BufferRead,
    ProgramCreate,
    ProgramFree,
    KernelCreate,
    KernelFree,
    SetArg,
    Execute,
}

impl HostOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ContextCreate => "context_create",
            Self::ContextFree => "context_free",
            Self::BufferCreate => "buffer_create",
            Self::BufferFree => "buffer_free",
            Self::BufferWrite => "buffer_write",
            Self::BufferRead => "buffer_read",
            Self::ProgramCreate => "program_create",
            Self::ProgramFree => "program_free",
            Self::KernelCreate => "kernel_create",
            Self::KernelFree => "kernel_free",
            Self::SetArg => "set_kernel_arg",
            Self::Execute => "execute",
        }
    }
}

impl fmt::Display for HostOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

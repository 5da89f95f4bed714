//! The compute-API boundary

use super::types::{ContextHandle, KernelHandle, MemHandle, MemFlags, ProgramHandle, WorkRange};
use crate::error::Result;
use std::any::Any;

/// Device compute API used by the caching layer
///
/// Every device-facing call the cache makes goes through this trait: context
/// lifetime, buffer lifetime and transfer, program build, kernel resolution,
/// argument binding and launch. Handles are plain integers; a backend may
/// reuse a freed value for a later allocation.
///
/// Implementations are driven from behind a mutex, so methods take `&mut self`
/// and need not be internally synchronized.
pub trait ComputeApi: Send {
    /// Backend name used in logs
    fn name(&self) -> &'static str;

    // ============================================================================================
    // Context
    // ============================================================================================

    fn context_create(&mut self) -> Result<ContextHandle>;

    fn context_free(&mut self, context: ContextHandle) -> Result<()>;

    // ============================================================================================
    // Memory
    // ============================================================================================

    /// Allocate `size_bytes` of device memory
    fn buffer_create(&mut self, context: ContextHandle, size_bytes: usize, flags: MemFlags) -> Result<MemHandle>;

    fn buffer_free(&mut self, mem: MemHandle) -> Result<()>;

    /// Copy `data` into the start of `mem`
    fn buffer_write(&mut self, mem: MemHandle, data: &[u8]) -> Result<()>;

    /// Copy the first `data.len()` bytes of `mem` into `data`
    fn buffer_read(&mut self, mem: MemHandle, data: &mut [u8]) -> Result<()>;

    /// Allocation size of `mem` in bytes
    fn buffer_size(&self, mem: MemHandle) -> Result<usize>;

    // ============================================================================================
    // Programs and kernels
    // ============================================================================================

    /// Build `source` for the context's device
    ///
    /// A failed build returns [`crate::BackendError::BuildFailed`] carrying the
    /// compiler log.
    fn program_create(&mut self, context: ContextHandle, source: &str) -> Result<ProgramHandle>;

    fn program_free(&mut self, program: ProgramHandle) -> Result<()>;

    /// Resolve `entry_point` in a built program
    fn kernel_create(&mut self, program: ProgramHandle, entry_point: &str) -> Result<KernelHandle>;

    fn kernel_free(&mut self, kernel: KernelHandle) -> Result<()>;

    /// Set argument `index` to a device-global memory object
    fn set_kernel_arg_mem(&mut self, kernel: KernelHandle, index: u32, mem: MemHandle) -> Result<()>;

    /// Set argument `index` to work-group local memory sized like `mem`
    fn set_kernel_arg_mem_local(&mut self, kernel: KernelHandle, index: u32, mem: MemHandle) -> Result<()>;

    // ============================================================================================
    // Execution
    // ============================================================================================

    /// Launch with the backend's default range; returns after completion
    fn execute(&mut self, kernel: KernelHandle) -> Result<()>;

    /// Launch over an explicit range; returns after completion
    fn execute_range(&mut self, kernel: KernelHandle, range: &WorkRange) -> Result<()>;

    // ============================================================================================
    // Downcasting
    // ============================================================================================

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

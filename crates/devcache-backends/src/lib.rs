//! # devcache-backends
//!
//! The compute-API boundary for devcache and its implementations.
//!
//! [`ComputeApi`] is the only surface the caching layer talks to: contexts,
//! memory objects, programs, kernels, argument binding and launches, all
//! addressed through plain integer handles. Two implementations ship here:
//!
//! - [`HostBackend`]: runs in host memory, counts every device call and can
//!   inject failures. It is the default backend and the one tests use.
//! - `CudaBackend`: NVIDIA GPUs through cudarc (`cuda` feature).
//!
//! ```rust
//! use devcache_backends::{ComputeApi, HostBackend, MemFlags};
//!
//! # fn main() -> Result<(), devcache_backends::BackendError> {
//! let mut backend = HostBackend::new();
//! let ctx = backend.context_create()?;
//! let mem = backend.buffer_create(ctx, 3 * 8, MemFlags::ReadWrite)?;
//! backend.buffer_write(mem, bytemuck::cast_slice(&[1.0f64, 2.0, 3.0]))?;
//!
//! let mut out = [0.0f64; 3];
//! backend.buffer_read(mem, bytemuck::cast_slice_mut(&mut out))?;
//! assert_eq!(out, [1.0, 2.0, 3.0]);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod backends;
pub mod error;

pub use backend::{ComputeApi, ContextHandle, KernelHandle, MemFlags, MemHandle, ProgramHandle, WorkRange};
pub use backends::{HostBackend, HostKernelFn, HostOp, HostStats, KernelArgs};
pub use error::{status, BackendError, Result};

#[cfg(feature = "cuda")]
pub use backends::CudaBackend;

//! Backend implementations
//!
//! - `host`: always available reference backend
//! - `cuda`: NVIDIA GPUs through cudarc (requires the `cuda` feature)

pub mod host;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use host::{HostBackend, HostKernelFn, HostOp, HostStats, KernelArgs};

#[cfg(feature = "cuda")]
pub use cuda::CudaBackend;

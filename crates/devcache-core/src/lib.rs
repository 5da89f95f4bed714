//! # devcache-core - Host-Side Device Resource Caching
//!
//! Thin caching layer over a compute API. It cuts the two most common
//! redundant host-to-device calls in repeated kernel launches:
//!
//! - **Uploads**: a [`Buffer`] carries a version stamp, and writes whose
//!   version is not newer than the stamp never reach the device.
//! - **Argument binds**: a [`Program`] remembers which buffer, at which
//!   version, sits in each of its [`MAX_ARGS`] slots, and skips rebinding it.
//!
//! ## Architecture
//!
//! ```text
//! DeviceContext  (backend + context handle + resource table + CacheStats)
//!   ├── Buffer   (device memory, version stamp)
//!   ├── Program  (program + kernel handles, argument-slot cache)
//!   └── Registry (named ownership of both)
//!          │
//!          ▼
//! devcache_backends::ComputeApi  (HostBackend | CudaBackend)
//! ```
//!
//! Resource identities are generational [`ResourceId`]s. A destroyed
//! buffer's id is never reissued, so a stale argument-slot entry can never
//! match a new buffer.
//!
//! ## Example
//!
//! ```rust
//! use devcache_core::{BindOutcome, DeviceContext, HostBackend, Program, WriteOutcome};
//!
//! # fn main() -> devcache_core::Result<()> {
//! let ctx = DeviceContext::initialize(Box::new(HostBackend::new()))?;
//! let mut x = ctx.alloc(4)?;
//! assert_eq!(x.write(&[1.0, 2.0, 3.0, 4.0], Some(7))?, WriteOutcome::Uploaded);
//!
//! let mut program = Program::compile(&ctx, "__kernel void scale(__global double* x) {}", "scale")?;
//! assert_eq!(program.set_arg(0, &x)?, BindOutcome::Bound);
//! assert_eq!(program.set_arg(0, &x)?, BindOutcome::Cached);
//! program.run()?;
//!
//! program.destroy()?;
//! x.destroy()?;
//! ctx.shutdown()?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod config;
pub mod context;
pub mod error;
pub mod global;
pub mod program;
pub mod registry;
pub mod stats;
pub mod table;

pub use buffer::{Buffer, WriteOutcome, ELEMENT_SIZE};
pub use config::{BackendKind, DeviceConfig};
pub use context::DeviceContext;
pub use error::{Error, Result};
pub use program::{ArgSlot, BindOutcome, Program, ProgramState, MAX_ARGS};
pub use registry::Registry;
pub use stats::CacheStats;
pub use table::ResourceId;

// Backend surface callers need to open a context or inspect it
pub use devcache_backends::{status, ComputeApi, HostBackend, HostOp, HostStats, KernelArgs, MemFlags, WorkRange};

//! Device context
//!
//! A [`DeviceContext`] owns the backend, its context handle and the resource
//! table that maps [`ResourceId`]s to device handles. It is a cheap `Clone`
//! handle; every clone refers to the same context, and every device call
//! made through it is serialized by one mutex.
//!
//! ```rust
//! use devcache_core::{DeviceContext, HostBackend};
//!
//! # fn main() -> devcache_core::Result<()> {
//! let ctx = DeviceContext::initialize(Box::new(HostBackend::new()))?;
//! let mut buf = ctx.alloc(16)?;
//! buf.write(&[1.0, 2.0, 3.0], Some(1))?;
//! buf.destroy()?;
//! ctx.shutdown()?;
//! # Ok(())
//! # }
//! ```

use crate::buffer::Buffer;
use crate::config::{BackendKind, DeviceConfig};
use crate::error::{Error, Result};
use crate::program::Program;
use crate::stats::CacheStats;
use crate::table::{ResourceId, ResourceTable};
use devcache_backends::{ComputeApi, ContextHandle, HostBackend, KernelHandle, MemFlags, MemHandle, ProgramHandle};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;

/// Device handles behind a [`ResourceId`]
#[derive(Debug, Clone, Copy)]
pub(crate) enum DeviceResource {
    Memory(MemHandle),
    Program { program: ProgramHandle, kernel: KernelHandle },
}

pub(crate) struct ContextInner {
    pub(crate) api: Box<dyn ComputeApi + Send>,
    handle: ContextHandle,
    active: bool,
    resources: ResourceTable<DeviceResource>,
    pub(crate) stats: CacheStats,
    default_flags: MemFlags,
}

impl ContextInner {
    pub(crate) fn handle(&self) -> ContextHandle {
        self.handle
    }

    pub(crate) fn register(&mut self, resource: DeviceResource) -> ResourceId {
        self.resources.insert(resource)
    }

    pub(crate) fn memory(&self, id: ResourceId) -> Result<MemHandle> {
        match self.resources.get(id) {
            Some(DeviceResource::Memory(mem)) => Ok(*mem),
            _ => Err(Error::invalid_state(format!("buffer {id} is not live in this context"))),
        }
    }

    pub(crate) fn kernel(&self, id: ResourceId) -> Result<(ProgramHandle, KernelHandle)> {
        match self.resources.get(id) {
            Some(DeviceResource::Program { program, kernel }) => Ok((*program, *kernel)),
            _ => Err(Error::invalid_state(format!("program {id} is not live in this context"))),
        }
    }

    /// Free the device handles behind `id`
    fn release(&mut self, id: ResourceId) -> Result<()> {
        match self.resources.remove(id) {
            Some(DeviceResource::Memory(mem)) => self.api.buffer_free(mem).map_err(Error::from),
            Some(DeviceResource::Program { program, kernel }) => {
                let kernel_freed = self.api.kernel_free(kernel);
                let program_freed = self.api.program_free(program);
                kernel_freed.and(program_freed).map_err(Error::from)
            }
            None => Ok(()),
        }
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if self.active {
            if let Err(err) = self.api.context_free(self.handle) {
                tracing::warn!(context = %self.handle, error = %err, "failed to free dropped device context");
            }
        }
    }
}

/// Shared handle to an open device context
#[derive(Clone)]
pub struct DeviceContext {
    inner: Arc<Mutex<ContextInner>>,
}

impl DeviceContext {
    /// Open a context on `api`
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailure`] if the backend cannot produce a
    /// context.
    pub fn initialize(api: Box<dyn ComputeApi + Send>) -> Result<Self> {
        Self::open(api, MemFlags::default())
    }

    /// Open a context on the backend selected by `config`
    ///
    /// [`BackendKind::Auto`] tries CUDA first and falls back to the host
    /// backend when CUDA is not compiled in or no device opens.
    pub fn from_config(config: &DeviceConfig) -> Result<Self> {
        match config.backend {
            BackendKind::Auto => {
                match config
                    .create_cuda_backend()
                    .and_then(|api| Self::open(api, config.default_flags))
                {
                    Ok(ctx) => {
                        tracing::info!(ordinal = config.device_ordinal, "Auto-selected CUDA backend");
                        Ok(ctx)
                    }
                    Err(err) => {
                        tracing::info!(reason = %err, "Auto-selected host backend (fallback)");
                        Self::open(Box::new(HostBackend::new()), config.default_flags)
                    }
                }
            }
            _ => Self::open(config.create_backend()?, config.default_flags),
        }
    }

    fn open(mut api: Box<dyn ComputeApi + Send>, default_flags: MemFlags) -> Result<Self> {
        let handle = api.context_create().map_err(|err| {
            tracing::warn!(backend = api.name(), error = %err, "device context creation failed");
            Error::allocation(err)
        })?;
        tracing::info!(backend = api.name(), context = %handle, "device context initialized");

        Ok(Self {
            inner: Arc::new(Mutex::new(ContextInner {
                api,
                handle,
                active: true,
                resources: ResourceTable::new(),
                stats: CacheStats::default(),
                default_flags,
            })),
        })
    }

    /// Release the context handle
    ///
    /// Buffers and programs should be destroyed first; any still alive are
    /// reported and their device resources go with the context. Later
    /// operations on this context, from any clone, return
    /// [`Error::InvalidState`].
    pub fn shutdown(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.active {
            return Err(Error::invalid_state("device context is already shut down"));
        }

        let live = inner.resources.len();
        if live > 0 {
            tracing::warn!(live_resources = live, "shutting down device context with live resources");
        }

        let handle = inner.handle;
        inner.api.context_free(handle).map_err(|err| {
            tracing::error!(context = %handle, error = %err, "device context free failed");
            Error::from(err)
        })?;

        inner.resources.drain();
        inner.active = false;
        inner.stats.log_summary();
        tracing::info!(backend = inner.api.name(), context = %handle, "device context shut down");
        Ok(())
    }

    /// Context handle, or [`ContextHandle::NULL`] after shutdown
    pub fn handle(&self) -> ContextHandle {
        let inner = self.inner.lock();
        if inner.active {
            inner.handle
        } else {
            ContextHandle::NULL
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.lock().api.name()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }

    pub fn reset_stats(&self) {
        self.inner.lock().stats = CacheStats::default();
    }

    /// Buffers and programs currently holding device resources
    pub fn live_resources(&self) -> usize {
        self.inner.lock().resources.len()
    }

    pub fn default_flags(&self) -> MemFlags {
        self.inner.lock().default_flags
    }

    /// Whether `other` refers to the same context
    pub fn same_context(&self, other: &DeviceContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Allocate a global buffer of `size` elements with the default flags
    pub fn alloc(&self, size: usize) -> Result<Buffer> {
        Buffer::allocate(self, size, true, self.default_flags())
    }

    /// Allocate a buffer bound as work-group local memory
    pub fn alloc_local(&self, size: usize) -> Result<Buffer> {
        Buffer::allocate(self, size, false, self.default_flags())
    }

    /// Compile `source` and resolve `entry_point`
    pub fn compile(&self, source: &str, entry_point: &str) -> Result<Program> {
        Program::compile(self, source, entry_point)
    }

    /// Run `f` on the backend
    ///
    /// Used to reach backend-specific API, e.g. downcasting to
    /// [`HostBackend`] through [`ComputeApi::as_any`].
    pub fn with_backend<R>(&self, f: impl FnOnce(&mut dyn ComputeApi) -> R) -> R {
        let mut inner = self.inner.lock();
        f(&mut *inner.api)
    }

    /// Lock the context for a device call
    pub(crate) fn lock_active(&self) -> Result<MutexGuard<'_, ContextInner>> {
        let inner = self.inner.lock();
        if inner.active {
            Ok(inner)
        } else {
            Err(Error::invalid_state("device context has been shut down"))
        }
    }

    /// Lock the context without requiring it to be active
    pub(crate) fn lock(&self) -> MutexGuard<'_, ContextInner> {
        self.inner.lock()
    }

    /// Free the device handles behind `id`; a no-op after shutdown
    pub(crate) fn release(&self, id: ResourceId) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.active {
            return Ok(());
        }
        inner.release(id)
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("DeviceContext")
            .field("backend", &inner.api.name())
            .field("handle", &inner.handle)
            .field("active", &inner.active)
            .field("live_resources", &inner.resources.len())
            .finish()
    }
}

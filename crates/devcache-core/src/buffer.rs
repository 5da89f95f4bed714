//! Versioned device buffers
//!
//! A [`Buffer`] is a device allocation of `f64` elements plus a host-side
//! version stamp. Writes carrying a version no newer than the stamp are
//! answered without touching the device; every other write uploads and moves
//! the stamp forward. The stamp never decreases.
//!
//! ```rust
//! use devcache_core::{DeviceContext, HostBackend, WriteOutcome};
//!
//! # fn main() -> devcache_core::Result<()> {
//! let ctx = DeviceContext::initialize(Box::new(HostBackend::new()))?;
//! let mut buf = ctx.alloc(1024)?;
//!
//! let data = [0.5; 10];
//! assert_eq!(buf.write(&data, Some(1))?, WriteOutcome::Uploaded);
//! assert_eq!(buf.write(&data, Some(1))?, WriteOutcome::Skipped);
//! assert_eq!(buf.version(), 1);
//! # Ok(())
//! # }
//! ```

use crate::context::{DeviceContext, DeviceResource};
use crate::error::{Error, Result};
use crate::table::ResourceId;
use devcache_backends::{status, MemFlags};
use devcache_tracing::performance::{self, Direction};
use std::time::Instant;

/// Bytes per element
pub const ELEMENT_SIZE: usize = std::mem::size_of::<f64>();

/// Which branch a [`Buffer::write`] took
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Data was uploaded and the version advanced
    Uploaded,
    /// The version check made the upload unnecessary
    Skipped,
}

/// Device memory of `capacity` `f64` elements with a version stamp
#[derive(Debug)]
pub struct Buffer {
    ctx: DeviceContext,
    id: ResourceId,
    capacity: usize,
    is_global: bool,
    flags: MemFlags,
    version: u64,
}

impl Buffer {
    /// Allocate `size` elements on `ctx`
    ///
    /// `is_global` selects how programs bind the buffer: as a device-global
    /// memory argument or as work-group local memory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailure`] if `size` is zero or the device
    /// refuses the allocation, and [`Error::InvalidState`] if `ctx` has been
    /// shut down.
    #[tracing::instrument(skip(ctx), fields(bytes = size.saturating_mul(ELEMENT_SIZE)))]
    pub fn allocate(ctx: &DeviceContext, size: usize, is_global: bool, flags: MemFlags) -> Result<Self> {
        if size == 0 {
            return Err(Error::AllocationFailure {
                code: status::INVALID_BUFFER_SIZE,
                reason: "buffer size must be at least one element".to_string(),
            });
        }
        let size_bytes = size.checked_mul(ELEMENT_SIZE).ok_or_else(|| Error::AllocationFailure {
            code: status::INVALID_BUFFER_SIZE,
            reason: format!("{size} elements overflow the address space"),
        })?;

        let start = Instant::now();
        let mut inner = ctx.lock_active()?;
        let context = inner.handle();
        let mem = inner.api.buffer_create(context, size_bytes, flags).map_err(|err| {
            tracing::warn!(size_bytes, error = %err, "buffer allocation failed");
            Error::allocation(err)
        })?;
        let id = inner.register(DeviceResource::Memory(mem));
        drop(inner);

        performance::record_allocation(size_bytes, is_global, start.elapsed().as_micros() as u64);

        Ok(Self {
            ctx: ctx.clone(),
            id,
            capacity: size,
            is_global,
            flags,
            version: 0,
        })
    }

    /// Upload `data` to the start of the buffer unless `data_version` shows
    /// the device copy is already current
    ///
    /// With `Some(v)` and `v <= version()`, nothing happens. Otherwise the data
    /// is uploaded and the version becomes `v`, or `version() + 1` when no
    /// version was given.
    ///
    /// # Errors
    ///
    /// - [`Error::SizeExceeded`] if `data` is longer than the buffer
    /// - [`Error::TransferFailure`] if the device refuses the upload
    /// - [`Error::InvalidState`] if the buffer or its context is gone
    ///
    /// The version is unchanged on every error.
    #[tracing::instrument(skip(self, data), fields(buffer = %self.id, elements = data.len()))]
    pub fn write(&mut self, data: &[f64], data_version: Option<u64>) -> Result<WriteOutcome> {
        self.ensure_live()?;
        if data.len() > self.capacity {
            return Err(Error::SizeExceeded {
                len: data.len(),
                capacity: self.capacity,
            });
        }

        let mut inner = self.ctx.lock_active()?;
        if let Some(requested) = data_version {
            if requested <= self.version {
                inner.stats.uploads_skipped += 1;
                drop(inner);
                performance::record_transfer_elided(std::mem::size_of_val(data), requested, self.version);
                return Ok(WriteOutcome::Skipped);
            }
        }

        let start = Instant::now();
        let mem = inner.memory(self.id)?;
        inner.api.buffer_write(mem, bytemuck::cast_slice(data)).map_err(|err| {
            tracing::warn!(buffer = %self.id, error = %err, "upload failed");
            Error::transfer(err)
        })?;
        inner.stats.uploads += 1;
        drop(inner);

        self.version = data_version.unwrap_or_else(|| self.version.saturating_add(1));
        performance::record_transfer(
            std::mem::size_of_val(data),
            Direction::HostToDevice,
            start.elapsed().as_micros() as u64,
        );
        Ok(WriteOutcome::Uploaded)
    }

    /// Copy the whole buffer into the first `capacity()` elements of `dst`
    ///
    /// # Errors
    ///
    /// Returns [`Error::DestinationTooSmall`] if `dst` is shorter than the
    /// buffer.
    #[tracing::instrument(skip(self, dst), fields(buffer = %self.id, elements = self.capacity))]
    pub fn read_into(&self, dst: &mut [f64]) -> Result<()> {
        self.ensure_live()?;
        if dst.len() < self.capacity {
            return Err(Error::DestinationTooSmall {
                required: self.capacity,
                available: dst.len(),
            });
        }

        let start = Instant::now();
        let target = &mut dst[..self.capacity];
        let mut inner = self.ctx.lock_active()?;
        let mem = inner.memory(self.id)?;
        inner
            .api
            .buffer_read(mem, bytemuck::cast_slice_mut(target))
            .map_err(|err| {
                tracing::warn!(buffer = %self.id, error = %err, "download failed");
                Error::transfer(err)
            })?;
        drop(inner);

        performance::record_transfer(self.size_bytes(), Direction::DeviceToHost, start.elapsed().as_micros() as u64);
        Ok(())
    }

    /// Copy the whole buffer into `dst`, resizing it to `capacity()`
    pub fn read_to_vec(&self, dst: &mut Vec<f64>) -> Result<()> {
        dst.resize(self.capacity, 0.0);
        self.read_into(dst)
    }

    pub fn to_vec(&self) -> Result<Vec<f64>> {
        let mut out = Vec::with_capacity(self.capacity);
        self.read_to_vec(&mut out)?;
        Ok(out)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_global(&self) -> bool {
        self.is_global
    }

    /// Logical identity; [`ResourceId::INVALID`] once destroyed
    pub fn handle(&self) -> ResourceId {
        self.id
    }

    /// Capacity in elements
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn flags(&self) -> MemFlags {
        self.flags
    }

    pub fn size_bytes(&self) -> usize {
        self.capacity * ELEMENT_SIZE
    }

    pub fn is_destroyed(&self) -> bool {
        !self.id.is_valid()
    }

    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    /// Free the device memory
    ///
    /// The handle becomes [`ResourceId::INVALID`] even if the device reports
    /// an error. Calling this again is a no-op.
    pub fn destroy(&mut self) -> Result<()> {
        if !self.id.is_valid() {
            return Ok(());
        }
        let id = std::mem::replace(&mut self.id, ResourceId::INVALID);
        tracing::debug!(buffer = %id, "buffer destroyed");
        self.ctx.release(id)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.id.is_valid() {
            Ok(())
        } else {
            Err(Error::invalid_state("buffer has been destroyed"))
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Err(err) = self.destroy() {
            tracing::warn!(error = %err, "failed to free buffer on drop");
        }
    }
}

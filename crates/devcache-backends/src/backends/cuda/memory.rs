//! CUDA device memory

use crate::backend::{ContextHandle, MemFlags, MemHandle};
use crate::error::{BackendError, Result};
use cudarc::driver::{CudaDevice, CudaSlice, DevicePtr, DriverError};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

pub(super) fn driver_error(op: &'static str, err: DriverError) -> BackendError {
    BackendError::Driver { op, code: err.0 as i32 }
}

pub(super) struct CudaMem {
    pub(super) context: ContextHandle,
    pub(super) flags: MemFlags,
    slice: CudaSlice<u8>,
    len: usize,
}

impl CudaMem {
    pub(super) fn len(&self) -> usize {
        self.len
    }

    /// Raw device address passed as a kernel parameter
    pub(super) fn device_ptr(&self) -> u64 {
        *self.slice.device_ptr()
    }
}

/// GPU buffers keyed by recycled handle values
pub(super) struct CudaMemory {
    device: Arc<CudaDevice>,
    buffers: HashMap<u64, CudaMem>,
    free_ids: BTreeSet<u64>,
    next_id: u64,
}

impl CudaMemory {
    pub(super) fn new(device: Arc<CudaDevice>) -> Self {
        Self {
            device,
            buffers: HashMap::new(),
            free_ids: BTreeSet::new(),
            next_id: 1,
        }
    }

    pub(super) fn allocate(&mut self, context: ContextHandle, size: usize, flags: MemFlags) -> Result<MemHandle> {
        if size == 0 {
            return Err(BackendError::InvalidBufferSize(size));
        }
        let slice = self
            .device
            .alloc_zeros::<u8>(size)
            .map_err(|e| driver_error("cuMemAlloc", e))?;

        let id = self.free_ids.pop_first().unwrap_or_else(|| {
            let id = self.next_id;
            self.next_id += 1;
            id
        });
        self.buffers.insert(
            id,
            CudaMem {
                context,
                flags,
                slice,
                len: size,
            },
        );
        Ok(MemHandle::new(id))
    }

    pub(super) fn free(&mut self, handle: MemHandle) -> Result<()> {
        // Device memory is released when the slice drops.
        self.buffers
            .remove(&handle.id())
            .ok_or(BackendError::InvalidMemObject(handle.id()))?;
        self.free_ids.insert(handle.id());
        Ok(())
    }

    pub(super) fn get(&self, handle: MemHandle) -> Result<&CudaMem> {
        self.buffers
            .get(&handle.id())
            .ok_or(BackendError::InvalidMemObject(handle.id()))
    }

    pub(super) fn write(&mut self, handle: MemHandle, data: &[u8]) -> Result<()> {
        let mem = self
            .buffers
            .get_mut(&handle.id())
            .ok_or(BackendError::InvalidMemObject(handle.id()))?;
        if data.len() > mem.len {
            return Err(BackendError::BufferOutOfBounds {
                size: data.len(),
                buffer_size: mem.len,
            });
        }
        let mut view = mem.slice.slice_mut(0..data.len());
        self.device
            .htod_sync_copy_into(data, &mut view)
            .map_err(|e| driver_error("cuMemcpyHtoD", e))
    }

    pub(super) fn read(&self, handle: MemHandle, data: &mut [u8]) -> Result<()> {
        let mem = self.get(handle)?;
        if data.len() > mem.len {
            return Err(BackendError::BufferOutOfBounds {
                size: data.len(),
                buffer_size: mem.len,
            });
        }
        let view = mem.slice.slice(0..data.len());
        self.device
            .dtoh_sync_copy_into(&view, data)
            .map_err(|e| driver_error("cuMemcpyDtoH", e))
    }

    pub(super) fn release_context(&mut self, context: ContextHandle) {
        let owned: Vec<u64> = self
            .buffers
            .iter()
            .filter(|(_, m)| m.context == context)
            .map(|(&id, _)| id)
            .collect();
        for id in owned {
            self.buffers.remove(&id);
            self.free_ids.insert(id);
        }
    }
}

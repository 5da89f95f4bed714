//! Memory manager for the host backend
//!
//! Buffers live in word-aligned heap storage so kernels can view them as
//! `f64` slices. Freed handle values go back on a free list and are handed
//! out again, lowest first, the way real drivers recycle memory objects.

use crate::backend::{ContextHandle, MemFlags, MemHandle};
use crate::error::{BackendError, Result};
use std::collections::{BTreeSet, HashMap};

const WORD: usize = std::mem::size_of::<u64>();

/// One device allocation
#[derive(Debug)]
pub(crate) struct HostMem {
    pub(crate) context: ContextHandle,
    pub(crate) flags: MemFlags,
    len: usize,
    words: Vec<u64>,
}

impl HostMem {
    fn new(context: ContextHandle, len: usize, flags: MemFlags) -> Self {
        Self {
            context,
            flags,
            len,
            words: vec![0; len.div_ceil(WORD)],
        }
    }

    /// Zeroed allocation of the same size, used for local-memory arguments
    pub(crate) fn scratch(&self) -> Self {
        Self::new(self.context, self.len, self.flags)
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.len]
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.len]
    }

    /// Whole `f64` elements stored in this allocation
    pub(crate) fn as_f64(&self) -> &[f64] {
        &bytemuck::cast_slice(&self.words)[..self.len / WORD]
    }

    pub(crate) fn as_f64_mut(&mut self) -> &mut [f64] {
        let n = self.len / WORD;
        &mut bytemuck::cast_slice_mut(&mut self.words)[..n]
    }
}

/// Buffer storage with handle recycling and an optional capacity limit
#[derive(Debug)]
pub(crate) struct HostMemory {
    buffers: HashMap<u64, HostMem>,
    free_ids: BTreeSet<u64>,
    next_id: u64,
    allocated: usize,
    limit: Option<usize>,
}

impl HostMemory {
    pub(crate) fn new(limit: Option<usize>) -> Self {
        Self {
            buffers: HashMap::new(),
            free_ids: BTreeSet::new(),
            next_id: 1,
            allocated: 0,
            limit,
        }
    }

    pub(crate) fn allocate(&mut self, context: ContextHandle, size: usize, flags: MemFlags) -> Result<MemHandle> {
        if size == 0 {
            return Err(BackendError::InvalidBufferSize(size));
        }
        if let Some(limit) = self.limit {
            let available = limit.saturating_sub(self.allocated);
            if size > available {
                return Err(BackendError::OutOfDeviceMemory {
                    requested: size,
                    available,
                });
            }
        }

        let id = match self.free_ids.pop_first() {
            Some(id) => id,
            None => {
                let id = self.next_id;
                self.next_id += 1;
                id
            }
        };
        self.buffers.insert(id, HostMem::new(context, size, flags));
        self.allocated += size;
        Ok(MemHandle::new(id))
    }

    pub(crate) fn free(&mut self, handle: MemHandle) -> Result<()> {
        let mem = self
            .buffers
            .remove(&handle.id())
            .ok_or(BackendError::InvalidMemObject(handle.id()))?;
        self.allocated -= mem.len();
        self.free_ids.insert(handle.id());
        Ok(())
    }

    pub(crate) fn get(&self, handle: MemHandle) -> Result<&HostMem> {
        self.buffers
            .get(&handle.id())
            .ok_or(BackendError::InvalidMemObject(handle.id()))
    }

    pub(crate) fn get_mut(&mut self, handle: MemHandle) -> Result<&mut HostMem> {
        self.buffers
            .get_mut(&handle.id())
            .ok_or(BackendError::InvalidMemObject(handle.id()))
    }

    pub(crate) fn write(&mut self, handle: MemHandle, data: &[u8]) -> Result<()> {
        let mem = self.get_mut(handle)?;
        if data.len() > mem.len() {
            return Err(BackendError::BufferOutOfBounds {
                size: data.len(),
                buffer_size: mem.len(),
            });
        }
        mem.bytes_mut()[..data.len()].copy_from_slice(data);
        Ok(())
    }

    pub(crate) fn read(&self, handle: MemHandle, data: &mut [u8]) -> Result<()> {
        let mem = self.get(handle)?;
        if data.len() > mem.len() {
            return Err(BackendError::BufferOutOfBounds {
                size: data.len(),
                buffer_size: mem.len(),
            });
        }
        data.copy_from_slice(&mem.bytes()[..data.len()]);
        Ok(())
    }

    /// Remove buffers so a kernel can hold several of them mutably at once
    pub(crate) fn take(&mut self, handle: MemHandle) -> Result<HostMem> {
        self.buffers
            .remove(&handle.id())
            .ok_or(BackendError::InvalidMemObject(handle.id()))
    }

    /// Return a buffer removed with [`Self::take`]
    pub(crate) fn restore(&mut self, handle: MemHandle, mem: HostMem) {
        self.buffers.insert(handle.id(), mem);
    }

    /// Free every buffer owned by `context`; returns how many were released
    pub(crate) fn release_context(&mut self, context: ContextHandle) -> usize {
        let owned: Vec<u64> = self
            .buffers
            .iter()
            .filter(|(_, mem)| mem.context == context)
            .map(|(&id, _)| id)
            .collect();
        for &id in &owned {
            if let Some(mem) = self.buffers.remove(&id) {
                self.allocated -= mem.len();
                self.free_ids.insert(id);
            }
        }
        owned.len()
    }

    pub(crate) fn live(&self) -> usize {
        self.buffers.len()
    }

    pub(crate) fn allocated_bytes(&self) -> usize {
        self.allocated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CTX: ContextHandle = ContextHandle(1);

    #[test]
    fn freed_handles_are_recycled_lowest_first() {
        let mut memory = HostMemory::new(None);
        let a = memory.allocate(CTX, 16, MemFlags::ReadWrite).unwrap();
        let b = memory.allocate(CTX, 16, MemFlags::ReadWrite).unwrap();
        let c = memory.allocate(CTX, 16, MemFlags::ReadWrite).unwrap();
        assert_eq!((a.id(), b.id(), c.id()), (1, 2, 3));

        memory.free(c).unwrap();
        memory.free(a).unwrap();
        assert_eq!(memory.allocate(CTX, 8, MemFlags::ReadOnly).unwrap(), a);
        assert_eq!(memory.allocate(CTX, 8, MemFlags::ReadOnly).unwrap(), c);
        assert_eq!(memory.allocate(CTX, 8, MemFlags::ReadOnly).unwrap().id(), 4);
    }

    #[test]
    fn double_free_is_rejected() {
        let mut memory = HostMemory::new(None);
        let a = memory.allocate(CTX, 16, MemFlags::ReadWrite).unwrap();
        memory.free(a).unwrap();
        assert_eq!(memory.free(a), Err(BackendError::InvalidMemObject(a.id())));
    }

    #[test]
    fn limit_is_enforced() {
        let mut memory = HostMemory::new(Some(64));
        let a = memory.allocate(CTX, 48, MemFlags::ReadWrite).unwrap();
        let err = memory.allocate(CTX, 24, MemFlags::ReadWrite).unwrap_err();
        assert_eq!(
            err,
            BackendError::OutOfDeviceMemory {
                requested: 24,
                available: 16
            }
        );
        memory.free(a).unwrap();
        assert!(memory.allocate(CTX, 64, MemFlags::ReadWrite).is_ok());
        assert_eq!(memory.allocated_bytes(), 64);
    }

    #[test]
    fn partial_write_keeps_tail() {
        let mut memory = HostMemory::new(None);
        let h = memory.allocate(CTX, 4 * WORD, MemFlags::ReadWrite).unwrap();
        memory.get_mut(h).unwrap().as_f64_mut().copy_from_slice(&[9.0; 4]);

        memory.write(h, bytemuck::cast_slice(&[1.0f64, 2.0])).unwrap();
        assert_eq!(memory.get(h).unwrap().as_f64(), &[1.0, 2.0, 9.0, 9.0]);

        let mut out = [0u8; 5 * WORD];
        assert!(memory.read(h, &mut out).is_err());
    }

    #[test]
    fn odd_sized_buffers_round_trip_bytes() {
        let mut memory = HostMemory::new(None);
        let h = memory.allocate(CTX, 5, MemFlags::ReadWrite).unwrap();
        memory.write(h, &[1, 2, 3, 4, 5]).unwrap();
        let mut out = [0u8; 5];
        memory.read(h, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5]);
        assert!(memory.get(h).unwrap().as_f64().is_empty());
    }

    #[test]
    fn release_context_frees_only_its_buffers() {
        let mut memory = HostMemory::new(None);
        let other = ContextHandle(2);
        memory.allocate(CTX, 8, MemFlags::ReadWrite).unwrap();
        memory.allocate(other, 8, MemFlags::ReadWrite).unwrap();
        memory.allocate(CTX, 8, MemFlags::ReadWrite).unwrap();

        assert_eq!(memory.release_context(CTX), 2);
        assert_eq!(memory.live(), 1);
        assert_eq!(memory.allocated_bytes(), 8);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn live_handles_stay_unique(ops in proptest::collection::vec((any::<bool>(), 1usize..64), 1..64)) {
                let mut memory = HostMemory::new(None);
                let mut live: Vec<(MemHandle, usize)> = Vec::new();

                for (allocate, size) in ops {
                    if allocate || live.is_empty() {
                        let h = memory.allocate(CTX, size, MemFlags::ReadWrite).unwrap();
                        prop_assert!(live.iter().all(|(other, _)| *other != h));
                        live.push((h, size));
                    } else {
                        let (h, _) = live.remove(size % live.len());
                        memory.free(h).unwrap();
                    }
                    prop_assert_eq!(memory.live(), live.len());
                    prop_assert_eq!(memory.allocated_bytes(), live.iter().map(|(_, s)| s).sum::<usize>());
                }
            }
        }
    }
}

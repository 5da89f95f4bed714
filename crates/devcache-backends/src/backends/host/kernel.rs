//! Host implementations of kernels

use super::memory::HostMem;
use crate::backend::{MemHandle, WorkRange};
use crate::error::{BackendError, Result};
use std::sync::Arc;

/// Host function standing in for a kernel entry point
///
/// The range is `None` for a default-range launch.
pub type HostKernelFn = Arc<dyn Fn(&mut KernelArgs, Option<&WorkRange>) -> Result<()> + Send + Sync>;

#[derive(Debug)]
struct ArgStorage {
    /// `None` for local-memory scratch, which is discarded after the launch
    handle: Option<MemHandle>,
    mem: HostMem,
}

/// Arguments of one launch, viewed as `f64` slices
///
/// Global arguments alias the device buffers they were bound to; two slots
/// bound to the same buffer see the same storage. Local arguments get fresh
/// zeroed scratch of the bound buffer's size.
#[derive(Debug)]
pub struct KernelArgs {
    entry_point: String,
    slots: Vec<usize>,
    storage: Vec<ArgStorage>,
}

impl KernelArgs {
    pub(crate) fn new(entry_point: impl Into<String>) -> Self {
        Self {
            entry_point: entry_point.into(),
            slots: Vec::new(),
            storage: Vec::new(),
        }
    }

    /// Append a global argument, reusing storage already taken for `handle`
    pub(crate) fn push_global(&mut self, handle: MemHandle, take: impl FnOnce() -> Result<HostMem>) -> Result<()> {
        let existing = self.storage.iter().position(|s| s.handle == Some(handle));
        let index = match existing {
            Some(index) => index,
            None => {
                self.storage.push(ArgStorage {
                    handle: Some(handle),
                    mem: take()?,
                });
                self.storage.len() - 1
            }
        };
        self.slots.push(index);
        Ok(())
    }

    pub(crate) fn push_local(&mut self, scratch: HostMem) {
        self.storage.push(ArgStorage {
            handle: None,
            mem: scratch,
        });
        self.slots.push(self.storage.len() - 1);
    }

    /// Hand global storage back for reinsertion into device memory
    pub(crate) fn into_globals(self) -> impl Iterator<Item = (MemHandle, HostMem)> {
        self.storage.into_iter().filter_map(|s| s.handle.map(|h| (h, s.mem)))
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// Number of arguments
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn storage_index(&self, slot: usize) -> Result<usize> {
        self.slots.get(slot).copied().ok_or(BackendError::InvalidArgIndex {
            index: slot as u32,
            arity: self.slots.len() as u32,
        })
    }

    pub fn is_local(&self, slot: usize) -> Result<bool> {
        let index = self.storage_index(slot)?;
        Ok(self.storage[index].handle.is_none())
    }

    pub fn read(&self, slot: usize) -> Result<&[f64]> {
        let index = self.storage_index(slot)?;
        Ok(self.storage[index].mem.as_f64())
    }

    pub fn write(&mut self, slot: usize) -> Result<&mut [f64]> {
        let index = self.storage_index(slot)?;
        Ok(self.storage[index].mem.as_f64_mut())
    }
}

//! Host reference backend
//!
//! Implements [`ComputeApi`] entirely in host memory. It is the default
//! backend and the one the test suites drive.
//!
//! # Architecture
//!
//! ```text
//! HostBackend
//! ├── HostMemory   - word-aligned buffers, recycled handle values
//! ├── compiler     - source checks, `__kernel` discovery, build logs
//! ├── kernels      - bound argument slots per kernel handle
//! └── HostStats    - counters for every successful device call
//! ```
//!
//! Kernel bodies are not interpreted. A launch runs the host function
//! registered for the entry point with [`HostBackend::register_kernel`], or
//! does nothing when none is registered. Either way every parameter must have
//! been bound first.
//!
//! The backend is a cheap handle over shared state: clone it before passing
//! it to a context and keep the clone to inspect [`HostStats`] or queue
//! faults with [`HostBackend::fail_next`].
//!
//! ```rust
//! use devcache_backends::{ComputeApi, HostBackend, MemFlags};
//!
//! # fn main() -> Result<(), devcache_backends::BackendError> {
//! let mut backend = HostBackend::new();
//! let ctx = backend.context_create()?;
//! let mem = backend.buffer_create(ctx, 64, MemFlags::ReadWrite)?;
//! backend.buffer_write(mem, &[0u8; 64])?;
//! assert_eq!(backend.stats().writes, 1);
//! # Ok(())
//! # }
//! ```

mod compiler;
mod kernel;
mod memory;
mod stats;

pub use kernel::{HostKernelFn, KernelArgs};
pub use stats::{HostOp, HostStats};

use crate::backend::{ComputeApi, ContextHandle, KernelHandle, MemFlags, MemHandle, ProgramHandle, WorkRange};
use crate::error::{BackendError, Result};
use compiler::KernelSignature;
use memory::HostMemory;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
enum BoundArg {
    Global(MemHandle),
    Local(MemHandle),
}

struct HostProgram {
    context: ContextHandle,
    kernels: Vec<KernelSignature>,
}

struct HostKernel {
    context: ContextHandle,
    program: ProgramHandle,
    name: String,
    args: Vec<Option<BoundArg>>,
}

struct HostState {
    contexts: BTreeSet<u64>,
    next_context: u64,
    memory: HostMemory,
    programs: HashMap<u64, HostProgram>,
    next_program: u64,
    kernels: HashMap<u64, HostKernel>,
    next_kernel: u64,
    implementations: HashMap<String, HostKernelFn>,
    stats: HostStats,
    faults: HashMap<HostOp, i32>,
}

impl HostState {
    fn new(memory_limit: Option<usize>) -> Self {
        Self {
            contexts: BTreeSet::new(),
            next_context: 1,
            memory: HostMemory::new(memory_limit),
            programs: HashMap::new(),
            next_program: 1,
            kernels: HashMap::new(),
            next_kernel: 1,
            implementations: HashMap::new(),
            stats: HostStats::default(),
            faults: HashMap::new(),
        }
    }

    fn check_fault(&mut self, op: HostOp) -> Result<()> {
        match self.faults.remove(&op) {
            Some(code) => {
                tracing::debug!(op = op.as_str(), code, "injected_fault");
                Err(BackendError::Driver { op: op.as_str(), code })
            }
            None => Ok(()),
        }
    }

    fn check_context(&self, context: ContextHandle) -> Result<()> {
        if self.contexts.contains(&context.id()) {
            Ok(())
        } else {
            Err(BackendError::InvalidContext(context.id()))
        }
    }

    fn kernel_mut(&mut self, kernel: KernelHandle) -> Result<&mut HostKernel> {
        self.kernels
            .get_mut(&kernel.id())
            .ok_or(BackendError::InvalidKernel(kernel.id()))
    }

    fn set_arg(&mut self, kernel: KernelHandle, index: u32, arg: BoundArg) -> Result<()> {
        self.check_fault(HostOp::SetArg)?;
        let mem = match arg {
            BoundArg::Global(mem) | BoundArg::Local(mem) => mem,
        };
        let mem_context = self.memory.get(mem)?.context;

        let entry = self.kernel_mut(kernel)?;
        if mem_context != entry.context {
            return Err(BackendError::InvalidMemObject(mem.id()));
        }
        let arity = entry.args.len() as u32;
        let slot = entry
            .args
            .get_mut(index as usize)
            .ok_or(BackendError::InvalidArgIndex { index, arity })?;
        *slot = Some(arg);

        match arg {
            BoundArg::Global(_) => self.stats.global_binds += 1,
            BoundArg::Local(_) => self.stats.local_binds += 1,
        }
        tracing::trace!(kernel = %kernel, index, ?arg, "host_set_arg");
        Ok(())
    }

    fn launch(&mut self, kernel: KernelHandle, range: Option<&WorkRange>) -> Result<()> {
        self.check_fault(HostOp::Execute)?;
        let entry = self
            .kernels
            .get(&kernel.id())
            .ok_or(BackendError::InvalidKernel(kernel.id()))?;

        let mut bound = Vec::with_capacity(entry.args.len());
        for (index, arg) in entry.args.iter().enumerate() {
            bound.push(arg.ok_or(BackendError::UnboundArgument { index: index as u32 })?);
        }
        let name = entry.name.clone();
        let implementation = self.implementations.get(&name).cloned();

        if let Some(implementation) = implementation {
            let mut args = KernelArgs::new(name.as_str());
            let prepared = bound.iter().try_for_each(|arg| match *arg {
                BoundArg::Global(mem) => args.push_global(mem, || self.memory.take(mem)),
                BoundArg::Local(mem) => {
                    let scratch = self.memory.get(mem)?.scratch();
                    args.push_local(scratch);
                    Ok(())
                }
            });
            let result = prepared.and_then(|()| implementation(&mut args, range));
            for (mem, storage) in args.into_globals() {
                self.memory.restore(mem, storage);
            }
            result?;
        } else {
            tracing::trace!(entry_point = %name, "no host implementation registered; launch is a no-op");
        }

        match range {
            Some(_) => self.stats.ranged_launches += 1,
            None => self.stats.launches += 1,
        }
        Ok(())
    }
}

/// Reference [`ComputeApi`] implementation backed by host memory
#[derive(Clone)]
pub struct HostBackend {
    state: Arc<RwLock<HostState>>,
}

impl HostBackend {
    /// Create a backend with unlimited memory
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(HostState::new(None))),
        }
    }

    /// Create a backend whose allocations fail past `bytes` in total
    pub fn with_memory_limit(bytes: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(HostState::new(Some(bytes)))),
        }
    }

    /// Register the host function run for kernels named `entry_point`
    pub fn register_kernel<F>(&self, entry_point: impl Into<String>, f: F)
    where
        F: Fn(&mut KernelArgs, Option<&WorkRange>) -> Result<()> + Send + Sync + 'static,
    {
        self.state.write().implementations.insert(entry_point.into(), Arc::new(f));
    }

    /// Make the next call of `op` fail with driver status `code`
    pub fn fail_next(&self, op: HostOp, code: i32) {
        self.state.write().faults.insert(op, code);
    }

    pub fn stats(&self) -> HostStats {
        self.state.read().stats
    }

    pub fn live_contexts(&self) -> usize {
        self.state.read().contexts.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.read().memory.live()
    }

    pub fn live_programs(&self) -> usize {
        self.state.read().programs.len()
    }

    pub fn live_kernels(&self) -> usize {
        self.state.read().kernels.len()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.state.read().memory.allocated_bytes()
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeApi for HostBackend {
    fn name(&self) -> &'static str {
        "host"
    }

    fn context_create(&mut self) -> Result<ContextHandle> {
        let mut state = self.state.write();
        state.check_fault(HostOp::ContextCreate)?;
        let id = state.next_context;
        state.next_context += 1;
        state.contexts.insert(id);
        state.stats.contexts_created += 1;
        Ok(ContextHandle::new(id))
    }

    fn context_free(&mut self, context: ContextHandle) -> Result<()> {
        let mut state = self.state.write();
        state.check_fault(HostOp::ContextFree)?;
        state.check_context(context)?;

        // Objects still alive in the context go with it.
        let buffers = state.memory.release_context(context);
        state.kernels.retain(|_, k| k.context != context);
        state.programs.retain(|_, p| p.context != context);
        state.contexts.remove(&context.id());
        state.stats.contexts_freed += 1;
        if buffers > 0 {
            tracing::debug!(context = %context, buffers, "context freed with live buffers");
        }
        Ok(())
    }

    fn buffer_create(&mut self, context: ContextHandle, size_bytes: usize, flags: MemFlags) -> Result<MemHandle> {
        let mut state = self.state.write();
        state.check_fault(HostOp::BufferCreate)?;
        state.check_context(context)?;
        let mem = state.memory.allocate(context, size_bytes, flags)?;
        state.stats.buffers_created += 1;
        tracing::trace!(mem = %mem, size_bytes, %flags, "host_buffer_create");
        Ok(mem)
    }

    fn buffer_free(&mut self, mem: MemHandle) -> Result<()> {
        let mut state = self.state.write();
        state.check_fault(HostOp::BufferFree)?;
        state.memory.free(mem)?;
        state.stats.buffers_freed += 1;
        Ok(())
    }

    fn buffer_write(&mut self, mem: MemHandle, data: &[u8]) -> Result<()> {
        let mut state = self.state.write();
        state.check_fault(HostOp::BufferWrite)?;
        state.memory.write(mem, data)?;
        state.stats.writes += 1;
        state.stats.bytes_written += data.len() as u64;
        Ok(())
    }

    fn buffer_read(&mut self, mem: MemHandle, data: &mut [u8]) -> Result<()> {
        let mut state = self.state.write();
        state.check_fault(HostOp::BufferRead)?;
        state.memory.read(mem, data)?;
        state.stats.reads += 1;
        state.stats.bytes_read += data.len() as u64;
        Ok(())
    }

    fn buffer_size(&self, mem: MemHandle) -> Result<usize> {
        Ok(self.state.read().memory.get(mem)?.len())
    }

    fn program_create(&mut self, context: ContextHandle, source: &str) -> Result<ProgramHandle> {
        let mut state = self.state.write();
        state.check_fault(HostOp::ProgramCreate)?;
        state.check_context(context)?;

        let kernels = match compiler::build(source) {
            Ok(kernels) => kernels,
            Err(log) => {
                state.stats.build_failures += 1;
                tracing::debug!(context = %context, "host program build failed");
                return Err(BackendError::build_failed(log));
            }
        };

        let id = state.next_program;
        state.next_program += 1;
        tracing::debug!(
            program = id,
            kernels = ?kernels.iter().map(|k| k.name.as_str()).collect::<Vec<_>>(),
            "host_program_built"
        );
        state.programs.insert(id, HostProgram { context, kernels });
        state.stats.programs_built += 1;
        Ok(ProgramHandle::new(id))
    }

    fn program_free(&mut self, program: ProgramHandle) -> Result<()> {
        let mut state = self.state.write();
        state.check_fault(HostOp::ProgramFree)?;
        state
            .programs
            .remove(&program.id())
            .ok_or(BackendError::InvalidProgram(program.id()))?;
        state.stats.programs_freed += 1;
        Ok(())
    }

    fn kernel_create(&mut self, program: ProgramHandle, entry_point: &str) -> Result<KernelHandle> {
        let mut state = self.state.write();
        state.check_fault(HostOp::KernelCreate)?;
        let built = state
            .programs
            .get(&program.id())
            .ok_or(BackendError::InvalidProgram(program.id()))?;
        let signature = built
            .kernels
            .iter()
            .find(|k| k.name == entry_point)
            .ok_or_else(|| BackendError::KernelNotFound {
                name: entry_point.to_string(),
            })?;

        let kernel = HostKernel {
            context: built.context,
            program,
            name: signature.name.clone(),
            args: vec![None; signature.arity as usize],
        };
        let id = state.next_kernel;
        state.next_kernel += 1;
        state.kernels.insert(id, kernel);
        state.stats.kernels_created += 1;
        Ok(KernelHandle::new(id))
    }

    fn kernel_free(&mut self, kernel: KernelHandle) -> Result<()> {
        let mut state = self.state.write();
        state.check_fault(HostOp::KernelFree)?;
        let removed = state
            .kernels
            .remove(&kernel.id())
            .ok_or(BackendError::InvalidKernel(kernel.id()))?;
        state.stats.kernels_freed += 1;
        tracing::trace!(kernel = %kernel, program = %removed.program, "host_kernel_free");
        Ok(())
    }

    fn set_kernel_arg_mem(&mut self, kernel: KernelHandle, index: u32, mem: MemHandle) -> Result<()> {
        self.state.write().set_arg(kernel, index, BoundArg::Global(mem))
    }

    fn set_kernel_arg_mem_local(&mut self, kernel: KernelHandle, index: u32, mem: MemHandle) -> Result<()> {
        self.state.write().set_arg(kernel, index, BoundArg::Local(mem))
    }

    fn execute(&mut self, kernel: KernelHandle) -> Result<()> {
        self.state.write().launch(kernel, None)
    }

    fn execute_range(&mut self, kernel: KernelHandle, range: &WorkRange) -> Result<()> {
        self.state.write().launch(kernel, Some(range))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

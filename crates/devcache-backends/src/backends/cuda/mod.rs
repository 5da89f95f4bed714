//! CUDA backend for NVIDIA GPUs
//!
//! Programs are CUDA C source compiled with NVRTC and loaded as driver
//! modules; entry points must be `extern "C" __global__`. Global arguments
//! are passed as device pointers. A local argument adds its buffer's size to
//! the launch's dynamic shared memory and the kernel receives a null pointer
//! in that position (use `extern __shared__` inside the kernel).
//!
//! # Architecture
//!
//! ```text
//! CudaBackend
//! ├── Device       - CUDA device, created with the first context
//! ├── CudaMemory   - GPU buffers with recycled handle values
//! ├── Modules      - NVRTC output loaded through the driver API
//! └── Kernels      - function handles plus bound argument slots
//! ```
//!
//! ```rust,ignore
//! use devcache_backends::{ComputeApi, CudaBackend};
//!
//! let mut backend = CudaBackend::new(0);
//! let ctx = backend.context_create()?;
//! ```

mod memory;

use crate::backend::{ComputeApi, ContextHandle, KernelHandle, MemFlags, MemHandle, ProgramHandle, WorkRange};
use crate::error::{status, BackendError, Result};
use cudarc::driver::{result as driver, sys, CudaDevice};
use cudarc::nvrtc::{compile_ptx, CompileError};
use memory::{driver_error, CudaMemory};
use std::collections::{BTreeSet, HashMap};
use std::ffi::{c_void, CString};
use std::sync::Arc;

/// Most arguments a kernel may take
pub const MAX_KERNEL_ARGS: u32 = 32;

const BLOCK_SIZE: usize = 256;

#[derive(Debug, Clone, Copy)]
enum BoundArg {
    Global(MemHandle),
    Local(MemHandle),
}

struct CudaProgram {
    context: ContextHandle,
    // Raw driver handles are stored as usize so the backend stays Send.
    module: usize,
}

struct CudaKernel {
    context: ContextHandle,
    program: ProgramHandle,
    name: String,
    function: usize,
    args: Vec<Option<BoundArg>>,
}

struct DeviceState {
    device: Arc<CudaDevice>,
    memory: CudaMemory,
}

/// [`ComputeApi`] over one CUDA device
pub struct CudaBackend {
    ordinal: usize,
    state: Option<DeviceState>,
    contexts: BTreeSet<u64>,
    next_context: u64,
    programs: HashMap<u64, CudaProgram>,
    next_program: u64,
    kernels: HashMap<u64, CudaKernel>,
    next_kernel: u64,
}

impl CudaBackend {
    /// Backend for device `ordinal`; the device is opened by the first
    /// [`ComputeApi::context_create`]
    pub fn new(ordinal: usize) -> Self {
        Self {
            ordinal,
            state: None,
            contexts: BTreeSet::new(),
            next_context: 1,
            programs: HashMap::new(),
            next_program: 1,
            kernels: HashMap::new(),
            next_kernel: 1,
        }
    }

    /// Check whether device `ordinal` can be opened
    pub fn is_available(ordinal: usize) -> bool {
        CudaDevice::new(ordinal).is_ok()
    }

    fn device_state(&mut self) -> Result<&mut DeviceState> {
        self.state.as_mut().ok_or(BackendError::InvalidContext(0))
    }

    fn check_context(&self, context: ContextHandle) -> Result<()> {
        if self.contexts.contains(&context.id()) {
            Ok(())
        } else {
            Err(BackendError::InvalidContext(context.id()))
        }
    }

    fn set_arg(&mut self, kernel: KernelHandle, index: u32, arg: BoundArg) -> Result<()> {
        let mem = match arg {
            BoundArg::Global(mem) | BoundArg::Local(mem) => mem,
        };
        let mem_context = self.device_state()?.memory.get(mem)?.context;

        let entry = self
            .kernels
            .get_mut(&kernel.id())
            .ok_or(BackendError::InvalidKernel(kernel.id()))?;
        if mem_context != entry.context {
            return Err(BackendError::InvalidMemObject(mem.id()));
        }
        if index >= MAX_KERNEL_ARGS {
            return Err(BackendError::InvalidArgIndex {
                index,
                arity: MAX_KERNEL_ARGS,
            });
        }
        let slot = index as usize;
        if entry.args.len() <= slot {
            entry.args.resize(slot + 1, None);
        }
        entry.args[slot] = Some(arg);
        Ok(())
    }

    fn launch(&mut self, kernel: KernelHandle, range: Option<&WorkRange>) -> Result<()> {
        let (grid, block) = match range {
            None => ((1, 1, 1), (1, 1, 1)),
            Some(range) => launch_dims(range)?,
        };

        let entry = self
            .kernels
            .get(&kernel.id())
            .ok_or(BackendError::InvalidKernel(kernel.id()))?;
        let function = entry.function as sys::CUfunction;
        let name = entry.name.clone();
        let bound = entry
            .args
            .iter()
            .enumerate()
            .map(|(index, arg)| arg.ok_or(BackendError::UnboundArgument { index: index as u32 }))
            .collect::<Result<Vec<_>>>()?;

        let state = self.device_state()?;
        let mut shared_bytes = 0usize;
        let mut pointers = Vec::with_capacity(bound.len());
        for arg in &bound {
            match *arg {
                BoundArg::Global(mem) => pointers.push(state.memory.get(mem)?.device_ptr()),
                BoundArg::Local(mem) => {
                    shared_bytes += state.memory.get(mem)?.len();
                    pointers.push(0);
                }
            }
        }
        let mut params: Vec<*mut c_void> = pointers
            .iter_mut()
            .map(|p| p as *mut sys::CUdeviceptr as *mut c_void)
            .collect();

        state.device.bind_to_thread().map_err(|e| driver_error("cuCtxSetCurrent", e))?;
        // SAFETY: `function` came from a loaded module that outlives the kernel
        // entry, and every parameter points at a live local.
        unsafe {
            driver::launch_kernel(
                function,
                grid,
                block,
                shared_bytes as u32,
                std::ptr::null_mut(),
                &mut params,
            )
        }
        .map_err(|e| driver_error("cuLaunchKernel", e))?;
        state.device.synchronize().map_err(|e| driver_error("cuCtxSynchronize", e))?;

        tracing::trace!(entry_point = %name, ?grid, ?block, shared_bytes, "cuda_launch");
        Ok(())
    }
}

fn launch_dims(range: &WorkRange) -> Result<((u32, u32, u32), (u32, u32, u32))> {
    if range.offset().iter().any(|&o| o != 0) {
        return Err(BackendError::Driver {
            op: "cuLaunchKernel",
            code: status::INVALID_GLOBAL_OFFSET,
        });
    }
    let mut size = [1usize; 3];
    size[..range.size().len()].copy_from_slice(range.size());

    let block_x = size[0].min(BLOCK_SIZE);
    let grid = (size[0].div_ceil(block_x), size[1], size[2]);
    let to_u32 = |v: usize| {
        u32::try_from(v).map_err(|_| BackendError::InvalidWorkRange(format!("extent {v} exceeds the grid limit")))
    };
    Ok((
        (to_u32(grid.0)?, to_u32(grid.1)?, to_u32(grid.2)?),
        (to_u32(block_x)?, 1, 1),
    ))
}

impl ComputeApi for CudaBackend {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn context_create(&mut self) -> Result<ContextHandle> {
        if self.state.is_none() {
            let device = CudaDevice::new(self.ordinal).map_err(|e| BackendError::DeviceUnavailable {
                code: status::DEVICE_NOT_FOUND,
                reason: format!("CUDA device {} unavailable: {e}", self.ordinal),
            })?;
            tracing::info!(ordinal = self.ordinal, "cuda_device_opened");
            let memory = CudaMemory::new(Arc::clone(&device));
            self.state = Some(DeviceState { device, memory });
        }
        let id = self.next_context;
        self.next_context += 1;
        self.contexts.insert(id);
        Ok(ContextHandle::new(id))
    }

    fn context_free(&mut self, context: ContextHandle) -> Result<()> {
        self.check_context(context)?;

        let kernels: Vec<u64> = self
            .kernels
            .iter()
            .filter(|(_, k)| k.context == context)
            .map(|(&id, _)| id)
            .collect();
        for id in kernels {
            self.kernel_free(KernelHandle::new(id))?;
        }
        let programs: Vec<u64> = self
            .programs
            .iter()
            .filter(|(_, p)| p.context == context)
            .map(|(&id, _)| id)
            .collect();
        for id in programs {
            self.program_free(ProgramHandle::new(id))?;
        }
        self.device_state()?.memory.release_context(context);

        self.contexts.remove(&context.id());
        if self.contexts.is_empty() {
            self.state = None;
        }
        Ok(())
    }

    fn buffer_create(&mut self, context: ContextHandle, size_bytes: usize, flags: MemFlags) -> Result<MemHandle> {
        self.check_context(context)?;
        let mem = self.device_state()?.memory.allocate(context, size_bytes, flags)?;
        tracing::trace!(mem = %mem, size_bytes, %flags, "cuda_buffer_create");
        Ok(mem)
    }

    fn buffer_free(&mut self, mem: MemHandle) -> Result<()> {
        self.device_state()?.memory.free(mem)
    }

    fn buffer_write(&mut self, mem: MemHandle, data: &[u8]) -> Result<()> {
        self.device_state()?.memory.write(mem, data)
    }

    fn buffer_read(&mut self, mem: MemHandle, data: &mut [u8]) -> Result<()> {
        self.device_state()?.memory.read(mem, data)
    }

    fn buffer_size(&self, mem: MemHandle) -> Result<usize> {
        let state = self.state.as_ref().ok_or(BackendError::InvalidContext(0))?;
        let buffer = state.memory.get(mem)?;
        tracing::trace!(mem = %mem, flags = %buffer.flags, "cuda_buffer_size");
        Ok(buffer.len())
    }

    fn program_create(&mut self, context: ContextHandle, source: &str) -> Result<ProgramHandle> {
        self.check_context(context)?;

        let ptx = compile_ptx(source).map_err(|e| match e {
            CompileError::CompileError { log, .. } => BackendError::build_failed(log.to_string_lossy()),
            other => BackendError::build_failed(format!("{other:?}")),
        })?;
        let image = CString::new(ptx.to_src())
            .map_err(|_| BackendError::build_failed("PTX image contains an interior NUL byte"))?;

        let state = self.device_state()?;
        state.device.bind_to_thread().map_err(|e| driver_error("cuCtxSetCurrent", e))?;
        // SAFETY: `image` is a NUL-terminated PTX string that lives across the call.
        let module = unsafe { driver::module::load_data(image.as_ptr() as *const c_void) }
            .map_err(|e| driver_error("cuModuleLoadData", e))?;

        let id = self.next_program;
        self.next_program += 1;
        self.programs.insert(
            id,
            CudaProgram {
                context,
                module: module as usize,
            },
        );
        Ok(ProgramHandle::new(id))
    }

    fn program_free(&mut self, program: ProgramHandle) -> Result<()> {
        let entry = self
            .programs
            .remove(&program.id())
            .ok_or(BackendError::InvalidProgram(program.id()))?;
        // SAFETY: the module was produced by `load_data` and is unloaded once.
        unsafe { driver::module::unload(entry.module as sys::CUmodule) }
            .map_err(|e| driver_error("cuModuleUnload", e))
    }

    fn kernel_create(&mut self, program: ProgramHandle, entry_point: &str) -> Result<KernelHandle> {
        let built = self
            .programs
            .get(&program.id())
            .ok_or(BackendError::InvalidProgram(program.id()))?;
        let name = CString::new(entry_point).map_err(|_| BackendError::KernelNotFound {
            name: entry_point.to_string(),
        })?;
        // SAFETY: the module handle is live while the program entry exists.
        let function = unsafe { driver::module::get_function(built.module as sys::CUmodule, name) }.map_err(|_| {
            BackendError::KernelNotFound {
                name: entry_point.to_string(),
            }
        })?;

        let kernel = CudaKernel {
            context: built.context,
            program,
            name: entry_point.to_string(),
            function: function as usize,
            args: Vec::new(),
        };
        let id = self.next_kernel;
        self.next_kernel += 1;
        self.kernels.insert(id, kernel);
        Ok(KernelHandle::new(id))
    }

    fn kernel_free(&mut self, kernel: KernelHandle) -> Result<()> {
        // Functions belong to their module; nothing to release on the device.
        let removed = self
            .kernels
            .remove(&kernel.id())
            .ok_or(BackendError::InvalidKernel(kernel.id()))?;
        tracing::trace!(kernel = %kernel, program = %removed.program, "cuda_kernel_free");
        Ok(())
    }

    fn set_kernel_arg_mem(&mut self, kernel: KernelHandle, index: u32, mem: MemHandle) -> Result<()> {
        self.set_arg(kernel, index, BoundArg::Global(mem))
    }

    fn set_kernel_arg_mem_local(&mut self, kernel: KernelHandle, index: u32, mem: MemHandle) -> Result<()> {
        self.set_arg(kernel, index, BoundArg::Local(mem))
    }

    fn execute(&mut self, kernel: KernelHandle) -> Result<()> {
        self.launch(kernel, None)
    }

    fn execute_range(&mut self, kernel: KernelHandle, range: &WorkRange) -> Result<()> {
        self.launch(kernel, Some(range))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

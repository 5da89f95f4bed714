//! Kernel programs with a per-slot argument cache
//!
//! A [`Program`] holds one built program and one kernel resolved from it. Each
//! of its [`MAX_ARGS`] argument slots remembers the buffer identity and version
//! last bound there; binding the same buffer again at a version no newer than
//! the cached one skips the device call.
//!
//! ```text
//! Uncompiled --build--> Compiled --destroy--> Destroyed
//!      \______________________destroy______________/
//! ```

use crate::buffer::Buffer;
use crate::context::{DeviceContext, DeviceResource};
use crate::error::{Error, Result};
use crate::table::ResourceId;
use devcache_backends::{KernelHandle, ProgramHandle, WorkRange};
use devcache_tracing::{performance, timed_block};

/// Argument slots per program
pub const MAX_ARGS: usize = 8;

/// Lifecycle state of a [`Program`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramState {
    Uncompiled,
    Compiled,
    Destroyed,
}

/// Whether [`Program::set_arg`] reached the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// The device bind was issued
    Bound,
    /// The slot already held this buffer at this version
    Cached,
}

/// Cached binding of one argument slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgSlot {
    pub buffer: ResourceId,
    /// `None` until something is bound
    pub version: Option<u64>,
}

impl ArgSlot {
    pub const EMPTY: Self = Self {
        buffer: ResourceId::INVALID,
        version: None,
    };

    fn holds(&self, buffer: ResourceId, version: u64) -> bool {
        self.buffer.is_valid() && self.buffer == buffer && self.version.is_some_and(|cached| cached >= version)
    }
}

/// A compiled kernel entry point and its argument cache
#[derive(Debug)]
pub struct Program {
    ctx: DeviceContext,
    id: ResourceId,
    state: ProgramState,
    entry_point: String,
    slots: [ArgSlot; MAX_ARGS],
}

impl Program {
    /// An uncompiled program on `ctx`
    pub fn new(ctx: &DeviceContext) -> Self {
        Self {
            ctx: ctx.clone(),
            id: ResourceId::INVALID,
            state: ProgramState::Uncompiled,
            entry_point: String::new(),
            slots: [ArgSlot::EMPTY; MAX_ARGS],
        }
    }

    /// Build `source` and resolve `entry_point`
    pub fn compile(ctx: &DeviceContext, source: &str, entry_point: &str) -> Result<Self> {
        let mut program = Self::new(ctx);
        program.build(source, entry_point)?;
        Ok(program)
    }

    /// Build `source` and resolve `entry_point`, moving to `Compiled`
    ///
    /// # Errors
    ///
    /// - [`Error::CompileFailure`] with the compiler log if the build fails
    /// - [`Error::KernelCreateFailure`] if the entry point cannot be resolved;
    ///   the built program is freed first
    /// - [`Error::InvalidState`] unless the program is `Uncompiled`
    ///
    /// On error the program stays `Uncompiled` and holds no device handles.
    #[tracing::instrument(skip(self, source), fields(source_len = source.len()))]
    pub fn build(&mut self, source: &str, entry_point: &str) -> Result<()> {
        match self.state {
            ProgramState::Uncompiled => {}
            ProgramState::Compiled => {
                return Err(Error::invalid_state(format!(
                    "program '{}' is already compiled; its handles cannot be replaced",
                    self.entry_point
                )))
            }
            ProgramState::Destroyed => return Err(Error::invalid_state("program has been destroyed")),
        }

        let mut inner = self.ctx.lock_active()?;
        let context = inner.handle();
        let program = inner.api.program_create(context, source).map_err(|err| {
            tracing::warn!(error = %err, "program build failed");
            Error::compile(err)
        })?;

        let kernel = match inner.api.kernel_create(program, entry_point) {
            Ok(kernel) => kernel,
            Err(err) => {
                if let Err(free_err) = inner.api.program_free(program) {
                    tracing::warn!(program = %program, error = %free_err, "failed to free program after kernel error");
                }
                tracing::warn!(error = %err, "kernel creation failed");
                return Err(Error::KernelCreateFailure {
                    entry_point: entry_point.to_string(),
                    code: err.code(),
                    reason: err.to_string(),
                });
            }
        };

        self.id = inner.register(DeviceResource::Program { program, kernel });
        drop(inner);

        self.entry_point = entry_point.to_string();
        self.state = ProgramState::Compiled;
        tracing::debug!(program = %program, kernel = %kernel, "program compiled");
        Ok(())
    }

    /// Bind `buffer` to argument `slot` unless the slot already holds it at
    /// its current version
    ///
    /// Global buffers bind as device memory, local buffers as work-group
    /// local memory.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] unless compiled, or if `buffer` is destroyed
    ///   or belongs to another context
    /// - [`Error::InvalidSlot`] if `slot >= MAX_ARGS`
    /// - [`Error::ArgBindFailure`] if the device refuses; the slot cache is
    ///   left as it was
    pub fn set_arg(&mut self, slot: usize, buffer: &Buffer) -> Result<BindOutcome> {
        self.ensure_compiled()?;
        if slot >= MAX_ARGS {
            return Err(Error::InvalidSlot { slot, max: MAX_ARGS });
        }
        if buffer.is_destroyed() {
            return Err(Error::invalid_state("cannot bind a destroyed buffer"));
        }
        if !buffer.context().same_context(&self.ctx) {
            return Err(Error::invalid_state("buffer belongs to a different device context"));
        }

        let (id, version) = (buffer.handle(), buffer.version());
        let mut inner = self.ctx.lock_active()?;
        if self.slots[slot].holds(id, version) {
            inner.stats.binds_skipped += 1;
            drop(inner);
            performance::record_bind_elided(&self.entry_point, slot, version);
            return Ok(BindOutcome::Cached);
        }

        let (_, kernel) = inner.kernel(self.id)?;
        let mem = inner.memory(id)?;
        let index = slot as u32;
        let bound = if buffer.is_global() {
            inner.api.set_kernel_arg_mem(kernel, index, mem)
        } else {
            inner.api.set_kernel_arg_mem_local(kernel, index, mem)
        };
        bound.map_err(|err| {
            tracing::warn!(entry_point = %self.entry_point, slot, error = %err, "argument bind failed");
            Error::ArgBindFailure { slot, code: err.code() }
        })?;
        inner.stats.binds += 1;
        drop(inner);

        self.slots[slot] = ArgSlot {
            buffer: id,
            version: Some(version),
        };
        performance::record_bind(&self.entry_point, slot, !buffer.is_global(), version);
        Ok(BindOutcome::Bound)
    }

    /// Bind `buffers` to slots `0..buffers.len()` in order
    ///
    /// Returns how many binds reached the device. More than [`MAX_ARGS`]
    /// buffers is [`Error::InvalidSlot`] and binds nothing.
    pub fn bind(&mut self, buffers: &[&Buffer]) -> Result<usize> {
        self.ensure_compiled()?;
        if buffers.len() > MAX_ARGS {
            return Err(Error::InvalidSlot {
                slot: MAX_ARGS,
                max: MAX_ARGS,
            });
        }

        let mut issued = 0;
        for (slot, buffer) in buffers.iter().enumerate() {
            if self.set_arg(slot, buffer)? == BindOutcome::Bound {
                issued += 1;
            }
        }
        Ok(issued)
    }

    /// Launch with the currently bound arguments and the default range
    pub fn run(&mut self) -> Result<()> {
        self.ensure_compiled()?;
        self.launch(None)
    }

    /// [`Self::bind`] then [`Self::run`]
    pub fn run_with(&mut self, buffers: &[&Buffer]) -> Result<()> {
        self.bind(buffers)?;
        self.run()
    }

    /// Launch over an explicit work range
    pub fn run_many(&mut self, range: &WorkRange) -> Result<()> {
        self.ensure_compiled()?;
        self.launch(Some(range))
    }

    /// Launch over `dimension` dimensions with the given offsets and sizes
    ///
    /// Returns [`Error::InvalidWorkRange`] without a device call when the
    /// range is malformed.
    pub fn run_range(&mut self, dimension: u32, offset: &[usize], size: &[usize]) -> Result<()> {
        self.ensure_compiled()?;
        let range = WorkRange::new(dimension, offset, size)?;
        self.launch(Some(&range))
    }

    /// [`Self::bind`] then [`Self::run_many`]
    pub fn run_many_with(&mut self, range: &WorkRange, buffers: &[&Buffer]) -> Result<()> {
        self.bind(buffers)?;
        self.run_many(range)
    }

    fn launch(&mut self, range: Option<&WorkRange>) -> Result<()> {
        let mut inner = self.ctx.lock_active()?;
        let (_, kernel) = inner.kernel(self.id)?;
        let (result, duration_us) = timed_block!({
            match range {
                None => inner.api.execute(kernel),
                Some(range) => inner.api.execute_range(kernel, range),
            }
        });

        match result {
            Ok(()) => {
                inner.stats.launches += 1;
                drop(inner);
                performance::record_launch(&self.entry_point, range.map(WorkRange::work_items), duration_us);
                Ok(())
            }
            Err(err) => {
                inner.stats.launch_failures += 1;
                drop(inner);
                tracing::warn!(entry_point = %self.entry_point, error = %err, "kernel launch failed");
                Err(Error::ExecuteFailure {
                    entry_point: self.entry_point.clone(),
                    code: err.code(),
                })
            }
        }
    }

    /// Free the kernel and program handles
    ///
    /// The program ends `Destroyed` even if the device reports an error.
    /// Calling this again is a no-op.
    pub fn destroy(&mut self) -> Result<()> {
        if self.state == ProgramState::Destroyed {
            return Ok(());
        }
        self.state = ProgramState::Destroyed;
        self.slots = [ArgSlot::EMPTY; MAX_ARGS];

        let id = std::mem::replace(&mut self.id, ResourceId::INVALID);
        if !id.is_valid() {
            return Ok(());
        }
        tracing::debug!(entry_point = %self.entry_point, "program destroyed");
        self.ctx.release(id)
    }

    pub fn state(&self) -> ProgramState {
        self.state
    }

    pub fn is_compiled(&self) -> bool {
        self.state == ProgramState::Compiled
    }

    /// Logical identity; [`ResourceId::INVALID`] unless compiled
    pub fn handle(&self) -> ResourceId {
        self.id
    }

    pub fn program_handle(&self) -> Option<ProgramHandle> {
        self.ctx.lock().kernel(self.id).ok().map(|(program, _)| program)
    }

    pub fn kernel_handle(&self) -> Option<KernelHandle> {
        self.ctx.lock().kernel(self.id).ok().map(|(_, kernel)| kernel)
    }

    /// Entry point name; empty until compiled
    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// Cached binding of `slot`, or `None` if `slot >= MAX_ARGS`
    pub fn bound_slot(&self, slot: usize) -> Option<ArgSlot> {
        self.slots.get(slot).copied()
    }

    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    fn ensure_compiled(&self) -> Result<()> {
        match self.state {
            ProgramState::Compiled => Ok(()),
            ProgramState::Uncompiled => Err(Error::invalid_state("program has not been compiled")),
            ProgramState::Destroyed => Err(Error::invalid_state("program has been destroyed")),
        }
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        if let Err(err) = self.destroy() {
            tracing::warn!(error = %err, "failed to free program on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devcache_backends::{status, HostBackend, HostOp, MemFlags};

    const SOURCE: &str = "__kernel void sum(__global double* a, __global double* b, __global double* out) {}";

    fn host() -> (HostBackend, DeviceContext) {
        let backend = HostBackend::new();
        let ctx = DeviceContext::initialize(Box::new(backend.clone())).unwrap();
        (backend, ctx)
    }

    #[test]
    fn compile_moves_to_compiled() {
        let (_backend, ctx) = host();
        let program = Program::compile(&ctx, SOURCE, "sum").unwrap();
        assert_eq!(program.state(), ProgramState::Compiled);
        assert_eq!(program.entry_point(), "sum");
        assert!(program.program_handle().is_some());
        assert!(program.kernel_handle().is_some());
        assert!((0..MAX_ARGS).all(|s| program.bound_slot(s) == Some(ArgSlot::EMPTY)));
        assert_eq!(program.bound_slot(MAX_ARGS), None);
    }

    #[test]
    fn uncompiled_program_rejects_use() {
        let (_backend, ctx) = host();
        let buf = ctx.alloc(1).unwrap();
        let mut program = Program::new(&ctx);
        assert!(matches!(program.set_arg(0, &buf), Err(Error::InvalidState(_))));
        assert!(matches!(program.run(), Err(Error::InvalidState(_))));
        assert!(matches!(
            program.run_many(&WorkRange::linear(4).unwrap()),
            Err(Error::InvalidState(_))
        ));
        assert_eq!(program.program_handle(), None);
    }

    #[test]
    fn rebuild_is_rejected() {
        let (backend, ctx) = host();
        let mut program = Program::compile(&ctx, SOURCE, "sum").unwrap();
        assert!(matches!(program.build(SOURCE, "sum"), Err(Error::InvalidState(_))));
        assert_eq!(backend.stats().programs_built, 1);
    }

    #[test]
    fn compile_failure_keeps_log_and_state() {
        let (backend, ctx) = host();
        let mut program = Program::new(&ctx);
        let err = program.build("__kernel void sum(void) {", "sum").unwrap_err();
        match err {
            Error::CompileFailure { code, log } => {
                assert_eq!(code, status::BUILD_PROGRAM_FAILURE);
                assert!(log.contains("error: expected '}'"), "{log}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(program.state(), ProgramState::Uncompiled);
        assert_eq!(backend.live_programs(), 0);

        // A failed build can be retried.
        program.build(SOURCE, "sum").unwrap();
        assert!(program.is_compiled());
    }

    #[test]
    fn missing_entry_point_frees_program() {
        let (backend, ctx) = host();
        let err = Program::compile(&ctx, SOURCE, "product").unwrap_err();
        assert!(matches!(
            err,
            Error::KernelCreateFailure {
                code: status::INVALID_KERNEL_NAME,
                ..
            }
        ));
        assert_eq!(backend.stats().programs_built, 1);
        assert_eq!(backend.live_programs(), 0);
        assert_eq!(ctx.live_resources(), 0);
    }

    #[test]
    fn second_bind_is_cached() {
        let (backend, ctx) = host();
        let mut buf = ctx.alloc(4).unwrap();
        buf.write(&[1.0], Some(1)).unwrap();
        let mut program = Program::compile(&ctx, SOURCE, "sum").unwrap();

        assert_eq!(program.set_arg(0, &buf).unwrap(), BindOutcome::Bound);
        assert_eq!(program.set_arg(0, &buf).unwrap(), BindOutcome::Cached);
        assert_eq!(backend.stats().binds(), 1);
        assert_eq!(
            program.bound_slot(0),
            Some(ArgSlot {
                buffer: buf.handle(),
                version: Some(1)
            })
        );

        buf.write(&[2.0], None).unwrap();
        assert_eq!(program.set_arg(0, &buf).unwrap(), BindOutcome::Bound);
        assert_eq!(backend.stats().binds(), 2);
        assert_eq!(ctx.stats().binds_skipped, 1);
    }

    #[test]
    fn never_written_buffer_binds_once() {
        let (backend, ctx) = host();
        let buf = ctx.alloc(4).unwrap();
        let mut program = Program::compile(&ctx, SOURCE, "sum").unwrap();
        program.set_arg(1, &buf).unwrap();
        program.set_arg(1, &buf).unwrap();
        assert_eq!(backend.stats().binds(), 1);
    }

    #[test]
    fn slots_are_independent() {
        let (backend, ctx) = host();
        let buf = ctx.alloc(4).unwrap();
        let mut program = Program::compile(&ctx, SOURCE, "sum").unwrap();
        program.set_arg(0, &buf).unwrap();
        assert_eq!(program.set_arg(1, &buf).unwrap(), BindOutcome::Bound);
        assert_eq!(backend.stats().binds(), 2);
    }

    #[test]
    fn local_buffer_uses_local_bind() {
        let (backend, ctx) = host();
        let global = ctx.alloc(4).unwrap();
        let local = ctx.alloc_local(4).unwrap();
        let mut program = Program::compile(&ctx, SOURCE, "sum").unwrap();
        program.bind(&[&global, &local]).unwrap();

        let stats = backend.stats();
        assert_eq!(stats.global_binds, 1);
        assert_eq!(stats.local_binds, 1);
    }

    #[test]
    fn slot_out_of_range() {
        let (_backend, ctx) = host();
        let buf = ctx.alloc(1).unwrap();
        let mut program = Program::compile(&ctx, SOURCE, "sum").unwrap();
        assert!(matches!(
            program.set_arg(MAX_ARGS, &buf),
            Err(Error::InvalidSlot { slot: 8, max: 8 })
        ));
    }

    #[test]
    fn too_many_buffers_binds_nothing() {
        let (backend, ctx) = host();
        let buffers: Vec<Buffer> = (0..MAX_ARGS + 1).map(|_| ctx.alloc(1).unwrap()).collect();
        let refs: Vec<&Buffer> = buffers.iter().collect();
        let mut program = Program::compile(&ctx, SOURCE, "sum").unwrap();
        assert!(matches!(program.bind(&refs), Err(Error::InvalidSlot { .. })));
        assert_eq!(backend.stats().binds(), 0);
    }

    #[test]
    fn destroyed_buffer_cannot_be_bound() {
        let (_backend, ctx) = host();
        let mut buf = ctx.alloc(1).unwrap();
        buf.destroy().unwrap();
        let mut program = Program::compile(&ctx, SOURCE, "sum").unwrap();
        assert!(matches!(program.set_arg(0, &buf), Err(Error::InvalidState(_))));
    }

    #[test]
    fn buffer_from_other_context_is_rejected() {
        let (_a, ctx_a) = host();
        let (_b, ctx_b) = host();
        let foreign = ctx_b.alloc(1).unwrap();
        let mut program = Program::compile(&ctx_a, SOURCE, "sum").unwrap();
        assert!(matches!(program.set_arg(0, &foreign), Err(Error::InvalidState(_))));
    }

    #[test]
    fn failed_bind_leaves_cache() {
        let (backend, ctx) = host();
        let buf = ctx.alloc(1).unwrap();
        let mut program = Program::compile(&ctx, SOURCE, "sum").unwrap();

        backend.fail_next(HostOp::SetArg, status::OUT_OF_RESOURCES);
        assert!(matches!(
            program.set_arg(0, &buf),
            Err(Error::ArgBindFailure {
                slot: 0,
                code: status::OUT_OF_RESOURCES
            })
        ));
        assert_eq!(program.bound_slot(0), Some(ArgSlot::EMPTY));
        assert_eq!(ctx.stats().binds, 0);

        assert_eq!(program.set_arg(0, &buf).unwrap(), BindOutcome::Bound);
    }

    #[test]
    fn run_with_unbound_slot_fails() {
        let (_backend, ctx) = host();
        let a = ctx.alloc(1).unwrap();
        let mut program = Program::compile(&ctx, SOURCE, "sum").unwrap();
        let err = program.run_with(&[&a]).unwrap_err();
        assert!(matches!(
            err,
            Error::ExecuteFailure {
                code: status::INVALID_KERNEL_ARGS,
                ..
            }
        ));
        let stats = ctx.stats();
        assert_eq!(stats.launches, 0);
        assert_eq!(stats.launch_failures, 1);
        assert_eq!(stats.binds, 1);
    }

    #[test]
    fn run_range_validates_before_launch() {
        let (backend, ctx) = host();
        let bufs: Vec<Buffer> = (0..3).map(|_| ctx.alloc(4).unwrap()).collect();
        let mut program = Program::compile(&ctx, SOURCE, "sum").unwrap();
        program.bind(&bufs.iter().collect::<Vec<_>>()).unwrap();

        assert!(matches!(
            program.run_range(0, &[], &[]),
            Err(Error::InvalidWorkRange(_))
        ));
        assert!(matches!(
            program.run_range(1, &[0], &[0]),
            Err(Error::InvalidWorkRange(_))
        ));
        assert_eq!(backend.stats().total_launches(), 0);

        program.run_range(2, &[0, 0], &[2, 2]).unwrap();
        assert_eq!(backend.stats().ranged_launches, 1);
    }

    #[test]
    fn destroy_is_idempotent_and_terminal() {
        let (backend, ctx) = host();
        let buf = ctx.alloc(1).unwrap();
        let mut program = Program::compile(&ctx, SOURCE, "sum").unwrap();
        program.set_arg(0, &buf).unwrap();

        program.destroy().unwrap();
        program.destroy().unwrap();
        assert_eq!(program.state(), ProgramState::Destroyed);
        assert_eq!(program.bound_slot(0), Some(ArgSlot::EMPTY));
        assert_eq!(backend.stats().kernels_freed, 1);
        assert_eq!(backend.stats().programs_freed, 1);

        assert!(matches!(program.set_arg(0, &buf), Err(Error::InvalidState(_))));
        assert!(matches!(program.run(), Err(Error::InvalidState(_))));
        assert!(matches!(program.build(SOURCE, "sum"), Err(Error::InvalidState(_))));
    }

    #[test]
    fn destroying_uncompiled_program_touches_nothing() {
        let (backend, ctx) = host();
        let mut program = Program::new(&ctx);
        program.destroy().unwrap();
        assert_eq!(program.state(), ProgramState::Destroyed);
        assert_eq!(backend.stats().programs_freed, 0);
    }

    #[test]
    fn read_only_buffers_bind_like_any_other() {
        let (_backend, ctx) = host();
        let buf = Buffer::allocate(&ctx, 2, true, MemFlags::ReadOnly).unwrap();
        let mut program = Program::compile(&ctx, SOURCE, "sum").unwrap();
        assert_eq!(program.set_arg(0, &buf).unwrap(), BindOutcome::Bound);
    }
}

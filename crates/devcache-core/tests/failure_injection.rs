//! Device failures leave buffers, programs and statistics untouched

use devcache_core::{
    status, ArgSlot, BindOutcome, DeviceContext, Error, HostBackend, HostOp, Program, ProgramState,
};

const SOURCE: &str = "__kernel void touch(__global double* x) {}";

fn host() -> (HostBackend, DeviceContext) {
    let backend = HostBackend::new();
    let ctx = DeviceContext::initialize(Box::new(backend.clone())).expect("host context");
    (backend, ctx)
}

#[test]
fn test_failed_upload_keeps_version() -> devcache_core::Result<()> {
    let (backend, ctx) = host();
    let mut buffer = ctx.alloc(4)?;
    buffer.write(&[1.0], Some(5))?;

    backend.fail_next(HostOp::BufferWrite, status::OUT_OF_RESOURCES);
    let err = buffer.write(&[2.0], Some(6)).unwrap_err();
    assert!(matches!(
        err,
        Error::TransferFailure {
            code: status::OUT_OF_RESOURCES,
            ..
        }
    ));
    assert_eq!(buffer.version(), 5);
    assert_eq!(ctx.stats().uploads, 1);

    buffer.write(&[2.0], Some(6))?;
    assert_eq!(buffer.to_vec()?[0], 2.0);
    Ok(())
}

#[test]
fn test_oversized_write_makes_no_device_call() -> devcache_core::Result<()> {
    let (backend, ctx) = host();
    let mut buffer = ctx.alloc(4)?;
    let err = buffer.write(&[0.0; 5], Some(1)).unwrap_err();
    assert!(matches!(err, Error::SizeExceeded { len: 5, capacity: 4 }));
    assert_eq!(buffer.version(), 0);
    assert_eq!(backend.stats().writes, 0);
    Ok(())
}

#[test]
fn test_failed_bind_keeps_slot_and_counters() -> devcache_core::Result<()> {
    let (backend, ctx) = host();
    let buffer = ctx.alloc(4)?;
    let mut program = ctx.compile(SOURCE, "touch")?;
    program.set_arg(0, &buffer)?;
    let cached = program.bound_slot(0);

    let mut other = ctx.alloc(4)?;
    other.write(&[1.0], None)?;
    backend.fail_next(HostOp::SetArg, status::INVALID_MEM_OBJECT);
    assert!(matches!(
        program.set_arg(0, &other),
        Err(Error::ArgBindFailure {
            slot: 0,
            code: status::INVALID_MEM_OBJECT
        })
    ));
    assert_eq!(program.bound_slot(0), cached);
    assert_eq!(ctx.stats().binds, 1);

    // The earlier binding is still cached.
    assert_eq!(program.set_arg(0, &buffer)?, BindOutcome::Cached);
    Ok(())
}

#[test]
fn test_failed_launch_counts_failure_only() -> devcache_core::Result<()> {
    let (backend, ctx) = host();
    let buffer = ctx.alloc(4)?;
    let mut program = ctx.compile(SOURCE, "touch")?;
    program.bind(&[&buffer])?;

    backend.fail_next(HostOp::Execute, status::OUT_OF_RESOURCES);
    let err = program.run().unwrap_err();
    assert!(matches!(
        &err,
        Error::ExecuteFailure { entry_point, code: status::OUT_OF_RESOURCES } if entry_point == "touch"
    ));
    assert_eq!(err.code(), Some(status::OUT_OF_RESOURCES));

    let stats = ctx.stats();
    assert_eq!(stats.launches, 0);
    assert_eq!(stats.launch_failures, 1);
    assert_eq!(program.state(), ProgramState::Compiled);

    program.run()?;
    assert_eq!(ctx.stats().launches, 1);
    Ok(())
}

#[test]
fn test_kernel_create_failure_frees_program() {
    let (backend, ctx) = host();
    backend.fail_next(HostOp::KernelCreate, status::OUT_OF_RESOURCES);

    let err = Program::compile(&ctx, SOURCE, "touch").unwrap_err();
    assert!(matches!(err, Error::KernelCreateFailure { ref entry_point, .. } if entry_point == "touch"));
    assert_eq!(backend.live_programs(), 0);
    assert_eq!(backend.live_kernels(), 0);
}

#[test]
fn test_compile_failure_carries_log() {
    let (_backend, ctx) = host();
    let err = Program::compile(&ctx, "__kernel int touch(void) { return 0; }", "touch").unwrap_err();
    match err {
        Error::CompileFailure { code, log } => {
            assert_eq!(code, status::BUILD_PROGRAM_FAILURE);
            assert!(log.starts_with("1:"), "{log}");
            assert!(log.contains("error generated"), "{log}");
        }
        other => panic!("expected compile failure, got {other:?}"),
    }
}

#[test]
fn test_allocation_over_limit() {
    let backend = HostBackend::with_memory_limit(64);
    let ctx = DeviceContext::initialize(Box::new(backend)).expect("host context");
    let _fits = ctx.alloc(8).expect("8 elements fit in 64 bytes");
    assert!(matches!(
        ctx.alloc(1),
        Err(Error::AllocationFailure {
            code: status::MEM_OBJECT_ALLOCATION_FAILURE,
            ..
        })
    ));
}

#[test]
fn test_unbound_program_slots_start_empty() -> devcache_core::Result<()> {
    let (_backend, ctx) = host();
    let program = ctx.compile(SOURCE, "touch")?;
    assert_eq!(program.bound_slot(0), Some(ArgSlot::EMPTY));
    Ok(())
}

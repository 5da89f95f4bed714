//! Property tests for buffer versioning and argument-slot elision

use devcache_core::{BindOutcome, DeviceContext, HostBackend, Program, WriteOutcome};
use proptest::prelude::*;

const CAPACITY: usize = 16;

fn host() -> (HostBackend, DeviceContext) {
    let backend = HostBackend::new();
    let ctx = DeviceContext::initialize(Box::new(backend.clone())).expect("host context");
    (backend, ctx)
}

fn write_op() -> impl Strategy<Value = (usize, Option<u64>)> {
    (0..=CAPACITY + 2, prop::option::of(0u64..32))
}

proptest! {
    #[test]
    fn version_never_decreases(ops in prop::collection::vec(write_op(), 1..40)) {
        let (backend, ctx) = host();
        let mut buffer = ctx.alloc(CAPACITY).unwrap();
        let mut uploads = 0;

        for (len, version) in ops {
            let before = buffer.version();
            let data = vec![1.0; len];
            match buffer.write(&data, version) {
                Ok(WriteOutcome::Uploaded) => {
                    uploads += 1;
                    prop_assert!(buffer.version() > before);
                    if let Some(v) = version {
                        prop_assert_eq!(buffer.version(), v);
                    }
                }
                Ok(WriteOutcome::Skipped) => {
                    prop_assert!(version.is_some_and(|v| v <= before));
                    prop_assert_eq!(buffer.version(), before);
                }
                Err(_) => {
                    prop_assert!(len > CAPACITY);
                    prop_assert_eq!(buffer.version(), before);
                }
            }
        }
        prop_assert_eq!(backend.stats().writes, uploads);
    }

    #[test]
    fn repeated_write_uploads_once(version in 1u64..1_000, len in 1..=CAPACITY) {
        let (backend, ctx) = host();
        let mut buffer = ctx.alloc(CAPACITY).unwrap();
        let data = vec![0.25; len];

        prop_assert_eq!(buffer.write(&data, Some(version)).unwrap(), WriteOutcome::Uploaded);
        prop_assert_eq!(buffer.write(&data, Some(version)).unwrap(), WriteOutcome::Skipped);
        prop_assert_eq!(buffer.version(), version);
        prop_assert_eq!(backend.stats().writes, 1);
    }

    #[test]
    fn binds_follow_version_changes(advances in prop::collection::vec(any::<bool>(), 1..30)) {
        let (backend, ctx) = host();
        let mut buffer = ctx.alloc(CAPACITY).unwrap();
        let mut program = Program::compile(&ctx, "__kernel void k(__global double* x) {}", "k").unwrap();
        prop_assert_eq!(program.set_arg(0, &buffer).unwrap(), BindOutcome::Bound);

        let mut expected = 1;
        for advance in advances {
            if advance {
                buffer.write(&[1.0], None).unwrap();
                expected += 1;
                prop_assert_eq!(program.set_arg(0, &buffer).unwrap(), BindOutcome::Bound);
            } else {
                prop_assert_eq!(program.set_arg(0, &buffer).unwrap(), BindOutcome::Cached);
            }
        }
        prop_assert_eq!(backend.stats().binds(), expected);
    }
}

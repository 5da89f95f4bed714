//! Argument-slot cache benchmarks
//!
//! Measures a launch loop where every argument is already bound against one
//! where a version bump forces the first slot to rebind each iteration.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use devcache_core::{Buffer, DeviceContext, HostBackend, Program, MAX_ARGS};

const SOURCE: &str = "__kernel void wide(__global double* a, __global double* b, __global double* c, \
    __global double* d, __global double* e, __global double* f, __global double* g, __global double* h) {}";

fn setup() -> (DeviceContext, Vec<Buffer>, Program) {
    let ctx = DeviceContext::initialize(Box::new(HostBackend::new())).unwrap();
    let buffers: Vec<Buffer> = (0..MAX_ARGS).map(|_| ctx.alloc(256).unwrap()).collect();
    let program = Program::compile(&ctx, SOURCE, "wide").unwrap();
    (ctx, buffers, program)
}

fn benchmark_bind(c: &mut Criterion) {
    let mut group = c.benchmark_group("arg_cache");

    for args in [1, 4, MAX_ARGS] {
        group.bench_with_input(BenchmarkId::new("cached", args), &args, |b, &n| {
            let (_ctx, buffers, mut program) = setup();
            let refs: Vec<&Buffer> = buffers.iter().take(n).collect();
            program.bind(&refs).unwrap();
            b.iter(|| black_box(program.bind(black_box(&refs)).unwrap()));
        });
    }

    group.bench_function("rebind_one_per_launch", |b| {
        let (_ctx, mut buffers, mut program) = setup();
        program.bind(&buffers.iter().collect::<Vec<_>>()).unwrap();
        b.iter(|| {
            buffers[0].write(&[1.0], None).unwrap();
            let refs: Vec<&Buffer> = buffers.iter().collect();
            program.run_with(black_box(&refs)).unwrap();
        });
    });

    group.bench_function("launch_all_cached", |b| {
        let (_ctx, buffers, mut program) = setup();
        let refs: Vec<&Buffer> = buffers.iter().collect();
        b.iter(|| program.run_with(black_box(&refs)).unwrap());
    });

    group.finish();
}

criterion_group!(benches, benchmark_bind);
criterion_main!(benches);

//! GEMM throughput of the blocked CPU backend against the reference loops

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use crucible::backend::{Backend, CpuBackend, MatRef, ReferenceBackend};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const SIZES: &[usize] = &[32, 128, 256];

fn random(len: usize, rng: &mut StdRng) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

fn bench_gemm(c: &mut Criterion) {
    let mut group = c.benchmark_group("gemm");
    let mut rng = StdRng::seed_from_u64(0);
    let backends: Vec<(&str, Box<dyn Backend>)> = vec![
        ("reference", Box::new(ReferenceBackend)),
        ("cpu_block_32", Box::new(CpuBackend::new(32))),
        ("cpu_block_64", Box::new(CpuBackend::new(64))),
    ];

    for &n in SIZES {
        let a = random(n * n, &mut rng);
        let b = random(n * n, &mut rng);
        let mut out = vec![0.0; n * n];

        for (name, backend) in &backends {
            group.bench_with_input(BenchmarkId::new(*name, n), &n, |bench, &n| {
                bench.iter(|| {
                    backend.gemm(
                        1.0,
                        MatRef::new(black_box(&a), n, n),
                        MatRef::new(black_box(&b), n, n),
                        0.0,
                        &mut out,
                    );
                    black_box(&out);
                })
            });
        }
    }

    group.finish();
}

fn bench_matmul_with_autograd(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(1);
    let ctx = crucible::ExecutionContext::new(std::sync::Arc::new(CpuBackend::default()));
    let a = crucible::Tensor::random_uniform([128, 128], -1.0, 1.0, true, &mut rng);
    let b = crucible::Tensor::random_uniform([128, 128], -1.0, 1.0, true, &mut rng);

    c.bench_function("matmul_forward_backward_128", |bench| {
        bench.iter(|| {
            let out = crucible::ops::matmul_with(&ctx, &a, &b).expect("matching shapes");
            crucible::ops::sum(&out).backward_with(None, crucible::BackwardOptions::default());
        })
    });
}

criterion_group!(benches, bench_gemm, bench_matmul_with_autograd);
criterion_main!(benches);

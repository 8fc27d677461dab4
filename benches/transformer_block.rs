//! Benchmark suite for the reference simulator and the CPU fused kernel
//!
//! Measures one forward pass of the 3-layer stack for:
//! - the unfused reference (f64 fake-quant accumulation)
//! - the CPU INT8 backend (i32 accumulation, per-channel scales)
//! - INT8 matvec on its own, at the widths the stack uses

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use comprobar::dtype::Precision;
use comprobar::fused::{CpuFusedInt8, FusedPlan};
use comprobar::inference::CacheMode;
use comprobar::quantize::{quantize_i8, Int8Weight, ScalePair};
use comprobar::reference::ReferenceTransformer;
use comprobar::transformer::TransformerInputs;
use comprobar::TransformerConfig;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn configs() -> Vec<(&'static str, TransformerConfig)> {
    let base = TransformerConfig {
        num_heads: 8,
        head_dim: 64,
        ..TransformerConfig::default()
    };
    vec![
        ("fp32", base.clone()),
        (
            "fp16_decode",
            TransformerConfig {
                precision: Precision::Fp16,
                cache_mode: CacheMode::Decode,
                cache_length: 32,
                ..base
            },
        ),
    ]
}

fn benchmark_reference_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("reference_forward");
    group.sample_size(20);

    for (name, config) in configs() {
        let inputs = TransformerInputs::generate(&config, 0).expect("inputs");
        let reference = ReferenceTransformer::new(&config).expect("config");
        group.bench_function(BenchmarkId::from_parameter(name), |b| {
            b.iter(|| {
                let mut rng = StdRng::seed_from_u64(0);
                let out = reference
                    .forward(black_box(&inputs), &mut rng)
                    .expect("forward");
                black_box(out)
            });
        });
    }

    group.finish();
}

fn benchmark_fused_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("fused_forward");
    group.sample_size(20);
    let kernel = CpuFusedInt8::new();

    for (name, config) in configs() {
        let inputs = TransformerInputs::generate(&config, 0).expect("inputs");
        let mut rng = StdRng::seed_from_u64(0);
        let scales = ReferenceTransformer::new(&config)
            .expect("config")
            .forward(&inputs, &mut rng)
            .expect("forward")
            .scales;
        let plan = FusedPlan::build(&config, &inputs, &scales).expect("plan");

        group.bench_function(BenchmarkId::from_parameter(name), |b| {
            b.iter(|| {
                let mut rng = StdRng::seed_from_u64(0);
                let out = plan
                    .clone()
                    .run(&kernel, black_box(&inputs.query), &mut rng)
                    .expect("fused");
                black_box(out)
            });
        });
    }

    group.finish();
}

fn benchmark_int8_matvec(c: &mut Criterion) {
    let mut group = c.benchmark_group("int8_matvec");

    for (in_dim, out_dim) in [(512, 1536), (512, 2048), (2048, 512)] {
        let data: Vec<i8> = (0..in_dim * out_dim)
            .map(|i| ((i * 37) % 128) as i8 - 64)
            .collect();
        let weight = Int8Weight::new(data, in_dim, out_dim).expect("weight");
        let x: Vec<f32> = (0..in_dim).map(|i| (i as f32 * 0.01).sin()).collect();
        let scales = ScalePair::from_activations(&x);
        let q = quantize_i8(&x, scales.in_scale);

        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{in_dim}x{out_dim}")),
            &q,
            |b, q| b.iter(|| black_box(weight.matvec(black_box(q)).expect("matvec"))),
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_reference_forward,
    benchmark_fused_forward,
    benchmark_int8_matvec
);
criterion_main!(benches);

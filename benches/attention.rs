//! Benchmark suite for block-sparse attention
//!
//! Measures the selector, the kernel under both selection representations,
//! and sparse vs dense end-to-end latency.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use esparso::dense::DenseAttention;
use esparso::kernel::BlockSparseKernel;
use esparso::mask::SelectionView;
use esparso::select::BlockImportanceSelector;
use esparso::{BlockSparseAttention, SparseAttentionConfig, Tensor};

const HEAD_DIM: usize = 64;
const BLOCK: usize = 64;

fn rand_tensor(shape: Vec<usize>, seed: f32) -> Tensor<f32> {
    let size = shape.iter().product();
    let data = (0..size)
        .map(|i| ((i as f32 + seed) * 0.37).sin() * 0.5)
        .collect();
    Tensor::from_vec(shape, data).unwrap()
}

fn config() -> SparseAttentionConfig {
    SparseAttentionConfig::default()
        .with_top_k(2)
        .with_block_size(BLOCK)
        .with_text_blocks(1)
        .with_prob_threshold(0.6)
}

fn benchmark_selector(c: &mut Criterion) {
    let selector = BlockImportanceSelector::new(&config()).unwrap();
    let mut group = c.benchmark_group("selector");

    for num_blocks in [4usize, 8, 16] {
        let normal_blocks = num_blocks - 1;
        let q = rand_tensor(vec![1, 4, normal_blocks * BLOCK, HEAD_DIM], 1.0);
        let k = rand_tensor(vec![1, 4, num_blocks * BLOCK, HEAD_DIM], 2.0);
        group.bench_with_input(
            BenchmarkId::from_parameter(num_blocks),
            &num_blocks,
            |b, &num_blocks| {
                b.iter(|| {
                    let mask = selector
                        .select(
                            black_box(&q),
                            black_box(&k),
                            num_blocks - 1,
                            num_blocks,
                            None,
                        )
                        .unwrap();
                    black_box(mask)
                });
            },
        );
    }

    group.finish();
}

fn benchmark_kernel_views(c: &mut Criterion) {
    let num_blocks = 8;
    let normal_blocks = num_blocks - 1;
    let ctx = num_blocks * BLOCK;
    let q = rand_tensor(vec![1, 4, normal_blocks * BLOCK, HEAD_DIM], 3.0);
    let k = rand_tensor(vec![1, 4, ctx, HEAD_DIM], 4.0);
    let v = rand_tensor(vec![1, 4, ctx, HEAD_DIM], 5.0);
    let seqlens = [ctx];
    let scale = 1.0 / (HEAD_DIM as f32).sqrt();

    let selector = BlockImportanceSelector::new(&config()).unwrap();
    let mask = selector
        .select(&q, &k, normal_blocks, num_blocks, None)
        .unwrap();
    let index = mask.to_index_list(num_blocks).unwrap();
    let kernel = BlockSparseKernel::new(HEAD_DIM, BLOCK, BLOCK).unwrap();

    c.bench_function("kernel_one_hot", |b| {
        b.iter(|| {
            let out = kernel
                .forward(
                    black_box(&q),
                    black_box(&k),
                    black_box(&v),
                    &seqlens,
                    SelectionView::OneHot(&mask),
                    scale,
                    1.0,
                    normal_blocks,
                )
                .unwrap();
            black_box(out)
        });
    });

    c.bench_function("kernel_index_list", |b| {
        b.iter(|| {
            let out = kernel
                .forward(
                    black_box(&q),
                    black_box(&k),
                    black_box(&v),
                    &seqlens,
                    SelectionView::IndexList(&index),
                    scale,
                    1.0,
                    normal_blocks,
                )
                .unwrap();
            black_box(out)
        });
    });
}

fn benchmark_sparse_vs_dense(c: &mut Criterion) {
    let ctx = 8 * BLOCK;
    let q = rand_tensor(vec![1, ctx, 4, HEAD_DIM], 6.0);
    let k = rand_tensor(vec![1, ctx, 4, HEAD_DIM], 7.0);
    let v = rand_tensor(vec![1, ctx, 4, HEAD_DIM], 8.0);

    let attn = BlockSparseAttention::new(config()).unwrap();
    c.bench_function("sparse_end_to_end", |b| {
        b.iter(|| {
            let out = attn
                .forward(black_box(&q), black_box(&k), black_box(&v), None, false)
                .unwrap();
            black_box(out)
        });
    });

    let dense = DenseAttention::new(HEAD_DIM).unwrap();
    let q4 = rand_tensor(vec![1, 4, ctx, HEAD_DIM], 6.0);
    let k4 = rand_tensor(vec![1, 4, ctx, HEAD_DIM], 7.0);
    let v4 = rand_tensor(vec![1, 4, ctx, HEAD_DIM], 8.0);
    let scale = 1.0 / (HEAD_DIM as f32).sqrt();
    c.bench_function("dense_reference", |b| {
        b.iter(|| {
            let out = dense
                .forward(black_box(&q4), black_box(&k4), black_box(&v4), false, scale)
                .unwrap();
            black_box(out)
        });
    });
}

criterion_group!(
    benches,
    benchmark_selector,
    benchmark_kernel_views,
    benchmark_sparse_vs_dense
);
criterion_main!(benches);

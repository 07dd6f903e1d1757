// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::mem::size_of;

const NUM_THREADS: &[usize] = &[1, 2, 4, 8];
const LENGTHS: &[usize] = &[10_000, 100_000, 1_000_000, 10_000_000];
const REGION_ITERATIONS: &[usize] = &[1, 100, 10_000];

fn sin(c: &mut Criterion) {
    let mut group = c.benchmark_group("sin");
    for len in LENGTHS {
        group.throughput(Throughput::Bytes((len * size_of::<f64>()) as u64));
        group.bench_with_input(BenchmarkId::new("serial", len), len, serial::sin);
        for &num_threads in NUM_THREADS {
            group.bench_with_input(
                BenchmarkId::new(format!("rayon@{num_threads}"), len),
                len,
                |bencher, len| rayon::sin(bencher, num_threads, len),
            );
            group.bench_with_input(
                BenchmarkId::new(format!("teampool@{num_threads}"), len),
                len,
                |bencher, len| teampool::sin(bencher, num_threads, len),
            );
        }
    }
    group.finish();
}

fn region(c: &mut Criterion) {
    let mut group = c.benchmark_group("region");
    for iterations in REGION_ITERATIONS {
        group.bench_with_input(
            BenchmarkId::new("serial", iterations),
            iterations,
            serial::region,
        );
        for &num_threads in NUM_THREADS {
            group.bench_with_input(
                BenchmarkId::new(format!("rayon@{num_threads}"), iterations),
                iterations,
                |bencher, iterations| rayon::region(bencher, num_threads, iterations),
            );
            group.bench_with_input(
                BenchmarkId::new(format!("teampool@{num_threads}"), iterations),
                iterations,
                |bencher, iterations| teampool::region(bencher, num_threads, iterations),
            );
        }
    }
    group.finish();
}

/// Repeatedly applies `sin()`, starting from the given value.
fn sin_chain(start: f64, iterations: usize) -> f64 {
    (0..iterations).fold(start, |x, _| x.sin())
}

/// Baseline benchmarks without any multi-threading involved.
mod serial {
    use criterion::{black_box, Bencher};

    pub fn sin(bencher: &mut Bencher, len: &usize) {
        let input = (0..*len).map(|i| i as f64).collect::<Vec<f64>>();
        let mut output = vec![0.0; *len];

        let input_slice = input.as_slice();
        let output_slice = output.as_mut_slice();

        bencher.iter(|| {
            black_box(input_slice)
                .iter()
                .zip(black_box(output_slice.iter_mut()))
                .for_each(|(&x, out)| *out = x.sin())
        });
    }

    pub fn region(bencher: &mut Bencher, iterations: &usize) {
        bencher.iter(|| black_box(super::sin_chain(black_box(1.0), *iterations)));
    }
}

/// Benchmarks using Rayon.
mod rayon {
    use criterion::{black_box, Bencher};
    use rayon::iter::{
        IndexedParallelIterator, IntoParallelRefIterator, IntoParallelRefMutIterator,
        ParallelIterator,
    };

    pub fn sin(bencher: &mut Bencher, num_threads: usize, len: &usize) {
        let input = (0..*len).map(|i| i as f64).collect::<Vec<f64>>();
        let mut output = vec![0.0; *len];

        let input_slice = input.as_slice();
        let output_slice = output.as_mut_slice();

        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .unwrap();
        thread_pool.install(|| {
            bencher.iter(|| {
                black_box(input_slice)
                    .par_iter()
                    .zip(black_box(output_slice.par_iter_mut()))
                    .for_each(|(&x, out)| *out = x.sin())
            })
        });
    }

    pub fn region(bencher: &mut Bencher, num_threads: usize, iterations: &usize) {
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .unwrap();
        bencher.iter(|| {
            thread_pool.broadcast(|ctx| {
                black_box(super::sin_chain(ctx.index() as f64, *iterations));
            })
        });
    }
}

/// Benchmarks using a teampool thread pool.
mod teampool {
    use criterion::{black_box, Bencher};
    use std::sync::atomic::{AtomicU64, Ordering};
    use teampool::{CpuPinningPolicy, ThreadCount, ThreadPool, ThreadPoolBuilder};

    fn thread_pool(num_threads: usize) -> ThreadPool {
        ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(num_threads).unwrap(),
            cpu_pinning: CpuPinningPolicy::IfSupported,
        }
        .build()
    }

    pub fn sin(bencher: &mut Bencher, num_threads: usize, len: &usize) {
        let input = (0..*len).map(|i| i as f64).collect::<Vec<f64>>();
        let output = (0..*len).map(|_| AtomicU64::new(0)).collect::<Vec<_>>();

        let input_slice = input.as_slice();
        let output_slice = output.as_slice();

        let mut thread_pool = thread_pool(num_threads);
        bencher.iter(|| {
            thread_pool.parallel_for_static(*len, None, None, |i| {
                let x = black_box(input_slice)[i].sin();
                output_slice[i].store(x.to_bits(), Ordering::Relaxed);
            })
        });
    }

    pub fn region(bencher: &mut Bencher, num_threads: usize, iterations: &usize) {
        let mut thread_pool = thread_pool(num_threads);
        bencher.iter(|| {
            thread_pool.parallel_region(None, |i| {
                black_box(super::sin_chain(i as f64, *iterations));
            })
        });
    }
}

criterion_group!(benches, sin, region);
criterion_main!(benches);

// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CLI tool to time parallel scenarios on the process-wide thread pool.

use clap::{Parser, ValueEnum};
use std::hint::black_box;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Some(num_threads) = cli.num_threads {
        teampool::resize(num_threads.get());
    }
    println!(
        "{:?} scenario, n = {}, {} thread(s)",
        cli.scenario,
        cli.n,
        teampool::num_threads_in_pool()
    );

    let budget = Duration::from_secs_f64(cli.time);
    let mut durations = Vec::new();
    let start = Instant::now();
    // At least one run, even with a zero budget.
    while durations.is_empty() || start.elapsed() < budget {
        let run_start = Instant::now();
        match cli.scenario {
            Scenario::Sin => sin(cli.n),
            Scenario::Region => region(cli.n),
            Scenario::Ordered => ordered(cli.n),
        }
        durations.push(run_start.elapsed());
    }

    println!("{}", Stats::new(durations));
}

/// Computes `sin(x)` over a vector, with a static partition.
fn sin(n: usize) {
    let input = (0..n).map(|i| i as f64).collect::<Vec<f64>>();
    let output = (0..n).map(|_| AtomicU64::new(0)).collect::<Vec<_>>();
    teampool::parallel_for_static(n, None, None, |i| {
        let x = black_box(input[i]).sin();
        output[i].store(x.to_bits(), Ordering::Relaxed);
    });
    black_box(output);
}

/// Runs `n` iterations of `sin()` on each thread of a parallel region.
fn region(n: usize) {
    teampool::parallel_region(None, |i| {
        let x = (0..n).fold(i as f64, |x, _| x.sin());
        black_box(x);
    });
}

/// Runs an ordered loop of `n` iterations, whose ordered phase accumulates the
/// values computed in parallel.
fn ordered(n: usize) {
    let values = (0..n).map(|_| AtomicU64::new(0)).collect::<Vec<_>>();
    let total = Mutex::new(0.0);
    teampool::parallel_for_ordered(n, None, |ctx| {
        ctx.run(
            |i| {
                let x = (0..100).fold(i as f64, |x, _| x.sin());
                values[i].store(x.to_bits(), Ordering::Relaxed);
            },
            |i| *total.lock().unwrap() += f64::from_bits(values[i].load(Ordering::Relaxed)),
            |i| values[i].store(0, Ordering::Relaxed),
        );
    });
    black_box(total.into_inner().unwrap());
}

/// Summary of the durations of repeated runs.
struct Stats {
    mean: f64,
    stdev: f64,
    min: f64,
    median: f64,
    max: f64,
    count: usize,
}

impl Stats {
    /// Summarizes the given durations, excluding the slowest 5% when there are
    /// at least 10 of them.
    fn new(mut durations: Vec<Duration>) -> Self {
        durations.sort();
        if durations.len() >= 10 {
            let keep = durations.len() - durations.len() / 20;
            durations.truncate(keep);
        }
        let seconds = durations
            .iter()
            .map(Duration::as_secs_f64)
            .collect::<Vec<f64>>();

        let count = seconds.len();
        let mean = seconds.iter().sum::<f64>() / count as f64;
        let variance = seconds.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / count as f64;
        Self {
            mean,
            stdev: variance.sqrt(),
            min: seconds[0],
            median: seconds[count / 2],
            max: seconds[count - 1],
            count,
        }
    }
}

impl std::fmt::Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (scale, unit) = if self.max < 1.0 {
            (1000.0, "ms")
        } else {
            (1.0, "s")
        };
        write!(
            f,
            "{:.3} ± {:.3} {unit} (min = {:.3}, med = {:.3}, max = {:.3}, n = {})",
            self.mean * scale,
            self.stdev * scale,
            self.min * scale,
            self.median * scale,
            self.max * scale,
            self.count
        )
    }
}

/// CLI tool to time parallel scenarios on the process-wide thread pool.
#[derive(Parser, Debug, PartialEq)]
#[command(version)]
struct Cli {
    /// Scenario to run in parallel.
    #[arg(long, value_enum)]
    scenario: Scenario,

    /// Size of the scenario: number of items, or of iterations per thread.
    #[arg(long, default_value_t = 1_000_000)]
    n: usize,

    /// Number of worker threads. Default to the available parallelism.
    #[arg(long)]
    num_threads: Option<NonZeroUsize>,

    /// Time budget in seconds. The scenario is repeated until it's spent.
    #[arg(long, default_value_t = 1.0)]
    time: f64,
}

/// Scenario to run.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Scenario {
    /// Compute the sine of each item of a vector.
    Sin,
    /// Iterate the sine function on each thread of a parallel region.
    Region,
    /// Accumulate values computed in parallel, in order.
    Ordered,
}

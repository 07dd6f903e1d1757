// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Schedulers decide what each worker thread executes next.

#[cfg(feature = "log_parallelism")]
use crate::macros::log_info;
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A source of tasks for the worker threads of a team.
///
/// A scheduler is created for a single job, and is polled concurrently by all
/// the threads of the team until each of them obtains [`None`].
pub trait Scheduler {
    /// Returns the next task to run on the thread with the given index, or
    /// [`None`] if there is no more work for this thread in this job.
    ///
    /// Once this returned [`None`] for a thread, it must keep doing so.
    fn next_task(&self, thread_index: usize) -> Option<Task<'_>>;

    /// Hook to display various debugging statistics once the job is finished.
    #[cfg(feature = "log_parallelism")]
    fn print_statistics(&self) {}
}

/// A unit of work handed out by a [`Scheduler`].
pub enum Task<'a> {
    /// Calls the function once, with the index of the worker thread.
    Invoke(&'a (dyn Fn(usize) + Sync)),
    /// Calls the function on each index of the range.
    Range {
        body: &'a (dyn Fn(usize) + Sync),
        range: std::ops::Range<usize>,
    },
    /// Makes the worker thread exit instead of waiting for the next job.
    Shutdown,
}

impl Task<'_> {
    /// Runs this task on the worker thread with the given index.
    ///
    /// Returns false if this is a [`Task::Shutdown`], true otherwise.
    pub fn execute(self, thread_index: usize) -> bool {
        match self {
            Task::Invoke(f) => {
                f(thread_index);
                true
            }
            Task::Range { body, range } => {
                range.for_each(body);
                true
            }
            Task::Shutdown => false,
        }
    }
}

/// Per-thread flags recording which thread indices have been served.
struct ServedFlags(Box<[CachePadded<AtomicBool>]>);

impl ServedFlags {
    fn new(num_threads: usize) -> Self {
        Self(
            (0..num_threads)
                .map(|_| CachePadded::new(AtomicBool::new(false)))
                .collect(),
        )
    }

    /// Marks the given index as served, returning whether it was the first
    /// time. Indices out of bounds are never served.
    fn serve(&self, thread_index: usize) -> bool {
        match self.0.get(thread_index) {
            Some(flag) => !flag.swap(true, Ordering::Relaxed),
            None => false,
        }
    }
}

/// Gives exactly one task to each of the first `num_threads` threads.
pub struct OnceScheduler<F> {
    done: ServedFlags,
    f: F,
}

impl<F: Fn(usize) + Sync> OnceScheduler<F> {
    pub fn new(num_threads: usize, f: F) -> Self {
        Self {
            done: ServedFlags::new(num_threads),
            f,
        }
    }
}

impl<F: Fn(usize) + Sync> Scheduler for OnceScheduler<F> {
    fn next_task(&self, thread_index: usize) -> Option<Task<'_>> {
        self.done
            .serve(thread_index)
            .then_some(Task::Invoke(&self.f))
    }
}

/// Returns the number of contiguous chunks into which `total` items are split
/// for static scheduling, given a minimal chunk size and a number of threads.
///
/// The result is in `1..=num_threads` (assuming `num_threads >= 1`), and each
/// chunk contains at least `min_chunk` items unless `total < min_chunk`.
pub fn static_chunk_count(total: usize, min_chunk: usize, num_threads: usize) -> usize {
    (total / min_chunk.max(1)).clamp(1, num_threads.max(1))
}

/// Returns the range of items of the given chunk, when splitting `0..total`
/// into `num_chunks` contiguous chunks of (almost) equal sizes.
fn static_chunk(chunk: usize, total: usize, num_chunks: usize) -> std::ops::Range<usize> {
    // Intermediate products are computed on 128 bits, so that they don't overflow
    // for any `usize` inputs.
    let bound = |i: usize| ((i as u128 * total as u128) / num_chunks as u128) as usize;
    bound(chunk)..bound(chunk + 1)
}

/// Splits `0..total` into a fixed, deterministic partition where chunk `i` is
/// processed by thread `i`.
pub struct StaticForScheduler<F> {
    total: usize,
    num_chunks: usize,
    served: ServedFlags,
    body: F,
}

impl<F: Fn(usize) + Sync> StaticForScheduler<F> {
    pub fn new(total: usize, min_chunk: usize, num_threads: usize, body: F) -> Self {
        let num_chunks = static_chunk_count(total, min_chunk, num_threads);
        Self {
            total,
            num_chunks,
            served: ServedFlags::new(num_chunks),
            body,
        }
    }

    /// Number of chunks, which is also the number of threads that receive a
    /// task.
    pub fn num_chunks(&self) -> usize {
        self.num_chunks
    }
}

impl<F: Fn(usize) + Sync> Scheduler for StaticForScheduler<F> {
    fn next_task(&self, thread_index: usize) -> Option<Task<'_>> {
        if !self.served.serve(thread_index) {
            return None;
        }
        let range = static_chunk(thread_index, self.total, self.num_chunks);
        Some(Task::Range {
            body: &self.body,
            range,
        })
    }
}

/// Hands out successive chunks of `0..total` to whichever thread asks first.
pub struct DynamicForScheduler<F> {
    /// Start of the next chunk to hand out.
    cursor: CachePadded<AtomicUsize>,
    total: usize,
    chunk_size: usize,
    body: F,
    /// Number of chunks claimed by each thread.
    #[cfg(feature = "log_parallelism")]
    claims: Box<[CachePadded<AtomicUsize>]>,
}

impl<F: Fn(usize) + Sync> DynamicForScheduler<F> {
    pub fn new(total: usize, chunk_size: usize, _num_threads: usize, body: F) -> Self {
        Self {
            cursor: CachePadded::new(AtomicUsize::new(0)),
            total,
            chunk_size: chunk_size.max(1),
            body,
            #[cfg(feature = "log_parallelism")]
            claims: (0.._num_threads)
                .map(|_| CachePadded::new(AtomicUsize::new(0)))
                .collect(),
        }
    }

    fn claim(&self) -> Option<std::ops::Range<usize>> {
        // Relaxed is enough: the cursor only needs to hand out disjoint chunks, and
        // the effects of processing them are published to the main thread when the
        // job is joined.
        let start = self
            .cursor
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |start| {
                (start < self.total).then(|| start.saturating_add(self.chunk_size))
            })
            .ok()?;
        Some(start..self.total.min(start.saturating_add(self.chunk_size)))
    }
}

impl<F: Fn(usize) + Sync> Scheduler for DynamicForScheduler<F> {
    fn next_task(&self, _thread_index: usize) -> Option<Task<'_>> {
        let range = self.claim()?;
        #[cfg(feature = "log_parallelism")]
        if let Some(claims) = self.claims.get(_thread_index) {
            claims.fetch_add(1, Ordering::Relaxed);
        }
        Some(Task::Range {
            body: &self.body,
            range,
        })
    }

    #[cfg(feature = "log_parallelism")]
    fn print_statistics(&self) {
        log_info!(
            "Dynamic scheduling statistics ({} items, chunks of {}):",
            self.total,
            self.chunk_size
        );
        for (i, claims) in self.claims.iter().enumerate() {
            log_info!("- thread {i}: {} chunks", claims.load(Ordering::Relaxed));
        }
    }
}

/// Tells every thread at index `keep` or above to exit.
///
/// Threads below `keep` get no work at all. A thread that received its
/// [`Task::Shutdown`] never polls the scheduler again, so no bookkeeping is
/// needed.
pub struct ShutdownScheduler {
    keep: usize,
}

impl ShutdownScheduler {
    pub fn new(keep: usize) -> Self {
        Self { keep }
    }
}

impl Scheduler for ShutdownScheduler {
    fn next_task(&self, thread_index: usize) -> Option<Task<'_>> {
        (thread_index >= self.keep).then_some(Task::Shutdown)
    }
}

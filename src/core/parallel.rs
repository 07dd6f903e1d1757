// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Job submission on a [`ThreadPool`].

use super::ordered::{OrderedContext, OrderedScheduler};
use super::scheduler::{
    static_chunk_count, DynamicForScheduler, OnceScheduler, StaticForScheduler,
};
use super::team::Team;
use super::thread_pool::ThreadPool;
use super::worker::with_current_pool;
use crate::macros::log_debug;
use crate::violation::{violation, ProtocolViolation};

/// Minimal number of items per chunk of a static loop, when not given.
pub const DEFAULT_STATIC_MIN_CHUNK: usize = 4096;

/// Number of items claimed at once by a thread in a dynamic loop.
pub const DYNAMIC_CHUNK_SIZE: usize = 1;

impl ThreadPool {
    /// Runs `f(thread_index)` once on each thread of a team of `num_threads`
    /// threads (the whole pool by default), and waits for all of them.
    ///
    /// The requested number of threads is clamped to `1..=self.size()`.
    pub fn parallel_region(
        &mut self,
        num_threads: impl Into<Option<usize>>,
        f: impl Fn(usize) + Sync,
    ) {
        let num_threads = num_threads.into().unwrap_or(self.size());
        let mut team = Team::new(self, num_threads);
        team.execute_job(&OnceScheduler::new(team.size(), f));
    }

    /// Runs `f(i)` for each `i` in `0..total`, splitting the range into
    /// contiguous chunks of at least `min_chunk` items (4096 by default), one
    /// chunk per thread.
    ///
    /// The assignment of items to threads only depends on `total`,
    /// `min_chunk` and the number of threads.
    ///
    /// ```
    /// # use teampool::{CpuPinningPolicy, ThreadCount, ThreadPoolBuilder};
    /// # use std::sync::Mutex;
    /// # let mut thread_pool = ThreadPoolBuilder {
    /// #     num_threads: ThreadCount::try_from(4).unwrap(),
    /// #     cpu_pinning: CpuPinningPolicy::No,
    /// # }
    /// # .build();
    /// let squares = (0..1000).map(|_| Mutex::new(0)).collect::<Vec<_>>();
    /// thread_pool.parallel_for_static(squares.len(), 50, 4, |i| {
    ///     *squares[i].lock().unwrap() = i * i;
    /// });
    /// assert!(squares
    ///     .into_iter()
    ///     .enumerate()
    ///     .all(|(i, x)| x.into_inner().unwrap() == i * i));
    /// ```
    pub fn parallel_for_static(
        &mut self,
        total: usize,
        min_chunk: impl Into<Option<usize>>,
        num_threads: impl Into<Option<usize>>,
        f: impl Fn(usize) + Sync,
    ) {
        if total == 0 {
            return;
        }
        let min_chunk = min_chunk.into().unwrap_or(DEFAULT_STATIC_MIN_CHUNK);
        // The chunk count depends on the achieved pool size.
        self.instantiate_threads();
        let num_threads = num_threads
            .into()
            .unwrap_or(self.size())
            .clamp(1, self.size());
        let num_chunks = static_chunk_count(total, min_chunk, num_threads);
        log_debug!("[main thread] Static loop over {total} items in {num_chunks} chunk(s)");

        let mut team = Team::new(self, num_chunks);
        let scheduler = StaticForScheduler::new(total, min_chunk, team.size(), f);
        debug_assert_eq!(scheduler.num_chunks(), team.size());
        team.execute_job(&scheduler);
    }

    /// Runs `f(i)` for each `i` in `0..total`, with the threads claiming items
    /// one at a time from a shared cursor.
    ///
    /// This balances the load when items have uneven costs, but which thread
    /// processes which item is unspecified.
    pub fn parallel_for_dynamic(
        &mut self,
        total: usize,
        num_threads: impl Into<Option<usize>>,
        f: impl Fn(usize) + Sync,
    ) {
        if total == 0 {
            return;
        }
        let num_threads = num_threads.into().unwrap_or(self.size()).min(total);
        let mut team = Team::new(self, num_threads);
        team.execute_job(&DynamicForScheduler::new(
            total,
            DYNAMIC_CHUNK_SIZE,
            team.size(),
            f,
        ));
    }

    /// Runs a loop of `n_iterations` iterations whose "ordered" phases run one
    /// at a time in increasing order, while the "pre" and "post" phases of
    /// different iterations run in parallel.
    ///
    /// `f` is called once on each thread of the team, and must call
    /// [`OrderedContext::run()`] with the three phases.
    ///
    /// ```
    /// # use teampool::{CpuPinningPolicy, ThreadCount, ThreadPoolBuilder};
    /// # use std::sync::Mutex;
    /// # let mut thread_pool = ThreadPoolBuilder {
    /// #     num_threads: ThreadCount::try_from(2).unwrap(),
    /// #     cpu_pinning: CpuPinningPolicy::No,
    /// # }
    /// # .build();
    /// let log = Mutex::new(Vec::new());
    /// thread_pool.parallel_for_ordered(5, 2, |ctx| {
    ///     ctx.run(|_| (), |i| log.lock().unwrap().push(i), |_| ());
    /// });
    /// assert_eq!(log.into_inner().unwrap(), [0, 1, 2, 3, 4]);
    /// ```
    pub fn parallel_for_ordered(
        &mut self,
        n_iterations: usize,
        num_threads: impl Into<Option<usize>>,
        f: impl Fn(&OrderedContext) + Sync,
    ) {
        let num_threads = num_threads.into().unwrap_or(self.size());
        let mut team = Team::new(self, num_threads);
        let scheduler = OrderedScheduler::new(n_iterations, team.size());
        team.execute_job(&OnceScheduler::new(team.size(), |thread_index| {
            f(&OrderedContext::new(&scheduler, thread_index))
        }));
        drop(team);

        #[cfg(feature = "log_parallelism")]
        scheduler.print_statistics();
    }
}

/// Blocks the calling thread until all the threads of the current team have
/// called this function.
///
/// Panics with a [`ProtocolViolation`] if called outside of a job, or from a
/// thread that isn't part of the current team. All threads of the team must
/// call it the same number of times, otherwise they wait forever.
pub fn barrier() {
    let barrier = with_current_pool(|index, shared| {
        shared
            .team()
            .filter(|team| index < team.size)
            .map(|team| team.barrier)
    })
    .flatten();
    match barrier {
        Some(barrier) => {
            barrier.wait();
        }
        None => violation(ProtocolViolation::BarrierOutsideJob),
    }
}

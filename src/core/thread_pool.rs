// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A pool of persistent worker threads, spawned lazily and resizable.

use super::scheduler::{Scheduler, ShutdownScheduler};
use super::sync::{Controller, TeamInfo, WakeSignal};
use super::util::Status;
use super::worker::{with_worker_identity, WorkerThread};
use crate::macros::{log_debug, log_warn};
use crate::violation::{violation, ProtocolViolation};
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Number of threads to spawn in a thread pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadCount {
    /// Spawn the number of threads returned by
    /// [`get_hardware_concurrency()`](crate::get_hardware_concurrency).
    AvailableParallelism,
    /// Spawn the given number of threads.
    Count(NonZeroUsize),
}

impl ThreadCount {
    /// Resolves the number of threads to spawn.
    pub fn count(self) -> usize {
        match self {
            ThreadCount::AvailableParallelism => get_hardware_concurrency(),
            ThreadCount::Count(count) => count.get(),
        }
    }
}

impl TryFrom<usize> for ThreadCount {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(thread_count: usize) -> Result<Self, Self::Error> {
        let count = NonZeroUsize::try_from(thread_count)?;
        Ok(ThreadCount::Count(count))
    }
}

/// Policy to pin worker threads to CPUs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuPinningPolicy {
    /// Don't pin worker threads to CPUs.
    No,
    /// Pin each worker thread to a CPU, if CPU pinning is supported and
    /// implemented on this platform.
    IfSupported,
    /// Pin each worker thread to a CPU. If CPU pinning isn't supported on this
    /// platform (or not implemented), building a thread pool will panic.
    Always,
}

/// Returns the number of concurrent threads supported by the machine.
///
/// This value is approximate. If it cannot be determined, this returns 1.
pub fn get_hardware_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// A builder for [`ThreadPool`].
pub struct ThreadPoolBuilder {
    /// Number of worker threads in the pool.
    pub num_threads: ThreadCount,
    /// Policy to pin worker threads to CPUs.
    pub cpu_pinning: CpuPinningPolicy,
}

impl ThreadPoolBuilder {
    /// Creates a thread pool. No thread is spawned until the first job is
    /// submitted (or the pool is explicitly resized after that).
    ///
    /// ```
    /// # use teampool::{CpuPinningPolicy, ThreadCount, ThreadPoolBuilder};
    /// # use std::sync::atomic::{AtomicU64, Ordering};
    /// let mut thread_pool = ThreadPoolBuilder {
    ///     num_threads: ThreadCount::try_from(4).unwrap(),
    ///     cpu_pinning: CpuPinningPolicy::No,
    /// }
    /// .build();
    ///
    /// let sum = AtomicU64::new(0);
    /// thread_pool.parallel_for_static(1000, 50, None, |i| {
    ///     sum.fetch_add(i as u64, Ordering::Relaxed);
    /// });
    /// assert_eq!(sum.into_inner(), 999 * 1000 / 2);
    /// ```
    pub fn build(&self) -> ThreadPool {
        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        if self.cpu_pinning == CpuPinningPolicy::Always {
            panic!("Pinning threads to CPUs is not implemented on this platform.")
        }
        ThreadPool::new(self.num_threads.count(), self.cpu_pinning)
    }
}

/// A pool of worker threads that runs one job at a time.
///
/// Jobs are submitted with the `parallel_*` methods, which block the calling
/// (master) thread until the job is done. The process-wide pool used by the
/// free functions of this crate is one instance of this type, but independent
/// instances can be created with a [`ThreadPoolBuilder`].
pub struct ThreadPool {
    /// Number of threads that the pool is configured to have.
    num_threads_requested: usize,
    /// Number of threads to fall back to when the pool is torn down.
    default_num_threads: usize,
    /// Spawned worker threads. Either empty or of length
    /// `num_threads_requested`.
    workers: Vec<WorkerThread>,
    /// Synchronization with the worker threads.
    controller: Controller,
    /// Policy to pin worker threads to CPUs.
    cpu_pinning: CpuPinningPolicy,
    /// Index from which spawning a thread fails.
    #[cfg(test)]
    spawn_limit: Option<usize>,
}

impl ThreadPool {
    /// Creates a new pool of the given size, without spawning any thread.
    pub(crate) fn new(num_threads: usize, cpu_pinning: CpuPinningPolicy) -> Self {
        let num_threads = num_threads.max(1);
        Self {
            num_threads_requested: num_threads,
            default_num_threads: num_threads,
            workers: Vec::new(),
            controller: Controller::new(num_threads),
            cpu_pinning,
            #[cfg(test)]
            spawn_limit: None,
        }
    }

    /// Creates a pool with the same configuration as this one, without any
    /// spawned thread.
    pub(crate) fn fresh_copy(&self) -> Self {
        let mut pool = Self::new(self.default_num_threads, self.cpu_pinning);
        pool.num_threads_requested = self.num_threads_requested;
        pool.controller.set_pool_size(self.num_threads_requested);
        pool
    }

    /// Returns the number of threads in the pool.
    ///
    /// This is the configured number of threads, regardless of whether they
    /// have been spawned yet.
    pub fn size(&self) -> usize {
        self.num_threads_requested
    }

    /// Returns the number of worker threads actually spawned.
    pub fn num_spawned_threads(&self) -> usize {
        self.workers.len()
    }

    /// Whether a parallel region is currently running on this pool.
    pub fn in_parallel_region(&self) -> bool {
        self.controller.team_size().is_some()
    }

    /// Number of threads in the current team, or 0 if no parallel region is
    /// running.
    pub fn team_size(&self) -> usize {
        self.controller.team_size().unwrap_or(0)
    }

    /// Changes the number of threads in the pool.
    ///
    /// If no thread has been spawned yet, this only records the new size.
    /// Otherwise, threads are spawned or shut down right away. If the system
    /// refuses to spawn as many threads as requested, the pool keeps the
    /// threads that could be spawned, which is reflected by
    /// [`size()`](Self::size).
    ///
    /// Resizing to 0 shuts down all the threads, and resets the pool to its
    /// initial size, to be spawned again on the next job.
    pub fn resize(&mut self, num_threads: usize) {
        if self.in_parallel_region() {
            violation(ProtocolViolation::ResizeInsideJob);
        }
        if num_threads == 0 {
            log_debug!("[main thread] Tearing down the thread pool");
            self.shrink_to(0);
            self.set_size(self.default_num_threads);
            return;
        }

        self.set_size(num_threads);
        if !self.workers.is_empty() {
            self.instantiate_threads();
        }
    }

    fn set_size(&mut self, num_threads: usize) {
        self.num_threads_requested = num_threads;
        self.controller.set_pool_size(num_threads);
    }

    /// Spawns or shuts down threads so that the number of spawned threads
    /// matches the requested size.
    pub(crate) fn instantiate_threads(&mut self) {
        let requested = self.num_threads_requested;
        let current = self.workers.len();
        if current < requested {
            self.grow_to(requested);
        } else if current > requested {
            self.shrink_to(requested);
        }
    }

    fn grow_to(&mut self, num_threads: usize) {
        log_debug!(
            "[main thread] Spawning {} thread(s)",
            num_threads - self.workers.len()
        );
        self.workers.reserve(num_threads - self.workers.len());
        for index in self.workers.len()..num_threads {
            match self.spawn_worker(index) {
                Ok(worker) => self.workers.push(worker),
                Err(_e) => {
                    log_warn!("[main thread] Failed to spawn thread #{index}: {_e}");
                    break;
                }
            }
        }
        for worker in &self.workers {
            worker.wait_started();
        }
        let achieved = self.workers.len();
        if achieved < num_threads {
            self.set_size(achieved.max(1));
        }
        log_debug!("[main thread] Spawned threads, the pool now has {achieved} thread(s)");
    }

    fn spawn_worker(&self, index: usize) -> std::io::Result<WorkerThread> {
        #[cfg(test)]
        if self.spawn_limit.is_some_and(|limit| index >= limit) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "Resource temporarily unavailable",
            ));
        }
        WorkerThread::spawn(index, self.controller.shared(), self.cpu_pinning)
    }

    fn shrink_to(&mut self, num_threads: usize) {
        if self.workers.len() <= num_threads {
            return;
        }
        log_debug!(
            "[main thread] Shutting down {} thread(s)",
            self.workers.len() - num_threads
        );
        let signals = self.signals(self.workers.len());
        self.controller
            .run(&ShutdownScheduler::new(num_threads), &signals);
        for worker in self.workers.drain(num_threads..) {
            worker.join();
        }
    }

    /// Wake-up signals of the first `num_threads` workers.
    fn signals(&self, num_threads: usize) -> Vec<Arc<Status<WakeSignal>>> {
        self.workers[..num_threads]
            .iter()
            .map(|worker| worker.signal().clone())
            .collect()
    }

    /// Records a new active team of the given size, spawning the threads if
    /// needed. Returns the actual size of the team, clamped to the pool size.
    pub(crate) fn begin_team(&mut self, num_threads: usize) -> usize {
        if self.in_parallel_region() {
            violation(ProtocolViolation::NestedRegion);
        }
        self.instantiate_threads();
        let size = num_threads.clamp(1, self.size());
        self.controller.set_team(Some(TeamInfo::new(size)));
        size
    }

    /// Clears the active team.
    pub(crate) fn end_team(&mut self) {
        self.controller.set_team(None);
    }

    /// Runs the given scheduler on the threads of the active team, and waits
    /// until all of them have finished it.
    ///
    /// If not even one worker thread could be spawned, the calling thread runs
    /// the job itself, registered as thread 0 of a team of 1.
    pub(crate) fn execute_job(&mut self, scheduler: &(dyn Scheduler + Sync)) {
        let Some(team_size) = self.controller.team_size() else {
            violation(ProtocolViolation::NoActiveTeam);
        };
        if self.workers.is_empty() {
            log_warn!("[main thread] No worker thread available, running the job inline");
            with_worker_identity(0, self.controller.shared(), || {
                while let Some(task) = scheduler.next_task(0) {
                    task.execute(0);
                }
            });
        } else {
            let signals = self.signals(team_size.min(self.workers.len()));
            self.controller.run(scheduler, &signals);
        }

        #[cfg(feature = "log_parallelism")]
        scheduler.print_statistics();
    }
}

impl Drop for ThreadPool {
    /// Shuts down and joins all the threads in the pool.
    fn drop(&mut self) {
        self.shrink_to(0);
    }
}

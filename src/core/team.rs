// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Scoped claims on the threads of a pool.

use super::scheduler::Scheduler;
use super::thread_pool::ThreadPool;
use crate::macros::log_debug;

/// A claim on the first `size()` threads of a pool, for the duration of one
/// parallel region.
///
/// At most one team exists per pool at any time. The claim is released when
/// the team is dropped, including when a job panics.
pub struct Team<'pool> {
    pool: &'pool mut ThreadPool,
    size: usize,
}

impl<'pool> Team<'pool> {
    /// Claims `num_threads` threads of the given pool, clamped to
    /// `1..=pool.size()`. Spawns the pool's threads if needed.
    ///
    /// Panics with a [`ProtocolViolation`](crate::ProtocolViolation) if the
    /// pool already has an active team.
    pub fn new(pool: &'pool mut ThreadPool, num_threads: usize) -> Self {
        let size = pool.begin_team(num_threads);
        log_debug!("[main thread] Starting a team of {size} thread(s)");
        Self { pool, size }
    }

    /// Number of threads in this team.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Runs the given scheduler on the threads of this team, and waits until
    /// all of them have finished.
    pub fn execute_job(&mut self, scheduler: &(dyn Scheduler + Sync)) {
        self.pool.execute_job(scheduler);
    }
}

impl Drop for Team<'_> {
    fn drop(&mut self) {
        log_debug!("[main thread] Releasing the team");
        self.pool.end_team();
    }
}

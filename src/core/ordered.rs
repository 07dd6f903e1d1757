// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Scheduler for loops with a sequential section.
//!
//! An ordered loop is logically:
//!
//! ```text
//! for i in 0..n_iterations {
//!     pre(i);
//!     ordered(i);
//!     post(i);
//! }
//! ```
//!
//! where the `pre` and `post` phases of distinct iterations may run in
//! parallel and in any order, but the `ordered` phases run one at a time and
//! in increasing order of `i`.
//!
//! Iterations in flight are tracked in a ring of frames, one per thread of the
//! team. A thread that finishes a phase doesn't wait for the sequential gate:
//! it goes back to the scheduler, which hands out whichever phase is runnable,
//! preferring the next ordered phase, then post phases, then fresh pre phases.

use super::util::Status;
use crate::macros::log_debug;
#[cfg(feature = "log_parallelism")]
use crate::macros::{log_info, log_trace};

/// Phase of an ordered iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Parallel phase before the sequential section.
    Pre,
    /// Sequential section.
    Ordered,
    /// Parallel phase after the sequential section.
    Post,
}

/// A phase of one iteration, handed out to a thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OrderedTask {
    pub phase: Phase,
    pub iteration: usize,
}

/// Progress of the iteration occupying a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FrameState {
    /// The frame can receive a new iteration.
    Free,
    PreRunning,
    PreDone,
    Ordering,
    OrderedDone,
    PostRunning,
}

/// Mutable state of the scheduler, protected by a mutex.
struct OrderedState {
    /// Total number of iterations of the loop.
    n_iterations: usize,
    /// Ring of frames: iteration `i` lives in frame `i % frames.len()`.
    frames: Box<[FrameState]>,
    /// Frame whose phase is currently executed by each thread.
    assigned: Box<[Option<usize>]>,
    /// Next iteration to start the pre phase of.
    next_to_start: usize,
    /// Next iteration allowed to enter the ordered phase.
    next_to_order: usize,
    /// Whether an ordered phase is currently running.
    ordering: bool,
    /// Next iteration to start the post phase of.
    next_to_post: usize,
    /// Number of iterations whose post phase is done.
    num_finished: usize,
    /// Set when a thread panicked in the middle of the loop.
    aborted: bool,
    #[cfg(feature = "log_parallelism")]
    stats: OrderedStats,
}

/// Debugging statistics about an ordered loop.
#[cfg(feature = "log_parallelism")]
#[derive(Default)]
struct OrderedStats {
    pre: u64,
    ordered: u64,
    post: u64,
    waits: u64,
}

impl OrderedState {
    fn frame(&self, iteration: usize) -> usize {
        iteration % self.frames.len()
    }

    fn is_finished(&self) -> bool {
        self.aborted || self.num_finished >= self.n_iterations
    }

    /// Records that the phase previously handed to the given thread is done.
    fn complete(&mut self, thread_index: usize) {
        let Some(frame) = self.assigned.get_mut(thread_index).and_then(Option::take) else {
            return;
        };
        let state = &mut self.frames[frame];
        *state = match *state {
            FrameState::PreRunning => FrameState::PreDone,
            FrameState::Ordering => {
                self.ordering = false;
                self.next_to_order += 1;
                FrameState::OrderedDone
            }
            FrameState::PostRunning => {
                self.num_finished += 1;
                FrameState::Free
            }
            s => unreachable!("completed a frame in state {s:?}"),
        };
    }

    /// Returns the phase that should run next, if any is runnable right now.
    fn runnable(&self) -> Option<OrderedTask> {
        if self.aborted {
            return None;
        }
        if !self.ordering
            && self.next_to_order < self.next_to_start
            && self.frames[self.frame(self.next_to_order)] == FrameState::PreDone
        {
            return Some(OrderedTask {
                phase: Phase::Ordered,
                iteration: self.next_to_order,
            });
        }
        if self.next_to_post < self.next_to_order
            && self.frames[self.frame(self.next_to_post)] == FrameState::OrderedDone
        {
            return Some(OrderedTask {
                phase: Phase::Post,
                iteration: self.next_to_post,
            });
        }
        if self.next_to_start < self.n_iterations
            && self.frames[self.frame(self.next_to_start)] == FrameState::Free
        {
            return Some(OrderedTask {
                phase: Phase::Pre,
                iteration: self.next_to_start,
            });
        }
        None
    }

    /// Assigns the given runnable task to a thread.
    fn claim(&mut self, thread_index: usize, task: OrderedTask) {
        let frame = self.frame(task.iteration);
        self.frames[frame] = match task.phase {
            Phase::Pre => {
                self.next_to_start += 1;
                FrameState::PreRunning
            }
            Phase::Ordered => {
                self.ordering = true;
                FrameState::Ordering
            }
            Phase::Post => {
                self.next_to_post += 1;
                FrameState::PostRunning
            }
        };
        self.assigned[thread_index] = Some(frame);

        #[cfg(feature = "log_parallelism")]
        match task.phase {
            Phase::Pre => self.stats.pre += 1,
            Phase::Ordered => self.stats.ordered += 1,
            Phase::Post => self.stats.post += 1,
        }
        #[cfg(feature = "log_parallelism")]
        log_trace!(
            "[thread {thread_index}] {:?} phase of iteration {}",
            task.phase,
            task.iteration
        );
    }
}

/// Hands out the pre, ordered and post phases of an ordered loop to the
/// threads of a team.
pub struct OrderedScheduler {
    num_threads: usize,
    state: Status<OrderedState>,
}

impl OrderedScheduler {
    /// Creates a scheduler for a loop of `n_iterations` run by `num_threads`
    /// threads.
    pub fn new(n_iterations: usize, num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        Self {
            num_threads,
            state: Status::new(OrderedState {
                n_iterations,
                frames: vec![FrameState::Free; num_threads].into_boxed_slice(),
                assigned: vec![None; num_threads].into_boxed_slice(),
                next_to_start: 0,
                next_to_order: 0,
                ordering: false,
                next_to_post: 0,
                num_finished: 0,
                aborted: false,
                #[cfg(feature = "log_parallelism")]
                stats: OrderedStats::default(),
            }),
        }
    }

    /// Marks the phase previously handed to this thread as done, and returns
    /// the next phase for this thread to run.
    ///
    /// If nothing is runnable yet but the loop isn't finished, this waits
    /// until another thread makes progress. Returns [`None`] once all the
    /// iterations are finished (or the loop was aborted), or if the thread
    /// index is outside of the team.
    pub fn next_task(&self, thread_index: usize) -> Option<OrderedTask> {
        if thread_index >= self.num_threads {
            return None;
        }
        self.state.update(|state| state.complete(thread_index));

        let mut state = self.state.wait_while(|state| {
            let blocked = !state.is_finished() && state.runnable().is_none();
            #[cfg(feature = "log_parallelism")]
            if blocked {
                state.stats.waits += 1;
            }
            blocked
        });
        let task = state.runnable()?;
        state.claim(thread_index, task);
        Some(task)
    }

    /// Changes the number of iterations of the loop.
    ///
    /// The new count can't go below the number of iterations that already
    /// started, as these will run to completion regardless.
    pub fn set_iteration_count(&self, n_iterations: usize) {
        self.state.update(|state| {
            let n = n_iterations.max(state.next_to_start);
            log_debug!(
                "[ordered] Changing the iteration count from {} to {n}",
                state.n_iterations
            );
            state.n_iterations = n;
        });
    }

    /// Total number of iterations, as currently known.
    pub fn iteration_count(&self) -> usize {
        self.state.lock().n_iterations
    }

    /// Stops handing out phases, releasing all the threads waiting on this
    /// scheduler.
    pub fn abort(&self) {
        log_debug!("[ordered] Aborting the ordered loop");
        self.state.update(|state| state.aborted = true);
    }

    #[cfg(feature = "log_parallelism")]
    pub fn print_statistics(&self) {
        let state = self.state.lock();
        log_info!("Ordered scheduling statistics:");
        log_info!("- iterations: {}", state.num_finished);
        log_info!("- pre phases: {}", state.stats.pre);
        log_info!("- ordered phases: {}", state.stats.ordered);
        log_info!("- post phases: {}", state.stats.post);
        log_info!("- waits: {}", state.stats.waits);
    }
}

/// Handle given to each thread of an ordered loop.
///
/// See [`parallel_for_ordered()`](crate::parallel_for_ordered).
pub struct OrderedContext<'a> {
    scheduler: &'a OrderedScheduler,
    thread_index: usize,
}

impl<'a> OrderedContext<'a> {
    pub(crate) fn new(scheduler: &'a OrderedScheduler, thread_index: usize) -> Self {
        Self {
            scheduler,
            thread_index,
        }
    }

    /// Index of the calling thread within the team.
    pub fn thread_index(&self) -> usize {
        self.thread_index
    }

    /// Total number of iterations, as currently known.
    pub fn iteration_count(&self) -> usize {
        self.scheduler.iteration_count()
    }

    /// Changes the number of iterations of the loop. This can be called from
    /// any thread at any time, including from inside the phase functions.
    ///
    /// Iterations whose pre phase already started still run to completion, so
    /// the count is never lowered below them.
    pub fn set_iteration_count(&self, n_iterations: usize) {
        self.scheduler.set_iteration_count(n_iterations);
    }

    /// Participates in the ordered loop, running the phases handed out to this
    /// thread with the given functions, until all iterations are finished.
    ///
    /// Each thread passes its own functions, which may therefore keep mutable
    /// thread-local state. A given iteration can run its three phases on three
    /// different threads.
    pub fn run(
        &self,
        mut pre: impl FnMut(usize),
        mut ordered: impl FnMut(usize),
        mut post: impl FnMut(usize),
    ) {
        let _guard = AbortOnPanic {
            scheduler: self.scheduler,
        };
        while let Some(task) = self.scheduler.next_task(self.thread_index) {
            match task.phase {
                Phase::Pre => pre(task.iteration),
                Phase::Ordered => ordered(task.iteration),
                Phase::Post => post(task.iteration),
            }
        }
    }
}

/// Object whose destructor aborts the ordered loop if the thread is panicking,
/// so that the other threads don't wait forever on a phase that will never
/// complete.
struct AbortOnPanic<'a> {
    scheduler: &'a OrderedScheduler,
}

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.scheduler.abort();
        }
    }
}

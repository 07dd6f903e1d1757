// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Synchronization between the master thread and the worker threads.

use super::scheduler::{Scheduler, Task};
use super::util::{DynLifetimeView, LifetimeParameterized, Status};
use crate::macros::{log_debug, log_error};
use crossbeam_utils::CachePadded;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, RwLock};

/// State of a worker thread after a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    /// The thread is ready to run the next job once woken up.
    Ready,
    /// The thread received a shutdown task and must exit.
    Finished,
}

/// Status of the main thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MainStatus {
    /// The main thread is waiting for the worker threads to finish a job.
    Waiting,
    /// The main thread is ready to prepare the next job.
    Ready,
}

/// Wake-up signal of one worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeSignal {
    /// The thread was spawned but didn't reach its waiting loop yet.
    Starting,
    /// The thread is waiting for a job.
    Idle,
    /// The thread must run the current job.
    Awake,
}

/// An intermediate struct representing a `dyn Scheduler + Sync` with variable
/// lifetime. Because Rust doesn't directly support higher-kinded types, we use
/// the generic associated type of the [`LifetimeParameterized`] trait as a
/// proxy.
struct DynLifetimeSyncScheduler;

impl LifetimeParameterized for DynLifetimeSyncScheduler {
    type T<'a> = dyn Scheduler + Sync + 'a;
}

/// The team currently claiming the pool.
#[derive(Clone)]
pub struct TeamInfo {
    /// Number of threads in the team.
    pub size: usize,
    /// Barrier shared by the threads of the team.
    pub barrier: Arc<Barrier>,
}

impl TeamInfo {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            barrier: Arc::new(Barrier::new(size)),
        }
    }
}

/// Context shared between the main thread and the worker threads.
pub struct SharedContext {
    /// Number of worker threads active in the current job.
    num_active_threads: CachePadded<AtomicUsize>,
    /// Number of tasks that panicked in the current job.
    num_panicking_tasks: CachePadded<AtomicUsize>,
    /// Status of the main thread.
    main_status: Status<MainStatus>,
    /// Scheduler of the current job.
    scheduler: RwLock<DynLifetimeView<DynLifetimeSyncScheduler>>,
    /// Team currently claiming the pool, if any.
    team: RwLock<Option<TeamInfo>>,
    /// Target number of threads in the pool.
    pool_size: AtomicUsize,
}

impl SharedContext {
    /// Returns the active team, if any.
    pub fn team(&self) -> Option<TeamInfo> {
        self.team.read().unwrap().clone()
    }

    /// Target number of threads of the pool this context belongs to.
    pub fn pool_size(&self) -> usize {
        self.pool_size.load(Ordering::Relaxed)
    }
}

/// Wakes worker threads to run a job and waits for them to finish it.
pub struct Controller {
    shared: Arc<SharedContext>,
}

impl Controller {
    pub fn new(pool_size: usize) -> Self {
        Self {
            shared: Arc::new(SharedContext {
                num_active_threads: CachePadded::new(AtomicUsize::new(0)),
                num_panicking_tasks: CachePadded::new(AtomicUsize::new(0)),
                main_status: Status::new(MainStatus::Waiting),
                scheduler: RwLock::new(DynLifetimeView::empty()),
                team: RwLock::new(None),
                pool_size: AtomicUsize::new(pool_size),
            }),
        }
    }

    /// Returns a handle to the shared context, for a new worker thread.
    pub fn shared(&self) -> Arc<SharedContext> {
        self.shared.clone()
    }

    pub fn set_pool_size(&self, pool_size: usize) {
        self.shared.pool_size.store(pool_size, Ordering::Relaxed);
    }

    /// Records the given team as active (or no team). This must only be called
    /// while no job is running.
    pub fn set_team(&self, team: Option<TeamInfo>) {
        *self.shared.team.write().unwrap() = team;
    }

    pub fn team_size(&self) -> Option<usize> {
        self.shared
            .team
            .read()
            .unwrap()
            .as_ref()
            .map(|team| team.size)
    }

    /// Runs the given scheduler on the given worker threads, waiting for all of
    /// them to have drained it.
    ///
    /// Panics if any task panicked on a worker thread.
    pub fn run(&mut self, scheduler: &(dyn Scheduler + Sync), workers: &[Arc<Status<WakeSignal>>]) {
        if workers.is_empty() {
            return;
        }
        self.awaken_and_run(scheduler, workers);
        self.join();
    }

    /// Publishes the scheduler and wakes up the given worker threads.
    fn awaken_and_run(
        &mut self,
        scheduler: &(dyn Scheduler + Sync),
        workers: &[Arc<Status<WakeSignal>>],
    ) {
        let num_threads = workers.len();
        self.shared
            .num_active_threads
            .store(num_threads, Ordering::SeqCst);
        self.shared.num_panicking_tasks.store(0, Ordering::SeqCst);

        // Safety note: The reference set here is valid until the call to `clear()` in
        // `join()`, which is after all the worker threads are done reading it (as
        // synchronized with `main_status`).
        let mut view = self.shared.scheduler.write().unwrap();
        debug_assert!(!view.is_set());
        view.set(scheduler);
        drop(view);
        log_debug!("[main thread] Waking up {num_threads} thread(s).");

        for signal in workers {
            signal.notify_all(WakeSignal::Awake);
        }
    }

    /// Waits until all the woken threads report being idle.
    fn join(&mut self) {
        log_debug!("[main thread] Waiting for all threads to finish this job.");

        let mut guard = self
            .shared
            .main_status
            .wait_while(|status| *status == MainStatus::Waiting);
        assert_eq!(*guard, MainStatus::Ready);
        *guard = MainStatus::Waiting;
        drop(guard);

        // Safety note: the reference (previously set in `awaken_and_run()`) is cleared
        // here after all the worker threads are done reading it (as synchronized with
        // `main_status`).
        self.shared.scheduler.write().unwrap().clear();

        let num_panicking_tasks = self.shared.num_panicking_tasks.load(Ordering::SeqCst);
        if num_panicking_tasks != 0 {
            log_error!("[main thread] {num_panicking_tasks} task(s) panicked on worker threads!");
            panic!("{num_panicking_tasks} worker thread(s) panicked!");
        }
        log_debug!("[main thread] All threads have now finished this job.");
    }
}

/// Link between a worker thread and its pool.
pub struct WorkerLink {
    /// Thread index.
    index: usize,
    /// Wake-up signal of this thread.
    signal: Arc<Status<WakeSignal>>,
    /// Context shared with the main thread.
    shared: Arc<SharedContext>,
}

impl WorkerLink {
    pub fn new(index: usize, signal: Arc<Status<WakeSignal>>, shared: Arc<SharedContext>) -> Self {
        Self {
            index,
            signal,
            shared,
        }
    }

    pub fn shared(&self) -> &Arc<SharedContext> {
        &self.shared
    }

    /// Tells the main thread that this newly spawned thread is ready.
    pub fn report_started(&self) {
        self.signal.notify_all(WakeSignal::Idle);
    }

    /// Waits to be woken up, then runs tasks from the current scheduler until
    /// it has nothing more for this thread.
    pub fn wait_and_run(&mut self) -> WorkerState {
        let index = self.index;
        log_debug!("[thread {index}] Waiting for a job");

        let mut signal = self.signal.wait_while(|s| *s != WakeSignal::Awake);
        *signal = WakeSignal::Idle;
        drop(signal);

        log_debug!("[thread {index}] Woken up. Processing...");

        // Regardless of how the job ends for this thread, we want to notify the main
        // thread that this thread has finished working with the scheduler. This happens
        // when the notifier is dropped (whether at the end of this scope or when a
        // panic is unwound).
        let notifier = Notifier {
            #[cfg(feature = "log")]
            index,
            shared: &self.shared,
        };

        let state = {
            let guard = self.shared.scheduler.read().unwrap();
            // SAFETY:
            // - The output lifetime doesn't outlive the underlying scheduler, as the main
            //   thread waits until the [`Notifier`]s from all woken threads are dropped
            //   before clearing the reference.
            // - The underlying scheduler isn't mutated during this scope: all the threads
            //   only manipulate shared references to it.
            let scheduler = unsafe { guard.get() };
            match scheduler {
                Some(scheduler) => drain(index, scheduler, &self.shared),
                None => {
                    log_error!("[thread {index}] Woken up without a scheduler");
                    WorkerState::Ready
                }
            }
        };

        // Explicit drop for clarity.
        drop(notifier);

        state
    }
}

/// Runs tasks from the scheduler until there are none left for this thread.
fn drain(index: usize, scheduler: &(dyn Scheduler + Sync), shared: &SharedContext) -> WorkerState {
    while let Some(task) = scheduler.next_task(index) {
        if let Task::Shutdown = task {
            log_debug!("[thread {index}] Received shutdown task");
            return WorkerState::Finished;
        }
        // A panicking task doesn't take the thread down with it: the panic is reported
        // to the main thread once the job is over.
        if catch_unwind(AssertUnwindSafe(|| task.execute(index))).is_err() {
            log_error!("[thread {index}] A task panicked");
            shared.num_panicking_tasks.fetch_add(1, Ordering::SeqCst);
        }
    }
    WorkerState::Ready
}

/// Object whose destructor notifies the main thread that a worker thread has
/// finished its job (or has panicked).
struct Notifier<'a> {
    /// Thread index.
    #[cfg(feature = "log")]
    index: usize,
    /// Context shared between the main thread and the worker threads.
    shared: &'a SharedContext,
}

impl Drop for Notifier<'_> {
    fn drop(&mut self) {
        // The scheduler itself may panic, in which case the thread unwinds. The main
        // thread still needs to be notified, and must not use the pool's results.
        if std::thread::panicking() {
            log_error!(
                "[thread {}] Detected panic in this thread, notifying the main thread",
                self.index
            );
            self.shared
                .num_panicking_tasks
                .fetch_add(1, Ordering::SeqCst);
        }

        let thread_count = self
            .shared
            .num_active_threads
            .fetch_sub(1, Ordering::SeqCst);
        assert!(thread_count > 0);
        log_debug!(
            "[thread {}] Decremented the number of active threads: {}.",
            self.index,
            thread_count - 1
        );

        if thread_count == 1 {
            // We're the last thread.
            log_debug!(
                "[thread {}] We're the last thread. Waking up the main thread.",
                self.index
            );

            if let Err(e) = self.shared.main_status.try_notify_all(MainStatus::Ready) {
                log_error!(
                    "[thread {}] Failed to notify the main thread, the mutex was poisoned: {e:?}",
                    self.index
                );
                panic!("Failed to notify the main thread, the mutex was poisoned: {e:?}");
            }
        }
    }
}

// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Persistent worker threads.

use super::sync::{SharedContext, WakeSignal, WorkerLink, WorkerState};
use super::thread_pool::CpuPinningPolicy;
use super::util::Status;
use crate::macros::{log_debug, log_warn};
// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::cell::RefCell;
use std::sync::Arc;
use std::thread::JoinHandle;

thread_local! {
    /// Identity of the current thread, if it's running jobs for some pool.
    static WORKER: RefCell<Option<WorkerIdentity>> = const { RefCell::new(None) };
}

struct WorkerIdentity {
    index: usize,
    shared: Arc<SharedContext>,
}

/// Returns the index of the current worker thread within its pool, or [`None`]
/// if the current thread isn't a worker thread.
pub fn this_thread_index() -> Option<usize> {
    WORKER.with(|worker| worker.borrow().as_ref().map(|w| w.index))
}

/// Runs the given function on the shared context of the pool that the current
/// worker thread belongs to. Returns [`None`] if the current thread isn't a
/// worker thread.
pub fn with_current_pool<R>(f: impl FnOnce(usize, &SharedContext) -> R) -> Option<R> {
    WORKER.with(|worker| {
        worker
            .borrow()
            .as_ref()
            .map(|w| f(w.index, &w.shared))
    })
}

/// Runs the given function with the current thread registered as thread
/// `index` of the pool owning `shared`. The previous identity of the thread is
/// restored afterwards, including when the function panics.
pub fn with_worker_identity<R>(
    index: usize,
    shared: Arc<SharedContext>,
    f: impl FnOnce() -> R,
) -> R {
    struct Restore(Option<WorkerIdentity>);

    impl Drop for Restore {
        fn drop(&mut self) {
            let previous = self.0.take();
            WORKER.with(|worker| *worker.borrow_mut() = previous);
        }
    }

    let identity = WorkerIdentity { index, shared };
    let previous = WORKER.with(|worker| worker.replace(Some(identity)));
    let _restore = Restore(previous);
    f()
}

/// A worker thread owned by a pool.
pub struct WorkerThread {
    /// Index of this thread in the pool.
    index: usize,
    /// Wake-up signal of this thread.
    signal: Arc<Status<WakeSignal>>,
    /// Thread handle object.
    handle: JoinHandle<()>,
}

impl WorkerThread {
    /// Spawns a new worker thread with the given index.
    ///
    /// This doesn't wait for the thread to be ready to run jobs: see
    /// [`wait_started()`](Self::wait_started).
    pub fn spawn(
        index: usize,
        shared: Arc<SharedContext>,
        cpu_pinning: CpuPinningPolicy,
    ) -> std::io::Result<Self> {
        let signal = Arc::new(Status::new(WakeSignal::Starting));
        let mut link = WorkerLink::new(index, signal.clone(), shared);
        let handle = std::thread::Builder::new()
            .name(format!("teampool-{index}"))
            .spawn(move || {
                pin_to_cpu(index, cpu_pinning);
                let shared = link.shared().clone();
                with_worker_identity(index, shared, || {
                    link.report_started();
                    loop {
                        match link.wait_and_run() {
                            WorkerState::Finished => break,
                            WorkerState::Ready => continue,
                        }
                    }
                });
                log_debug!("[thread {index}] Exiting");
            })?;
        Ok(Self {
            index,
            signal,
            handle,
        })
    }

    /// Wake-up signal of this thread.
    pub fn signal(&self) -> &Arc<Status<WakeSignal>> {
        &self.signal
    }

    /// Waits until this thread is ready to receive jobs.
    pub fn wait_started(&self) {
        drop(self.signal.wait_while(|s| *s == WakeSignal::Starting));
    }

    /// Joins this thread, which must have received a shutdown task.
    pub fn join(self) {
        let _index = self.index;
        match self.handle.join() {
            Ok(()) => log_debug!("[main thread] Thread {_index} joined"),
            Err(_) => log_warn!("[main thread] Thread {_index} exited with a panic"),
        }
    }
}

#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
fn pin_to_cpu(index: usize, cpu_pinning: CpuPinningPolicy) {
    match cpu_pinning {
        CpuPinningPolicy::No => (),
        CpuPinningPolicy::IfSupported => {
            let mut cpu_set = CpuSet::new();
            if let Err(_e) = cpu_set.set(index) {
                log_warn!("Failed to set CPU affinity for thread #{index}: {_e}");
            } else if let Err(_e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
                log_warn!("Failed to set CPU affinity for thread #{index}: {_e}");
            } else {
                log_debug!("Pinned thread #{index} to CPU #{index}");
            }
        }
        CpuPinningPolicy::Always => {
            let mut cpu_set = CpuSet::new();
            if let Err(e) = cpu_set.set(index) {
                panic!("Failed to set CPU affinity for thread #{index}: {e}");
            } else if let Err(e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
                panic!("Failed to set CPU affinity for thread #{index}: {e}");
            } else {
                log_debug!("Pinned thread #{index} to CPU #{index}");
            }
        }
    }
}

#[cfg(any(
    miri,
    not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    ))
))]
fn pin_to_cpu(_index: usize, cpu_pinning: CpuPinningPolicy) {
    match cpu_pinning {
        CpuPinningPolicy::No => (),
        CpuPinningPolicy::IfSupported => {
            log_warn!("Pinning threads to CPUs is not implemented on this platform.")
        }
        // The pool checks this policy before spawning any thread.
        CpuPinningPolicy::Always => {
            unreachable!("Pinning threads to CPUs is not implemented on this platform.")
        }
    }
}

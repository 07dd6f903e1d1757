// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The process-wide thread pool, and the free functions operating on it.

use crate::core::{
    this_thread_index, with_current_pool, CpuPinningPolicy, OrderedContext, ThreadCount,
    ThreadPool, ThreadPoolBuilder,
};
use crate::macros::log_debug;
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use crate::macros::log_warn;
use crate::violation::{violation, ProtocolViolation};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Once, PoisonError};

/// The process-wide pool, created on first use.
static GLOBAL: Mutex<Option<ThreadPool>> = Mutex::new(None);

/// Set in a child process right after a fork.
static FORKED: AtomicBool = AtomicBool::new(false);

static REGISTER_FORK_HANDLER: Once = Once::new();

/// Runs the given function on the process-wide pool, creating it if needed.
fn with_global_pool<R>(f: impl FnOnce(&mut ThreadPool) -> R) -> R {
    REGISTER_FORK_HANDLER.call_once(register_fork_handler);

    // A job that panicked poisons the mutex, but its team was released so the
    // pool remains usable.
    let mut guard = GLOBAL.lock().unwrap_or_else(PoisonError::into_inner);
    if FORKED.swap(false, Ordering::SeqCst) {
        refresh_after_fork(&mut guard);
    }
    let pool = guard.get_or_insert_with(|| {
        ThreadPoolBuilder {
            num_threads: ThreadCount::AvailableParallelism,
            cpu_pinning: CpuPinningPolicy::No,
        }
        .build()
    });
    f(pool)
}

/// Replaces a pool inherited from the parent process by a fresh pool with the
/// same configuration.
///
/// The worker threads of the inherited pool don't exist in the child process,
/// so it is leaked rather than dropped: dropping it would wait forever for
/// them.
fn refresh_after_fork(slot: &mut Option<ThreadPool>) {
    if let Some(inherited) = slot.take() {
        log_debug!(
            "[main thread] Process was forked, replacing the thread pool ({} thread(s))",
            inherited.size()
        );
        *slot = Some(inherited.fresh_copy());
        std::mem::forget(inherited);
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
fn register_fork_handler() {
    unsafe extern "C" fn on_fork_child() {
        FORKED.store(true, Ordering::SeqCst);
    }

    // SAFETY: The handler only stores to an atomic, which is async-signal-safe.
    let result = unsafe {
        nix::libc::pthread_atfork(None, None, Some(on_fork_child as unsafe extern "C" fn()))
    };
    if result != 0 {
        log_warn!("Failed to register the fork handler (error {result})");
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
fn register_fork_handler() {}

/// Sets the number of threads of the process-wide pool.
///
/// If the pool didn't spawn any thread yet, this only records the new size.
/// Otherwise threads are spawned or shut down right away. Resizing to 0 shuts
/// down all the threads, which are spawned again on the next job with the
/// default size ([`get_hardware_concurrency()`](crate::get_hardware_concurrency)).
///
/// Panics with a [`ProtocolViolation`] if called from a worker thread.
pub fn resize(num_threads: usize) {
    if this_thread_index().is_some() {
        violation(ProtocolViolation::ResizeInsideJob);
    }
    with_global_pool(|pool| pool.resize(num_threads));
}

/// Number of threads in the pool that the current thread belongs to, or in
/// the process-wide pool when called from outside of any pool.
pub fn num_threads_in_pool() -> usize {
    with_current_pool(|_, shared| shared.pool_size())
        .unwrap_or_else(|| with_global_pool(|pool| pool.size()))
}

/// Number of threads in the current team, when called from a worker thread
/// inside a job. Returns 0 otherwise.
pub fn num_threads_in_team() -> usize {
    with_current_pool(|_, shared| shared.team().map_or(0, |team| team.size)).unwrap_or(0)
}

/// Number of threads that a job can use from the current context: the team
/// size inside a job, the pool size otherwise.
pub fn num_threads_available() -> usize {
    with_current_pool(|_, shared| {
        shared
            .team()
            .map_or_else(|| shared.pool_size(), |team| team.size)
    })
    .unwrap_or_else(|| with_global_pool(|pool| pool.size()))
}

/// Panics if the calling thread is a worker thread, which means that a job
/// is already running.
fn assert_not_nested() {
    if this_thread_index().is_some() {
        violation(ProtocolViolation::NestedRegion);
    }
}

/// Runs `f(thread_index)` once on each thread of a team of `num_threads`
/// threads of the process-wide pool (the whole pool by default).
///
/// See [`ThreadPool::parallel_region()`].
pub fn parallel_region(num_threads: impl Into<Option<usize>>, f: impl Fn(usize) + Sync) {
    assert_not_nested();
    with_global_pool(|pool| pool.parallel_region(num_threads, f));
}

/// Runs `f(i)` for each `i` in `0..total` on the process-wide pool, with a
/// static partition of the range.
///
/// See [`ThreadPool::parallel_for_static()`].
pub fn parallel_for_static(
    total: usize,
    min_chunk: impl Into<Option<usize>>,
    num_threads: impl Into<Option<usize>>,
    f: impl Fn(usize) + Sync,
) {
    assert_not_nested();
    with_global_pool(|pool| pool.parallel_for_static(total, min_chunk, num_threads, f));
}

/// Runs `f(i)` for each `i` in `0..total` on the process-wide pool, with the
/// threads claiming items dynamically.
///
/// See [`ThreadPool::parallel_for_dynamic()`].
pub fn parallel_for_dynamic(
    total: usize,
    num_threads: impl Into<Option<usize>>,
    f: impl Fn(usize) + Sync,
) {
    assert_not_nested();
    with_global_pool(|pool| pool.parallel_for_dynamic(total, num_threads, f));
}

/// Runs an ordered loop on the process-wide pool.
///
/// See [`ThreadPool::parallel_for_ordered()`].
pub fn parallel_for_ordered(
    n_iterations: usize,
    num_threads: impl Into<Option<usize>>,
    f: impl Fn(&OrderedContext) + Sync,
) {
    assert_not_nested();
    with_global_pool(|pool| pool.parallel_for_ordered(n_iterations, num_threads, f));
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::barrier;
    use crate::core::get_hardware_concurrency;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::atomic::AtomicUsize;

    /// Serializes the tests that change the size of the process-wide pool.
    static SERIAL: Mutex<()> = Mutex::new(());

    fn panic_message(result: std::thread::Result<()>) -> String {
        let payload = result.unwrap_err();
        match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(payload) => payload.downcast::<&str>().unwrap().to_string(),
        }
    }

    #[test]
    fn test_global_resize() {
        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);

        resize(3);
        assert_eq!(num_threads_in_pool(), 3);
        assert_eq!(num_threads_available(), 3);
        assert_eq!(num_threads_in_team(), 0);

        let hits = AtomicUsize::new(0);
        parallel_region(None, |_| {
            assert_eq!(num_threads_in_pool(), 3);
            assert_eq!(num_threads_in_team(), 3);
            assert_eq!(num_threads_available(), 3);
            hits.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(hits.into_inner(), 3);

        resize(3);
        assert_eq!(num_threads_in_pool(), 3);

        resize(0);
        assert_eq!(num_threads_in_pool(), get_hardware_concurrency());
    }

    #[test]
    fn test_global_jobs() {
        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        resize(4);

        let slots = (0..1000).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>();
        parallel_for_static(1000, 50, 4, |i| {
            slots[i].store(i * i, Ordering::Relaxed);
        });
        assert!(slots
            .iter()
            .enumerate()
            .all(|(s, x)| x.load(Ordering::Relaxed) == s * s));

        let sum = AtomicUsize::new(0);
        parallel_for_dynamic(1000, None, |i| {
            sum.fetch_add(i, Ordering::Relaxed);
        });
        assert_eq!(sum.into_inner(), 999 * 1000 / 2);

        let log = Mutex::new(Vec::new());
        parallel_for_ordered(5, 2, |ctx| {
            ctx.run(|_| (), |i| log.lock().unwrap().push(i), |_| ());
        });
        assert_eq!(log.into_inner().unwrap(), [0, 1, 2, 3, 4]);

        parallel_region(2, |i| {
            assert_eq!(this_thread_index(), Some(i));
            assert_eq!(num_threads_in_team(), 2);
            barrier();
        });
    }

    #[test]
    fn test_nested_region_is_a_violation() {
        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        resize(2);

        let messages = Mutex::new(Vec::new());
        parallel_region(2, |_| {
            let result = catch_unwind(AssertUnwindSafe(|| parallel_region(2, |_| ())));
            messages.lock().unwrap().push(panic_message(result));
        });
        let messages = messages.into_inner().unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages
            .iter()
            .all(|m| m == "protocol violation: nested parallel regions are not supported"));
    }

    #[test]
    fn test_resize_inside_job_is_a_violation() {
        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        resize(2);

        let messages = Mutex::new(Vec::new());
        parallel_region(1, |_| {
            let result = catch_unwind(|| resize(4));
            messages.lock().unwrap().push(panic_message(result));
        });
        assert_eq!(
            messages.into_inner().unwrap(),
            ["protocol violation: cannot resize the thread pool from inside a parallel region"]
        );
        assert_eq!(num_threads_in_pool(), 2);
    }

    #[test]
    fn test_global_pool_survives_panics() {
        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        resize(2);

        let result = catch_unwind(|| {
            parallel_for_dynamic(10, None, |i| {
                if i == 5 {
                    panic!("arithmetic panic");
                }
            })
        });
        assert_eq!(panic_message(result), "1 worker thread(s) panicked!");

        let hits = AtomicUsize::new(0);
        parallel_region(2, |_| {
            hits.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(hits.into_inner(), 2);
    }

    #[test]
    fn test_refresh_after_fork() {
        let mut slot = Some(
            ThreadPoolBuilder {
                num_threads: ThreadCount::try_from(2).unwrap(),
                cpu_pinning: CpuPinningPolicy::No,
            }
            .build(),
        );
        if let Some(pool) = slot.as_mut() {
            pool.resize(3);
            pool.parallel_region(None, |_| ());
            assert_eq!(pool.num_spawned_threads(), 3);
        }

        refresh_after_fork(&mut slot);
        let pool = slot.as_mut().unwrap();
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.num_spawned_threads(), 0);
        assert!(!pool.in_parallel_region());

        // The fresh pool spawns its own threads on demand.
        let hits = AtomicUsize::new(0);
        pool.parallel_region(None, |_| {
            hits.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(hits.into_inner(), 3);

        let mut empty = None;
        refresh_after_fork(&mut empty);
        assert!(empty.is_none());
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
    #[test]
    fn test_forked_child_gets_a_fresh_pool() {
        use nix::libc;

        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        resize(3);
        parallel_region(None, |_| ());

        // SAFETY: The child only runs jobs on the process-wide pool, and exits
        // with `_exit()` without returning to the test harness.
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0, "fork() failed");
        if pid == 0 {
            let result = catch_unwind(|| {
                let hits = AtomicUsize::new(0);
                parallel_region(None, |_| {
                    hits.fetch_add(1, Ordering::Relaxed);
                });
                (hits.into_inner(), num_threads_in_pool())
            });
            let code = match result {
                Ok((3, 3)) => 0,
                Ok(_) => 1,
                Err(_) => 2,
            };
            // SAFETY: Terminates the child process right away.
            unsafe { libc::_exit(code) };
        }

        let mut status = 0;
        // SAFETY: `pid` is a child of this process, and `status` is a valid
        // pointer.
        let waited = unsafe { libc::waitpid(pid, &mut status, 0) };
        assert_eq!(waited, pid);
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), 0);

        // The parent keeps its own threads.
        let hits = AtomicUsize::new(0);
        parallel_region(None, |_| {
            hits.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(hits.into_inner(), 3);
        assert_eq!(num_threads_in_pool(), 3);
    }
}

// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![doc = include_str!("../README.md")]
#![forbid(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

mod core;
mod global;
mod macros;
mod violation;

pub use crate::core::{
    barrier, get_hardware_concurrency, this_thread_index, CpuPinningPolicy, OrderedContext,
    ThreadCount, ThreadPool, ThreadPoolBuilder,
};
pub use global::{
    num_threads_available, num_threads_in_pool, num_threads_in_team, parallel_for_dynamic,
    parallel_for_ordered, parallel_for_static, parallel_region, resize,
};
pub use violation::ProtocolViolation;

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn pool(num_threads: usize) -> ThreadPool {
        ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(num_threads).unwrap(),
            cpu_pinning: CpuPinningPolicy::No,
        }
        .build()
    }

    #[test]
    fn test_master_thread_outside_pool() {
        assert_eq!(this_thread_index(), None);
        assert_eq!(num_threads_in_team(), 0);
        assert!(get_hardware_concurrency() >= 1);
    }

    #[test]
    fn test_many_jobs_on_one_pool() {
        let mut pool = pool(4);
        let sum = AtomicU64::new(0);
        for round in 0..100u64 {
            pool.parallel_for_static(1000, 10, None, |i| {
                sum.fetch_add(i as u64 + round, Ordering::Relaxed);
            });
        }
        let expected = 100 * (999 * 1000 / 2) + 1000 * (99 * 100 / 2);
        assert_eq!(sum.into_inner(), expected);
    }

    #[test]
    fn test_jobs_with_resize_in_between() {
        let mut pool = pool(2);
        for num_threads in [1, 4, 3, 8, 2, 0, 5] {
            pool.resize(num_threads);
            let hits = AtomicUsize::new(0);
            pool.parallel_region(None, |_| {
                hits.fetch_add(1, Ordering::Relaxed);
            });
            let expected = if num_threads == 0 { 2 } else { num_threads };
            assert_eq!(hits.into_inner(), expected);
            assert_eq!(pool.num_spawned_threads(), expected);
        }
    }

    #[test]
    fn test_region_with_barriers() {
        let mut pool = pool(4);
        let phases = Mutex::new(Vec::new());
        pool.parallel_region(None, |i| {
            for phase in 0..3 {
                phases.lock().unwrap().push((phase, i));
                barrier();
            }
        });
        let phases = phases.into_inner().unwrap();
        assert_eq!(phases.len(), 12);
        // No thread enters a phase before all threads finished the previous one.
        assert!(phases.windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[test]
    fn test_ordered_with_thread_local_state() {
        let mut pool = pool(3);
        let log = Mutex::new(Vec::new());
        let pre_counts = Mutex::new(Vec::new());
        pool.parallel_for_ordered(50, None, |ctx| {
            let mut count = 0usize;
            ctx.run(|_| count += 1, |i| log.lock().unwrap().push(i), |_| ());
            pre_counts.lock().unwrap().push(count);
        });
        assert_eq!(log.into_inner().unwrap(), (0..50).collect::<Vec<_>>());
        assert_eq!(pre_counts.into_inner().unwrap().iter().sum::<usize>(), 50);
    }

    #[test]
    fn test_protocol_violation_is_an_error() {
        let error: Box<dyn std::error::Error> = Box::new(ProtocolViolation::BarrierOutsideJob);
        assert_eq!(
            error.to_string(),
            "protocol violation: barrier() can only be called by a team member inside a job"
        );
    }
}

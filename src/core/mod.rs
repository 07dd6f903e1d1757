// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Core engine: thread pool, teams, schedulers and synchronization primitives.

mod ordered;
mod parallel;
mod scheduler;
mod sync;
mod team;
mod thread_pool;
mod util;
mod worker;

pub use ordered::OrderedContext;
pub use parallel::barrier;
pub use thread_pool::{
    get_hardware_concurrency, CpuPinningPolicy, ThreadCount, ThreadPool, ThreadPoolBuilder,
};
pub use worker::this_thread_index;
pub(crate) use worker::with_current_pool;

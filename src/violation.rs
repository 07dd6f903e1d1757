// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Misuses of the thread pool API.

use crate::macros::log_error;
use std::fmt;

/// A use of the API outside of its contract.
///
/// These indicate a bug in the calling code rather than a runtime condition,
/// so they are never returned as errors: the offending call panics with the
/// [`Display`](fmt::Display) message of the violation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// A job was submitted to the pool without an active team.
    NoActiveTeam,
    /// A parallel region was started while another one is active, for example
    /// from inside a task running on a worker thread.
    NestedRegion,
    /// [`barrier()`](crate::barrier) was called outside of a job, or from a
    /// thread that isn't part of the current team.
    BarrierOutsideJob,
    /// The pool was resized from a worker thread, while a job is running.
    ResizeInsideJob,
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            ProtocolViolation::NoActiveTeam => "cannot execute a job without an active team",
            ProtocolViolation::NestedRegion => "nested parallel regions are not supported",
            ProtocolViolation::BarrierOutsideJob => {
                "barrier() can only be called by a team member inside a job"
            }
            ProtocolViolation::ResizeInsideJob => {
                "cannot resize the thread pool from inside a parallel region"
            }
        };
        write!(f, "protocol violation: {message}")
    }
}

impl std::error::Error for ProtocolViolation {}

/// Reports the given violation and panics.
#[cold]
#[track_caller]
pub(crate) fn violation(v: ProtocolViolation) -> ! {
    log_error!("{v}");
    panic!("{v}");
}

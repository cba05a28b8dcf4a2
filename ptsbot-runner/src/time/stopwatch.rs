// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stopwatch for tracking how long attempts take.
//!
//! Attempts track a start time and a duration. For that we use a combination of a
//! `DateTime<Local>` (realtime clock, for reporting) and an `Instant` (monotonic clock, for
//! deadlines and elapsed time).

use chrono::{DateTime, Local};
use std::time::{Duration, Instant};

pub(crate) fn stopwatch() -> StopwatchStart {
    StopwatchStart::new()
}

/// The start state of a stopwatch.
#[derive(Clone, Debug)]
pub(crate) struct StopwatchStart {
    start_time: DateTime<Local>,
    instant: Instant,
}

impl StopwatchStart {
    fn new() -> Self {
        Self {
            start_time: Local::now(),
            instant: Instant::now(),
        }
    }

    /// Returns the instant at which `budget` runs out.
    pub(crate) fn deadline(&self, budget: Duration) -> Instant {
        self.instant + budget
    }

    pub(crate) fn snapshot(&self) -> StopwatchSnapshot {
        StopwatchSnapshot {
            start_time: self.start_time,
            duration: self.instant.elapsed(),
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct StopwatchSnapshot {
    pub(crate) start_time: DateTime<Local>,
    pub(crate) duration: Duration,
}

// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

mod stopwatch;

pub(crate) use stopwatch::{StopwatchSnapshot, StopwatchStart, stopwatch};

// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test-case statuses, status history and regression detection.

mod history;
mod regression;
mod status;

pub use history::*;
pub use regression::*;
pub use status::*;

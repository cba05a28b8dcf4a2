// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end tests driving [`ptsbot_runner::orchestrator::BatchRunner`] against scripted fakes.

mod batch;
mod fixtures;
mod ordering;

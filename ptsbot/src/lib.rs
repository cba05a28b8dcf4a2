// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Unattended Bluetooth qualification runs.
//!
//! `ptsbot` drives a remote qualification tool through a catalog of test cases, answers the
//! tool's operator prompts automatically and tracks regressions across runs. The orchestration
//! itself lives in [`ptsbot_runner`]; this crate is the command-line front end.

#![warn(missing_docs)]

mod dispatch;
mod errors;
mod output;

#[doc(hidden)]
pub use dispatch::*;
#[doc(hidden)]
pub use errors::*;
#[doc(hidden)]
pub use output::OutputContext;

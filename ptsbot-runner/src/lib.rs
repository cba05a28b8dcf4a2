// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for ptsbot, the Bluetooth qualification test bot.
//!
//! ptsbot drives a remote qualification tool against a device under test (the IUT). The tool
//! runs scripted test cases and, while a case is running, asks the bot to act through numbered
//! *work items* ("make the IUT connectable", "verify the value at handle 0x0012", ...). This
//! crate contains the parts of that loop that have real concurrency concerns:
//!
//! * [`session`]: one listener thread per remote-tool session, answering work items.
//! * [`dispatch`]: resolving a work item to an edit value, a verification predicate or a
//!   registered handler, with at-most-once delivery per callback id.
//! * [`sync`]: the pending-response registry and the condition-variable rendezvous used to
//!   order scripted steps against callbacks.
//! * [`executor`]: running a single test-case attempt.
//! * [`orchestrator`]: running a whole batch across device configurations, with retries.
//! * [`reporter`]: statuses, history and regressions.

pub mod catalog;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod errors;
pub mod executor;
pub mod handlers;
pub mod orchestrator;
pub mod reporter;
pub mod session;
pub mod state;
pub mod sync;
mod time;

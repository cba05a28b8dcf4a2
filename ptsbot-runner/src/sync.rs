// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The pending-response synchronizer.
//!
//! The main thread (running scripted steps) and the session listener threads (answering
//! callbacks) meet here. There are three kinds of rendezvous:
//!
//! * **Expectations**: the main thread declares that it is about to trigger callback `N`. This
//!   only affects diagnostics; unsolicited callbacks are still dispatched.
//! * **Gates** (`before_callback = N`): registered at the start of an attempt. A listener that
//!   receives callback `N` blocks in [`Synchronizer::wait_gate`] until the step it is gated on
//!   has run.
//! * **Processed marks** (`after_callback = N`): a listener marks `N` processed once its
//!   response is ready, and the main thread blocks in [`Synchronizer::wait_processed`].
//!
//! [`Synchronizer::reset`] clears everything between attempts and wakes every waiter, so a
//! thread blocked on behalf of a finished attempt never waits on the next one.

use std::{
    collections::{HashMap, HashSet},
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::Instant,
};
use tracing::debug;

/// What the main thread registered for a callback id.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Expectation {
    /// The main thread is about to trigger this callback.
    Expected,

    /// A step must run before this callback is answered.
    AwaitingSignal,
}

/// The result of a blocking wait on the synchronizer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitOutcome {
    /// The condition being waited for happened.
    Satisfied,

    /// The synchronizer was reset while waiting: the attempt is over.
    Reset,

    /// The deadline passed.
    TimedOut,
}

impl WaitOutcome {
    /// Returns true if the condition being waited for happened.
    pub fn is_satisfied(self) -> bool {
        self == Self::Satisfied
    }
}

#[derive(Debug, Default)]
struct SyncState {
    generation: u64,
    pending: HashMap<u32, Expectation>,
    closed_gates: HashSet<u32>,
    processed: HashSet<u32>,
    waiting: usize,
}

/// Cross-thread handshake between scripted steps and callback listeners.
///
/// One instance is shared by every session of a batch.
#[derive(Debug, Default)]
pub struct Synchronizer {
    state: Mutex<SyncState>,
    cond: Condvar,
}

impl Synchronizer {
    /// Creates a new, empty synchronizer.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declares that callback `id` is about to be triggered.
    ///
    /// Returns false if an expectation for `id` is already outstanding; the existing one is
    /// kept.
    pub fn expect(&self, id: u32) -> bool {
        let mut state = self.lock();
        if state.pending.contains_key(&id) {
            return false;
        }
        state.pending.insert(id, Expectation::Expected);
        true
    }

    /// Drops outstanding expectations for these ids. Gates are left alone.
    pub fn clear(&self, ids: impl IntoIterator<Item = u32>) {
        let mut state = self.lock();
        for id in ids {
            if state.pending.get(&id) == Some(&Expectation::Expected) {
                state.pending.remove(&id);
            }
        }
    }

    /// Returns true if anything is registered for `id`.
    pub fn is_expected(&self, id: u32) -> bool {
        self.lock().pending.contains_key(&id)
    }

    /// Returns what is registered for `id`, if anything.
    pub fn expectation(&self, id: u32) -> Option<Expectation> {
        self.lock().pending.get(&id).copied()
    }

    /// Consumes a plain expectation for `id` now that the callback has arrived, returning
    /// what was registered. Gate registrations are consumed by [`Self::release`] instead.
    pub fn fulfill(&self, id: u32) -> Option<Expectation> {
        let mut state = self.lock();
        match state.pending.get(&id).copied() {
            Some(Expectation::Expected) => state.pending.remove(&id),
            other => other,
        }
    }

    /// Closes the gate for callback `id`: a listener receiving it will block until
    /// [`Self::release`] is called.
    pub fn gate(&self, id: u32) {
        let mut state = self.lock();
        state.closed_gates.insert(id);
        state.pending.insert(id, Expectation::AwaitingSignal);
    }

    /// Opens the gate for callback `id`, waking a listener blocked on it.
    pub fn release(&self, id: u32) {
        let mut state = self.lock();
        state.closed_gates.remove(&id);
        if state.pending.get(&id) == Some(&Expectation::AwaitingSignal) {
            state.pending.remove(&id);
        }
        drop(state);
        self.cond.notify_all();
    }

    /// Opens every gate. Used when the remaining steps of an attempt are skipped, so that the
    /// tool isn't left waiting on a callback whose step will never run.
    pub fn release_all_gates(&self) {
        let mut state = self.lock();
        let gates: Vec<_> = state.closed_gates.drain().collect();
        for id in gates {
            if state.pending.get(&id) == Some(&Expectation::AwaitingSignal) {
                state.pending.remove(&id);
            }
        }
        drop(state);
        self.cond.notify_all();
    }

    /// Returns true if the gate for `id` is closed.
    pub fn is_gated(&self, id: u32) -> bool {
        self.lock().closed_gates.contains(&id)
    }

    /// Blocks until the gate for `id` is open. Returns immediately if no gate was registered.
    pub fn wait_gate(&self, id: u32, deadline: Instant) -> WaitOutcome {
        self.wait_until(deadline, |state| !state.closed_gates.contains(&id))
    }

    /// Records that callback `id` has been answered in this attempt, waking waiters.
    pub fn mark_processed(&self, id: u32) {
        self.lock().processed.insert(id);
        self.cond.notify_all();
    }

    /// Blocks until callback `id` has been answered in this attempt.
    pub fn wait_processed(&self, id: u32, deadline: Instant) -> WaitOutcome {
        self.wait_until(deadline, |state| state.processed.contains(&id))
    }

    /// Clears all expectations, gates and processed marks, and wakes every waiter.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.generation += 1;
        state.pending.clear();
        state.closed_gates.clear();
        state.processed.clear();
        debug!(
            generation = state.generation,
            waiters = state.waiting,
            "synchronizer reset"
        );
        drop(state);
        self.cond.notify_all();
    }

    fn wait_until(&self, deadline: Instant, done: impl Fn(&SyncState) -> bool) -> WaitOutcome {
        let mut state = self.lock();
        let generation = state.generation;
        state.waiting += 1;
        let outcome = loop {
            if state.generation != generation {
                break WaitOutcome::Reset;
            }
            if done(&state) {
                break WaitOutcome::Satisfied;
            }
            let now = Instant::now();
            if now >= deadline {
                break WaitOutcome::TimedOut;
            }
            state = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        };
        state.waiting -= 1;
        outcome
    }

    #[cfg(test)]
    fn waiting(&self) -> usize {
        self.lock().waiting
    }
}

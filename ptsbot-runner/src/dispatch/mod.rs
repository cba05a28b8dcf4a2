// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The work-item dispatch bridge.
//!
//! While a test case runs, the remote tool asks the bot to act through numbered callbacks
//! (work items). Session listener threads hand every callback to [`DispatchBridge::dispatch`],
//! which resolves it against the active test case:
//!
//! 1. an *edit* entry answers with a literal or produced value;
//! 2. a *verify* entry answers with a predicate over the description, and a false result fails
//!    the test case;
//! 3. the test case's generic [`HandlerRegistry`] answers by callback id;
//! 4. otherwise the bridge fails closed: it answers [`WorkItemResponse::Undefined`] and the
//!    test case becomes inconclusive.
//!
//! A callback id is never handled twice at the same time. A duplicate arriving on the same
//! session while the first is still being handled shares its response; one arriving on another
//! session waits and is then dispatched on its own. Callbacks arriving after the first was
//! answered are dispatched again, since the tool repeats ids with different descriptions.

mod registry;

pub use registry::*;

use crate::{
    catalog::TestCase,
    device::DeviceHandle,
    errors::{DisplayErrorChain, HandlerError, panic_message},
    executor::{AttemptFailure, FailureKind},
    state::SharedState,
    sync::{Expectation, Synchronizer, WaitOutcome},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::Instant,
};
use tracing::{debug, error, info, warn};

/// A callback from the remote tool.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct WorkItem {
    /// The work-item id.
    pub id: u32,

    /// Free-text description. Handlers parse what they need out of it.
    pub description: String,

    /// The name of the tool test case that raised the callback.
    pub test_case: String,
}

impl WorkItem {
    /// Creates a new work item.
    pub fn new(id: u32, description: impl Into<String>, test_case: impl Into<String>) -> Self {
        Self {
            id,
            description: description.into(),
            test_case: test_case.into(),
        }
    }
}

/// The answer to a callback.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", tag = "kind", content = "value")]
pub enum WorkItemResponse {
    /// A yes/no answer, e.g. to a verification query.
    Bool(bool),

    /// A value to enter, e.g. a passkey or an address.
    Value(String),

    /// No answer could be produced.
    Undefined,
}

impl WorkItemResponse {
    /// A successful action with nothing else to report.
    pub const OK: Self = Self::Bool(true);

    /// The response returned when a handler fails.
    pub const NEGATIVE: Self = Self::Bool(false);
}

impl fmt::Display for WorkItemResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{value}"),
            Self::Value(value) => write!(f, "`{value}`"),
            Self::Undefined => f.write_str("undefined"),
        }
    }
}

/// A callback id currently being handled.
#[derive(Copy, Clone, Debug)]
struct InFlight {
    session: usize,
    ticket: u64,
}

#[derive(Debug)]
struct ActiveAttempt {
    case: Arc<TestCase>,
    attempt: u32,
    deadline: Instant,
    in_flight: HashMap<u32, InFlight>,
    /// Responses by ticket, for duplicates that waited on an in-flight callback.
    answers: HashMap<u64, WorkItemResponse>,
    next_ticket: u64,
    failures: Vec<AttemptFailure>,
}

/// A callback this listener has claimed for dispatch in a given attempt.
struct Claim {
    case: Arc<TestCase>,
    attempt: u32,
    generation: u64,
    deadline: Instant,
    ticket: u64,
}

#[derive(Debug, Default)]
struct BridgeState {
    generation: u64,
    active: Option<ActiveAttempt>,
}

/// Resolves callbacks to responses for the test case currently running.
///
/// Shared by the main thread (which activates and deactivates attempts) and every session
/// listener (which dispatches callbacks).
#[derive(Debug)]
pub struct DispatchBridge {
    device: DeviceHandle,
    state: SharedState,
    sync: Arc<Synchronizer>,
    inner: Mutex<BridgeState>,
    cond: Condvar,
}

impl DispatchBridge {
    /// Creates a new bridge.
    pub fn new(device: DeviceHandle, state: SharedState, sync: Arc<Synchronizer>) -> Self {
        Self {
            device,
            state,
            sync,
            inner: Mutex::new(BridgeState::default()),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BridgeState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes `case` the active test case for `attempt`. Callbacks still in flight for a previous
    /// attempt are no longer recorded.
    pub fn activate(&self, case: Arc<TestCase>, attempt: u32, deadline: Instant) {
        let mut inner = self.lock();
        inner.generation += 1;
        inner.active = Some(ActiveAttempt {
            case,
            attempt,
            deadline,
            in_flight: HashMap::new(),
            answers: HashMap::new(),
            next_ticket: 0,
            failures: Vec::new(),
        });
        drop(inner);
        self.cond.notify_all();
    }

    /// Ends the active attempt, returning the failures recorded while dispatching for it.
    pub fn deactivate(&self) -> Vec<AttemptFailure> {
        let mut inner = self.lock();
        inner.generation += 1;
        let failures = inner
            .active
            .take()
            .map(|active| active.failures)
            .unwrap_or_default();
        drop(inner);
        self.cond.notify_all();
        failures
    }

    /// Returns a snapshot of the failures recorded so far for the active attempt.
    pub fn failures(&self) -> Vec<AttemptFailure> {
        self.lock()
            .active
            .as_ref()
            .map(|active| active.failures.clone())
            .unwrap_or_default()
    }

    /// Answers a callback received on session `session`.
    pub fn dispatch(&self, session: usize, item: &WorkItem) -> WorkItemResponse {
        let wid = item.id;
        let mut inner = self.lock();
        let generation = inner.generation;

        let Some(active) = inner.active.as_ref() else {
            warn!(
                session,
                wid,
                test_case = %item.test_case,
                "session desync: callback arrived with no active test case"
            );
            return WorkItemResponse::Undefined;
        };

        if !active.case.answers_to(&item.test_case) {
            warn!(
                session,
                wid,
                test_case = %item.test_case,
                active = active.case.id(),
                "session desync: callback is for a different test case, handling anyway"
            );
        }

        let deadline = active.deadline;

        let mut waited = false;
        loop {
            if inner.generation != generation {
                debug!(session, wid, "attempt ended while callback was waiting");
                return WorkItemResponse::Undefined;
            }
            let Some(active) = inner.active.as_mut() else {
                return WorkItemResponse::Undefined;
            };

            match active.in_flight.get(&wid).copied() {
                Some(first) if first.session == session => {
                    debug!(session, wid, "duplicate callback, sharing the in-flight response");
                    return self.wait_for_answer(inner, generation, first.ticket, deadline);
                }
                Some(first) => {
                    if !waited {
                        debug!(
                            session,
                            wid,
                            other = first.session,
                            "callback is being handled for another session, waiting"
                        );
                        waited = true;
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return WorkItemResponse::Undefined;
                    }
                    inner = self
                        .cond
                        .wait_timeout(inner, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                None => {
                    let ticket = active.next_ticket;
                    active.next_ticket += 1;
                    active.in_flight.insert(wid, InFlight { session, ticket });
                    let claim = Claim {
                        case: active.case.clone(),
                        attempt: active.attempt,
                        generation,
                        deadline,
                        ticket,
                    };
                    drop(inner);
                    return self.dispatch_claimed(session, item, claim);
                }
            }
        }
    }

    fn dispatch_claimed(&self, session: usize, item: &WorkItem, claim: Claim) -> WorkItemResponse {
        let Claim {
            case,
            attempt,
            generation,
            deadline,
            ticket,
        } = claim;
        let wid = item.id;

        match self.sync.fulfill(wid) {
            Some(Expectation::Expected) => debug!(session, wid, "received expected callback"),
            Some(Expectation::AwaitingSignal) => {
                info!(session, wid, "holding callback until its step has run");
                match self.sync.wait_gate(wid, deadline) {
                    WaitOutcome::Satisfied => {}
                    WaitOutcome::Reset => {
                        debug!(session, wid, "attempt ended while callback was held")
                    }
                    WaitOutcome::TimedOut => {
                        warn!(session, wid, "attempt deadline passed while callback was held")
                    }
                }
            }
            None => debug!(session, wid, "received unsolicited callback"),
        }

        debug!(
            session,
            wid,
            attempt,
            description = %item.description,
            "dispatching callback"
        );
        let (response, failure) = self.resolve(&case, item);
        if let Some(failure) = &failure {
            match failure.kind {
                FailureKind::VerificationFailure => {
                    warn!(session, wid, test_case = case.id(), "{}", failure.message)
                }
                _ => error!(
                    session,
                    wid,
                    test_case = case.id(),
                    description = %item.description,
                    "{}",
                    failure.message
                ),
            }
        }

        let mut inner = self.lock();
        if inner.generation == generation
            && let Some(active) = inner.active.as_mut()
        {
            active.in_flight.remove(&wid);
            active.answers.insert(ticket, response.clone());
            active.failures.extend(failure);
            // Marking under the bridge lock keeps a late mark from leaking into the next
            // attempt.
            self.sync.mark_processed(wid);
        } else {
            debug!(session, wid, "attempt ended before callback was answered");
        }
        drop(inner);
        self.cond.notify_all();

        debug!(session, wid, %response, "answered callback");
        response
    }

    fn wait_for_answer(
        &self,
        mut inner: MutexGuard<'_, BridgeState>,
        generation: u64,
        ticket: u64,
        deadline: Instant,
    ) -> WorkItemResponse {
        loop {
            if inner.generation != generation {
                return WorkItemResponse::Undefined;
            }
            let answer = inner
                .active
                .as_ref()
                .and_then(|active| active.answers.get(&ticket));
            if let Some(response) = answer {
                return response.clone();
            }
            let now = Instant::now();
            if now >= deadline {
                return WorkItemResponse::Undefined;
            }
            inner = self
                .cond
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn resolve(
        &self,
        case: &TestCase,
        item: &WorkItem,
    ) -> (WorkItemResponse, Option<AttemptFailure>) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.resolve_inner(case, item)));
        match result {
            Ok(resolved) => resolved,
            Err(payload) => {
                let error = HandlerError::Panicked {
                    message: panic_message(payload.as_ref()),
                };
                (
                    WorkItemResponse::NEGATIVE,
                    Some(AttemptFailure::new(
                        FailureKind::DispatchFailure,
                        format!("handler for wid {} failed: {error}", item.id),
                    )),
                )
            }
        }
    }

    fn resolve_inner(
        &self,
        case: &TestCase,
        item: &WorkItem,
    ) -> (WorkItemResponse, Option<AttemptFailure>) {
        let wid = item.id;

        if let Some(edit) = case.edit(wid) {
            return match edit.produce(&self.state) {
                Some(value) => (WorkItemResponse::Value(value), None),
                None => (
                    WorkItemResponse::Undefined,
                    Some(AttemptFailure::new(
                        FailureKind::DispatchFailure,
                        format!("no value available for edit wid {wid}"),
                    )),
                ),
            };
        }

        if let Some(predicate) = case.verify(wid) {
            let verified = predicate.check(&item.description, &self.state);
            let failure = (!verified).then(|| {
                AttemptFailure::new(
                    FailureKind::VerificationFailure,
                    format!("verification of wid {wid} failed: {}", item.description),
                )
            });
            return (WorkItemResponse::Bool(verified), failure);
        }

        let Some(handler) = case.handlers().and_then(|handlers| handlers.get(wid)) else {
            return (
                WorkItemResponse::Undefined,
                Some(AttemptFailure::new(
                    FailureKind::DispatchFailure,
                    format!("no handler for wid {wid}"),
                )),
            );
        };

        let cx = HandlerContext {
            work_item: item,
            device: &self.device,
            state: &self.state,
        };
        match handler(&cx) {
            Ok(response) => (response, None),
            Err(error) => {
                let kind = match &error {
                    HandlerError::Device(device) if device.is_timeout() => {
                        FailureKind::ProtocolTimeout
                    }
                    _ => FailureKind::DispatchFailure,
                };
                (
                    WorkItemResponse::NEGATIVE,
                    Some(AttemptFailure::new(
                        kind,
                        format!(
                            "handler for wid {wid} failed: {}",
                            DisplayErrorChain::new(&error)
                        ),
                    )),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::{EditValue, VerifyPredicate},
        errors::DescriptionParseError,
    };
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc,
        },
        thread,
        time::Duration,
    };

    const CASE: &str = "GATT/SR/GAR/BV-01-C";

    fn bridge() -> DispatchBridge {
        DispatchBridge::new(
            DeviceHandle::new(),
            SharedState::new(),
            Arc::new(Synchronizer::new()),
        )
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(10)
    }

    fn kinds(failures: &[AttemptFailure]) -> Vec<FailureKind> {
        failures.iter().map(|failure| failure.kind).collect()
    }

    #[test]
    fn resolution_order() {
        let handlers = HandlerRegistry::new("test")
            .register(1, |_| Ok(WorkItemResponse::Value("handler".to_owned())))
            .register(2, |_| Ok(WorkItemResponse::Value("handler".to_owned())))
            .register(3, |_| Ok(WorkItemResponse::Value("handler".to_owned())));
        let case = TestCase::builder("GATT", CASE)
            .edit(1, EditValue::Literal("edited".to_owned()))
            .verify(2, VerifyPredicate::ContainsAll(vec!["0x1800".to_owned()]))
            .handlers(Arc::new(handlers))
            .build();

        let bridge = bridge();
        bridge.activate(Arc::new(case), 1, soon());
        assert_eq!(
            bridge.dispatch(0, &WorkItem::new(1, "", CASE)),
            WorkItemResponse::Value("edited".to_owned())
        );
        assert_eq!(
            bridge.dispatch(0, &WorkItem::new(2, "services: 0x1800", CASE)),
            WorkItemResponse::Bool(true)
        );
        assert_eq!(
            bridge.dispatch(0, &WorkItem::new(3, "", CASE)),
            WorkItemResponse::Value("handler".to_owned())
        );
        assert!(bridge.deactivate().is_empty());
    }

    #[test]
    fn unknown_callback_fails_closed() {
        let bridge = bridge();
        bridge.activate(Arc::new(TestCase::builder("GATT", CASE).build()), 1, soon());
        assert_eq!(
            bridge.dispatch(0, &WorkItem::new(99, "do something", CASE)),
            WorkItemResponse::Undefined
        );
        assert_eq!(kinds(&bridge.deactivate()), [FailureKind::DispatchFailure]);
    }

    #[test]
    fn failed_verification() {
        let case = TestCase::builder("GATT", CASE)
            .verify(2, VerifyPredicate::ContainsAll(vec!["0x1800".to_owned()]))
            .build();
        let bridge = bridge();
        bridge.activate(Arc::new(case), 1, soon());
        assert_eq!(
            bridge.dispatch(0, &WorkItem::new(2, "services: 0x180a", CASE)),
            WorkItemResponse::Bool(false)
        );
        assert_eq!(
            kinds(&bridge.deactivate()),
            [FailureKind::VerificationFailure]
        );
    }

    #[test]
    fn handler_errors_and_panics_are_contained() {
        let handlers = HandlerRegistry::new("test")
            .register(52, |cx| {
                Err(DescriptionParseError::new("handle", cx.description()).into())
            })
            .register(53, |_| panic!("handler exploded"));
        let case = TestCase::builder("GATT", CASE)
            .handlers(Arc::new(handlers))
            .build();
        let bridge = bridge();
        bridge.activate(Arc::new(case), 1, soon());

        assert_eq!(
            bridge.dispatch(0, &WorkItem::new(52, "garbage", CASE)),
            WorkItemResponse::NEGATIVE
        );
        assert_eq!(
            bridge.dispatch(0, &WorkItem::new(53, "", CASE)),
            WorkItemResponse::NEGATIVE
        );

        let failures = bridge.deactivate();
        assert_eq!(
            kinds(&failures),
            [FailureKind::DispatchFailure, FailureKind::DispatchFailure]
        );
        assert!(
            failures[1].message.contains("handler exploded"),
            "panic message is kept: {}",
            failures[1].message
        );
    }

    #[test]
    fn no_active_case() {
        let bridge = bridge();
        assert_eq!(
            bridge.dispatch(0, &WorkItem::new(1, "", CASE)),
            WorkItemResponse::Undefined
        );
        assert!(bridge.deactivate().is_empty());
    }

    #[test]
    fn repeated_callbacks_are_dispatched_again() {
        let case = TestCase::builder("GATT", CASE)
            .verify(17, VerifyPredicate::ContainsAll(vec!["1800".to_owned()]))
            .build();
        let bridge = bridge();
        bridge.activate(Arc::new(case), 1, soon());

        assert_eq!(
            bridge.dispatch(0, &WorkItem::new(17, "Service = '1800'", CASE)),
            WorkItemResponse::Bool(true)
        );
        assert_eq!(
            bridge.dispatch(0, &WorkItem::new(17, "Service = '180A'", CASE)),
            WorkItemResponse::Bool(false)
        );
        assert_eq!(
            kinds(&bridge.deactivate()),
            [FailureKind::VerificationFailure]
        );
    }

    #[test]
    fn every_callback_reaches_the_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handlers = {
            let calls = calls.clone();
            HandlerRegistry::new("test").register(1, move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(WorkItemResponse::OK)
            })
        };
        let case = Arc::new(
            TestCase::builder("GATT", CASE)
                .handlers(Arc::new(handlers))
                .build(),
        );
        let bridge = bridge();
        bridge.activate(case.clone(), 1, soon());

        for _ in 0..3 {
            assert_eq!(
                bridge.dispatch(0, &WorkItem::new(1, "", CASE)),
                WorkItemResponse::OK
            );
        }
        // A companion session asking the same id is handled too.
        bridge.dispatch(1, &WorkItem::new(1, "", CASE));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(bridge.deactivate().is_empty());
    }

    #[test]
    fn concurrent_sessions_are_serialized() {
        let calls = Arc::new(AtomicUsize::new(0));
        let in_handler = Arc::new(AtomicUsize::new(0));
        let handlers = {
            let calls = calls.clone();
            let in_handler = in_handler.clone();
            HandlerRegistry::new("test").register(1, move |cx| {
                let concurrent = in_handler.fetch_add(1, Ordering::SeqCst);
                assert_eq!(concurrent, 0, "handler must not run concurrently");
                calls.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(30));
                in_handler.fetch_sub(1, Ordering::SeqCst);
                Ok(WorkItemResponse::Value(cx.description().to_owned()))
            })
        };
        let case = TestCase::builder("MESH", CASE)
            .handlers(Arc::new(handlers))
            .build();
        let bridge = Arc::new(bridge());
        bridge.activate(Arc::new(case), 1, soon());

        let listeners: Vec<_> = (0..4)
            .map(|session| {
                let bridge = bridge.clone();
                thread::spawn(move || {
                    let description = format!("node {session}");
                    let response = bridge.dispatch(session, &WorkItem::new(1, &description, CASE));
                    (description, response)
                })
            })
            .collect();
        for listener in listeners {
            let (description, response) = listener.join().unwrap();
            // Each session gets its own answer.
            assert_eq!(response, WorkItemResponse::Value(description));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(bridge.deactivate().is_empty());
    }

    #[test]
    fn in_flight_duplicate_shares_the_response() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (started_tx, started_rx) = mpsc::channel();
        let (finish_tx, finish_rx) = mpsc::channel::<()>();
        let handlers = {
            let calls = calls.clone();
            let started_tx = Mutex::new(started_tx);
            let finish_rx = Mutex::new(finish_rx);
            HandlerRegistry::new("test").register(1, move |_| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    started_tx.lock().unwrap().send(()).unwrap();
                    finish_rx.lock().unwrap().recv().unwrap();
                }
                Ok(WorkItemResponse::Value("shared".to_owned()))
            })
        };
        let case = TestCase::builder("GATT", CASE)
            .handlers(Arc::new(handlers))
            .build();
        let bridge = Arc::new(bridge());
        bridge.activate(Arc::new(case), 1, soon());

        let spawn = || {
            let bridge = bridge.clone();
            thread::spawn(move || bridge.dispatch(0, &WorkItem::new(1, "", CASE)))
        };
        let first = spawn();
        started_rx.recv().unwrap();
        let duplicate = spawn();
        thread::sleep(Duration::from_millis(50));
        finish_tx.send(()).unwrap();

        for listener in [first, duplicate] {
            assert_eq!(
                listener.join().unwrap(),
                WorkItemResponse::Value("shared".to_owned())
            );
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn gated_callback_waits_for_release() {
        let sync = Arc::new(Synchronizer::new());
        let bridge = Arc::new(DispatchBridge::new(
            DeviceHandle::new(),
            SharedState::new(),
            sync.clone(),
        ));
        let case = TestCase::builder("GAP", CASE)
            .edit(20, EditValue::Literal("ready".to_owned()))
            .build();
        bridge.activate(Arc::new(case), 1, soon());
        sync.gate(20);

        let listener = {
            let bridge = bridge.clone();
            thread::spawn(move || bridge.dispatch(0, &WorkItem::new(20, "", CASE)))
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!listener.is_finished(), "callback must be held by the gate");
        assert!(!sync.wait_processed(20, Instant::now()).is_satisfied());

        sync.release(20);
        assert_eq!(
            listener.join().unwrap(),
            WorkItemResponse::Value("ready".to_owned())
        );
        assert!(sync.wait_processed(20, soon()).is_satisfied());
    }
}

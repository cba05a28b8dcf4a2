// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Running a single attempt of a test case.
//!
//! An attempt walks the test case's steps in declared order:
//!
//! * Leading steps with no callback constraint are preconditions: they run before the tool is
//!   asked to start the test case.
//! * The tool run (and any companion runs) starts when the first constrained step is reached,
//!   or after the last step if none is constrained.
//! * `after_callback = N` waits until callback `N` has been answered in this attempt.
//! * `before_callback = N` steps were gated at the start of the attempt: the listener holding
//!   callback `N` is released once the step has run.
//!
//! The attempt's status is the worst of the tool's verdict and every failure recorded locally
//! or by the dispatch bridge. Cleanup steps run exactly once, after the verdict.

use crate::{
    catalog::{Step, StepAction, TestCase},
    device::DeviceHandle,
    dispatch::DispatchBridge,
    errors::{DisplayErrorChain, SessionError, StepError, panic_message},
    reporter::TestStatus,
    session::{SessionHandle, ToolControl},
    state::SharedState,
    sync::{Synchronizer, WaitOutcome},
    time::stopwatch,
};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

/// The reason an attempt did not pass.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// Device preparation or connectivity failed.
    InfrastructureFailure,

    /// The IUT or the tool did not respond in time.
    ProtocolTimeout,

    /// A callback could not be answered.
    DispatchFailure,

    /// A verification callback's predicate did not hold.
    VerificationFailure,

    /// The tool and the bot disagree about which test case is running.
    SessionDesync,

    /// A scripted step failed.
    StepFailure,

    /// The remote tool rejected a request or reported an error.
    ToolFailure,
}

impl FailureKind {
    /// The status this kind of failure results in.
    pub fn status(self) -> TestStatus {
        match self {
            Self::VerificationFailure => TestStatus::Fail,
            Self::InfrastructureFailure
            | Self::ProtocolTimeout
            | Self::DispatchFailure
            | Self::SessionDesync
            | Self::StepFailure
            | Self::ToolFailure => TestStatus::Inconclusive,
        }
    }
}

/// A failure recorded during an attempt.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct AttemptFailure {
    /// What kind of failure this is.
    pub kind: FailureKind,

    /// A human-readable description.
    pub message: String,
}

impl AttemptFailure {
    /// Creates a new failure.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// The state of an attempt.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AttemptState {
    /// The attempt hasn't started.
    NotStarted,

    /// Steps are running and the tool may be running the test case.
    Running,

    /// The attempt reached a terminal status.
    Finished(TestStatus),
}

impl AttemptState {
    fn start(&mut self) {
        match self {
            Self::NotStarted => *self = Self::Running,
            other => panic!("attempt started in state {other:?}"),
        }
    }

    fn finish(&mut self, status: TestStatus) {
        match self {
            Self::Running => *self = Self::Finished(status),
            other => panic!("attempt finished in state {other:?}"),
        }
    }
}

/// The result of a single attempt.
#[derive(Clone, Debug)]
pub struct AttemptOutcome {
    /// The 1-based attempt number.
    pub attempt: u32,

    /// The terminal status.
    pub status: TestStatus,

    /// The verdict reported by the tool, if it reported one.
    pub verdict: Option<TestStatus>,

    /// Failures recorded locally and by the dispatch bridge, in the order they were collected.
    pub failures: Vec<AttemptFailure>,

    /// True if the attempt ran out of time and the device connection was torn down.
    pub timed_out: bool,

    /// When the attempt started.
    pub start_time: DateTime<Local>,

    /// How long the attempt took.
    pub time_taken: Duration,
}

impl AttemptOutcome {
    /// A description of why the attempt ended the way it did: the first failure that
    /// determined the status, if any.
    pub fn description(&self) -> Option<String> {
        self.failures
            .iter()
            .find(|failure| failure.kind.status() == self.status)
            .or_else(|| self.failures.first())
            .map(|failure| failure.message.clone())
    }
}

/// What a step gets to work with.
pub struct StepContext<'a> {
    /// The connection to the IUT.
    pub device: &'a DeviceHandle,

    /// Shared test state.
    pub state: &'a SharedState,

    /// The primary tool session.
    pub tool: &'a mut dyn ToolControl,

    /// The test case being run.
    pub test_case: &'a TestCase,
}

impl fmt::Debug for StepContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepContext")
            .field("device", &self.device)
            .field("test_case", &self.test_case.id())
            .finish_non_exhaustive()
    }
}

/// Runs attempts of test cases against the open sessions.
pub struct AttemptExecutor<'a> {
    device: &'a DeviceHandle,
    state: &'a SharedState,
    sync: &'a Synchronizer,
    bridge: &'a DispatchBridge,
    sessions: &'a mut [SessionHandle],
    timeout: Duration,
}

impl fmt::Debug for AttemptExecutor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttemptExecutor")
            .field("sessions", &self.sessions.len())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl<'a> AttemptExecutor<'a> {
    /// Creates a new executor. `sessions` must contain at least the primary session.
    pub fn new(
        device: &'a DeviceHandle,
        state: &'a SharedState,
        sync: &'a Synchronizer,
        bridge: &'a DispatchBridge,
        sessions: &'a mut [SessionHandle],
        timeout: Duration,
    ) -> Self {
        Self {
            device,
            state,
            sync,
            bridge,
            sessions,
            timeout,
        }
    }

    /// Runs one attempt of `case`. Always returns a terminal outcome.
    pub fn run_attempt(&mut self, case: &Arc<TestCase>, attempt: u32) -> AttemptOutcome {
        let stopwatch = stopwatch();
        let deadline = stopwatch.deadline(self.timeout);
        let mut state = AttemptState::NotStarted;

        self.sync.reset();
        self.bridge.activate(case.clone(), attempt, deadline);
        for id in case.gated_callbacks() {
            self.sync.gate(id);
        }
        state.start();
        info!(test_case = case.id(), attempt, "attempt started");

        let mut run = AttemptRun {
            failures: Vec::new(),
            started: Vec::new(),
            timed_out: false,
        };

        let aborted = self.run_steps(case, deadline, &mut run);
        if aborted {
            // The tool might be waiting on a gated callback whose step will never run.
            self.sync.release_all_gates();
        }

        let verdict = self.collect_verdicts(case, deadline, &mut run);

        if run.timed_out {
            self.stop_started(&run.started);
        }
        self.run_cleanup(case);
        if run.timed_out {
            warn!(
                test_case = case.id(),
                attempt, "attempt timed out, tearing down device connection"
            );
            self.device.teardown();
        }

        run.failures.extend(self.bridge.deactivate());
        // Wake any listener still holding a callback for this attempt.
        self.sync.reset();

        let local = run
            .failures
            .iter()
            .fold(TestStatus::Pass, |status, failure| {
                status.worst(failure.kind.status())
            });
        let status = match verdict {
            Some(verdict) => verdict.worst(local),
            None if local.is_pass() => {
                run.failures.push(AttemptFailure::new(
                    FailureKind::ToolFailure,
                    "the tool did not report a verdict",
                ));
                TestStatus::Inconclusive
            }
            None => local,
        };
        state.finish(status);

        let snapshot = stopwatch.snapshot();
        info!(
            test_case = case.id(),
            attempt,
            %status,
            time_taken = ?snapshot.duration,
            "attempt finished"
        );
        AttemptOutcome {
            attempt,
            status,
            verdict,
            failures: run.failures,
            timed_out: run.timed_out,
            start_time: snapshot.start_time,
            time_taken: snapshot.duration,
        }
    }

    /// Runs the non-cleanup steps, starting the tool at the right point. Returns true if the
    /// remaining steps were skipped because of a failure.
    fn run_steps(&mut self, case: &TestCase, deadline: Instant, run: &mut AttemptRun) -> bool {
        for step in case.steps().iter().filter(|step| !step.is_cleanup()) {
            if run.started.is_empty() && step.is_constrained() && !self.start_tool(case, run) {
                return true;
            }

            if let Some(id) = step.after_callback_id() {
                self.sync.expect(id);
                match self.sync.wait_processed(id, deadline) {
                    WaitOutcome::Satisfied => {}
                    WaitOutcome::TimedOut => {
                        run.timed_out = true;
                        run.failures.push(AttemptFailure::new(
                            FailureKind::ProtocolTimeout,
                            format!("callback {id} was not answered before the deadline"),
                        ));
                        return true;
                    }
                    WaitOutcome::Reset => {
                        run.failures.push(AttemptFailure::new(
                            FailureKind::SessionDesync,
                            format!("attempt was reset while waiting for callback {id}"),
                        ));
                        return true;
                    }
                }
            }

            debug!(test_case = case.id(), %step, "running step");
            let result = self.run_step(case, step);
            if let Some(id) = step.before_callback_id() {
                self.sync.release(id);
            }
            if let Err(error) = result {
                let kind = if error.is_timeout() {
                    FailureKind::ProtocolTimeout
                } else {
                    FailureKind::StepFailure
                };
                run.failures.push(AttemptFailure::new(
                    kind,
                    format!("step {step} failed: {}", DisplayErrorChain::new(&error)),
                ));
                return true;
            }

            if Instant::now() >= deadline {
                run.timed_out = true;
                run.failures.push(AttemptFailure::new(
                    FailureKind::ProtocolTimeout,
                    format!("attempt ran out of time after step {step}"),
                ));
                return true;
            }
        }

        if run.started.is_empty() {
            return !self.start_tool(case, run);
        }
        false
    }

    fn run_step(&mut self, case: &TestCase, step: &Step) -> Result<(), StepError> {
        panic::catch_unwind(AssertUnwindSafe(|| self.run_step_inner(case, step))).unwrap_or_else(
            |payload| {
                Err(StepError::Panicked {
                    message: panic_message(payload.as_ref()),
                })
            },
        )
    }

    fn run_step_inner(&mut self, case: &TestCase, step: &Step) -> Result<(), StepError> {
        match step.action() {
            StepAction::Device(command) => {
                self.device.send(command)?;
                Ok(())
            }
            StepAction::Local { run, .. } | StepAction::Cleanup { run, .. } => {
                let primary = self
                    .sessions
                    .first_mut()
                    .ok_or(SessionError::MissingSession { index: 0, open: 0 })?;
                let mut cx = StepContext {
                    device: self.device,
                    state: self.state,
                    tool: primary.control(),
                    test_case: case,
                };
                (run.0)(&mut cx)
            }
        }
    }

    /// Starts companion runs, then the test case itself. Returns false on failure.
    fn start_tool(&mut self, case: &TestCase, run: &mut AttemptRun) -> bool {
        let open = self.sessions.len();
        let runs = case
            .companions()
            .iter()
            .map(|companion| (companion.session, companion.name.as_str()))
            .chain(std::iter::once((0, case.name())));

        for (index, name) in runs {
            let Some(session) = self.sessions.get_mut(index) else {
                let error = SessionError::MissingSession { index, open };
                run.failures.push(AttemptFailure::new(
                    FailureKind::ToolFailure,
                    format!("cannot start `{name}`: {error}"),
                ));
                return false;
            };
            debug!(session = index, test_case = name, "starting tool test case");
            if let Err(error) = session.control().start_test_case(case.profile(), name) {
                run.failures.push(AttemptFailure::new(
                    FailureKind::ToolFailure,
                    format!("the tool failed to start `{name}`: {error}"),
                ));
                return false;
            }
            run.started.push(index);
        }
        true
    }

    /// Waits for the verdict of every started run and returns the worst.
    fn collect_verdicts(
        &mut self,
        case: &TestCase,
        deadline: Instant,
        run: &mut AttemptRun,
    ) -> Option<TestStatus> {
        if run.timed_out {
            return None;
        }

        let mut verdict: Option<TestStatus> = None;
        for &index in &run.started {
            let session = &mut self.sessions[index];
            let remaining = deadline.saturating_duration_since(Instant::now());
            match session.control().wait_verdict(remaining) {
                Ok(Some(status)) => {
                    debug!(session = index, test_case = case.id(), %status, "tool verdict");
                    verdict = Some(verdict.map_or(status, |v| v.worst(status)));
                }
                Ok(None) => {
                    run.timed_out = true;
                    run.failures.push(AttemptFailure::new(
                        FailureKind::ProtocolTimeout,
                        format!(
                            "no verdict from session {index} within {:?}",
                            self.timeout
                        ),
                    ));
                    return None;
                }
                Err(error) => {
                    run.failures.push(AttemptFailure::new(
                        FailureKind::ToolFailure,
                        format!("waiting for the verdict on session {index} failed: {error}"),
                    ));
                }
            }
        }
        verdict
    }

    fn stop_started(&mut self, started: &[usize]) {
        for &index in started {
            if let Err(error) = self.sessions[index].control().stop_test_case() {
                warn!(session = index, %error, "failed to stop tool test case");
            }
        }
    }

    fn run_cleanup(&mut self, case: &TestCase) {
        for step in case.steps().iter().filter(|step| step.is_cleanup()) {
            debug!(test_case = case.id(), %step, "running cleanup");
            if let Err(error) = self.run_step(case, step) {
                warn!(
                    test_case = case.id(),
                    %step,
                    error = %DisplayErrorChain::new(&error),
                    "cleanup step failed"
                );
            }
        }
    }
}

struct AttemptRun {
    failures: Vec<AttemptFailure>,
    /// Session indexes with a tool run in progress.
    started: Vec<usize>,
    timed_out: bool,
}

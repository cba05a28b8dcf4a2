// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Running a batch of test cases across device configurations.
//!
//! For every configuration, in declared order, the [`BatchRunner`]:
//!
//! 1. prepares the device (build and flash) and connects to it;
//! 2. opens the remote-tool sessions, once per batch, the first time a configuration gets this
//!    far;
//! 3. runs each selected test case, retrying failed and inconclusive attempts;
//! 4. merges the results.
//!
//! Failing to bring a configuration up is an infrastructure failure: it is recorded and the
//! batch moves on to the next configuration. The batch itself always completes with a
//! [`BatchOutcome`].

use crate::{
    catalog::{Catalog, TestCase},
    config::{BotConfig, Configuration, Configurations, RetryPolicy, SessionConfig},
    device::{ConnectionDescriptor, DeviceConnector, DeviceHandle, DevicePreparer},
    dispatch::DispatchBridge,
    errors::{DisplayErrorChain, InfrastructureFailure, InfrastructureFailureKind},
    executor::{AttemptExecutor, AttemptOutcome},
    reporter::{
        CaseResult, HistoryStore, Regression, RunResults, StatusCounts, compute_regressions,
    },
    session::{RemoteTool, SessionHandle},
    state::SharedState,
    sync::Synchronizer,
};
use serde::Serialize;
use std::{collections::BTreeMap, fmt, sync::Arc, thread, time::Duration};
use tracing::{debug, error, info, warn};

/// The default wall-clock budget for a single attempt.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(600);

/// The default interval at which session listeners poll for callbacks.
pub const DEFAULT_CALLBACK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Builds a [`BatchRunner`].
#[derive(Debug, Default)]
pub struct BatchRunnerBuilder {
    attempt_timeout: Option<Duration>,
    callback_poll_interval: Option<Duration>,
    history: Option<HistoryStore>,
}

impl BatchRunnerBuilder {
    /// Sets the wall-clock budget for each attempt.
    pub fn set_attempt_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Sets how often session listeners poll for callbacks (and notice shutdown).
    pub fn set_callback_poll_interval(&mut self, interval: Duration) -> &mut Self {
        self.callback_poll_interval = Some(interval);
        self
    }

    /// Sets the history store used to detect regressions. Without one, no regressions are
    /// reported and nothing is recorded.
    pub fn set_history(&mut self, history: HistoryStore) -> &mut Self {
        self.history = Some(history);
        self
    }

    /// Applies the `[run]` section of a configuration file.
    pub fn apply_config(&mut self, config: &BotConfig) -> &mut Self {
        let run = config.run();
        self.set_attempt_timeout(run.attempt_timeout)
            .set_callback_poll_interval(run.callback_poll_interval)
            .set_history(HistoryStore::new(run.history_file.clone()))
    }

    /// Creates a new batch runner.
    pub fn build(
        self,
        sessions: Vec<SessionConfig>,
        preparer: Box<dyn DevicePreparer>,
        connector: Box<dyn DeviceConnector>,
        tool: Box<dyn RemoteTool>,
    ) -> BatchRunner {
        BatchRunner {
            sessions,
            preparer,
            connector,
            tool,
            attempt_timeout: self.attempt_timeout.unwrap_or(DEFAULT_ATTEMPT_TIMEOUT),
            poll_interval: self
                .callback_poll_interval
                .unwrap_or(DEFAULT_CALLBACK_POLL_INTERVAL),
            history: self.history,
            device: DeviceHandle::new(),
            state: SharedState::new(),
            sync: Arc::new(Synchronizer::new()),
        }
    }
}

/// An infrastructure failure, in serializable form.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct InfrastructureFailureSummary {
    /// The configuration that could not be brought up.
    pub configuration: String,

    /// The full error chain.
    pub message: String,
}

impl From<&InfrastructureFailure> for InfrastructureFailureSummary {
    fn from(failure: &InfrastructureFailure) -> Self {
        Self {
            configuration: failure.configuration().to_owned(),
            message: DisplayErrorChain::new(failure).to_string(),
        }
    }
}

/// The outcome of a batch.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BatchOutcome {
    /// Number of test cases per final status.
    pub status_counts: StatusCounts,

    /// Per-test-case results, keyed by id.
    pub results: RunResults,

    /// Test cases whose status got worse compared to history, ordered by id.
    pub regressions: Vec<Regression>,

    /// The tool's description of each test case that ran, keyed by id.
    pub descriptions: BTreeMap<String, String>,

    /// Configurations that could not be brought up.
    pub infrastructure_failures: Vec<InfrastructureFailureSummary>,
}

/// Runs batches of test cases.
pub struct BatchRunner {
    sessions: Vec<SessionConfig>,
    preparer: Box<dyn DevicePreparer>,
    connector: Box<dyn DeviceConnector>,
    tool: Box<dyn RemoteTool>,
    attempt_timeout: Duration,
    poll_interval: Duration,
    history: Option<HistoryStore>,
    device: DeviceHandle,
    state: SharedState,
    sync: Arc<Synchronizer>,
}

impl fmt::Debug for BatchRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchRunner")
            .field("sessions", &self.sessions)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("history", &self.history)
            .finish_non_exhaustive()
    }
}

impl BatchRunner {
    /// Runs every configuration in `configurations` against `catalog`.
    pub fn run_batch(
        &mut self,
        configurations: &Configurations,
        catalog: &Catalog,
        retries: RetryPolicy,
    ) -> BatchOutcome {
        info!(
            configurations = configurations.len(),
            test_cases = catalog.len(),
            retries = retries.count,
            "starting batch"
        );
        self.state.reset();
        let bridge = Arc::new(DispatchBridge::new(
            self.device.clone(),
            self.state.clone(),
            self.sync.clone(),
        ));

        let mut batch = Batch {
            bridge,
            sessions: Vec::new(),
            outcome: BatchOutcome::default(),
        };
        for configuration in configurations {
            self.run_configuration(configuration, configurations, catalog, retries, &mut batch);
        }

        let Batch {
            sessions,
            mut outcome,
            ..
        } = batch;
        for session in sessions {
            session.close();
        }
        self.device.teardown();

        outcome.status_counts = outcome.results.status_counts();
        outcome.regressions = self.update_history(&outcome.results);
        info!(
            pass = outcome.status_counts.pass,
            fail = outcome.status_counts.fail,
            inconclusive = outcome.status_counts.inconclusive,
            not_supported = outcome.status_counts.not_supported,
            regressions = outcome.regressions.len(),
            "batch finished"
        );
        outcome
    }

    fn run_configuration(
        &mut self,
        configuration: &Configuration,
        configurations: &Configurations,
        catalog: &Catalog,
        retries: RetryPolicy,
        batch: &mut Batch,
    ) {
        let name = configuration.name();
        let selected = configurations.select(configuration, catalog);
        if selected.is_empty() {
            info!(configuration = name, "no test cases selected, skipping");
            return;
        }
        info!(
            configuration = name,
            test_cases = selected.len(),
            "bringing up configuration"
        );

        let descriptor = match self.bring_up(configuration, batch) {
            Ok(descriptor) => descriptor,
            Err(failure) => {
                error!(
                    configuration = name,
                    error = %DisplayErrorChain::new(&failure),
                    "skipping configuration"
                );
                batch
                    .outcome
                    .infrastructure_failures
                    .push(InfrastructureFailureSummary::from(&failure));
                return;
            }
        };

        let mut results = RunResults::new();
        for case in &selected {
            self.describe(case, batch);
            let run = self.run_case(case, name, &descriptor, retries, batch);
            if let Some(result) = run.result {
                results.record(case.id(), result);
            }
            if let Some(failure) = run.halt {
                error!(
                    configuration = name,
                    error = %DisplayErrorChain::new(&failure),
                    "abandoning remaining test cases in configuration"
                );
                batch
                    .outcome
                    .infrastructure_failures
                    .push(InfrastructureFailureSummary::from(&failure));
                break;
            }
        }
        batch.outcome.results.merge(results);
    }

    /// Prepares and connects the device, then makes sure the sessions are open.
    fn bring_up(
        &mut self,
        configuration: &Configuration,
        batch: &mut Batch,
    ) -> Result<ConnectionDescriptor, InfrastructureFailure> {
        let name = configuration.name();
        // A previous configuration's connection is stale once the device is reflashed.
        self.device.teardown();

        let descriptor = self.preparer.prepare(configuration).map_err(|error| {
            InfrastructureFailure::new(name, InfrastructureFailureKind::Prepare(error))
        })?;
        self.connect(name, &descriptor)?;

        if batch.sessions.is_empty() {
            batch.sessions = self.open_sessions(name, &batch.bridge)?;
        }
        Ok(descriptor)
    }

    fn connect(
        &mut self,
        configuration: &str,
        descriptor: &ConnectionDescriptor,
    ) -> Result<(), InfrastructureFailure> {
        debug!(configuration, %descriptor, "connecting to device");
        let client = self.connector.connect(descriptor).map_err(|error| {
            InfrastructureFailure::new(configuration, InfrastructureFailureKind::Connect(error))
        })?;
        self.device.install(client);
        Ok(())
    }

    fn open_sessions(
        &mut self,
        configuration: &str,
        bridge: &Arc<DispatchBridge>,
    ) -> Result<Vec<SessionHandle>, InfrastructureFailure> {
        let mut open = Vec::with_capacity(self.sessions.len());
        for (index, config) in self.sessions.iter().enumerate() {
            let handle = self
                .tool
                .open(&config.endpoint, &config.identity)
                .and_then(|session| {
                    SessionHandle::spawn(
                        index,
                        config.clone(),
                        session,
                        bridge.clone(),
                        self.poll_interval,
                    )
                });
            match handle {
                Ok(handle) => open.push(handle),
                Err(error) => {
                    for session in open {
                        session.close();
                    }
                    return Err(InfrastructureFailure::new(
                        configuration,
                        InfrastructureFailureKind::SessionOpen { index, error },
                    ));
                }
            }
        }
        Ok(open)
    }

    fn describe(&self, case: &TestCase, batch: &mut Batch) {
        if batch.outcome.descriptions.contains_key(case.id()) {
            return;
        }
        let Some(primary) = batch.sessions.first_mut() else {
            return;
        };
        match primary.control().describe_test_case(case.name()) {
            Ok(Some(description)) => {
                batch
                    .outcome
                    .descriptions
                    .insert(case.id().to_owned(), description);
            }
            Ok(None) => {}
            Err(error) => {
                debug!(test_case = case.id(), %error, "failed to fetch test case description")
            }
        }
    }

    fn run_case(
        &mut self,
        case: &Arc<TestCase>,
        configuration: &str,
        descriptor: &ConnectionDescriptor,
        retries: RetryPolicy,
        batch: &mut Batch,
    ) -> CaseRun {
        let max_attempts = retries.max_attempts();
        let mut last: Option<AttemptOutcome> = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 && !retries.delay.is_zero() {
                debug!(test_case = case.id(), delay = ?retries.delay, "waiting before retry");
                thread::sleep(retries.delay);
            }

            if !self.device.is_connected() {
                info!(test_case = case.id(), "reconnecting to device");
                if let Err(failure) = self.connect(configuration, descriptor) {
                    return CaseRun {
                        result: last.map(|outcome| case_result(&outcome, configuration)),
                        halt: Some(failure),
                    };
                }
            }

            let outcome = AttemptExecutor::new(
                &self.device,
                &self.state,
                &self.sync,
                &batch.bridge,
                &mut batch.sessions,
                self.attempt_timeout,
            )
            .run_attempt(case, attempt);

            let passed = outcome.status.is_pass();
            if !passed && attempt < max_attempts {
                warn!(
                    test_case = case.id(),
                    attempt,
                    status = %outcome.status,
                    reason = %outcome.description().unwrap_or_default(),
                    "attempt did not pass, retrying"
                );
            }
            last = Some(outcome);
            if passed {
                break;
            }
        }

        let result = last.map(|outcome| case_result(&outcome, configuration));
        if let Some(result) = &result {
            info!(
                test_case = case.id(),
                configuration,
                status = %result.status,
                retries = result.retry_count,
                "test case finished"
            );
        }
        CaseRun { result, halt: None }
    }

    fn update_history(&self, results: &RunResults) -> Vec<Regression> {
        let Some(history) = &self.history else {
            return Vec::new();
        };

        let previous = history.load_statuses().unwrap_or_else(|error| {
            warn!(
                error = %DisplayErrorChain::new(&error),
                "ignoring unreadable history, no regressions will be reported"
            );
            BTreeMap::new()
        });
        let regressions = compute_regressions(results.statuses(), &previous);
        for regression in &regressions {
            warn!(
                test_case = %regression.case_id,
                previous = %regression.previous,
                current = %regression.current,
                "regression"
            );
        }

        if let Err(error) = history.record(results.statuses()) {
            warn!(
                path = %history.path(),
                error = %DisplayErrorChain::new(&error),
                "failed to record history"
            );
        }
        regressions
    }
}

struct Batch {
    bridge: Arc<DispatchBridge>,
    /// Opened lazily, at the first configuration that comes up.
    sessions: Vec<SessionHandle>,
    outcome: BatchOutcome,
}

struct CaseRun {
    result: Option<CaseResult>,
    halt: Option<InfrastructureFailure>,
}

fn case_result(outcome: &AttemptOutcome, configuration: &str) -> CaseResult {
    CaseResult {
        status: outcome.status,
        description: outcome.description(),
        retry_count: outcome.attempt - 1,
        configuration: configuration.to_owned(),
    }
}

// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scripted fakes for the device and the remote tool.

use ptsbot_runner::{
    config::{Configuration, SessionConfig},
    device::{
        ConnectionDescriptor, DeviceClient, DeviceCommand, DeviceConnector, DeviceEvent,
        DevicePreparer, DeviceResponse,
    },
    dispatch::{WorkItem, WorkItemResponse},
    errors::{DeviceError, PrepareError, SessionError},
    orchestrator::{BatchRunner, BatchRunnerBuilder},
    reporter::{HistoryStore, TestStatus},
    session::{CallbackEndpoint, RemoteTool, ToolControl, ToolSession},
};
use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, mpsc},
    thread,
    time::{Duration, Instant},
};

/// Everything the fakes did, in order.
#[derive(Clone, Debug, Default)]
pub(crate) struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub(crate) fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }

    /// The index of the first occurrence of `event`. Panics if it never happened.
    pub(crate) fn position(&self, event: &str) -> usize {
        let events = self.events();
        events
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("event `{event}` not found in {events:?}"))
    }
}

/// What the tool does for one run of a test case.
#[derive(Clone, Debug)]
pub(crate) struct RunPlan {
    pub(crate) callbacks: Vec<(u32, String)>,
    pub(crate) verdict: Verdict,
}

impl RunPlan {
    pub(crate) fn verdict(status: TestStatus) -> Self {
        Self {
            callbacks: Vec::new(),
            verdict: Verdict::Report(status),
        }
    }

    pub(crate) fn hang() -> Self {
        Self {
            callbacks: Vec::new(),
            verdict: Verdict::Hang,
        }
    }

    pub(crate) fn callback(mut self, wid: u32, description: &str) -> Self {
        self.callbacks.push((wid, description.to_owned()));
        self
    }
}

#[derive(Copy, Clone, Debug)]
pub(crate) enum Verdict {
    /// Report this status once every callback has been answered.
    Report(TestStatus),

    /// Never report a verdict.
    Hang,
}

/// Decides what the tool does, given a tool test-case name and how many times it has been
/// started so far (1-based).
pub(crate) type Planner = Arc<dyn Fn(&str, u32) -> RunPlan + Send + Sync>;

pub(crate) fn planner(f: impl Fn(&str, u32) -> RunPlan + Send + Sync + 'static) -> Planner {
    Arc::new(f)
}

pub(crate) struct FakeTool {
    events: EventLog,
    planner: Planner,
    runs: Arc<Mutex<HashMap<String, u32>>>,
}

impl RemoteTool for FakeTool {
    fn open(&mut self, endpoint: &str, identity: &str) -> Result<ToolSession, SessionError> {
        if endpoint == "unreachable" {
            return Err(SessionError::Open {
                endpoint: endpoint.to_owned(),
                message: "connection refused".to_owned(),
            });
        }
        self.events.push(format!("open:{endpoint}:{identity}"));

        let (items_tx, items_rx) = mpsc::channel();
        let (replies_tx, replies_rx) = mpsc::channel();
        Ok(ToolSession {
            control: Box::new(FakeControl {
                endpoint: endpoint.to_owned(),
                events: self.events.clone(),
                planner: self.planner.clone(),
                runs: self.runs.clone(),
                items: items_tx,
                replies: replies_rx,
                current: None,
            }),
            callbacks: Box::new(FakeCallbacks {
                items: items_rx,
                replies: replies_tx,
            }),
        })
    }
}

struct FakeControl {
    endpoint: String,
    events: EventLog,
    planner: Planner,
    runs: Arc<Mutex<HashMap<String, u32>>>,
    items: mpsc::Sender<WorkItem>,
    replies: mpsc::Receiver<(u32, WorkItemResponse)>,
    current: Option<(String, RunPlan)>,
}

impl ToolControl for FakeControl {
    fn start_test_case(&mut self, _profile: &str, name: &str) -> Result<(), SessionError> {
        // Drop late answers from a previous run.
        while self.replies.try_recv().is_ok() {}

        let run = {
            let mut runs = self.runs.lock().unwrap();
            let run = runs.entry(name.to_owned()).or_default();
            *run += 1;
            *run
        };
        let plan = (self.planner)(name, run);
        self.events.push(format!("start:{name}"));
        for (wid, description) in &plan.callbacks {
            self.items
                .send(WorkItem::new(*wid, description.clone(), name))
                .map_err(|_| SessionError::Closed)?;
        }
        self.current = Some((name.to_owned(), plan));
        Ok(())
    }

    fn wait_verdict(&mut self, timeout: Duration) -> Result<Option<TestStatus>, SessionError> {
        let Some((name, plan)) = self.current.take() else {
            return Err(SessionError::Transport {
                message: "no test case running".to_owned(),
            });
        };
        let status = match plan.verdict {
            Verdict::Hang => {
                thread::sleep(timeout);
                return Ok(None);
            }
            Verdict::Report(status) => status,
        };

        let deadline = Instant::now() + timeout;
        for _ in 0..plan.callbacks.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.replies.recv_timeout(remaining) {
                Ok((wid, response)) => self.events.push(format!("reply:{wid}={response}")),
                Err(_) => return Ok(None),
            }
        }
        self.events.push(format!("verdict:{name}={status}"));
        Ok(Some(status))
    }

    fn stop_test_case(&mut self) -> Result<(), SessionError> {
        self.events.push(format!("stop:{}", self.endpoint));
        self.current = None;
        Ok(())
    }

    fn set_parameter(&mut self, _profile: &str, name: &str, value: &str) -> Result<(), SessionError> {
        self.events.push(format!("param:{name}={value}"));
        Ok(())
    }

    fn describe_test_case(&mut self, name: &str) -> Result<Option<String>, SessionError> {
        Ok(Some(format!("description of {name}")))
    }

    fn close(&mut self) {
        self.events.push(format!("close:{}", self.endpoint));
    }
}

struct FakeCallbacks {
    items: mpsc::Receiver<WorkItem>,
    replies: mpsc::Sender<(u32, WorkItemResponse)>,
}

impl CallbackEndpoint for FakeCallbacks {
    fn recv(&mut self, timeout: Duration) -> Result<Option<WorkItem>, SessionError> {
        match self.items.recv_timeout(timeout) {
            Ok(item) => Ok(Some(item)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(SessionError::Closed),
        }
    }

    fn reply(&mut self, item: &WorkItem, response: &WorkItemResponse) -> Result<(), SessionError> {
        self.replies
            .send((item.id, response.clone()))
            .map_err(|_| SessionError::Closed)
    }
}

/// A device that accepts every command except `hang`, which times out.
struct FakeDevice {
    events: EventLog,
}

impl DeviceClient for FakeDevice {
    fn send(&mut self, command: &DeviceCommand) -> Result<DeviceResponse, DeviceError> {
        self.events.push(format!("send:{}", command.name));
        if command.name == "hang" {
            return Err(DeviceError::Timeout {
                command: command.name.clone(),
                timeout: Duration::from_millis(10),
            });
        }
        Ok(DeviceResponse::default())
    }

    fn await_event(&mut self, kind: &str, timeout: Duration) -> Result<DeviceEvent, DeviceError> {
        Err(DeviceError::Timeout {
            command: kind.to_owned(),
            timeout,
        })
    }

    fn shutdown(&mut self) {
        self.events.push("shutdown");
    }
}

struct FakeConnector {
    events: EventLog,
}

impl DeviceConnector for FakeConnector {
    fn connect(
        &mut self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Box<dyn DeviceClient>, DeviceError> {
        self.events.push(format!("connect:{descriptor}"));
        Ok(Box::new(FakeDevice {
            events: self.events.clone(),
        }))
    }
}

struct FakePreparer {
    events: EventLog,
    failing: BTreeSet<String>,
}

impl DevicePreparer for FakePreparer {
    fn prepare(
        &mut self,
        configuration: &Configuration,
    ) -> Result<ConnectionDescriptor, PrepareError> {
        let name = configuration.name();
        self.events.push(format!("prepare:{name}"));
        if self.failing.contains(name) {
            return Err(PrepareError::EmptyCommand {
                configuration: name.to_owned(),
                index: 0,
            });
        }
        Ok(ConnectionDescriptor(format!("fake-{name}")))
    }
}

/// Builds a [`BatchRunner`] wired to the fakes.
pub(crate) struct Harness {
    pub(crate) events: EventLog,
    pub(crate) planner: Planner,
    pub(crate) endpoints: Vec<&'static str>,
    pub(crate) failing_configurations: Vec<&'static str>,
    pub(crate) attempt_timeout: Duration,
    pub(crate) history: Option<HistoryStore>,
}

impl Harness {
    pub(crate) fn new(planner: Planner) -> Self {
        Self {
            events: EventLog::default(),
            planner,
            endpoints: vec!["pts"],
            failing_configurations: Vec::new(),
            attempt_timeout: Duration::from_secs(5),
            history: None,
        }
    }

    pub(crate) fn build(&self) -> BatchRunner {
        let mut builder = BatchRunnerBuilder::default();
        builder
            .set_attempt_timeout(self.attempt_timeout)
            .set_callback_poll_interval(Duration::from_millis(10));
        if let Some(history) = &self.history {
            builder.set_history(history.clone());
        }

        let sessions = self
            .endpoints
            .iter()
            .enumerate()
            .map(|(index, endpoint)| SessionConfig {
                endpoint: (*endpoint).to_owned(),
                identity: if index == 0 { "IUT" } else { "LT2" }.to_owned(),
            })
            .collect();

        builder.build(
            sessions,
            Box::new(FakePreparer {
                events: self.events.clone(),
                failing: self
                    .failing_configurations
                    .iter()
                    .map(|name| (*name).to_owned())
                    .collect(),
            }),
            Box::new(FakeConnector {
                events: self.events.clone(),
            }),
            Box::new(FakeTool {
                events: self.events.clone(),
                planner: self.planner.clone(),
                runs: Arc::default(),
            }),
        )
    }
}

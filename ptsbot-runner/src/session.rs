// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sessions with the remote qualification tool.
//!
//! A session is split in two halves. The [`ToolControl`] half stays on the main thread and
//! starts, awaits and stops test cases. The [`CallbackEndpoint`] half moves to a dedicated
//! listener thread that receives callbacks, hands them to the [`DispatchBridge`] and sends the
//! responses back. Within a session, callbacks are answered in arrival order.

use crate::{
    config::SessionConfig,
    dispatch::{DispatchBridge, WorkItem, WorkItemResponse},
    errors::SessionError,
    reporter::TestStatus,
};
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, info, warn};

/// Opens sessions with the remote tool.
pub trait RemoteTool {
    /// Opens a session to the tool at `endpoint`, playing the role `identity`.
    fn open(&mut self, endpoint: &str, identity: &str) -> Result<ToolSession, SessionError>;
}

/// An open session, before it is split between threads.
pub struct ToolSession {
    /// The main-thread half.
    pub control: Box<dyn ToolControl>,

    /// The listener-thread half.
    pub callbacks: Box<dyn CallbackEndpoint>,
}

impl fmt::Debug for ToolSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolSession").finish_non_exhaustive()
    }
}

/// Controls test cases on the remote tool.
pub trait ToolControl: Send {
    /// Starts a test case. Returns once the tool has accepted it; the verdict comes later.
    fn start_test_case(&mut self, profile: &str, name: &str) -> Result<(), SessionError>;

    /// Waits up to `timeout` for the running test case's verdict. `Ok(None)` means the
    /// timeout expired.
    fn wait_verdict(&mut self, timeout: Duration) -> Result<Option<TestStatus>, SessionError>;

    /// Stops the running test case.
    fn stop_test_case(&mut self) -> Result<(), SessionError>;

    /// Updates a tool-side parameter for a profile, such as the IUT's address.
    fn set_parameter(
        &mut self,
        profile: &str,
        name: &str,
        value: &str,
    ) -> Result<(), SessionError>;

    /// Returns the tool's description of a test case, if it has one.
    fn describe_test_case(&mut self, name: &str) -> Result<Option<String>, SessionError>;

    /// Closes the session. Called once, before the control half is dropped.
    fn close(&mut self) {}
}

/// Receives callbacks from the remote tool and returns responses.
pub trait CallbackEndpoint: Send {
    /// Waits up to `timeout` for the next callback. `Ok(None)` means nothing arrived.
    /// [`SessionError::Closed`] ends the listener.
    fn recv(&mut self, timeout: Duration) -> Result<Option<WorkItem>, SessionError>;

    /// Sends the response to `item`.
    fn reply(&mut self, item: &WorkItem, response: &WorkItemResponse) -> Result<(), SessionError>;
}

/// An open session with its listener thread running.
pub struct SessionHandle {
    index: usize,
    config: SessionConfig,
    control: Box<dyn ToolControl>,
    shutdown: Arc<AtomicBool>,
    listener: Option<JoinHandle<()>>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("index", &self.index)
            .field("config", &self.config)
            .field("listening", &self.listener.is_some())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    /// Takes ownership of `session` and starts its listener thread, which answers callbacks
    /// through `bridge`.
    pub fn spawn(
        index: usize,
        config: SessionConfig,
        session: ToolSession,
        bridge: Arc<DispatchBridge>,
        poll_interval: Duration,
    ) -> Result<Self, SessionError> {
        let ToolSession { control, callbacks } = session;
        let shutdown = Arc::new(AtomicBool::new(false));

        let listener = Listener {
            index,
            callbacks,
            bridge,
            shutdown: shutdown.clone(),
            poll_interval,
        };
        let listener = thread::Builder::new()
            .name(format!("ptsbot-session-{index}"))
            .spawn(move || listener.run())
            .map_err(SessionError::SpawnListener)?;

        info!(
            session = index,
            endpoint = %config.endpoint,
            identity = %config.identity,
            "session opened"
        );
        Ok(Self {
            index,
            config,
            control,
            shutdown,
            listener: Some(listener),
        })
    }

    /// The session's index. Session 0 is the primary session.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The session's configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The main-thread half of the session.
    pub fn control(&mut self) -> &mut dyn ToolControl {
        &mut *self.control
    }

    /// Stops the listener thread and closes the session.
    pub fn close(mut self) {
        self.shutdown_listener();
        self.control.close();
        info!(session = self.index, "session closed");
    }

    fn shutdown_listener(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(listener) = self.listener.take()
            && listener.join().is_err()
        {
            warn!(session = self.index, "session listener panicked");
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        // Only stop the thread here: `close` is responsible for closing the control half.
        self.shutdown_listener();
    }
}

struct Listener {
    index: usize,
    callbacks: Box<dyn CallbackEndpoint>,
    bridge: Arc<DispatchBridge>,
    shutdown: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl Listener {
    fn run(mut self) {
        let session = self.index;
        debug!(session, "listener started");

        while !self.shutdown.load(Ordering::Acquire) {
            match self.callbacks.recv(self.poll_interval) {
                Ok(Some(item)) => {
                    let response = self.bridge.dispatch(session, &item);
                    if let Err(error) = self.callbacks.reply(&item, &response) {
                        warn!(session, wid = item.id, %error, "failed to send response");
                    }
                }
                Ok(None) => {}
                Err(SessionError::Closed) => {
                    info!(session, "remote tool closed the callback channel");
                    break;
                }
                Err(error) => {
                    warn!(session, %error, "error receiving callback");
                    thread::sleep(self.poll_interval);
                }
            }
        }

        debug!(session, "listener exiting");
    }
}

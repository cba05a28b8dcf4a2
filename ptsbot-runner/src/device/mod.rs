// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The device-protocol side: commands sent to the IUT and events received from it.
//!
//! The binary framing of the protocol is not handled here. A [`DeviceClient`] implementation
//! turns a [`DeviceCommand`] into bytes on the wire and hands back the response payload.

mod gap;
mod gatt;
mod prepare;

pub use gap::*;
pub use gatt::*;
pub use prepare::*;

use crate::errors::DeviceError;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tracing::debug;

/// A command to send to the IUT: a command name and its arguments.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct DeviceCommand {
    /// The command name, e.g. `gap_set_conn`.
    pub name: String,

    /// Arguments, in the order the command expects them.
    #[serde(default)]
    pub args: Vec<String>,
}

impl DeviceCommand {
    /// Creates a command with no arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Appends an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// The payload of a successful response.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeviceResponse {
    /// The raw response payload.
    pub data: Vec<u8>,
}

/// An asynchronous event received from the IUT.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceEvent {
    /// The event kind, e.g. `gap_passkey_display`.
    pub kind: String,

    /// The raw event payload.
    pub data: Vec<u8>,
}

/// Opaque description of how to reach a freshly prepared device (a serial port, a socket
/// path, ...).
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ConnectionDescriptor(pub String);

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A connection to the IUT.
pub trait DeviceClient: Send {
    /// Sends a command and waits for its response.
    fn send(&mut self, command: &DeviceCommand) -> Result<DeviceResponse, DeviceError>;

    /// Waits for an event of the given kind.
    fn await_event(&mut self, kind: &str, timeout: Duration) -> Result<DeviceEvent, DeviceError>;

    /// Closes the connection. Called once, before the client is dropped.
    fn shutdown(&mut self) {}
}

/// Establishes connections to a prepared device.
pub trait DeviceConnector {
    /// Connects to the device described by `descriptor`.
    fn connect(
        &mut self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Box<dyn DeviceClient>, DeviceError>;
}

/// A shared slot holding the current device connection, if any.
///
/// Every step and every handler reaches the device through this handle. The mutex makes sure
/// exactly one actor uses the connection at a time; commands are never pipelined. A timed-out
/// attempt tears the connection down, after which calls fail with
/// [`DeviceError::NotConnected`] until the orchestrator installs a new one.
#[derive(Clone, Default)]
pub struct DeviceHandle {
    slot: Arc<Mutex<Option<Box<dyn DeviceClient>>>>,
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl DeviceHandle {
    /// Creates a handle with no connection installed.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Box<dyn DeviceClient>>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs a new connection, shutting down the previous one if present.
    pub fn install(&self, client: Box<dyn DeviceClient>) {
        let previous = self.lock().replace(client);
        if let Some(mut previous) = previous {
            debug!("replacing existing device connection");
            previous.shutdown();
        }
    }

    /// Shuts down and removes the current connection.
    ///
    /// Waits for an in-flight command to finish first; that wait is bounded by the client's own
    /// I/O timeouts.
    pub fn teardown(&self) {
        let client = self.lock().take();
        if let Some(mut client) = client {
            debug!("tearing down device connection");
            client.shutdown();
        }
    }

    /// Returns true if a connection is installed.
    pub fn is_connected(&self) -> bool {
        self.lock().is_some()
    }

    /// Sends a command over the current connection.
    pub fn send(&self, command: &DeviceCommand) -> Result<DeviceResponse, DeviceError> {
        let mut guard = self.lock();
        let client = guard.as_mut().ok_or(DeviceError::NotConnected)?;
        debug!(%command, "sending device command");
        client.send(command)
    }

    /// Waits for an event over the current connection.
    ///
    /// The connection stays locked while waiting.
    pub fn await_event(&self, kind: &str, timeout: Duration) -> Result<DeviceEvent, DeviceError> {
        let mut guard = self.lock();
        let client = guard.as_mut().ok_or(DeviceError::NotConnected)?;
        client.await_event(kind, timeout)
    }
}

// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by ptsbot.

use camino::Utf8PathBuf;
use config::ConfigError;
use std::{any::Any, borrow::Cow, error::Error, fmt, time::Duration};
use thiserror::Error;

/// An error that occurred while parsing the bot configuration.
#[derive(Debug, Error)]
#[error("failed to parse ptsbot config at `{config_file}`")]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    kind: ConfigParseErrorKind,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, kind: ConfigParseErrorKind) -> Self {
        Self {
            config_file: config_file.into(),
            kind,
        }
    }

    /// Returns the config file for this error.
    pub fn config_file(&self) -> &Utf8PathBuf {
        &self.config_file
    }

    /// Returns the kind of error this is.
    pub fn kind(&self) -> &ConfigParseErrorKind {
        &self.kind
    }
}

/// The kind of error that occurred while parsing the bot configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigParseErrorKind {
    /// An error occurred while building the config.
    #[error(transparent)]
    BuildError(Box<ConfigError>),

    /// An error occurred while deserializing the config.
    #[error(transparent)]
    DeserializeError(Box<ConfigError>),

    /// No remote-tool sessions were configured.
    #[error("at least one [[session]] must be configured")]
    NoSessions,

    /// A device configuration declared both an allow-list and a deny-list.
    #[error("configuration `{name}` sets both `allow` and `deny`")]
    AllowAndDeny {
        /// The name of the device configuration.
        name: String,
    },
}

/// An error that occurred while loading a test-case catalog.
#[derive(Debug, Error)]
#[error("failed to load test-case catalog from {source_name}")]
#[non_exhaustive]
pub struct CatalogParseError {
    source_name: String,
    #[source]
    kind: CatalogParseErrorKind,
}

impl CatalogParseError {
    pub(crate) fn new(source_name: impl Into<String>, kind: CatalogParseErrorKind) -> Self {
        Self {
            source_name: source_name.into(),
            kind,
        }
    }

    /// Returns the kind of error this is.
    pub fn kind(&self) -> &CatalogParseErrorKind {
        &self.kind
    }
}

/// The kind of error that occurred while loading a test-case catalog.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CatalogParseErrorKind {
    /// The catalog file could not be read.
    #[error("error reading catalog file")]
    Read(#[source] std::io::Error),

    /// The catalog is not valid TOML, or doesn't have the expected shape.
    #[error("error deserializing catalog")]
    Toml(#[source] toml::de::Error),

    /// A key in an `edit` or `verify` table is not a callback id.
    #[error("in test case `{test_case}`, `{key}` is not a valid callback id")]
    InvalidCallbackId {
        /// The test case with the invalid key.
        test_case: String,

        /// The key that failed to parse.
        key: String,
    },

    /// Two test cases share an identifier.
    #[error("test case `{name}` is defined more than once")]
    DuplicateTestCase {
        /// The duplicated test-case identifier.
        name: String,
    },

    /// A step entry is inconsistent, e.g. it names both a command and a builtin.
    #[error("in test case `{test_case}`, step #{index} is invalid: {message}")]
    InvalidStep {
        /// The test case with the invalid step.
        test_case: String,

        /// The zero-based index of the step.
        index: usize,

        /// What is wrong with the step.
        message: &'static str,
    },

    /// A test case refers to a handler set that wasn't registered.
    #[error("test case `{test_case}` uses unknown handler set `{handler}`")]
    UnknownHandler {
        /// The test case referring to the handler set.
        test_case: String,

        /// The unknown handler set name.
        handler: String,
    },
}

/// A free-text description from the remote tool didn't contain what a handler was looking for.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("failed to parse {what} from description `{description}`")]
pub struct DescriptionParseError {
    what: &'static str,
    description: String,
}

impl DescriptionParseError {
    pub(crate) fn new(what: &'static str, description: impl Into<String>) -> Self {
        Self {
            what,
            description: description.into(),
        }
    }

    /// Returns what the parser was looking for.
    pub fn what(&self) -> &'static str {
        self.what
    }
}

/// An error returned by the device protocol client.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DeviceError {
    /// The device did not respond in time.
    #[error("device did not respond to `{command}` within {timeout:?}")]
    Timeout {
        /// The command (or awaited event kind) that timed out.
        command: String,

        /// How long we waited.
        timeout: Duration,
    },

    /// The device responded with a non-success status.
    #[error("device returned status {status:#04x} for `{command}`")]
    Status {
        /// The command that failed.
        command: String,

        /// The status code returned.
        status: u8,
    },

    /// The response payload didn't have the expected layout.
    #[error("malformed response to `{command}`: {message}")]
    MalformedResponse {
        /// The command whose response was malformed.
        command: String,

        /// What was wrong with it.
        message: Cow<'static, str>,
    },

    /// No connection to the device is currently established.
    #[error("no connection to the device is established")]
    NotConnected,

    /// The underlying transport failed.
    #[error("device transport error")]
    Transport(#[source] std::io::Error),
}

impl DeviceError {
    pub(crate) fn malformed(
        command: impl Into<String>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::MalformedResponse {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Returns true if this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// An error that occurred while preparing (building and flashing) the device.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PrepareError {
    /// A preparation command failed to run or exited with a non-zero status.
    #[error("for configuration `{configuration}`, running `{}` failed", shell_join(command))]
    Command {
        /// The device configuration being prepared.
        configuration: String,

        /// The command that was run.
        command: Vec<String>,

        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// A preparation command was configured with no program.
    #[error("for configuration `{configuration}`, command #{index} is empty")]
    EmptyCommand {
        /// The device configuration being prepared.
        configuration: String,

        /// The zero-based index of the empty command.
        index: usize,
    },
}

fn shell_join(command: &[String]) -> String {
    itertools::join(command, " ")
}

/// An error returned by a remote-tool session.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionError {
    /// The session could not be opened.
    #[error("failed to open session to `{endpoint}`: {message}")]
    Open {
        /// The endpoint that was connected to.
        endpoint: String,

        /// The reason the session couldn't be opened.
        message: String,
    },

    /// The session was closed by the remote tool.
    #[error("session was closed by the remote tool")]
    Closed,

    /// A transport-level error occurred.
    #[error("session transport error: {message}")]
    Transport {
        /// A description of the error.
        message: String,
    },

    /// The dedicated listener thread couldn't be spawned.
    #[error("failed to spawn callback listener thread")]
    SpawnListener(#[source] std::io::Error),

    /// The session has no secondary role with this index.
    #[error("test case needs session {index}, but only {open} session(s) are open")]
    MissingSession {
        /// The requested session index.
        index: usize,

        /// The number of open sessions.
        open: usize,
    },
}

/// An error raised by a work-item handler.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HandlerError {
    /// The description couldn't be parsed.
    #[error(transparent)]
    Parse(#[from] DescriptionParseError),

    /// A device call made by the handler failed.
    #[error("device call failed")]
    Device(#[from] DeviceError),

    /// Shared test state the handler relies on was never populated.
    #[error("{what} is not known yet")]
    MissingState {
        /// The missing piece of state.
        what: &'static str,
    },

    /// The handler panicked.
    #[error("handler panicked: {message}")]
    Panicked {
        /// The panic payload, if it was a string.
        message: String,
    },
}

/// An error raised by a scripted step.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StepError {
    /// A device call made by the step failed.
    #[error("device call failed")]
    Device(#[from] DeviceError),

    /// A call to the remote tool failed.
    #[error("remote tool call failed")]
    Session(#[from] SessionError),

    /// Shared test state the step relies on was never populated.
    #[error("{what} is not known yet")]
    MissingState {
        /// The missing piece of state.
        what: &'static str,
    },

    /// The step failed for another reason.
    #[error("{message}")]
    Failed {
        /// A description of the failure.
        message: String,
    },

    /// The step panicked.
    #[error("step panicked: {message}")]
    Panicked {
        /// The panic payload, if it was a string.
        message: String,
    },
}

impl StepError {
    /// Returns true if this error was caused by the device not responding in time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Device(error) if error.is_timeout())
    }
}

/// A device configuration could not be brought up; none of its test cases ran.
#[derive(Debug, Error)]
#[error("infrastructure failure for configuration `{configuration}`")]
pub struct InfrastructureFailure {
    configuration: String,
    #[source]
    kind: InfrastructureFailureKind,
}

impl InfrastructureFailure {
    pub(crate) fn new(configuration: impl Into<String>, kind: InfrastructureFailureKind) -> Self {
        Self {
            configuration: configuration.into(),
            kind,
        }
    }

    /// The configuration that failed.
    pub fn configuration(&self) -> &str {
        &self.configuration
    }

    /// The kind of failure.
    pub fn kind(&self) -> &InfrastructureFailureKind {
        &self.kind
    }
}

/// The kind of infrastructure failure.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InfrastructureFailureKind {
    /// Building or flashing the device failed.
    #[error("device preparation failed")]
    Prepare(#[source] PrepareError),

    /// Connecting to the device failed.
    #[error("connecting to the device failed")]
    Connect(#[source] DeviceError),

    /// Opening a remote-tool session failed.
    #[error("opening session {index} failed")]
    SessionOpen {
        /// The index of the session that failed to open.
        index: usize,

        /// The underlying error.
        #[source]
        error: SessionError,
    },
}

/// Errors that can occur when loading status history.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HistoryLoadError {
    /// Error reading the history file.
    #[error("failed to read history file at {path}")]
    Read {
        /// The path that failed to be read.
        path: Utf8PathBuf,
        /// The underlying IO error.
        #[source]
        error: std::io::Error,
    },

    /// Error deserializing the history.
    #[error("failed to deserialize history at {path}")]
    Deserialize {
        /// The path that failed to be deserialized.
        path: Utf8PathBuf,
        /// The underlying deserialization error.
        #[source]
        error: serde_json::Error,
    },

    /// The history was written by an incompatible version.
    #[error("history at {path} has version {actual}, expected {expected}")]
    VersionMismatch {
        /// The path with the mismatched version.
        path: Utf8PathBuf,
        /// The expected version.
        expected: u32,
        /// The version found on disk.
        actual: u32,
    },
}

/// Errors that can occur when saving status history.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HistorySaveError {
    /// Error creating the parent directory.
    #[error("failed to create directory {path}")]
    CreateDir {
        /// The directory that couldn't be created.
        path: Utf8PathBuf,
        /// The underlying IO error.
        #[source]
        error: std::io::Error,
    },

    /// Error serializing the history.
    #[error("failed to serialize history")]
    Serialize {
        /// The underlying serialization error.
        #[source]
        error: serde_json::Error,
    },

    /// Error writing the history file.
    #[error("failed to write history file at {path}")]
    Write {
        /// The path that failed to be written.
        path: Utf8PathBuf,
        /// The underlying IO error.
        #[source]
        error: std::io::Error,
    },
}

/// Extracts the message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "(non-string panic payload)".to_owned()
    }
}

/// Displays an error along with all of its sources, separated by `: `.
///
/// Used wherever an error has to be flattened into the free-text description attached to a
/// terminal status.
pub struct DisplayErrorChain<E>(E);

impl<E: Error> DisplayErrorChain<E> {
    /// Creates a new chain displayer.
    pub fn new(error: E) -> Self {
        Self(error)
    }
}

impl<E: Error> fmt::Display for DisplayErrorChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(error) = source {
            write!(f, ": {error}")?;
            source = error.source();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_chain_includes_sources() {
        let error = InfrastructureFailure::new(
            "privacy",
            InfrastructureFailureKind::Connect(DeviceError::NotConnected),
        );
        assert_eq!(
            DisplayErrorChain::new(&error).to_string(),
            "infrastructure failure for configuration `privacy`: \
             connecting to the device failed: \
             no connection to the device is established",
        );
    }

    #[test]
    fn step_timeout_detection() {
        let timeout = StepError::Device(DeviceError::Timeout {
            command: "gap_conn".to_owned(),
            timeout: Duration::from_secs(5),
        });
        assert!(timeout.is_timeout());

        let status = StepError::Device(DeviceError::Status {
            command: "gap_conn".to_owned(),
            status: 0x01,
        });
        assert!(!status.is_timeout());
    }
}

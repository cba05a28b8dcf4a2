// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Preparing the device for a configuration: building and flashing firmware.

use super::ConnectionDescriptor;
use crate::{config::Configuration, errors::PrepareError};
use camino::Utf8PathBuf;
use tracing::{debug, info};

/// Builds and flashes the device for a configuration.
///
/// This runs synchronously and may take minutes. An error is fatal only for the configuration
/// being prepared.
pub trait DevicePreparer {
    /// Prepares the device and returns how to connect to it.
    fn prepare(
        &mut self,
        configuration: &Configuration,
    ) -> Result<ConnectionDescriptor, PrepareError>;
}

/// A [`DevicePreparer`] that runs a fixed list of external commands in order.
///
/// The configuration's overlay is exported to each command as `PTSBOT_OVERLAY_<KEY>`
/// environment variables, and the configuration name as `PTSBOT_CONFIGURATION`.
#[derive(Clone, Debug)]
pub struct CommandPreparer {
    commands: Vec<Vec<String>>,
    cwd: Option<Utf8PathBuf>,
    connection: ConnectionDescriptor,
}

impl CommandPreparer {
    /// Creates a new command preparer.
    pub fn new(
        commands: Vec<Vec<String>>,
        cwd: Option<Utf8PathBuf>,
        connection: ConnectionDescriptor,
    ) -> Self {
        Self {
            commands,
            cwd,
            connection,
        }
    }

    fn overlay_var(key: &str) -> String {
        let key: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("PTSBOT_OVERLAY_{key}")
    }
}

impl DevicePreparer for CommandPreparer {
    fn prepare(
        &mut self,
        configuration: &Configuration,
    ) -> Result<ConnectionDescriptor, PrepareError> {
        info!(
            configuration = configuration.name(),
            commands = self.commands.len(),
            "preparing device"
        );

        for (index, command) in self.commands.iter().enumerate() {
            let Some((program, args)) = command.split_first() else {
                return Err(PrepareError::EmptyCommand {
                    configuration: configuration.name().to_owned(),
                    index,
                });
            };

            let mut expression = duct::cmd(program.as_str(), args)
                .env("PTSBOT_CONFIGURATION", configuration.name())
                .stdout_to_stderr();
            for (key, value) in configuration.overlay() {
                expression = expression.env(Self::overlay_var(key), value);
            }
            if let Some(cwd) = &self.cwd {
                expression = expression.dir(cwd.as_std_path());
            }

            debug!(command = ?command, "running preparation command");
            expression.run().map_err(|error| PrepareError::Command {
                configuration: configuration.name().to_owned(),
                command: command.clone(),
                error,
            })?;
        }

        Ok(self.connection.clone())
    }
}

// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration support for ptsbot.
//!
//! The config file is layered over the defaults embedded in the binary (see
//! `default-config.toml`). Unknown keys are reported as warnings, not errors.

mod configuration;
mod retry_policy;

pub use configuration::*;
pub use retry_policy::*;

use crate::{
    device::{CommandPreparer, ConnectionDescriptor},
    errors::{ConfigParseError, ConfigParseErrorKind},
};
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, ConfigBuilder, File, FileFormat, builder::DefaultState};
use indexmap::IndexMap;
use serde::Deserialize;
use std::{collections::BTreeSet, time::Duration};
use tracing::warn;

/// The default location of the config file, relative to the current directory.
pub const DEFAULT_CONFIG_PATH: &str = ".config/ptsbot.toml";

/// Overall configuration for ptsbot.
#[derive(Clone, Debug)]
pub struct BotConfig {
    config_file: Utf8PathBuf,
    run: RunConfig,
    sessions: Vec<SessionConfig>,
    prepare: Option<PrepareConfig>,
    configurations: Configurations,
    unknown_keys: BTreeSet<String>,
}

impl BotConfig {
    /// The default configuration, as a TOML string.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../../default-config.toml");

    /// Reads the config file at `config_file`, layered over the defaults.
    pub fn from_path(config_file: &Utf8Path) -> Result<Self, ConfigParseError> {
        let source = File::new(config_file.as_str(), FileFormat::Toml);
        Self::from_builder(config_file, Self::make_default_config().add_source(source))
    }

    /// Parses a config from a TOML string, layered over the defaults. `name` is used for
    /// error messages.
    pub fn from_toml_str(name: &str, contents: &str) -> Result<Self, ConfigParseError> {
        let source = File::from_str(contents, FileFormat::Toml);
        Self::from_builder(Utf8Path::new(name), Self::make_default_config().add_source(source))
    }

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    fn from_builder(
        config_file: &Utf8Path,
        builder: ConfigBuilder<DefaultState>,
    ) -> Result<Self, ConfigParseError> {
        let (deserialized, unknown_keys) = Self::build_and_deserialize_config(builder)
            .map_err(|kind| ConfigParseError::new(config_file, kind))?;

        if !unknown_keys.is_empty() {
            warn!(
                "in config file {config_file}, ignoring unknown configuration keys: {}",
                itertools::join(&unknown_keys, ", ")
            );
        }

        let BotConfigDeserialize {
            run,
            sessions,
            prepare,
            configurations,
        } = deserialized;

        if sessions.is_empty() {
            return Err(ConfigParseError::new(
                config_file,
                ConfigParseErrorKind::NoSessions,
            ));
        }

        let configurations = if configurations.is_empty() {
            Configurations::single_default()
        } else {
            let configurations = configurations
                .into_iter()
                .map(|(name, configuration)| configuration.into_configuration(name))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|kind| ConfigParseError::new(config_file, kind))?;
            Configurations::new(configurations)
        };

        Ok(Self {
            config_file: config_file.to_owned(),
            run,
            sessions,
            prepare,
            configurations,
            unknown_keys,
        })
    }

    /// This returns a tuple of (config, ignored paths).
    fn build_and_deserialize_config(
        builder: ConfigBuilder<DefaultState>,
    ) -> Result<(BotConfigDeserialize, BTreeSet<String>), ConfigParseErrorKind> {
        let config = builder
            .build()
            .map_err(|error| ConfigParseErrorKind::BuildError(Box::new(error)))?;

        let mut ignored = BTreeSet::new();
        let mut cb = |path: serde_ignored::Path| {
            ignored.insert(path.to_string());
        };
        let ignored_de = serde_ignored::Deserializer::new(config, &mut cb);
        let config = BotConfigDeserialize::deserialize(ignored_de)
            .map_err(|error| ConfigParseErrorKind::DeserializeError(Box::new(error)))?;

        Ok((config, ignored))
    }

    /// The file this config was read from.
    pub fn config_file(&self) -> &Utf8Path {
        &self.config_file
    }

    /// Options for running test cases.
    pub fn run(&self) -> &RunConfig {
        &self.run
    }

    /// Remote-tool sessions to open, primary first.
    pub fn sessions(&self) -> &[SessionConfig] {
        &self.sessions
    }

    /// How to prepare the device, if configured.
    pub fn prepare(&self) -> Option<&PrepareConfig> {
        self.prepare.as_ref()
    }

    /// Device configurations, in declaration order.
    pub fn configurations(&self) -> &Configurations {
        &self.configurations
    }

    /// Keys in the config file that were not recognized.
    pub fn unknown_keys(&self) -> &BTreeSet<String> {
        &self.unknown_keys
    }

    /// Returns a [`CommandPreparer`] for the `[prepare]` section, if present.
    pub fn command_preparer(&self) -> Option<CommandPreparer> {
        self.prepare.as_ref().map(|prepare| {
            CommandPreparer::new(
                prepare.commands.clone(),
                prepare.cwd.clone(),
                prepare.connection.clone(),
            )
        })
    }
}

/// The `[run]` section.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunConfig {
    /// Retries for test cases that did not pass.
    #[serde(deserialize_with = "retry_policy::deserialize_retry_policy")]
    pub retry: RetryPolicy,

    /// Wall-clock budget for a single attempt.
    #[serde(with = "humantime_serde")]
    pub attempt_timeout: Duration,

    /// How long a session listener blocks waiting for a callback.
    #[serde(with = "humantime_serde")]
    pub callback_poll_interval: Duration,

    /// The status history file.
    pub history_file: Utf8PathBuf,
}

/// A `[[session]]` entry: one remote-tool instance.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct SessionConfig {
    /// Where the remote tool listens.
    pub endpoint: String,

    /// The role the session plays towards the tool.
    #[serde(default = "default_identity")]
    pub identity: String,
}

fn default_identity() -> String {
    "IUT".to_owned()
}

/// The `[prepare]` section.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PrepareConfig {
    /// Commands to run, in order. Each is a program followed by its arguments.
    pub commands: Vec<Vec<String>>,

    /// The working directory for the commands.
    #[serde(default)]
    pub cwd: Option<Utf8PathBuf>,

    /// The connection descriptor handed to the device connector once preparation succeeds.
    pub connection: ConnectionDescriptor,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct BotConfigDeserialize {
    run: RunConfig,
    #[serde(default, rename = "session")]
    sessions: Vec<SessionConfig>,
    #[serde(default)]
    prepare: Option<PrepareConfig>,
    #[serde(default, rename = "configuration")]
    configurations: IndexMap<String, DeserializedConfiguration>,
}

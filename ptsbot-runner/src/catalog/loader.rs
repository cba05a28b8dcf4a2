// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Loading catalogs from TOML.
//!
//! ```toml
//! [[test-case]]
//! profile = "GATT"
//! name = "GATT/SR/GAR/BV-01-C"
//! handler = "gatt"
//! steps = [
//!     { builtin = "read-controller-info" },
//!     { builtin = "set-tool-parameter", parameter = "TSPX_bd_addr_iut", state = "iut-address" },
//!     { command = "gap_set_conn", after-callback = 1 },
//! ]
//! cleanup = [{ command = "gap_disconnect" }]
//! edit = { "100" = "0000", "101" = { state = "passkey" } }
//! verify = { "17" = ["1800"] }
//! companion = [{ session = 1, name = "GATT/SR/GAR/BV-01-C-LT2" }]
//! ```

use super::{Catalog, EditValue, Step, TestCase, VerifyPredicate};
use crate::{
    device::DeviceCommand,
    errors::{CatalogParseError, CatalogParseErrorKind, StepError},
    handlers::{self, HandlerSets, StateKey},
};
use camino::Utf8Path;
use serde::Deserialize;
use std::{collections::BTreeMap, time::Duration};
use tracing::debug;

const DEFAULT_PASSKEY_TIMEOUT: Duration = Duration::from_secs(30);

impl Catalog {
    /// Loads a catalog from a TOML file.
    pub fn from_path(path: &Utf8Path, handlers: &HandlerSets) -> Result<Self, CatalogParseError> {
        let contents = std::fs::read_to_string(path).map_err(|error| {
            CatalogParseError::new(path.as_str(), CatalogParseErrorKind::Read(error))
        })?;
        Self::from_toml_str(path.as_str(), &contents, handlers)
    }

    /// Loads a catalog from TOML source. `source_name` is used in error messages.
    pub fn from_toml_str(
        source_name: &str,
        contents: &str,
        handlers: &HandlerSets,
    ) -> Result<Self, CatalogParseError> {
        let deserialized: DeserializedCatalog = toml::from_str(contents).map_err(|error| {
            CatalogParseError::new(source_name, CatalogParseErrorKind::Toml(error))
        })?;

        let mut catalog = Self::default();
        for case in deserialized.test_case {
            let case = case
                .into_test_case(handlers)
                .and_then(|case| catalog.insert(case));
            case.map_err(|kind| CatalogParseError::new(source_name, kind))?;
        }
        debug!(source_name, test_cases = catalog.len(), "loaded catalog");
        Ok(catalog)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct DeserializedCatalog {
    #[serde(default)]
    test_case: Vec<DeserializedTestCase>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct DeserializedTestCase {
    profile: String,
    name: String,
    #[serde(default)]
    handler: Option<String>,
    #[serde(default)]
    steps: Vec<DeserializedStep>,
    #[serde(default)]
    cleanup: Vec<DeserializedCommand>,
    #[serde(default)]
    edit: BTreeMap<String, DeserializedEdit>,
    #[serde(default)]
    verify: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    companion: Vec<DeserializedCompanion>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct DeserializedStep {
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    builtin: Option<Builtin>,
    #[serde(default)]
    parameter: Option<String>,
    #[serde(default)]
    state: Option<StateKey>,
    #[serde(default, with = "humantime_serde")]
    timeout: Option<Duration>,
    #[serde(default)]
    before_callback: Option<u32>,
    #[serde(default)]
    after_callback: Option<u32>,
}

#[derive(Copy, Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum Builtin {
    ReadControllerInfo,
    AwaitPasskey,
    SetToolParameter,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct DeserializedCommand {
    command: String,
    #[serde(default)]
    args: Vec<String>,
}

impl DeserializedCommand {
    fn into_command(self) -> DeviceCommand {
        DeviceCommand {
            name: self.command,
            args: self.args,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DeserializedEdit {
    Literal(String),
    State { state: StateKey },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeserializedCompanion {
    session: usize,
    name: String,
}

impl DeserializedTestCase {
    fn into_test_case(
        self,
        handler_sets: &HandlerSets,
    ) -> Result<TestCase, CatalogParseErrorKind> {
        let Self {
            profile,
            name,
            handler,
            steps,
            cleanup,
            edit,
            verify,
            companion,
        } = self;

        let mut builder = TestCase::builder(profile, name.clone());

        if let Some(handler) = handler {
            let registry = handler_sets.get(&handler).ok_or_else(|| {
                CatalogParseErrorKind::UnknownHandler {
                    test_case: name.clone(),
                    handler: handler.clone(),
                }
            })?;
            builder = builder.handlers(registry.clone());
        }

        for (index, step) in steps.into_iter().enumerate() {
            builder = builder.step(step.into_step(&name, index)?);
        }

        for command in cleanup {
            let command = command.into_command();
            builder = builder.step(Step::cleanup(command.to_string(), move |cx| {
                cx.device.send(&command).map(|_| ()).map_err(StepError::from)
            }));
        }

        for (key, value) in edit {
            let id = parse_callback_id(&name, &key)?;
            let value = match value {
                DeserializedEdit::Literal(value) => EditValue::Literal(value),
                DeserializedEdit::State { state } => handlers::state_producer(state),
            };
            builder = builder.edit(id, value);
        }

        for (key, needles) in verify {
            let id = parse_callback_id(&name, &key)?;
            builder = builder.verify(id, VerifyPredicate::ContainsAll(needles));
        }

        for DeserializedCompanion { session, name } in companion {
            builder = builder.companion(session, name);
        }

        Ok(builder.build())
    }
}

impl DeserializedStep {
    fn into_step(self, test_case: &str, index: usize) -> Result<Step, CatalogParseErrorKind> {
        let invalid = |message| CatalogParseErrorKind::InvalidStep {
            test_case: test_case.to_owned(),
            index,
            message,
        };

        let step = match (self.command, self.builtin) {
            (Some(_), Some(_)) => return Err(invalid("both `command` and `builtin` are set")),
            (None, None) => return Err(invalid("one of `command` or `builtin` must be set")),
            (Some(name), None) => Step::device(DeviceCommand {
                name,
                args: self.args,
            }),
            (None, Some(Builtin::ReadControllerInfo)) => handlers::read_controller_info(),
            (None, Some(Builtin::AwaitPasskey)) => {
                handlers::await_passkey(self.timeout.unwrap_or(DEFAULT_PASSKEY_TIMEOUT))
            }
            (None, Some(Builtin::SetToolParameter)) => {
                let (Some(parameter), Some(state)) = (self.parameter, self.state) else {
                    return Err(invalid(
                        "`set-tool-parameter` needs both `parameter` and `state`",
                    ));
                };
                handlers::set_tool_parameter(parameter, state)
            }
        };

        let step = match self.before_callback {
            Some(id) => step.before_callback(id),
            None => step,
        };
        Ok(match self.after_callback {
            Some(id) => step.after_callback(id),
            None => step,
        })
    }
}

fn parse_callback_id(test_case: &str, key: &str) -> Result<u32, CatalogParseErrorKind> {
    key.parse()
        .map_err(|_| CatalogParseErrorKind::InvalidCallbackId {
            test_case: test_case.to_owned(),
            key: key.to_owned(),
        })
}

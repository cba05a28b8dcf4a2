// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ready-made steps and edit producers that work with shared test state.

use crate::{
    catalog::{EditValue, Step},
    device,
    errors::StepError,
    state::SharedState,
};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

/// A piece of shared test state that can be handed to the tool.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum StateKey {
    /// The IUT's address, as 12 hex digits.
    IutAddress,

    /// The pending passkey, as 6 decimal digits. Reading it consumes it.
    Passkey,

    /// A free-form value stored under this key.
    Value(String),
}

impl StateKey {
    /// Reads this key from `state`.
    pub fn read(&self, state: &SharedState) -> Option<String> {
        match self {
            Self::IutAddress => state.lock().iut_address.map(|addr| addr.to_string()),
            Self::Passkey => state.take_passkey().map(|passkey| format!("{passkey:06}")),
            Self::Value(key) => state.lock().values.get(key).cloned(),
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Self::IutAddress => "IUT address",
            Self::Passkey => "passkey",
            Self::Value(_) => "stored value",
        }
    }
}

/// Reads controller information from the IUT and stores its address, address type and
/// settings in shared state.
pub fn read_controller_info() -> Step {
    Step::local("read-controller-info", |cx| {
        let info = device::gap_read_ctrl_info(cx.device)?;
        let mut state = cx.state.lock();
        state.iut_address = Some(info.address);
        state.iut_address_type = info.address_type();
        state.supported_settings = info.supported_settings;
        state.current_settings = info.current_settings;
        info!(address = %info.address, "read IUT controller info");
        Ok(())
    })
}

/// Waits up to `timeout` for the IUT to display a passkey and stores it.
pub fn await_passkey(timeout: Duration) -> Step {
    Step::local("await-passkey", move |cx| {
        let passkey = device::gap_await_passkey(cx.device, timeout)?;
        debug!(passkey, "IUT displayed passkey");
        cx.state.lock().passkey = Some(passkey);
        Ok(())
    })
}

/// Sets the tool parameter `name` for the test case's profile to a value read from shared
/// state.
pub fn set_tool_parameter(name: impl Into<String>, key: StateKey) -> Step {
    let name = name.into();
    Step::local(format!("set-tool-parameter {name}"), move |cx| {
        let value = key.read(cx.state).ok_or(StepError::MissingState {
            what: key.describe(),
        })?;
        debug!(parameter = %name, %value, "setting tool parameter");
        cx.tool
            .set_parameter(cx.test_case.profile(), &name, &value)
            .map_err(StepError::from)
    })
}

/// An edit value produced from shared state when the callback arrives.
pub fn state_producer(key: StateKey) -> EditValue {
    EditValue::producer(move |state| key.read(state))
}

/// An edit value answering with the passkey the IUT displayed.
pub fn passkey_producer() -> EditValue {
    state_producer(StateKey::Passkey)
}

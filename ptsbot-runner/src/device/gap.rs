// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed helpers for GAP commands and events.

use super::{DeviceCommand, DeviceEvent, DeviceHandle};
use crate::{
    errors::DeviceError,
    state::{AddressType, BdAddr},
};
use std::time::Duration;

/// Bit positions in the GAP settings bitmasks reported by the controller.
pub mod settings {
    /// Powered.
    pub const POWERED: u32 = 0;
    /// Connectable.
    pub const CONNECTABLE: u32 = 1;
    /// Discoverable.
    pub const DISCOVERABLE: u32 = 3;
    /// Bondable.
    pub const BONDABLE: u32 = 4;
    /// Low energy.
    pub const LE: u32 = 9;
    /// Advertising.
    pub const ADVERTISING: u32 = 10;
    /// Secure connections.
    pub const SC: u32 = 11;
    /// Privacy: the controller uses a random address.
    pub const PRIVACY: u32 = 13;
}

/// The event kind carrying a passkey the IUT wants displayed.
pub const PASSKEY_DISPLAY_EVENT: &str = "gap_passkey_display";

/// Information returned by `gap_read_ctrl_info`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ControllerInfo {
    /// The controller's address.
    pub address: BdAddr,

    /// Supported settings bitmask.
    pub supported_settings: u32,

    /// Current settings bitmask.
    pub current_settings: u32,
}

impl ControllerInfo {
    const COMMAND: &'static str = "gap_read_ctrl_info";

    /// Decodes the response payload: a little-endian address followed by two little-endian
    /// settings bitmasks. Trailing fields (class of device, names) are ignored.
    pub fn decode(data: &[u8]) -> Result<Self, DeviceError> {
        if data.len() < 14 {
            return Err(DeviceError::malformed(
                Self::COMMAND,
                format!("expected at least 14 bytes, got {}", data.len()),
            ));
        }
        let mut address = [0; 6];
        address.copy_from_slice(&data[0..6]);
        Ok(Self {
            address: BdAddr::from_le_bytes(address),
            supported_settings: read_u32_le(&data[6..10]),
            current_settings: read_u32_le(&data[10..14]),
        })
    }

    /// Returns the address type implied by the current settings.
    pub fn address_type(&self) -> AddressType {
        if self.current_settings & (1 << settings::PRIVACY) != 0 {
            AddressType::Random
        } else {
            AddressType::Public
        }
    }
}

fn read_u32_le(bytes: &[u8]) -> u32 {
    let mut buf = [0; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

/// Reads controller information from the IUT.
pub fn gap_read_ctrl_info(device: &DeviceHandle) -> Result<ControllerInfo, DeviceError> {
    let response = device.send(&DeviceCommand::new(ControllerInfo::COMMAND))?;
    ControllerInfo::decode(&response.data)
}

/// Makes the IUT connectable.
pub fn gap_set_conn(device: &DeviceHandle) -> Result<(), DeviceError> {
    device.send(&DeviceCommand::new("gap_set_conn")).map(|_| ())
}

/// Makes the IUT generally discoverable.
pub fn gap_set_gendiscov(device: &DeviceHandle) -> Result<(), DeviceError> {
    device.send(&DeviceCommand::new("gap_set_gendiscov")).map(|_| ())
}

/// Starts connectable undirected advertising.
pub fn gap_adv_ind_on(device: &DeviceHandle) -> Result<(), DeviceError> {
    device.send(&DeviceCommand::new("gap_adv_ind_on")).map(|_| ())
}

/// Decodes a passkey display event: address type, address, then a little-endian passkey.
pub fn decode_passkey_display(event: &DeviceEvent) -> Result<u32, DeviceError> {
    if event.data.len() < 11 {
        return Err(DeviceError::malformed(
            PASSKEY_DISPLAY_EVENT,
            format!("expected 11 bytes, got {}", event.data.len()),
        ));
    }
    Ok(read_u32_le(&event.data[7..11]))
}

/// Waits for the IUT to display a passkey and returns it.
pub fn gap_await_passkey(device: &DeviceHandle, timeout: Duration) -> Result<u32, DeviceError> {
    let event = device.await_event(PASSKEY_DISPLAY_EVENT, timeout)?;
    decode_passkey_display(&event)
}

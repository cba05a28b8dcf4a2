// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed helpers for the IUT's GATT server database.

use super::{DeviceCommand, DeviceHandle};
use crate::errors::DeviceError;
use std::fmt;

/// An attribute type UUID, either 16-bit or 128-bit.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum AttUuid {
    /// A 16-bit assigned number.
    Short(u16),

    /// A full 128-bit UUID.
    Long(u128),
}

impl AttUuid {
    /// The primary service declaration type.
    pub const PRIMARY_SERVICE: Self = Self::Short(0x2800);

    /// Parses a UUID written as 4 or 32 hex digits (no separators).
    pub fn from_hex(s: &str) -> Option<Self> {
        match s.len() {
            4 => u16::from_str_radix(s, 16).ok().map(Self::Short),
            32 => u128::from_str_radix(s, 16).ok().map(Self::Long),
            _ => None,
        }
    }

    /// Decodes a UUID from little-endian bytes as they appear in attribute values.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes.len() {
            2 => Some(Self::Short(u16::from_le_bytes([bytes[0], bytes[1]]))),
            16 => {
                let mut buf = [0; 16];
                buf.copy_from_slice(bytes);
                Some(Self::Long(u128::from_le_bytes(buf)))
            }
            _ => None,
        }
    }

    fn to_hex(self) -> String {
        match self {
            Self::Short(uuid) => format!("{uuid:04x}"),
            Self::Long(uuid) => format!("{uuid:032x}"),
        }
    }
}

impl fmt::Display for AttUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Short(uuid) => write!(f, "0x{uuid:04x}"),
            Self::Long(uuid) => {
                let hex = format!("{uuid:032x}");
                write!(
                    f,
                    "{}-{}-{}-{}-{}",
                    &hex[0..8],
                    &hex[8..12],
                    &hex[12..16],
                    &hex[16..20],
                    &hex[20..32]
                )
            }
        }
    }
}

/// An attribute in the IUT's GATT database, as returned by `gatts_get_attrs`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Attribute {
    /// The attribute handle.
    pub handle: u16,

    /// The permission bitmask.
    pub permissions: u8,

    /// The attribute type.
    pub type_uuid: AttUuid,
}

/// The value of an attribute, as returned by `gatts_get_attr_val`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttributeValue {
    /// The ATT response code the IUT would send when reading this attribute (0 on success).
    pub att_response: u8,

    /// The value bytes.
    pub value: Vec<u8>,
}

const GET_ATTRS: &str = "gatts_get_attrs";
const GET_ATTR_VAL: &str = "gatts_get_attr_val";

/// Lists attributes of the given type in the IUT's database.
pub fn gatts_get_attrs(
    device: &DeviceHandle,
    type_uuid: AttUuid,
) -> Result<Vec<Attribute>, DeviceError> {
    let command = DeviceCommand::new(GET_ATTRS)
        .arg("0001")
        .arg("ffff")
        .arg(type_uuid.to_hex());
    let response = device.send(&command)?;
    decode_attrs(&response.data)
}

/// Reads the value of the attribute at `handle`.
pub fn gatts_get_attr_val(
    device: &DeviceHandle,
    handle: u16,
) -> Result<AttributeValue, DeviceError> {
    let command = DeviceCommand::new(GET_ATTR_VAL).arg(format!("{handle:04x}"));
    let response = device.send(&command)?;
    decode_attr_val(&response.data)
}

/// Decodes the `gatts_get_attrs` payload: a count, then per attribute a little-endian handle,
/// a permission byte, a type length and the type bytes.
pub fn decode_attrs(data: &[u8]) -> Result<Vec<Attribute>, DeviceError> {
    let (&count, mut rest) = data
        .split_first()
        .ok_or_else(|| DeviceError::malformed(GET_ATTRS, "empty response"))?;

    let mut attrs = Vec::with_capacity(usize::from(count));
    for index in 0..count {
        if rest.len() < 4 {
            return Err(DeviceError::malformed(
                GET_ATTRS,
                format!("attribute {index} is truncated"),
            ));
        }
        let handle = u16::from_le_bytes([rest[0], rest[1]]);
        let permissions = rest[2];
        let type_len = usize::from(rest[3]);
        rest = &rest[4..];
        if rest.len() < type_len {
            return Err(DeviceError::malformed(
                GET_ATTRS,
                format!("attribute {index} has a truncated type"),
            ));
        }
        let type_uuid = AttUuid::from_le_bytes(&rest[..type_len]).ok_or_else(|| {
            DeviceError::malformed(GET_ATTRS, format!("invalid type length {type_len}"))
        })?;
        rest = &rest[type_len..];
        attrs.push(Attribute {
            handle,
            permissions,
            type_uuid,
        });
    }
    Ok(attrs)
}

/// Decodes the `gatts_get_attr_val` payload: an ATT response code, a little-endian length and
/// the value.
pub fn decode_attr_val(data: &[u8]) -> Result<AttributeValue, DeviceError> {
    if data.len() < 3 {
        return Err(DeviceError::malformed(GET_ATTR_VAL, "response is truncated"));
    }
    let len = usize::from(u16::from_le_bytes([data[1], data[2]]));
    let value = data
        .get(3..3 + len)
        .ok_or_else(|| DeviceError::malformed(GET_ATTR_VAL, "value is truncated"))?;
    Ok(AttributeValue {
        att_response: data[0],
        value: value.to_vec(),
    })
}

// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parsers for the free-text descriptions attached to work items.
//!
//! These are pure functions: `description -> Result<T, DescriptionParseError>`.

use crate::{device::AttUuid, errors::DescriptionParseError};
use regex::Regex;
use std::sync::LazyLock;

static SERVICE_UUID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Service\s=\s'([0-9a-fA-F]+)'").unwrap());
static HANDLE_OR_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(Handle|value)='([0-9a-fA-F]+)'").unwrap());
static HANDLE_PAIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Handle pair = '([0-9a-fA-F]+)'O '([0-9a-fA-F]+)'O").unwrap());
static PAIR_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"value='([0-9a-fA-F]+)'O").unwrap());

/// Extracts the primary service UUIDs listed in a description, e.g.
/// `Service = '1800'` or `Service = '0000A00C000000000123456789ABCDEF'`.
pub fn service_uuids(description: &str) -> Result<Vec<AttUuid>, DescriptionParseError> {
    let uuids = SERVICE_UUID
        .captures_iter(description)
        .map(|captures| {
            AttUuid::from_hex(&captures[1])
                .ok_or_else(|| DescriptionParseError::new("service UUID", description))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if uuids.is_empty() {
        return Err(DescriptionParseError::new("service UUIDs", description));
    }
    Ok(uuids)
}

/// A handle and the value the tool expects to find there.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HandleValue {
    /// The attribute handle.
    pub handle: u16,

    /// The expected value, as uppercase hex digits.
    pub value: String,
}

/// Extracts `Handle='0012'` and `value='AB'` from a description. The two may appear in either
/// order.
pub fn handle_value(description: &str) -> Result<HandleValue, DescriptionParseError> {
    let mut handle = None;
    let mut value = None;
    for captures in HANDLE_OR_VALUE.captures_iter(description) {
        match &captures[1] {
            "Handle" => handle = parse_handle(&captures[2]),
            _ => value = Some(captures[2].to_ascii_uppercase()),
        }
    }

    match (handle, value) {
        (Some(handle), Some(value)) => Ok(HandleValue { handle, value }),
        _ => Err(DescriptionParseError::new("handle and value", description)),
    }
}

/// A pair of handles and the value the tool expects their concatenated values to form.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HandlePairValue {
    /// The first handle.
    pub first: u16,

    /// The second handle.
    pub second: u16,

    /// The expected concatenated value, as uppercase hex digits.
    pub value: String,
}

/// Extracts `Handle pair = '0012'O '0014'O` and `value='...'O` from a description.
pub fn handle_pair_value(description: &str) -> Result<HandlePairValue, DescriptionParseError> {
    let error = || DescriptionParseError::new("handle pair and value", description);

    let pair = HANDLE_PAIR.captures(description).ok_or_else(error)?;
    let first = parse_handle(&pair[1]).ok_or_else(error)?;
    let second = parse_handle(&pair[2]).ok_or_else(error)?;
    let value = PAIR_VALUE.captures(description).ok_or_else(error)?;

    Ok(HandlePairValue {
        first,
        second,
        value: value[1].to_ascii_uppercase(),
    })
}

fn parse_handle(hex: &str) -> Option<u16> {
    u16::from_str_radix(hex, 16).ok()
}

/// Formats bytes as uppercase hex digits.
pub fn to_hex_upper(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02X}")).collect()
}

/// Compares two hex strings as numbers: leading zeros and case are ignored.
pub fn hex_values_equal(a: &str, b: &str) -> bool {
    fn normalize(s: &str) -> &str {
        let trimmed = s.trim_start_matches('0');
        if trimmed.is_empty() { "0" } else { trimmed }
    }
    normalize(a).eq_ignore_ascii_case(normalize(b))
}

// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Generic handlers for GATT server test cases.

use super::parse;
use crate::{
    device::{self, AttUuid},
    dispatch::{HandlerContext, HandlerRegistry, WorkItemResponse},
    errors::HandlerError,
};
use tracing::debug;

/// The name catalogs use to refer to this registry.
pub const GATT: &str = "gatt";

/// Returns the GATT server handler registry.
pub fn gatt_handlers() -> HandlerRegistry {
    HandlerRegistry::new(GATT)
        .register(1, make_connectable)
        .register(17, verify_primary_services)
        .register(52, verify_attribute_value)
        .register(56, verify_handle_pair_value)
}

/// Makes the IUT connectable, discoverable and advertising.
fn make_connectable(cx: &HandlerContext<'_>) -> Result<WorkItemResponse, HandlerError> {
    device::gap_set_conn(cx.device)?;
    device::gap_set_gendiscov(cx.device)?;
    device::gap_adv_ind_on(cx.device)?;
    Ok(WorkItemResponse::OK)
}

/// Verifies that every primary service listed in the description exists on the IUT.
///
/// Each listed service must be matched by a distinct service on the IUT.
fn verify_primary_services(cx: &HandlerContext<'_>) -> Result<WorkItemResponse, HandlerError> {
    let expected = parse::service_uuids(cx.description())?;

    let mut present = Vec::new();
    for attr in device::gatts_get_attrs(cx.device, AttUuid::PRIMARY_SERVICE)? {
        let value = device::gatts_get_attr_val(cx.device, attr.handle)?;
        if let Some(uuid) = AttUuid::from_le_bytes(&value.value) {
            present.push(uuid);
        }
    }

    for uuid in expected {
        match present.iter().position(|p| *p == uuid) {
            Some(index) => {
                present.swap_remove(index);
                debug!(%uuid, "service found");
            }
            None => {
                debug!(%uuid, "service not found");
                return Ok(WorkItemResponse::Bool(false));
            }
        }
    }
    Ok(WorkItemResponse::Bool(true))
}

/// Verifies the value of the attribute at a handle, e.g. `Handle='0012' value='AB'`.
fn verify_attribute_value(cx: &HandlerContext<'_>) -> Result<WorkItemResponse, HandlerError> {
    let expected = parse::handle_value(cx.description())?;
    let read = device::gatts_get_attr_val(cx.device, expected.handle)?;
    let read = parse::to_hex_upper(&read.value);
    debug!(handle = expected.handle, expected = %expected.value, %read, "comparing attribute value");
    Ok(WorkItemResponse::Bool(parse::hex_values_equal(
        &read,
        &expected.value,
    )))
}

/// Verifies that the values at two handles, concatenated, equal the expected value.
fn verify_handle_pair_value(cx: &HandlerContext<'_>) -> Result<WorkItemResponse, HandlerError> {
    let expected = parse::handle_pair_value(cx.description())?;
    let first = device::gatts_get_attr_val(cx.device, expected.first)?;
    let second = device::gatts_get_attr_val(cx.device, expected.second)?;

    let mut combined = parse::to_hex_upper(&first.value);
    combined.push_str(&parse::to_hex_upper(&second.value));
    debug!(expected = %expected.value, %combined, "comparing handle pair value");
    Ok(WorkItemResponse::Bool(combined == expected.value))
}

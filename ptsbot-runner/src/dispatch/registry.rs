// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{WorkItem, WorkItemResponse};
use crate::{device::DeviceHandle, errors::HandlerError, state::SharedState};
use debug_ignore::DebugIgnore;
use std::{collections::BTreeMap, sync::Arc};

/// What a handler gets to work with.
#[derive(Clone, Copy, Debug)]
pub struct HandlerContext<'a> {
    /// The callback being answered.
    pub work_item: &'a WorkItem,

    /// The connection to the IUT.
    pub device: &'a DeviceHandle,

    /// Shared test state.
    pub state: &'a SharedState,
}

impl HandlerContext<'_> {
    /// The callback's free-text description.
    pub fn description(&self) -> &str {
        &self.work_item.description
    }
}

/// A work-item handler.
pub type HandlerFn =
    Arc<dyn Fn(&HandlerContext<'_>) -> Result<WorkItemResponse, HandlerError> + Send + Sync>;

/// Generic handlers keyed by callback id.
///
/// A registry is named so that catalogs can refer to it (`handler = "gatt"`).
#[derive(Clone, Debug)]
pub struct HandlerRegistry {
    name: String,
    handlers: BTreeMap<u32, DebugIgnore<HandlerFn>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: BTreeMap::new(),
        }
    }

    /// Registers `handler` for callback `id`, replacing any existing handler.
    pub fn register<F>(mut self, id: u32, handler: F) -> Self
    where
        F: Fn(&HandlerContext<'_>) -> Result<WorkItemResponse, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(id, DebugIgnore(Arc::new(handler)));
        self
    }

    /// The registry's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks up the handler for callback `id`.
    pub fn get(&self, id: u32) -> Option<&HandlerFn> {
        self.handlers.get(&id).map(|handler| &handler.0)
    }

    /// Callback ids with a registered handler, in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.handlers.keys().copied()
    }
}

// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Built-in work-item handlers and step helpers.
//!
//! Handler registries are collected into [`HandlerSets`], which catalogs refer to by name.

mod builtin;
mod gatt;
pub mod parse;

pub use builtin::*;
pub use gatt::*;

use crate::dispatch::HandlerRegistry;
use std::{collections::BTreeMap, sync::Arc};

/// Named handler registries available to catalogs.
#[derive(Clone, Debug, Default)]
pub struct HandlerSets {
    sets: BTreeMap<String, Arc<HandlerRegistry>>,
}

impl HandlerSets {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// The registries shipped with ptsbot.
    pub fn builtin() -> Self {
        let mut sets = Self::new();
        sets.insert(gatt_handlers());
        sets
    }

    /// Adds a registry under its own name, replacing any registry with the same name.
    pub fn insert(&mut self, registry: HandlerRegistry) {
        self.sets
            .insert(registry.name().to_owned(), Arc::new(registry));
    }

    /// Looks up a registry by name.
    pub fn get(&self, name: &str) -> Option<&Arc<HandlerRegistry>> {
        self.sets.get(name)
    }

    /// Registry names, in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.sets.keys().map(String::as_str)
    }
}

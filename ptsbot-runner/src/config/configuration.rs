// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    catalog::{Catalog, TestCase},
    errors::ConfigParseErrorKind,
};
use indexmap::IndexMap;
use serde::Deserialize;
use std::{collections::BTreeMap, sync::Arc};

/// The name used for the configuration synthesized when none are declared.
pub const DEFAULT_CONFIGURATION: &str = "default";

/// Which test cases of the catalog a configuration runs.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum Selection {
    /// Every test case not claimed by another configuration's allow-list.
    #[default]
    All,

    /// Only test cases matching one of these entries.
    Allow(Vec<String>),

    /// Every test case not matching one of these entries, and not claimed by another
    /// configuration's allow-list.
    Deny(Vec<String>),
}

impl Selection {
    fn allow_list(&self) -> Option<&[String]> {
        match self {
            Self::Allow(entries) => Some(entries),
            Self::All | Self::Deny(_) => None,
        }
    }
}

/// A device configuration: a device variant (described by its overlay) plus the subset of the
/// catalog that runs against it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Configuration {
    name: String,
    selection: Selection,
    overlay: BTreeMap<String, String>,
}

impl Configuration {
    /// Creates a new configuration.
    pub fn new(
        name: impl Into<String>,
        selection: Selection,
        overlay: BTreeMap<String, String>,
    ) -> Self {
        Self {
            name: name.into(),
            selection,
            overlay,
        }
    }

    /// The configuration's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The test-case selection.
    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    /// Build parameters describing the device variant.
    pub fn overlay(&self) -> &BTreeMap<String, String> {
        &self.overlay
    }
}

/// Device configurations, in declaration order.
#[derive(Clone, Debug, Default)]
pub struct Configurations {
    inner: IndexMap<String, Configuration>,
}

impl Configurations {
    /// Creates a new set of configurations. Later entries with the same name replace earlier
    /// ones but keep the earlier position.
    pub fn new(configurations: impl IntoIterator<Item = Configuration>) -> Self {
        let inner = configurations
            .into_iter()
            .map(|configuration| (configuration.name.clone(), configuration))
            .collect();
        Self { inner }
    }

    /// A single configuration running the whole catalog.
    pub fn single_default() -> Self {
        Self::new([Configuration::new(
            DEFAULT_CONFIGURATION,
            Selection::All,
            BTreeMap::new(),
        )])
    }

    /// Returns the number of configurations.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if there are no configurations.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Looks up a configuration by name.
    pub fn get(&self, name: &str) -> Option<&Configuration> {
        self.inner.get(name)
    }

    /// Iterates over configurations in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Configuration> + '_ {
        self.inner.values()
    }

    /// Resolves the test cases `configuration` runs, in catalog order.
    ///
    /// With an allow-list, only matching cases run. Otherwise everything runs except cases
    /// matching the deny-list and cases claimed by any other configuration's allow-list, so
    /// that each case is scheduled once across the batch.
    pub fn select(&self, configuration: &Configuration, catalog: &Catalog) -> Vec<Arc<TestCase>> {
        catalog
            .iter()
            .filter(|case| self.is_selected(configuration, case.id()))
            .cloned()
            .collect()
    }

    fn is_selected(&self, configuration: &Configuration, case_id: &str) -> bool {
        match &configuration.selection {
            Selection::Allow(entries) => matches_any(entries, case_id),
            Selection::All => !self.claimed_elsewhere(configuration, case_id),
            Selection::Deny(entries) => {
                !matches_any(entries, case_id) && !self.claimed_elsewhere(configuration, case_id)
            }
        }
    }

    fn claimed_elsewhere(&self, configuration: &Configuration, case_id: &str) -> bool {
        self.inner
            .values()
            .filter(|other| other.name != configuration.name)
            .filter_map(|other| other.selection.allow_list())
            .any(|entries| matches_any(entries, case_id))
    }
}

impl<'a> IntoIterator for &'a Configurations {
    type Item = &'a Configuration;
    type IntoIter = indexmap::map::Values<'a, String, Configuration>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.values()
    }
}

/// Returns true if `entry` selects `case_id`: either exactly, or as a prefix ending at a `/`
/// boundary.
pub fn selection_matches(entry: &str, case_id: &str) -> bool {
    match case_id.strip_prefix(entry) {
        Some("") => true,
        Some(rest) => entry.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}

fn matches_any(entries: &[String], case_id: &str) -> bool {
    entries.iter().any(|entry| selection_matches(entry, case_id))
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(super) struct DeserializedConfiguration {
    #[serde(default)]
    allow: Option<Vec<String>>,
    #[serde(default)]
    deny: Option<Vec<String>>,
    #[serde(default)]
    overlay: BTreeMap<String, String>,
}

impl DeserializedConfiguration {
    pub(super) fn into_configuration(
        self,
        name: String,
    ) -> Result<Configuration, ConfigParseErrorKind> {
        let selection = match (self.allow, self.deny) {
            (Some(_), Some(_)) => return Err(ConfigParseErrorKind::AllowAndDeny { name }),
            (Some(allow), None) => Selection::Allow(allow),
            (None, Some(deny)) => Selection::Deny(deny),
            (None, None) => Selection::All,
        };
        Ok(Configuration::new(name, selection, self.overlay))
    }
}

// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Storage and retrieval of test-case statuses from previous runs.

use super::{StatusHistory, TestStatus};
use crate::errors::{HistoryLoadError, HistorySaveError};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs};
use tracing::debug;

/// The last known status of every test case, serialized to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorySnapshot {
    /// Version of the snapshot format.
    pub version: u32,

    /// When this snapshot was last updated.
    pub updated_at: DateTime<Utc>,

    /// Last known status per test-case id.
    pub statuses: BTreeMap<String, TestStatus>,
}

impl StatusHistory for HistorySnapshot {
    fn last_status(&self, case_id: &str) -> Option<TestStatus> {
        self.statuses.get(case_id).copied()
    }
}

/// Manages persistence of status history.
#[derive(Clone, Debug)]
pub struct HistoryStore {
    path: Utf8PathBuf,
}

impl HistoryStore {
    /// Current version of the snapshot format.
    pub const CURRENT_VERSION: u32 = 1;

    /// Creates a new store backed by the file at `path`.
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The path to the history file.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Loads the history from disk. Returns `None` if nothing was recorded yet.
    pub fn load(&self) -> Result<Option<HistorySnapshot>, HistoryLoadError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => {
                let snapshot: HistorySnapshot =
                    serde_json::from_str(&contents).map_err(|error| {
                        HistoryLoadError::Deserialize {
                            path: self.path.clone(),
                            error,
                        }
                    })?;

                if snapshot.version != Self::CURRENT_VERSION {
                    return Err(HistoryLoadError::VersionMismatch {
                        path: self.path.clone(),
                        expected: Self::CURRENT_VERSION,
                        actual: snapshot.version,
                    });
                }

                Ok(Some(snapshot))
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(HistoryLoadError::Read {
                path: self.path.clone(),
                error,
            }),
        }
    }

    /// Loads the recorded statuses, treating a missing file as empty history.
    pub fn load_statuses(&self) -> Result<BTreeMap<String, TestStatus>, HistoryLoadError> {
        Ok(self
            .load()?
            .map(|snapshot| snapshot.statuses)
            .unwrap_or_default())
    }

    /// Merges `statuses` into the recorded history and saves it. Test cases not in `statuses`
    /// keep their previous status.
    pub fn record<'a>(
        &self,
        statuses: impl IntoIterator<Item = (&'a str, TestStatus)>,
    ) -> Result<HistorySnapshot, HistorySaveError> {
        // An unreadable history is replaced rather than blocking the new record.
        let mut merged = match self.load() {
            Ok(snapshot) => snapshot.map(|snapshot| snapshot.statuses).unwrap_or_default(),
            Err(error) => {
                debug!(path = %self.path, %error, "discarding unreadable history");
                BTreeMap::new()
            }
        };
        merged.extend(
            statuses
                .into_iter()
                .map(|(case_id, status)| (case_id.to_owned(), status)),
        );

        let snapshot = HistorySnapshot {
            version: Self::CURRENT_VERSION,
            updated_at: Utc::now(),
            statuses: merged,
        };
        self.save(&snapshot)?;
        Ok(snapshot)
    }

    /// Saves a snapshot to disk.
    pub fn save(&self, snapshot: &HistorySnapshot) -> Result<(), HistorySaveError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|error| HistorySaveError::CreateDir {
                path: parent.to_owned(),
                error,
            })?;
        }

        let contents = serde_json::to_string_pretty(snapshot)
            .map_err(|error| HistorySaveError::Serialize { error })?;

        fs::write(&self.path, contents).map_err(|error| HistorySaveError::Write {
            path: self.path.clone(),
            error,
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use pretty_assertions::assert_eq;

    #[test]
    fn missing_history_is_empty() {
        let dir = Utf8TempDir::with_prefix("ptsbot-history-").unwrap();
        let store = HistoryStore::new(dir.path().join("history.json"));
        assert!(store.load().unwrap().is_none());
        assert!(store.load_statuses().unwrap().is_empty());
    }

    #[test]
    fn record_merges_and_round_trips() {
        let dir = Utf8TempDir::with_prefix("ptsbot-history-").unwrap();
        let store = HistoryStore::new(dir.path().join("nested/history.json"));

        store
            .record([
                ("GAP/CONN/NCON/BV-01-C", TestStatus::Pass),
                ("GATT/SR/GAR/BV-01-C", TestStatus::Pass),
            ])
            .unwrap();
        store
            .record([("GATT/SR/GAR/BV-01-C", TestStatus::Fail)])
            .unwrap();

        let snapshot = store.load().unwrap().unwrap();
        assert_eq!(snapshot.version, HistoryStore::CURRENT_VERSION);
        assert_eq!(
            snapshot.statuses,
            BTreeMap::from([
                ("GAP/CONN/NCON/BV-01-C".to_owned(), TestStatus::Pass),
                ("GATT/SR/GAR/BV-01-C".to_owned(), TestStatus::Fail),
            ])
        );
        assert_eq!(
            snapshot.last_status("GATT/SR/GAR/BV-01-C"),
            Some(TestStatus::Fail)
        );
    }

    #[test]
    fn version_mismatch() {
        let dir = Utf8TempDir::with_prefix("ptsbot-history-").unwrap();
        let path = dir.path().join("history.json");
        fs::write(
            &path,
            r#"{"version": 99, "updated_at": "2024-01-01T00:00:00Z", "statuses": {}}"#,
        )
        .unwrap();

        let store = HistoryStore::new(path.clone());
        match store.load() {
            Err(HistoryLoadError::VersionMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, HistoryStore::CURRENT_VERSION);
                assert_eq!(actual, 99);
            }
            other => panic!("expected a version mismatch, got {other:?}"),
        }
    }
}

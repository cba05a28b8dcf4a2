// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::TestStatus;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A source of previously recorded statuses.
pub trait StatusHistory {
    /// Returns the last recorded status of a test case, if any.
    fn last_status(&self, case_id: &str) -> Option<TestStatus>;
}

impl StatusHistory for BTreeMap<String, TestStatus> {
    fn last_status(&self, case_id: &str) -> Option<TestStatus> {
        self.get(case_id).copied()
    }
}

impl StatusHistory for HashMap<String, TestStatus> {
    fn last_status(&self, case_id: &str) -> Option<TestStatus> {
        self.get(case_id).copied()
    }
}

impl<T: StatusHistory + ?Sized> StatusHistory for &T {
    fn last_status(&self, case_id: &str) -> Option<TestStatus> {
        (**self).last_status(case_id)
    }
}

/// A test case whose status got worse compared to history.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Regression {
    /// The test-case id.
    pub case_id: String,

    /// The last recorded status.
    pub previous: TestStatus,

    /// The status in this run.
    pub current: TestStatus,
}

/// Compares `statuses` against `history`, returning regressions ordered by test-case id.
///
/// A test case with no recorded history is never a regression.
pub fn compute_regressions<'a>(
    statuses: impl IntoIterator<Item = (&'a str, TestStatus)>,
    history: &impl StatusHistory,
) -> Vec<Regression> {
    let mut regressions: Vec<_> = statuses
        .into_iter()
        .filter_map(|(case_id, current)| {
            let previous = history.last_status(case_id)?;
            current.is_regression_from(previous).then(|| Regression {
                case_id: case_id.to_owned(),
                previous,
                current,
            })
        })
        .collect();
    regressions.sort_by(|a, b| a.case_id.cmp(&b.case_id));
    regressions.dedup_by(|a, b| a.case_id == b.case_id);
    regressions
}

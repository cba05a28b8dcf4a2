// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, btree_map},
    fmt,
    str::FromStr,
};

/// The terminal status of a test case.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    /// The test case passed.
    Pass,

    /// The test case failed.
    Fail,

    /// The test case could not reach a verdict.
    Inconclusive,

    /// The remote tool reported that the IUT doesn't support the test case.
    NotSupported,
}

impl TestStatus {
    /// All statuses, in display order.
    pub const ALL: [Self; 4] = [
        Self::Pass,
        Self::Fail,
        Self::Inconclusive,
        Self::NotSupported,
    ];

    /// Returns true if this is [`TestStatus::Pass`].
    pub fn is_pass(self) -> bool {
        self == Self::Pass
    }

    /// Rank used to combine statuses within an attempt: `Pass > NotSupported > Inconclusive >
    /// Fail`.
    pub fn outcome_rank(self) -> u8 {
        match self {
            Self::Pass => 3,
            Self::NotSupported => 2,
            Self::Inconclusive => 1,
            Self::Fail => 0,
        }
    }

    /// Rank used to detect regressions: `Pass > Inconclusive = NotSupported > Fail`.
    pub fn regression_rank(self) -> u8 {
        match self {
            Self::Pass => 2,
            Self::Inconclusive | Self::NotSupported => 1,
            Self::Fail => 0,
        }
    }

    /// Returns the worse of two statuses under [`Self::outcome_rank`].
    pub fn worst(self, other: Self) -> Self {
        if other.outcome_rank() < self.outcome_rank() {
            other
        } else {
            self
        }
    }

    /// Returns true if moving from `previous` to `self` is a regression.
    pub fn is_regression_from(self, previous: Self) -> bool {
        self.regression_rank() < previous.regression_rank()
    }

    /// The canonical name, as used in serialized output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Inconclusive => "INCONCLUSIVE",
            Self::NotSupported => "NOT_SUPPORTED",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestStatus {
    type Err = UnknownStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownStatusError(s.to_owned()))
    }
}

/// A string that doesn't name a [`TestStatus`].
#[derive(Clone, Debug, thiserror::Error, Eq, PartialEq)]
#[error("unknown test status `{0}`")]
pub struct UnknownStatusError(String);

/// The recorded result of one test case in a batch.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CaseResult {
    /// The terminal status of the final attempt.
    pub status: TestStatus,

    /// Why the final attempt ended the way it did, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Number of attempts after the first.
    #[serde(default)]
    pub retry_count: u32,

    /// The device configuration the test case ran under.
    #[serde(default)]
    pub configuration: String,
}

/// Results across a batch, keyed by test-case id.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct RunResults {
    results: BTreeMap<String, CaseResult>,
}

impl RunResults {
    /// Creates an empty result set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a result. A later result for the same test case replaces the earlier one.
    pub fn record(&mut self, case_id: impl Into<String>, result: CaseResult) {
        self.results.insert(case_id.into(), result);
    }

    /// Merges another result set into this one, with `other` winning on conflicts.
    pub fn merge(&mut self, other: RunResults) {
        self.results.extend(other.results);
    }

    /// Looks up the result for a test case.
    pub fn get(&self, case_id: &str) -> Option<&CaseResult> {
        self.results.get(case_id)
    }

    /// Returns the number of test cases with a result.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Returns true if no results were recorded.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Iterates over results, ordered by test-case id.
    pub fn iter(&self) -> btree_map::Iter<'_, String, CaseResult> {
        self.results.iter()
    }

    /// Iterates over `(test-case id, status)` pairs, ordered by id.
    pub fn statuses(&self) -> impl Iterator<Item = (&str, TestStatus)> + '_ {
        self.results
            .iter()
            .map(|(case_id, result)| (case_id.as_str(), result.status))
    }

    /// Counts results by status. Every status is present, possibly with a count of zero.
    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for result in self.results.values() {
            counts.add(result.status);
        }
        counts
    }

    /// Returns a map from test-case id to the description of its final attempt.
    pub fn descriptions(&self) -> BTreeMap<String, String> {
        self.results
            .iter()
            .filter_map(|(case_id, result)| {
                result
                    .description
                    .as_ref()
                    .map(|description| (case_id.clone(), description.clone()))
            })
            .collect()
    }
}

impl<'a> IntoIterator for &'a RunResults {
    type Item = (&'a String, &'a CaseResult);
    type IntoIter = btree_map::Iter<'a, String, CaseResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.iter()
    }
}

/// Number of test cases per terminal status.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StatusCounts {
    /// Test cases that passed.
    pub pass: usize,

    /// Test cases that failed.
    pub fail: usize,

    /// Test cases that could not reach a verdict.
    pub inconclusive: usize,

    /// Test cases the IUT doesn't support.
    pub not_supported: usize,
}

impl StatusCounts {
    /// Adds one test case with the given status.
    pub fn add(&mut self, status: TestStatus) {
        *self.slot(status) += 1;
    }

    /// Returns the count for a status.
    pub fn get(&self, status: TestStatus) -> usize {
        match status {
            TestStatus::Pass => self.pass,
            TestStatus::Fail => self.fail,
            TestStatus::Inconclusive => self.inconclusive,
            TestStatus::NotSupported => self.not_supported,
        }
    }

    /// Returns the total number of test cases.
    pub fn total(&self) -> usize {
        self.pass + self.fail + self.inconclusive + self.not_supported
    }

    fn slot(&mut self, status: TestStatus) -> &mut usize {
        match status {
            TestStatus::Pass => &mut self.pass,
            TestStatus::Fail => &mut self.fail,
            TestStatus::Inconclusive => &mut self.inconclusive,
            TestStatus::NotSupported => &mut self.not_supported,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case(TestStatus::Pass, TestStatus::Fail, TestStatus::Fail; "pass and fail")]
    #[test_case(TestStatus::Pass, TestStatus::NotSupported, TestStatus::NotSupported; "pass and not supported")]
    #[test_case(TestStatus::NotSupported, TestStatus::Inconclusive, TestStatus::Inconclusive; "not supported and inconclusive")]
    #[test_case(TestStatus::Inconclusive, TestStatus::Fail, TestStatus::Fail; "inconclusive and fail")]
    #[test_case(TestStatus::Pass, TestStatus::Pass, TestStatus::Pass; "pass and pass")]
    fn worst_status(a: TestStatus, b: TestStatus, expected: TestStatus) {
        assert_eq!(a.worst(b), expected);
        assert_eq!(b.worst(a), expected, "worst is symmetric");
    }

    #[test_case(TestStatus::Pass, TestStatus::Fail, true; "pass to fail")]
    #[test_case(TestStatus::Pass, TestStatus::Inconclusive, true; "pass to inconclusive")]
    #[test_case(TestStatus::Inconclusive, TestStatus::NotSupported, false; "inconclusive to not supported")]
    #[test_case(TestStatus::NotSupported, TestStatus::Fail, true; "not supported to fail")]
    #[test_case(TestStatus::Fail, TestStatus::Pass, false; "fail to pass")]
    fn regressions(previous: TestStatus, current: TestStatus, expected: bool) {
        assert_eq!(current.is_regression_from(previous), expected);
    }

    #[test]
    fn status_serialization() {
        assert_eq!(
            serde_json::to_string(&TestStatus::NotSupported).unwrap(),
            r#""NOT_SUPPORTED""#
        );
        let parsed: TestStatus = serde_json::from_str(r#""INCONCLUSIVE""#).unwrap();
        assert_eq!(parsed, TestStatus::Inconclusive);
        assert_eq!("pass".parse::<TestStatus>(), Ok(TestStatus::Pass));
        assert!("PASSED".parse::<TestStatus>().is_err());
    }

    #[test]
    fn last_write_wins() {
        let mut results = RunResults::new();
        results.record(
            "GAP/CONN/NCON/BV-01-C",
            CaseResult {
                status: TestStatus::Fail,
                description: Some("verification failed".to_owned()),
                retry_count: 1,
                configuration: "default".to_owned(),
            },
        );
        let mut later = RunResults::new();
        later.record(
            "GAP/CONN/NCON/BV-01-C",
            CaseResult {
                status: TestStatus::Pass,
                description: None,
                retry_count: 0,
                configuration: "privacy".to_owned(),
            },
        );
        results.merge(later);

        assert_eq!(results.len(), 1);
        let result = results.get("GAP/CONN/NCON/BV-01-C").unwrap();
        assert_eq!(result.status, TestStatus::Pass);
        assert_eq!(result.configuration, "privacy");
        assert!(results.descriptions().is_empty());

        let counts = results.status_counts();
        assert_eq!(counts.get(TestStatus::Pass), 1);
        assert_eq!(counts.total(), 1);
    }
}

// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use camino_tempfile::Utf8TempDir;
use pretty_assertions::assert_eq;
use ptsbot_runner::{
    catalog::{Catalog, EditValue, Step, TestCase, VerifyPredicate},
    config::{Configuration, Configurations, RetryPolicy, Selection},
    reporter::{HistoryStore, Regression, TestStatus},
};
use std::{collections::BTreeMap, time::Duration};

const CONN: &str = "GAP/CONN/NCON/BV-01-C";
const PRIV: &str = "GAP/PRIV/CONN/BV-10-C";
const GATT: &str = "GATT/SR/GAR/BV-01-C";

fn catalog(ids: &[&str]) -> Catalog {
    Catalog::from_cases(ids.iter().map(|id| {
        let profile = id.split('/').next().unwrap();
        TestCase::builder(profile, *id).build()
    }))
    .unwrap()
}

fn configuration(name: &str, selection: Selection) -> Configuration {
    Configuration::new(name, selection, BTreeMap::new())
}

#[test]
fn allow_list_limits_selection() {
    let harness = Harness::new(planner(|_, _| RunPlan::verdict(TestStatus::Pass)));
    let mut runner = harness.build();

    let configurations = Configurations::new([configuration(
        "default",
        Selection::Allow(vec![CONN.to_owned()]),
    )]);
    let outcome = runner.run_batch(
        &configurations,
        &catalog(&[CONN, GATT]),
        RetryPolicy::new_without_delay(0),
    );

    assert_eq!(
        outcome.results.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>(),
        [CONN]
    );
    assert_eq!(outcome.status_counts.pass, 1);
    assert_eq!(outcome.status_counts.total(), 1);
    assert_eq!(harness.events.count(&format!("start:{GATT}")), 0);
    assert_eq!(
        outcome.descriptions.get(CONN).map(String::as_str),
        Some("description of GAP/CONN/NCON/BV-01-C")
    );
}

#[test]
fn configurations_split_the_catalog() {
    let harness = Harness::new(planner(|_, _| RunPlan::verdict(TestStatus::Pass)));
    let mut runner = harness.build();

    let configurations = Configurations::new([
        configuration("default", Selection::All),
        configuration("privacy", Selection::Allow(vec!["GAP/PRIV".to_owned()])),
    ]);
    let outcome = runner.run_batch(
        &configurations,
        &catalog(&[CONN, PRIV, GATT]),
        RetryPolicy::new_without_delay(0),
    );

    assert_eq!(outcome.results.get(CONN).unwrap().configuration, "default");
    assert_eq!(outcome.results.get(GATT).unwrap().configuration, "default");
    assert_eq!(outcome.results.get(PRIV).unwrap().configuration, "privacy");
    assert_eq!(harness.events.count(&format!("start:{PRIV}")), 1);

    // Sessions are opened once for the whole batch and closed at the end.
    assert_eq!(harness.events.count("open:pts:IUT"), 1);
    assert_eq!(harness.events.count("close:pts"), 1);
    assert!(harness.events.position("prepare:privacy") > harness.events.position("open:pts:IUT"));
}

#[test]
fn retries_until_pass() {
    let harness = Harness::new(planner(|_, run| {
        if run < 3 {
            RunPlan::verdict(TestStatus::Inconclusive)
        } else {
            RunPlan::verdict(TestStatus::Pass)
        }
    }));
    let mut runner = harness.build();

    let outcome = runner.run_batch(
        &Configurations::single_default(),
        &catalog(&[CONN]),
        RetryPolicy::new_without_delay(2),
    );

    let result = outcome.results.get(CONN).unwrap();
    assert_eq!(result.status, TestStatus::Pass);
    assert_eq!(result.retry_count, 2);
    assert_eq!(harness.events.count(&format!("start:{CONN}")), 3);
}

#[test]
fn retries_are_bounded() {
    let harness = Harness::new(planner(|_, _| RunPlan::verdict(TestStatus::Fail)));
    let mut runner = harness.build();

    let outcome = runner.run_batch(
        &Configurations::single_default(),
        &catalog(&[CONN]),
        RetryPolicy::new_without_delay(1),
    );

    let result = outcome.results.get(CONN).unwrap();
    assert_eq!(result.status, TestStatus::Fail);
    assert_eq!(result.retry_count, 1);
    assert_eq!(harness.events.count(&format!("start:{CONN}")), 2);
}

#[test]
fn verification_failure_overrides_a_passing_verdict() {
    let harness = Harness::new(planner(|_, _| {
        RunPlan::verdict(TestStatus::Pass).callback(17, "Service = '1801'O")
    }));
    let mut runner = harness.build();

    let case = TestCase::builder("GATT", GATT)
        .verify(17, VerifyPredicate::ContainsAll(vec!["1800".to_owned()]))
        .build();
    let outcome = runner.run_batch(
        &Configurations::single_default(),
        &Catalog::from_cases([case]).unwrap(),
        RetryPolicy::new_without_delay(0),
    );

    let result = outcome.results.get(GATT).unwrap();
    assert_eq!(result.status, TestStatus::Fail);
    assert!(
        result
            .description
            .as_deref()
            .unwrap()
            .starts_with("verification of wid 17 failed"),
        "{result:?}"
    );
    assert_eq!(harness.events.count("reply:17=false"), 1);
}

#[test]
fn unhandled_callback_is_inconclusive() {
    let harness = Harness::new(planner(|_, _| {
        RunPlan::verdict(TestStatus::Pass).callback(99, "Please do something unusual")
    }));
    let mut runner = harness.build();

    let outcome = runner.run_batch(
        &Configurations::single_default(),
        &catalog(&[CONN]),
        RetryPolicy::new_without_delay(0),
    );

    let result = outcome.results.get(CONN).unwrap();
    assert_eq!(result.status, TestStatus::Inconclusive);
    assert_eq!(result.description.as_deref(), Some("no handler for wid 99"));
    assert_eq!(harness.events.count("reply:99=undefined"), 1);
}

#[test]
fn timeout_tears_down_and_reconnects() {
    let mut harness = Harness::new(planner(|_, _| RunPlan::hang()));
    harness.attempt_timeout = Duration::from_millis(200);
    let mut runner = harness.build();

    let cleanup_events = harness.events.clone();
    let case = TestCase::builder("GAP", CONN)
        .step(Step::cleanup("log-cleanup", move |_| {
            cleanup_events.push("cleanup");
            Ok(())
        }))
        .build();
    let outcome = runner.run_batch(
        &Configurations::single_default(),
        &Catalog::from_cases([case]).unwrap(),
        RetryPolicy::new_without_delay(1),
    );

    let result = outcome.results.get(CONN).unwrap();
    assert_eq!(result.status, TestStatus::Inconclusive);
    assert_eq!(result.retry_count, 1);

    let events = &harness.events;
    assert_eq!(events.count("stop:pts"), 2);
    assert_eq!(events.count("cleanup"), 2, "cleanup runs once per attempt");
    // One connection for bring-up, one reconnect after the first timeout.
    assert_eq!(events.count("connect:fake-default"), 2);
    assert!(events.count("shutdown") >= 2);
}

#[test]
fn cleanup_runs_once_after_a_failed_step() {
    let harness = Harness::new(planner(|_, _| RunPlan::verdict(TestStatus::Pass)));
    let mut runner = harness.build();

    let cleanup_events = harness.events.clone();
    let case = TestCase::builder("GAP", CONN)
        .step(Step::device(ptsbot_runner::device::DeviceCommand::new("hang")))
        .step(Step::device(ptsbot_runner::device::DeviceCommand::new("never")))
        .step(Step::cleanup("log-cleanup", move |_| {
            cleanup_events.push("cleanup");
            Ok(())
        }))
        .build();
    let outcome = runner.run_batch(
        &Configurations::single_default(),
        &Catalog::from_cases([case]).unwrap(),
        RetryPolicy::new_without_delay(0),
    );

    let result = outcome.results.get(CONN).unwrap();
    assert_eq!(result.status, TestStatus::Inconclusive);
    assert_eq!(harness.events.count("cleanup"), 1);
    assert_eq!(harness.events.count("send:never"), 0);
    // The precondition failed, so the tool never started the test case.
    assert_eq!(harness.events.count(&format!("start:{CONN}")), 0);
}

#[test]
fn panicking_steps_are_contained() {
    let harness = Harness::new(planner(|_, _| RunPlan::verdict(TestStatus::Pass)));
    let mut runner = harness.build();

    let cleanup_events = harness.events.clone();
    let panicking = TestCase::builder("GAP", CONN)
        .step(Step::local("explode", |_| panic!("step exploded")))
        .step(Step::cleanup("log-cleanup", move |_| {
            cleanup_events.push("cleanup");
            Ok(())
        }))
        .step(Step::cleanup("explode-in-cleanup", |_| {
            panic!("cleanup exploded")
        }))
        .build();
    let outcome = runner.run_batch(
        &Configurations::single_default(),
        &Catalog::from_cases([panicking, TestCase::builder("GATT", GATT).build()]).unwrap(),
        RetryPolicy::new_without_delay(0),
    );

    let result = outcome.results.get(CONN).unwrap();
    assert_eq!(result.status, TestStatus::Inconclusive);
    let description = result.description.as_deref().unwrap_or_default();
    assert!(
        description.contains("step exploded"),
        "panic message is kept: {description}"
    );
    assert_eq!(harness.events.count("cleanup"), 1);

    // The batch carries on with the next test case and shuts down normally.
    assert_eq!(outcome.results.get(GATT).unwrap().status, TestStatus::Pass);
    assert_eq!(harness.events.count("close:pts"), 1);
}

#[test]
fn infrastructure_failure_skips_configuration() {
    let mut harness = Harness::new(planner(|_, _| RunPlan::verdict(TestStatus::Pass)));
    harness.failing_configurations = vec!["privacy"];
    let mut runner = harness.build();

    let configurations = Configurations::new([
        configuration("privacy", Selection::Allow(vec!["GAP/PRIV".to_owned()])),
        configuration("default", Selection::All),
    ]);
    let outcome = runner.run_batch(
        &configurations,
        &catalog(&[CONN, PRIV]),
        RetryPolicy::new_without_delay(0),
    );

    assert_eq!(outcome.infrastructure_failures.len(), 1);
    assert_eq!(outcome.infrastructure_failures[0].configuration, "privacy");
    assert!(outcome.results.get(PRIV).is_none());
    assert_eq!(outcome.results.get(CONN).unwrap().status, TestStatus::Pass);
}

#[test]
fn session_open_failure_is_retried_at_the_next_configuration() {
    let mut harness = Harness::new(planner(|_, _| RunPlan::verdict(TestStatus::Pass)));
    harness.endpoints = vec!["unreachable"];
    let mut runner = harness.build();

    let configurations = Configurations::new([
        configuration("default", Selection::All),
        configuration("privacy", Selection::Allow(vec!["GAP/PRIV".to_owned()])),
    ]);
    let outcome = runner.run_batch(
        &configurations,
        &catalog(&[CONN, PRIV]),
        RetryPolicy::new_without_delay(0),
    );

    assert!(outcome.results.is_empty());
    let failed: Vec<_> = outcome
        .infrastructure_failures
        .iter()
        .map(|failure| failure.configuration.as_str())
        .collect();
    assert_eq!(failed, ["default", "privacy"]);
    assert!(
        outcome.infrastructure_failures[0]
            .message
            .contains("connection refused")
    );
}

#[test]
fn regressions_against_history() {
    let dir = Utf8TempDir::with_prefix("ptsbot-history-").unwrap();
    let store = HistoryStore::new(dir.path().join("history.json"));
    store
        .record([(CONN, TestStatus::Pass), (GATT, TestStatus::Fail)])
        .unwrap();

    let mut harness = Harness::new(planner(|name, _| {
        if name == CONN {
            RunPlan::verdict(TestStatus::Fail)
        } else {
            RunPlan::verdict(TestStatus::Pass)
        }
    }));
    harness.history = Some(store.clone());
    let mut runner = harness.build();

    let outcome = runner.run_batch(
        &Configurations::single_default(),
        &catalog(&[CONN, GATT, PRIV]),
        RetryPolicy::new_without_delay(0),
    );

    assert_eq!(
        outcome.regressions,
        [Regression {
            case_id: CONN.to_owned(),
            previous: TestStatus::Pass,
            current: TestStatus::Fail,
        }]
    );

    let recorded = store.load_statuses().unwrap();
    assert_eq!(recorded.get(CONN), Some(&TestStatus::Fail));
    assert_eq!(recorded.get(GATT), Some(&TestStatus::Pass));
    assert_eq!(recorded.get(PRIV), Some(&TestStatus::Pass));
}

#[test]
fn companion_runs_on_secondary_session() {
    const LT2: &str = "GATT/SR/GAR/BV-01-C-LT2";
    let mut harness = Harness::new(planner(|name, _| {
        if name == LT2 {
            RunPlan::verdict(TestStatus::Pass).callback(5, "Please enter the group address")
        } else {
            RunPlan::verdict(TestStatus::Pass)
        }
    }));
    harness.endpoints = vec!["pts-1", "pts-2"];
    let mut runner = harness.build();

    let case = TestCase::builder("GATT", GATT)
        .edit(5, EditValue::Literal("C000".to_owned()))
        .companion(1, LT2)
        .build();
    let outcome = runner.run_batch(
        &Configurations::single_default(),
        &Catalog::from_cases([case]).unwrap(),
        RetryPolicy::new_without_delay(0),
    );

    assert_eq!(outcome.results.get(GATT).unwrap().status, TestStatus::Pass);
    let events = &harness.events;
    assert_eq!(events.count("open:pts-2:LT2"), 1);
    assert!(events.position(&format!("start:{LT2}")) < events.position(&format!("start:{GATT}")));
    assert_eq!(events.count("reply:5=`C000`"), 1);
}

// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ordering of scripted steps against callbacks.

use crate::fixtures::*;
use ptsbot_runner::{
    catalog::{Catalog, EditValue, Step, TestCase},
    config::{Configurations, RetryPolicy},
    device::DeviceCommand,
    reporter::TestStatus,
};
use std::time::Duration;

const SEC: &str = "GAP/SEC/AUT/BV-11-C";

fn logging_producer(events: &EventLog, wid: u32, value: &str) -> EditValue {
    let events = events.clone();
    let value = value.to_owned();
    EditValue::producer(move |_| {
        events.push(format!("answer:{wid}"));
        Some(value.clone())
    })
}

#[test]
fn steps_are_ordered_against_callbacks() {
    let harness = Harness::new(planner(|_, _| {
        RunPlan::verdict(TestStatus::Pass)
            .callback(1, "Please make the IUT connectable")
            .callback(2, "Please enter the passkey")
    }));
    let mut runner = harness.build();

    let case = TestCase::builder("GAP", SEC)
        .step(Step::device(DeviceCommand::new("precondition")))
        .step(Step::device(DeviceCommand::new("after_1")).after_callback(1))
        .step(Step::device(DeviceCommand::new("before_2")).before_callback(2))
        .edit(1, logging_producer(&harness.events, 1, "ok"))
        .edit(2, logging_producer(&harness.events, 2, "000000"))
        .build();
    let outcome = runner.run_batch(
        &Configurations::single_default(),
        &Catalog::from_cases([case]).unwrap(),
        RetryPolicy::new_without_delay(0),
    );

    assert_eq!(outcome.results.get(SEC).unwrap().status, TestStatus::Pass);

    let events = &harness.events;
    // Preconditions run before the tool starts the test case.
    assert!(events.position("send:precondition") < events.position(&format!("start:{SEC}")));
    // `after_callback = 1` waits for callback 1 to be answered.
    assert!(events.position("answer:1") < events.position("send:after_1"));
    // `before_callback = 2` holds callback 2 until the step has run.
    assert!(events.position("send:before_2") < events.position("answer:2"));
    assert_eq!(events.count("answer:1"), 1);
    assert_eq!(events.count("answer:2"), 1);
}

#[test]
fn missing_callback_times_out() {
    let mut harness = Harness::new(planner(|_, _| {
        RunPlan::verdict(TestStatus::Pass).callback(2, "Please enter the passkey")
    }));
    harness.attempt_timeout = Duration::from_millis(300);
    let mut runner = harness.build();

    let case = TestCase::builder("GAP", SEC)
        .step(Step::device(DeviceCommand::new("after_1")).after_callback(1))
        .step(Step::device(DeviceCommand::new("before_2")).before_callback(2))
        .edit(2, logging_producer(&harness.events, 2, "000000"))
        .build();
    let outcome = runner.run_batch(
        &Configurations::single_default(),
        &Catalog::from_cases([case]).unwrap(),
        RetryPolicy::new_without_delay(0),
    );

    // Callback 1 never arrives, so the attempt runs out of time waiting for it.
    let result = outcome.results.get(SEC).unwrap();
    assert_eq!(result.status, TestStatus::Inconclusive);
    assert_eq!(
        result.description.as_deref(),
        Some("callback 1 was not answered before the deadline")
    );
    assert_eq!(harness.events.count("send:after_1"), 0);
    assert_eq!(harness.events.count("send:before_2"), 0);
    assert_eq!(harness.events.count("stop:pts"), 1);
}

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{json, Map, Value};
use spindle::compiler::compile;
use spindle::dsl::builder::ProcessBuilder;
use spindle::dsl::Process;
use spindle::events::timer::{parse_duration, TimerKind};
use spindle::events::{Event, EventDefinition, EventKind};
use spindle::runtime::blueprint::SpecRegistry;
use spindle::runtime::evaluator::EvalexprEvaluator;
use spindle::{Task, TaskFilter, TaskState, Workflow, WorkflowError};

fn start(process: Process, data: Value) -> Workflow {
    let blueprint = compile(process).expect("Compilation failed");
    Workflow::new(Arc::new(blueprint), SpecRegistry::new(), Arc::new(EvalexprEvaluator::new()))
        .expect("Failed to create workflow")
        .with_data(data.as_object().cloned().unwrap_or_default())
}

fn only<'a>(workflow: &'a Workflow, spec: &str) -> &'a Task {
    let tasks = workflow.get_tasks(TaskFilter::new().spec(spec));
    assert_eq!(tasks.len(), 1, "expected exactly one '{}' task", spec);
    tasks[0]
}

fn order_message(result_var: Option<&str>) -> EventDefinition {
    EventDefinition::Message {
        name: "order".to_string(),
        correlation: BTreeMap::from([("order_id".to_string(), "order_id".to_string())]),
        payload: None,
        result_var: result_var.map(str::to_string),
    }
}

#[test]
fn test_message_correlation() {
    let process = ProcessBuilder::new("correlation")
        .start("start")
        .catch("wait", order_message(None))
        .end("end")
        .connect("start", "wait")
        .connect("wait", "end")
        .build();

    let mut workflow = start(process, json!({ "order_id": "42" }));
    workflow.advance_ready_tasks().expect("run failed");
    assert_eq!(only(&workflow, "wait").state, TaskState::Waiting);

    // A different order does not match.
    let caught = workflow
        .throw(Event::message("order").with_correlation("order_id", "7"))
        .expect("throw failed");
    assert_eq!(caught, 0);
    assert_eq!(only(&workflow, "wait").state, TaskState::Waiting);

    // Neither does another message name.
    let caught = workflow
        .throw(Event::message("invoice").with_correlation("order_id", "42"))
        .expect("throw failed");
    assert_eq!(caught, 0);

    let caught = workflow
        .throw(
            Event::message("order")
                .with_correlation("order_id", "42")
                .with_payload(json!({ "ok": true })),
        )
        .expect("throw failed");
    assert_eq!(caught, 1);
    let wait = only(&workflow, "wait");
    assert_eq!(wait.state, TaskState::Ready);
    assert_eq!(wait.internal_data.get("order"), Some(&json!({ "ok": true })));

    workflow.advance_ready_tasks().expect("run failed");
    assert!(workflow.is_completed());
    assert_eq!(workflow.data().get("wait_Response"), Some(&json!({ "ok": true })));
    assert!(only(&workflow, "wait").internal_data.get("order").is_none());
}

#[test]
fn test_message_payload_lands_in_result_var() {
    let process = ProcessBuilder::new("result-var")
        .start("start")
        .catch("wait", order_message(Some("payment")))
        .end("end")
        .connect("start", "wait")
        .connect("wait", "end")
        .build();

    let mut workflow = start(process, json!({ "order_id": "42" }));
    workflow.advance_ready_tasks().expect("run failed");
    workflow
        .throw(
            Event::message("order")
                .with_correlation("order_id", "42")
                .with_correlation("channel", "web")
                .with_payload(json!(99.5)),
        )
        .expect("throw failed");
    workflow.advance_ready_tasks().expect("run failed");

    assert_eq!(workflow.data().get("payment"), Some(&json!(99.5)));
}

#[test]
fn test_thrown_message_reaches_waiting_task() {
    let process = ProcessBuilder::new("ping")
        .start("start")
        .parallel_gateway("fork")
        .catch("listen", EventDefinition::message("ping"))
        .throw(
            "send",
            EventDefinition::Message {
                name: "ping".to_string(),
                correlation: BTreeMap::new(),
                payload: Some("count * 10".to_string()),
                result_var: None,
            },
        )
        .end("heard")
        .end("sent")
        .connect("start", "fork")
        .connect("fork", "listen")
        .connect("fork", "send")
        .connect("listen", "heard")
        .connect("send", "sent")
        .build();

    let mut workflow = start(process, json!({ "count": 4 }));
    workflow.advance_ready_tasks().expect("run failed");

    assert!(workflow.is_completed());
    assert_eq!(only(&workflow, "heard").state, TaskState::Completed);
    assert_eq!(only(&workflow, "heard").data.get("listen_Response"), Some(&json!(40)));

    let events = workflow.take_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::Message);
    assert_eq!(events[0].payload, Some(json!(40)));
}

#[test]
fn test_signal_reaches_every_waiting_task() {
    let process = ProcessBuilder::new("signal")
        .start("start")
        .parallel_gateway("fork")
        .catch("a", EventDefinition::Signal { name: "go".to_string() })
        .catch("b", EventDefinition::Signal { name: "go".to_string() })
        .end("end_a")
        .end("end_b")
        .connect("start", "fork")
        .connect("fork", "a")
        .connect("fork", "b")
        .connect("a", "end_a")
        .connect("b", "end_b")
        .build();

    let mut workflow = start(process, json!({}));
    workflow.advance_ready_tasks().expect("run failed");
    assert_eq!(workflow.get_tasks(TaskState::Waiting).len(), 2);

    assert_eq!(workflow.throw(Event::signal("stop")).expect("throw failed"), 0);
    assert_eq!(workflow.throw(Event::signal("go")).expect("throw failed"), 2);
    workflow.advance_ready_tasks().expect("run failed");
    assert!(workflow.is_completed());
}

#[test]
fn test_external_terminate_cancels_everything() {
    let process = ProcessBuilder::new("external-terminate")
        .start("start")
        .catch("wait", EventDefinition::Signal { name: "go".to_string() })
        .end("end")
        .connect("start", "wait")
        .connect("wait", "end")
        .build();

    let mut workflow = start(process, json!({}));
    workflow.advance_ready_tasks().expect("run failed");
    workflow.throw(Event::terminate()).expect("throw failed");

    assert!(workflow.is_completed());
    assert_eq!(only(&workflow, "wait").state, TaskState::Cancelled);
}

#[test]
fn test_timer_fires_on_refresh() {
    let process = ProcessBuilder::new("timer")
        .start("start")
        .catch(
            "wait",
            EventDefinition::Timer { kind: TimerKind::Duration, expression: "delay".to_string() },
        )
        .end("end")
        .connect("start", "wait")
        .connect("wait", "end")
        .build();

    let mut workflow = start(process, json!({ "delay": "PT1H" }));
    let before = Utc::now();
    workflow.advance_ready_tasks().expect("run failed");

    let deadline = workflow.earliest_timer().expect("a timer should be pending");
    assert!(deadline >= before + Duration::hours(1) - Duration::seconds(1));
    assert!(deadline <= Utc::now() + Duration::hours(1) + Duration::seconds(1));

    // Timers ignore events and early refreshes.
    assert_eq!(workflow.throw(Event::signal("timer")).expect("throw failed"), 0);
    assert_eq!(workflow.refresh_waiting_tasks(Utc::now()).expect("refresh failed"), 0);
    assert_eq!(only(&workflow, "wait").state, TaskState::Waiting);

    let fired = workflow
        .refresh_waiting_tasks(Utc::now() + Duration::hours(2))
        .expect("refresh failed");
    assert_eq!(fired, 1);
    assert_eq!(workflow.earliest_timer(), None);
    workflow.advance_ready_tasks().expect("run failed");
    assert!(workflow.is_completed());
}

#[test]
fn test_date_timer_in_the_past_fires_immediately_on_refresh() {
    let process = ProcessBuilder::new("date-timer")
        .start("start")
        .catch(
            "wait",
            EventDefinition::Timer {
                kind: TimerKind::Date,
                expression: "\"2020-01-01T00:00:00Z\"".to_string(),
            },
        )
        .end("end")
        .connect("start", "wait")
        .connect("wait", "end")
        .build();

    let mut workflow = start(process, json!({}));
    workflow.advance_ready_tasks().expect("run failed");
    assert_eq!(
        workflow.earliest_timer().map(|d| d.to_rfc3339()),
        Some("2020-01-01T00:00:00+00:00".to_string())
    );
    assert_eq!(workflow.refresh_waiting_tasks(Utc::now()).expect("refresh failed"), 1);
}

#[test]
fn test_invalid_timer_expression_is_an_error() {
    let process = ProcessBuilder::new("bad-timer")
        .start("start")
        .catch(
            "wait",
            EventDefinition::Timer { kind: TimerKind::Duration, expression: "delay".to_string() },
        )
        .connect("start", "wait")
        .build();

    let mut workflow = start(process, json!({ "delay": "one hour" }));
    assert!(workflow.advance_ready_tasks().is_err());
    assert_eq!(only(&workflow, "wait").state, TaskState::Error);
}

#[test]
fn test_timer_beyond_the_calendar_is_an_error() {
    let process = ProcessBuilder::new("far-timer")
        .start("start")
        .catch(
            "wait",
            EventDefinition::Timer { kind: TimerKind::Duration, expression: "delay".to_string() },
        )
        .connect("start", "wait")
        .build();

    let mut workflow = start(process, json!({ "delay": "P999999Y" }));
    let err = workflow.advance_ready_tasks().expect_err("deadline is out of range");
    assert!(matches!(err, WorkflowError::Task { ref spec, .. } if spec == "wait"), "{err}");
    assert_eq!(only(&workflow, "wait").state, TaskState::Error);

    assert!(parse_duration("P99999999999999999999D").is_err());
}

#[test]
fn test_parse_iso_durations() {
    assert_eq!(parse_duration("PT1H30M").expect("valid"), Duration::minutes(90));
    assert_eq!(parse_duration("P1DT2S").expect("valid"), Duration::days(1) + Duration::seconds(2));
    assert_eq!(parse_duration("P2W").expect("valid"), Duration::days(14));
    assert_eq!(parse_duration("PT0.5S").expect("valid"), Duration::milliseconds(500));
    assert!(parse_duration("P").is_err());
    assert!(parse_duration("1H").is_err());
    assert!(parse_duration("PT5").is_err());
    assert!(parse_duration("P5H").is_err());
}

fn review_with_boundary(interrupting: bool) -> Process {
    ProcessBuilder::new("boundary")
        .start("start")
        .manual("review")
        .end("done")
        .end("escalated")
        .boundary("review", "abort", EventDefinition::Signal { name: "abort".to_string() }, interrupting)
        .connect("start", "review")
        .connect("review", "done")
        .connect("abort", "escalated")
        .build()
}

#[test]
fn test_interrupting_boundary_cancels_its_task() {
    let mut workflow = start(review_with_boundary(true), json!({}));
    workflow.advance_ready_tasks().expect("run failed");
    assert_eq!(only(&workflow, "review").state, TaskState::Started);
    assert_eq!(only(&workflow, "abort").state, TaskState::Waiting);

    assert_eq!(workflow.throw(Event::signal("abort")).expect("throw failed"), 1);
    workflow.advance_ready_tasks().expect("run failed");

    assert!(workflow.is_completed());
    assert_eq!(only(&workflow, "review").state, TaskState::Cancelled);
    assert_eq!(only(&workflow, "escalated").state, TaskState::Completed);
    assert!(workflow.get_tasks(TaskFilter::new().spec("done")).is_empty());
}

#[test]
fn test_finished_task_cancels_its_boundary() {
    let mut workflow = start(review_with_boundary(true), json!({}));
    workflow.advance_ready_tasks().expect("run failed");

    let review = only(&workflow, "review").id;
    workflow.complete_task(review, Map::new()).expect("submit failed");
    workflow.advance_ready_tasks().expect("run failed");

    assert!(workflow.is_completed());
    assert_eq!(only(&workflow, "abort").state, TaskState::Cancelled);
    assert_eq!(only(&workflow, "done").state, TaskState::Completed);
    assert_eq!(workflow.throw(Event::signal("abort")).expect("throw failed"), 0);
}

#[test]
fn test_non_interrupting_boundary_leaves_task_running() {
    let mut workflow = start(review_with_boundary(false), json!({}));
    workflow.advance_ready_tasks().expect("run failed");

    workflow.throw(Event::signal("abort")).expect("throw failed");
    workflow.advance_ready_tasks().expect("run failed");
    assert_eq!(only(&workflow, "escalated").state, TaskState::Completed);
    assert_eq!(only(&workflow, "review").state, TaskState::Started);
    assert!(!workflow.is_completed());

    let review = only(&workflow, "review").id;
    workflow.complete_task(review, Map::new()).expect("submit failed");
    workflow.advance_ready_tasks().expect("run failed");
    assert!(workflow.is_completed());
    assert_eq!(only(&workflow, "done").state, TaskState::Completed);
}

#[test]
fn test_descriptor_ignores_undeclared_keys() {
    let descriptor = Event::message("order").with_correlation("order_id", "42");
    assert!(descriptor.accepts(&Event::message("order").with_correlation("order_id", "42").with_correlation("x", 1)));
    assert!(!descriptor.accepts(&Event::message("order")));
    assert!(!descriptor.accepts(&Event::signal("order").with_correlation("order_id", "42")));

    let any_escalation = Event::new(EventKind::Escalation, "");
    assert!(any_escalation.accepts(&Event::escalation("late")));
    assert!(!Event::escalation("early").accepts(&Event::escalation("late")));
}

use std::sync::Arc;

use serde_json::{json, Map, Value};
use spindle::error::MigrationError;
use spindle::runtime::evaluator::EvalexprEvaluator;
use spindle::serializer::migration::{version_1_1, version_1_2, version_1_3};
use spindle::serializer::{self, migrate, CURRENT_VERSION};
use spindle::{TaskFilter, TaskState};

const T_START: &str = "00000000-0000-0000-0000-000000000001";
const T_SHIP: &str = "00000000-0000-0000-0000-000000000002";
const T_END: &str = "00000000-0000-0000-0000-000000000003";
const S_START: &str = "00000000-0000-0000-0000-000000000011";
const S_PACK: &str = "00000000-0000-0000-0000-000000000012";
const S_END: &str = "00000000-0000-0000-0000-000000000013";

fn task(id: &str, parent: Option<&str>, children: &[&str], spec: &str, state: u64) -> Value {
    json!({
        "id": id,
        "parent": parent,
        "children": children,
        "task_spec": spec,
        "state": state,
        "thread_id": 0,
        "data": { "order_id": 7 },
        "internal_data": {},
        "last_state_change": "2024-01-01T00:00:00Z",
    })
}

fn tagged(mut task: Value, workflow: &str) -> Value {
    task["workflow"] = json!(workflow);
    task
}

fn order_spec() -> Value {
    json!({
        "id": "order",
        "name": "order",
        "start": "start",
        "task_specs": [
            { "name": "start", "typename": "Start", "inputs": [], "outputs": ["ship"] },
            { "name": "ship", "typename": "SubProcess", "process": "shipping", "inputs": ["start"], "outputs": ["end"] },
            { "name": "end", "typename": "End", "inputs": ["ship"], "outputs": [] },
        ],
    })
}

fn shipping_spec() -> Value {
    json!({
        "id": "shipping",
        "name": "shipping",
        "start": "start",
        "task_specs": [
            { "name": "start", "typename": "Start", "inputs": [], "outputs": ["pack"] },
            { "name": "pack", "typename": "Manual", "inputs": ["start"], "outputs": ["end"] },
            { "name": "end", "typename": "End", "inputs": ["pack"], "outputs": [] },
        ],
    })
}

/// A 1.0 snapshot: the shipping sub-process is still part of the caller's
/// task map, below the `ship` task.
fn legacy_snapshot() -> Value {
    let mut spec = order_spec();
    spec["subprocess_specs"] = json!({ "shipping": shipping_spec() });
    json!({
        "serializer_version": "1.0",
        "spec": spec,
        "root": T_START,
        "data": { "order_id": 7 },
        "tasks": {
            T_START: tagged(task(T_START, None, &[T_SHIP], "start", 32), "order"),
            T_SHIP: tagged(task(T_SHIP, Some(T_START), &[S_START, T_END], "ship", 16), "order"),
            T_END: tagged(task(T_END, Some(T_SHIP), &[], "end", 4), "order"),
            S_START: tagged(task(S_START, Some(T_SHIP), &[S_PACK], "start", 32), "shipping"),
            S_PACK: tagged(task(S_PACK, Some(S_START), &[S_END], "pack", 16), "shipping"),
            S_END: tagged(task(S_END, Some(S_PACK), &[], "end", 4), "shipping"),
        },
    })
}

#[test]
fn test_subprocess_relocated_in_1_1() {
    let migrated = version_1_1::migrate(legacy_snapshot()).expect("migration failed");

    let expected = json!({
        "serializer_version": "1.0",
        "spec": order_spec(),
        "root": T_START,
        "data": { "order_id": 7 },
        "tasks": {
            T_START: task(T_START, None, &[T_SHIP], "start", 32),
            T_SHIP: task(T_SHIP, Some(T_START), &[T_END], "ship", 8),
            T_END: task(T_END, Some(T_SHIP), &[], "end", 4),
        },
        "subprocesses": {
            T_SHIP: {
                "spec": "shipping",
                "root": S_START,
                "data": { "order_id": 7 },
                "tasks": {
                    S_START: task(S_START, None, &[S_PACK], "start", 32),
                    S_PACK: task(S_PACK, Some(S_START), &[S_END], "pack", 16),
                    S_END: task(S_END, Some(S_PACK), &[], "end", 4),
                },
            },
        },
        "subprocess_specs": { "shipping": shipping_spec() },
    });
    assert_eq!(migrated, expected);
}

#[test]
fn test_legacy_snapshot_restores_and_runs() {
    let legacy = legacy_snapshot();
    let migrated = migrate(&legacy).expect("migration failed");
    assert_eq!(migrated["serializer_version"], CURRENT_VERSION);
    assert_eq!(migrated["generation"], 0);
    assert_eq!(migrated["next_thread_id"], 1);
    // COMPLETED moved from 32 to 64 along the way.
    assert_eq!(migrated["tasks"][T_START]["state"], 64);
    assert_eq!(migrated["subprocesses"][T_SHIP]["tasks"][S_START]["state"], 64);
    // The input is left as it was.
    assert_eq!(legacy, legacy_snapshot());

    let mut workflow =
        serializer::deserialize(legacy, Arc::new(EvalexprEvaluator::new())).expect("deserialize failed");
    let ship = workflow.get_task(T_SHIP.parse().expect("uuid")).expect("ship task");
    assert_eq!(ship.state, TaskState::Waiting);

    workflow.advance_ready_tasks().expect("run failed");
    let pack = workflow.get_tasks(TaskFilter::new().spec("pack"))[0].id;
    workflow.complete_task(pack, Map::new()).expect("submit failed");
    workflow.advance_ready_tasks().expect("run failed");

    assert!(workflow.is_completed());
    let end = workflow.get_task(T_END.parse().expect("uuid")).expect("end task");
    assert_eq!(end.state, TaskState::Completed);
}

#[test]
fn test_current_snapshot_is_unchanged() {
    let migrated = migrate(&legacy_snapshot()).expect("migration failed");
    let again = migrate(&migrated).expect("migration failed");
    assert_eq!(again, migrated);
}

#[test]
fn test_version_errors() {
    let mut snapshot = legacy_snapshot();

    snapshot["serializer_version"] = json!("0.9");
    assert_eq!(migrate(&snapshot), Err(MigrationError::UnknownVersion("0.9".to_string())));

    snapshot["serializer_version"] = json!("2.0");
    assert_eq!(
        migrate(&snapshot),
        Err(MigrationError::NewerVersion { found: "2.0".to_string(), current: CURRENT_VERSION.to_string() })
    );

    snapshot["serializer_version"] = json!("1.10");
    assert_eq!(
        migrate(&snapshot),
        Err(MigrationError::NewerVersion { found: "1.10".to_string(), current: CURRENT_VERSION.to_string() })
    );

    snapshot["serializer_version"] = json!("1.2.1");
    assert_eq!(migrate(&snapshot), Err(MigrationError::UnknownVersion("1.2.1".to_string())));

    if let Value::Object(map) = &mut snapshot {
        map.remove("serializer_version");
    }
    assert!(matches!(migrate(&snapshot), Err(MigrationError::Malformed { .. })));
}

fn snapshot_1_1(specs: Value, tasks: Value) -> Value {
    json!({
        "serializer_version": "1.1",
        "spec": { "id": "p", "name": "p", "start": "start", "task_specs": specs },
        "root": T_START,
        "tasks": tasks,
        "subprocesses": {},
        "subprocess_specs": {},
    })
}

#[test]
fn test_1_2_rewrites_states_timers_and_defaults() {
    let specs = json!([
        {
            "name": "wait", "typename": "CatchEvent",
            "event": { "typename": "Timer", "kind": "duration", "expression": "timedelta(hours=1, minutes=30)" },
        },
        {
            "name": "at", "typename": "CatchEvent",
            "event": { "typename": "Timer", "kind": "date", "expression": "datetime(2024, 5, 1, 12, 0)" },
        },
        {
            "name": "check", "typename": "Gateway", "gateway": "exclusive",
            "conditions": [{ "condition": "x > 1", "target": "a" }],
            "outputs": ["a", "b"],
        },
    ]);
    let tasks = json!({
        T_START: task(T_START, None, &[], "start", 32),
        T_SHIP: task(T_SHIP, None, &[], "check", 64),
        T_END: task(T_END, None, &[], "wait", 16),
    });

    let migrated = version_1_2::migrate(snapshot_1_1(specs, tasks)).expect("migration failed");

    assert_eq!(migrated["tasks"][T_START]["state"], 64);
    assert_eq!(migrated["tasks"][T_SHIP]["state"], 256);
    assert_eq!(migrated["tasks"][T_END]["state"], 16);

    let specs = &migrated["spec"]["task_specs"];
    assert_eq!(specs[0]["event"]["expression"], "\"PT1H30M\"");
    assert_eq!(specs[1]["event"]["expression"], "\"2024-05-01T12:00:00+00:00\"");
    assert_eq!(
        specs[2]["conditions"],
        json!([
            { "condition": "x > 1", "target": "a" },
            { "condition": null, "target": "b" },
        ])
    );
}

#[test]
fn test_1_2_rejects_unknown_timer_expression() {
    let specs = json!([{
        "name": "wait", "typename": "CatchEvent",
        "event": { "typename": "Timer", "kind": "duration", "expression": "timedelta(fortnights=1)" },
    }]);
    let err = version_1_2::migrate(snapshot_1_1(specs, json!({}))).expect_err("fortnights are unknown");
    match err {
        MigrationError::Unsupported { version, construct } => {
            assert_eq!(version, "1.1");
            assert!(construct.contains("timedelta(fortnights=1)"), "{construct}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_1_2_multi_instance() {
    let specs = json!([
        { "name": "each", "typename": "MultiInstance", "inputs": ["start"], "outputs": ["work"] },
        { "name": "work", "typename": "Task", "inputs": ["each"], "outputs": [] },
    ]);

    // Finished fan-outs are rewritten into a thread split.
    let done = json!({ T_START: task(T_START, None, &[], "each", 32) });
    let migrated = version_1_2::migrate(snapshot_1_1(specs.clone(), done)).expect("migration failed");
    let specs_out = migrated["spec"]["task_specs"].as_array().expect("specs");
    assert_eq!(specs_out[0]["typename"], "ThreadSplit");
    assert_eq!(specs_out[0]["thread_start"], "each_thread_start");
    assert_eq!(specs_out[0]["outputs"], json!([]));
    let start = specs_out.iter().find(|s| s["name"] == "each_thread_start").expect("thread start");
    assert_eq!(start["typename"], "ThreadStart");
    assert_eq!(start["outputs"], json!(["work"]));

    // Fan-outs that were not reached yet are rewritten too.
    for code in [1, 2, 4] {
        let pending = json!({ T_START: task(T_START, None, &[], "each", code) });
        let migrated = version_1_2::migrate(snapshot_1_1(specs.clone(), pending)).expect("migration failed");
        assert_eq!(migrated["spec"]["task_specs"][0]["typename"], "ThreadSplit");
        assert_eq!(migrated["tasks"][T_START]["state"], code);
    }

    // One still running cannot be translated.
    for code in [8, 16] {
        let running = json!({ T_START: task(T_START, None, &[], "each", code) });
        let err = version_1_2::migrate(snapshot_1_1(specs.clone(), running)).expect_err("in-flight fan-out");
        assert!(matches!(err, MigrationError::Unsupported { ref version, .. } if version == "1.1"));
    }
}

#[test]
fn test_1_3_renames_event_attributes_and_payloads() {
    let mut pending = task(T_END, None, &[], "wait", 16);
    pending["thread_id"] = json!(2);
    pending["internal_data"] = json!({ "event": { "name": "order", "payload": { "ok": true } } });

    let snapshot = json!({
        "serializer_version": "1.2",
        "spec": {
            "id": "p", "name": "p", "start": "start",
            "task_specs": [
                {
                    "name": "wait", "typename": "CatchEvent",
                    "event": {
                        "typename": "Message", "name": "order", "external": true,
                        "correlation_properties": [{ "name": "order_id", "expression": "order_id" }],
                    },
                },
                {
                    "name": "late", "typename": "ThrowEvent",
                    "event": { "typename": "Escalation", "escalation_code": "late" },
                },
            ],
        },
        "root": T_START,
        "tasks": { T_START: task(T_START, None, &[], "start", 64), T_END: pending },
    });

    let migrated = version_1_3::migrate(snapshot).expect("migration failed");

    let specs = &migrated["spec"]["task_specs"];
    assert_eq!(
        specs[0]["event"],
        json!({ "typename": "Message", "name": "order", "correlation": { "order_id": "order_id" } })
    );
    assert_eq!(specs[1]["event"], json!({ "typename": "Escalation", "code": "late" }));
    assert_eq!(
        migrated["tasks"][T_END]["internal_data"],
        json!({ "order": { "ok": true }, "caught": "order" })
    );
    assert_eq!(migrated["generation"], 0);
    assert_eq!(migrated["next_thread_id"], 3);
}

#[test]
fn test_1_3_refuses_to_drop_an_unnamed_payload() {
    for pending in [json!({ "payload": 1 }), json!("stray")] {
        let mut waiting = task(T_END, None, &[], "wait", 16);
        waiting["internal_data"] = json!({ "event": pending });
        let snapshot = json!({
            "serializer_version": "1.2",
            "spec": { "id": "p", "name": "p", "start": "start", "task_specs": [] },
            "root": T_START,
            "tasks": { T_END: waiting },
        });

        let err = version_1_3::migrate(snapshot).expect_err("payload cannot be rekeyed");
        assert!(matches!(err, MigrationError::Unsupported { ref version, .. } if version == "1.2"), "{err}");
    }
}

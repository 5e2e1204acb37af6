use serde_json::json;
use spindle::dsl::builder::ProcessBuilder;
use spindle::dsl::NodeType;
use spindle::events::EventDefinition;

#[test]
fn test_build_linear_process() {
    let process = ProcessBuilder::new("linear-flow")
        .name("Linear")
        .version("3")
        .var("env", "prod")
        .start("start")
        .script("compute", "total = price * 2")
        .end("end")
        .connect("start", "compute")
        .connect("compute", "end")
        .build();

    assert_eq!(process.id, "linear-flow");
    assert_eq!(process.name, "Linear");
    assert_eq!(process.version, "3");
    assert_eq!(process.variables.get("env"), Some(&json!("prod")));
    assert_eq!(process.nodes.len(), 3);
    assert_eq!(process.edges.len(), 2);

    let node = process.nodes.iter().find(|n| n.id == "compute").expect("Node not found");
    match &node.kind {
        NodeType::Script { script } => assert_eq!(script, "total = price * 2"),
        other => panic!("Node type mismatch: {:?}", other),
    }
}

#[test]
fn test_build_branching_process() {
    let process = ProcessBuilder::new("branching")
        .start("start")
        .exclusive("check")
        .task("a")
        .task("b")
        .connect("start", "check")
        .connect_if("check", "a", "x > 10")
        .connect_default("check", "b")
        .build();

    let to_a = process.edges.iter().find(|e| e.target == "a").expect("edge to a");
    assert_eq!(to_a.condition.as_deref(), Some("x > 10"));
    assert!(!to_a.is_default());

    let to_b = process.edges.iter().find(|e| e.target == "b").expect("edge to b");
    assert!(to_b.is_default());
    assert_eq!(to_b.condition, None);
}

#[test]
fn test_build_thread_split_and_boundary() {
    let process = ProcessBuilder::new("threads")
        .start("start")
        .thread_split("fan_out")
            .collection("orders", "order")
            .build()
        .manual("review")
        .boundary("review", "deadline", EventDefinition::Signal { name: "abort".to_string() }, true)
        .thread_merge("fan_in", "fan_out")
        .end("end")
        .build();

    let split = process.nodes.iter().find(|n| n.id == "fan_out").expect("split");
    match &split.kind {
        NodeType::ThreadSplit { times, collection, element_var } => {
            assert_eq!(*times, None);
            assert_eq!(collection.as_deref(), Some("orders"));
            assert_eq!(element_var.as_deref(), Some("order"));
        }
        other => panic!("expected a thread split, got {:?}", other),
    }

    let review = process.nodes.iter().find(|n| n.id == "review").expect("review");
    assert_eq!(review.boundary_events.len(), 1);
    assert_eq!(review.boundary_events[0].id, "deadline");
    assert!(review.boundary_events[0].interrupting);
}

#[test]
fn test_process_yaml_shape() {
    let yaml = r#"
id: order
name: Order handling
nodes:
  - id: start
    type: Start
  - id: wait_payment
    type: IntermediateCatch
    event:
      typename: Message
      name: payment
      correlation:
        order_id: order_id
  - id: end
    type: End
edges:
  - source: start
    target: wait_payment
  - source: wait_payment
    target: end
"#;
    let process: spindle::dsl::Process = serde_yaml::from_str(yaml).expect("Failed to parse YAML");

    let expected = ProcessBuilder::new("order")
        .name("Order handling")
        .start("start")
        .catch(
            "wait_payment",
            EventDefinition::Message {
                name: "payment".to_string(),
                correlation: [("order_id".to_string(), "order_id".to_string())].into(),
                payload: None,
                result_var: None,
            },
        )
        .end("end")
        .connect("start", "wait_payment")
        .connect("wait_payment", "end")
        .build();

    assert_eq!(process, expected);
}

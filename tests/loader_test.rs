use std::fs;

use spindle::compiler::loader;
use spindle::dsl::builder::ProcessBuilder;

const ORDER_YAML: &str = r#"
id: "order-flow"
name: "Order Flow"
variables:
  env: "dev"
nodes:
  - id: "start"
    type: "Start"
  - id: "price"
    type: "Script"
    script: "total = amount * 2"
  - id: "ship"
    type: "SubProcess"
    process: "shipping"
  - id: "end"
    type: "End"
edges:
  - source: "start"
    target: "price"
  - source: "price"
    target: "ship"
  - source: "ship"
    target: "end"
"#;

const SHIPPING_YAML: &str = r#"
id: "shipping"
name: "Shipping"
nodes:
  - id: "start"
    type: "Start"
  - id: "label"
    type: "Script"
    script: "shipped = true"
  - id: "end"
    type: "End"
edges:
  - source: "start"
    target: "label"
  - source: "label"
    target: "end"
"#;

#[test]
fn test_load_simple_yaml_process() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let file_path = temp_dir.path().join("order.yaml");
    fs::write(&file_path, ORDER_YAML).expect("Failed to write temp file");

    let loaded = loader::load_process_from_yaml(&file_path).expect("Failed to load process from YAML");

    let expected = ProcessBuilder::new("order-flow")
        .name("Order Flow")
        .var("env", "dev")
        .start("start")
        .script("price", "total = amount * 2")
        .subprocess("ship", "shipping")
        .end("end")
        .connect("start", "price")
        .connect("price", "ship")
        .connect("ship", "end")
        .build();

    assert_eq!(loaded, expected);
}

#[test]
fn test_load_blueprint_and_registry() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let order = temp_dir.path().join("order.yaml");
    let shipping = temp_dir.path().join("shipping.yaml");
    fs::write(&order, ORDER_YAML).expect("Failed to write temp file");
    fs::write(&shipping, SHIPPING_YAML).expect("Failed to write temp file");

    let blueprint = loader::load_blueprint_from_yaml(&order).expect("Failed to compile");
    assert_eq!(blueprint.id, "order-flow");
    assert_eq!(blueprint.subprocesses().collect::<Vec<_>>(), vec!["shipping"]);

    let registry = loader::load_registry(&[&shipping]).expect("Failed to load registry");
    assert!(registry.get("shipping").is_some());
    registry.check(&blueprint).expect("sub-process should be registered");

    let empty = loader::load_registry::<&std::path::Path>(&[]).expect("empty registry");
    assert!(empty.check(&blueprint).is_err());
}

#[test]
fn test_load_missing_file() {
    let err = loader::load_process_from_yaml("/definitely/not/here.yaml").expect_err("should fail");
    assert!(err.to_string().contains("Failed to read YAML file"));
}

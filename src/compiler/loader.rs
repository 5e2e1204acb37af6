use std::fs;
use std::path::Path;

use anyhow::{Context as AnyhowContext, Result};

use crate::compiler::core::compile;
use crate::dsl::Process;
use crate::runtime::blueprint::{Blueprint, SpecRegistry};

pub fn load_process_from_yaml(file_path: impl AsRef<Path>) -> Result<Process> {
    let file_path = file_path.as_ref();
    let yaml_content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read YAML file from {}", file_path.display()))?;

    let process: Process = serde_yaml::from_str(&yaml_content)
        .with_context(|| format!("Failed to deserialize YAML content from {}", file_path.display()))?;

    Ok(process)
}

pub fn load_blueprint_from_yaml(file_path: impl AsRef<Path>) -> Result<Blueprint> {
    let file_path = file_path.as_ref();
    let process = load_process_from_yaml(file_path)?;
    compile(process).with_context(|| format!("Failed to compile process from {}", file_path.display()))
}

/// Compiles every file into a registry of callable sub-processes.
pub fn load_registry<P: AsRef<Path>>(paths: &[P]) -> Result<SpecRegistry> {
    let mut registry = SpecRegistry::new();
    for path in paths {
        registry = registry.with(load_blueprint_from_yaml(path)?);
    }
    Ok(registry)
}

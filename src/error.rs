use thiserror::Error;
use uuid::Uuid;

use crate::runtime::task::TaskState;

/// The definition graph is malformed. Raised at load time and never recovered.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StructuralError {
    #[error("process '{0}' has no start task")]
    MissingStart(String),
    #[error("duplicate task spec '{0}'")]
    DuplicateSpec(String),
    #[error("task spec '{0}' not found")]
    MissingSpec(String),
    #[error("edge {from} -> {to} points at an unknown task spec")]
    DanglingEdge { from: String, to: String },
    #[error("thread start '{0}' must have no inputs and at least one output")]
    InvalidThreadStart(String),
    #[error("thread start '{0}' can reach its own split")]
    CyclicThreadStart(String),
    #[error("thread merge '{merge}' refers to '{split}', which is not a thread split")]
    DanglingJoin { merge: String, split: String },
    #[error("sub-process '{0}' is not registered")]
    UnknownSubprocess(String),
    #[error("join '{join}' received a completion from thread {thread}, which was never spawned")]
    UnknownThread { join: String, thread: u64 },
    #[error("{0}")]
    Invalid(String),
}

/// An expression, script or payload could not be computed.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct EvaluationError {
    pub expression: Option<String>,
    pub message: String,
}

impl EvaluationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { expression: None, message: message.into() }
    }

    pub fn in_expression(expression: &str, message: impl Into<String>) -> Self {
        Self {
            expression: Some(expression.to_string()),
            message: format!("'{}': {}", expression, message.into()),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MigrationError {
    #[error("snapshot version {version} cannot be migrated: {construct}")]
    Unsupported { version: String, construct: String },
    #[error("unknown snapshot version '{0}'")]
    UnknownVersion(String),
    #[error("snapshot version {found} is newer than this engine ({current})")]
    NewerVersion { found: String, current: String },
    #[error("snapshot version {version} is malformed: {reason}")]
    Malformed { version: String, reason: String },
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Structural(#[from] StructuralError),
    #[error("task '{spec}' ({task_id}) failed: {source}")]
    Task {
        task_id: Uuid,
        spec: String,
        #[source]
        source: EvaluationError,
    },
    #[error("task {0} not found")]
    TaskNotFound(Uuid),
    #[error("task {task_id} is {actual}, expected {expected}")]
    InvalidState {
        task_id: Uuid,
        actual: TaskState,
        expected: TaskState,
    },
    #[error(transparent)]
    Migration(#[from] MigrationError),
    #[error("snapshot is malformed: {0}")]
    Snapshot(String),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error("concurrent modification of '{key}': expected generation {expected}, found {found}")]
    ConcurrentMutation { key: String, expected: u64, found: u64 },
}

pub type Result<T, E = WorkflowError> = std::result::Result<T, E>;

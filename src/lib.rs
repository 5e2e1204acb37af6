pub mod compiler;
pub mod dsl;
pub mod error;
pub mod events;
pub mod nodes;
pub mod runtime;
pub mod serializer;
pub mod util;

pub use error::{EvaluationError, MigrationError, StructuralError, WorkflowError};
pub use runtime::engine::Workflow;
pub use runtime::task::{Task, TaskFilter, TaskState};

pub mod core;
pub mod expander;
pub mod loader;

pub use self::core::{compile, Compiler};
pub use expander::Expander;
pub use loader::{load_blueprint_from_yaml, load_process_from_yaml, load_registry};

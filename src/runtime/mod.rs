pub mod blueprint;
pub mod engine;
pub mod evaluator;
pub mod node;
pub mod predict;
pub mod redis_storage;
pub mod storage;
pub mod task;
pub mod tree;

pub mod merge;

pub use merge::{merge, merge_maps, merged, MergeMode};

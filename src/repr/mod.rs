//! Model and tree representations.

pub mod model;
pub mod tree;

pub use model::{Model, PersistError};
pub use tree::{Branch, BranchFeature, BranchFeatureUnion, Leaf, Tree};

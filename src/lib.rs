//! seqboost: gradient-boosted decision trees for sequence prediction.
//!
//! The model is an additive ensemble of binary decision trees over boolean
//! feature bitmaps. Each tree routes a sequence position through unions of
//! single-bit tests drawn from the current and prior positions, and its
//! leaves add a delta to the position's logit vector; leaves can also mint
//! new boolean features that later trees are free to test, so the ensemble
//! grows its own feature space as it trains.
//!
//! # Key Types
//!
//! - [`Model`] - the tree ensemble: evaluation, insertion, persistence
//! - [`Builder`] - greedy construction of a tree against the current loss
//! - [`Pruner`] - post-hoc reduction to a bounded number of leaves
//! - [`Loss`] / [`Heuristic`] - loss functions and split-scoring strategies
//! - [`Sequence`] / [`Timestep`] / [`TimestepSample`] - the data model
//!
//! # Training
//!
//! One boosting round: evaluate the current model over a batch, build a
//! tree from the resulting [`TimestepSample`]s, optionally prune it and
//! line-search its step ([`optimal_step`] / [`scale_optimal_step`]), then
//! [`Model::add`] it with a shrinkage factor.

pub mod data;
pub mod numeric;
pub mod repr;
pub mod testing;
pub mod training;
pub mod utils;

pub use data::{make_one_hot_sequence, timestep_samples, Bitmap, Sequence, Timestep, TimestepSample};
pub use repr::{Branch, BranchFeature, BranchFeatureUnion, Leaf, Model, PersistError, Tree};
pub use training::{
    avg_loss_delta, bounded_step, optimal_step, scale_optimal_step, Builder, Heuristic, Loss,
    Pruner,
};
pub use utils::run_with_threads;

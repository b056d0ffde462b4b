//! Training infrastructure: losses, splitting heuristics, the greedy tree
//! builder, pruning, and step-size control.

pub mod builder;
pub mod heuristic;
pub mod loss;
pub mod prune;
pub mod steps;

pub use builder::Builder;
pub use heuristic::Heuristic;
pub use loss::{softmax_loss_delta, softmax_loss_kl, Loss};
pub use prune::Pruner;
pub use steps::{avg_loss_delta, bounded_step, optimal_step, scale_optimal_step};

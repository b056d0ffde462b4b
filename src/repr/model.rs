//! The boosted ensemble model: ordered trees over a growing feature space.

use std::path::Path;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::{Sequence, TimestepSample};
use crate::repr::tree::Tree;

/// Errors from model persistence.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("model file i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("model encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// A sequence prediction model: an ordered ensemble of trees.
///
/// Trees are evaluated in insertion order; a later tree may read features
/// set by earlier trees' leaves. The feature bitmap length a model expects
/// is `base_features + extra_features`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Model {
    /// Features that come with the data itself.
    pub base_features: usize,
    /// Features added by the leaves of trees already in the model.
    pub extra_features: usize,
    /// The ensemble, first tree to run first.
    pub trees: Vec<Tree>,
}

impl Model {
    /// Create an empty model over `base_features` data features.
    pub fn new(base_features: usize) -> Self {
        Self {
            base_features,
            extra_features: 0,
            trees: Vec::new(),
        }
    }

    /// Total number of features the model currently reads or writes.
    #[inline]
    pub fn num_features(&self) -> usize {
        self.base_features + self.extra_features
    }

    /// Evaluate the model on one sequence, updating every timestep's output
    /// vector and derived leaf features in place.
    ///
    /// Evaluation is additive: outputs must start from the zero baseline
    /// for the result to be the model's prediction.
    pub fn evaluate(&self, seq: &mut Sequence) {
        for tree in &self.trees {
            for i in 0..seq.len() {
                self.apply_tree(tree, seq, i);
            }
        }
    }

    /// Evaluate the model on many sequences in parallel.
    pub fn evaluate_all(&self, seqs: &mut [Sequence]) {
        seqs.par_iter_mut().for_each(|seq| self.evaluate(seq));
    }

    /// Evaluate every tree against the single timestep at `index`.
    ///
    /// This is the generation-loop primitive: after appending a fresh
    /// timestep, evaluating only that position yields its prediction.
    pub fn evaluate_at(&self, seq: &mut Sequence, index: usize) {
        for tree in &self.trees {
            self.apply_tree(tree, seq, index);
        }
    }

    fn apply_tree(&self, tree: &Tree, seq: &mut Sequence, index: usize) {
        let leaf = {
            let sample = TimestepSample { sequence: seq, index };
            tree.evaluate(&sample).clone()
        };
        let ts = &mut seq.timesteps[index];
        for (out, delta) in ts.output.iter_mut().zip(&leaf.output_delta) {
            *out += delta;
        }
        if leaf.feature != 0 {
            ts.features.set(leaf.feature, true);
        }
    }

    /// Append a tree to the ensemble, scaling its leaf deltas by
    /// `step_size` first, and account for the features its leaves add.
    pub fn add(&mut self, mut tree: Tree, step_size: f32) {
        tree.scale(step_size);
        self.extra_features += tree.num_features();
        self.trees.push(tree);
    }

    /// Write the model as JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), PersistError> {
        let data = serde_json::to_vec(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Load the model from a JSON file, replacing this model's contents.
    ///
    /// A missing file is not an error: the model is left untouched.
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<(), PersistError> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        *self = serde_json::from_slice(&data)?;
        Ok(())
    }
}

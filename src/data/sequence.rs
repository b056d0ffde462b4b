//! Sequences of timesteps and the sample handles passed to training.

use crate::data::Bitmap;
use crate::repr::tree::BranchFeature;
use crate::training::loss::Loss;

/// A single position in a sequence.
///
/// `features` must be sized to the owning model's current feature count
/// (`base_features + extra_features`). `output` is mutated by model
/// evaluation; `target` is fixed at construction.
#[derive(Debug, Clone)]
pub struct Timestep {
    /// Feature bitmap for this position.
    pub features: Bitmap,
    /// Current prediction logits, accumulated by model evaluation.
    pub output: Vec<f32>,
    /// Ground-truth target distribution, same length as `output`.
    pub target: Vec<f32>,
}

impl Timestep {
    /// Create a timestep with zeroed outputs and targets.
    pub fn new(num_features: usize, output_size: usize) -> Self {
        Self {
            features: Bitmap::new(num_features),
            output: vec![0.0; output_size],
            target: vec![0.0; output_size],
        }
    }
}

/// An ordered list of timesteps, owned exclusively.
#[derive(Debug, Clone, Default)]
pub struct Sequence {
    pub timesteps: Vec<Timestep>,
}

impl Sequence {
    /// Create an empty sequence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of timesteps.
    #[inline]
    pub fn len(&self) -> usize {
        self.timesteps.len()
    }

    /// Whether the sequence has no timesteps.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.timesteps.is_empty()
    }

    /// Mean loss across the timesteps of this sequence.
    pub fn mean_loss(&self, loss: &Loss) -> f32 {
        let total: f32 = self
            .timesteps
            .iter()
            .map(|ts| loss.loss(&ts.output, &ts.target))
            .sum();
        total / self.timesteps.len() as f32
    }
}

/// Build a sequence for a run of one-hot values.
///
/// The features at each timestep mark the previous value and the target is
/// the current value; the first timestep has no features set, and the final
/// timestep is a terminator whose target is index 0.
pub fn make_one_hot_sequence(values: &[usize], output_size: usize, num_features: usize) -> Sequence {
    let mut res = Sequence::new();
    let mut ts = Timestep::new(num_features, output_size);
    for &x in values {
        ts.target[x] = 1.0;
        res.timesteps.push(ts);
        ts = Timestep::new(num_features, output_size);
        ts.features.set(x, true);
    }
    ts.target[0] = 1.0;
    res.timesteps.push(ts);
    res
}

/// A cheap, copyable handle to one timestep of a sequence.
///
/// Samples never extend the sequence's lifetime; they borrow it for the
/// duration of a training round.
#[derive(Debug, Clone, Copy)]
pub struct TimestepSample<'a> {
    pub sequence: &'a Sequence,
    pub index: usize,
}

impl<'a> TimestepSample<'a> {
    /// The timestep this handle points at.
    #[inline]
    pub fn timestep(&self) -> &'a Timestep {
        &self.sequence.timesteps[self.index]
    }

    /// Evaluate a branch feature at this position.
    ///
    /// A position before the start of the sequence reads as `true` only for
    /// the `-1` sentinel feature; a real feature index before the start
    /// reads as `false`.
    pub fn branch_feature(&self, b: &BranchFeature) -> bool {
        if b.steps_in_past > self.index {
            return b.feature == -1;
        }
        if b.feature == -1 {
            return false;
        }
        let ts = &self.sequence.timesteps[self.index - b.steps_in_past];
        ts.features.get(b.feature as usize)
    }
}

/// Collect every timestep of every sequence as a sample.
pub fn timestep_samples(seqs: &[Sequence]) -> Vec<TimestepSample<'_>> {
    let mut res = Vec::with_capacity(seqs.iter().map(Sequence::len).sum());
    for seq in seqs {
        for i in 0..seq.len() {
            res.push(TimestepSample { sequence: seq, index: i });
        }
    }
    res
}

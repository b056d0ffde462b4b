//! Greedy construction of union-split decision trees.
//!
//! The builder grows each node's routing test as a union of single-bit
//! feature tests: starting from the empty union it repeatedly ranks
//! candidate features on a subsample of the not-yet-captured samples,
//! optionally re-scores the top candidates on a second subsample and then
//! the full set, and appends the winner until the union is full or no
//! candidate improves the heuristic quality.
//!
//! Candidate evaluation is embarrassingly parallel and runs on the rayon
//! pool; all per-leaf aggregation is Kahan-compensated so that results stay
//! reproducible across thread counts to well below the `1e-6` significance
//! threshold used to discard noise-level quality deltas.

use std::cmp::Ordering;
use std::sync::Mutex;

use rand::Rng;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;

use crate::data::TimestepSample;
use crate::numeric::KahanSum;
use crate::repr::tree::{BranchFeature, BranchFeatureUnion, Tree};
use crate::training::heuristic::Heuristic;

/// Quality deltas smaller than this fraction of the quality magnitude are
/// treated as zero; see `feature_split_quality`.
const QUALITY_EPSILON: f32 = 1e-6;

/// Parameters for building new trees on top of a model.
#[derive(Debug, Clone)]
pub struct Builder {
    /// The splitting heuristic.
    pub heuristic: Heuristic,

    /// Maximum depth of the resulting trees.
    pub depth: usize,

    /// Minimum number of samples for splits to continue being made. A
    /// split that would leave a path with fewer samples is not taken.
    pub min_split_samples: usize,

    /// Maximum number of samples used to rank candidate features. When
    /// more samples are available, a random subset is ranked instead.
    /// Zero means "use every sample".
    pub max_split_samples: usize,

    /// Number of top-ranked splits to re-evaluate on the full sample set;
    /// zero selects the single best usable split. This is a lower bound: a
    /// few extra candidates may be scored at negligible cost.
    pub candidate_splits: usize,

    /// Number of samples each candidate is re-scored on before the full
    /// dataset pass. Zero disables the intermediate pass.
    pub candidate_prune_samples: usize,

    /// Maximum number of features ORed together in one union. Zero is
    /// treated as one.
    pub max_union: usize,

    /// Steps in the past to inspect for split features; include 0 for the
    /// current position.
    pub horizons: Vec<usize>,

    /// Number of features at the tail of the feature list to treat as
    /// second-class: they are considered for splits only with probability
    /// `1/sqrt(extra_features)` per enumeration, which keeps candidate
    /// enumeration from slowing down as the model adds features.
    pub extra_features: usize,

    /// Seed for the subsampling generator; two builds with the same seed
    /// and inputs enumerate identical candidate sets.
    pub seed: u64,
}

impl Builder {
    /// Build a tree greedily from the provided samples.
    ///
    /// The samples' output vectors must already reflect the current model
    /// (the heuristic differentiates the loss at those outputs).
    ///
    /// # Panics
    ///
    /// Panics if `samples` is empty.
    pub fn build(&self, samples: &[TimestepSample<'_>]) -> Tree {
        assert!(!samples.is_empty(), "no samples");
        let num_features = samples[0].timestep().features.len();
        let data = self.compute_vec_samples(samples);
        let indices: Vec<u32> = (0..data.len() as u32).collect();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(self.seed);
        self.build_node(&data, indices, self.depth, num_features, &mut rng)
    }

    /// Map every sample through the heuristic in parallel.
    fn compute_vec_samples<'a>(&self, samples: &[TimestepSample<'a>]) -> Vec<VecSample<'a>> {
        samples
            .par_iter()
            .map(|&sample| VecSample {
                sample,
                vector: self.heuristic.sample_vector(&sample),
            })
            .collect()
    }

    fn build_node(
        &self,
        data: &[VecSample<'_>],
        indices: Vec<u32>,
        depth: usize,
        next_feature: usize,
        rng: &mut Xoshiro256PlusPlus,
    ) -> Tree {
        if depth == 0 || indices.len() <= self.min_split_samples {
            return self.make_leaf(data, &indices, next_feature);
        }
        self.build_union(data, Vec::new(), indices, Vec::new(), depth, next_feature, rng)
    }

    /// Grow the union at the current node, then recurse into the split.
    ///
    /// `falses` holds the samples not yet captured by the union, `trues`
    /// the samples some member test already captured.
    #[allow(clippy::too_many_arguments)]
    fn build_union(
        &self,
        data: &[VecSample<'_>],
        mut union: BranchFeatureUnion,
        falses: Vec<u32>,
        mut trues: Vec<u32>,
        depth: usize,
        next_feature: usize,
        rng: &mut Xoshiro256PlusPlus,
    ) -> Tree {
        if !union.is_empty() && union.len() >= self.max_union.max(1) {
            return self.build_subtree(data, union, falses, trues, depth, next_feature, rng);
        }

        let (split_samples, sample_frac) = subsample_limit(&falses, self.max_split_samples, rng);
        let features = self.sort_features(data, &split_samples, &trues, sample_frac, rng);

        let best = if split_samples.len() == falses.len() {
            // The ranking already scored every sample exactly.
            features.into_iter().next()
        } else {
            self.optimal_feature(data, &falses, &trues, &features, rng)
        };

        let Some(best) = best else {
            return self.build_subtree(data, union, falses, trues, depth, next_feature, rng);
        };

        let mut new_falses = Vec::with_capacity(falses.len());
        for &i in &falses {
            if data[i as usize].sample.branch_feature(&best) {
                trues.push(i);
            } else {
                new_falses.push(i);
            }
        }

        union.push(best);
        self.build_union(data, union, new_falses, trues, depth, next_feature, rng)
    }

    /// Emit the branch (or leaf) for a finished union.
    #[allow(clippy::too_many_arguments)]
    fn build_subtree(
        &self,
        data: &[VecSample<'_>],
        union: BranchFeatureUnion,
        falses: Vec<u32>,
        trues: Vec<u32>,
        depth: usize,
        next_feature: usize,
        rng: &mut Xoshiro256PlusPlus,
    ) -> Tree {
        if union.is_empty() {
            return self.build_node(data, falses, 0, next_feature, rng);
        }
        let false_branch = self.build_node(data, falses, depth - 1, next_feature, rng);
        let true_branch = self.build_node(
            data,
            trues,
            depth - 1,
            next_feature + false_branch.num_features(),
            rng,
        );
        Tree::branch(union, false_branch, true_branch)
    }

    fn make_leaf(&self, data: &[VecSample<'_>], indices: &[u32], next_feature: usize) -> Tree {
        assert!(!indices.is_empty(), "no samples");
        let dim = data[indices[0] as usize].vector.len();
        let mut sum = KahanSum::new(dim);
        for &i in indices {
            sum.add(&data[i as usize].vector);
        }
        Tree::leaf(self.heuristic.leaf_output(sum.sum()), next_feature)
    }

    /// Rank candidate features by split quality, best first.
    ///
    /// `falses` may be a subsample of the node's uncaptured samples, in
    /// which case `sample_frac` is the fraction that was kept; `trues` is
    /// never subsampled.
    fn sort_features(
        &self,
        data: &[VecSample<'_>],
        falses: &[u32],
        trues: &[u32],
        sample_frac: f32,
        rng: &mut Xoshiro256PlusPlus,
    ) -> Vec<BranchFeature> {
        assert!(!falses.is_empty(), "no samples");
        let num_features = data[falses[0] as usize].sample.timestep().features.len() as i32;
        let sums = SplitSums::new(data, falses, trues);

        let mut candidates = Vec::new();
        let extra_prob = 1.0 / (self.extra_features as f64).sqrt();
        for &horizon in &self.horizons {
            for feature in -1..num_features {
                if self.extra_features > 0 && feature >= num_features - self.extra_features as i32 {
                    if rng.gen::<f64>() > extra_prob {
                        continue;
                    }
                }
                candidates.push(BranchFeature { feature, steps_in_past: horizon });
            }
        }

        let mut scored: Vec<(BranchFeature, f32)> = candidates
            .par_iter()
            .filter_map(|&f| {
                let quality = self.feature_split_quality(data, falses, trues, &sums, f, sample_frac);
                (quality > 0.0).then_some((f, quality))
            })
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        scored.into_iter().map(|(f, _)| f).collect()
    }

    /// Pick the best feature from a ranked list by re-scoring candidates,
    /// first on a prune subsample and then on the full sample set.
    ///
    /// Workers pull candidate indices from a shared cursor and stop once
    /// enough candidates have scored positive.
    fn optimal_feature(
        &self,
        data: &[VecSample<'_>],
        falses: &[u32],
        trues: &[u32],
        features: &[BranchFeature],
        rng: &mut Xoshiro256PlusPlus,
    ) -> Option<BranchFeature> {
        let sums = SplitSums::new(data, falses, trues);
        let (prune_falses, prune_frac) =
            subsample_limit(falses, self.candidate_prune_samples, rng);
        let prune_sums = SplitSums::new(data, &prune_falses, trues);

        struct Search {
            next: usize,
            successes: usize,
            best: Option<(BranchFeature, f32)>,
        }
        let max_successes = self.candidate_splits.max(1);
        let search = Mutex::new(Search { next: 0, successes: 0, best: None });

        (0..rayon::current_num_threads()).into_par_iter().for_each(|_| loop {
            let feature = {
                let mut s = search.lock().unwrap();
                if s.successes >= max_successes || s.next == features.len() {
                    break;
                }
                let f = features[s.next];
                s.next += 1;
                f
            };

            let mut quality = self.feature_split_quality(
                data,
                &prune_falses,
                trues,
                &prune_sums,
                feature,
                prune_frac,
            );
            if quality > 0.0 && prune_falses.len() != falses.len() {
                quality = self.feature_split_quality(data, falses, trues, &sums, feature, 1.0);
            }

            if quality > 0.0 {
                let mut s = search.lock().unwrap();
                if s.best.map_or(true, |(_, best)| quality > best) {
                    s.best = Some((feature, quality));
                }
                s.successes += 1;
            }
        });

        let search = search.into_inner().unwrap();
        search.best.map(|(f, _)| f)
    }

    /// Quality gained by adding `feature` to the current union.
    ///
    /// The candidate's captured samples are extrapolated through
    /// `sample_frac` so that subsampled evaluations remain comparable to
    /// the pre-split baseline.
    fn feature_split_quality(
        &self,
        data: &[VecSample<'_>],
        falses: &[u32],
        trues: &[u32],
        sums: &SplitSums,
        feature: BranchFeature,
        sample_frac: f32,
    ) -> f32 {
        let (byte_idx, bit_mask) = raw_feature(feature.feature);
        let mut values = vec![false; falses.len()];
        let mut split_false_count = 0usize;
        let mut split_true_count = 0usize;
        for (&i, value) in falses.iter().zip(&mut values) {
            let v = data[i as usize].branch_feature_fast(feature.steps_in_past, byte_idx, bit_mask);
            *value = v;
            if v {
                split_true_count += 1;
            } else {
                split_false_count += 1;
            }
        }

        let approx_trues = trues.len() as f32 + split_true_count as f32 / sample_frac;
        let approx_falses = (falses.len() - split_true_count) as f32 / sample_frac;
        if split_false_count == 0
            || split_true_count == 0
            || (approx_trues as usize) < self.min_split_samples
            || (approx_falses as usize) < self.min_split_samples
        {
            // The split is unlikely to be allowed.
            return 0.0;
        }

        let true_is_minority = split_true_count < split_false_count;
        let dim = sums.false_sum.len();
        let mut minority = KahanSum::new(dim);
        for (&i, &value) in falses.iter().zip(&values) {
            if value == true_is_minority {
                minority.add(&data[i as usize].vector);
            }
        }
        let minority_sum = minority.into_sum();
        let majority_sum: Vec<f32> = sums
            .false_sum
            .iter()
            .zip(&minority_sum)
            .map(|(a, b)| a - b)
            .collect();

        let (mut new_true_sum, new_false_sum) = if true_is_minority {
            (minority_sum, majority_sum)
        } else {
            (majority_sum, minority_sum)
        };

        let mut old_true_sum = vec![0.0f32; dim];
        for i in 0..dim {
            let captured = sums.true_sum[i] * sample_frac;
            new_true_sum[i] += captured;
            old_true_sum[i] = captured;
        }

        let new_quality =
            self.heuristic.quality(&new_false_sum) + self.heuristic.quality(&new_true_sum);
        let old_quality =
            self.heuristic.quality(&sums.false_sum) + self.heuristic.quality(&old_true_sum);

        // Discard numerically insignificant deltas.
        let min_delta = new_quality.min(old_quality).abs() * QUALITY_EPSILON;
        if (new_quality - old_quality).abs() < min_delta {
            return 0.0;
        }

        new_quality - old_quality
    }
}

/// A training sample paired with its heuristic vector.
struct VecSample<'a> {
    sample: TimestepSample<'a>,
    vector: Vec<f32>,
}

impl VecSample<'_> {
    /// Branch-feature test through a precomputed `(byte, mask)` pair; a
    /// negative byte index stands for the `-1` sentinel feature.
    #[inline]
    fn branch_feature_fast(&self, steps_in_past: usize, byte_idx: isize, bit_mask: u8) -> bool {
        if steps_in_past > self.sample.index {
            return byte_idx < 0;
        }
        if byte_idx < 0 {
            return false;
        }
        let ts = &self.sample.sequence.timesteps[self.sample.index - steps_in_past];
        ts.features.test_raw(byte_idx as usize, bit_mask)
    }
}

/// Precompute the packed-bitmap location of a feature index.
#[inline]
fn raw_feature(feature: i32) -> (isize, u8) {
    if feature == -1 {
        (-1, 0)
    } else {
        ((feature >> 3) as isize, 1u8 << (feature & 7))
    }
}

/// Kahan sums of the vectors on each side of the current union.
struct SplitSums {
    false_sum: Vec<f32>,
    true_sum: Vec<f32>,
}

impl SplitSums {
    fn new(data: &[VecSample<'_>], falses: &[u32], trues: &[u32]) -> Self {
        let dim = data[falses[0] as usize].vector.len();
        let mut false_sum = KahanSum::new(dim);
        for &i in falses {
            false_sum.add(&data[i as usize].vector);
        }
        let mut true_sum = KahanSum::new(dim);
        for &i in trues {
            true_sum.add(&data[i as usize].vector);
        }
        Self {
            false_sum: false_sum.into_sum(),
            true_sum: true_sum.into_sum(),
        }
    }
}

/// Uniformly subsample `indices` down to at most `max` entries (zero means
/// no limit), returning the subsample and the kept fraction.
fn subsample_limit(
    indices: &[u32],
    max: usize,
    rng: &mut Xoshiro256PlusPlus,
) -> (Vec<u32>, f32) {
    if max == 0 || indices.len() <= max {
        return (indices.to_vec(), 1.0);
    }
    let chosen: Vec<u32> = rand::seq::index::sample(rng, indices.len(), max)
        .into_iter()
        .map(|i| indices[i])
        .collect();
    let frac = (chosen.len() as f64 / indices.len() as f64) as f32;
    (chosen, frac)
}

//! Post-hoc tree pruning.
//!
//! Pruning reduces a fitted tree to at most `max_leaves` leaves by
//! repeatedly collapsing the leaf whose removal costs the least heuristic
//! quality, then refits the surviving leaves' output deltas from the
//! samples routed to them. Leaves are addressed by their depth-first index
//! (false subtree before true subtree) throughout.

use rayon::prelude::*;

use crate::data::TimestepSample;
use crate::numeric::KahanSum;
use crate::repr::tree::Tree;
use crate::training::heuristic::Heuristic;

/// Parameters for pruning trees to prevent overfitting.
#[derive(Debug, Clone)]
pub struct Pruner {
    /// Used to score leaves and refit their outputs.
    pub heuristic: Heuristic,

    /// Maximum number of leaves for pruned trees to have; must be at
    /// least 1.
    pub max_leaves: usize,
}

impl Pruner {
    /// Prune `tree` down to at most `max_leaves` leaves.
    ///
    /// Each round scores, for every leaf, the candidate tree in which the
    /// branch directly above that leaf is collapsed onto the leaf's
    /// sibling; the highest-scoring candidate replaces the tree. After the
    /// final round, if any pruning happened, every leaf's output delta is
    /// recomputed from the samples that route to it and surviving minted
    /// feature ids are renumbered contiguously from the builder's starting
    /// id.
    ///
    /// # Panics
    ///
    /// Panics if `max_leaves < 1` or `samples` is empty.
    pub fn prune(&self, samples: &[TimestepSample<'_>], tree: &Tree) -> Tree {
        assert!(self.max_leaves >= 1, "cannot prune to fewer than one leaf");
        assert!(!samples.is_empty(), "no samples");

        let vectors: Vec<Vec<f32>> = samples
            .par_iter()
            .map(|s| self.heuristic.sample_vector(s))
            .collect();

        let first_feature_id = tree
            .leaves()
            .iter()
            .filter(|l| l.feature != 0)
            .map(|l| l.feature)
            .min();

        let mut current = tree.clone();
        let mut pruned = false;

        while current.num_leaves() > self.max_leaves {
            let num_leaves = current.num_leaves();
            let best = (0..num_leaves)
                .into_par_iter()
                .map(|leaf| {
                    let candidate = prune_leaf(&current, leaf);
                    let score = self.tree_score(samples, &vectors, &candidate);
                    (score, candidate)
                })
                .reduce_with(|a, b| if a.0 >= b.0 { a } else { b })
                .expect("tree with more than max_leaves leaves");
            current = best.1;
            pruned = true;
        }

        if pruned {
            self.refit_leaves(samples, &vectors, &mut current);
            // Minted feature ids must stay contiguous from the id block the
            // builder started at, or the model's feature accounting would
            // undercount the bits surviving leaves set.
            if let Some(start) = first_feature_id {
                let mut next = start;
                for leaf in current.leaves_mut() {
                    if leaf.feature != 0 {
                        leaf.feature = next;
                        next += 1;
                    }
                }
            }
        }
        current
    }

    /// Total heuristic quality over the leaves of a candidate tree.
    fn tree_score(
        &self,
        samples: &[TimestepSample<'_>],
        vectors: &[Vec<f32>],
        tree: &Tree,
    ) -> f32 {
        let sums = leaf_sums(samples, vectors, tree);
        sums.iter().map(|sum| self.heuristic.quality(sum)).sum()
    }

    /// Recompute every leaf's output delta from its routed samples.
    fn refit_leaves(&self, samples: &[TimestepSample<'_>], vectors: &[Vec<f32>], tree: &mut Tree) {
        let sums = leaf_sums(samples, vectors, tree);
        for (leaf, sum) in tree.leaves_mut().into_iter().zip(&sums) {
            leaf.output_delta = self.heuristic.leaf_output(sum);
        }
    }
}

/// Kahan-summed sample vectors per depth-first leaf index.
fn leaf_sums(samples: &[TimestepSample<'_>], vectors: &[Vec<f32>], tree: &Tree) -> Vec<Vec<f32>> {
    let dim = vectors[0].len();
    let mut sums: Vec<KahanSum> = (0..tree.num_leaves()).map(|_| KahanSum::new(dim)).collect();
    for (sample, vector) in samples.iter().zip(vectors) {
        sums[tree.leaf_index(sample)].add(vector);
    }
    sums.into_iter().map(KahanSum::into_sum).collect()
}

/// The tree with the `target`-th depth-first leaf removed: the branch
/// directly above that leaf collapses onto the leaf's sibling.
///
/// Pruning the root leaf of a single-leaf tree is not meaningful and
/// returns the tree unchanged.
fn prune_leaf(tree: &Tree, target: usize) -> Tree {
    let mut counter = 0;
    prune_leaf_rec(tree, target, &mut counter)
}

fn prune_leaf_rec(tree: &Tree, target: usize, counter: &mut usize) -> Tree {
    match tree {
        Tree::Leaf(leaf) => {
            *counter += 1;
            Tree::Leaf(leaf.clone())
        }
        Tree::Branch(branch) => {
            if matches!(&*branch.false_branch, Tree::Leaf(_)) && *counter == target {
                *counter += 1;
                return prune_leaf_rec(&branch.true_branch, target, counter);
            }
            let false_branch = prune_leaf_rec(&branch.false_branch, target, counter);
            if matches!(&*branch.true_branch, Tree::Leaf(_)) && *counter == target {
                *counter += 1;
                return false_branch;
            }
            let true_branch = prune_leaf_rec(&branch.true_branch, target, counter);
            Tree::branch(branch.feature.clone(), false_branch, true_branch)
        }
    }
}

//! Decision-tree structure: branches over feature unions, leaves carrying
//! output deltas.
//!
//! A tree is a tagged variant: either a branch holding a union of branch
//! features and two children, or a leaf holding an output delta and an
//! optional feature id to set during evaluation. Leaves are enumerated
//! depth-first, false subtree before true subtree, everywhere an ordering
//! matters (feature numbering, pruning candidates, per-leaf grouping).
//!
//! The serde derives produce the persisted JSON shape directly: a tree is
//! either `{"leaf": {...}}` or `{"branch": {...}}`.

use serde::{Deserialize, Serialize};

use crate::data::TimestepSample;

/// A single boolean feature test against the current or a prior timestep.
///
/// `feature == -1` is the sentinel meaning "the position `steps_in_past`
/// ago is before the start of the sequence"; the sentinel test is true
/// exactly when that is the case. For real feature indices, a position
/// before the start reads as false.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchFeature {
    /// Feature index, or `-1` for the before-start sentinel.
    pub feature: i32,
    /// How many timesteps in the past to look; 0 is the current position.
    pub steps_in_past: usize,
}

/// An ordered list of branch features combined by logical OR.
///
/// An empty union matches nothing.
pub type BranchFeatureUnion = Vec<BranchFeature>;

/// Terminal node: an output delta, plus an optional feature to set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leaf {
    /// Vector added to the timestep's output logits during evaluation.
    pub output_delta: Vec<f32>,
    /// Feature id set in the timestep's bitmap when this leaf is reached;
    /// 0 means "set nothing".
    pub feature: usize,
}

/// Interior node: a feature union and the two subtrees it routes to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    /// Union of feature tests; a sample goes to `true_branch` iff any
    /// member test is true.
    pub feature: BranchFeatureUnion,
    pub false_branch: Box<Tree>,
    pub true_branch: Box<Tree>,
}

/// A decision tree node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tree {
    Leaf(Leaf),
    Branch(Branch),
}

impl Tree {
    /// Create a leaf node.
    pub fn leaf(output_delta: Vec<f32>, feature: usize) -> Self {
        Tree::Leaf(Leaf { output_delta, feature })
    }

    /// Create a branch node.
    pub fn branch(feature: BranchFeatureUnion, false_branch: Tree, true_branch: Tree) -> Self {
        Tree::Branch(Branch {
            feature,
            false_branch: Box::new(false_branch),
            true_branch: Box::new(true_branch),
        })
    }

    /// Route a sample to its leaf.
    pub fn evaluate<'t>(&'t self, sample: &TimestepSample<'_>) -> &'t Leaf {
        match self {
            Tree::Leaf(leaf) => leaf,
            Tree::Branch(b) => {
                if b.feature.iter().any(|f| sample.branch_feature(f)) {
                    b.true_branch.evaluate(sample)
                } else {
                    b.false_branch.evaluate(sample)
                }
            }
        }
    }

    /// Route a sample and return the depth-first index of its leaf.
    pub fn leaf_index(&self, sample: &TimestepSample<'_>) -> usize {
        let mut node = self;
        let mut index = 0;
        loop {
            match node {
                Tree::Leaf(_) => return index,
                Tree::Branch(b) => {
                    if b.feature.iter().any(|f| sample.branch_feature(f)) {
                        index += b.false_branch.num_leaves();
                        node = &b.true_branch;
                    } else {
                        node = &b.false_branch;
                    }
                }
            }
        }
    }

    /// Number of leaves.
    pub fn num_leaves(&self) -> usize {
        match self {
            Tree::Leaf(_) => 1,
            Tree::Branch(b) => b.false_branch.num_leaves() + b.true_branch.num_leaves(),
        }
    }

    /// Leaves in depth-first order, false subtree first.
    pub fn leaves(&self) -> Vec<&Leaf> {
        let mut res = Vec::new();
        self.collect_leaves(&mut res);
        res
    }

    fn collect_leaves<'t>(&'t self, out: &mut Vec<&'t Leaf>) {
        match self {
            Tree::Leaf(leaf) => out.push(leaf),
            Tree::Branch(b) => {
                b.false_branch.collect_leaves(out);
                b.true_branch.collect_leaves(out);
            }
        }
    }

    /// Mutable leaves in depth-first order, false subtree first.
    pub fn leaves_mut(&mut self) -> Vec<&mut Leaf> {
        let mut res = Vec::new();
        self.collect_leaves_mut(&mut res);
        res
    }

    fn collect_leaves_mut<'t>(&'t mut self, out: &mut Vec<&'t mut Leaf>) {
        match self {
            Tree::Leaf(leaf) => out.push(leaf),
            Tree::Branch(b) => {
                b.false_branch.collect_leaves_mut(out);
                b.true_branch.collect_leaves_mut(out);
            }
        }
    }

    /// Number of new features this tree introduces through its leaves.
    pub fn num_features(&self) -> usize {
        self.leaves().iter().filter(|l| l.feature != 0).count()
    }

    /// Scale every leaf's output delta by `s`.
    pub fn scale(&mut self, s: f32) {
        for leaf in self.leaves_mut() {
            for x in &mut leaf.output_delta {
                *x *= s;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{make_one_hot_sequence, TimestepSample};

    fn sample_tree() -> Tree {
        // Root splits on feature 0 at the current step; the true side
        // splits again on feature 1.
        Tree::branch(
            vec![BranchFeature { feature: 0, steps_in_past: 0 }],
            Tree::leaf(vec![1.0, -1.0], 2),
            Tree::branch(
                vec![BranchFeature { feature: 1, steps_in_past: 0 }],
                Tree::leaf(vec![2.0, -2.0], 3),
                Tree::leaf(vec![3.0, -3.0], 4),
            ),
        )
    }

    #[test]
    fn routing_follows_union_or() {
        let tree = Tree::branch(
            vec![
                BranchFeature { feature: 0, steps_in_past: 0 },
                BranchFeature { feature: 1, steps_in_past: 0 },
            ],
            Tree::leaf(vec![0.0], 0),
            Tree::leaf(vec![1.0], 0),
        );
        // Value 1 sets feature 1 on the following timestep.
        let seq = make_one_hot_sequence(&[1], 2, 2);
        let first = TimestepSample { sequence: &seq, index: 0 };
        let second = TimestepSample { sequence: &seq, index: 1 };
        assert_eq!(tree.evaluate(&first).output_delta, vec![0.0]);
        assert_eq!(tree.evaluate(&second).output_delta, vec![1.0]);
    }

    #[test]
    fn empty_union_matches_nothing() {
        let tree = Tree::branch(vec![], Tree::leaf(vec![0.0], 0), Tree::leaf(vec![1.0], 0));
        let seq = make_one_hot_sequence(&[1], 2, 2);
        let sample = TimestepSample { sequence: &seq, index: 1 };
        assert_eq!(tree.evaluate(&sample).output_delta, vec![0.0]);
    }

    #[test]
    fn leaf_enumeration_is_depth_first() {
        let tree = sample_tree();
        let features: Vec<usize> = tree.leaves().iter().map(|l| l.feature).collect();
        assert_eq!(features, vec![2, 3, 4]);
        assert_eq!(tree.num_leaves(), 3);
        assert_eq!(tree.num_features(), 3);
    }

    #[test]
    fn leaf_index_matches_enumeration() {
        let tree = sample_tree();
        let seq = make_one_hot_sequence(&[0, 1], 2, 2);
        for i in 0..seq.len() {
            let sample = TimestepSample { sequence: &seq, index: i };
            let leaf = tree.evaluate(&sample);
            let idx = tree.leaf_index(&sample);
            assert_eq!(tree.leaves()[idx].feature, leaf.feature);
        }
    }

    #[test]
    fn scale_multiplies_all_leaves() {
        let mut tree = sample_tree();
        tree.scale(-0.5);
        let leaves = tree.leaves();
        assert_eq!(leaves[0].output_delta, vec![-0.5, 0.5]);
        assert_eq!(leaves[2].output_delta, vec![-1.5, 1.5]);
    }

    #[test]
    fn serde_shape_is_externally_tagged() {
        let tree = Tree::branch(
            vec![BranchFeature { feature: -1, steps_in_past: 2 }],
            Tree::leaf(vec![0.5], 0),
            Tree::leaf(vec![-0.5], 7),
        );
        let json: serde_json::Value = serde_json::to_value(&tree).unwrap();
        assert!(json.get("branch").is_some());
        let branch = &json["branch"];
        assert_eq!(branch["feature"][0]["feature"], -1);
        assert_eq!(branch["feature"][0]["steps_in_past"], 2);
        assert!(branch["false_branch"].get("leaf").is_some());
        assert_eq!(branch["true_branch"]["leaf"]["feature"], 7);

        let back: Tree = serde_json::from_value(json).unwrap();
        assert_eq!(back, tree);
    }
}

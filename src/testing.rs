//! Deterministic data and model generators shared by the test suites.

use rand::Rng;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::data::{make_one_hot_sequence, timestep_samples, Sequence};
use crate::repr::model::Model;
use crate::training::builder::Builder;
use crate::training::heuristic::Heuristic;
use crate::training::loss::Loss;

/// Generate `count` random one-hot sequences of `length` values drawn from
/// `[0, model.base_features)`, already evaluated through the model.
pub fn random_sequences(
    model: &Model,
    count: usize,
    length: usize,
    rng: &mut Xoshiro256PlusPlus,
) -> Vec<Sequence> {
    let mut seqs: Vec<Sequence> = (0..count)
        .map(|_| {
            let values: Vec<usize> =
                (0..length).map(|_| rng.gen_range(0..model.base_features)).collect();
            make_one_hot_sequence(&values, model.base_features, model.num_features())
        })
        .collect();
    model.evaluate_all(&mut seqs);
    seqs
}

/// A default gradient-heuristic builder for test models.
pub fn test_builder(seed: u64) -> Builder {
    Builder {
        heuristic: Heuristic::gradient(Loss::Softmax),
        depth: 3,
        min_split_samples: 10,
        max_split_samples: 0,
        candidate_splits: 0,
        candidate_prune_samples: 0,
        max_union: 1,
        horizons: vec![0, 1, 2],
        extra_features: 0,
        seed,
    }
}

/// Train a small model: a few boosting rounds over random one-hot data.
pub fn trained_test_model(base_features: usize, rounds: usize, seed: u64) -> Model {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let mut model = Model::new(base_features);
    for round in 0..rounds {
        let seqs = random_sequences(&model, 15, 20, &mut rng);
        let samples = timestep_samples(&seqs);
        let tree = test_builder(seed.wrapping_add(round as u64)).build(&samples);
        model.add(tree, 0.1);
    }
    model
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::loss::Loss;

    #[test]
    fn generated_sequences_match_model_feature_count() {
        let model = trained_test_model(2, 2, 5);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        let seqs = random_sequences(&model, 3, 8, &mut rng);
        for seq in &seqs {
            assert_eq!(seq.len(), 9);
            for ts in &seq.timesteps {
                assert_eq!(ts.features.len(), model.num_features());
            }
        }
    }

    #[test]
    fn training_rounds_reduce_loss_on_the_batch() {
        // Fixed batch of values; sequences are regenerated each round with
        // the model's grown feature count and re-evaluated from scratch.
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(3);
        let values: Vec<Vec<usize>> = (0..10)
            .map(|_| (0..16).map(|_| rng.gen_range(0..2)).collect())
            .collect();

        let batch = |model: &Model| {
            let mut seqs: Vec<Sequence> = values
                .iter()
                .map(|v| make_one_hot_sequence(v, 2, model.num_features()))
                .collect();
            model.evaluate_all(&mut seqs);
            seqs
        };
        let mean_loss = |seqs: &[Sequence]| {
            seqs.iter().map(|s| s.mean_loss(&Loss::Softmax)).sum::<f32>() / seqs.len() as f32
        };

        let mut model = Model::new(2);
        let baseline = mean_loss(&batch(&model));

        for round in 0..4 {
            let seqs = batch(&model);
            let samples = timestep_samples(&seqs);
            let tree = test_builder(round).build(&samples);
            model.add(tree, 0.5);
        }

        let trained = mean_loss(&batch(&model));
        assert!(
            trained < baseline,
            "boosting should reduce training loss: {trained} vs {baseline}"
        );
    }
}

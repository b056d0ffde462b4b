//! End-to-end training scenarios: boosting rounds, union recovery,
//! line-search optimality, and thread-count reproducibility.

use rand::Rng;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

use seqboost::testing::{random_sequences, test_builder, trained_test_model};
use seqboost::{
    avg_loss_delta, make_one_hot_sequence, optimal_step, scale_optimal_step, timestep_samples,
    run_with_threads, Bitmap, Builder, Heuristic, Loss, Model, Sequence, Timestep, Tree,
};

/// One tree at depth 1 on a single one-hot sequence drives the mean
/// softmax loss strictly below log 2.
#[test]
fn one_hot_sequence_trivial_fit() {
    let mut model = Model::new(2);

    let mut seq = make_one_hot_sequence(&[0, 1, 0], 2, 2);
    assert_eq!(seq.len(), 4);
    model.evaluate(&mut seq);
    let baseline = seq.mean_loss(&Loss::Softmax);
    assert!((baseline - 2.0f32.ln()).abs() < 1e-5);

    let seqs = [seq];
    let samples = timestep_samples(&seqs);
    let builder = Builder {
        heuristic: Heuristic::gradient(Loss::Softmax),
        depth: 1,
        min_split_samples: 1,
        max_split_samples: 0,
        candidate_splits: 0,
        candidate_prune_samples: 0,
        max_union: 1,
        horizons: vec![0],
        extra_features: 0,
        seed: 1,
    };
    let tree = builder.build(&samples);
    let step = optimal_step(&samples, &tree, &Loss::Softmax, 40.0, 100);
    model.add(tree, step);

    // Fresh sequence sized for the grown feature space.
    let mut seq = make_one_hot_sequence(&[0, 1, 0], 2, model.num_features());
    model.evaluate(&mut seq);
    assert!(
        seq.mean_loss(&Loss::Softmax) < 2.0f32.ln(),
        "loss {} should drop below log 2",
        seq.mean_loss(&Loss::Softmax)
    );
}

/// Single-timestep sequence with a hand-built feature bitmap.
fn labeled_sample(bits: &[bool], positive: bool) -> Sequence {
    let mut ts = Timestep {
        features: Bitmap::new(bits.len()),
        output: vec![0.0, 0.0],
        target: if positive { vec![1.0, 0.0] } else { vec![0.0, 1.0] },
    };
    for (i, &b) in bits.iter().enumerate() {
        ts.features.set(i, b);
    }
    Sequence { timesteps: vec![ts] }
}

/// With `max_union = 3` on a dataset whose label is `f0 OR f1 OR f2`, the
/// root grows exactly that union and the leaves separate the classes.
#[test]
fn union_growth_recovers_three_term_or() {
    // Every combination of 5 bits: 3 label bits, 2 perfectly balanced
    // noise bits that offer zero quality gain.
    let mut seqs = Vec::new();
    for combo in 0u32..32 {
        let bits: Vec<bool> = (0..5).map(|b| combo & (1 << b) != 0).collect();
        let positive = bits[0] || bits[1] || bits[2];
        seqs.push(labeled_sample(&bits, positive));
    }
    let samples = timestep_samples(&seqs);

    let builder = Builder {
        heuristic: Heuristic::gradient(Loss::Softmax),
        depth: 1,
        min_split_samples: 1,
        max_split_samples: 0,
        candidate_splits: 0,
        candidate_prune_samples: 0,
        max_union: 3,
        horizons: vec![0],
        extra_features: 0,
        seed: 9,
    };
    let tree = builder.build(&samples);

    let Tree::Branch(branch) = &tree else {
        panic!("expected a union split at the root");
    };
    let mut union: Vec<i32> = branch.feature.iter().map(|f| f.feature).collect();
    union.sort();
    assert_eq!(union, vec![0, 1, 2]);
    assert!(branch.feature.iter().all(|f| f.steps_in_past == 0));

    // The split must partition the classes exactly.
    for (seq, combo) in seqs.iter().zip(0u32..) {
        let sample = seqboost::TimestepSample { sequence: seq, index: 0 };
        let routed_true = tree.leaf_index(&sample) == 1;
        assert_eq!(routed_true, combo & 0b111 != 0, "combo {combo:#07b}");
    }

    // A strong step on the pure partition drives the loss near zero.
    let step = optimal_step(&samples, &tree, &Loss::Softmax, 40.0, 100);
    let delta = avg_loss_delta(&samples, &tree, &Loss::Softmax, step);
    let final_loss = 2.0f32.ln() + delta;
    assert!(final_loss < 0.05, "final loss {final_loss} should be near zero");
}

/// Brute-force line search: a 1000-point sweep plus nested refinements.
fn brute_force_step(
    samples: &[seqboost::TimestepSample<'_>],
    tree: &Tree,
    refinements: usize,
    min: f32,
    max: f32,
) -> f32 {
    let mut minimum = 0.0f32;
    let mut min_step = 0.0f32;
    for i in 0..=1000 {
        let s = (max - min) * i as f32 / 1000.0 + min;
        let delta = avg_loss_delta(samples, tree, &Loss::Softmax, s);
        if delta < minimum {
            minimum = delta;
            min_step = s;
        }
    }
    if refinements > 0 {
        return brute_force_step(
            samples,
            tree,
            refinements - 1,
            min_step - (max - min) / 100.0,
            min_step + (max - min) / 100.0,
        );
    }
    min_step
}

/// Golden-section `optimal_step` agrees with the brute-force sweep.
#[test]
fn optimal_step_matches_brute_force() {
    for base_features in [2usize, 10] {
        let model = trained_test_model(base_features, 4, 20);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(base_features as u64);
        let seqs = random_sequences(&model, 15, 20, &mut rng);
        let samples = timestep_samples(&seqs);
        let tree = test_builder(33).build(&samples);

        let actual = optimal_step(&samples, &tree, &Loss::Softmax, 40.0, 100);
        let actual_delta = avg_loss_delta(&samples, &tree, &Loss::Softmax, actual);
        let expected = brute_force_step(&samples, &tree, 2, 0.0, 40.0);
        let expected_delta = avg_loss_delta(&samples, &tree, &Loss::Softmax, expected);

        assert!(
            (actual_delta - expected_delta).abs() < 1e-4,
            "features={base_features}: step {actual} (delta {actual_delta}) vs \
             brute force {expected} (delta {expected_delta})"
        );
    }
}

/// The polynomial heuristic's leaf output matches an exact per-coordinate
/// line search of the true sigmoid loss, and a per-leaf rescale capped at
/// 1 leaves it essentially unchanged.
#[test]
fn polynomial_heuristic_matches_exact_line_search() {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(77);
    let mut seq = Sequence::new();
    for _ in 0..64 {
        let mut ts = Timestep::new(2, 2);
        ts.output = vec![rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)];
        let t0 = if rng.gen_bool(0.5) { 1.0 } else { 0.0 };
        let t1 = if rng.gen_bool(0.5) { 1.0 } else { 0.0 };
        ts.target = vec![t0, t1];
        seq.timesteps.push(ts);
    }
    let seqs = [seq];
    let samples = timestep_samples(&seqs);

    let heuristic = Heuristic::polynomial(Loss::Sigmoid);
    let dim = 2 * Loss::Sigmoid.polynomial_terms();
    let mut sum = vec![0.0f32; dim];
    for s in &samples {
        for (acc, x) in sum.iter_mut().zip(heuristic.sample_vector(s)) {
            *acc += x;
        }
    }
    let output = heuristic.leaf_output(&sum);

    // Reference: minimise the exact summed loss per coordinate on [-1, 1].
    for coord in 0..2 {
        let exact = seqboost::numeric::minimize_unary(-1.0, 1.0, 200, |a| {
            samples
                .iter()
                .map(|s| {
                    let ts = s.timestep();
                    let mut shifted = ts.output.clone();
                    shifted[coord] += a;
                    Loss::Sigmoid.loss(&shifted, &ts.target)
                })
                .sum()
        });
        assert!(
            (output[coord] - exact).abs() < 1e-3,
            "coordinate {coord}: heuristic {} vs exact {exact}",
            output[coord]
        );
    }

    // Rescaling the already-optimal leaf with max scale 1 keeps it put.
    let mut tree = Tree::leaf(output.clone(), 0);
    scale_optimal_step(&samples, &mut tree, &Loss::Sigmoid, 1.0, 1, 64);
    for (a, b) in tree.leaves()[0].output_delta.iter().zip(&output) {
        assert!((a - b).abs() < 1e-2 * (1.0 + b.abs()), "{a} vs {b}");
    }
}

/// Train a few rounds with a fixed seed under a given pool width and
/// report the final training loss.
fn train_loss_with_threads(threads: usize) -> f32 {
    run_with_threads(threads, || {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(4242);
        let mut model = Model::new(2);
        for round in 0..3 {
            let seqs = random_sequences(&model, 12, 16, &mut rng);
            let samples = timestep_samples(&seqs);
            let mut builder = test_builder(round);
            builder.max_split_samples = 64;
            builder.candidate_splits = 100;
            builder.candidate_prune_samples = 64;
            let tree = builder.build(&samples);
            model.add(tree, 0.5);
        }

        // Fresh evaluation batch drawn from the same generator state.
        let mut eval = Vec::new();
        for _ in 0..12 {
            let values: Vec<usize> = (0..16).map(|_| rng.gen_range(0..2)).collect();
            eval.push(make_one_hot_sequence(&values, 2, model.num_features()));
        }
        model.evaluate_all(&mut eval);
        eval.iter().map(|s| s.mean_loss(&Loss::Softmax)).sum::<f32>() / eval.len() as f32
    })
}

/// Builds with one thread and with the full pool agree on the final loss
/// to well within Kahan drift; tree structure may differ only near ties.
#[test]
fn parallel_build_is_deterministic_up_to_kahan() {
    let sequential = train_loss_with_threads(1);
    let parallel = train_loss_with_threads(0);
    assert!(
        (sequential - parallel).abs() < 1e-3,
        "sequential loss {sequential} vs parallel loss {parallel}"
    );
}

/// Boosting with pruning and per-leaf rescaling descends on its batch.
#[test]
fn boosting_loop_with_pruning_descends() {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(11);
    let values: Vec<Vec<usize>> = (0..20)
        .map(|_| (0..12).map(|_| rng.gen_range(0..4)).collect())
        .collect();

    let batch = |model: &Model| {
        let mut seqs: Vec<Sequence> = values
            .iter()
            .map(|v| make_one_hot_sequence(v, 4, model.num_features()))
            .collect();
        model.evaluate_all(&mut seqs);
        seqs
    };
    let mean_loss = |seqs: &[Sequence]| {
        seqs.iter().map(|s| s.mean_loss(&Loss::Softmax)).sum::<f32>() / seqs.len() as f32
    };

    let mut model = Model::new(4);
    let baseline = mean_loss(&batch(&model));

    for round in 0..4 {
        let seqs = batch(&model);
        let samples = timestep_samples(&seqs);

        let mut builder = test_builder(round);
        builder.heuristic = Heuristic::hessian(Loss::Softmax, 0.5);
        builder.extra_features = model.extra_features;
        let tree = builder.build(&samples);

        let pruner = seqboost::Pruner {
            heuristic: Heuristic::hessian(Loss::Softmax, 0.5),
            max_leaves: 4,
        };
        let mut tree = pruner.prune(&samples, &tree);

        scale_optimal_step(&samples, &mut tree, &Loss::Softmax, 10.0, 5, 30);
        model.add(tree, 1.0);
    }

    let trained = mean_loss(&batch(&model));
    assert!(
        trained < baseline,
        "pruned boosting should descend: {trained} vs {baseline}"
    );
}

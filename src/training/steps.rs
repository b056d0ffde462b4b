//! Step-size control: line searches over tree output deltas and loss-delta
//! reporting.
//!
//! Every routine here evaluates sums of per-sample losses in parallel;
//! workers keep a local Kahan accumulator over their chunk and the partials
//! are merged through one more Kahan pass, so the result is reproducible
//! across thread counts to below the builder's noise threshold.

use rayon::prelude::*;

use crate::data::TimestepSample;
use crate::numeric::{minimize_unary, KahanSum};
use crate::repr::tree::Tree;
use crate::training::loss::{softmax_loss_delta, softmax_loss_kl, Loss};

/// Sum `f(item, scratch)` over all items, Kahan-compensated at both the
/// worker level and the final merge. `scratch` is a per-worker output
/// buffer so the hot loop does not allocate per sample.
fn parallel_kahan_sum<T, F>(items: &[T], scratch_dim: usize, f: F) -> f32
where
    T: Sync,
    F: Fn(&T, &mut [f32]) -> f32 + Send + Sync,
{
    let chunk = items.len().div_ceil(rayon::current_num_threads()).max(1);
    let partials: Vec<f32> = items
        .par_chunks(chunk)
        .map(|chunk| {
            let mut scratch = vec![0.0f32; scratch_dim];
            let mut total = KahanSum::new(1);
            for item in chunk {
                total.add(&[f(item, &mut scratch)]);
            }
            total.sum()[0]
        })
        .collect();

    let mut total = KahanSum::new(1);
    for p in &partials {
        total.add(&[*p]);
    }
    total.sum()[0]
}

/// Line-search the step size that minimises the loss when every sample's
/// output moves by `step * delta` for its leaf's delta.
///
/// Runs `iters` iterations of golden-section search over `[0, max_step]`.
pub fn optimal_step(
    samples: &[TimestepSample<'_>],
    tree: &Tree,
    loss: &Loss,
    max_step: f32,
    iters: usize,
) -> f32 {
    let pairs: Vec<(TimestepSample<'_>, &[f32])> = samples
        .iter()
        .map(|&s| (s, tree.evaluate(&s).output_delta.as_slice()))
        .collect();
    let dim = samples
        .first()
        .map(|s| s.timestep().output.len())
        .unwrap_or(0);

    minimize_unary(0.0, max_step, iters, |step| {
        parallel_kahan_sum(&pairs, dim, |(sample, delta), scratch| {
            let ts = sample.timestep();
            for ((out, &o), &d) in scratch.iter_mut().zip(&ts.output).zip(*delta) {
                *out = o + step * d;
            }
            loss.loss(scratch, &ts.target)
        })
    })
}

/// Rescale each leaf's output delta by its own line-searched factor.
///
/// Samples are grouped by the leaf they route to; every leaf with at least
/// `min_leaf_samples` routed samples gets an independent golden-section
/// search over `[0, max_step]` and its delta is multiplied in place. Leaves
/// with strong local signal keep large steps while noisy leaves shrink
/// toward zero.
pub fn scale_optimal_step(
    samples: &[TimestepSample<'_>],
    tree: &mut Tree,
    loss: &Loss,
    max_step: f32,
    min_leaf_samples: usize,
    iters: usize,
) {
    let mut groups: Vec<Vec<TimestepSample<'_>>> = (0..tree.num_leaves()).map(|_| Vec::new()).collect();
    for &sample in samples {
        groups[tree.leaf_index(&sample)].push(sample);
    }

    let mut scales = vec![1.0f32; groups.len()];
    for (leaf_idx, group) in groups.iter().enumerate() {
        if group.len() < min_leaf_samples || group.is_empty() {
            continue;
        }
        let delta = tree.leaves()[leaf_idx].output_delta.clone();
        let dim = delta.len();
        scales[leaf_idx] = minimize_unary(0.0, max_step, iters, |step| {
            parallel_kahan_sum(group, dim, |sample, scratch| {
                let ts = sample.timestep();
                for ((out, &o), &d) in scratch.iter_mut().zip(&ts.output).zip(&delta) {
                    *out = o + step * d;
                }
                loss.loss(scratch, &ts.target)
            })
        });
    }

    for (leaf, &scale) in tree.leaves_mut().into_iter().zip(&scales) {
        if scale != 1.0 {
            for x in &mut leaf.output_delta {
                *x *= scale;
            }
        }
    }
}

/// Mean change in loss if a step of size `step` were applied.
pub fn avg_loss_delta(
    samples: &[TimestepSample<'_>],
    tree: &Tree,
    loss: &Loss,
    step: f32,
) -> f32 {
    let dim = samples
        .first()
        .map(|s| s.timestep().output.len())
        .unwrap_or(0);
    let total = parallel_kahan_sum(samples, dim, |sample, scratch| {
        let ts = sample.timestep();
        let leaf = tree.evaluate(sample);
        let old_loss = loss.loss(&ts.output, &ts.target);
        for ((out, &o), &d) in scratch.iter_mut().zip(&ts.output).zip(&leaf.output_delta) {
            *out = o + step * d;
        }
        loss.loss(scratch, &ts.target) - old_loss
    });
    total / samples.len() as f32
}

/// Largest step (starting from `max_step`, shrinking by 0.8 at most 64
/// times) whose mean softmax update KL stays below `max_kl` while the
/// total loss strictly improves. Returns 0 if no such step is found.
pub fn bounded_step(
    samples: &[TimestepSample<'_>],
    tree: &Tree,
    max_kl: f32,
    max_step: f32,
) -> f32 {
    let mut step = max_step;
    for _ in 0..64 {
        let chunk = samples.len().div_ceil(rayon::current_num_threads()).max(1);
        let partials: Vec<(f32, f32)> = samples
            .par_chunks(chunk)
            .map(|chunk| {
                let mut totals = KahanSum::new(2);
                for sample in chunk {
                    let ts = sample.timestep();
                    let leaf = tree.evaluate(sample);
                    let kl = softmax_loss_kl(&ts.output, &leaf.output_delta, step);
                    let delta = softmax_loss_delta(&ts.output, &ts.target, &leaf.output_delta, step);
                    totals.add(&[kl, delta]);
                }
                (totals.sum()[0], totals.sum()[1])
            })
            .collect();

        let mut totals = KahanSum::new(2);
        for (kl, delta) in &partials {
            totals.add(&[*kl, *delta]);
        }
        let mean_kl = totals.sum()[0] / samples.len() as f32;
        let loss_delta = totals.sum()[1];

        if mean_kl <= max_kl && loss_delta < 0.0 {
            return step;
        }
        step *= 0.8;
    }
    0.0
}

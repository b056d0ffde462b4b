//! Loss functions over logit vectors.
//!
//! All losses consume a logit vector and a target vector of equal length
//! and expose whichever derivative forms the splitting heuristics need:
//! scalar loss, gradient, Hessian, or per-coordinate polynomials. There is
//! no open-world extension; the variants are a closed tagged enum.

use rand::Rng;

use crate::numeric::{polynomial_log_sigmoid, HessianMatrix, Polynomial, LOG_SIGMOID_TERMS};

/// A loss function over logit vectors.
#[derive(Debug, Clone, PartialEq)]
pub enum Loss {
    /// Cross-entropy against a target distribution over all coordinates.
    Softmax,
    /// Independent binary cross-entropy per coordinate: coordinate `i` is a
    /// two-way softmax over `(o_i, 0)` with targets `(t_i, 1 - t_i)`.
    Sigmoid,
    /// Independent softmax losses over consecutive blocks of the listed
    /// sizes; the block sizes must sum to the output dimension.
    MultiSoftmax { sizes: Vec<usize> },
}

impl Loss {
    /// Whether an output vector of length `len` is valid for this loss.
    pub fn accepts_len(&self, len: usize) -> bool {
        match self {
            Loss::Softmax | Loss::Sigmoid => len > 0,
            Loss::MultiSoftmax { sizes } => sizes.iter().sum::<usize>() == len,
        }
    }

    fn validate(&self, outputs: &[f32], targets: &[f32]) {
        assert_eq!(outputs.len(), targets.len(), "output/target length mismatch");
        assert!(
            self.accepts_len(outputs.len()),
            "output length {} is incompatible with the loss",
            outputs.len()
        );
    }

    /// Loss value for `outputs` against `targets`.
    pub fn loss(&self, outputs: &[f32], targets: &[f32]) -> f32 {
        self.validate(outputs, targets);
        match self {
            Loss::Softmax => softmax_loss(outputs, targets),
            Loss::Sigmoid => {
                let mut total = 0.0f32;
                for (&o, &t) in outputs.iter().zip(targets) {
                    total += softmax_loss(&[o, 0.0], &[t, 1.0 - t]);
                }
                total
            }
            Loss::MultiSoftmax { sizes } => {
                let mut total = 0.0f32;
                let mut start = 0;
                for &size in sizes {
                    total +=
                        softmax_loss(&outputs[start..start + size], &targets[start..start + size]);
                    start += size;
                }
                total
            }
        }
    }

    /// Gradient of the loss with respect to the logits.
    pub fn gradient(&self, outputs: &[f32], targets: &[f32]) -> Vec<f32> {
        self.validate(outputs, targets);
        match self {
            Loss::Softmax => softmax_loss_grad(outputs, targets),
            Loss::Sigmoid => outputs
                .iter()
                .zip(targets)
                .map(|(&o, &t)| sigmoid(o) - t)
                .collect(),
            Loss::MultiSoftmax { sizes } => {
                let mut grad = Vec::with_capacity(outputs.len());
                let mut start = 0;
                for &size in sizes {
                    grad.extend(softmax_loss_grad(
                        &outputs[start..start + size],
                        &targets[start..start + size],
                    ));
                    start += size;
                }
                grad
            }
        }
    }

    /// Hessian of the loss with respect to the logits.
    ///
    /// Softmax yields the full `(Σt)(diag(p) - p pᵀ)` matrix; Sigmoid is
    /// diagonal; MultiSoftmax is block-diagonal with one softmax block per
    /// partition.
    pub fn hessian(&self, outputs: &[f32], targets: &[f32]) -> HessianMatrix {
        self.validate(outputs, targets);
        let dim = outputs.len();
        match self {
            Loss::Softmax => {
                let mut h = HessianMatrix::zeros(dim);
                write_softmax_hessian(&mut h, 0, outputs, targets);
                h
            }
            Loss::Sigmoid => {
                let mut h = HessianMatrix::zeros(dim);
                for (i, &o) in outputs.iter().enumerate() {
                    let p = sigmoid(o);
                    h.data_mut()[i * dim + i] = p * (1.0 - p);
                }
                h
            }
            Loss::MultiSoftmax { sizes } => {
                let mut h = HessianMatrix::zeros(dim);
                let mut start = 0;
                for &size in sizes {
                    write_softmax_hessian(
                        &mut h,
                        start,
                        &outputs[start..start + size],
                        &targets[start..start + size],
                    );
                    start += size;
                }
                h
            }
        }
    }

    /// Number of coefficients in each per-coordinate loss polynomial.
    pub fn polynomial_terms(&self) -> usize {
        match self {
            Loss::Sigmoid => LOG_SIGMOID_TERMS,
            _ => panic!("loss does not define per-coordinate polynomials"),
        }
    }

    /// Per-coordinate polynomial approximations of the loss.
    ///
    /// For coordinate `i` the returned polynomial in the delta `a`
    /// approximates `-(t_i log σ(o_i + a) + (1 - t_i) log σ(-(o_i + a)))`.
    /// The constant term is cleared; it shifts nothing and dropping it
    /// improves conditioning of the aggregate.
    ///
    /// # Panics
    ///
    /// Panics for losses without a polynomial form (everything but
    /// `Sigmoid`).
    pub fn polynomials(&self, outputs: &[f32], targets: &[f32]) -> Vec<Polynomial> {
        self.validate(outputs, targets);
        match self {
            Loss::Sigmoid => outputs
                .iter()
                .zip(targets)
                .map(|(&o, &t)| {
                    let pos = polynomial_log_sigmoid(o);
                    let neg = polynomial_log_sigmoid(-o).flip_x();
                    let mut poly = pos.scale(-t).add(&neg.scale(-(1.0 - t)));
                    poly.0[0] = 0.0;
                    poly
                })
                .collect(),
            _ => panic!("loss does not define per-coordinate polynomials"),
        }
    }

    /// Draw one coordinate index from the softmax distribution of the
    /// logits, by the cumulative-probability method.
    ///
    /// # Panics
    ///
    /// Panics for losses other than `Softmax`.
    pub fn sample<R: Rng>(&self, outputs: &[f32], rng: &mut R) -> usize {
        match self {
            Loss::Softmax => {
                let max = max_of(outputs);
                let mut denom = 0.0f64;
                for &o in outputs {
                    denom += ((o - max) as f64).exp();
                }
                let mut p = rng.gen::<f32>();
                for (i, &o) in outputs.iter().enumerate() {
                    p -= (((o - max) as f64).exp() / denom) as f32;
                    if p <= 0.0 {
                        return i;
                    }
                }
                outputs.len() - 1
            }
            _ => panic!("sampling is only defined for softmax outputs"),
        }
    }
}

#[inline]
fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x as f64).exp() as f32)
}

#[inline]
fn max_of(v: &[f32]) -> f32 {
    v.iter().copied().fold(f32::NEG_INFINITY, f32::max)
}

/// Softmax cross-entropy, computed inline without an intermediate
/// log-softmax buffer: `Σ_i (c - o_i) t_i` with
/// `c = max(o) + log Σ exp(o_i - max(o))`.
fn softmax_loss(outputs: &[f32], targets: &[f32]) -> f32 {
    let max = max_of(outputs);
    let mut exp_sum = 0.0f64;
    for &o in outputs {
        exp_sum += ((o - max) as f64).exp();
    }
    let c = max + exp_sum.ln() as f32;
    let mut total = 0.0f32;
    for (&o, &t) in outputs.iter().zip(targets) {
        total += (c - o) * t;
    }
    total
}

/// Gradient of [`softmax_loss`]: `(Σ_j t_j) softmax(o) - t`.
fn softmax_loss_grad(outputs: &[f32], targets: &[f32]) -> Vec<f32> {
    let target_sum: f32 = targets.iter().sum();
    let max = max_of(outputs);

    let mut grad: Vec<f32> = outputs
        .iter()
        .map(|&o| ((o - max) as f64).exp() as f32)
        .collect();
    let grad_sum: f32 = grad.iter().sum();
    let div = 1.0 / grad_sum;
    for (g, &t) in grad.iter_mut().zip(targets) {
        *g = target_sum * *g * div - t;
    }
    grad
}

fn write_softmax_hessian(h: &mut HessianMatrix, start: usize, outputs: &[f32], targets: &[f32]) {
    let dim = h.dim();
    let size = outputs.len();
    let target_sum: f32 = targets.iter().sum();

    let max = max_of(outputs);
    let mut probs: Vec<f32> = outputs
        .iter()
        .map(|&o| ((o - max) as f64).exp() as f32)
        .collect();
    let sum: f32 = probs.iter().sum();
    for p in &mut probs {
        *p /= sum;
    }

    for i in 0..size {
        for j in 0..size {
            let mut v = -probs[i] * probs[j];
            if i == j {
                v += probs[i];
            }
            h.data_mut()[(start + i) * dim + (start + j)] = target_sum * v;
        }
    }
}

/// `KL(softmax(outputs + step * deltas) || softmax(outputs))`.
///
/// Used to bound the divergence of a prospective update.
pub fn softmax_loss_kl(outputs: &[f32], deltas: &[f32], step: f32) -> f32 {
    let new: Vec<f32> = outputs.iter().zip(deltas).map(|(&o, &d)| o + step * d).collect();
    let old_log = log_softmax(outputs);
    let new_log = log_softmax(&new);
    let mut res = 0.0f32;
    for (nl, ol) in new_log.iter().zip(&old_log) {
        res += ((*nl as f64).exp() as f32) * (nl - ol);
    }
    res
}

/// Change in softmax loss caused by adding `step * deltas` to the outputs.
pub fn softmax_loss_delta(outputs: &[f32], targets: &[f32], deltas: &[f32], step: f32) -> f32 {
    let new: Vec<f32> = outputs.iter().zip(deltas).map(|(&o, &d)| o + step * d).collect();
    let old_log = log_softmax(outputs);
    let new_log = log_softmax(&new);
    let mut res = 0.0f32;
    for ((ol, nl), &t) in old_log.iter().zip(&new_log).zip(targets) {
        res += (ol - nl) * t;
    }
    res
}

fn log_softmax(outputs: &[f32]) -> Vec<f32> {
    let max = max_of(outputs);
    let mut exp_sum = 0.0f64;
    for &o in outputs {
        exp_sum += ((o - max) as f64).exp();
    }
    let c = max + exp_sum.ln() as f32;
    outputs.iter().map(|&o| o - c).collect()
}

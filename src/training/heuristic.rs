//! Splitting heuristics.
//!
//! A heuristic decides what a feature split is worth. It does so through a
//! single vector representation per sample: the builder sums those vectors
//! per prospective leaf (with Kahan compensation) and hands the aggregate
//! back to the heuristic for a scalar quality and, once a leaf is final,
//! an output delta.
//!
//! Quality is additively scaled with sample count: a leaf holding a sample
//! set twice scores roughly twice the quality, so qualities of sibling
//! leaves can be summed and compared across candidate splits.

use crate::data::TimestepSample;
use crate::numeric::{dot, minimize_unary, norm_squared, HessianMatrix, Polynomial};
use crate::training::loss::Loss;

/// Iterations of golden-section search used on loss polynomials.
const POLY_MIN_ITERS: usize = 30;

/// A strategy for scoring splits and deriving leaf outputs.
#[derive(Debug, Clone, PartialEq)]
pub enum Heuristic {
    /// Plain gradient boosting: fit leaves to the mean negative gradient,
    /// score by the squared-norm of the summed gradient per sample.
    Gradient { loss: Loss },
    /// Newton step per leaf from summed gradients and damped Hessians.
    Hessian { loss: Loss, damping: f32 },
    /// Exact minimisation (up to Taylor truncation) of per-coordinate loss
    /// polynomials; only losses with a polynomial form qualify.
    Polynomial { loss: Loss, max_delta: f32 },
}

impl Heuristic {
    /// Gradient heuristic over the given loss.
    pub fn gradient(loss: Loss) -> Self {
        Heuristic::Gradient { loss }
    }

    /// Hessian heuristic with the given L2 damping.
    ///
    /// The damping is added to every sample Hessian's diagonal; a small
    /// positive value (0.1 or so) keeps the aggregated matrix within reach
    /// of the iterative inverse.
    pub fn hessian(loss: Loss, damping: f32) -> Self {
        Heuristic::Hessian { loss, damping }
    }

    /// Polynomial heuristic with the default delta bound of 1.
    pub fn polynomial(loss: Loss) -> Self {
        Heuristic::Polynomial { loss, max_delta: 1.0 }
    }

    /// The loss this heuristic differentiates.
    pub fn loss(&self) -> &Loss {
        match self {
            Heuristic::Gradient { loss }
            | Heuristic::Hessian { loss, .. }
            | Heuristic::Polynomial { loss, .. } => loss,
        }
    }

    /// The per-sample vector representation of the loss contribution.
    ///
    /// # Panics
    ///
    /// Panics when the sample's output length is incompatible with the
    /// loss, or when the heuristic requires a loss capability (Hessian,
    /// polynomial form) the loss does not have.
    pub fn sample_vector(&self, sample: &TimestepSample<'_>) -> Vec<f32> {
        let ts = sample.timestep();
        match self {
            Heuristic::Gradient { loss } => {
                let grad = loss.gradient(&ts.output, &ts.target);
                let mut vec = Vec::with_capacity(grad.len() + 1);
                vec.push(1.0);
                vec.extend(grad);
                vec
            }
            Heuristic::Hessian { loss, damping } => {
                let grad = loss.gradient(&ts.output, &ts.target);
                let mut hess = loss.hessian(&ts.output, &ts.target);
                hess.add_diagonal(*damping);
                let mut vec = grad;
                vec.extend_from_slice(hess.data());
                vec
            }
            Heuristic::Polynomial { loss, .. } => {
                let polys = loss.polynomials(&ts.output, &ts.target);
                let terms = loss.polynomial_terms();
                let mut vec = Vec::with_capacity(polys.len() * terms);
                for poly in polys {
                    debug_assert_eq!(poly.len(), terms);
                    vec.extend(poly.0);
                }
                vec
            }
        }
    }

    /// Scalar split quality of an aggregated vector sum; larger is better,
    /// zero means no improvement.
    pub fn quality(&self, vec_sum: &[f32]) -> f32 {
        match self {
            Heuristic::Gradient { .. } => {
                let count = vec_sum[0];
                if count == 0.0 {
                    return 0.0;
                }
                norm_squared(&vec_sum[1..]) / count
            }
            Heuristic::Hessian { .. } => {
                let (_, min_value) = minimize_second_order(vec_sum);
                -min_value
            }
            Heuristic::Polynomial { loss, max_delta } => {
                let terms = loss.polynomial_terms();
                let mut quality = 0.0f32;
                for chunk in vec_sum.chunks_exact(terms) {
                    let poly = Polynomial(chunk.to_vec());
                    let x = minimize_unary(-max_delta, *max_delta, POLY_MIN_ITERS, |a| {
                        poly.evaluate(a)
                    });
                    quality -= poly.evaluate(x);
                }
                quality
            }
        }
    }

    /// The output delta minimising the aggregate loss of the samples whose
    /// vectors sum to `vec_sum`.
    pub fn leaf_output(&self, vec_sum: &[f32]) -> Vec<f32> {
        match self {
            Heuristic::Gradient { .. } => {
                // A zero count only arises on degenerate leaves; treating
                // it as one keeps the output finite (and zero).
                let mut count = vec_sum[0];
                if count == 0.0 {
                    count = 1.0;
                }
                let scale = -1.0 / count;
                vec_sum[1..].iter().map(|x| x * scale).collect()
            }
            Heuristic::Hessian { .. } => minimize_second_order(vec_sum).0,
            Heuristic::Polynomial { loss, max_delta } => {
                let terms = loss.polynomial_terms();
                vec_sum
                    .chunks_exact(terms)
                    .map(|chunk| {
                        let poly = Polynomial(chunk.to_vec());
                        minimize_unary(-max_delta, *max_delta, POLY_MIN_ITERS, |a| {
                            poly.evaluate(a)
                        })
                    })
                    .collect()
            }
        }
    }
}

/// Split a `[gradient | hessian]` aggregate and minimise its quadratic
/// model: returns `(argmin, min_value)` for `g·x + x·Hx/2`.
fn minimize_second_order(vec_sum: &[f32]) -> (Vec<f32>, f32) {
    let dim = infer_dimension(vec_sum.len());
    let grad = &vec_sum[..dim];
    let hessian = HessianMatrix::from_vec(dim, vec_sum[dim..].to_vec());

    let neg_grad: Vec<f32> = grad.iter().map(|x| -x).collect();
    let solution = hessian.apply_inverse(&neg_grad);
    let value = dot(grad, &solution) + 0.5 * dot(&solution, &hessian.apply(&solution));
    (solution, value)
}

/// Recover `d` from a vector of length `d + d^2`.
fn infer_dimension(vec_len: usize) -> usize {
    let mut dim = 0;
    while dim * (dim + 1) < vec_len {
        dim += 1;
    }
    assert_eq!(dim * (dim + 1), vec_len, "invalid gradient/hessian vector size");
    dim
}

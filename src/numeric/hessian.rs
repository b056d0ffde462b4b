//! Small dense symmetric matrices.
//!
//! The Newton splitting heuristic aggregates per-sample Hessians of the
//! loss and solves `Hx = -g` for the optimal leaf delta. Dimensions here
//! are output dimensions (a handful to a few hundred), so a dense row-major
//! layout and an iterative solve are enough.

use super::{difference, dot, norm_squared};

/// Row-major `dim x dim` symmetric matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct HessianMatrix {
    dim: usize,
    data: Vec<f32>,
}

impl HessianMatrix {
    /// Create a zero matrix of the given dimension.
    pub fn zeros(dim: usize) -> Self {
        Self {
            dim,
            data: vec![0.0; dim * dim],
        }
    }

    /// Wrap an existing row-major buffer.
    ///
    /// # Panics
    ///
    /// Panics if `data.len() != dim * dim`.
    pub fn from_vec(dim: usize, data: Vec<f32>) -> Self {
        assert_eq!(data.len(), dim * dim, "dimension mismatch");
        Self { dim, data }
    }

    /// Matrix dimension.
    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// The row-major entries.
    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable access to the row-major entries.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Entry `(row, col)`.
    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.dim + col]
    }

    /// Add `value` to every diagonal entry.
    pub fn add_diagonal(&mut self, value: f32) {
        for i in 0..self.dim {
            self.data[i * self.dim + i] += value;
        }
    }

    /// Matrix-vector product `H v`.
    ///
    /// # Panics
    ///
    /// Panics if `v.len() != dim`.
    pub fn apply(&self, v: &[f32]) -> Vec<f32> {
        assert_eq!(v.len(), self.dim, "dimension mismatch");
        let mut res = vec![0.0f32; self.dim];
        for (i, out) in res.iter_mut().enumerate() {
            let row = &self.data[i * self.dim..(i + 1) * self.dim];
            *out = dot(row, v);
        }
        res
    }

    /// Solve `H x = v` for `x` as a pseudo-inverse.
    ///
    /// Runs up to `dim` rounds of residual-direction descent: with residual
    /// `r = v - Hx` and direction `p = Hr`, steps by `(r.p)/|p|^2` along `r`.
    /// A zero-magnitude direction terminates the iteration early. Adequate
    /// only for well-conditioned matrices; callers that cannot guarantee
    /// that add damping to the diagonal first.
    pub fn apply_inverse(&self, v: &[f32]) -> Vec<f32> {
        assert_eq!(v.len(), self.dim, "dimension mismatch");
        let mut x = vec![0.0f32; self.dim];

        for _ in 0..self.dim {
            let residual = difference(v, &self.apply(&x));
            let product = self.apply(&residual);
            let divisor = norm_squared(&product);
            if divisor == 0.0 {
                break;
            }
            let step_size = dot(&residual, &product) / divisor;
            for (xi, ri) in x.iter_mut().zip(&residual) {
                *xi += step_size * ri;
            }
        }

        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numeric::{difference, norm_squared};
    use rand::Rng;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    /// Random symmetric positive-definite matrix built as a Gram matrix.
    fn random_spd(dim: usize, rng: &mut Xoshiro256PlusPlus) -> HessianMatrix {
        let rows: Vec<Vec<f32>> = (0..dim)
            .map(|_| (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect())
            .collect();
        let mut h = HessianMatrix::zeros(dim);
        for i in 0..dim {
            for j in 0..dim {
                h.data_mut()[i * dim + j] = crate::numeric::dot(&rows[i], &rows[j]);
            }
        }
        // A Gram matrix of random rows can be near-singular, and the solver
        // is only adequate for well-conditioned matrices; the ridge mirrors
        // the damping the Newton heuristic applies in real use.
        h.add_diagonal(4.0);
        h
    }

    #[test]
    fn apply_multiplies() {
        let h = HessianMatrix::from_vec(2, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(h.apply(&[1.0, 1.0]), vec![3.0, 7.0]);
    }

    #[test]
    fn inverse_residual_is_small() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
        let h = random_spd(16, &mut rng);
        let v: Vec<f32> = (0..16).map(|_| rng.gen_range(-1.0..1.0)).collect();

        let solution = h.apply_inverse(&v);
        let residual = difference(&h.apply(&solution), &v);
        let rel = norm_squared(&residual) / norm_squared(&v);
        assert!(rel < 1e-4, "relative residual {rel} too large");
    }

    #[test]
    fn inverse_of_zero_is_zero() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(11);
        let h = random_spd(8, &mut rng);
        let solution = h.apply_inverse(&[0.0; 8]);
        assert!(solution.iter().all(|&x| x == 0.0));
    }

    #[test]
    #[should_panic(expected = "dimension mismatch")]
    fn apply_rejects_wrong_length() {
        let h = HessianMatrix::zeros(3);
        h.apply(&[1.0, 2.0]);
    }

    #[test]
    fn add_diagonal_damps() {
        let mut h = HessianMatrix::zeros(3);
        h.add_diagonal(0.5);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 0.5 } else { 0.0 };
                assert_eq!(h.get(i, j), expected);
            }
        }
    }
}

//! Univariate polynomials and the log-sigmoid Taylor expansion.
//!
//! The polynomial splitting heuristic represents each sample's loss
//! contribution as a short polynomial in the prospective output delta. The
//! expansion of `log σ(x + a)` around `a = 0` has closed-form coefficients
//! built from the Triangle of Eulerian numbers (OEIS A008292); ten terms
//! keep the residual below 1e-5 for `|a| <= 1` across the whole useful
//! range of centres.

/// Number of coefficients produced by [`polynomial_log_sigmoid`].
pub const LOG_SIGMOID_TERMS: usize = 10;

/// A finite-coefficient univariate polynomial.
///
/// Coefficient `i` multiplies `x^i`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Polynomial(pub Vec<f32>);

impl Polynomial {
    /// Evaluate at `x` by running powers of `x` against the coefficients.
    pub fn evaluate(&self, x: f32) -> f32 {
        let mut coeff = 1.0f32;
        let mut res = 0.0f32;
        for &c in &self.0 {
            res += c * coeff;
            coeff *= x;
        }
        res
    }

    /// Sum of two polynomials, zero-padding the shorter one.
    pub fn add(&self, other: &Polynomial) -> Polynomial {
        let mut res = vec![0.0f32; self.0.len().max(other.0.len())];
        for (i, &x) in self.0.iter().enumerate() {
            res[i] = x;
        }
        for (i, &x) in other.0.iter().enumerate() {
            res[i] += x;
        }
        Polynomial(res)
    }

    /// The polynomial scaled by `s`.
    pub fn scale(&self, s: f32) -> Polynomial {
        Polynomial(self.0.iter().map(|x| x * s).collect())
    }

    /// The polynomial `p1(x) = p(-x)`, i.e. odd coefficients negated.
    pub fn flip_x(&self) -> Polynomial {
        Polynomial(
            self.0
                .iter()
                .enumerate()
                .map(|(i, &x)| if i % 2 == 1 { -x } else { x })
                .collect(),
        )
    }

    /// Number of coefficients.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the polynomial has no coefficients.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Ten-term Taylor expansion of `a ↦ log σ(x + a)` around `a = 0`.
///
/// Accurate to about 1e-5 for `|a| <= 1`. Coefficients are assembled in
/// f64 from powers of `exp(x)` and `(exp(x) + 1)`; the numerators follow
/// the Triangle of Eulerian numbers (OEIS A008292).
///
/// Extreme centres are handled explicitly:
/// - an overflowing `exp(±x)` is clamped to `2^32` before the coefficients
///   are formed;
/// - the constant term falls back to `x` itself below `x = -22`, where
///   `log σ(x)` is indistinguishable from `x`;
/// - a coefficient that comes out NaN (an `∞ - ∞` in the numerator at the
///   extremes) is replaced by zero, since its true value is negligible
///   there.
pub fn polynomial_log_sigmoid(x: f32) -> Polynomial {
    const BIG: f64 = (1u64 << 32) as f64;

    let mut exp = (x as f64).exp();
    let mut inv_exp = (-x as f64).exp();
    if exp.is_infinite() {
        exp = BIG;
    } else if inv_exp.is_infinite() {
        inv_exp = BIG;
    }

    let log_value = if x > -22.0 {
        (1.0 / (1.0 + inv_exp)).ln()
    } else {
        x as f64
    };

    let exp2 = exp * exp;
    let exp3 = exp2 * exp;
    let exp4 = exp2 * exp2;
    let exp5 = exp3 * exp2;
    let exp6 = exp3 * exp3;
    let exp7 = exp4 * exp3;

    let expp = exp + 1.0;
    let expp2 = expp * expp;
    let expp3 = expp2 * expp;
    let expp4 = expp2 * expp2;
    let expp5 = expp4 * expp;
    let expp6 = expp3 * expp3;
    let expp7 = expp4 * expp3;
    let expp8 = expp4 * expp4;
    let expp9 = expp5 * expp4;

    let coeffs = [
        log_value,
        1.0 / (exp + 1.0),
        -1.0 / 2.0 * exp / expp2,
        1.0 / 6.0 * exp * (exp - 1.0) / expp3,
        -1.0 / 24.0 * exp * (-4.0 * exp + exp2 + 1.0) / expp4,
        1.0 / 120.0 * exp * (11.0 * exp - 11.0 * exp2 + exp3 - 1.0) / expp5,
        -1.0 / 720.0 * exp * (-26.0 * exp + 66.0 * exp2 - 26.0 * exp3 + exp4 + 1.0) / expp6,
        1.0 / 5040.0
            * exp
            * (57.0 * exp - 302.0 * exp2 + 302.0 * exp3 - 57.0 * exp4 + exp5 - 1.0)
            / expp7,
        -1.0 / 40320.0
            * exp
            * (-120.0 * exp + 1191.0 * exp2 - 2416.0 * exp3 + 1191.0 * exp4 - 120.0 * exp5
                + exp6
                + 1.0)
            / expp8,
        1.0 / 362880.0
            * exp
            * (247.0 * exp - 4293.0 * exp2 + 15619.0 * exp3 - 15619.0 * exp4 + 4293.0 * exp5
                - 247.0 * exp6
                + exp7
                - 1.0)
            / expp9,
    ];

    Polynomial(
        coeffs
            .iter()
            .map(|&c| if c.is_nan() { 0.0 } else { c as f32 })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn exact_log_sigmoid(x: f32) -> f32 {
        // Stable reference: the tails of log(sigmoid(x)).
        if x < -20.0 {
            x
        } else if x > 20.0 {
            -(-x as f64).exp() as f32
        } else {
            (1.0 / (1.0 + (-x as f64).exp())).ln() as f32
        }
    }

    #[rstest]
    #[case(-30.0)]
    #[case(-20.0)]
    #[case(-10.0)]
    #[case(-5.0)]
    #[case(-4.0)]
    #[case(-3.0)]
    #[case(-2.0)]
    #[case(-1.0)]
    #[case(0.0)]
    #[case(1.0)]
    #[case(2.0)]
    #[case(3.0)]
    #[case(4.0)]
    #[case(5.0)]
    #[case(10.0)]
    #[case(20.0)]
    #[case(30.0)]
    fn taylor_matches_log_sigmoid(#[case] center: f32) {
        let p = polynomial_log_sigmoid(center);
        assert_eq!(p.len(), LOG_SIGMOID_TERMS);
        let mut a = -1.0f32;
        while a <= 1.0 {
            let actual = p.evaluate(a);
            let expected = exact_log_sigmoid(center + a);
            assert!(
                (actual - expected).abs() <= 1e-5,
                "log(sigmoid({center}+{a})) should be {expected}, got {actual}"
            );
            a += 0.1;
        }
    }

    #[test]
    fn no_nan_coefficients_at_extremes() {
        for center in [-100.0f32, -50.0, 50.0, 100.0] {
            let p = polynomial_log_sigmoid(center);
            assert!(p.0.iter().all(|c| c.is_finite()), "center {center}: {:?}", p.0);
        }
    }

    #[test]
    fn evaluate_runs_ascending_powers() {
        let p = Polynomial(vec![1.0, 2.0, 3.0]);
        assert_eq!(p.evaluate(2.0), 1.0 + 4.0 + 12.0);
        assert_eq!(p.evaluate(0.0), 1.0);
    }

    #[test]
    fn add_zero_pads_shorter() {
        let p = Polynomial(vec![1.0, 2.0]);
        let q = Polynomial(vec![10.0, 20.0, 30.0]);
        assert_eq!(p.add(&q).0, vec![11.0, 22.0, 30.0]);
        assert_eq!(q.add(&p).0, vec![11.0, 22.0, 30.0]);
    }

    #[test]
    fn scale_and_flip() {
        let p = Polynomial(vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(p.scale(0.5).0, vec![0.5, 1.0, 1.5, 2.0]);
        assert_eq!(p.flip_x().0, vec![1.0, -2.0, 3.0, -4.0]);
        // p(-x) == flip_x(p)(x)
        assert_eq!(p.evaluate(-1.5), p.flip_x().evaluate(1.5));
    }
}

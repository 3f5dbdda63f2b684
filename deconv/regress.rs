//! Constrained regression of observed mutation fractions onto variant
//! signatures.
//!
//! Both regressors solve `argmin_b || diag(k) X b - diag(k) y ||` under their
//! respective constraints: the kernel weights scale the rows of the system,
//! they are not a weighted-norm reformulation. Solver non-convergence is not
//! an error anywhere in this module; the best iterate and its cost are
//! returned as-is and the caller cannot distinguish the two outcomes.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::Solve;
use serde::{Deserialize, Serialize};

/// Point estimate of variant proportions at one query date, together with
/// the solver's final objective value.
#[derive(Debug, Clone)]
pub struct RegressionFit {
    pub fitted: Array1<f64>,
    pub loss: f64,
}

/// Robust loss kernel applied to scaled residuals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobustLoss {
    /// Pseudo-Huber "soft L1": `rho(z) = 2(sqrt(1 + z) - 1)`. Quadratic for
    /// small residuals, linear for outliers.
    SoftL1,
    /// Plain squared loss; the bounded solver then reduces to box-constrained
    /// least squares.
    Linear,
}

impl RobustLoss {
    /// `rho(z)` for `z = (r / f_scale)^2`.
    fn rho(self, z: f64) -> f64 {
        match self {
            RobustLoss::SoftL1 => 2.0 * ((1.0 + z).sqrt() - 1.0),
            RobustLoss::Linear => z,
        }
    }

    /// `rho'(z)`.
    fn rho_prime(self, z: f64) -> f64 {
        match self {
            RobustLoss::SoftL1 => 1.0 / (1.0 + z).sqrt(),
            RobustLoss::Linear => 1.0,
        }
    }
}

/// The regression strategy, selected once at configuration time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Regressor {
    /// Non-negative least squares via the Lawson-Hanson active-set
    /// algorithm. No upper bound; `loss` is the residual 2-norm.
    Nnls,
    /// Least squares with every coefficient bounded to `[0, 1]` and a robust
    /// loss to blunt outlier observations; `loss` is the final objective
    /// cost.
    Robust { loss: RobustLoss, f_scale: f64 },
}

impl Regressor {
    /// Fits `diag(k) X b ~= diag(k) y` under this regressor's constraints.
    pub fn fit(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        k: ArrayView1<f64>,
    ) -> RegressionFit {
        self.fit_from(x, y, k, None)
    }

    /// Like [`fit`](Self::fit) but with an explicit starting point for the
    /// iterative solver. NNLS ignores it; the robust solver defaults to the
    /// uniform vector `1/n_cols` when `b0` is `None`.
    pub fn fit_from(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        k: ArrayView1<f64>,
        b0: Option<ArrayView1<f64>>,
    ) -> RegressionFit {
        let a = scale_rows(x, k);
        let b = (&y * &k).to_owned();
        match *self {
            Regressor::Nnls => nnls(&a, &b),
            Regressor::Robust { loss, f_scale } => {
                let start = match b0 {
                    Some(v) => v.to_owned(),
                    None => Array1::from_elem(x.ncols(), 1.0 / x.ncols() as f64),
                };
                bounded_robust(&a, &b, loss, f_scale, start)
            }
        }
    }
}

/// Scales each row of `x` by the matching entry of `k`.
fn scale_rows(x: ArrayView2<f64>, k: ArrayView1<f64>) -> Array2<f64> {
    let mut a = x.to_owned();
    for (mut row, &w) in a.axis_iter_mut(Axis(0)).zip(k.iter()) {
        row *= w;
    }
    a
}

/// Least-squares solution restricted to the passive column set, via the
/// normal equations. Returns `None` when the passive Gram matrix is
/// singular, which terminates the active-set search with the current
/// iterate.
fn solve_passive(a: &Array2<f64>, b: &Array1<f64>, passive: &[usize]) -> Option<Array1<f64>> {
    let ap = a.select(Axis(1), passive);
    let gram = ap.t().dot(&ap);
    let rhs = ap.t().dot(b);
    gram.solve(&rhs).ok()
}

/// Lawson-Hanson non-negative least squares.
///
/// Returns the coefficient vector and the residual 2-norm `||A x - b||`.
fn nnls(a: &Array2<f64>, b: &Array1<f64>) -> RegressionFit {
    let n = a.ncols();
    let mut x = Array1::<f64>::zeros(n);
    let mut passive = vec![false; n];
    let max_outer = 3 * n.max(1);
    // Dual feasibility tolerance, scaled to the problem like scipy's nnls.
    let tol = 10.0 * f64::EPSILON * a.iter().map(|v| v.abs()).fold(0.0, f64::max) * n as f64;

    for _ in 0..max_outer {
        let w = a.t().dot(&(b - &a.dot(&x)));
        let candidate = (0..n)
            .filter(|&j| !passive[j] && w[j] > tol)
            .max_by(|&i, &j| w[i].total_cmp(&w[j]));
        let Some(j_star) = candidate else { break };
        passive[j_star] = true;

        loop {
            let passive_idx: Vec<usize> = (0..n).filter(|&j| passive[j]).collect();
            let Some(z) = solve_passive(a, b, &passive_idx) else {
                passive[j_star] = false;
                return finish_nnls(a, b, x);
            };
            if z.iter().all(|&v| v > 0.0) {
                x.fill(0.0);
                for (&j, &v) in passive_idx.iter().zip(z.iter()) {
                    x[j] = v;
                }
                break;
            }
            // Step back along the segment to the first coordinate that hits
            // zero, then retire it from the passive set.
            let mut alpha = f64::INFINITY;
            for (&j, &zj) in passive_idx.iter().zip(z.iter()) {
                if zj <= 0.0 {
                    alpha = alpha.min(x[j] / (x[j] - zj));
                }
            }
            for (&j, &zj) in passive_idx.iter().zip(z.iter()) {
                x[j] += alpha * (zj - x[j]);
            }
            for &j in &passive_idx {
                if x[j] <= 1e-14 {
                    x[j] = 0.0;
                    passive[j] = false;
                }
            }
        }
    }
    finish_nnls(a, b, x)
}

fn finish_nnls(a: &Array2<f64>, b: &Array1<f64>, x: Array1<f64>) -> RegressionFit {
    let residual = &a.dot(&x) - b;
    let loss = residual.dot(&residual).sqrt();
    RegressionFit { fitted: x, loss }
}

/// Box-constrained robust least squares on `[0, 1]^n` via projected gradient
/// descent with Armijo backtracking.
fn bounded_robust(
    a: &Array2<f64>,
    b: &Array1<f64>,
    loss: RobustLoss,
    f_scale: f64,
    start: Array1<f64>,
) -> RegressionFit {
    const MAX_ITER: usize = 1000;
    const STEP_TOL: f64 = 1e-12;

    let s2 = f_scale * f_scale;
    let cost = |beta: &Array1<f64>| -> f64 {
        let r = &a.dot(beta) - b;
        0.5 * s2 * r.iter().map(|&ri| loss.rho(ri * ri / s2)).sum::<f64>()
    };
    let gradient = |beta: &Array1<f64>| -> Array1<f64> {
        let r = &a.dot(beta) - b;
        let weighted = r.mapv(|ri| loss.rho_prime(ri * ri / s2) * ri);
        a.t().dot(&weighted)
    };
    let project = |beta: Array1<f64>| beta.mapv(|v| v.clamp(0.0, 1.0));

    let mut beta = project(start);
    let mut current = cost(&beta);
    let mut step = 1.0_f64;

    for _ in 0..MAX_ITER {
        let g = gradient(&beta);
        let mut accepted = false;
        for _ in 0..60 {
            let candidate = project(&beta - &(&g * step));
            let trial = cost(&candidate);
            let descent: f64 = g
                .iter()
                .zip(beta.iter().zip(candidate.iter()))
                .map(|(&gi, (&bi, &ci))| gi * (bi - ci))
                .sum();
            if trial <= current - 1e-4 * descent {
                let moved = (&candidate - &beta).iter().map(|v| v.abs()).fold(0.0, f64::max);
                beta = candidate;
                current = trial;
                accepted = true;
                if moved < STEP_TOL {
                    return RegressionFit {
                        fitted: beta,
                        loss: current,
                    };
                }
                break;
            }
            step *= 0.5;
        }
        if !accepted {
            break;
        }
        step = (step * 2.0).min(1.0e6);
    }
    RegressionFit {
        fitted: beta,
        loss: current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn nnls_recovers_exact_nonnegative_solution() {
        // Identity design: the weighted solution is y itself.
        let x = Array2::eye(3);
        let y = array![0.2, 0.5, 0.3];
        let k = Array1::ones(3);
        let fit = Regressor::Nnls.fit(x.view(), y.view(), k.view());
        for (a, b) in fit.fitted.iter().zip(y.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
        assert_abs_diff_eq!(fit.loss, 0.0, epsilon = 1e-10);
    }

    #[test]
    fn nnls_output_is_never_negative() {
        // A system whose unconstrained solution has a negative component.
        let x = array![[1.0, 1.0], [1.0, 0.0], [0.0, 1.0]];
        let y = array![0.0, 1.0, -0.5];
        let k = Array1::ones(3);
        let fit = Regressor::Nnls.fit(x.view(), y.view(), k.view());
        assert!(fit.fitted.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn nnls_respects_kernel_weights() {
        // Two contradictory observations of a single coefficient; the
        // heavily weighted one must dominate.
        let x = array![[1.0], [1.0]];
        let y = array![0.0, 1.0];
        let k = array![1e-6, 1.0];
        let fit = Regressor::Nnls.fit(x.view(), y.view(), k.view());
        assert!(fit.fitted[0] > 0.99);
    }

    #[test]
    fn robust_fit_stays_inside_unit_box() {
        let x = array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
        // y pulls the unconstrained optimum above 1 and below 0.
        let y = array![2.0, -1.0, 1.5];
        let k = Array1::ones(3);
        let reg = Regressor::Robust {
            loss: RobustLoss::SoftL1,
            f_scale: 0.1,
        };
        let fit = reg.fit(x.view(), y.view(), k.view());
        assert!(fit.fitted.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn robust_linear_loss_recovers_interior_solution() {
        let x = Array2::eye(3);
        let y = array![0.25, 0.5, 0.25];
        let k = Array1::ones(3);
        let reg = Regressor::Robust {
            loss: RobustLoss::Linear,
            f_scale: 0.1,
        };
        let fit = reg.fit(x.view(), y.view(), k.view());
        for (a, b) in fit.fitted.iter().zip(y.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-6);
        }
    }

    #[test]
    fn robust_honors_supplied_starting_point() {
        let x = Array2::eye(2);
        let y = array![0.6, 0.4];
        let k = Array1::ones(2);
        let reg = Regressor::Robust {
            loss: RobustLoss::SoftL1,
            f_scale: 0.1,
        };
        let b0 = array![0.6, 0.4];
        let fit = reg.fit_from(x.view(), y.view(), k.view(), Some(b0.view()));
        assert_abs_diff_eq!(fit.fitted[0], 0.6, epsilon = 1e-6);
        assert_abs_diff_eq!(fit.fitted[1], 0.4, epsilon = 1e-6);
    }

    #[test]
    fn soft_l1_downweights_a_gross_outlier() {
        // 9 clean observations of beta = 0.5 and one wild outlier.
        let n = 10;
        let x = Array2::from_elem((n, 1), 1.0);
        let mut y = Array1::from_elem(n, 0.5);
        y[9] = 100.0;
        let k = Array1::ones(n);
        let robust = Regressor::Robust {
            loss: RobustLoss::SoftL1,
            f_scale: 0.1,
        }
        .fit(x.view(), y.view(), k.view());
        let plain = Regressor::Robust {
            loss: RobustLoss::Linear,
            f_scale: 0.1,
        }
        .fit(x.view(), y.view(), k.view());
        // The robust estimate must sit closer to the clean value; the plain
        // squared loss saturates the upper bound.
        assert!(robust.fitted[0] < plain.fitted[0]);
        assert!(robust.fitted[0] < 0.7);
    }
}

//! Wald confidence intervals for deconvolved variant proportions.
//!
//! The fitted linear predictor is treated as the success probability of a
//! per-row Bernoulli "mutation present" outcome. The plug-in Fisher
//! information of that linear probability model, evaluated at the fitted
//! proportions, yields asymptotic standard errors; a delta-method Jacobian
//! carries them onto the logit scale when requested. A singular information
//! matrix is a legitimate outcome ("not enough signal to bound this
//! coefficient") and is surfaced as an all-NaN band, never a panic: the
//! inversion failure is an explicit [`SingularInformation`] internally so
//! that the degenerate path is typed rather than accidental.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::Inverse;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use thiserror::Error;

/// Lower and upper interval bounds, aligned with the coefficient vector.
/// On the logit scale the bounds are logit-scale numbers, not proportions.
#[derive(Debug, Clone)]
pub struct ConfidenceBand {
    pub lower: Array1<f64>,
    pub upper: Array1<f64>,
}

impl ConfidenceBand {
    /// The degenerate band: interval unavailable for every coefficient.
    pub fn unavailable(n: usize) -> Self {
        Self {
            lower: Array1::from_elem(n, f64::NAN),
            upper: Array1::from_elem(n, f64::NAN),
        }
    }
}

/// The Fisher information matrix could not be inverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Fisher information matrix is singular; standard errors are undefined")]
pub struct SingularInformation;

/// Scale on which the Wald interval is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfintScale {
    Linear,
    Logit,
}

/// How the quasi-binomial dispersion is pooled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverdispersionMethod {
    /// One dispersion scalar: the kernel-weighted mean of squared Pearson
    /// residuals over all retained rows.
    All,
    /// One dispersion value per variant, computed over the rows whose LAST
    /// design column (the undetermined indicator, by construction of the
    /// design matrix) is zero, weighted by kernel-scaled membership; the
    /// last entry is overwritten with the pooled dispersion over that same
    /// row subset.
    Strat,
}

/// Wald interval configuration.
#[derive(Debug, Clone)]
pub struct WaldConfint {
    /// Two-sided confidence level in (0, 1).
    pub level: f64,
    pub scale: ConfintScale,
    /// Regularizer keeping fitted probabilities away from the degenerate
    /// 0/1 variances.
    pub pseudo_fraction: f64,
    pub overdispersion: Option<OverdispersionMethod>,
}

impl Default for WaldConfint {
    fn default() -> Self {
        Self {
            level: 0.95,
            scale: ConfintScale::Linear,
            pseudo_fraction: 0.001,
            overdispersion: None,
        }
    }
}

/// Interval strategy held by the engine; `Null` disables interval
/// computation without branching at the call site.
#[derive(Debug, Clone)]
pub enum ConfidenceEstimator {
    Null,
    Wald(WaldConfint),
}

impl ConfidenceEstimator {
    /// Computes the confidence band around `coefs`.
    ///
    /// `xw` is the kernel-scaled design matrix of the retained rows; `y` and
    /// `kvals` are only consulted by the overdispersion correction and may
    /// be omitted otherwise.
    pub fn confint(
        &self,
        xw: ArrayView2<f64>,
        coefs: ArrayView1<f64>,
        y: Option<ArrayView1<f64>>,
        kvals: Option<ArrayView1<f64>>,
    ) -> ConfidenceBand {
        match self {
            ConfidenceEstimator::Null => ConfidenceBand::unavailable(coefs.len()),
            ConfidenceEstimator::Wald(wald) => wald.confint(xw, coefs, y, kvals),
        }
    }
}

impl WaldConfint {
    /// Two-sided normal quantile for the configured level.
    fn z_quantile(&self) -> f64 {
        let standard_normal =
            Normal::new(0.0, 1.0).expect("standard normal parameters are valid");
        standard_normal.inverse_cdf(1.0 - (1.0 - self.level) / 2.0)
    }

    /// Fitted per-row mutation probabilities under the renormalized
    /// coefficients, pushed away from 0 and 1 by the pseudo-fraction.
    fn pseudo_probs(&self, x: ArrayView2<f64>, coefs: ArrayView1<f64>) -> Array1<f64> {
        let pseudo_coefs = &coefs / coefs.sum();
        let fitted = x.dot(&pseudo_coefs) + self.pseudo_fraction;
        fitted.mapv(|f| f / (f + (1.0 - f + 2.0 * self.pseudo_fraction)))
    }

    /// Inverse Fisher information of the linear probability model at the
    /// fitted probabilities.
    fn inverse_information(
        &self,
        x: ArrayView2<f64>,
        probs: &Array1<f64>,
    ) -> Result<Array2<f64>, SingularInformation> {
        let mut scaled = x.to_owned();
        for (mut row, &p) in scaled.axis_iter_mut(Axis(0)).zip(probs.iter()) {
            row *= 1.0 / (p * (1.0 - p));
        }
        let information = x.t().dot(&scaled);
        information.inv().map_err(|_| SingularInformation)
    }

    /// Linear-scale standard errors of the coefficient estimates.
    fn standard_error(
        &self,
        x: ArrayView2<f64>,
        coefs: ArrayView1<f64>,
    ) -> Result<Array1<f64>, SingularInformation> {
        let probs = self.pseudo_probs(x, coefs);
        let covariance = self.inverse_information(x, &probs)?;
        Ok(covariance.diag().mapv(f64::sqrt))
    }

    /// The epsilon-regularized, re-normalized pseudo-coefficients that
    /// center the logit-scale interval.
    fn pseudo_coefs(&self, coefs: ArrayView1<f64>) -> Array1<f64> {
        let normalized = &coefs / coefs.sum();
        let shifted = &normalized + self.pseudo_fraction;
        &shifted / (normalized.sum() + 2.0 * self.pseudo_fraction)
    }

    /// Logit-scale standard errors via the delta method.
    ///
    /// The Jacobian of the logit-renormalization map is row-constant: entry
    /// `(i, j)` equals `-1 / (q_i (1 - q_i))` off the diagonal with the sign
    /// flipped on the diagonal, which is the derivative of `log(q / (1 - q))`
    /// composed with renormalization by the coefficient sum.
    fn logit_standard_error(
        &self,
        x: ArrayView2<f64>,
        coefs: ArrayView1<f64>,
    ) -> Result<Array1<f64>, SingularInformation> {
        let probs = self.pseudo_probs(x, coefs);
        let covariance = self.inverse_information(x, &probs)?;
        let q = self.pseudo_coefs(coefs);
        let n = q.len();
        let jacobian = Array2::from_shape_fn((n, n), |(i, j)| {
            let d = 1.0 / (q[i] * (1.0 - q[i]));
            if i == j { d } else { -d }
        });
        let logit_cov = jacobian.dot(&covariance).dot(&jacobian.t());
        Ok(logit_cov.diag().mapv(f64::sqrt))
    }

    /// Quasi-binomial dispersion from kernel-weighted squared Pearson
    /// residuals.
    fn dispersion(
        &self,
        xw: ArrayView2<f64>,
        coefs: ArrayView1<f64>,
        y: ArrayView1<f64>,
        kvals: ArrayView1<f64>,
        method: OverdispersionMethod,
    ) -> Dispersion {
        let probs = self.pseudo_probs(xw, coefs);
        let pearson_sq = Array1::from_shape_fn(y.len(), |i| {
            let p = probs[i];
            (y[i] - p).powi(2) / (p * (1.0 - p))
        });
        match method {
            OverdispersionMethod::All => {
                Dispersion::Scalar(weighted_mean(&pearson_sq, kvals))
            }
            OverdispersionMethod::Strat => {
                let n_cols = xw.ncols();
                let determined: Vec<usize> = (0..xw.nrows())
                    .filter(|&i| xw[[i, n_cols - 1]] == 0.0)
                    .collect();
                let mut phi = Array1::zeros(n_cols);
                for j in 0..n_cols {
                    let mut num = 0.0;
                    let mut den = 0.0;
                    for &i in &determined {
                        num += xw[[i, j]] * pearson_sq[i];
                        den += xw[[i, j]];
                    }
                    phi[j] = num / den;
                }
                // The undetermined slot has no membership of its own on this
                // subset; give it the pooled value instead.
                let mut num = 0.0;
                let mut den = 0.0;
                for &i in &determined {
                    num += kvals[i] * pearson_sq[i];
                    den += kvals[i];
                }
                phi[n_cols - 1] = num / den;
                Dispersion::PerCoefficient(phi)
            }
        }
    }

    fn confint(
        &self,
        xw: ArrayView2<f64>,
        coefs: ArrayView1<f64>,
        y: Option<ArrayView1<f64>>,
        kvals: Option<ArrayView1<f64>>,
    ) -> ConfidenceBand {
        let se = match self.scale {
            ConfintScale::Linear => self.standard_error(xw, coefs),
            ConfintScale::Logit => self.logit_standard_error(xw, coefs),
        };
        let Ok(mut se) = se else {
            return ConfidenceBand::unavailable(coefs.len());
        };

        if let (Some(method), Some(y), Some(kvals)) = (self.overdispersion, y, kvals) {
            match self.dispersion(xw, coefs, y, kvals, method) {
                Dispersion::Scalar(phi) => se *= phi,
                Dispersion::PerCoefficient(phi) => se = &se * &phi,
            }
        }

        let z = self.z_quantile();
        let center = match self.scale {
            ConfintScale::Linear => coefs.to_owned(),
            ConfintScale::Logit => self.pseudo_coefs(coefs).mapv(|q| (q / (1.0 - q)).ln()),
        };
        ConfidenceBand {
            lower: &center - &(&se * z),
            upper: &center + &(&se * z),
        }
    }
}

enum Dispersion {
    Scalar(f64),
    PerCoefficient(Array1<f64>),
}

fn weighted_mean(values: &Array1<f64>, weights: ArrayView1<f64>) -> f64 {
    let num: f64 = values
        .iter()
        .zip(weights.iter())
        .map(|(&v, &w)| v * w)
        .sum();
    num / weights.sum()
}

//! Per-date orchestration of the kernel deconvolution.
//!
//! For every distinct observation date the engine weights all rows by their
//! temporal distance to that date, discards negligible rows, fits the
//! constrained regression, renormalizes the fitted proportions, and attaches
//! a confidence band. Each date's estimate is an immutable record derived
//! only from the shared input arrays, so the sweep over dates (and, one
//! level up, over locations) is embarrassingly parallel.

use chrono::NaiveDate;
use itertools::Itertools;
use ndarray::{Array1, Array2, Axis};
use serde::Serialize;

use crate::confint::{ConfidenceBand, ConfidenceEstimator};
use crate::kernel::Kernel;
use crate::regress::Regressor;

/// Rescales fitted proportions to sum to 1. Idempotent: vectors already
/// summing to 1 are fixed points.
pub fn renormalize(fitted: &Array1<f64>) -> Array1<f64> {
    fitted / fitted.sum()
}

/// The immutable estimate for one query date.
#[derive(Debug, Clone)]
pub struct DateEstimate {
    pub date: NaiveDate,
    /// Fitted variant proportions, renormalized when requested.
    pub fitted: Array1<f64>,
    /// The regressor's final objective value.
    pub loss: f64,
    pub band: ConfidenceBand,
}

/// One flattened output row, ready for CSV export or database upsert.
#[derive(Debug, Clone, Serialize)]
pub struct DeconvRecord {
    pub date: NaiveDate,
    pub location: String,
    pub variant: String,
    pub proportion: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Time-indexed table of fitted proportions, losses, and interval bounds.
/// Rows follow the distinct input dates in order of first occurrence;
/// columns follow `variant_names`.
#[derive(Debug, Clone)]
pub struct DeconvTable {
    pub dates: Vec<NaiveDate>,
    pub variant_names: Vec<String>,
    pub fitted: Array2<f64>,
    pub loss: Array1<f64>,
    pub lower: Array2<f64>,
    pub upper: Array2<f64>,
}

impl DeconvTable {
    /// Melts the table into long-format records for one location.
    pub fn records(&self, location: &str) -> Vec<DeconvRecord> {
        let mut records =
            Vec::with_capacity(self.dates.len() * self.variant_names.len());
        for (i, &date) in self.dates.iter().enumerate() {
            for (j, variant) in self.variant_names.iter().enumerate() {
                records.push(DeconvRecord {
                    date,
                    location: location.to_string(),
                    variant: variant.clone(),
                    proportion: self.fitted[[i, j]],
                    lower: self.lower[[i, j]],
                    upper: self.upper[[i, j]],
                });
            }
        }
        records
    }
}

/// Kernel deconvolution over one location's observations.
///
/// Holds the immutable design matrix, response, and date vectors together
/// with the configured kernel, regressor, and confidence estimator; each
/// call to [`deconv`](Self::deconv) is a pure function of those inputs.
pub struct KernelDeconv {
    x: Array2<f64>,
    y: Array1<f64>,
    dates: Vec<NaiveDate>,
    weights: Array1<f64>,
    variant_names: Vec<String>,
    kernel: Kernel,
    regressor: Regressor,
    confint: ConfidenceEstimator,
    min_tol: f64,
    renormalize: bool,
}

impl KernelDeconv {
    pub fn new(
        x: Array2<f64>,
        y: Array1<f64>,
        dates: Vec<NaiveDate>,
        variant_names: Vec<String>,
        kernel: Kernel,
        regressor: Regressor,
        confint: ConfidenceEstimator,
    ) -> Self {
        let n = y.len();
        Self {
            x,
            y,
            dates,
            weights: Array1::ones(n),
            variant_names,
            kernel,
            regressor,
            confint,
            min_tol: 1e-10,
            renormalize: true,
        }
    }

    /// External per-row weights, multiplied into the kernel values.
    pub fn with_weights(mut self, weights: Array1<f64>) -> Self {
        self.weights = weights;
        self
    }

    /// Kernel-weight threshold below which a row is excluded from the
    /// regression. Needed for correctness with kernels that produce exact
    /// zeros, not just as an optimization.
    pub fn with_min_tol(mut self, min_tol: f64) -> Self {
        self.min_tol = min_tol;
        self
    }

    pub fn with_renormalize(mut self, renormalize: bool) -> Self {
        self.renormalize = renormalize;
        self
    }

    /// Deconvolves the variant proportions at one query date.
    pub fn deconv(&self, date: NaiveDate) -> DateEstimate {
        let offsets = Array1::from_iter(
            self.dates
                .iter()
                .map(|d| date.signed_duration_since(*d).num_days() as f64),
        );
        let kvals = &self.kernel.values(0.0, &offsets) * &self.weights;

        let retained: Vec<usize> = (0..kvals.len())
            .filter(|&i| kvals[i] >= self.min_tol)
            .collect();
        let xs = self.x.select(Axis(0), &retained);
        let ys = Array1::from_iter(retained.iter().map(|&i| self.y[i]));
        let ks = Array1::from_iter(retained.iter().map(|&i| kvals[i]));

        let fit = self.regressor.fit(xs.view(), ys.view(), ks.view());
        let fitted = if self.renormalize {
            renormalize(&fit.fitted)
        } else {
            fit.fitted
        };

        let mut xw = xs;
        for (mut row, &k) in xw.axis_iter_mut(Axis(0)).zip(ks.iter()) {
            row *= k;
        }
        let band = self.confint.confint(
            xw.view(),
            fitted.view(),
            Some(ys.view()),
            Some(ks.view()),
        );

        DateEstimate {
            date,
            fitted,
            loss: fit.loss,
            band,
        }
    }

    /// Deconvolves every distinct date (in order of first occurrence) and
    /// assembles the parallel result tables.
    pub fn deconv_all(&self) -> DeconvTable {
        let distinct: Vec<NaiveDate> = self.dates.iter().copied().unique().collect();
        let n_cols = self.variant_names.len();
        let mut fitted = Array2::zeros((distinct.len(), n_cols));
        let mut loss = Array1::zeros(distinct.len());
        let mut lower = Array2::zeros((distinct.len(), n_cols));
        let mut upper = Array2::zeros((distinct.len(), n_cols));

        for (i, &date) in distinct.iter().enumerate() {
            let estimate = self.deconv(date);
            fitted.row_mut(i).assign(&estimate.fitted);
            loss[i] = estimate.loss;
            lower.row_mut(i).assign(&estimate.band.lower);
            upper.row_mut(i).assign(&estimate.band.upper);
        }

        DeconvTable {
            dates: distinct,
            variant_names: self.variant_names.clone(),
            fitted,
            loss,
            lower,
            upper,
        }
    }
}

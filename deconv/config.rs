//! Run configuration for the deconvolution pipeline.
//!
//! Every knob that the preprocessing, kernel, regression, and confidence
//! stages consume is declared here as a serde-derived struct so that a whole
//! run can be described by a single TOML file. The hard-coded mutation
//! blacklist and amplicon position windows are deliberately represented as a
//! data table (`MutationFilters`) rather than inline logic: the exclusion
//! rules encode known assay artifacts and get revised independently of the
//! filtering algorithm.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::confint::{ConfidenceEstimator, ConfintScale, OverdispersionMethod, WaldConfint};
use crate::kernel::Kernel;
use crate::regress::{Regressor, RobustLoss};

/// Errors raised while reading or writing a run configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Preprocessing options for turning raw tally rows into a design matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessConfig {
    /// Canonical names of the tracked variants, in design-matrix column
    /// order. The `undetermined` column is appended after these.
    pub variant_list: Vec<String>,
    /// Map from raw column codes (e.g. pangolin short codes) to canonical
    /// variant names. Must be injective: two codes mapping to the same
    /// canonical name would silently merge two signature columns.
    #[serde(default)]
    pub variant_rename: HashMap<String, String>,
    /// Variant columns dropped entirely from the input (absence tolerated).
    #[serde(default)]
    pub excluded_variants: Vec<String>,
    /// Categorical markers that exclude a row outright when found in a
    /// tracked variant column (rather than being coerced to 1).
    #[serde(default = "default_drop_markers")]
    pub drop_markers: Vec<String>,
    /// Keep only observations dated on or after this day.
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    /// Keep only observations dated strictly before this day.
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    /// Drop deletion rows (`base == "-"`).
    #[serde(default = "default_true")]
    pub remove_deletions: bool,
}

fn default_drop_markers() -> Vec<String> {
    vec!["subset".to_string(), "shared".to_string()]
}

fn default_true() -> bool {
    true
}

/// Which kernel family weights observations by distance from the query date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelKind {
    Gaussian,
    Box,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    #[serde(default = "default_kernel_kind")]
    pub kind: KernelKind,
    /// Time-scale parameter, in days.
    #[serde(default = "default_bandwidth")]
    pub bandwidth: f64,
}

fn default_kernel_kind() -> KernelKind {
    KernelKind::Gaussian
}

fn default_bandwidth() -> f64 {
    10.0
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            kind: default_kernel_kind(),
            bandwidth: default_bandwidth(),
        }
    }
}

impl KernelConfig {
    pub fn build(&self) -> Kernel {
        match self.kind {
            KernelKind::Gaussian => Kernel::Gaussian {
                bandwidth: self.bandwidth,
            },
            KernelKind::Box => Kernel::Box {
                bandwidth: self.bandwidth,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegressorKind {
    Nnls,
    Robust,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressorConfig {
    #[serde(default = "default_regressor_kind")]
    pub kind: RegressorKind,
    #[serde(default = "default_robust_loss")]
    pub robust_loss: RobustLoss,
    /// Soft-L1 transition scale: residuals well below this behave
    /// quadratically, residuals above it linearly.
    #[serde(default = "default_robust_scale")]
    pub robust_scale: f64,
}

fn default_regressor_kind() -> RegressorKind {
    RegressorKind::Nnls
}

fn default_robust_loss() -> RobustLoss {
    RobustLoss::SoftL1
}

fn default_robust_scale() -> f64 {
    0.1
}

impl Default for RegressorConfig {
    fn default() -> Self {
        Self {
            kind: default_regressor_kind(),
            robust_loss: default_robust_loss(),
            robust_scale: default_robust_scale(),
        }
    }
}

impl RegressorConfig {
    pub fn build(&self) -> Regressor {
        match self.kind {
            RegressorKind::Nnls => Regressor::Nnls,
            RegressorKind::Robust => Regressor::Robust {
                loss: self.robust_loss,
                f_scale: self.robust_scale,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfintKind {
    /// Disable interval computation; NaN bands are emitted so call sites
    /// never need to branch.
    Null,
    Wald,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfintConfig {
    #[serde(default = "default_confint_kind")]
    pub kind: ConfintKind,
    /// Two-sided confidence level, in (0, 1).
    #[serde(default = "default_level")]
    pub level: f64,
    #[serde(default = "default_scale")]
    pub scale: ConfintScale,
    /// Regularizer keeping fitted Bernoulli probabilities away from 0 and 1.
    #[serde(default = "default_pseudo_fraction")]
    pub pseudo_fraction: f64,
    /// Apply the quasi-binomial overdispersion correction to the standard
    /// errors.
    #[serde(default)]
    pub overdispersion: bool,
    #[serde(default = "default_overdispersion_method")]
    pub overdispersion_method: OverdispersionMethod,
}

fn default_confint_kind() -> ConfintKind {
    ConfintKind::Wald
}

fn default_level() -> f64 {
    0.95
}

fn default_scale() -> ConfintScale {
    ConfintScale::Linear
}

fn default_pseudo_fraction() -> f64 {
    0.001
}

fn default_overdispersion_method() -> OverdispersionMethod {
    OverdispersionMethod::All
}

impl Default for ConfintConfig {
    fn default() -> Self {
        Self {
            kind: default_confint_kind(),
            level: default_level(),
            scale: default_scale(),
            pseudo_fraction: default_pseudo_fraction(),
            overdispersion: false,
            overdispersion_method: default_overdispersion_method(),
        }
    }
}

impl ConfintConfig {
    pub fn build(&self) -> ConfidenceEstimator {
        match self.kind {
            ConfintKind::Null => ConfidenceEstimator::Null,
            ConfintKind::Wald => ConfidenceEstimator::Wald(WaldConfint {
                level: self.level,
                scale: self.scale,
                pseudo_fraction: self.pseudo_fraction,
                overdispersion: self.overdispersion.then_some(self.overdispersion_method),
            }),
        }
    }
}

/// One amplicon/position exclusion window: observations at positions inside
/// `[pos_min, pos_max]` dated strictly after `start_date` are dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRule {
    pub start_date: NaiveDate,
    pub pos_min: i64,
    pub pos_max: i64,
}

/// Versioned table of known-problematic mutations and genomic windows.
///
/// The defaults reproduce the curated list used in production: three
/// recurring artifact mutations plus the amplicon dropout windows that
/// appeared once Omicron-era primers cut over (dated 2021-11-20).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationFilters {
    /// Mutation signatures (`{position}{base}`) removed together with their
    /// complement rows.
    #[serde(default)]
    pub signatures: Vec<String>,
    #[serde(default)]
    pub position_rules: Vec<PositionRule>,
}

impl Default for MutationFilters {
    fn default() -> Self {
        let cutover = NaiveDate::from_ymd_opt(2021, 11, 20).unwrap();
        let window = |pos_min: i64, pos_max: i64| PositionRule {
            start_date: cutover,
            pos_min,
            pos_max,
        };
        Self {
            signatures: vec![
                "28461G".to_string(),
                "11201G".to_string(),
                "26801C".to_string(),
            ],
            position_rules: vec![
                window(22428, 22785), // amplicon 75
                window(22677, 23028), // amplicon 76
                window(22974, 23327), // amplicon 77
                window(26277, 26635), // amplicon 88
                window(26895, 27256), // amplicon 90
                window(26709, 26709),
                window(27807, 27807),
                window(2832, 2832),
                window(10449, 10449),
            ],
        }
    }
}

/// The complete blueprint of a deconvolution run, loadable from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeconvConfig {
    /// Sampling locations to deconvolve. Empty means every location found
    /// in the tally.
    #[serde(default)]
    pub locations: Vec<String>,
    pub preprocess: PreprocessConfig,
    #[serde(default)]
    pub kernel: KernelConfig,
    #[serde(default)]
    pub regressor: RegressorConfig,
    #[serde(default)]
    pub confint: ConfintConfig,
    #[serde(default)]
    pub filters: MutationFilters,
    /// Rows whose kernel weight falls below this threshold are excluded
    /// from the per-date regression.
    #[serde(default = "default_min_tol")]
    pub min_tol: f64,
    /// Rescale fitted proportions to sum to 1 at each date.
    #[serde(default = "default_true")]
    pub renormalize: bool,
}

fn default_min_tol() -> f64 {
    1e-10
}

impl DeconvConfig {
    /// Loads a run configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: DeconvConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Saves the configuration back to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            [preprocess]
            variant_list = ["B.1.1.7", "BA.1"]

            [preprocess.variant_rename]
            al = "B.1.1.7"
            om1 = "BA.1"

            [kernel]
            kind = "box"
            bandwidth = 2.0

            [confint]
            scale = "logit"
            overdispersion = true
            overdispersion_method = "strat"
        "#
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config: DeconvConfig = toml::from_str(minimal_toml()).unwrap();
        assert_eq!(config.preprocess.variant_list.len(), 2);
        assert_eq!(config.preprocess.drop_markers, vec!["subset", "shared"]);
        assert!(config.preprocess.remove_deletions);
        assert_eq!(config.kernel.kind, KernelKind::Box);
        assert_eq!(config.regressor.kind, RegressorKind::Nnls);
        assert_eq!(config.confint.scale, ConfintScale::Logit);
        assert_eq!(
            config.confint.overdispersion_method,
            OverdispersionMethod::Strat
        );
        assert_eq!(config.min_tol, 1e-10);
        assert!(config.renormalize);
    }

    #[test]
    fn default_filters_carry_curated_rules() {
        let filters = MutationFilters::default();
        assert_eq!(filters.signatures, vec!["28461G", "11201G", "26801C"]);
        assert_eq!(filters.position_rules.len(), 9);
        let cutover = NaiveDate::from_ymd_opt(2021, 11, 20).unwrap();
        assert!(filters.position_rules.iter().all(|r| r.start_date == cutover));
        assert_eq!(filters.position_rules[0].pos_min, 22428);
        assert_eq!(filters.position_rules[0].pos_max, 22785);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config: DeconvConfig = toml::from_str(minimal_toml()).unwrap();
        let rendered = toml::to_string_pretty(&config).unwrap();
        let reparsed: DeconvConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(
            reparsed.preprocess.variant_list,
            config.preprocess.variant_list
        );
        assert_eq!(reparsed.kernel.bandwidth, config.kernel.bandwidth);
        assert_eq!(reparsed.filters.position_rules.len(), 9);
    }
}

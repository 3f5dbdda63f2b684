//! # Tally Loading and Preprocessing Module
//!
//! This module is the exclusive entry point for raw mutation tally data. It
//! reads the tab-separated tally of per-mutation frequencies, validates and
//! normalizes the variant signature columns against the run configuration,
//! and transforms the surviving records into the clean `ndarray` design
//! matrix and response vector consumed by the deconvolution engine.
//!
//! - Configuration errors (a non-injective variant rename map) fail hard:
//!   two raw codes collapsing onto one canonical column would silently merge
//!   two signatures.
//! - Data-quality problems (a configured variant absent from the tally
//!   columns) are logged as warnings and tolerated.
//! - Signature membership cells may be numeric 0/1, a categorical marker, or
//!   missing; rows carrying an exclusion marker are removed outright, the
//!   remaining markers are bluntly normalized to 1 and gaps to 0.

use chrono::NaiveDate;
use itertools::Itertools;
use ndarray::{Array1, Array2};
use polars::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

use crate::config::{MutationFilters, PreprocessConfig};

/// Name of the slack column capturing signal not attributable to any
/// tracked variant. Always the LAST design-matrix column; the stratified
/// overdispersion correction relies on that position.
pub const UNDETERMINED: &str = "undetermined";

/// Categorical markers that count as "mutation belongs to this signature"
/// after the exclusion pass has already removed the rows where a marker
/// means "drop".
const POSITIVE_MARKERS: [&str; 5] = ["extra", "mut", "shared", "revert", "subset"];

/// A comprehensive error type for tally loading and preprocessing failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the tally file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The required column '{column_name}' could not be converted to the expected type '{expected_type}'."
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
    },
    #[error(
        "Variant rename map is not injective: two raw codes map to '{0}'. This would silently merge two signature columns."
    )]
    DuplicateRenameTarget(String),
    #[error("Could not parse '{0}' as an ISO date (expected YYYY-MM-DD).")]
    InvalidDate(String),
}

/// One retained observation: a mutation's observed frequency at a location
/// and date, with its 0/1 variant-signature membership.
///
/// `membership` is aligned with [`TallyTable::variant_names`]: one slot per
/// tracked variant plus the trailing `undetermined` slot.
#[derive(Debug, Clone, PartialEq)]
pub struct TallyRow {
    /// Mutation signature, `{position}{base}`; complement rows carry a `-`
    /// prefix.
    pub mutation: String,
    pub position: i64,
    pub base: String,
    pub date: NaiveDate,
    pub location: String,
    /// Observed frequency of this mutation in the pooled sample, in [0, 1].
    pub frac: f64,
    pub membership: Vec<f64>,
}

impl TallyRow {
    /// Synthesizes the "this mutation is absent" counterpart of this row:
    /// the frequency reflects to `1 - frac`, every tracked membership bit
    /// flips, and the undetermined slot is raised.
    ///
    /// On tracked bits and `frac` the operation is an involution; the
    /// undetermined slot is one-way (a complement's complement still carries
    /// `undetermined = 1`).
    pub fn complement(&self, n_tracked: usize) -> TallyRow {
        let mut membership: Vec<f64> = self
            .membership
            .iter()
            .take(n_tracked)
            .map(|&bit| 1.0 - bit)
            .collect();
        membership.push(1.0);
        TallyRow {
            mutation: format!("-{}", self.mutation),
            position: self.position,
            base: self.base.clone(),
            date: self.date,
            location: self.location.clone(),
            frac: 1.0 - self.frac,
            membership,
        }
    }
}

/// The preprocessed tally: immutable observation rows (originals followed by
/// their complements) plus the design-matrix column names.
#[derive(Debug, Clone)]
pub struct TallyTable {
    /// Tracked variant names in column order, with [`UNDETERMINED`] last.
    pub variant_names: Vec<String>,
    pub rows: Vec<TallyRow>,
}

impl TallyTable {
    /// Number of tracked variants (excluding the undetermined column).
    pub fn n_tracked(&self) -> usize {
        self.variant_names.len() - 1
    }

    /// Distinct sampling locations in order of first appearance.
    pub fn locations(&self) -> Vec<String> {
        self.rows
            .iter()
            .map(|r| r.location.clone())
            .unique()
            .collect()
    }

    /// Removes known-problematic mutations (and their complements) and rows
    /// whose genomic position falls inside a configured exclusion window
    /// strictly after that window's cutover date.
    pub fn filter_mutations(&mut self, filters: &MutationFilters) {
        let banned: HashSet<String> = filters
            .signatures
            .iter()
            .flat_map(|sig| [sig.clone(), format!("-{sig}")])
            .collect();
        self.rows.retain(|row| {
            if banned.contains(&row.mutation) {
                return false;
            }
            !filters.position_rules.iter().any(|rule| {
                row.date > rule.start_date
                    && row.position >= rule.pos_min
                    && row.position <= rule.pos_max
            })
        });
    }

    /// Assembles the design matrix, response vector, and date vector for
    /// one sampling location.
    pub fn design_matrix(&self, location: &str) -> (Array2<f64>, Array1<f64>, Vec<NaiveDate>) {
        let rows: Vec<&TallyRow> = self
            .rows
            .iter()
            .filter(|r| r.location == location)
            .collect();
        let n_cols = self.variant_names.len();
        let x = Array2::from_shape_fn((rows.len(), n_cols), |(i, j)| rows[i].membership[j]);
        let y = Array1::from_iter(rows.iter().map(|r| r.frac));
        let dates = rows.iter().map(|r| r.date).collect();
        (x, y, dates)
    }
}

/// Loads the raw tally TSV into a DataFrame.
pub fn load_tally(path: &Path) -> Result<DataFrame, DataError> {
    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
        )
        .finish()?;
    Ok(df)
}

/// Runs the full preprocessing pass over a raw tally.
///
/// The steps, in order: rename raw variant codes to canonical names (hard
/// error on a non-injective map), resolve tracked signature columns (warning
/// when absent), drop rows with missing `frac`/`date`, derive the mutation
/// signature string, parse and window the dates, optionally drop deletions,
/// remove rows flagged with an exclusion marker, normalize the remaining
/// membership cells to 0/1, drop uninformative rows (membership in no
/// tracked variant, or in all of them), and finally append the complement of
/// every surviving row with the `undetermined` indicator raised.
pub fn preprocess(df: &DataFrame, config: &PreprocessConfig) -> Result<TallyTable, DataError> {
    // A non-injective rename map is data corruption waiting to happen.
    let mut targets = HashSet::new();
    for target in config.variant_rename.values() {
        if !targets.insert(target.as_str()) {
            return Err(DataError::DuplicateRenameTarget(target.clone()));
        }
    }

    let columns: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|c| c.to_string())
        .collect();
    fn canonical_name<'a>(config: &'a PreprocessConfig, raw: &'a str) -> &'a str {
        config
            .variant_rename
            .get(raw)
            .map(String::as_str)
            .unwrap_or(raw)
    }

    let tracked: Vec<&String> = config
        .variant_list
        .iter()
        .filter(|v| !config.excluded_variants.contains(*v))
        .collect();

    // Resolve each tracked variant to the raw column that renames onto it.
    let mut variant_columns: Vec<Option<Vec<Option<String>>>> = Vec::with_capacity(tracked.len());
    for variant in &tracked {
        let source = columns
            .iter()
            .find(|c| canonical_name(config, c.as_str()) == variant.as_str());
        match source {
            Some(raw) => variant_columns.push(Some(string_column(df, raw)?)),
            None => {
                log::warn!("variant '{variant}' is not present in the tally columns; its memberships default to 0");
                variant_columns.push(None);
            }
        }
    }

    let position_col = resolve_column(&columns, &["position", "pos"])?;
    let location_col = resolve_column(&columns, &["location", "plantname"])?;
    let positions = int_column(df, &position_col)?;
    let bases = string_column(df, "base")?;
    let dates = string_column(df, "date")?;
    let locations = string_column(df, &location_col)?;
    let fracs = float_column(df, "frac")?;

    let n_tracked = tracked.len();
    let mut rows = Vec::new();
    'row: for i in 0..df.height() {
        // Rows without an estimated fraction or a date carry no evidence.
        let Some(frac) = fracs[i] else { continue };
        let Some(date_str) = dates[i].as_deref() else {
            continue;
        };
        let date = NaiveDate::parse_from_str(date_str, "%Y-%m-%d")
            .map_err(|_| DataError::InvalidDate(date_str.to_string()))?;
        if let Some(start) = config.start_date {
            if date < start {
                continue;
            }
        }
        if let Some(end) = config.end_date {
            if date >= end {
                continue;
            }
        }
        let Some(position) = positions[i] else { continue };
        let base = bases[i].clone().unwrap_or_default();
        if config.remove_deletions && base == "-" {
            continue;
        }

        let mut membership = Vec::with_capacity(n_tracked + 1);
        for column in &variant_columns {
            let cell = column.as_ref().and_then(|col| col[i].as_deref());
            match classify_membership(cell, &config.drop_markers) {
                Membership::Drop => continue 'row,
                Membership::Value(v) => membership.push(v),
            }
        }

        // Rows belonging to no tracked variant or to all of them cannot
        // discriminate between the proportions.
        let row_sum: f64 = membership.iter().sum();
        if row_sum == 0.0 || row_sum == n_tracked as f64 {
            continue;
        }

        membership.push(0.0); // undetermined
        rows.push(TallyRow {
            mutation: format!("{position}{base}"),
            position,
            base,
            date,
            location: locations[i].clone().unwrap_or_default(),
            frac,
            membership,
        });
    }

    // Absence evidence: every retained observation also tells us which
    // signatures the mutation does NOT belong to.
    let complements: Vec<TallyRow> = rows.iter().map(|r| r.complement(n_tracked)).collect();
    rows.extend(complements);

    let mut variant_names: Vec<String> = tracked.iter().map(|v| v.to_string()).collect();
    variant_names.push(UNDETERMINED.to_string());

    Ok(TallyTable {
        variant_names,
        rows,
    })
}

enum Membership {
    Drop,
    Value(f64),
}

/// Normalizes one signature cell. Missing and unknown values become 0,
/// numeric values pass through, positive markers become 1, and exclusion
/// markers reject the whole row.
fn classify_membership(cell: Option<&str>, drop_markers: &[String]) -> Membership {
    let Some(raw) = cell else {
        return Membership::Value(0.0);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Membership::Value(0.0);
    }
    if let Ok(v) = raw.parse::<f64>() {
        return Membership::Value(v);
    }
    if drop_markers.iter().any(|m| m == raw) {
        return Membership::Drop;
    }
    if POSITIVE_MARKERS.contains(&raw) {
        return Membership::Value(1.0);
    }
    Membership::Value(0.0)
}

fn resolve_column(columns: &[String], candidates: &[&str]) -> Result<String, DataError> {
    candidates
        .iter()
        .find(|c| columns.iter().any(|col| col.as_str() == **c))
        .map(|c| c.to_string())
        .ok_or_else(|| DataError::ColumnNotFound(candidates[0].to_string()))
}

fn string_column(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>, DataError> {
    let casted = df
        .column(name)?
        .cast(&DataType::String)
        .map_err(|_| DataError::ColumnWrongType {
            column_name: name.to_string(),
            expected_type: "string",
        })?;
    Ok(casted
        .str()?
        .rechunk()
        .into_iter()
        .map(|opt| opt.map(|s| s.to_string()))
        .collect())
}

fn float_column(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>, DataError> {
    let casted = df
        .column(name)?
        .cast(&DataType::Float64)
        .map_err(|_| DataError::ColumnWrongType {
            column_name: name.to_string(),
            expected_type: "f64 (numeric)",
        })?;
    Ok(casted.f64()?.rechunk().into_iter().collect())
}

fn int_column(df: &DataFrame, name: &str) -> Result<Vec<Option<i64>>, DataError> {
    let casted = df
        .column(name)?
        .cast(&DataType::Int64)
        .map_err(|_| DataError::ColumnWrongType {
            column_name: name.to_string(),
            expected_type: "i64 (integer)",
        })?;
    Ok(casted.i64()?.rechunk().into_iter().collect())
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PositionRule;
    use approx::assert_abs_diff_eq;
    use std::collections::HashMap;

    fn test_config() -> PreprocessConfig {
        PreprocessConfig {
            variant_list: vec!["B.1.1.7".to_string(), "BA.1".to_string()],
            variant_rename: HashMap::from([
                ("al".to_string(), "B.1.1.7".to_string()),
                ("om1".to_string(), "BA.1".to_string()),
            ]),
            excluded_variants: vec![],
            drop_markers: vec!["subset".to_string(), "shared".to_string()],
            start_date: None,
            end_date: None,
            remove_deletions: true,
        }
    }

    fn test_frame() -> DataFrame {
        df!(
            "pos" => [241i64, 3037, 23403, 28461, 11201, 21765],
            "base" => ["T", "T", "G", "G", "G", "-"],
            "date" => ["2021-11-01", "2021-11-01", "2021-11-02", "2021-11-02", "2021-11-03", "2021-11-03"],
            "plantname" => ["Zurich", "Zurich", "Zurich", "Geneva", "Geneva", "Geneva"],
            "frac" => [Some(0.25), Some(0.5), None, Some(0.75), Some(0.1), Some(0.9)],
            "al" => ["1", "0", "extra", "1", "0", "1"],
            "om1" => ["0", "1", "1", "0", "mut", "0"],
        )
        .unwrap()
    }

    #[test]
    fn preprocess_builds_rows_and_complements() {
        let table = preprocess(&test_frame(), &test_config()).unwrap();
        assert_eq!(
            table.variant_names,
            vec!["B.1.1.7", "BA.1", UNDETERMINED]
        );
        // Row 2 is dropped (missing frac), row 5 is a deletion; rows 0, 1,
        // 3, 4 survive and each gains a complement.
        assert_eq!(table.rows.len(), 8);
        let first = &table.rows[0];
        assert_eq!(first.mutation, "241T");
        assert_eq!(first.membership, vec![1.0, 0.0, 0.0]);
        assert_abs_diff_eq!(first.frac, 0.25);
        // Positive markers normalize to 1.
        let marker_row = &table.rows[3];
        assert_eq!(marker_row.mutation, "11201G");
        assert_eq!(marker_row.membership, vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn complement_reflects_frac_and_flips_bits() {
        let table = preprocess(&test_frame(), &test_config()).unwrap();
        let original = &table.rows[0];
        let complement = &table.rows[4];
        assert_eq!(complement.mutation, "-241T");
        assert_abs_diff_eq!(complement.frac, 1.0 - original.frac);
        assert_eq!(complement.membership, vec![0.0, 1.0, 1.0]);
    }

    #[test]
    fn complement_is_involutive_except_undetermined() {
        let table = preprocess(&test_frame(), &test_config()).unwrap();
        let original = &table.rows[0];
        let twice = original.complement(2).complement(2);
        assert_abs_diff_eq!(twice.frac, original.frac);
        assert_eq!(twice.membership[..2], original.membership[..2]);
        // One-way synthesis: the undetermined slot stays raised.
        assert_abs_diff_eq!(twice.membership[2], 1.0);
    }

    #[test]
    fn duplicate_rename_target_is_a_hard_error() {
        let mut config = test_config();
        config
            .variant_rename
            .insert("alpha_again".to_string(), "B.1.1.7".to_string());
        let err = preprocess(&test_frame(), &config).unwrap_err();
        match err {
            DataError::DuplicateRenameTarget(target) => assert_eq!(target, "B.1.1.7"),
            other => panic!("Expected DuplicateRenameTarget, got {other:?}"),
        }
    }

    #[test]
    fn absent_variant_column_defaults_to_zero_membership() {
        let mut config = test_config();
        config.variant_list.push("P.1".to_string());
        let table = preprocess(&test_frame(), &config).unwrap();
        assert_eq!(table.variant_names, vec!["B.1.1.7", "BA.1", "P.1", UNDETERMINED]);
        for row in table.rows.iter().take(table.rows.len() / 2) {
            assert_abs_diff_eq!(row.membership[2], 0.0);
        }
    }

    #[test]
    fn drop_marker_removes_the_row_entirely() {
        let df = df!(
            "pos" => [100i64, 200],
            "base" => ["A", "C"],
            "date" => ["2021-06-01", "2021-06-01"],
            "plantname" => ["Zurich", "Zurich"],
            "frac" => [Some(0.4), Some(0.6)],
            "al" => ["subset", "1"],
            "om1" => ["1", "0"],
        )
        .unwrap();
        let table = preprocess(&df, &test_config()).unwrap();
        // The "subset" row is excluded, not coerced to 1.
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].mutation, "200C");
    }

    #[test]
    fn date_window_is_half_open() {
        let mut config = test_config();
        config.start_date = NaiveDate::from_ymd_opt(2021, 11, 2);
        config.end_date = NaiveDate::from_ymd_opt(2021, 11, 3);
        let table = preprocess(&test_frame(), &config).unwrap();
        // Only 2021-11-02 rows with a frac survive: 28461G (+ complement).
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].mutation, "28461G");
    }

    #[test]
    fn uninformative_rows_are_dropped() {
        let df = df!(
            "pos" => [100i64, 200, 300],
            "base" => ["A", "C", "T"],
            "date" => ["2021-06-01", "2021-06-01", "2021-06-01"],
            "plantname" => ["Zurich", "Zurich", "Zurich"],
            "frac" => [Some(0.4), Some(0.6), Some(0.5)],
            "al" => ["0", "1", "1"],
            "om1" => ["0", "1", "0"],
        )
        .unwrap();
        let table = preprocess(&df, &test_config()).unwrap();
        // Row 0 belongs to no variant, row 1 to all of them; only row 2
        // discriminates.
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].mutation, "300T");
    }

    #[test]
    fn filter_mutations_removes_signatures_and_their_complements() {
        let mut table = preprocess(&test_frame(), &test_config()).unwrap();
        assert!(table.rows.iter().any(|r| r.mutation == "28461G"));
        table.filter_mutations(&MutationFilters::default());
        assert!(table.rows.iter().all(|r| r.mutation != "28461G"));
        assert!(table.rows.iter().all(|r| r.mutation != "-28461G"));
        assert!(table.rows.iter().all(|r| r.mutation != "11201G"));
    }

    #[test]
    fn position_rules_only_apply_after_the_cutover_date() {
        let df = df!(
            "pos" => [22500i64, 22500],
            "base" => ["A", "A"],
            "date" => ["2021-11-19", "2021-11-25"],
            "plantname" => ["Zurich", "Zurich"],
            "frac" => [Some(0.4), Some(0.4)],
            "al" => ["1", "1"],
            "om1" => ["0", "0"],
        )
        .unwrap();
        let mut table = preprocess(&df, &test_config()).unwrap();
        table.filter_mutations(&MutationFilters {
            signatures: vec![],
            position_rules: vec![PositionRule {
                start_date: NaiveDate::from_ymd_opt(2021, 11, 20).unwrap(),
                pos_min: 22428,
                pos_max: 22785,
            }],
        });
        // The pre-cutover observation survives (with complement); the
        // post-cutover one is masked.
        assert_eq!(table.rows.len(), 2);
        assert_eq!(
            table.rows[0].date,
            NaiveDate::from_ymd_opt(2021, 11, 19).unwrap()
        );
    }

    #[test]
    fn design_matrix_subsets_by_location() {
        let table = preprocess(&test_frame(), &test_config()).unwrap();
        assert_eq!(table.locations(), vec!["Zurich", "Geneva"]);
        let (x, y, dates) = table.design_matrix("Zurich");
        // 2 original rows + 2 complements.
        assert_eq!(x.shape(), &[4, 3]);
        assert_eq!(y.len(), 4);
        assert_eq!(dates.len(), 4);
        // Originals come before complements; undetermined column is 0 then 1.
        assert_abs_diff_eq!(x[[0, 2]], 0.0);
        assert_abs_diff_eq!(x[[2, 2]], 1.0);
        assert_abs_diff_eq!(y[0], 0.25);
        assert_abs_diff_eq!(y[2], 0.75);
    }

    #[test]
    fn load_tally_reads_tab_separated_files() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "pos\tbase\tdate\tplantname\tfrac\tal\tom1").unwrap();
        writeln!(file, "241\tT\t2021-11-01\tZurich\t0.25\t1\t0").unwrap();
        writeln!(file, "3037\tT\t2021-11-01\tZurich\t0.5\t0\t1").unwrap();
        file.flush().unwrap();
        let df = load_tally(file.path()).unwrap();
        assert_eq!(df.height(), 2);
        let table = preprocess(&df, &test_config()).unwrap();
        assert_eq!(table.rows.len(), 4);
    }
}

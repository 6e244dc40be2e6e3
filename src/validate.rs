//! Tolerance-based comparison of a produced table against a reference.
//!
//! A cell matches when `|p - r| <= abs` **or** `|p - r| <= rel * |r|`. The
//! comparison never stops early: every value and structural mismatch is
//! reported so the report can be used for debugging on its own.

use crate::{
    classify::Role,
    table::{Row, Table},
};
use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    pub abs: f64,
    pub rel: f64,
}

impl Tolerance {
    pub fn new(abs: f64, rel: f64) -> Result<Self> {
        for (name, v) in [("absolute", abs), ("relative", rel)] {
            if !v.is_finite() || v < 0.0 {
                bail!("{name} tolerance must be a finite, non-negative number (got {v})");
            }
        }
        Ok(Self { abs, rel })
    }

    /// Both tolerances are required whenever one is needed; there is no zero default.
    pub fn from_options(abs: Option<f64>, rel: Option<f64>) -> Result<Self> {
        match (abs, rel) {
            (Some(a), Some(r)) => Self::new(a, r),
            _ => bail!("both absolute and relative tolerances must be supplied"),
        }
    }

    pub fn matches(&self, reference: f64, produced: f64) -> bool {
        if reference.is_nan() || produced.is_nan() {
            return reference.is_nan() && produced.is_nan();
        }
        if reference == produced {
            return true;
        }
        // Infinities only match the identical infinity.
        if reference.is_infinite() || produced.is_infinite() {
            return false;
        }
        let diff = (produced - reference).abs();
        diff <= self.abs || diff <= self.rel * reference.abs()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Reference,
    Produced,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mismatch {
    Value {
        row: String,
        column: String,
        reference: f64,
        produced: f64,
        abs_deviation: f64,
        /// Absent when the reference value is zero or infinite.
        rel_deviation: Option<f64>,
    },
    /// Row key present only on `present_in`.
    MissingRow { row: String, present_in: Side },
    /// Column present only on `present_in`.
    MissingColumn { column: String, present_in: Side },
    /// Shared row and column, but only `present_in` has a value.
    MissingCell {
        row: String,
        column: String,
        present_in: Side,
    },
}

impl Mismatch {
    pub fn is_structural(&self) -> bool {
        !matches!(self, Mismatch::Value { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationResult {
    Passed,
    Failed,
    /// No reference was supplied.
    Skipped,
    /// A reference was supplied but nothing was converted to compare against.
    SkippedNoTargets,
    DownloadFailed,
    /// The reference downloaded but is not a readable canonical table.
    Error,
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValidationResult::Passed => "passed",
            ValidationResult::Failed => "failed",
            ValidationResult::Skipped => "skipped",
            ValidationResult::SkippedNoTargets => "skipped_no_targets",
            ValidationResult::DownloadFailed => "download_failed",
            ValidationResult::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub result: ValidationResult,
    pub tolerance: Tolerance,
    pub reference_rows: usize,
    pub produced_rows: usize,
    pub compared_cells: usize,
    pub value_mismatches: usize,
    pub structural_mismatches: usize,
    pub mismatches: Vec<Mismatch>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.result == ValidationResult::Passed
    }

    pub fn summary(&self, columns: usize) -> String {
        if self.passed() {
            format!("matched {} rows x {} columns", self.reference_rows, columns)
        } else {
            format!(
                "{} value mismatches, {} structural mismatches over {} rows x {} columns",
                self.value_mismatches, self.structural_mismatches, self.reference_rows, columns
            )
        }
    }

    /// Flat CSV of every mismatch, one per line.
    pub fn mismatches_csv(&self) -> Result<Vec<u8>> {
        let mut wtr = csv::Writer::from_writer(Vec::new());
        wtr.write_record([
            "kind",
            "row",
            "column",
            "reference",
            "produced",
            "abs_deviation",
            "rel_deviation",
            "present_in",
        ])?;
        for m in &self.mismatches {
            let rec: [String; 8] = match m {
                Mismatch::Value {
                    row,
                    column,
                    reference,
                    produced,
                    abs_deviation,
                    rel_deviation,
                } => [
                    "value".into(),
                    row.clone(),
                    column.clone(),
                    reference.to_string(),
                    produced.to_string(),
                    abs_deviation.to_string(),
                    rel_deviation.map(|v| v.to_string()).unwrap_or_default(),
                    String::new(),
                ],
                Mismatch::MissingRow { row, present_in } => [
                    "missing_row".into(),
                    row.clone(),
                    String::new(),
                    String::new(),
                    String::new(),
                    String::new(),
                    String::new(),
                    side_str(*present_in).into(),
                ],
                Mismatch::MissingColumn { column, present_in } => [
                    "missing_column".into(),
                    String::new(),
                    column.clone(),
                    String::new(),
                    String::new(),
                    String::new(),
                    String::new(),
                    side_str(*present_in).into(),
                ],
                Mismatch::MissingCell {
                    row,
                    column,
                    present_in,
                } => [
                    "missing_cell".into(),
                    row.clone(),
                    column.clone(),
                    String::new(),
                    String::new(),
                    String::new(),
                    String::new(),
                    side_str(*present_in).into(),
                ],
            };
            wtr.write_record(&rec)?;
        }
        wtr.into_inner()
            .map_err(|e| anyhow::anyhow!("flushing mismatch CSV: {e}"))
    }
}

fn side_str(s: Side) -> &'static str {
    match s {
        Side::Reference => "reference",
        Side::Produced => "produced",
    }
}

/// Picks the table to validate: output series first, then input series.
pub fn choose_target<T>(input_series: Option<T>, output_series: Option<T>) -> Option<(Role, T)> {
    output_series
        .map(|t| (Role::OutputSeries, t))
        .or_else(|| input_series.map(|t| (Role::InputSeries, t)))
}

pub fn compare(reference: &Table, produced: &Table, tol: Tolerance) -> ValidationReport {
    let mut mismatches = Vec::new();

    let produced_cols: BTreeSet<&str> = produced.columns.iter().map(String::as_str).collect();
    let reference_cols: BTreeSet<&str> = reference.columns.iter().map(String::as_str).collect();

    for c in &reference.columns {
        if !produced_cols.contains(c.as_str()) {
            mismatches.push(Mismatch::MissingColumn {
                column: c.clone(),
                present_in: Side::Reference,
            });
        }
    }
    for c in &produced.columns {
        if !reference_cols.contains(c.as_str()) {
            mismatches.push(Mismatch::MissingColumn {
                column: c.clone(),
                present_in: Side::Produced,
            });
        }
    }

    let shared: Vec<&str> = reference
        .columns
        .iter()
        .map(String::as_str)
        .filter(|c| produced_cols.contains(c))
        .collect();

    let produced_rows: HashMap<&str, &Row> = produced
        .rows
        .iter()
        .map(|r| (r.timestamp.as_str(), r))
        .collect();
    let reference_keys: BTreeSet<&str> =
        reference.rows.iter().map(|r| r.timestamp.as_str()).collect();

    let mut value_rows = Vec::new();
    for r in &reference.rows {
        match produced_rows.get(r.timestamp.as_str()) {
            Some(p) => value_rows.push((r, *p)),
            None => mismatches.push(Mismatch::MissingRow {
                row: r.timestamp.clone(),
                present_in: Side::Reference,
            }),
        }
    }
    for p in &produced.rows {
        if !reference_keys.contains(p.timestamp.as_str()) {
            mismatches.push(Mismatch::MissingRow {
                row: p.timestamp.clone(),
                present_in: Side::Produced,
            });
        }
    }

    let mut compared_cells = 0;
    for (r, p) in value_rows {
        for &col in &shared {
            match (r.values.get(col), p.values.get(col)) {
                (Some(&rv), Some(&pv)) => {
                    compared_cells += 1;
                    if !tol.matches(rv, pv) {
                        mismatches.push(value_mismatch(&r.timestamp, col, rv, pv));
                    }
                }
                (Some(_), None) => mismatches.push(Mismatch::MissingCell {
                    row: r.timestamp.clone(),
                    column: col.to_string(),
                    present_in: Side::Reference,
                }),
                (None, Some(_)) => mismatches.push(Mismatch::MissingCell {
                    row: r.timestamp.clone(),
                    column: col.to_string(),
                    present_in: Side::Produced,
                }),
                (None, None) => {}
            }
        }
    }

    let structural_mismatches = mismatches.iter().filter(|m| m.is_structural()).count();
    let value_mismatches = mismatches.len() - structural_mismatches;
    let result = if mismatches.is_empty() {
        ValidationResult::Passed
    } else {
        ValidationResult::Failed
    };

    ValidationReport {
        result,
        tolerance: tol,
        reference_rows: reference.rows.len(),
        produced_rows: produced.rows.len(),
        compared_cells,
        value_mismatches,
        structural_mismatches,
        mismatches,
    }
}

fn value_mismatch(row: &str, column: &str, reference: f64, produced: f64) -> Mismatch {
    let abs_deviation = (produced - reference).abs();
    let rel_deviation =
        (reference != 0.0 && reference.is_finite()).then(|| abs_deviation / reference.abs());
    Mismatch::Value {
        row: row.to_string(),
        column: column.to_string(),
        reference,
        produced,
        abs_deviation,
        rel_deviation,
    }
}

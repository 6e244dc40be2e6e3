//! Canonical row-per-timestamp, column-per-variable table.

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::io::{Read, Write};

pub const TIMESTAMP_COLUMN: &str = "timestamp";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub timestamp: String,
    /// Missing cells are absent from the map.
    pub values: BTreeMap<String, f64>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn push_row<I, K>(&mut self, timestamp: impl Into<String>, values: I)
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        self.rows.push(Row {
            timestamp: timestamp.into(),
            values: values.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        });
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Rejects tables the validator could not align unambiguously.
    pub fn check(&self) -> Result<()> {
        if self.columns.is_empty() {
            bail!("table has no variable columns");
        }
        let mut cols = HashSet::new();
        for c in &self.columns {
            if c == TIMESTAMP_COLUMN {
                bail!("variable column may not be named {TIMESTAMP_COLUMN:?}");
            }
            if !cols.insert(c.as_str()) {
                bail!("duplicate column: {c}");
            }
        }
        let mut stamps = HashSet::new();
        for row in &self.rows {
            if !stamps.insert(row.timestamp.as_str()) {
                bail!("duplicate timestamp: {}", row.timestamp);
            }
            if let Some(extra) = row.values.keys().find(|k| !cols.contains(k.as_str())) {
                bail!(
                    "row {} has a value for undeclared column {extra}",
                    row.timestamp
                );
            }
        }
        Ok(())
    }

    pub fn write_csv<W: Write>(&self, w: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(w);
        wtr.write_record(
            std::iter::once(TIMESTAMP_COLUMN).chain(self.columns.iter().map(String::as_str)),
        )?;
        for row in &self.rows {
            let mut rec = Vec::with_capacity(self.columns.len() + 1);
            rec.push(row.timestamp.clone());
            for c in &self.columns {
                rec.push(row.values.get(c).map(|v| v.to_string()).unwrap_or_default());
            }
            wtr.write_record(&rec)?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn to_csv_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.write_csv(&mut buf)?;
        Ok(buf)
    }

    /// Reads a canonical CSV: first column is the row key, the rest are variables.
    pub fn read_csv<R: Read>(r: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new().has_headers(true).from_reader(r);
        let headers = rdr.headers().with_context(|| "reading CSV header")?.clone();
        if headers.len() < 2 {
            bail!("CSV needs a row-key column and at least one variable column");
        }
        let columns: Vec<String> = headers.iter().skip(1).map(|h| h.trim().to_string()).collect();
        let mut table = Table::new(columns);

        for (i, rec) in rdr.records().enumerate() {
            let rec = rec.with_context(|| format!("reading CSV record {}", i + 1))?;
            let timestamp = rec
                .get(0)
                .map(|s| s.trim().to_string())
                .ok_or_else(|| anyhow!("record {} has no row key", i + 1))?;
            let mut values = BTreeMap::new();
            for (col, raw) in table.columns.iter().zip(rec.iter().skip(1)) {
                let raw = raw.trim();
                if raw.is_empty() {
                    continue;
                }
                let v: f64 = raw.parse().with_context(|| {
                    format!("record {} column {col}: not a number: {raw:?}", i + 1)
                })?;
                values.insert(col.clone(), v);
            }
            table.rows.push(Row { timestamp, values });
        }

        table.check()?;
        Ok(table)
    }

    /// First `limit` distinct B parts of the variable identifiers, in column order.
    pub fn variable_sample_b_parts(&self, limit: usize) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for c in &self.columns {
            if out.len() >= limit {
                break;
            }
            let b = b_part(c).to_string();
            if seen.insert(b.clone()) {
                out.push(b);
            }
        }
        out
    }
}

/// The B part of a `/A/B/C/D/E/F/` pathname, or the whole identifier.
pub fn b_part(identifier: &str) -> &str {
    if identifier.starts_with('/') {
        let parts: Vec<&str> = identifier.split('/').collect();
        if parts.len() >= 4 && !parts[2].is_empty() {
            return parts[2];
        }
    }
    identifier
}

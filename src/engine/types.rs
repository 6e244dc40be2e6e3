use crate::table::{Row, Table};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderDiag {
    pub program: String,
    pub version: Option<String>,
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodeIn {
    pub cmd: String,
    pub input: String,
    pub role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodeOut {
    pub ok: bool,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<DecodedRow>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// JSON has no NaN, so missing cells arrive as `null`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodedRow {
    pub timestamp: String,
    pub values: BTreeMap<String, Option<f64>>,
}

impl DecodeOut {
    pub fn into_table(self) -> Table {
        let rows = self
            .rows
            .into_iter()
            .map(|r| Row {
                timestamp: r.timestamp,
                values: r
                    .values
                    .into_iter()
                    .filter_map(|(k, v)| v.map(|v| (k, v)))
                    .collect(),
            })
            .collect();
        Table {
            columns: self.columns,
            rows,
        }
    }
}

use crate::{
    classify::{ClassifiedFile, Role},
    engine::Decoder,
    error::IngestError,
    storage::{KeyLayout, ObjectStore},
    table::Table,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

/// Variable identifiers kept in the manifest's diagnostic sample.
pub const VARIABLE_SAMPLE_LIMIT: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionResult {
    pub role: Role,
    pub source_path: String,
    pub output_key: Option<String>,
    pub rows: usize,
    pub columns: usize,
    pub success: bool,
    pub error: Option<String>,
    pub variable_sample: Vec<String>,
    #[serde(skip)]
    pub table: Option<Table>,
}

impl ConversionResult {
    pub fn failed(file: &ClassifiedFile, error: String) -> Self {
        Self {
            role: file.role,
            source_path: file.path.clone(),
            output_key: None,
            rows: 0,
            columns: 0,
            success: false,
            error: Some(error),
            variable_sample: Vec::new(),
            table: None,
        }
    }
}

pub struct Converter<'a> {
    pub decoder: &'a dyn Decoder,
    pub store: &'a dyn ObjectStore,
    pub bucket: &'a str,
    pub layout: &'a KeyLayout,
    /// Directory holding the extracted archive.
    pub source_root: &'a Path,
    /// Directory for the local CSV copies.
    pub out_dir: &'a Path,
}

impl Converter<'_> {
    /// Decodes, writes and uploads one file. Failures are captured, never raised.
    pub fn convert(&self, file: &ClassifiedFile) -> ConversionResult {
        let started = Instant::now();
        match self.try_convert(file) {
            Ok((table, key)) => {
                info!(
                    "converted {} ({}) rows={} columns={} in {:?}",
                    file.path,
                    file.role,
                    table.row_count(),
                    table.column_count(),
                    started.elapsed()
                );
                ConversionResult {
                    role: file.role,
                    source_path: file.path.clone(),
                    output_key: Some(key),
                    rows: table.row_count(),
                    columns: table.column_count(),
                    success: true,
                    error: None,
                    variable_sample: table.variable_sample_b_parts(VARIABLE_SAMPLE_LIMIT),
                    table: Some(table),
                }
            }
            Err(err) => {
                warn!("{err}");
                ConversionResult::failed(file, err.to_string())
            }
        }
    }

    fn try_convert(&self, file: &ClassifiedFile) -> Result<(Table, String), IngestError> {
        let role = file.role;
        let conversion = |message: String| IngestError::Conversion { role, message };

        let input = self.source_root.join(&file.path);
        let table = self
            .decoder
            .decode(&input, role)
            .map_err(|e| conversion(format!("{e:#}")))?;
        table
            .check()
            .map_err(|e| conversion(format!("decoder returned an invalid table: {e:#}")))?;

        let bytes = table
            .to_csv_bytes()
            .map_err(|e| conversion(format!("encoding CSV: {e:#}")))?;
        let local = self.local_csv_path(role);
        std::fs::write(&local, &bytes)
            .map_err(|e| conversion(format!("writing {}: {e}", local.display())))?;

        let key = self.layout.csv(role.label());
        self.store
            .put(self.bucket, &key, &bytes)
            .map_err(|source| IngestError::Upload {
                key: key.clone(),
                source,
            })?;
        Ok((table, key))
    }

    fn local_csv_path(&self, role: Role) -> PathBuf {
        self.out_dir.join(format!("{}.csv", role.label()))
    }
}

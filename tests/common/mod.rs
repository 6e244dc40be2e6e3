#![allow(dead_code)]

use anyhow::{Result, anyhow};
use scenario_ingest::{classify::Role, config::Config, engine::Decoder, engine::DecoderDiag, table::Table};
use std::collections::BTreeMap;
use std::io::{Cursor, Write};
use std::path::Path;
use zip::write::SimpleFileOptions;

/// Decoder fake: answers by file name, records nothing.
#[derive(Default)]
pub struct FakeDecoder {
    tables: BTreeMap<String, Table>,
    failures: BTreeMap<String, String>,
}

impl FakeDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, file_name: &str, table: Table) -> Self {
        self.tables.insert(file_name.to_string(), table);
        self
    }

    pub fn with_failure(mut self, file_name: &str, message: &str) -> Self {
        self.failures.insert(file_name.to_string(), message.to_string());
        self
    }
}

impl Decoder for FakeDecoder {
    fn doctor(&self) -> Result<DecoderDiag> {
        Ok(DecoderDiag {
            program: "fake".into(),
            version: None,
            ok: true,
            error: None,
        })
    }

    fn decode(&self, input: &Path, _role: Role) -> Result<Table> {
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !input.exists() {
            return Err(anyhow!("not extracted: {}", input.display()));
        }
        if let Some(msg) = self.failures.get(&name) {
            return Err(anyhow!("{msg}"));
        }
        self.tables
            .get(&name)
            .cloned()
            .ok_or_else(|| anyhow!("no fixture for {name}"))
    }
}

pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut w = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, body) in entries {
        w.start_file(*name, SimpleFileOptions::default()).unwrap();
        w.write_all(body).unwrap();
    }
    w.finish().unwrap().into_inner()
}

pub fn flow_table(values: &[(&str, &[f64])]) -> Table {
    let columns: Vec<String> = values.iter().map(|(c, _)| c.to_string()).collect();
    let mut t = Table::new(columns);
    let n = values.first().map(|(_, v)| v.len()).unwrap_or(0);
    for i in 0..n {
        t.push_row(
            format!("1921-10-{:02}T00:00:00", i + 1),
            values.iter().map(|(c, v)| (c.to_string(), v[i])),
        );
    }
    t
}

pub fn test_config(work_dir: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.paths.work_dir = work_dir.display().to_string();
    cfg
}

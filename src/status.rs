//! Job status state machine over an external key-value status store.
//!
//! `submitted -> running -> {succeeded | succeeded_partial | failed}`. The
//! tracker refuses backward moves for its own job and never lets a backend
//! failure escape to the orchestrator.

use crate::util::now_epoch_seconds;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Submitted,
    Running,
    Succeeded,
    SucceededPartial,
    Failed,
}

impl JobStatus {
    fn rank(self) -> u8 {
        match self {
            JobStatus::Submitted => 0,
            JobStatus::Running => 1,
            JobStatus::Succeeded | JobStatus::SucceededPartial | JobStatus::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    /// Re-recording the current status is allowed; anything else must move forward.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        self == next || next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Submitted => "submitted",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::SucceededPartial => "succeeded_partial",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: JobStatus,
    /// Epoch seconds; never decreases for a key.
    pub updated: i64,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum StatusWriteError {
    #[error("status backend unavailable: {0}")]
    Backend(String),

    #[error("refusing backward transition {from} -> {to}")]
    Backward { from: JobStatus, to: JobStatus },
}

pub trait StatusStore: Send + Sync {
    fn get(&self, table: &str, key: &str) -> Result<Option<StatusRecord>, StatusWriteError>;
    fn upsert(&self, table: &str, key: &str, record: &StatusRecord)
        -> Result<(), StatusWriteError>;
}

#[derive(Default)]
pub struct MemoryStatusStore {
    tables: Mutex<BTreeMap<String, BTreeMap<String, StatusRecord>>>,
    unavailable: AtomicBool,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail, as an unreachable backend would.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn records(&self, table: &str) -> BTreeMap<String, StatusRecord> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.get(table).cloned().unwrap_or_default()
    }

    fn check_available(&self) -> Result<(), StatusWriteError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StatusWriteError::Backend("memory store marked unavailable".into()));
        }
        Ok(())
    }
}

impl StatusStore for MemoryStatusStore {
    fn get(&self, table: &str, key: &str) -> Result<Option<StatusRecord>, StatusWriteError> {
        self.check_available()?;
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tables.get(table).and_then(|t| t.get(key)).cloned())
    }

    fn upsert(
        &self,
        table: &str,
        key: &str,
        record: &StatusRecord,
    ) -> Result<(), StatusWriteError> {
        self.check_available()?;
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), record.clone());
        Ok(())
    }
}

/// One JSON document per table under `dir`, mapping key to record.
pub struct JsonFileStatusStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStatusStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    fn table_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{table}.json"))
    }

    fn load(path: &Path) -> Result<BTreeMap<String, StatusRecord>, StatusWriteError> {
        match std::fs::read(path) {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| StatusWriteError::Backend(format!("parse {}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(StatusWriteError::Backend(format!(
                "read {}: {e}",
                path.display()
            ))),
        }
    }
}

impl StatusStore for JsonFileStatusStore {
    fn get(&self, table: &str, key: &str) -> Result<Option<StatusRecord>, StatusWriteError> {
        let _g = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(Self::load(&self.table_path(table))?.remove(key))
    }

    fn upsert(
        &self,
        table: &str,
        key: &str,
        record: &StatusRecord,
    ) -> Result<(), StatusWriteError> {
        let _g = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let path = self.table_path(table);
        let mut doc = Self::load(&path)?;
        doc.insert(key.to_string(), record.clone());

        let backend = |e: std::io::Error| StatusWriteError::Backend(format!("{}: {e}", path.display()));
        std::fs::create_dir_all(&self.dir).map_err(backend)?;
        let raw = serde_json::to_vec_pretty(&doc)
            .map_err(|e| StatusWriteError::Backend(format!("encode: {e}")))?;
        let tmp = path.with_extension("json.partial");
        std::fs::write(&tmp, raw).map_err(backend)?;
        std::fs::rename(&tmp, &path).map_err(backend)
    }
}

/// Status client for one job. Created per job; owned by the orchestrator.
pub struct StatusTracker<'a> {
    store: &'a dyn StatusStore,
    table: String,
    key: String,
    job_id: String,
    current: Option<JobStatus>,
    last_updated: i64,
}

impl<'a> StatusTracker<'a> {
    pub fn new(store: &'a dyn StatusStore, table: &str, key: &str, job_id: &str) -> Self {
        Self {
            store,
            table: table.to_string(),
            key: key.to_string(),
            job_id: job_id.to_string(),
            current: None,
            last_updated: 0,
        }
    }

    pub fn current(&self) -> Option<JobStatus> {
        self.current
    }

    /// Records `status`, logging instead of failing. Returns whether the write landed.
    pub fn record(&mut self, status: JobStatus, attributes: &BTreeMap<String, String>) -> bool {
        let from = self.current;
        match self.try_record(status, attributes) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    "status write failed for {} ({} -> {status}): {err}",
                    self.key,
                    from.map(|s| s.as_str()).unwrap_or("none")
                );
                false
            }
        }
    }

    pub fn try_record(
        &mut self,
        status: JobStatus,
        attributes: &BTreeMap<String, String>,
    ) -> Result<(), StatusWriteError> {
        if let Some(from) = self.current {
            if !from.can_transition_to(status) {
                return Err(StatusWriteError::Backward { from, to: status });
            }
        }

        // A failed read only costs the monotonic floor from a prior writer.
        let previous = self.store.get(&self.table, &self.key).unwrap_or_else(|e| {
            debug!("status read failed for {}: {e}", self.key);
            None
        });
        let floor = previous
            .as_ref()
            .map(|p| p.updated)
            .unwrap_or(0)
            .max(self.last_updated);
        let updated = now_epoch_seconds().max(floor);

        let mut attrs = attributes.clone();
        attrs.remove("status");
        attrs.remove("updated");
        attrs.insert("job_id".into(), self.job_id.clone());
        let record = StatusRecord {
            status,
            updated,
            attributes: attrs,
        };

        // Local state advances even when the write fails.
        self.current = Some(status);
        self.last_updated = updated;
        self.store.upsert(&self.table, &self.key, &record)?;
        debug!("status {} -> {status} at {updated}", self.key);
        Ok(())
    }
}

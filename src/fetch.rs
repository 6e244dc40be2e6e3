//! Archive retrieval and extraction into a job-scoped scratch directory.

use crate::{
    config::Config,
    error::IngestError,
    storage::ObjectStore,
    util::{sha256_hex, slash_path},
};
use std::io::{Cursor, Read, Seek};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// An extracted archive. The scratch directory is removed when this is dropped.
pub struct FetchedArchive {
    pub dir: TempDir,
    root: PathBuf,
    /// Relative paths with `/` separators, sorted.
    pub files: Vec<String>,
    pub sha256: String,
    pub bytes: u64,
}

impl FetchedArchive {
    /// Where the archive contents were extracted.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Job-scoped scratch space next to the extracted contents.
    pub fn scratch(&self, name: &str) -> Result<PathBuf, IngestError> {
        let p = self.dir.path().join(name);
        std::fs::create_dir_all(&p)
            .map_err(|e| IngestError::Extraction(format!("create {}: {e}", p.display())))?;
        Ok(p)
    }
}

pub fn fetch_archive(
    cfg: &Config,
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    work_root: &Path,
    job_id: &str,
) -> Result<FetchedArchive, IngestError> {
    let bytes = store
        .get(bucket, key)
        .map_err(|source| IngestError::Retrieval {
            bucket: bucket.to_string(),
            key: key.to_string(),
            source,
        })?;
    info!("fetched {bucket}/{key} ({} bytes)", bytes.len());
    extract_bytes(cfg, &bytes, work_root, job_id)
}

/// Extracts an in-memory archive into a fresh scratch directory under `work_root`.
pub fn extract_bytes(
    cfg: &Config,
    bytes: &[u8],
    work_root: &Path,
    job_id: &str,
) -> Result<FetchedArchive, IngestError> {
    if bytes.len() as u64 > cfg.security.max_archive_bytes {
        return Err(IngestError::Extraction(format!(
            "archive exceeds max_archive_bytes: {} > {}",
            bytes.len(),
            cfg.security.max_archive_bytes
        )));
    }

    std::fs::create_dir_all(work_root).map_err(|e| {
        IngestError::Extraction(format!("create work dir {}: {e}", work_root.display()))
    })?;
    let dir = tempfile::Builder::new()
        .prefix(&format!("{job_id}-"))
        .tempdir_in(work_root)
        .map_err(|e| IngestError::Extraction(format!("create scratch dir: {e}")))?;

    let root = dir.path().join("archive");
    let files = extract_zip(cfg, Cursor::new(bytes), &root)?;
    debug!("extracted {} files into {}", files.len(), root.display());

    Ok(FetchedArchive {
        dir,
        root,
        files,
        sha256: sha256_hex(bytes),
        bytes: bytes.len() as u64,
    })
}

fn extract_zip<R: Read + Seek>(
    cfg: &Config,
    reader: R,
    target: &Path,
) -> Result<Vec<String>, IngestError> {
    let mut archive = zip::ZipArchive::new(reader)
        .map_err(|e| IngestError::Extraction(format!("corrupt archive: {e}")))?;

    if archive.len() > cfg.security.max_archive_entries {
        return Err(IngestError::Extraction(format!(
            "archive has {} entries, limit is {}",
            archive.len(),
            cfg.security.max_archive_entries
        )));
    }

    std::fs::create_dir_all(target)
        .map_err(|e| IngestError::Extraction(format!("create {}: {e}", target.display())))?;
    let mut files = Vec::new();
    let mut total: u64 = 0;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| IngestError::Extraction(format!("entry {i}: {e}")))?;

        // Entries escaping the target are rejected outright, never rewritten.
        let rel = entry.enclosed_name().ok_or_else(|| {
            IngestError::Extraction(format!("unsafe entry path: {:?}", entry.name()))
        })?;
        let out_path = target.join(&rel);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path).map_err(|e| {
                IngestError::Extraction(format!("create {}: {e}", out_path.display()))
            })?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                IngestError::Extraction(format!("create {}: {e}", parent.display()))
            })?;
        }
        let mut out = std::fs::File::create(&out_path).map_err(|e| {
            IngestError::Extraction(format!("create {}: {e}", out_path.display()))
        })?;

        // Counted on bytes actually inflated; declared sizes can lie.
        let budget = cfg.security.max_extracted_bytes.saturating_sub(total);
        let written = std::io::copy(&mut (&mut entry).take(budget.saturating_add(1)), &mut out)
            .map_err(|e| IngestError::Extraction(format!("write {}: {e}", out_path.display())))?;
        total = total.saturating_add(written);
        if total > cfg.security.max_extracted_bytes {
            return Err(IngestError::Extraction(format!(
                "extracted size exceeds max_extracted_bytes ({})",
                cfg.security.max_extracted_bytes
            )));
        }

        files.push(slash_path(&rel));
    }

    files.sort();
    Ok(files)
}

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::Path;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub fn ensure_dir(p: &Path) -> Result<()> {
    std::fs::create_dir_all(p).with_context(|| format!("creating directory {}", p.display()))
}

/// Lowercase hex digest used to fingerprint uploaded archives.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Wall clock truncated to whole seconds, matching the status store's resolution.
fn now() -> OffsetDateTime {
    let t = OffsetDateTime::now_utc();
    t.replace_nanosecond(0).unwrap_or(t)
}

/// `processed_at` stamp, e.g. `2024-03-15T10:15:00Z`.
pub fn now_rfc3339() -> String {
    now()
        .format(&Rfc3339)
        .unwrap_or_else(|_| now_epoch_seconds().to_string())
}

pub fn now_epoch_seconds() -> i64 {
    now().unix_timestamp()
}

/// Joins path components with `/` regardless of platform.
pub fn slash_path(p: &Path) -> String {
    p.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

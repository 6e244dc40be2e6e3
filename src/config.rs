use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: Global,
    #[serde(default)]
    pub paths: Paths,
    #[serde(default)]
    pub storage: Storage,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub classification: Classification,
    #[serde(default)]
    pub decoder: Decoder,
    #[serde(default)]
    pub validation: Validation,
    #[serde(default)]
    pub output: Output,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default)]
    pub debug: Debug,
    #[serde(default)]
    pub security: Security,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw).with_context(|| "parsing TOML")?;
        Ok(cfg)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Global {
    pub print_summary: bool,
    pub parallel_conversions: bool,
}
impl Default for Global {
    fn default() -> Self {
        Self {
            print_summary: true,
            parallel_conversions: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paths {
    /// Parent of the per-job scratch directories.
    pub work_dir: String,
}
impl Default for Paths {
    fn default() -> Self {
        Self {
            work_dir: ".scenario-ingest-work".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Storage {
    /// Only "local" is built in: buckets are directories under `root`.
    pub backend: String,
    pub root: String,
}
impl Default for Storage {
    fn default() -> Self {
        Self {
            backend: "local".into(),
            root: "object-store".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub backend: String,
    pub table: String,
    pub dir: String,
}
impl Default for Status {
    fn default() -> Self {
        Self {
            backend: "json_file".into(),
            table: "scenario-jobs".into(),
            dir: "status".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub extension: String,
    pub scenario_id_pattern: String,
    pub output_name_markers: Vec<String>,
    pub input_name_markers: Vec<String>,
    pub output_dir_markers: Vec<String>,
    pub input_dir_markers: Vec<String>,
}
impl Default for Classification {
    fn default() -> Self {
        Self {
            extension: "dss".into(),
            scenario_id_pattern: r"^(?P<id>.+?)(?:_\d{8}(?:T\d{6})?)?$".into(),
            output_name_markers: vec!["dv".into(), "calsim".into(), "output".into()],
            input_name_markers: vec!["sv".into(), "state".into(), "input".into()],
            output_dir_markers: vec![
                "dv".into(),
                "output".into(),
                "outputs".into(),
                "results".into(),
            ],
            input_dir_markers: vec![
                "sv".into(),
                "structure".into(),
                "state".into(),
                "input".into(),
                "inputs".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decoder {
    pub program: String,
    pub args: Vec<String>,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub env: std::collections::BTreeMap<String, String>,
}
impl Default for Decoder {
    fn default() -> Self {
        Self {
            program: "python3".into(),
            args: vec!["scripts/dss_decode.py".into()],
            timeout_seconds: 900,
            env: Default::default(),
        }
    }
}

/// Tolerances have no defaults on purpose: a reference without both is rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Validation {
    #[serde(default)]
    pub reference_key: Option<String>,
    #[serde(default)]
    pub abs_tolerance: Option<f64>,
    #[serde(default)]
    pub rel_tolerance: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Output {
    pub prefix: String,
    pub write_validation_reports: bool,
}
impl Default for Output {
    fn default() -> Self {
        Self {
            prefix: "scenarios/".into(),
            write_validation_reports: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    pub level: String,
    pub json: bool,
    pub write_to_file: bool,
    pub file_path: String,
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            write_to_file: false,
            file_path: "".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Debug {
    pub keep_decoder_stderr: bool,
    pub dump_effective_config: bool,
}
impl Default for Debug {
    fn default() -> Self {
        Self {
            keep_decoder_stderr: true,
            dump_effective_config: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Security {
    pub max_archive_bytes: u64,
    pub max_archive_entries: usize,
    pub max_extracted_bytes: u64,
}
impl Default for Security {
    fn default() -> Self {
        Self {
            max_archive_bytes: 4 * 1024 * 1024 * 1024,
            max_archive_entries: 10_000,
            max_extracted_bytes: 16 * 1024 * 1024 * 1024,
        }
    }
}

use crate::{config::Config, error::IngestError};
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    InputSeries,
    OutputSeries,
    Unclassified,
}

impl Role {
    /// The two roles the pipeline converts, in manifest order.
    pub const EXPECTED: [Role; 2] = [Role::InputSeries, Role::OutputSeries];

    /// Short label used in object keys and manifest fields.
    pub fn label(self) -> &'static str {
        match self {
            Role::InputSeries => "sv",
            Role::OutputSeries => "calsim",
            Role::Unclassified => "unclassified",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::InputSeries => "input_series",
            Role::OutputSeries => "output_series",
            Role::Unclassified => "unclassified",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedFile {
    pub path: String,
    pub role: Role,
    pub evidence: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub scenario_id: String,
    pub input_series: Option<ClassifiedFile>,
    pub output_series: Option<ClassifiedFile>,
    /// Same-role candidates that lost the tie-break.
    pub alternates: Vec<ClassifiedFile>,
    pub unclassified: Vec<ClassifiedFile>,
}

impl Classification {
    pub fn selected(&self, role: Role) -> Option<&ClassifiedFile> {
        match role {
            Role::InputSeries => self.input_series.as_ref(),
            Role::OutputSeries => self.output_series.as_ref(),
            Role::Unclassified => None,
        }
    }
}

pub struct Classifier {
    extension: String,
    scenario_id_re: Regex,
    output_name_markers: Vec<String>,
    input_name_markers: Vec<String>,
    output_dir_markers: Vec<String>,
    input_dir_markers: Vec<String>,
}

impl Classifier {
    pub fn new(cfg: &Config) -> Result<Self> {
        let c = &cfg.classification;
        let scenario_id_re = Regex::new(&c.scenario_id_pattern)
            .with_context(|| format!("compiling scenario_id_pattern: {}", c.scenario_id_pattern))?;
        let lower = |v: &[String]| v.iter().map(|s| s.to_ascii_lowercase()).collect();
        Ok(Self {
            extension: c.extension.trim_start_matches('.').to_ascii_lowercase(),
            scenario_id_re,
            output_name_markers: lower(&c.output_name_markers),
            input_name_markers: lower(&c.input_name_markers),
            output_dir_markers: lower(&c.output_dir_markers),
            input_dir_markers: lower(&c.input_dir_markers),
        })
    }

    /// Derives the scenario id from an archive base name. An override always wins.
    pub fn scenario_id(&self, archive_name: &str, override_id: Option<&str>) -> String {
        if let Some(id) = override_id.map(sanitize_id).filter(|s| !s.is_empty()) {
            return id;
        }

        let base = archive_name.rsplit('/').next().unwrap_or(archive_name);
        let stem = Path::new(base)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| base.to_string());

        let derived = self
            .scenario_id_re
            .captures(&stem)
            .and_then(|caps| caps.name("id"))
            .map(|m| sanitize_id(m.as_str()))
            .filter(|s| !s.is_empty());

        let id = derived.unwrap_or_else(|| sanitize_id(&stem));
        if id.is_empty() { "_".to_string() } else { id }
    }

    pub fn classify(
        &self,
        archive_name: &str,
        override_id: Option<&str>,
        files: &[String],
    ) -> Result<Classification, IngestError> {
        let scenario_id = self.scenario_id(archive_name, override_id);

        let mut candidates: Vec<ClassifiedFile> = files
            .iter()
            .filter(|p| self.has_expected_extension(p))
            .map(|p| self.assign(p))
            .collect();

        if candidates.is_empty() {
            return Err(IngestError::NoCandidates {
                extension: self.extension.clone(),
                scanned: files.len(),
            });
        }

        // Fewest path components first, then lexical order.
        candidates.sort_by(|a, b| {
            depth(&a.path)
                .cmp(&depth(&b.path))
                .then_with(|| a.path.cmp(&b.path))
        });

        let mut out = Classification {
            scenario_id,
            input_series: None,
            output_series: None,
            alternates: Vec::new(),
            unclassified: Vec::new(),
        };

        for file in candidates {
            let slot = match file.role {
                Role::InputSeries => &mut out.input_series,
                Role::OutputSeries => &mut out.output_series,
                Role::Unclassified => {
                    out.unclassified.push(file);
                    continue;
                }
            };
            if slot.is_none() {
                *slot = Some(file);
            } else {
                out.alternates.push(file);
            }
        }

        Ok(out)
    }

    fn has_expected_extension(&self, path: &str) -> bool {
        Path::new(path)
            .extension()
            .map(|e| e.to_string_lossy().eq_ignore_ascii_case(&self.extension))
            .unwrap_or(false)
    }

    fn assign(&self, path: &str) -> ClassifiedFile {
        let p = Path::new(path);
        let stem = p
            .file_stem()
            .map(|s| s.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        let tokens: Vec<&str> = stem
            .split(['_', '-', '.', ' '])
            .filter(|t| !t.is_empty())
            .collect();
        let dirs: Vec<String> = p
            .parent()
            .map(|parent| {
                parent
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_ascii_lowercase())
                    .collect()
            })
            .unwrap_or_default();

        // Name markers outrank directory markers; output outranks input.
        let name_rules: [(&[String], Role); 2] = [
            (&self.output_name_markers, Role::OutputSeries),
            (&self.input_name_markers, Role::InputSeries),
        ];
        for (markers, role) in name_rules {
            if let Some(m) = markers.iter().find(|m| tokens.contains(&m.as_str())) {
                return classified(path, role, format!("name:{m}"));
            }
        }

        let dir_rules: [(&[String], Role); 2] = [
            (&self.output_dir_markers, Role::OutputSeries),
            (&self.input_dir_markers, Role::InputSeries),
        ];
        for (markers, role) in dir_rules {
            if let Some(m) = markers.iter().find(|m| dirs.iter().any(|d| d == *m)) {
                return classified(path, role, format!("dir:{m}"));
            }
        }

        classified(path, Role::Unclassified, "no marker".to_string())
    }
}

fn classified(path: &str, role: Role, evidence: String) -> ClassifiedFile {
    ClassifiedFile {
        path: path.to_string(),
        role,
        evidence,
    }
}

fn depth(path: &str) -> usize {
    path.split('/').filter(|s| !s.is_empty()).count()
}

/// Maps to `[A-Za-z0-9._-]`. `.` and `..` would be path components, so dot-only ids become `_`s.
fn sanitize_id(raw: &str) -> String {
    let id: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if id.chars().all(|c| c == '.') {
        id.replace('.', "_")
    } else {
        id
    }
}

//! The per-scenario manifest document and the terminal-status policy.
//!
//! Field names and order are a wire format read by downstream consumers.

use crate::{
    classify::{Classification, Role},
    convert::ConversionResult,
    status::JobStatus,
    validate::ValidationResult,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub scenario_id: String,
    pub processed_at: String,
    pub job_id: String,
    pub status: JobStatus,
    pub original_upload_key: String,
    pub dss_files_detected: PerRole<String>,
    pub status_summary: StatusSummary,
    pub validation: ValidationSection,
    pub variable_sample_b_parts: PerRole<Vec<String>>,
    pub csv_outputs: PerRole<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerRole<T> {
    pub sv: T,
    pub calsim: T,
}

impl<T> PerRole<T> {
    pub fn get(&self, role: Role) -> Option<&T> {
        match role {
            Role::InputSeries => Some(&self.sv),
            Role::OutputSeries => Some(&self.calsim),
            Role::Unclassified => None,
        }
    }

    fn slot(&mut self, role: Role) -> Option<&mut T> {
        match role {
            Role::InputSeries => Some(&mut self.sv),
            Role::OutputSeries => Some(&mut self.calsim),
            Role::Unclassified => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub sv_detected: bool,
    pub calsim_detected: bool,
    pub sv_csv_written: bool,
    pub calsim_csv_written: bool,
}

impl StatusSummary {
    pub fn converted_roles(&self) -> usize {
        [
            self.sv_detected && self.sv_csv_written,
            self.calsim_detected && self.calsim_csv_written,
        ]
        .into_iter()
        .filter(|b| *b)
        .count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSection {
    pub reference_csv_key: String,
    /// Role label of the validated table, or empty.
    pub target: String,
    pub result: ValidationResult,
    pub summary: String,
    pub report_keys: ReportKeys,
}

impl Default for ValidationSection {
    fn default() -> Self {
        Self {
            reference_csv_key: String::new(),
            target: String::new(),
            result: ValidationResult::Skipped,
            summary: "no reference supplied".into(),
            report_keys: ReportKeys::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportKeys {
    pub json: String,
    pub mismatches_csv: String,
}

/// Terminal status from the per-role detection/conversion flags alone.
pub fn terminal_status(summary: &StatusSummary) -> JobStatus {
    match summary.converted_roles() {
        2 => JobStatus::Succeeded,
        1 => JobStatus::SucceededPartial,
        _ => JobStatus::Failed,
    }
}

pub struct ManifestBuilder {
    manifest: Manifest,
}

impl ManifestBuilder {
    pub fn new(scenario_id: &str, job_id: &str, original_upload_key: &str) -> Self {
        Self {
            manifest: Manifest {
                scenario_id: scenario_id.to_string(),
                processed_at: String::new(),
                job_id: job_id.to_string(),
                status: JobStatus::Failed,
                original_upload_key: original_upload_key.to_string(),
                dss_files_detected: PerRole::default(),
                status_summary: StatusSummary::default(),
                validation: ValidationSection::default(),
                variable_sample_b_parts: PerRole::default(),
                csv_outputs: PerRole::default(),
            },
        }
    }

    pub fn classification(mut self, c: &Classification) -> Self {
        for role in Role::EXPECTED {
            if let Some(file) = c.selected(role) {
                if let Some(slot) = self.manifest.dss_files_detected.slot(role) {
                    *slot = file.path.clone();
                }
                match role {
                    Role::InputSeries => self.manifest.status_summary.sv_detected = true,
                    Role::OutputSeries => self.manifest.status_summary.calsim_detected = true,
                    Role::Unclassified => {}
                }
            }
        }
        self
    }

    pub fn conversion(mut self, r: &ConversionResult) -> Self {
        if !r.success {
            return self;
        }
        match r.role {
            Role::InputSeries => self.manifest.status_summary.sv_csv_written = true,
            Role::OutputSeries => self.manifest.status_summary.calsim_csv_written = true,
            Role::Unclassified => return self,
        }
        if let Some(slot) = self.manifest.csv_outputs.slot(r.role) {
            *slot = r.output_key.clone().unwrap_or_default();
        }
        if let Some(slot) = self.manifest.variable_sample_b_parts.slot(r.role) {
            *slot = r.variable_sample.clone();
        }
        self
    }

    pub fn validation(mut self, v: ValidationSection) -> Self {
        self.manifest.validation = v;
        self
    }

    /// Stamps the processing time and the terminal status derived from the flags.
    pub fn build(mut self, processed_at: String) -> Manifest {
        self.manifest.processed_at = processed_at;
        self.manifest.status = terminal_status(&self.manifest.status_summary);
        self.manifest
    }
}

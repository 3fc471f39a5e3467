//! Pipeline run records
//!
//! A [`PipelineRun`] is the immutable history of one invocation: the stage
//! outcomes in execution order, the short revision the run was tagged with
//! and the terminal status.

#![allow(clippy::must_use_candidate)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use super::errors::PipelineError;
use super::publish::PublishResult;
use super::revision::ShortRevision;

/// The four stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageId {
    /// Cleaning and feature engineering
    DataProcessing,
    /// Model training against the tracking server
    ModelTraining,
    /// Image build, health check and publish
    BuildAndPublish,
    /// Scan of the published image
    VulnerabilityScan,
}

impl StageId {
    /// All stages in the fixed pipeline order
    pub const ALL: [StageId; 4] = [
        Self::DataProcessing,
        Self::ModelTraining,
        Self::BuildAndPublish,
        Self::VulnerabilityScan,
    ];

    /// Human-readable stage title
    pub fn title(self) -> &'static str {
        match self {
            Self::DataProcessing => "Data Processing",
            Self::ModelTraining => "Model Training",
            Self::BuildAndPublish => "Build and Publish",
            Self::VulnerabilityScan => "Vulnerability Scan",
        }
    }

    /// One-based position in the pipeline
    pub fn ordinal(self) -> usize {
        match self {
            Self::DataProcessing => 1,
            Self::ModelTraining => 2,
            Self::BuildAndPublish => 3,
            Self::VulnerabilityScan => 4,
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DataProcessing => write!(f, "data-processing"),
            Self::ModelTraining => write!(f, "model-training"),
            Self::BuildAndPublish => write!(f, "build-and-publish"),
            Self::VulnerabilityScan => write!(f, "vulnerability-scan"),
        }
    }
}

/// Outcome of a single executed stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    /// Stage finished and declared its outputs
    Success,
    /// Stage failed; the run stopped here
    Failure,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::Failure => write!(f, "FAILURE"),
        }
    }
}

/// Record of one executed stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Which stage ran
    pub stage: StageId,
    /// How it ended
    pub status: StageStatus,
    /// When it started
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
    /// Names of the outputs it declared
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    /// Error kind, when failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    /// Error detail, when failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageRecord {
    pub(crate) fn success(
        stage: StageId,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        outputs: Vec<String>,
    ) -> Self {
        Self {
            stage,
            status: StageStatus::Success,
            started_at,
            duration_ms: millis(elapsed),
            outputs,
            error_kind: None,
            error: None,
        }
    }

    pub(crate) fn failure(
        stage: StageId,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        error: &PipelineError,
    ) -> Self {
        Self {
            stage,
            status: StageStatus::Failure,
            started_at,
            duration_ms: millis(elapsed),
            outputs: Vec::new(),
            error_kind: Some(error.kind().to_string()),
            error: Some(error.to_string()),
        }
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// Terminal status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "stage", rename_all = "lowercase")]
pub enum RunStatus {
    /// All four stages succeeded
    Success,
    /// The run stopped at this stage
    Failed(StageId),
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::Failed(stage) => write!(f, "FAILED at {stage}"),
        }
    }
}

/// One end-to-end execution of the pipeline
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    /// Unique run id
    pub id: Uuid,
    /// Short source revision used for tagging
    pub revision: ShortRevision,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// Executed stages, in order
    pub stages: Vec<StageRecord>,
    /// Terminal status
    pub status: RunStatus,
    /// Tags pushed during the run, including those pushed before a later failure
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub published: Vec<PublishResult>,
    /// Textual scanner report
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_report: Option<String>,
    /// The error that stopped the run
    #[serde(skip)]
    pub error: Option<PipelineError>,
}

impl PipelineRun {
    pub(crate) fn start(revision: ShortRevision) -> Self {
        Self {
            id: Uuid::new_v4(),
            revision,
            started_at: Utc::now(),
            stages: Vec::new(),
            status: RunStatus::Success,
            published: Vec::new(),
            scan_report: None,
            error: None,
        }
    }

    /// Returns true if every stage succeeded
    pub fn is_success(&self) -> bool {
        matches!(self.status, RunStatus::Success)
    }

    /// The stage the run stopped at, if any
    pub fn failed_stage(&self) -> Option<StageId> {
        match self.status {
            RunStatus::Success => None,
            RunStatus::Failed(stage) => Some(stage),
        }
    }

    /// Stages that actually executed, in order
    pub fn executed(&self) -> Vec<StageId> {
        self.stages.iter().map(|record| record.stage).collect()
    }

    /// Serializes the run report as pretty JSON
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for PipelineRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {} at revision {}: {}", self.id, self.revision, self.status)?;
        for record in &self.stages {
            write!(
                f,
                "  [{}] {:<20} {} ({} ms)",
                record.stage.ordinal(),
                record.stage.title(),
                record.status,
                record.duration_ms
            )?;
            if let Some(error) = &record.error {
                write!(f, " - {error}")?;
            }
            writeln!(f)?;
        }
        for published in &self.published {
            writeln!(f, "  published {} @ {}", published.tag, published.digest)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn revision() -> ShortRevision {
        ShortRevision::from_full("abc123456").unwrap()
    }

    #[test]
    fn test_stage_order_is_fixed() {
        let ordinals: Vec<usize> = StageId::ALL.iter().map(|s| s.ordinal()).collect();
        assert_eq!(ordinals, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_stage_id_serializes_kebab_case() {
        let json = serde_json::to_string(&StageId::BuildAndPublish).unwrap();
        assert_eq!(json, r#""build-and-publish""#);
        assert_eq!(StageId::BuildAndPublish.to_string(), "build-and-publish");
    }

    #[test]
    fn test_run_status_serialization() {
        let json = serde_json::to_string(&RunStatus::Failed(StageId::ModelTraining)).unwrap();
        assert_eq!(json, r#"{"status":"failed","stage":"model-training"}"#);

        let json = serde_json::to_string(&RunStatus::Success).unwrap();
        assert_eq!(json, r#"{"status":"success"}"#);
    }

    #[test]
    fn test_failed_run_reports_stage() {
        let mut run = PipelineRun::start(revision());
        let error = PipelineError::Configuration("boom".to_string());
        run.stages.push(StageRecord::failure(
            StageId::DataProcessing,
            Utc::now(),
            Duration::from_millis(5),
            &error,
        ));
        run.status = RunStatus::Failed(StageId::DataProcessing);

        assert!(!run.is_success());
        assert_eq!(run.failed_stage(), Some(StageId::DataProcessing));
        assert_eq!(run.executed(), vec![StageId::DataProcessing]);
        assert!(run.to_string().contains("FAILED at data-processing"));
    }

    #[test]
    fn test_report_json_contains_revision() {
        let run = PipelineRun::start(revision());
        let json = run.to_json().unwrap();
        assert!(json.contains(r#""revision": "abc1234""#));
    }
}

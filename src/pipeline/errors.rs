//! Error types for the pipeline domain

use thiserror::Error;

use super::publish::PublishResult;
use super::run::StageId;
use crate::runtime::RuntimeError;

/// Errors that can occur while preparing or running the pipeline
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// A required credential or configuration value is missing or invalid
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A command inside an execution environment exited non-zero
    #[error("Stage '{stage}' command `{command}` failed with exit code {code}: {stderr}")]
    StageExecution {
        /// Stage the environment belongs to.
        stage: StageId,
        /// Rendered command line.
        command: String,
        /// Exit code returned by the command.
        code: i32,
        /// Captured standard error, secrets redacted.
        stderr: String,
    },

    /// The source revision could not be determined
    #[error("Revision lookup failed: {reason}")]
    RevisionLookup {
        /// Error reported by the version-control system.
        reason: String,
    },

    /// Some tags were pushed before a later tag push failed
    #[error("Publish partially failed: pushed [{}], then '{failed}' failed: {reason}", pushed_tags(pushed))]
    PublishPartialFailure {
        /// Tags that now point at the new digest, with that digest.
        pushed: Vec<PublishResult>,
        /// Tag whose push failed.
        failed: String,
        /// Failure reason.
        reason: String,
    },

    /// The first tag push failed; no tag moved
    #[error("Publish of '{tag}' failed: {reason}")]
    Publish {
        /// Tag whose push failed.
        tag: String,
        /// Failure reason.
        reason: String,
    },

    /// Registry authentication was refused
    #[error("Authentication against '{registry}' failed: {reason}")]
    Authentication {
        /// Registry host.
        registry: String,
        /// Failure reason.
        reason: String,
    },

    /// The vulnerability scanner could not produce a report
    #[error("Vulnerability scan failed: {reason}")]
    ScanReport {
        /// Failure reason, including scanner stderr.
        reason: String,
    },

    /// A side-car never became ready within the polling budget
    #[error("Health check on {url} timed out after {attempts} attempts: {last_error}")]
    HealthCheckTimeout {
        /// Probed URL.
        url: String,
        /// Number of probes issued.
        attempts: u32,
        /// Output of the last failed probe.
        last_error: String,
    },

    /// Two build context entries target the same path
    #[error("Build context has more than one entry for '{path}'")]
    DuplicateContextEntry {
        /// Conflicting target path.
        path: String,
    },

    /// A build argument carries a secret value
    #[error("Build argument '{key}' contains secret material")]
    SecretInBuildArgs {
        /// Offending build argument name.
        key: String,
    },

    /// Two service bindings in one scope share a hostname
    #[error("Service hostname '{hostname}' is already bound in this scope")]
    DuplicateBinding {
        /// Conflicting hostname.
        hostname: String,
    },

    /// A declared output path does not exist or has the wrong kind
    #[error("Stage '{stage}' has no {expected} at '{path}'")]
    MissingOutput {
        /// Stage the extraction was attempted in.
        stage: StageId,
        /// Requested path.
        path: String,
        /// Expected kind, as text.
        expected: String,
    },

    /// A stage asked for an input no earlier stage declared
    #[error("Stage '{stage}' requires input '{name}' which no earlier stage declared")]
    MissingInput {
        /// Consuming stage.
        stage: StageId,
        /// Output name that was looked up.
        name: String,
    },

    /// A stage declared an output name that already exists
    #[error("Output '{name}' declared by stage '{stage}' already exists")]
    DuplicateOutput {
        /// Declaring stage.
        stage: StageId,
        /// Output name.
        name: String,
    },

    /// A container runtime operation failed
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

fn pushed_tags(pushed: &[PublishResult]) -> String {
    pushed
        .iter()
        .map(|p| p.tag.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl PipelineError {
    /// Short machine-readable kind, used in run reports
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::StageExecution { .. } => "stage_execution",
            Self::RevisionLookup { .. } => "revision_lookup",
            Self::PublishPartialFailure { .. } => "publish_partial_failure",
            Self::Publish { .. } => "publish",
            Self::Authentication { .. } => "authentication",
            Self::ScanReport { .. } => "scan_report",
            Self::HealthCheckTimeout { .. } => "health_check_timeout",
            Self::DuplicateContextEntry { .. } => "duplicate_context_entry",
            Self::SecretInBuildArgs { .. } => "secret_in_build_args",
            Self::DuplicateBinding { .. } => "duplicate_binding",
            Self::MissingOutput { .. } => "missing_output",
            Self::MissingInput { .. } => "missing_input",
            Self::DuplicateOutput { .. } => "duplicate_output",
            Self::Runtime(_) => "runtime",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_failure_lists_moved_tags() {
        let err = PipelineError::PublishPartialFailure {
            pushed: vec![PublishResult {
                tag: "owner/repo:abc1234".to_string(),
                digest: "sha256:new".to_string(),
            }],
            failed: "owner/repo:latest".to_string(),
            reason: "denied".to_string(),
        };

        let message = err.to_string();
        assert!(message.contains("owner/repo:abc1234"));
        assert!(message.contains("owner/repo:latest"));
        assert_eq!(err.kind(), "publish_partial_failure");
    }

    #[test]
    fn test_stage_execution_message_carries_stderr() {
        let err = PipelineError::StageExecution {
            stage: StageId::ModelTraining,
            command: "python train.py".to_string(),
            code: 2,
            stderr: "no such file".to_string(),
        };

        assert!(err.to_string().contains("model-training"));
        assert!(err.to_string().contains("no such file"));
    }

    #[test]
    fn test_runtime_error_converts() {
        let err: PipelineError = RuntimeError::NotFound {
            kind: "service",
            id: "svc-1".to_string(),
        }
        .into();

        assert_eq!(err.kind(), "runtime");
    }
}

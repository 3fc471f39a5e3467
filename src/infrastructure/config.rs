//! Configuration management
//!
//! Every image name, port, path and credential variable the pipeline uses
//! lives in [`PipelineConfig`], which is passed explicitly into the engine.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::pipeline::{PipelineError, ReadinessPolicy};

/// Errors loading a configuration file
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read config '{path}': {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid YAML for this schema
    #[error("failed to parse config '{path}': {source}")]
    Parse {
        /// File path.
        path: String,
        /// Underlying error.
        #[source]
        source: serde_yaml::Error,
    },

    /// The configuration parsed but is inconsistent
    #[error(transparent)]
    Invalid(#[from] PipelineError),
}

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Base image for data processing and training
    pub base_image: String,
    /// Where the source tree is mounted inside stage environments
    pub workdir: String,
    /// Paths and scripts inside the source tree
    pub layout: ProjectLayout,
    /// Tracking server side-car
    pub tracking: TrackingConfig,
    /// The built service and its health probe
    pub service: ServiceConfig,
    /// Registry target
    pub registry: RegistryConfig,
    /// Vulnerability scanner
    pub scan: ScanConfig,
    /// Credential variable names
    pub credentials: CredentialsConfig,
    /// Default log level
    pub log_level: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_image: "python:3.11-slim".to_string(),
            workdir: "/house-price-predictor".to_string(),
            layout: ProjectLayout::default(),
            tracking: TrackingConfig::default(),
            service: ServiceConfig::default(),
            registry: RegistryConfig::default(),
            scan: ScanConfig::default(),
            credentials: CredentialsConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Loads and validates a YAML configuration file; missing keys take defaults
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks internal consistency
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Configuration`] describing the first problem found.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let required = [
            ("base_image", &self.base_image),
            ("workdir", &self.workdir),
            ("tracking.image", &self.tracking.image),
            ("tracking.hostname", &self.tracking.hostname),
            ("service.hostname", &self.service.hostname),
            ("service.probe_image", &self.service.probe_image),
            ("registry.host", &self.registry.host),
            ("registry.repository", &self.registry.repository),
            ("scan.image", &self.scan.image),
        ];
        if let Some((key, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(PipelineError::Configuration(format!("{key} must not be empty")));
        }
        if !self.workdir.starts_with('/') {
            return Err(PipelineError::Configuration(format!(
                "workdir '{}' must be absolute",
                self.workdir
            )));
        }
        if self.tracking.port == 0 || self.service.port == 0 {
            return Err(PipelineError::Configuration(
                "service ports must be non-zero".to_string(),
            ));
        }
        if self.service.readiness.max_attempts == 0 {
            return Err(PipelineError::Configuration(
                "service.readiness.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Paths and scripts inside the source tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectLayout {
    /// Python requirements file
    pub requirements: String,
    /// Raw input data
    pub raw_data: String,
    /// Cleaning step output
    pub cleaned_data: String,
    /// Feature engineering output
    pub featured_data: String,
    /// Fitted preprocessor
    pub preprocessor: String,
    /// Training configuration
    pub model_config: String,
    /// Models directory handed to the trainer
    pub models_dir: String,
    /// Directory the trainer writes the final model to
    pub trained_model_dir: String,
    /// Cleaning program
    pub cleaning_script: String,
    /// Feature engineering program
    pub features_script: String,
    /// Training program
    pub training_script: String,
    /// Dockerfile of the service image
    pub dockerfile: String,
    /// Source directories copied into the image build context
    pub context_directories: Vec<String>,
}

impl Default for ProjectLayout {
    fn default() -> Self {
        Self {
            requirements: "requirements.txt".to_string(),
            raw_data: "data/raw/house_data.csv".to_string(),
            cleaned_data: "data/processed/cleaned_house_data.csv".to_string(),
            featured_data: "data/processed/featured_house_data.csv".to_string(),
            preprocessor: "models/preprocessor.pkl".to_string(),
            model_config: "configs/model_config.yaml".to_string(),
            models_dir: "models".to_string(),
            trained_model_dir: "models/trained".to_string(),
            cleaning_script: "src/data/run_processing.py".to_string(),
            features_script: "src/features/engineer.py".to_string(),
            training_script: "src/models/train_model.py".to_string(),
            dockerfile: "Dockerfile".to_string(),
            context_directories: vec![
                "src/api".to_string(),
                "configs".to_string(),
                "data/raw".to_string(),
            ],
        }
    }
}

/// Tracking server side-car
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Server image
    pub image: String,
    /// Logical hostname inside the training environment
    pub hostname: String,
    /// Listening port
    pub port: u16,
    /// Cache volume name
    pub cache_volume: String,
    /// Cache mount point
    pub cache_target: String,
    /// Backend store URI passed to the server
    pub backend_store_uri: String,
    /// Default artifact root passed to the server
    pub artifact_root: String,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            image: "ghcr.io/mlflow/mlflow:latest".to_string(),
            hostname: "mlflow_server".to_string(),
            port: 5000,
            cache_volume: "mlflow_cache".to_string(),
            cache_target: "/root/.cache/mlflow".to_string(),
            backend_store_uri: "sqlite:///mlflow.db".to_string(),
            artifact_root: "/tmp/mlruns".to_string(),
        }
    }
}

/// The built service and how it is probed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Logical hostname inside the probe environment
    pub hostname: String,
    /// Listening port
    pub port: u16,
    /// Health endpoint path
    pub health_path: String,
    /// Launch arguments for the service
    pub args: Vec<String>,
    /// Image of the probe environment
    pub probe_image: String,
    /// Readiness polling policy
    pub readiness: ReadinessPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            hostname: "app_service".to_string(),
            port: 8000,
            health_path: "/health".to_string(),
            args: ["uvicorn", "main:app", "--host", "0.0.0.0", "--port", "8000"]
                .into_iter()
                .map(String::from)
                .collect(),
            probe_image: "alpine/curl".to_string(),
            readiness: ReadinessPolicy::default(),
        }
    }
}

/// Registry target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Registry host used for authentication
    pub host: String,
    /// Repository name under the owner namespace
    pub repository: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            host: "docker.io".to_string(),
            repository: "house-price-predictor-service".to_string(),
        }
    }
}

/// Vulnerability scanner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Scanner image
    pub image: String,
    /// Minimum severities reported
    pub severity: String,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            image: "aquasec/trivy:latest".to_string(),
            severity: "HIGH,CRITICAL".to_string(),
        }
    }
}

/// Names of the environment variables credentials are read from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Registry username
    pub username_var: String,
    /// Registry access token
    pub token_var: String,
    /// Image namespace owner
    pub owner_var: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            username_var: "DOCKERHUB_USERNAME".to_string(),
            token_var: "DOCKERHUB_TOKEN".to_string(),
            owner_var: "DOCKER_USERID".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = PipelineConfig::default();
        assert_eq!(config.base_image, "python:3.11-slim");
        assert_eq!(config.tracking.hostname, "mlflow_server");
        assert_eq!(config.service.health_path, "/health");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "registry:\n  repository: custom-repo\ntracking:\n  port: 5500").unwrap();

        let config = PipelineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.registry.repository, "custom-repo");
        assert_eq!(config.registry.host, "docker.io");
        assert_eq!(config.tracking.port, 5500);
        assert_eq!(config.tracking.hostname, "mlflow_server");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "workdir: relative/dir").unwrap();

        let err = PipelineConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = PipelineConfig::from_file(Path::new("/no/such/config.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}

//! Infrastructure layer
//!
//! Configuration loading and logging setup.

mod config;
mod logging;

pub use config::{
    ConfigError, CredentialsConfig, PipelineConfig, ProjectLayout, RegistryConfig, ScanConfig,
    ServiceConfig, TrackingConfig,
};
pub use logging::init_logging;

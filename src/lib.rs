//! # Shipline - containerized multi-stage build pipeline
//!
//! Shipline drives a container runtime through four fixed stages: data
//! processing, model training against a tracking side-car, building and
//! publishing the service image, and a vulnerability scan of the pushed
//! image. Stages run in order and the first failure stops the run.
//!
//! ## Layout
//!
//! - [`pipeline`]: artifacts, secrets, execution environments, service
//!   scopes, build contexts, publishing, the stages and the engine
//! - [`runtime`]: the [`ContainerRuntime`] seam, a docker CLI backend and an
//!   in-memory runtime for tests
//! - [`infrastructure`]: configuration and logging
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use shipline::prelude::*;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::default();
//! let vault = SecretVault::from_env(&config.credentials)?;
//! let engine = PipelineEngine::new(config, Arc::new(DockerRuntime::new()), vault)?;
//!
//! let run = engine.run(&SourceTree::open(".")?).await?;
//! println!("{run}");
//! # Ok(())
//! # }
//! ```
//!
//! ## License
//!
//! Licensed under either of
//! - Apache License, Version 2.0 ([LICENSE-APACHE](LICENSE-APACHE) or <https://www.apache.org/licenses/LICENSE-2.0>)
//! - MIT license ([LICENSE-MIT](LICENSE-MIT) or <https://opensource.org/licenses/MIT>)
//!
//! at your option.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod infrastructure;
pub mod pipeline;
pub mod runtime;

// Prelude module for common imports
pub mod prelude;

// Re-export commonly used types
pub use infrastructure::{ConfigError, PipelineConfig, init_logging};
pub use pipeline::{
    PipelineEngine, PipelineError, PipelineRun, RunStatus, SecretVault, SourceTree, StageId,
};
pub use runtime::{ContainerRuntime, DockerRuntime};

/// Version of the shipline crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

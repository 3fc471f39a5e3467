//! shipline - containerized build pipeline for a model service
//!
//! Processes raw data, trains a model against a tracking server, builds and
//! health-checks the service image, publishes it and scans what was pushed.
//!
//! ## Commands
//!
//! - `shipline run` - Execute the pipeline against a source checkout
//! - `shipline plan` - Show what a run would do
//! - `shipline image` - Build, push, list and prune local images
//! - `shipline completions` - Generate shell completions
//!
//! ## Quick Start
//!
//! ```bash
//! export DOCKERHUB_USERNAME=acme DOCKERHUB_TOKEN=...
//!
//! # Inspect the stages and tags
//! shipline plan --source .
//!
//! # Run everything and keep a JSON record
//! shipline run --source . --report run.json
//! ```

use std::process::ExitCode;

mod cli;

fn main() -> ExitCode {
    match cli::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            if std::env::var("SHIPLINE_VERBOSE").is_ok() {
                eprintln!("{e:?}");
            }
            ExitCode::FAILURE
        }
    }
}

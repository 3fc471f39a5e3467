//! Build context assembly
//!
//! Entries from earlier stages and from the source tree are layered into a
//! single composite tree that the image build consumes. Each target path may
//! be claimed by exactly one entry.

use std::collections::BTreeSet;

use super::artifact::{MountSource, normalize_path};
use super::errors::PipelineError;
use super::secret::SecretVault;
use crate::runtime::{BuildRequest, ContainerRuntime, ImageId, StateRef};

/// Collects context entries
#[derive(Debug, Clone, Default)]
pub struct BuildContextAssembler {
    entries: Vec<(String, MountSource)>,
}

impl BuildContextAssembler {
    /// Creates an empty assembler
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `source` at `target`, relative to the context root
    #[must_use]
    pub fn entry(mut self, target: &str, source: impl Into<MountSource>) -> Self {
        self.entries.push((target.to_string(), source.into()));
        self
    }

    /// Entries in insertion order
    #[must_use]
    pub fn entries(&self) -> &[(String, MountSource)] {
        &self.entries
    }

    /// Checks that every target is a distinct, non-root path
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::DuplicateContextEntry`] when two entries map
    /// to the same normalized target, or a configuration error for an empty
    /// target or an empty context.
    pub fn validate(&self) -> Result<Vec<String>, PipelineError> {
        if self.entries.is_empty() {
            return Err(PipelineError::Configuration(
                "build context has no entries".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        let mut targets = Vec::with_capacity(self.entries.len());
        for (target, _) in &self.entries {
            let normalized = context_path(target);
            if normalized.is_empty() {
                return Err(PipelineError::Configuration(format!(
                    "build context target '{target}' does not name a path"
                )));
            }
            if !seen.insert(normalized.clone()) {
                return Err(PipelineError::DuplicateContextEntry { path: normalized });
            }
            targets.push(normalized);
        }
        Ok(targets)
    }

    /// Layers every entry onto an empty tree
    ///
    /// # Errors
    ///
    /// Returns a validation error before any runtime work, or a runtime
    /// error if a copy fails.
    pub async fn assemble(
        &self,
        runtime: &dyn ContainerRuntime,
    ) -> Result<ContextHandle, PipelineError> {
        let targets = self.validate()?;

        let mut state = StateRef::Scratch;
        for ((_, source), target) in self.entries.iter().zip(&targets) {
            state = runtime
                .copy_in(&state, &source.to_copy_source(), &format!("/{target}"))
                .await?;
            tracing::debug!(source = %source, target = %target, "Context entry layered");
        }

        tracing::info!(entries = targets.len(), state = %state, "Build context assembled");
        Ok(ContextHandle {
            state,
            paths: targets,
        })
    }
}

/// An assembled build context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextHandle {
    state: StateRef,
    paths: Vec<String>,
}

impl ContextHandle {
    /// Committed state holding the tree
    #[must_use]
    pub fn state(&self) -> &StateRef {
        &self.state
    }

    /// Top-level entry paths, in layering order
    #[must_use]
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    /// Builds an image from this context
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::SecretInBuildArgs`] if a build argument
    /// carries a vault secret, or a runtime error if the build fails.
    pub async fn build(
        &self,
        runtime: &dyn ContainerRuntime,
        dockerfile: &str,
        args: &BuildArgs,
        vault: &SecretVault,
    ) -> Result<ImageId, PipelineError> {
        args.check_against(vault)?;
        let request = BuildRequest {
            dockerfile: context_path(dockerfile),
            build_args: args.pairs().to_vec(),
        };
        let image = runtime.build_image(&self.state, &request).await?;
        tracing::info!(image = %image, dockerfile = %request.dockerfile, "Image built");
        Ok(image)
    }
}

/// Non-confidential build arguments, embedded in image metadata
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildArgs {
    pairs: Vec<(String, String)>,
}

impl BuildArgs {
    /// Creates an empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key` to `value`, replacing an earlier value
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        match self.pairs.iter_mut().find(|(k, _)| *k == key) {
            Some(pair) => pair.1 = value,
            None => self.pairs.push((key, value)),
        }
        self
    }

    /// Key/value pairs in insertion order
    #[must_use]
    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    /// Rejects any argument whose value contains a vault secret
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::SecretInBuildArgs`] naming the argument.
    pub fn check_against(&self, vault: &SecretVault) -> Result<(), PipelineError> {
        match self.pairs.iter().find(|(_, value)| vault.leaks_into(value)) {
            Some((key, _)) => Err(PipelineError::SecretInBuildArgs { key: key.clone() }),
            None => Ok(()),
        }
    }
}

fn context_path(target: &str) -> String {
    normalize_path(target).trim_start_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::CredentialsConfig;
    use crate::pipeline::{ArtifactHandle, ArtifactKind, StageId};
    use crate::runtime::FakeRuntime;
    use proptest::prelude::*;
    use std::path::PathBuf;

    fn host(path: &str) -> MountSource {
        MountSource::Host {
            path: PathBuf::from(path),
            kind: ArtifactKind::Directory,
        }
    }

    fn vault() -> SecretVault {
        SecretVault::load(&CredentialsConfig::default(), |name| match name {
            "DOCKERHUB_USERNAME" => Some("alice".to_string()),
            "DOCKERHUB_TOKEN" => Some("s3cr3t-token".to_string()),
            _ => None,
        })
        .unwrap()
    }

    #[test]
    fn test_duplicate_targets_rejected() {
        let assembler = BuildContextAssembler::new()
            .entry("src/api", host("/repo/src/api"))
            .entry("./src//api/", host("/other/api"));

        assert_eq!(
            assembler.validate().unwrap_err(),
            PipelineError::DuplicateContextEntry {
                path: "src/api".to_string()
            }
        );
    }

    #[test]
    fn test_root_target_rejected() {
        let assembler = BuildContextAssembler::new().entry("/", host("/repo"));
        assert!(matches!(
            assembler.validate(),
            Err(PipelineError::Configuration(_))
        ));
        assert!(matches!(
            BuildContextAssembler::new().validate(),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_assemble_layers_artifacts_and_host_files() {
        let fake = FakeRuntime::new();
        let stage_state = fake.seed_state(&[("/w/models/trained/model.pkl", b"weights".as_slice())]);
        let model = ArtifactHandle::new(
            StageId::ModelTraining,
            "/w/models/trained".to_string(),
            ArtifactKind::Directory,
            stage_state,
        );

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM python:3.11-slim\n").unwrap();

        let context = BuildContextAssembler::new()
            .entry("models/trained", &model)
            .entry(
                "Dockerfile",
                MountSource::Host {
                    path: dir.path().join("Dockerfile"),
                    kind: ArtifactKind::File,
                },
            )
            .assemble(&fake)
            .await
            .unwrap();

        assert_eq!(context.paths(), ["models/trained", "Dockerfile"]);
        assert_eq!(
            fake.read(context.state(), "/models/trained/model.pkl").unwrap(),
            b"weights"
        );
        assert!(fake.read(context.state(), "/Dockerfile").is_some());
    }

    #[tokio::test]
    async fn test_duplicate_rejected_before_runtime_work() {
        let fake = FakeRuntime::new();
        let result = BuildContextAssembler::new()
            .entry("configs", host("/a"))
            .entry("configs", host("/b"))
            .assemble(&fake)
            .await;

        assert!(matches!(result, Err(PipelineError::DuplicateContextEntry { .. })));
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_secret_build_arg_rejected() {
        let fake = FakeRuntime::new();
        let context = ContextHandle {
            state: StateRef::Scratch,
            paths: Vec::new(),
        };
        let args = BuildArgs::new()
            .with("GIT_SHA_SHORT", "abc1234")
            .with("TOKEN", "s3cr3t-token");

        let err = context
            .build(&fake, "Dockerfile", &args, &vault())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            PipelineError::SecretInBuildArgs {
                key: "TOKEN".to_string()
            }
        );
    }

    #[test]
    fn test_build_args_replace() {
        let args = BuildArgs::new().with("CACHEBUST", "1").with("CACHEBUST", "2");
        assert_eq!(args.pairs(), [("CACHEBUST".to_string(), "2".to_string())]);
        assert!(args.check_against(&vault()).is_ok());
    }

    proptest! {
        #[test]
        fn prop_validate_rejects_exactly_duplicates(
            targets in proptest::collection::vec(
                prop::sample::select(vec!["src/api", "configs", "data/raw", "Dockerfile", "models/trained", "./configs/"]),
                1..6,
            )
        ) {
            let assembler = targets
                .iter()
                .fold(BuildContextAssembler::new(), |acc, t| acc.entry(t, host("/x")));
            let distinct: BTreeSet<String> = targets.iter().map(|t| context_path(t)).collect();

            match assembler.validate() {
                Ok(paths) => prop_assert_eq!(paths.len(), distinct.len()),
                Err(PipelineError::DuplicateContextEntry { path }) => {
                    prop_assert!(distinct.len() < targets.len());
                    prop_assert!(distinct.contains(&path));
                }
                Err(other) => prop_assert!(false, "unexpected error {}", other),
            }
        }
    }
}

//! Execution environments
//!
//! An [`ExecutionEnvironment`] is one stage's isolated, layered runtime.
//! Every mount and every successful command commits a new state; earlier
//! states are never overwritten, so each step's result stays inspectable.
//! Outputs leave the environment only as [`ArtifactHandle`]s.

use serde::Serialize;
use std::sync::Arc;

use super::artifact::{ArtifactHandle, ArtifactKind, MountSource, resolve_path};
use super::errors::PipelineError;
use super::run::StageId;
use super::secret::{Secret, SecretVault};
use super::service::ServiceScope;
use crate::runtime::{ContainerRuntime, ExecOutput, ExecRequest, NetworkRef, StateRef};

/// Record of one committed command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecRecord {
    /// Rendered command line
    pub command: String,
    /// Exit code
    pub exit_code: i32,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// State committed by this command
    #[serde(skip)]
    pub state: StateRef,
}

/// A stage's isolated runtime
#[derive(Clone)]
pub struct ExecutionEnvironment {
    runtime: Arc<dyn ContainerRuntime>,
    stage: StageId,
    base_image: String,
    state: StateRef,
    workdir: String,
    env: Vec<(String, String)>,
    secrets: Vec<(String, Secret)>,
    vault: Option<Arc<SecretVault>>,
    network: Option<NetworkRef>,
    history: Vec<ExecRecord>,
}

impl ExecutionEnvironment {
    /// Starts an environment from a base image
    ///
    /// # Errors
    ///
    /// Returns a runtime error if the image cannot be resolved.
    pub async fn from_image(
        runtime: Arc<dyn ContainerRuntime>,
        stage: StageId,
        image: &str,
    ) -> Result<Self, PipelineError> {
        let state = runtime.from_image(image).await?;
        tracing::debug!(stage = %stage, image = %image, state = %state, "Environment created");

        Ok(Self {
            runtime,
            stage,
            base_image: image.to_string(),
            state,
            workdir: "/".to_string(),
            env: Vec::new(),
            secrets: Vec::new(),
            vault: None,
            network: None,
            history: Vec::new(),
        })
    }

    /// Redacts vault secrets from captured output
    #[must_use]
    pub fn with_vault(mut self, vault: Arc<SecretVault>) -> Self {
        self.vault = Some(vault);
        self
    }

    /// Sets the working directory for later mounts and commands
    #[must_use]
    pub fn with_workdir(mut self, path: &str) -> Self {
        self.workdir = resolve_path(&self.workdir, path);
        self
    }

    /// Sets a plain environment variable; these are recorded in committed states
    #[must_use]
    pub fn with_env_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        match self.env.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.env.push((key, value)),
        }
        self
    }

    /// Exposes a secret as an environment variable to later commands only
    #[must_use]
    pub fn with_secret_variable(mut self, name: impl Into<String>, secret: &Secret) -> Self {
        let name = name.into();
        self.secrets.retain(|(n, _)| *n != name);
        self.secrets.push((name, secret.clone()));
        self
    }

    /// Makes the scope's services reachable from later commands
    #[must_use]
    pub fn with_services(mut self, scope: &ServiceScope) -> Self {
        self.network = Some(scope.network().clone());
        tracing::debug!(stage = %self.stage, hosts = ?scope.hostnames(), "Services attached");
        self
    }

    /// Mounts a source at `target`, committing a new state
    ///
    /// # Errors
    ///
    /// Returns a runtime error if the copy fails.
    pub async fn with_mounted(
        mut self,
        target: &str,
        source: &MountSource,
    ) -> Result<Self, PipelineError> {
        let target = resolve_path(&self.workdir, target);
        let state = self
            .runtime
            .copy_in(&self.state, &source.to_copy_source(), &target)
            .await?;
        tracing::debug!(stage = %self.stage, source = %source, target = %target, "Mounted");
        self.state = state;
        Ok(self)
    }

    /// Mounts a file artifact at `target`
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::MissingOutput`] if the handle is not a file.
    pub async fn with_file(
        self,
        target: &str,
        handle: &ArtifactHandle,
    ) -> Result<Self, PipelineError> {
        if handle.kind() != ArtifactKind::File {
            return Err(PipelineError::MissingOutput {
                stage: handle.stage(),
                path: handle.path().to_string(),
                expected: ArtifactKind::File.to_string(),
            });
        }
        self.with_mounted(target, &MountSource::from(handle)).await
    }

    /// Runs a command that must succeed, committing its result
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::StageExecution`] with the captured stderr
    /// when the command exits non-zero.
    pub async fn with_exec<I, S>(mut self, argv: I) -> Result<Self, PipelineError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let request = self.request(argv, true)?;
        let command = request.command_line();
        tracing::info!(stage = %self.stage, command = %command, "Executing");

        let outcome = self.runtime.exec(&self.state, &request).await?;
        let output = self.scrub(outcome.output);
        log_output(self.stage, &output);

        if !output.is_success() {
            return Err(PipelineError::StageExecution {
                stage: self.stage,
                command,
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        let state = outcome.state.unwrap_or_else(|| self.state.clone());
        self.history.push(ExecRecord {
            command,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            state: state.clone(),
        });
        self.state = state;
        Ok(self)
    }

    /// Runs a command without committing and without failing on non-zero exit
    ///
    /// # Errors
    ///
    /// Returns a runtime error only if the command could not be run at all.
    pub async fn try_exec<I, S>(&self, argv: I) -> Result<ExecOutput, PipelineError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let request = self.request(argv, false)?;
        tracing::debug!(stage = %self.stage, command = %request.command_line(), "Probing");
        let outcome = self.runtime.exec(&self.state, &request).await?;
        Ok(self.scrub(outcome.output))
    }

    /// Extracts a file output
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::MissingOutput`] if no file exists at `path`.
    pub async fn file(&self, path: &str) -> Result<ArtifactHandle, PipelineError> {
        self.extract(path, ArtifactKind::File).await
    }

    /// Extracts a directory output
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::MissingOutput`] if no directory exists at `path`.
    pub async fn directory(&self, path: &str) -> Result<ArtifactHandle, PipelineError> {
        self.extract(path, ArtifactKind::Directory).await
    }

    async fn extract(
        &self,
        path: &str,
        expected: ArtifactKind,
    ) -> Result<ArtifactHandle, PipelineError> {
        let path = resolve_path(&self.workdir, path);
        match self.runtime.stat(&self.state, &path).await? {
            Some(kind) if kind == expected => Ok(ArtifactHandle::new(
                self.stage,
                path,
                kind,
                self.state.clone(),
            )),
            _ => Err(PipelineError::MissingOutput {
                stage: self.stage,
                path,
                expected: expected.to_string(),
            }),
        }
    }

    fn request<I, S>(&self, argv: I, commit: bool) -> Result<ExecRequest, PipelineError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv: Vec<String> = argv.into_iter().map(Into::into).collect();
        if argv.is_empty() {
            return Err(PipelineError::Configuration(format!(
                "stage '{}' issued an empty command",
                self.stage
            )));
        }
        Ok(ExecRequest {
            argv,
            workdir: Some(self.workdir.clone()),
            env: self.env.clone(),
            secrets: self.secrets.clone(),
            network: self.network.clone(),
            commit,
        })
    }

    fn scrub(&self, output: ExecOutput) -> ExecOutput {
        match &self.vault {
            Some(vault) => ExecOutput {
                exit_code: output.exit_code,
                stdout: vault.redact(&output.stdout),
                stderr: vault.redact(&output.stderr),
            },
            None => output,
        }
    }

    /// Stage this environment belongs to
    #[must_use]
    pub fn stage(&self) -> StageId {
        self.stage
    }

    /// Base image reference
    #[must_use]
    pub fn base_image(&self) -> &str {
        &self.base_image
    }

    /// Current committed state
    #[must_use]
    pub fn state(&self) -> &StateRef {
        &self.state
    }

    /// Working directory
    #[must_use]
    pub fn workdir(&self) -> &str {
        &self.workdir
    }

    /// Committed commands, in order
    #[must_use]
    pub fn history(&self) -> &[ExecRecord] {
        &self.history
    }

    /// Standard output of the last committed command
    #[must_use]
    pub fn stdout(&self) -> Option<&str> {
        self.history.last().map(|record| record.stdout.as_str())
    }
}

impl std::fmt::Debug for ExecutionEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEnvironment")
            .field("stage", &self.stage)
            .field("base_image", &self.base_image)
            .field("state", &self.state)
            .field("workdir", &self.workdir)
            .field("env", &self.env)
            .field("secrets", &self.secrets.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field("network", &self.network)
            .field("history", &self.history.len())
            .finish_non_exhaustive()
    }
}

fn log_output(stage: StageId, output: &ExecOutput) {
    if !output.stdout.trim().is_empty() {
        tracing::debug!(stage = %stage, stdout = %output.stdout.trim_end(), "Command stdout");
    }
    if !output.stderr.trim().is_empty() {
        tracing::debug!(stage = %stage, stderr = %output.stderr.trim_end(), "Command stderr");
    }
}

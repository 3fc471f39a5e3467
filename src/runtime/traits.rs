//! Container runtime traits
//!
//! This module defines the seam between the pipeline domain and the
//! container engine that actually runs images, commits layers, hosts
//! side-car services and talks to registries.

use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;

use crate::pipeline::{ArtifactKind, Secret};

/// Result type for runtime operations
pub type RuntimeResult<T = ()> = Result<T, RuntimeError>;

/// Errors raised by a container runtime backend
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// The runtime binary or daemon cannot be reached
    #[error("{runtime} is not available: {reason}")]
    Unavailable {
        /// Runtime name.
        runtime: String,
        /// Why it is unavailable.
        reason: String,
    },

    /// A runtime process could not be spawned
    #[error("failed to spawn `{command}`: {reason}")]
    Spawn {
        /// Rendered command line.
        command: String,
        /// Underlying I/O error.
        reason: String,
    },

    /// A runtime management command exited non-zero
    #[error("`{command}` exited with code {code}: {stderr}")]
    CommandFailed {
        /// Rendered command line.
        command: String,
        /// Exit code.
        code: i32,
        /// Captured standard error.
        stderr: String,
    },

    /// A runtime command produced output that could not be interpreted
    #[error("unexpected output from `{command}`: {output}")]
    UnexpectedOutput {
        /// Rendered command line.
        command: String,
        /// The offending output.
        output: String,
    },

    /// A referenced state, service, network or credential does not exist
    #[error("unknown {kind}: {id}")]
    NotFound {
        /// Kind of object.
        kind: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// The registry refused an operation
    #[error("registry rejected {target}: {reason}")]
    Registry {
        /// Registry host or tag involved.
        target: String,
        /// Reason reported by the registry.
        reason: String,
    },
}

/// Reference to a committed, immutable filesystem state
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StateRef {
    /// The empty state
    Scratch,
    /// A committed image, identified by the runtime
    Image(String),
}

impl fmt::Display for StateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scratch => write!(f, "scratch"),
            Self::Image(id) => write!(f, "{id}"),
        }
    }
}

/// A private network that service bindings are attached to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetworkRef(pub String);

impl fmt::Display for NetworkRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A running side-car service
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceId(pub String);

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An image produced by a build step
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageId(pub String);

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry credentials held by the runtime on behalf of one auth call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Registry host the credentials are valid for
    pub registry: String,
    /// Account name
    pub username: String,
    /// Runtime-side handle to the stored credential material
    pub id: String,
}

/// Where a copy into a state reads from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopySource {
    /// An absolute path inside another committed state
    State {
        /// The state to read from.
        state: StateRef,
        /// Absolute path within that state.
        path: String,
        /// File or directory.
        kind: ArtifactKind,
    },
    /// A path on the orchestrator host
    Host {
        /// Host path.
        path: PathBuf,
        /// File or directory.
        kind: ArtifactKind,
    },
}

/// A single command execution request
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    /// Program and arguments, executed without a shell
    pub argv: Vec<String>,
    /// Working directory inside the state
    pub workdir: Option<String>,
    /// Plain environment variables, recorded in the committed state
    pub env: Vec<(String, String)>,
    /// Secret environment variables, visible to this process only
    pub secrets: Vec<(String, Secret)>,
    /// Private network to join
    pub network: Option<NetworkRef>,
    /// Whether a successful execution is committed to a new state
    pub commit: bool,
}

impl ExecRequest {
    /// Creates a committing request for the given argv
    #[must_use]
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            commit: true,
            ..Self::default()
        }
    }

    /// Renders the argv as a shell-quoted command line
    #[must_use]
    pub fn command_line(&self) -> String {
        shell_words::join(&self.argv)
    }
}

/// Captured result of one command execution
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecOutput {
    /// Exit code (-1 when killed by a signal)
    pub exit_code: i32,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

impl ExecOutput {
    /// Returns true if the command exited with zero
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Outcome of [`ContainerRuntime::exec`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    /// Captured output
    pub output: ExecOutput,
    /// New state, present when the command succeeded and a commit was requested
    pub state: Option<StateRef>,
}

/// Named cache volume mounted into a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheVolume {
    /// Volume name, shared across runs
    pub name: String,
    /// Mount point inside the service
    pub target: String,
}

/// Long-running side-car description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    /// Logical hostname on the private network
    pub hostname: String,
    /// Image reference or built image id
    pub image: String,
    /// Port the service listens on
    pub port: u16,
    /// Launch arguments, replacing the image's default command
    pub args: Vec<String>,
    /// Cache volumes
    pub volumes: Vec<CacheVolume>,
    /// Run with elevated capabilities
    pub privileged: bool,
}

impl ServiceSpec {
    /// Creates a service description
    #[must_use]
    pub fn new(hostname: impl Into<String>, image: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            image: image.into(),
            port,
            args: Vec::new(),
            volumes: Vec::new(),
            privileged: false,
        }
    }

    /// Sets launch arguments
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a named cache volume
    #[must_use]
    pub fn with_cache_volume(mut self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.volumes.push(CacheVolume {
            name: name.into(),
            target: target.into(),
        });
        self
    }

    /// Runs the service with elevated capabilities
    #[must_use]
    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }
}

/// Image build request against an assembled context
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BuildRequest {
    /// Dockerfile path within the context
    pub dockerfile: String,
    /// Non-confidential build arguments
    pub build_args: Vec<(String, String)>,
}

/// Trait for container engines driving the pipeline
#[async_trait]
#[allow(clippy::missing_errors_doc)]
pub trait ContainerRuntime: Send + Sync {
    /// Short runtime name used in logs
    fn name(&self) -> &str;

    /// Checks whether the runtime can be used
    async fn is_available(&self) -> bool;

    /// Resolves a base image into a state
    async fn from_image(&self, image: &str) -> RuntimeResult<StateRef>;

    /// Copies a file or directory into `target` on top of `base`, committing a new state
    async fn copy_in(
        &self,
        base: &StateRef,
        source: &CopySource,
        target: &str,
    ) -> RuntimeResult<StateRef>;

    /// Runs one command on top of `state`
    async fn exec(&self, state: &StateRef, request: &ExecRequest) -> RuntimeResult<ExecOutcome>;

    /// Reports what kind of entry lives at `path`, if any
    async fn stat(&self, state: &StateRef, path: &str) -> RuntimeResult<Option<ArtifactKind>>;

    /// Creates a private network
    async fn create_network(&self, name: &str) -> RuntimeResult<NetworkRef>;

    /// Removes a private network
    async fn remove_network(&self, network: &NetworkRef) -> RuntimeResult<()>;

    /// Starts a side-car reachable as `spec.hostname` on `network`
    async fn start_service(
        &self,
        spec: &ServiceSpec,
        network: &NetworkRef,
    ) -> RuntimeResult<ServiceId>;

    /// Stops and removes a side-car
    async fn stop_service(&self, id: &ServiceId) -> RuntimeResult<()>;

    /// Builds an image from an assembled context state
    async fn build_image(
        &self,
        context: &StateRef,
        request: &BuildRequest,
    ) -> RuntimeResult<ImageId>;

    /// Authenticates against a registry
    async fn login(
        &self,
        registry: &str,
        username: &str,
        token: &Secret,
    ) -> RuntimeResult<Credentials>;

    /// Pushes `image` under `tag`, returning the pushed content digest
    async fn push(
        &self,
        image: &ImageId,
        tag: &str,
        credentials: &Credentials,
    ) -> RuntimeResult<String>;

    /// Discards the credential material behind `credentials`
    async fn logout(&self, credentials: &Credentials) -> RuntimeResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_request_defaults_to_commit() {
        let request = ExecRequest::new(vec!["echo".to_string(), "a b".to_string()]);
        assert!(request.commit);
        assert_eq!(request.command_line(), "echo 'a b'");
    }

    #[test]
    fn test_state_ref_display() {
        assert_eq!(StateRef::Scratch.to_string(), "scratch");
        assert_eq!(StateRef::Image("sha256:abc".into()).to_string(), "sha256:abc");
    }

    #[test]
    fn test_service_spec_builder() {
        let spec = ServiceSpec::new("mlflow_server", "ghcr.io/mlflow/mlflow:latest", 5000)
            .with_args(["mlflow", "server"])
            .with_cache_volume("mlflow_cache", "/root/.cache/mlflow");

        assert_eq!(spec.args, vec!["mlflow", "server"]);
        assert_eq!(spec.volumes.len(), 1);
        assert!(!spec.privileged);
        assert!(spec.privileged().privileged);
    }
}

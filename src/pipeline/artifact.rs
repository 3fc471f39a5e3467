//! Artifact handles and mount sources
//!
//! An [`ArtifactHandle`] names a file or directory inside a committed stage
//! state. Later stages mount or copy it without the bytes ever passing
//! through the orchestrator host.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use super::errors::PipelineError;
use super::run::StageId;
use crate::runtime::{CopySource, StateRef};

/// Whether an artifact is a single file or a directory tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// A regular file
    File,
    /// A directory tree
    Directory,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Directory => write!(f, "directory"),
        }
    }
}

/// Immutable reference to an output of a stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactHandle {
    stage: StageId,
    path: String,
    kind: ArtifactKind,
    state: StateRef,
}

impl ArtifactHandle {
    pub(crate) fn new(stage: StageId, path: String, kind: ArtifactKind, state: StateRef) -> Self {
        Self {
            stage,
            path,
            kind,
            state,
        }
    }

    /// Stage that produced the artifact
    #[must_use]
    pub fn stage(&self) -> StageId {
        self.stage
    }

    /// Absolute logical path inside the producing state
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// File or directory
    #[must_use]
    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    /// Committed state the artifact lives in
    #[must_use]
    pub fn state(&self) -> &StateRef {
        &self.state
    }
}

impl fmt::Display for ArtifactHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.stage, self.path, self.kind)
    }
}

/// Something that can be mounted into an environment or a build context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    /// Output of an earlier stage
    Artifact(ArtifactHandle),
    /// A path from the source checkout
    Host {
        /// Host path.
        path: PathBuf,
        /// File or directory.
        kind: ArtifactKind,
    },
}

impl MountSource {
    /// File or directory
    #[must_use]
    pub fn kind(&self) -> ArtifactKind {
        match self {
            Self::Artifact(handle) => handle.kind(),
            Self::Host { kind, .. } => *kind,
        }
    }

    pub(crate) fn to_copy_source(&self) -> CopySource {
        match self {
            Self::Artifact(handle) => CopySource::State {
                state: handle.state().clone(),
                path: handle.path().to_string(),
                kind: handle.kind(),
            },
            Self::Host { path, kind } => CopySource::Host {
                path: path.clone(),
                kind: *kind,
            },
        }
    }
}

impl From<ArtifactHandle> for MountSource {
    fn from(handle: ArtifactHandle) -> Self {
        Self::Artifact(handle)
    }
}

impl From<&ArtifactHandle> for MountSource {
    fn from(handle: &ArtifactHandle) -> Self {
        Self::Artifact(handle.clone())
    }
}

impl fmt::Display for MountSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Artifact(handle) => write!(f, "{handle}"),
            Self::Host { path, kind } => write!(f, "host:{} ({kind})", path.display()),
        }
    }
}

/// The host checkout the pipeline was invoked on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTree {
    root: PathBuf,
}

impl SourceTree {
    /// Opens a source tree rooted at `root`
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `root` is not a directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(PipelineError::Configuration(format!(
                "source tree '{}' is not a directory",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    /// Root directory on the host
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The whole tree as a directory mount
    #[must_use]
    pub fn as_mount(&self) -> MountSource {
        MountSource::Host {
            path: self.root.clone(),
            kind: ArtifactKind::Directory,
        }
    }

    /// A file relative to the root
    #[must_use]
    pub fn file(&self, relative: &str) -> MountSource {
        MountSource::Host {
            path: self.root.join(relative),
            kind: ArtifactKind::File,
        }
    }

    /// A directory relative to the root
    #[must_use]
    pub fn directory(&self, relative: &str) -> MountSource {
        MountSource::Host {
            path: self.root.join(relative),
            kind: ArtifactKind::Directory,
        }
    }
}

/// Normalizes a logical path: collapses `.` and repeated slashes, drops trailing slashes
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let parts: Vec<&str> = path
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect();
    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else {
        joined
    }
}

/// Resolves `path` against `workdir` into an absolute normalized path
#[must_use]
pub fn resolve_path(workdir: &str, path: &str) -> String {
    if path.starts_with('/') {
        normalize_path(path)
    } else {
        normalize_path(&format!("{}/{path}", workdir.trim_end_matches('/')))
    }
}

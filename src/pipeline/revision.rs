//! Source revision lookup
//!
//! Content-specific tags use the first seven hex characters of the checkout's
//! HEAD commit. The lookup is fallible and never falls back to a default.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use tokio::process::Command;

use super::errors::PipelineError;

/// Length of the short revision used in tags
pub const SHORT_REVISION_LEN: usize = 7;

/// Abbreviated commit identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ShortRevision(String);

impl ShortRevision {
    /// Shortens a full revision identifier
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::RevisionLookup`] unless `full` starts with at
    /// least seven hex characters.
    pub fn from_full(full: &str) -> Result<Self, PipelineError> {
        let full = full.trim();
        let hex_prefix = full.chars().take_while(char::is_ascii_hexdigit).count();
        if hex_prefix < SHORT_REVISION_LEN || hex_prefix != full.len() {
            return Err(PipelineError::RevisionLookup {
                reason: format!("'{full}' is not a commit identifier"),
            });
        }
        Ok(Self(full[..SHORT_REVISION_LEN].to_ascii_lowercase()))
    }

    /// The short identifier
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShortRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where the current revision comes from
#[async_trait]
pub trait RevisionSource: Send + Sync {
    /// Full revision identifier of the checkout's HEAD
    async fn head(&self, checkout: &Path) -> Result<String, PipelineError>;
}

/// Asks git for `HEAD`, trusting the checkout regardless of its owner
#[derive(Debug, Clone, Default)]
pub struct GitRevision;

#[async_trait]
impl RevisionSource for GitRevision {
    async fn head(&self, checkout: &Path) -> Result<String, PipelineError> {
        let output = Command::new("git")
            .arg("-c")
            .arg(format!("safe.directory={}", checkout.display()))
            .args(["rev-parse", "HEAD"])
            .current_dir(checkout)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| PipelineError::RevisionLookup {
                reason: format!("failed to run git: {e}"),
            })?;

        if !output.status.success() {
            return Err(PipelineError::RevisionLookup {
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// A fixed revision, for callers that already know it
#[derive(Debug, Clone)]
pub struct StaticRevision(pub String);

#[async_trait]
impl RevisionSource for StaticRevision {
    async fn head(&self, _checkout: &Path) -> Result<String, PipelineError> {
        Ok(self.0.clone())
    }
}

/// Looks up and shortens the checkout's revision
///
/// # Errors
///
/// Returns [`PipelineError::RevisionLookup`] if the lookup fails or yields
/// something that is not a commit identifier.
pub async fn lookup_short_revision(
    source: &dyn RevisionSource,
    checkout: &Path,
) -> Result<ShortRevision, PipelineError> {
    let full = source.head(checkout).await?;
    let short = ShortRevision::from_full(&full)?;
    tracing::debug!(checkout = %checkout.display(), revision = %short, "Resolved revision");
    Ok(short)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_revision() {
        let rev = ShortRevision::from_full("abc123456\n").unwrap();
        assert_eq!(rev.as_str(), "abc1234");
        assert_eq!(serde_json::to_string(&rev).unwrap(), r#""abc1234""#);
    }

    #[test]
    fn test_rejects_non_revisions() {
        for bad in ["", "abc12", "fatal: not a git repository", "ghijklmnop"] {
            assert!(
                matches!(
                    ShortRevision::from_full(bad),
                    Err(PipelineError::RevisionLookup { .. })
                ),
                "accepted {bad:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_static_source() {
        let source = StaticRevision("0123456789abcdef".to_string());
        let rev = lookup_short_revision(&source, Path::new(".")).await.unwrap();
        assert_eq!(rev.to_string(), "0123456");
    }

    #[tokio::test]
    async fn test_git_outside_repository_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = lookup_short_revision(&GitRevision, dir.path()).await;
        assert!(matches!(result, Err(PipelineError::RevisionLookup { .. })));
    }
}

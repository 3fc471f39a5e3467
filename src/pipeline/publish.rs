//! Registry publishing
//!
//! Tags are pushed one at a time in the caller's order. There is no
//! multi-tag transaction: when a later push fails, earlier tags have already
//! moved and are reported as such.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::errors::PipelineError;
use super::secret::Secret;
use crate::runtime::{ContainerRuntime, Credentials, ImageId};

/// A tag that now points at a pushed digest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResult {
    /// Full tag reference
    pub tag: String,
    /// Content digest the tag points at
    pub digest: String,
}

/// Proof of a successful registry login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    credentials: Credentials,
}

impl AuthContext {
    /// Registry host
    #[must_use]
    pub fn registry(&self) -> &str {
        &self.credentials.registry
    }

    /// Account name
    #[must_use]
    pub fn username(&self) -> &str {
        &self.credentials.username
    }
}

/// Authenticates and pushes images
#[derive(Clone)]
pub struct RegistryPublisher {
    runtime: Arc<dyn ContainerRuntime>,
}

impl RegistryPublisher {
    /// Creates a publisher
    #[must_use]
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Logs in to `registry`
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Authentication`] if the registry refuses.
    pub async fn authenticate(
        &self,
        registry: &str,
        username: &str,
        token: &Secret,
    ) -> Result<AuthContext, PipelineError> {
        let credentials = self
            .runtime
            .login(registry, username, token)
            .await
            .map_err(|e| PipelineError::Authentication {
                registry: registry.to_string(),
                reason: e.to_string(),
            })?;
        tracing::info!(registry = %registry, username = %username, "Authenticated");
        Ok(AuthContext { credentials })
    }

    /// Discards the login behind `auth`
    ///
    /// A failure is logged; the pushes it guarded have already happened.
    pub async fn logout(&self, auth: AuthContext) {
        match self.runtime.logout(&auth.credentials).await {
            Ok(()) => tracing::debug!(registry = %auth.registry(), "Logged out"),
            Err(e) => tracing::warn!(registry = %auth.registry(), error = %e, "Logout failed"),
        }
    }

    /// Pushes `image` under one tag
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Publish`] if the push fails.
    pub async fn publish(
        &self,
        image: &ImageId,
        tag: &str,
        auth: &AuthContext,
    ) -> Result<PublishResult, PipelineError> {
        let digest = self
            .runtime
            .push(image, tag, &auth.credentials)
            .await
            .map_err(|e| PipelineError::Publish {
                tag: tag.to_string(),
                reason: e.to_string(),
            })?;
        tracing::info!(tag = %tag, digest = %digest, "Published");
        Ok(PublishResult {
            tag: tag.to_string(),
            digest,
        })
    }

    /// Pushes `image` under each tag in order
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Publish`] if the first push fails, and
    /// [`PipelineError::PublishPartialFailure`] listing the tags that already
    /// moved if a later push fails.
    pub async fn publish_all(
        &self,
        image: &ImageId,
        tags: &[String],
        auth: &AuthContext,
    ) -> Result<Vec<PublishResult>, PipelineError> {
        let mut pushed: Vec<PublishResult> = Vec::with_capacity(tags.len());
        for tag in tags {
            match self.publish(image, tag, auth).await {
                Ok(result) => {
                    if let Some(first) = pushed.first()
                        && first.digest != result.digest
                    {
                        tracing::warn!(
                            tag = %result.tag,
                            digest = %result.digest,
                            expected = %first.digest,
                            "Tag resolved to a different digest than its siblings"
                        );
                    }
                    pushed.push(result);
                }
                Err(err) if pushed.is_empty() => return Err(err),
                Err(err) => {
                    let reason = match err {
                        PipelineError::Publish { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    tracing::error!(
                        failed = %tag,
                        pushed = ?pushed.iter().map(|p| p.tag.as_str()).collect::<Vec<_>>(),
                        "Publish partially failed; pushed tags were not rolled back"
                    );
                    return Err(PipelineError::PublishPartialFailure {
                        pushed,
                        failed: tag.clone(),
                        reason,
                    });
                }
            }
        }
        Ok(pushed)
    }
}

impl std::fmt::Debug for RegistryPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryPublisher")
            .field("runtime", &self.runtime.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FakeRuntime;
    use pretty_assertions::assert_eq;

    fn tags(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| (*v).to_string()).collect()
    }

    async fn setup() -> (FakeRuntime, RegistryPublisher, AuthContext, ImageId) {
        let fake = FakeRuntime::new();
        let image = fake.seed_image("built");
        let publisher = RegistryPublisher::new(Arc::new(fake.clone()));
        let auth = publisher
            .authenticate("docker.io", "alice", &Secret::new("DOCKERHUB_TOKEN", "tok"))
            .await
            .unwrap();
        (fake, publisher, auth, image)
    }

    #[tokio::test]
    async fn test_publish_all_same_digest() {
        let (fake, publisher, auth, image) = setup().await;
        let results = publisher
            .publish_all(&image, &tags(&["acme/repo:abc1234", "acme/repo:latest"]), &auth)
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].digest, results[1].digest);
        assert_eq!(fake.registry_digest("acme/repo:latest"), Some(results[0].digest.clone()));
    }

    #[tokio::test]
    async fn test_first_push_failure_moves_nothing() {
        let (fake, publisher, auth, image) = setup().await;
        fake.fail_push("acme/repo:abc1234");

        let err = publisher
            .publish_all(&image, &tags(&["acme/repo:abc1234", "acme/repo:latest"]), &auth)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Publish { .. }));
        assert_eq!(fake.registry_digest("acme/repo:latest"), None);
    }

    #[tokio::test]
    async fn test_partial_failure_reports_moved_tags() {
        let (fake, publisher, auth, image) = setup().await;
        fake.preload_tag("acme/repo:latest", "sha256:old");
        fake.fail_push("acme/repo:latest");

        let err = publisher
            .publish_all(&image, &tags(&["acme/repo:abc1234", "acme/repo:latest"]), &auth)
            .await
            .unwrap_err();

        match err {
            PipelineError::PublishPartialFailure { pushed, failed, .. } => {
                assert_eq!(pushed.len(), 1);
                assert_eq!(pushed[0].tag, "acme/repo:abc1234");
                assert_eq!(
                    fake.registry_digest("acme/repo:abc1234"),
                    Some(pushed[0].digest.clone())
                );
                assert_eq!(failed, "acme/repo:latest");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fake.registry_digest("acme/repo:latest"), Some("sha256:old".to_string()));
        assert!(fake.registry_digest("acme/repo:abc1234").is_some());
    }

    #[tokio::test]
    async fn test_logout_discards_login() {
        let (fake, publisher, auth, image) = setup().await;
        assert_eq!(fake.active_logins(), 1);

        publisher.logout(auth.clone()).await;

        assert_eq!(fake.active_logins(), 0);
        let err = publisher
            .publish(&image, "acme/repo:abc1234", &auth)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Publish { .. }));
        assert_eq!(fake.registry_digest("acme/repo:abc1234"), None);
    }

    #[tokio::test]
    async fn test_rejected_login() {
        let fake = FakeRuntime::new();
        fake.reject_login();
        let publisher = RegistryPublisher::new(Arc::new(fake));

        let err = publisher
            .authenticate("docker.io", "alice", &Secret::new("T", "bad"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Authentication { .. }));
    }
}

//! Image names and tag plans

use std::fmt;

use super::revision::ShortRevision;

/// `<owner>/<repository>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageName {
    owner: String,
    repository: String,
}

impl ImageName {
    /// Creates an image name
    #[must_use]
    pub fn new(owner: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repository: repository.into(),
        }
    }

    /// Namespace owner
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Repository
    #[must_use]
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Full reference for `tag`
    #[must_use]
    pub fn tagged(&self, tag: &str) -> String {
        format!("{self}:{tag}")
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repository)
    }
}

/// Ordered tags one build is published under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagPlan {
    image: ImageName,
    tags: Vec<String>,
}

impl TagPlan {
    /// Pipeline tags: the short revision, then `latest`
    #[must_use]
    pub fn pipeline(image: ImageName, revision: &ShortRevision) -> Self {
        Self {
            image,
            tags: vec![revision.to_string(), "latest".to_string()],
        }
    }

    /// Release tags: `v<version>`, the revision, `latest`, then the team
    #[must_use]
    pub fn release(image: ImageName, version: &str, revision: &str, team: &str) -> Self {
        let version = version.trim_start_matches('v');
        let mut tags = vec![format!("v{version}"), revision.to_string(), "latest".to_string()];
        if !team.is_empty() {
            tags.push(team.to_string());
        }
        Self { image, tags }
    }

    /// The image name
    #[must_use]
    pub fn image(&self) -> &ImageName {
        &self.image
    }

    /// Bare tags, in push order
    #[must_use]
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Full references, in push order
    #[must_use]
    pub fn references(&self) -> Vec<String> {
        self.tags.iter().map(|tag| self.image.tagged(tag)).collect()
    }

    /// The content-specific reference
    #[must_use]
    pub fn primary(&self) -> String {
        self.references().into_iter().next().unwrap_or_else(|| self.image.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_plan() {
        let revision = ShortRevision::from_full("abc123456").unwrap();
        let plan = TagPlan::pipeline(ImageName::new("owner", "repo"), &revision);

        assert_eq!(plan.references(), vec!["owner/repo:abc1234", "owner/repo:latest"]);
        assert_eq!(plan.primary(), "owner/repo:abc1234");
    }

    #[test]
    fn test_release_plan() {
        let plan = TagPlan::release(
            ImageName::new("acme", "house-price-predictor-service"),
            "v1.2.0",
            "abc1234",
            "mlops",
        );
        assert_eq!(plan.tags(), ["v1.2.0", "abc1234", "latest", "mlops"]);

        let plan = TagPlan::release(ImageName::new("acme", "svc"), "1.0", "abc1234", "");
        assert_eq!(plan.tags(), ["v1.0", "abc1234", "latest"]);
    }
}

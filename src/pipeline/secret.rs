//! Secret material
//!
//! Credentials are read from the environment once, before any container
//! work, and held in a [`SecretVault`]. A [`Secret`] never prints its value
//! and is not serializable, so it cannot leak into logs, run reports or
//! build arguments by accident.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::errors::PipelineError;
use crate::infrastructure::CredentialsConfig;

const REDACTED: &str = "[REDACTED]";

/// A named confidential value
#[derive(Clone, PartialEq, Eq)]
pub struct Secret {
    name: String,
    value: Arc<str>,
}

impl Secret {
    /// Wraps a value
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl AsRef<str>) -> Self {
        Self {
            name: name.into(),
            value: Arc::from(value.as_ref()),
        }
    }

    /// Secret name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reveals the value; only runtime backends handing it to a process should call this
    #[must_use]
    pub fn expose_secret(&self) -> &str {
        &self.value
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("name", &self.name)
            .field("value", &REDACTED)
            .finish()
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

/// Registry credentials and namespace, validated at startup
#[derive(Clone)]
pub struct SecretVault {
    username: String,
    owner: String,
    token_name: String,
    secrets: BTreeMap<String, Secret>,
}

impl SecretVault {
    /// Loads credentials from the process environment
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Configuration`] naming every missing variable.
    pub fn from_env(config: &CredentialsConfig) -> Result<Self, PipelineError> {
        Self::load(config, |name| std::env::var(name).ok())
    }

    /// Loads credentials through `lookup`; empty values count as missing
    ///
    /// The owner namespace falls back to the registry username when its
    /// variable is unset.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Configuration`] naming every missing variable.
    pub fn load<F>(config: &CredentialsConfig, lookup: F) -> Result<Self, PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let present = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let username = present(&config.username_var);
        let token = present(&config.token_var);

        let missing: Vec<&str> = [
            (username.is_none(), config.username_var.as_str()),
            (token.is_none(), config.token_var.as_str()),
        ]
        .into_iter()
        .filter_map(|(absent, name)| absent.then_some(name))
        .collect();

        let (Some(username), Some(token)) = (username, token) else {
            return Err(PipelineError::Configuration(format!(
                "{} must be set",
                missing.join(" and ")
            )));
        };

        let owner = present(&config.owner_var).unwrap_or_else(|| username.clone());

        let mut secrets = BTreeMap::new();
        secrets.insert(
            config.token_var.clone(),
            Secret::new(config.token_var.clone(), token),
        );

        Ok(Self {
            username,
            owner,
            token_name: config.token_var.clone(),
            secrets,
        })
    }

    /// Registry account name
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Namespace images are published under
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// The registry access token
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the vault was built without a token.
    pub fn registry_token(&self) -> Result<&Secret, PipelineError> {
        self.get(&self.token_name)
    }

    /// Looks up a secret by name
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unknown names.
    pub fn get(&self, name: &str) -> Result<&Secret, PipelineError> {
        self.secrets
            .get(name)
            .ok_or_else(|| PipelineError::Configuration(format!("secret '{name}' is not loaded")))
    }

    /// Returns true if `text` contains any secret value
    #[must_use]
    pub fn leaks_into(&self, text: &str) -> bool {
        self.secrets
            .values()
            .any(|secret| !secret.expose_secret().is_empty() && text.contains(secret.expose_secret()))
    }

    /// Replaces every secret value in `text`
    #[must_use]
    pub fn redact(&self, text: &str) -> String {
        self.secrets
            .values()
            .filter(|secret| !secret.expose_secret().is_empty())
            .fold(text.to_string(), |acc, secret| {
                acc.replace(secret.expose_secret(), REDACTED)
            })
    }
}

impl fmt::Debug for SecretVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretVault")
            .field("username", &self.username)
            .field("owner", &self.owner)
            .field("secrets", &self.secrets.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = Secret::new("DOCKERHUB_TOKEN", "dckr_pat_123");
        assert!(!format!("{secret:?}").contains("dckr_pat_123"));
        assert_eq!(secret.to_string(), "[REDACTED]");
        assert_eq!(secret.expose_secret(), "dckr_pat_123");
    }

    #[test]
    fn test_missing_username_is_fatal() {
        let config = CredentialsConfig::default();
        let err = SecretVault::load(&config, lookup(&[("DOCKERHUB_TOKEN", "t")])).unwrap_err();

        match err {
            PipelineError::Configuration(message) => {
                assert!(message.contains("DOCKERHUB_USERNAME"));
                assert!(!message.contains("DOCKERHUB_TOKEN"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_values_count_as_missing() {
        let config = CredentialsConfig::default();
        let err = SecretVault::load(
            &config,
            lookup(&[("DOCKERHUB_USERNAME", " "), ("DOCKERHUB_TOKEN", "")]),
        )
        .unwrap_err();

        assert!(err.to_string().contains("DOCKERHUB_USERNAME and DOCKERHUB_TOKEN"));
    }

    #[test]
    fn test_owner_defaults_to_username() {
        let config = CredentialsConfig::default();
        let vault = SecretVault::load(
            &config,
            lookup(&[("DOCKERHUB_USERNAME", "alice"), ("DOCKERHUB_TOKEN", "t0k")]),
        )
        .unwrap();
        assert_eq!(vault.owner(), "alice");

        let vault = SecretVault::load(
            &config,
            lookup(&[
                ("DOCKERHUB_USERNAME", "alice"),
                ("DOCKERHUB_TOKEN", "t0k"),
                ("DOCKER_USERID", "acme"),
            ]),
        )
        .unwrap();
        assert_eq!(vault.owner(), "acme");
        assert_eq!(vault.username(), "alice");
    }

    #[test]
    fn test_redact_and_leak_detection() {
        let config = CredentialsConfig::default();
        let vault = SecretVault::load(
            &config,
            lookup(&[("DOCKERHUB_USERNAME", "alice"), ("DOCKERHUB_TOKEN", "t0k3n")]),
        )
        .unwrap();

        assert!(vault.leaks_into("--password t0k3n"));
        assert!(!vault.leaks_into("--password ****"));
        assert_eq!(vault.redact("login t0k3n ok"), "login [REDACTED] ok");
        assert!(!format!("{vault:?}").contains("t0k3n"));
        assert_eq!(vault.registry_token().unwrap().name(), "DOCKERHUB_TOKEN");
    }
}

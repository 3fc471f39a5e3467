//! Bounded readiness polling
//!
//! A probe environment issues `curl -fsS <url>` until the service answers,
//! the attempt budget runs out, or the service answers with an error.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::environment::ExecutionEnvironment;
use super::errors::PipelineError;
use crate::runtime::ExecOutput;

/// curl exit codes meaning "nobody is answering yet"
const NOT_READY_CODES: [i32; 5] = [6, 7, 28, 52, 56];

/// How long and how often to poll a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessPolicy {
    /// Wait before the first probe, in milliseconds
    pub initial_delay_ms: u64,
    /// Wait between probes, in milliseconds
    pub interval_ms: u64,
    /// Maximum number of probes
    pub max_attempts: u32,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 2_000,
            interval_ms: 2_000,
            max_attempts: 15,
        }
    }
}

impl ReadinessPolicy {
    /// A policy that never sleeps
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            initial_delay_ms: 0,
            interval_ms: 0,
            max_attempts,
        }
    }

    /// Delay before the first probe
    #[must_use]
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Delay between probes
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Upper bound on total waiting time
    #[must_use]
    pub fn budget(&self) -> Duration {
        self.initial_delay() + self.interval() * self.max_attempts.saturating_sub(1)
    }
}

/// How a single probe ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// The endpoint answered with success
    Ready,
    /// Nothing answered yet; try again
    NotReady,
    /// The endpoint answered with an error
    Failed,
}

/// Classifies one curl result
#[must_use]
pub fn classify(output: &ExecOutput) -> ProbeVerdict {
    match output.exit_code {
        0 => ProbeVerdict::Ready,
        code if NOT_READY_CODES.contains(&code) => ProbeVerdict::NotReady,
        _ => ProbeVerdict::Failed,
    }
}

/// Polls `url` from `env` until it answers with success
///
/// # Errors
///
/// Returns [`PipelineError::StageExecution`] when the endpoint answers with
/// an error, and [`PipelineError::HealthCheckTimeout`] when the attempt
/// budget is exhausted.
pub async fn wait_until_healthy(
    env: &ExecutionEnvironment,
    url: &str,
    policy: &ReadinessPolicy,
) -> Result<ExecOutput, PipelineError> {
    let attempts = policy.max_attempts.max(1);
    tracing::info!(
        url = %url,
        max_attempts = attempts,
        budget_ms = u64::try_from(policy.budget().as_millis()).unwrap_or(u64::MAX),
        "Waiting for service readiness"
    );
    tokio::time::sleep(policy.initial_delay()).await;

    let argv = probe_argv(url);
    let mut last_error = String::new();
    for attempt in 1..=attempts {
        let output = env.try_exec(argv.clone()).await?;
        match classify(&output) {
            ProbeVerdict::Ready => {
                tracing::info!(url = %url, attempt, "Service is healthy");
                return Ok(output);
            }
            ProbeVerdict::Failed => {
                return Err(PipelineError::StageExecution {
                    stage: env.stage(),
                    command: shell_words::join(&argv),
                    code: output.exit_code,
                    stderr: output.stderr.trim().to_string(),
                });
            }
            ProbeVerdict::NotReady => {
                tracing::debug!(url = %url, attempt, code = output.exit_code, "Service not ready");
                last_error = output.stderr.trim().to_string();
                if attempt < attempts {
                    tokio::time::sleep(policy.interval()).await;
                }
            }
        }
    }

    Err(PipelineError::HealthCheckTimeout {
        url: url.to_string(),
        attempts,
        last_error,
    })
}

fn probe_argv(url: &str) -> Vec<String> {
    ["curl", "-fsS", "--max-time", "5", url]
        .into_iter()
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StageId;
    use crate::runtime::{ContainerRuntime, FakeRuntime};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn output(code: i32) -> ExecOutput {
        ExecOutput {
            exit_code: code,
            ..ExecOutput::default()
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(&output(0)), ProbeVerdict::Ready);
        assert_eq!(classify(&output(7)), ProbeVerdict::NotReady);
        assert_eq!(classify(&output(6)), ProbeVerdict::NotReady);
        assert_eq!(classify(&output(22)), ProbeVerdict::Failed);
    }

    #[test]
    fn test_default_policy_budget() {
        let policy = ReadinessPolicy::default();
        assert_eq!(policy.budget(), Duration::from_secs(30));
        assert_eq!(ReadinessPolicy::immediate(3).budget(), Duration::ZERO);
    }

    async fn probe_env(fake: &FakeRuntime) -> ExecutionEnvironment {
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(fake.clone());
        ExecutionEnvironment::from_image(runtime, StageId::BuildAndPublish, "alpine/curl")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_retries_until_ready() {
        let fake = FakeRuntime::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        fake.on_exec("curl", move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                ExecOutput {
                    exit_code: 7,
                    stderr: "Connection refused".to_string(),
                    ..ExecOutput::default()
                }
            } else {
                ExecOutput {
                    stdout: r#"{"status":"healthy"}"#.to_string(),
                    ..ExecOutput::default()
                }
            }
        });

        let env = probe_env(&fake).await;
        let result = wait_until_healthy(&env, "http://app:8000/health", &ReadinessPolicy::immediate(5))
            .await
            .unwrap();

        assert!(result.stdout.contains("healthy"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_is_a_timeout() {
        let fake = FakeRuntime::new();
        fake.fail_exec("curl", 7, "Connection refused");

        let env = probe_env(&fake).await;
        let err = wait_until_healthy(&env, "http://app:8000/health", &ReadinessPolicy::immediate(3))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            PipelineError::HealthCheckTimeout {
                url: "http://app:8000/health".to_string(),
                attempts: 3,
                last_error: "Connection refused".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_http_error_fails_immediately() {
        let fake = FakeRuntime::new();
        fake.fail_exec("curl", 22, "The requested URL returned error: 404");

        let env = probe_env(&fake).await;
        let err = wait_until_healthy(&env, "http://app:8000/health", &ReadinessPolicy::immediate(10))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::StageExecution { code: 22, .. }));
    }
}

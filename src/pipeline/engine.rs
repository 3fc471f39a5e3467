//! Pipeline engine
//!
//! Runs the fixed stage sequence, threads each stage's declared outputs
//! forward and stops at the first failure. Nothing already done is undone:
//! tags pushed before a failure stay pushed.
//!
//! The vulnerability scan runs after publishing and only reports. It cannot
//! keep an image from being published in this ordering.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

use super::artifact::SourceTree;
use super::errors::PipelineError;
use super::revision::{GitRevision, RevisionSource, ShortRevision, lookup_short_revision};
use super::run::{PipelineRun, RunStatus, StageId, StageRecord};
use super::secret::SecretVault;
use super::stages::{
    OutputValue, PREPROCESSOR, PROCESSED_DATA, PUBLISHED_IMAGE, SCAN_REPORT, Stage, StageContext,
    StageInputs, StageOutputs, TRAINED_MODEL, standard_stages,
};
use super::tags::{ImageName, TagPlan};
use crate::infrastructure::PipelineConfig;
use crate::runtime::ContainerRuntime;

/// Sequences the stages of one pipeline
pub struct PipelineEngine {
    config: Arc<PipelineConfig>,
    runtime: Arc<dyn ContainerRuntime>,
    vault: Arc<SecretVault>,
    revisions: Arc<dyn RevisionSource>,
    stages: Vec<Box<dyn Stage>>,
}

impl PipelineEngine {
    /// Creates an engine running the four standard stages
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Configuration`] if `config` is inconsistent.
    pub fn new(
        config: PipelineConfig,
        runtime: Arc<dyn ContainerRuntime>,
        vault: SecretVault,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            runtime,
            vault: Arc::new(vault),
            revisions: Arc::new(GitRevision),
            stages: standard_stages(),
        })
    }

    /// Replaces the revision source
    #[must_use]
    pub fn with_revision_source(mut self, source: impl RevisionSource + 'static) -> Self {
        self.revisions = Arc::new(source);
        self
    }

    /// Replaces the stage list
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<Box<dyn Stage>>) -> Self {
        self.stages = stages;
        self
    }

    /// Stage ids, in execution order
    #[must_use]
    pub fn stages(&self) -> Vec<StageId> {
        self.stages.iter().map(|stage| stage.id()).collect()
    }

    /// The configuration this engine runs with
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs every stage in order against `source`
    ///
    /// A stage failure does not produce an `Err`: the returned run is marked
    /// `Failed(stage)` and carries the error.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::RevisionLookup`] if the source revision cannot
    /// be determined; no stage runs in that case.
    pub async fn run(&self, source: &SourceTree) -> Result<PipelineRun, PipelineError> {
        let revision = lookup_short_revision(self.revisions.as_ref(), source.root()).await?;
        let mut run = PipelineRun::start(revision.clone());
        tracing::info!(
            run_id = %run.id,
            revision = %revision,
            runtime = %self.runtime.name(),
            stages = self.stages.len(),
            "Pipeline started"
        );

        let ctx = StageContext::new(
            Arc::clone(&self.runtime),
            Arc::clone(&self.config),
            Arc::clone(&self.vault),
            revision,
        );
        let mut inputs = StageInputs::new(source.clone());

        for stage in &self.stages {
            let id = stage.id();
            let span = tracing::info_span!("stage", stage = %id);
            let started_at = Utc::now();
            let clock = Instant::now();

            let outcome = async {
                tracing::info!(title = id.title(), "Stage started");
                stage.run(&ctx, &inputs).await
            }
            .instrument(span.clone())
            .await;

            let outcome = outcome.and_then(|outputs| {
                record_outputs(&mut run, &outputs);
                let names = outputs.names();
                inputs.absorb(id, outputs).map(|()| names)
            });

            match outcome {
                Ok(names) => {
                    span.in_scope(|| {
                        tracing::info!(
                            duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX),
                            outputs = ?names,
                            "Stage succeeded"
                        );
                    });
                    run.stages
                        .push(StageRecord::success(id, started_at, clock.elapsed(), names));
                }
                Err(err) => {
                    if let PipelineError::PublishPartialFailure { pushed, .. } = &err {
                        run.published.extend(pushed.iter().cloned());
                    }
                    span.in_scope(|| {
                        tracing::error!(kind = err.kind(), error = %err, "Stage failed");
                    });
                    run.stages
                        .push(StageRecord::failure(id, started_at, clock.elapsed(), &err));
                    run.status = RunStatus::Failed(id);
                    run.error = Some(err);
                    tracing::error!(run_id = %run.id, stage = %id, "Pipeline failed");
                    return Ok(run);
                }
            }
        }

        tracing::info!(run_id = %run.id, published = run.published.len(), "Pipeline succeeded");
        Ok(run)
    }
}

impl std::fmt::Debug for PipelineEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineEngine")
            .field("runtime", &self.runtime.name())
            .field("stages", &self.stages())
            .field("vault", &self.vault)
            .finish_non_exhaustive()
    }
}

fn record_outputs(run: &mut PipelineRun, outputs: &StageOutputs) {
    if let Some(OutputValue::Image(image)) = outputs.get(PUBLISHED_IMAGE) {
        run.published.extend(image.results.iter().cloned());
    }
    if let Some(OutputValue::Report(report)) = outputs.get(SCAN_REPORT) {
        run.scan_report = Some(report.clone());
    }
}

/// One stage as it would run, without doing any container work
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedStage {
    /// Stage id
    pub stage: StageId,
    /// Base images the stage starts environments from
    pub images: Vec<String>,
    /// Side-car hostnames the stage binds
    pub services: Vec<String>,
    /// Inputs consumed from earlier stages
    pub consumes: Vec<&'static str>,
    /// Outputs declared
    pub declares: Vec<&'static str>,
    /// Tags pushed
    pub tags: Vec<String>,
}

/// Describes the standard pipeline for `owner` at `revision`
#[must_use]
pub fn plan(config: &PipelineConfig, owner: &str, revision: &ShortRevision) -> Vec<PlannedStage> {
    let tags = TagPlan::pipeline(
        ImageName::new(owner, &config.registry.repository),
        revision,
    );

    vec![
        PlannedStage {
            stage: StageId::DataProcessing,
            images: vec![config.base_image.clone()],
            services: Vec::new(),
            consumes: Vec::new(),
            declares: vec![PROCESSED_DATA, PREPROCESSOR],
            tags: Vec::new(),
        },
        PlannedStage {
            stage: StageId::ModelTraining,
            images: vec![config.base_image.clone(), config.tracking.image.clone()],
            services: vec![config.tracking.hostname.clone()],
            consumes: vec![PROCESSED_DATA, PREPROCESSOR],
            declares: vec![TRAINED_MODEL],
            tags: Vec::new(),
        },
        PlannedStage {
            stage: StageId::BuildAndPublish,
            images: vec![config.service.probe_image.clone()],
            services: vec![config.service.hostname.clone()],
            consumes: vec![TRAINED_MODEL],
            declares: vec![PUBLISHED_IMAGE],
            tags: tags.references(),
        },
        PlannedStage {
            stage: StageId::VulnerabilityScan,
            images: vec![config.scan.image.clone()],
            services: Vec::new(),
            consumes: vec![PUBLISHED_IMAGE],
            declares: vec![SCAN_REPORT],
            tags: Vec::new(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::CredentialsConfig;
    use crate::pipeline::StaticRevision;
    use crate::runtime::{FakeRuntime, RuntimeCall};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct Scripted {
        id: StageId,
        fail: bool,
        log: Arc<Mutex<Vec<StageId>>>,
    }

    #[async_trait]
    impl Stage for Scripted {
        fn id(&self) -> StageId {
            self.id
        }

        async fn run(
            &self,
            _ctx: &StageContext,
            _inputs: &StageInputs,
        ) -> Result<StageOutputs, PipelineError> {
            self.log.lock().push(self.id);
            if self.fail {
                return Err(PipelineError::StageExecution {
                    stage: self.id,
                    command: "false".to_string(),
                    code: 1,
                    stderr: "boom".to_string(),
                });
            }
            Ok(StageOutputs::new())
        }
    }

    fn vault() -> SecretVault {
        SecretVault::load(&CredentialsConfig::default(), |name| match name {
            "DOCKERHUB_USERNAME" => Some("alice".to_string()),
            "DOCKERHUB_TOKEN" => Some("tok".to_string()),
            _ => None,
        })
        .unwrap()
    }

    fn engine(fake: &FakeRuntime) -> PipelineEngine {
        PipelineEngine::new(PipelineConfig::default(), Arc::new(fake.clone()), vault())
            .unwrap()
            .with_revision_source(StaticRevision("abc123456".to_string()))
    }

    #[tokio::test]
    async fn test_fail_fast_for_every_position() {
        for failing in 0..StageId::ALL.len() {
            let log = Arc::new(Mutex::new(Vec::new()));
            let stages: Vec<Box<dyn Stage>> = StageId::ALL
                .iter()
                .enumerate()
                .map(|(i, id)| {
                    Box::new(Scripted {
                        id: *id,
                        fail: i == failing,
                        log: Arc::clone(&log),
                    }) as Box<dyn Stage>
                })
                .collect();

            let fake = FakeRuntime::new();
            let dir = tempfile::tempdir().unwrap();
            let run = engine(&fake)
                .with_stages(stages)
                .run(&SourceTree::open(dir.path()).unwrap())
                .await
                .unwrap();

            assert_eq!(run.status, RunStatus::Failed(StageId::ALL[failing]));
            assert_eq!(log.lock().clone(), StageId::ALL[..=failing].to_vec());
            assert_eq!(run.executed(), StageId::ALL[..=failing].to_vec());
            assert_eq!(run.error.as_ref().map(PipelineError::kind), Some("stage_execution"));
        }
    }

    #[tokio::test]
    async fn test_revision_failure_runs_nothing() {
        struct Broken;

        #[async_trait]
        impl RevisionSource for Broken {
            async fn head(&self, _checkout: &std::path::Path) -> Result<String, PipelineError> {
                Err(PipelineError::RevisionLookup {
                    reason: "detected dubious ownership".to_string(),
                })
            }
        }

        let fake = FakeRuntime::new();
        let dir = tempfile::tempdir().unwrap();
        let err = engine(&fake)
            .with_revision_source(Broken)
            .run(&SourceTree::open(dir.path()).unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::RevisionLookup { .. }));
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_at_construction() {
        let config = PipelineConfig {
            workdir: "relative".to_string(),
            ..PipelineConfig::default()
        };
        let result = PipelineEngine::new(config, Arc::new(FakeRuntime::new()), vault());
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_first_stage_failure_builds_nothing() {
        let fake = FakeRuntime::new();
        fake.fail_exec("run_processing.py", 1, "FileNotFoundError: data/raw/house_data.csv");
        let dir = tempfile::tempdir().unwrap();

        let run = engine(&fake)
            .run(&SourceTree::open(dir.path()).unwrap())
            .await
            .unwrap();

        assert_eq!(run.failed_stage(), Some(StageId::DataProcessing));
        assert!(!fake
            .calls()
            .iter()
            .any(|call| matches!(call, RuntimeCall::BuildImage { .. } | RuntimeCall::Push { .. })));
    }

    #[test]
    fn test_plan_lists_tags_and_services() {
        let revision = ShortRevision::from_full("abc123456").unwrap();
        let planned = plan(&PipelineConfig::default(), "acme", &revision);

        let stages: Vec<StageId> = planned.iter().map(|p| p.stage).collect();
        assert_eq!(stages, StageId::ALL.to_vec());
        assert_eq!(planned[1].services, vec!["mlflow_server".to_string()]);
        assert_eq!(
            planned[2].tags,
            vec![
                "acme/house-price-predictor-service:abc1234".to_string(),
                "acme/house-price-predictor-service:latest".to_string(),
            ]
        );
    }
}

//! The four pipeline stages
//!
//! Each stage receives the source tree and every output declared by earlier
//! stages, and declares its own outputs by name. Nothing else crosses a
//! stage boundary.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

use super::artifact::{ArtifactHandle, SourceTree};
use super::context::{BuildArgs, BuildContextAssembler};
use super::environment::ExecutionEnvironment;
use super::errors::PipelineError;
use super::probe::wait_until_healthy;
use super::publish::{PublishResult, RegistryPublisher};
use super::revision::ShortRevision;
use super::run::StageId;
use super::secret::SecretVault;
use super::service::ServiceBindingManager;
use super::tags::{ImageName, TagPlan};
use crate::infrastructure::PipelineConfig;
use crate::runtime::{ContainerRuntime, ImageId, ServiceSpec};

/// Feature-engineered dataset
pub const PROCESSED_DATA: &str = "processed_data";
/// Fitted preprocessor
pub const PREPROCESSOR: &str = "preprocessor";
/// Trained model directory
pub const TRAINED_MODEL: &str = "trained_model";
/// Published service image
pub const PUBLISHED_IMAGE: &str = "published_image";
/// Scanner report
pub const SCAN_REPORT: &str = "scan_report";

/// An image pushed under one or more tags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedImage {
    /// The content-specific reference later stages address
    pub reference: String,
    /// Local image id
    pub image: ImageId,
    /// Every tag pushed, in order
    pub results: Vec<PublishResult>,
}

/// A declared stage output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputValue {
    /// A file or directory
    Artifact(ArtifactHandle),
    /// A published image
    Image(PublishedImage),
    /// A textual report
    Report(String),
}

impl From<ArtifactHandle> for OutputValue {
    fn from(handle: ArtifactHandle) -> Self {
        Self::Artifact(handle)
    }
}

impl From<PublishedImage> for OutputValue {
    fn from(image: PublishedImage) -> Self {
        Self::Image(image)
    }
}

/// Outputs declared by one stage, in declaration order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageOutputs {
    entries: Vec<(String, OutputValue)>,
}

impl StageOutputs {
    /// Creates an empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares an output
    #[must_use]
    pub fn declare(mut self, name: impl Into<String>, value: impl Into<OutputValue>) -> Self {
        self.entries.push((name.into(), value.into()));
        self
    }

    /// Looks up an output by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&OutputValue> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Declared names
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(n, _)| n.clone()).collect()
    }
}

/// What a stage can see: the source tree plus everything declared before it
#[derive(Debug, Clone)]
pub struct StageInputs {
    source: SourceTree,
    outputs: Vec<(StageId, String, OutputValue)>,
}

impl StageInputs {
    /// Starts with only the source tree
    #[must_use]
    pub fn new(source: SourceTree) -> Self {
        Self {
            source,
            outputs: Vec::new(),
        }
    }

    /// The original source tree
    #[must_use]
    pub fn source(&self) -> &SourceTree {
        &self.source
    }

    /// Adds a finished stage's outputs
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::DuplicateOutput`] if a name is already taken;
    /// nothing is added in that case.
    pub fn absorb(&mut self, stage: StageId, outputs: StageOutputs) -> Result<(), PipelineError> {
        for (i, (name, _)) in outputs.entries.iter().enumerate() {
            let clash = self.outputs.iter().any(|(_, n, _)| n == name)
                || outputs.entries[..i].iter().any(|(n, _)| n == name);
            if clash {
                return Err(PipelineError::DuplicateOutput {
                    stage,
                    name: name.clone(),
                });
            }
        }
        self.outputs.extend(
            outputs
                .entries
                .into_iter()
                .map(|(name, value)| (stage, name, value)),
        );
        Ok(())
    }

    /// Names of every output declared so far, with their producers
    #[must_use]
    pub fn declared(&self) -> Vec<(StageId, String)> {
        self.outputs
            .iter()
            .map(|(stage, name, _)| (*stage, name.clone()))
            .collect()
    }

    fn lookup(&self, consumer: StageId, name: &str) -> Result<&OutputValue, PipelineError> {
        self.outputs
            .iter()
            .find(|(_, n, _)| n == name)
            .map(|(_, _, value)| value)
            .ok_or_else(|| PipelineError::MissingInput {
                stage: consumer,
                name: name.to_string(),
            })
    }

    /// An artifact output
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::MissingInput`] if no artifact has that name.
    pub fn artifact(&self, consumer: StageId, name: &str) -> Result<&ArtifactHandle, PipelineError> {
        match self.lookup(consumer, name)? {
            OutputValue::Artifact(handle) => Ok(handle),
            _ => Err(PipelineError::MissingInput {
                stage: consumer,
                name: name.to_string(),
            }),
        }
    }

    /// A published image output
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::MissingInput`] if no image has that name.
    pub fn published_image(
        &self,
        consumer: StageId,
        name: &str,
    ) -> Result<&PublishedImage, PipelineError> {
        match self.lookup(consumer, name)? {
            OutputValue::Image(image) => Ok(image),
            _ => Err(PipelineError::MissingInput {
                stage: consumer,
                name: name.to_string(),
            }),
        }
    }
}

/// Shared, read-only collaborators of every stage
#[derive(Clone)]
pub struct StageContext {
    /// Container runtime
    pub runtime: Arc<dyn ContainerRuntime>,
    /// Pipeline configuration
    pub config: Arc<PipelineConfig>,
    /// Loaded credentials
    pub vault: Arc<SecretVault>,
    /// Short source revision
    pub revision: ShortRevision,
    /// Side-car scopes
    pub services: ServiceBindingManager,
    /// Registry access
    pub publisher: RegistryPublisher,
}

impl StageContext {
    /// Creates a context
    #[must_use]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        config: Arc<PipelineConfig>,
        vault: Arc<SecretVault>,
        revision: ShortRevision,
    ) -> Self {
        Self {
            services: ServiceBindingManager::new(Arc::clone(&runtime)),
            publisher: RegistryPublisher::new(Arc::clone(&runtime)),
            runtime,
            config,
            vault,
            revision,
        }
    }

    /// Starts an environment whose captured output is scrubbed of secrets
    ///
    /// # Errors
    ///
    /// Returns a runtime error if the image cannot be resolved.
    pub async fn environment(
        &self,
        stage: StageId,
        image: &str,
    ) -> Result<ExecutionEnvironment, PipelineError> {
        let env = ExecutionEnvironment::from_image(Arc::clone(&self.runtime), stage, image).await?;
        Ok(env.with_vault(Arc::clone(&self.vault)))
    }

    /// The image name builds are published under
    #[must_use]
    pub fn image_name(&self) -> ImageName {
        ImageName::new(self.vault.owner(), &self.config.registry.repository)
    }

    async fn python_base(
        &self,
        stage: StageId,
        source: &SourceTree,
    ) -> Result<ExecutionEnvironment, PipelineError> {
        let layout = &self.config.layout;
        self.environment(stage, &self.config.base_image)
            .await?
            .with_workdir(&self.config.workdir)
            .with_mounted(".", &source.as_mount())
            .await?
            .with_exec(["python", "-m", "pip", "install", "--upgrade", "pip"])
            .await?
            .with_exec(["python", "-m", "pip", "install", "-r", layout.requirements.as_str()])
            .await
    }
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("runtime", &self.runtime.name())
            .field("revision", &self.revision)
            .field("vault", &self.vault)
            .finish_non_exhaustive()
    }
}

/// One step of the pipeline
#[async_trait]
pub trait Stage: Send + Sync {
    /// Which stage this is
    fn id(&self) -> StageId;

    /// Runs the stage and declares its outputs
    async fn run(
        &self,
        ctx: &StageContext,
        inputs: &StageInputs,
    ) -> Result<StageOutputs, PipelineError>;
}

/// The standard stage list, in order
#[must_use]
pub fn standard_stages() -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(DataProcessing),
        Box::new(ModelTraining),
        Box::new(BuildAndPublish),
        Box::new(VulnerabilityScan),
    ]
}

/// Cleaning and feature engineering
#[derive(Debug, Clone, Copy, Default)]
pub struct DataProcessing;

#[async_trait]
impl Stage for DataProcessing {
    fn id(&self) -> StageId {
        StageId::DataProcessing
    }

    async fn run(
        &self,
        ctx: &StageContext,
        inputs: &StageInputs,
    ) -> Result<StageOutputs, PipelineError> {
        let layout = &ctx.config.layout;
        let env = ctx
            .python_base(self.id(), inputs.source())
            .await?
            .with_exec([
                "python",
                layout.cleaning_script.as_str(),
                "--input-file",
                layout.raw_data.as_str(),
                "--output-file",
                layout.cleaned_data.as_str(),
            ])
            .await?
            .with_exec([
                "python",
                layout.features_script.as_str(),
                "--input",
                layout.cleaned_data.as_str(),
                "--output",
                layout.featured_data.as_str(),
                "--preprocessor",
                layout.preprocessor.as_str(),
            ])
            .await?;

        let processed = env.file(&layout.featured_data).await?;
        let preprocessor = env.file(&layout.preprocessor).await?;

        Ok(StageOutputs::new()
            .declare(PROCESSED_DATA, processed)
            .declare(PREPROCESSOR, preprocessor))
    }
}

/// Training against a scoped tracking server
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelTraining;

#[async_trait]
impl Stage for ModelTraining {
    fn id(&self) -> StageId {
        StageId::ModelTraining
    }

    async fn run(
        &self,
        ctx: &StageContext,
        inputs: &StageInputs,
    ) -> Result<StageOutputs, PipelineError> {
        let config = &ctx.config;
        let layout = &config.layout;
        let processed = inputs.artifact(self.id(), PROCESSED_DATA)?;
        let preprocessor = inputs.artifact(self.id(), PREPROCESSOR)?;

        let env = ctx
            .python_base(self.id(), inputs.source())
            .await?
            .with_file(&layout.featured_data, processed)
            .await?
            .with_file(&layout.preprocessor, preprocessor)
            .await?;

        let tracking = &config.tracking;
        let mut scope = ctx.services.open_scope(self.id()).await?;
        let result = async {
            let server = scope
                .bind(
                    ServiceSpec::new(&tracking.hostname, &tracking.image, tracking.port)
                        .with_args([
                            "mlflow",
                            "server",
                            "--host",
                            "0.0.0.0",
                            "--backend-store-uri",
                            tracking.backend_store_uri.as_str(),
                            "--default-artifact-root",
                            tracking.artifact_root.as_str(),
                        ])
                        .with_cache_volume(&tracking.cache_volume, &tracking.cache_target),
                )
                .await?;
            let tracking_uri = server.uri();

            let trained = env
                .with_services(&scope)
                .with_env_variable("MLFLOW_TRACKING_URI", tracking_uri.as_str())
                .with_exec([
                    "python",
                    layout.training_script.as_str(),
                    "--config",
                    layout.model_config.as_str(),
                    "--data",
                    layout.featured_data.as_str(),
                    "--models-dir",
                    layout.models_dir.as_str(),
                    "--mlflow-tracking-uri",
                    tracking_uri.as_str(),
                ])
                .await?;
            trained.directory(&layout.trained_model_dir).await
        }
        .await;
        let model = scope.finish(result).await?;

        Ok(StageOutputs::new().declare(TRAINED_MODEL, model))
    }
}

/// Image build, health check and publish
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildAndPublish;

#[async_trait]
impl Stage for BuildAndPublish {
    fn id(&self) -> StageId {
        StageId::BuildAndPublish
    }

    async fn run(
        &self,
        ctx: &StageContext,
        inputs: &StageInputs,
    ) -> Result<StageOutputs, PipelineError> {
        let config = &ctx.config;
        let layout = &config.layout;
        let model = inputs.artifact(self.id(), TRAINED_MODEL)?;
        let source = inputs.source();
        let plan = TagPlan::pipeline(ctx.image_name(), &ctx.revision);

        let assembler = layout
            .context_directories
            .iter()
            .fold(BuildContextAssembler::new(), |acc, dir| {
                acc.entry(dir, source.directory(dir))
            })
            .entry(&layout.trained_model_dir, model)
            .entry(&layout.dockerfile, source.file(&layout.dockerfile))
            .entry(&layout.requirements, source.file(&layout.requirements));
        let context = assembler.assemble(ctx.runtime.as_ref()).await?;

        let now = Utc::now();
        let args = BuildArgs::new()
            .with("CACHEBUST", now.timestamp_millis().to_string())
            .with("GIT_SHA_SHORT", ctx.revision.as_str())
            .with("BUILD_DATE", now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true));
        tracing::info!(image = %plan.primary(), "Building service image");
        let image = context
            .build(ctx.runtime.as_ref(), &layout.dockerfile, &args, &ctx.vault)
            .await?;

        let service = &config.service;
        let mut scope = ctx.services.open_scope(self.id()).await?;
        let health = async {
            let app = scope
                .bind(
                    ServiceSpec::new(&service.hostname, image.0.as_str(), service.port)
                        .with_args(service.args.iter().map(String::as_str))
                        .privileged(),
                )
                .await?;
            let probe = ctx
                .environment(self.id(), &service.probe_image)
                .await?
                .with_services(&scope);
            let url = format!("{}{}", app.uri(), service.health_path);
            wait_until_healthy(&probe, &url, &service.readiness).await
        }
        .await;
        let health = scope.finish(health).await?;
        tracing::info!(output = %health.stdout.trim(), "Health check passed");

        let auth = ctx
            .publisher
            .authenticate(
                &config.registry.host,
                ctx.vault.username(),
                ctx.vault.registry_token()?,
            )
            .await?;
        let published = ctx
            .publisher
            .publish_all(&image, &plan.references(), &auth)
            .await;
        ctx.publisher.logout(auth).await;
        let results = published?;

        Ok(StageOutputs::new().declare(
            PUBLISHED_IMAGE,
            PublishedImage {
                reference: plan.primary(),
                image,
                results,
            },
        ))
    }
}

/// Informational scan of the published image
#[derive(Debug, Clone, Copy, Default)]
pub struct VulnerabilityScan;

#[async_trait]
impl Stage for VulnerabilityScan {
    fn id(&self) -> StageId {
        StageId::VulnerabilityScan
    }

    async fn run(
        &self,
        ctx: &StageContext,
        inputs: &StageInputs,
    ) -> Result<StageOutputs, PipelineError> {
        let published = inputs.published_image(self.id(), PUBLISHED_IMAGE)?;
        let scan = &ctx.config.scan;
        tracing::info!(image = %published.reference, "Scanning image");

        let scanner = ctx
            .environment(self.id(), &scan.image)
            .await
            .map_err(scan_failure)?;
        let output = scanner
            .try_exec([
                "trivy",
                "image",
                "--severity",
                scan.severity.as_str(),
                published.reference.as_str(),
            ])
            .await
            .map_err(scan_failure)?;

        if !output.is_success() {
            return Err(PipelineError::ScanReport {
                reason: format!(
                    "scanner exited with code {}: {}",
                    output.exit_code,
                    output.stderr.trim()
                ),
            });
        }

        tracing::info!(image = %published.reference, report = %output.stdout, "Scan report");
        Ok(StageOutputs::new().declare(SCAN_REPORT, OutputValue::Report(output.stdout)))
    }
}

fn scan_failure(err: PipelineError) -> PipelineError {
    match err {
        PipelineError::ScanReport { .. } => err,
        other => PipelineError::ScanReport {
            reason: other.to_string(),
        },
    }
}

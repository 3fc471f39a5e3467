//! Pipeline domain types and logic
//!
//! Artifacts, secrets, execution environments, service scopes, build
//! contexts and publishing, plus the four stages and the engine that
//! sequences them.

pub mod artifact;
pub mod context;
pub mod engine;
pub mod environment;
pub mod errors;
pub mod probe;
pub mod publish;
pub mod revision;
pub mod run;
pub mod secret;
pub mod service;
pub mod stages;
pub mod tags;

pub use artifact::{ArtifactHandle, ArtifactKind, MountSource, SourceTree, normalize_path, resolve_path};
pub use context::{BuildArgs, BuildContextAssembler, ContextHandle};
pub use engine::{PipelineEngine, PlannedStage, plan};
pub use environment::{ExecRecord, ExecutionEnvironment};
pub use errors::PipelineError;
pub use probe::{ProbeVerdict, ReadinessPolicy, classify, wait_until_healthy};
pub use publish::{AuthContext, PublishResult, RegistryPublisher};
pub use revision::{
    GitRevision, RevisionSource, SHORT_REVISION_LEN, ShortRevision, StaticRevision,
    lookup_short_revision,
};
pub use run::{PipelineRun, RunStatus, StageId, StageRecord, StageStatus};
pub use secret::{Secret, SecretVault};
pub use service::{BindingHandle, ServiceBindingManager, ServiceScope};
pub use stages::{
    BuildAndPublish, DataProcessing, ModelTraining, OutputValue, PublishedImage, Stage,
    StageContext, StageInputs, StageOutputs, VulnerabilityScan, standard_stages,
};
pub use tags::{ImageName, TagPlan};

//! Prelude module for common imports

pub use crate::infrastructure::{PipelineConfig, init_logging};

pub use crate::pipeline::{
    ArtifactHandle, ArtifactKind, BuildArgs, BuildContextAssembler, ExecutionEnvironment,
    MountSource, PipelineEngine, PipelineError, PipelineRun, PublishResult, RegistryPublisher,
    RunStatus, Secret, SecretVault, ServiceBindingManager, ServiceScope, ShortRevision,
    SourceTree, Stage, StageContext, StageId, StageInputs, StageOutputs,
};

pub use crate::runtime::{ContainerRuntime, DockerRuntime, ExecOutput, ServiceSpec};

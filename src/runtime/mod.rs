//! Container runtime layer
//!
//! The [`ContainerRuntime`] trait is the only way the pipeline touches a
//! container engine. [`DockerRuntime`] drives the docker CLI; the in-memory
//! `FakeRuntime` backs the test suites.

mod docker;
#[cfg(any(test, feature = "test-support"))]
mod fake;
mod traits;

pub use docker::{DockerRuntime, parse_push_digest};
#[cfg(any(test, feature = "test-support"))]
pub use fake::{FakeExec, FakeRuntime, FakeService, RuntimeCall};
pub use traits::{
    BuildRequest, CacheVolume, ContainerRuntime, CopySource, Credentials, ExecOutcome, ExecOutput,
    ExecRequest, ImageId, NetworkRef, RuntimeError, RuntimeResult, ServiceId, ServiceSpec,
    StateRef,
};

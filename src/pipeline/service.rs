//! Service bindings
//!
//! Side-car services live inside a [`ServiceScope`], which owns a private
//! network. Hostnames bound in one scope resolve only for environments
//! attached to that scope. Releasing the scope stops every service and
//! removes the network; a scope dropped without release is torn down in
//! the background.

use futures::future::join_all;
use std::sync::Arc;
use uuid::Uuid;

use super::errors::PipelineError;
use super::run::StageId;
use crate::runtime::{ContainerRuntime, NetworkRef, RuntimeError, ServiceId, ServiceSpec};

/// A bound side-car
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingHandle {
    id: ServiceId,
    hostname: String,
    port: u16,
}

impl BindingHandle {
    /// Runtime service id
    #[must_use]
    pub fn id(&self) -> &ServiceId {
        &self.id
    }

    /// Logical hostname
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Exposed port
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `http://<hostname>:<port>`
    #[must_use]
    pub fn uri(&self) -> String {
        format!("http://{}:{}", self.hostname, self.port)
    }
}

/// Opens service scopes against a runtime
#[derive(Clone)]
pub struct ServiceBindingManager {
    runtime: Arc<dyn ContainerRuntime>,
}

impl ServiceBindingManager {
    /// Creates a manager
    #[must_use]
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Opens a scope with its own private network
    ///
    /// # Errors
    ///
    /// Returns a runtime error if the network cannot be created.
    pub async fn open_scope(&self, stage: StageId) -> Result<ServiceScope, PipelineError> {
        let name = format!("shipline-{stage}-{}", Uuid::new_v4().simple());
        let network = self.runtime.create_network(&name).await?;
        tracing::debug!(stage = %stage, network = %network, "Service scope opened");

        Ok(ServiceScope {
            runtime: Arc::clone(&self.runtime),
            stage,
            network,
            bindings: Vec::new(),
            released: false,
        })
    }
}

impl std::fmt::Debug for ServiceBindingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceBindingManager")
            .field("runtime", &self.runtime.name())
            .finish()
    }
}

/// The services of one stage
pub struct ServiceScope {
    runtime: Arc<dyn ContainerRuntime>,
    stage: StageId,
    network: NetworkRef,
    bindings: Vec<BindingHandle>,
    released: bool,
}

impl ServiceScope {
    /// Starts a service reachable as `spec.hostname` within this scope
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::DuplicateBinding`] if the hostname is taken,
    /// or a runtime error if the service cannot start.
    pub async fn bind(&mut self, spec: ServiceSpec) -> Result<BindingHandle, PipelineError> {
        if self.bindings.iter().any(|b| b.hostname == spec.hostname) {
            return Err(PipelineError::DuplicateBinding {
                hostname: spec.hostname,
            });
        }

        let id = self.runtime.start_service(&spec, &self.network).await?;
        tracing::info!(
            stage = %self.stage,
            hostname = %spec.hostname,
            image = %spec.image,
            port = spec.port,
            "Service bound"
        );

        let handle = BindingHandle {
            id,
            hostname: spec.hostname,
            port: spec.port,
        };
        self.bindings.push(handle.clone());
        Ok(handle)
    }

    /// Stops one service early
    ///
    /// # Errors
    ///
    /// Returns a runtime error if the service cannot be stopped; the binding
    /// then stays in the scope and is stopped again on release.
    pub async fn unbind(&mut self, handle: &BindingHandle) -> Result<(), PipelineError> {
        self.runtime.stop_service(&handle.id).await?;
        self.bindings.retain(|b| b.id != handle.id);
        tracing::info!(stage = %self.stage, hostname = %handle.hostname, "Service unbound");
        Ok(())
    }

    /// Stops every service and removes the network
    ///
    /// # Errors
    ///
    /// Returns the first teardown error; teardown still runs to completion.
    pub async fn release(mut self) -> Result<(), PipelineError> {
        self.released = true;
        let services: Vec<ServiceId> = self.bindings.drain(..).map(|b| b.id).collect();
        let errors = teardown(self.runtime.as_ref(), &services, &self.network).await;
        tracing::debug!(stage = %self.stage, network = %self.network, "Service scope released");
        match errors.into_iter().next() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Releases the scope and passes `result` through
    ///
    /// Teardown problems are logged; they never replace the stage result.
    pub async fn finish<T>(self, result: Result<T, PipelineError>) -> Result<T, PipelineError> {
        let stage = self.stage;
        if let Err(err) = self.release().await {
            tracing::warn!(stage = %stage, error = %err, "Service teardown failed");
        }
        result
    }

    /// The scope's private network
    #[must_use]
    pub fn network(&self) -> &NetworkRef {
        &self.network
    }

    /// Hostnames currently bound
    #[must_use]
    pub fn hostnames(&self) -> Vec<String> {
        self.bindings.iter().map(|b| b.hostname.clone()).collect()
    }

    /// Bindings currently held
    #[must_use]
    pub fn bindings(&self) -> &[BindingHandle] {
        &self.bindings
    }
}

impl Drop for ServiceScope {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let services: Vec<ServiceId> = self.bindings.drain(..).map(|b| b.id).collect();
        let network = self.network.clone();
        let runtime = Arc::clone(&self.runtime);
        let stage = self.stage;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!(stage = %stage, network = %network, "Releasing dropped service scope");
                handle.spawn(async move {
                    for err in teardown(runtime.as_ref(), &services, &network).await {
                        tracing::warn!(stage = %stage, error = %err, "Service teardown failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    stage = %stage,
                    network = %network,
                    services = services.len(),
                    "Service scope dropped outside a runtime; services leaked"
                );
            }
        }
    }
}

impl std::fmt::Debug for ServiceScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceScope")
            .field("stage", &self.stage)
            .field("network", &self.network)
            .field("bindings", &self.bindings)
            .field("released", &self.released)
            .finish()
    }
}

async fn teardown(
    runtime: &dyn ContainerRuntime,
    services: &[ServiceId],
    network: &NetworkRef,
) -> Vec<RuntimeError> {
    let stops = join_all(services.iter().map(|id| runtime.stop_service(id))).await;
    let mut errors: Vec<RuntimeError> = stops.into_iter().filter_map(Result::err).collect();
    if let Err(err) = runtime.remove_network(network).await {
        errors.push(err);
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FakeRuntime;

    fn manager() -> (FakeRuntime, ServiceBindingManager) {
        let fake = FakeRuntime::new();
        let manager = ServiceBindingManager::new(Arc::new(fake.clone()));
        (fake, manager)
    }

    #[tokio::test]
    async fn test_bind_and_release() {
        let (fake, manager) = manager();
        let mut scope = manager.open_scope(StageId::ModelTraining).await.unwrap();
        let handle = scope
            .bind(ServiceSpec::new("mlflow_server", "ghcr.io/mlflow/mlflow:latest", 5000))
            .await
            .unwrap();

        assert_eq!(handle.uri(), "http://mlflow_server:5000");
        assert_eq!(fake.running_services(), 1);
        assert_eq!(scope.hostnames(), vec!["mlflow_server".to_string()]);

        scope.release().await.unwrap();
        assert_eq!(fake.running_services(), 0);
        assert_eq!(fake.open_networks(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_hostname_rejected() {
        let (_fake, manager) = manager();
        let mut scope = manager.open_scope(StageId::BuildAndPublish).await.unwrap();
        scope.bind(ServiceSpec::new("app_service", "img", 8000)).await.unwrap();

        let err = scope
            .bind(ServiceSpec::new("app_service", "img", 8001))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            PipelineError::DuplicateBinding {
                hostname: "app_service".to_string()
            }
        );
        scope.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_unbind_stops_one_service() {
        let (fake, manager) = manager();
        let mut scope = manager.open_scope(StageId::ModelTraining).await.unwrap();
        let a = scope.bind(ServiceSpec::new("a", "img", 1)).await.unwrap();
        scope.bind(ServiceSpec::new("b", "img", 2)).await.unwrap();

        scope.unbind(&a).await.unwrap();
        assert_eq!(fake.running_services(), 1);
        assert_eq!(scope.hostnames(), vec!["b".to_string()]);
        scope.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_unbind_is_retried_on_release() {
        let (fake, manager) = manager();
        let mut scope = manager.open_scope(StageId::ModelTraining).await.unwrap();
        let handle = scope.bind(ServiceSpec::new("a", "img", 1)).await.unwrap();
        fake.fail_next_stop("a");

        assert!(scope.unbind(&handle).await.is_err());
        assert_eq!(scope.hostnames(), vec!["a".to_string()]);
        assert_eq!(fake.running_services(), 1);

        scope.release().await.unwrap();
        assert_eq!(fake.running_services(), 0);
        assert_eq!(fake.open_networks(), 0);
    }

    #[tokio::test]
    async fn test_finish_releases_on_failure() {
        let (fake, manager) = manager();
        let mut scope = manager.open_scope(StageId::ModelTraining).await.unwrap();
        scope.bind(ServiceSpec::new("mlflow_server", "img", 5000)).await.unwrap();

        let failure: Result<(), PipelineError> =
            Err(PipelineError::Configuration("training failed".to_string()));
        let result = scope.finish(failure).await;

        assert!(result.is_err());
        assert_eq!(fake.running_services(), 0);
        assert_eq!(fake.open_networks(), 0);
    }

    #[tokio::test]
    async fn test_dropped_scope_is_torn_down() {
        let (fake, manager) = manager();
        {
            let mut scope = manager.open_scope(StageId::ModelTraining).await.unwrap();
            scope.bind(ServiceSpec::new("mlflow_server", "img", 5000)).await.unwrap();
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(fake.running_services(), 0);
        assert_eq!(fake.open_networks(), 0);
    }
}

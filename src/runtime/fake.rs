//! In-memory container runtime for tests
//!
//! Simulates layered filesystem states, private networks, side-car
//! services, image builds and a registry. Commands are answered by
//! registered handlers; every runtime call is recorded.

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use super::traits::{
    BuildRequest, ContainerRuntime, CopySource, Credentials, ExecOutcome, ExecOutput, ExecRequest,
    ImageId, NetworkRef, RuntimeError, RuntimeResult, ServiceId, ServiceSpec, StateRef,
};
use crate::pipeline::{ArtifactKind, Secret, normalize_path};

type Tree = BTreeMap<String, Node>;
type Handler = Arc<dyn Fn(&mut FakeExec) -> ExecOutput + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    File(Vec<u8>),
    Dir,
}

/// Recorded runtime call
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum RuntimeCall {
    /// `from_image`
    FromImage { image: String },
    /// `copy_in`
    CopyIn { base: StateRef, target: String },
    /// `exec`; secret values are never recorded
    Exec {
        state: StateRef,
        argv: Vec<String>,
        workdir: Option<String>,
        env: Vec<(String, String)>,
        secret_names: Vec<String>,
        network: Option<NetworkRef>,
    },
    /// `stat`
    Stat { path: String },
    /// `create_network`
    CreateNetwork { name: String },
    /// `remove_network`
    RemoveNetwork { name: String },
    /// `start_service`
    StartService {
        hostname: String,
        image: String,
        network: String,
        privileged: bool,
    },
    /// `stop_service`
    StopService { id: ServiceId },
    /// `build_image`
    BuildImage {
        dockerfile: String,
        build_args: Vec<(String, String)>,
    },
    /// `login`
    Login { registry: String, username: String },
    /// `push`
    Push { image: ImageId, tag: String },
    /// `logout`
    Logout { registry: String },
}

/// A running fake side-car
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeService {
    /// Service id
    pub id: ServiceId,
    /// How it was started
    pub spec: ServiceSpec,
    /// Network it is attached to
    pub network: String,
    tree: Tree,
}

impl FakeService {
    /// Reads a file from the service image's filesystem
    #[must_use]
    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        match self.tree.get(&normalize_path(path)) {
            Some(Node::File(bytes)) => Some(bytes.clone()),
            _ => None,
        }
    }
}

/// The view a command handler gets of one execution
#[derive(Debug)]
pub struct FakeExec {
    /// Program and arguments
    pub argv: Vec<String>,
    /// Working directory
    pub workdir: String,
    /// Plain environment
    pub env: Vec<(String, String)>,
    secrets: Vec<(String, String)>,
    services: Vec<FakeService>,
    tree: Tree,
}

impl FakeExec {
    fn resolve(&self, path: &str) -> String {
        crate::pipeline::resolve_path(&self.workdir, path)
    }

    /// Value following `flag` in argv
    #[must_use]
    pub fn flag(&self, flag: &str) -> Option<&str> {
        self.argv
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.argv.get(i + 1))
            .map(String::as_str)
    }

    /// Plain environment variable
    #[must_use]
    pub fn env_var(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Secret environment variable
    #[must_use]
    pub fn secret(&self, name: &str) -> Option<&str> {
        self.secrets
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Reads a file, relative to the working directory
    #[must_use]
    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        match self.tree.get(&self.resolve(path)) {
            Some(Node::File(bytes)) => Some(bytes.clone()),
            _ => None,
        }
    }

    /// Returns true if a file or directory exists at `path`
    #[must_use]
    pub fn exists(&self, path: &str) -> bool {
        kind_at(&self.tree, &self.resolve(path)).is_some()
    }

    /// Writes a file, creating parent directories
    pub fn write_file(&mut self, path: &str, bytes: &[u8]) {
        let path = self.resolve(path);
        insert_file(&mut self.tree, &path, bytes.to_vec());
    }

    /// Creates a directory and its parents
    pub fn mkdir(&mut self, path: &str) {
        let path = self.resolve(path);
        insert_dir(&mut self.tree, &path);
    }

    /// The service answering at `hostname`, if reachable from this execution
    #[must_use]
    pub fn service(&self, hostname: &str) -> Option<&FakeService> {
        self.services.iter().find(|s| s.spec.hostname == hostname)
    }

    /// Returns true if `hostname` resolves from this execution
    #[must_use]
    pub fn reachable(&self, hostname: &str) -> bool {
        self.service(hostname).is_some()
    }
}

#[derive(Default)]
struct Inner {
    states: HashMap<String, Tree>,
    images: HashMap<String, String>,
    digests: HashMap<String, String>,
    next_id: u64,
    handlers: Vec<(String, Handler)>,
    calls: Vec<RuntimeCall>,
    networks: HashSet<String>,
    services: BTreeMap<String, FakeService>,
    registry: HashMap<String, String>,
    logins: HashSet<String>,
    failing_pushes: HashSet<String>,
    failing_stops: HashSet<String>,
    reject_login: bool,
    unavailable: bool,
}

impl Inner {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn commit_id(&mut self, tree: Tree) -> String {
        let id = self.next("fake-state");
        self.states.insert(id.clone(), tree);
        id
    }

    fn commit(&mut self, tree: Tree) -> StateRef {
        StateRef::Image(self.commit_id(tree))
    }

    fn tree(&self, state: &StateRef) -> RuntimeResult<Tree> {
        match state {
            StateRef::Scratch => Ok(Tree::new()),
            StateRef::Image(id) => self.states.get(id).cloned().ok_or_else(|| RuntimeError::NotFound {
                kind: "state",
                id: id.clone(),
            }),
        }
    }
}

/// In-memory [`ContainerRuntime`]
#[derive(Clone, Default)]
pub struct FakeRuntime {
    inner: Arc<Mutex<Inner>>,
}

impl FakeRuntime {
    /// Creates an empty runtime where every command succeeds silently
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers commands whose argv mentions `needle`; later registrations win
    pub fn on_exec<F>(&self, needle: &str, handler: F)
    where
        F: Fn(&mut FakeExec) -> ExecOutput + Send + Sync + 'static,
    {
        self.inner
            .lock()
            .handlers
            .push((needle.to_string(), Arc::new(handler)));
    }

    /// Makes commands mentioning `needle` exit with `code` and `stderr`
    pub fn fail_exec(&self, needle: &str, code: i32, stderr: &str) {
        let stderr = stderr.to_string();
        self.on_exec(needle, move |_| ExecOutput {
            exit_code: code,
            stdout: String::new(),
            stderr: stderr.clone(),
        });
    }

    /// Every call made so far
    #[must_use]
    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.inner.lock().calls.clone()
    }

    /// Commits a state holding the given files
    pub fn seed_state(&self, files: &[(&str, &[u8])]) -> StateRef {
        let mut tree = Tree::new();
        for (path, bytes) in files {
            insert_file(&mut tree, &normalize_path(path), bytes.to_vec());
        }
        self.inner.lock().commit(tree)
    }

    /// Registers a pushable image with an empty filesystem
    pub fn seed_image(&self, name: &str) -> ImageId {
        let mut inner = self.inner.lock();
        let state_id = inner.commit_id(Tree::new());
        let digest = format!("sha256:{:x}", Sha256::digest(name.as_bytes()));
        inner.images.insert(digest.clone(), state_id);
        inner.digests.insert(digest.clone(), digest.clone());
        ImageId(digest)
    }

    /// Reads a file from a committed state
    #[must_use]
    pub fn read(&self, state: &StateRef, path: &str) -> Option<Vec<u8>> {
        let inner = self.inner.lock();
        match inner.tree(state).ok()?.get(&normalize_path(path)) {
            Some(Node::File(bytes)) => Some(bytes.clone()),
            _ => None,
        }
    }

    /// Running services
    #[must_use]
    pub fn services(&self) -> Vec<FakeService> {
        self.inner.lock().services.values().cloned().collect()
    }

    /// Number of running services
    #[must_use]
    pub fn running_services(&self) -> usize {
        self.inner.lock().services.len()
    }

    /// Number of networks not yet removed
    #[must_use]
    pub fn open_networks(&self) -> usize {
        self.inner.lock().networks.len()
    }

    /// Digest a tag currently points at
    #[must_use]
    pub fn registry_digest(&self, tag: &str) -> Option<String> {
        self.inner.lock().registry.get(tag).cloned()
    }

    /// Number of logins not yet logged out
    #[must_use]
    pub fn active_logins(&self) -> usize {
        self.inner.lock().logins.len()
    }

    /// Points `tag` at `digest` as if pushed by an earlier run
    pub fn preload_tag(&self, tag: &str, digest: &str) {
        self.inner
            .lock()
            .registry
            .insert(tag.to_string(), digest.to_string());
    }

    /// Makes pushes of `tag` fail
    pub fn fail_push(&self, tag: &str) {
        self.inner.lock().failing_pushes.insert(tag.to_string());
    }

    /// Makes the next stop of the service bound as `hostname` fail
    pub fn fail_next_stop(&self, hostname: &str) {
        self.inner.lock().failing_stops.insert(hostname.to_string());
    }

    /// Makes every login fail
    pub fn reject_login(&self) {
        self.inner.lock().reject_login = true;
    }

    /// Makes [`ContainerRuntime::is_available`] report false
    pub fn set_unavailable(&self) {
        self.inner.lock().unavailable = true;
    }

    fn record(&self, call: RuntimeCall) {
        self.inner.lock().calls.push(call);
    }
}

impl std::fmt::Debug for FakeRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("FakeRuntime")
            .field("states", &inner.states.len())
            .field("services", &inner.services.len())
            .field("calls", &inner.calls.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    async fn is_available(&self) -> bool {
        !self.inner.lock().unavailable
    }

    async fn from_image(&self, image: &str) -> RuntimeResult<StateRef> {
        self.record(RuntimeCall::FromImage {
            image: image.to_string(),
        });
        let mut inner = self.inner.lock();
        if let Some(id) = inner.images.get(image) {
            return Ok(StateRef::Image(id.clone()));
        }
        let id = inner.commit_id(Tree::new());
        inner.images.insert(image.to_string(), id.clone());
        Ok(StateRef::Image(id))
    }

    async fn copy_in(
        &self,
        base: &StateRef,
        source: &CopySource,
        target: &str,
    ) -> RuntimeResult<StateRef> {
        self.record(RuntimeCall::CopyIn {
            base: base.clone(),
            target: target.to_string(),
        });
        let target = normalize_path(target);
        let mut inner = self.inner.lock();
        let mut tree = inner.tree(base)?;

        match source {
            CopySource::State { state, path, kind } => {
                let from = inner.tree(state)?;
                let path = normalize_path(path);
                if kind_at(&from, &path) != Some(*kind) {
                    return Err(RuntimeError::NotFound {
                        kind: "artifact",
                        id: format!("{state}:{path}"),
                    });
                }
                graft(&mut tree, &from, &path, &target);
            }
            CopySource::Host { path, kind } => {
                let mut from = Tree::new();
                load_host(&mut from, path, "", *kind).map_err(|reason| {
                    RuntimeError::CommandFailed {
                        command: format!("copy {}", path.display()),
                        code: 1,
                        stderr: reason,
                    }
                })?;
                graft(&mut tree, &from, "", &target);
            }
        }
        Ok(inner.commit(tree))
    }

    async fn exec(&self, state: &StateRef, request: &ExecRequest) -> RuntimeResult<ExecOutcome> {
        self.record(RuntimeCall::Exec {
            state: state.clone(),
            argv: request.argv.clone(),
            workdir: request.workdir.clone(),
            env: request.env.clone(),
            secret_names: request.secrets.iter().map(|(n, _)| n.clone()).collect(),
            network: request.network.clone(),
        });

        let (mut exec, handler) = {
            let inner = self.inner.lock();
            let tree = inner.tree(state)?;
            let services = match &request.network {
                Some(network) => inner
                    .services
                    .values()
                    .filter(|s| s.network == network.0)
                    .cloned()
                    .collect(),
                None => Vec::new(),
            };
            let handler = inner
                .handlers
                .iter()
                .rev()
                .find(|(needle, _)| request.argv.iter().any(|a| a.contains(needle.as_str())))
                .map(|(_, h)| Arc::clone(h));
            let exec = FakeExec {
                argv: request.argv.clone(),
                workdir: request.workdir.clone().unwrap_or_else(|| "/".to_string()),
                env: request.env.clone(),
                secrets: request
                    .secrets
                    .iter()
                    .map(|(n, s): &(String, Secret)| (n.clone(), s.expose_secret().to_string()))
                    .collect(),
                services,
                tree,
            };
            (exec, handler)
        };

        let output = match handler {
            Some(handler) => handler(&mut exec),
            None => ExecOutput::default(),
        };

        let state = (output.is_success() && request.commit).then(|| self.inner.lock().commit(exec.tree));
        Ok(ExecOutcome { output, state })
    }

    async fn stat(&self, state: &StateRef, path: &str) -> RuntimeResult<Option<ArtifactKind>> {
        self.record(RuntimeCall::Stat {
            path: path.to_string(),
        });
        let tree = self.inner.lock().tree(state)?;
        Ok(kind_at(&tree, &normalize_path(path)))
    }

    async fn create_network(&self, name: &str) -> RuntimeResult<NetworkRef> {
        self.record(RuntimeCall::CreateNetwork {
            name: name.to_string(),
        });
        self.inner.lock().networks.insert(name.to_string());
        Ok(NetworkRef(name.to_string()))
    }

    async fn remove_network(&self, network: &NetworkRef) -> RuntimeResult<()> {
        self.record(RuntimeCall::RemoveNetwork {
            name: network.0.clone(),
        });
        let mut inner = self.inner.lock();
        if inner.services.values().any(|s| s.network == network.0) {
            return Err(RuntimeError::CommandFailed {
                command: format!("network rm {network}"),
                code: 1,
                stderr: "network has active endpoints".to_string(),
            });
        }
        if !inner.networks.remove(&network.0) {
            return Err(RuntimeError::NotFound {
                kind: "network",
                id: network.0.clone(),
            });
        }
        Ok(())
    }

    async fn start_service(
        &self,
        spec: &ServiceSpec,
        network: &NetworkRef,
    ) -> RuntimeResult<ServiceId> {
        self.record(RuntimeCall::StartService {
            hostname: spec.hostname.clone(),
            image: spec.image.clone(),
            network: network.0.clone(),
            privileged: spec.privileged,
        });
        let mut inner = self.inner.lock();
        if !inner.networks.contains(&network.0) {
            return Err(RuntimeError::NotFound {
                kind: "network",
                id: network.0.clone(),
            });
        }
        let tree = match inner.images.get(&spec.image) {
            Some(state_id) => inner.states.get(state_id).cloned().unwrap_or_default(),
            None => Tree::new(),
        };
        let id = ServiceId(inner.next("fake-svc"));
        inner.services.insert(
            id.0.clone(),
            FakeService {
                id: id.clone(),
                spec: spec.clone(),
                network: network.0.clone(),
                tree,
            },
        );
        Ok(id)
    }

    async fn stop_service(&self, id: &ServiceId) -> RuntimeResult<()> {
        self.record(RuntimeCall::StopService { id: id.clone() });
        let mut inner = self.inner.lock();
        let hostname = inner.services.get(&id.0).map(|s| s.spec.hostname.clone());
        if let Some(hostname) = hostname
            && inner.failing_stops.remove(&hostname)
        {
            return Err(RuntimeError::CommandFailed {
                command: format!("stop {id}"),
                code: 1,
                stderr: "container did not stop".to_string(),
            });
        }
        match inner.services.remove(&id.0) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::NotFound {
                kind: "service",
                id: id.0.clone(),
            }),
        }
    }

    async fn build_image(
        &self,
        context: &StateRef,
        request: &BuildRequest,
    ) -> RuntimeResult<ImageId> {
        self.record(RuntimeCall::BuildImage {
            dockerfile: request.dockerfile.clone(),
            build_args: request.build_args.clone(),
        });
        let mut inner = self.inner.lock();
        let tree = inner.tree(context)?;
        let dockerfile = normalize_path(&format!("/{}", request.dockerfile));
        if !matches!(tree.get(&dockerfile), Some(Node::File(_))) {
            return Err(RuntimeError::CommandFailed {
                command: "build".to_string(),
                code: 1,
                stderr: format!("failed to read dockerfile: open {dockerfile}: no such file or directory"),
            });
        }

        let mut hasher = Sha256::new();
        for (path, node) in &tree {
            hasher.update(path.as_bytes());
            if let Node::File(bytes) = node {
                hasher.update(bytes);
            }
        }
        let digest = format!("sha256:{:x}", hasher.finalize());
        let state_id = inner.commit_id(tree);
        inner.images.insert(digest.clone(), state_id);
        inner.digests.insert(digest.clone(), digest.clone());
        Ok(ImageId(digest))
    }

    async fn login(
        &self,
        registry: &str,
        username: &str,
        _token: &Secret,
    ) -> RuntimeResult<Credentials> {
        self.record(RuntimeCall::Login {
            registry: registry.to_string(),
            username: username.to_string(),
        });
        let mut inner = self.inner.lock();
        if inner.reject_login {
            return Err(RuntimeError::Registry {
                target: registry.to_string(),
                reason: "unauthorized: incorrect username or password".to_string(),
            });
        }
        let id = inner.next("fake-auth");
        inner.logins.insert(id.clone());
        Ok(Credentials {
            registry: registry.to_string(),
            username: username.to_string(),
            id,
        })
    }

    async fn push(
        &self,
        image: &ImageId,
        tag: &str,
        credentials: &Credentials,
    ) -> RuntimeResult<String> {
        self.record(RuntimeCall::Push {
            image: image.clone(),
            tag: tag.to_string(),
        });
        let mut inner = self.inner.lock();
        if !inner.logins.contains(&credentials.id) {
            return Err(RuntimeError::NotFound {
                kind: "credentials",
                id: credentials.id.clone(),
            });
        }
        if inner.failing_pushes.contains(tag) {
            return Err(RuntimeError::Registry {
                target: tag.to_string(),
                reason: "denied: requested access to the resource is denied".to_string(),
            });
        }
        let digest = inner
            .digests
            .get(&image.0)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound {
                kind: "image",
                id: image.0.clone(),
            })?;
        inner.registry.insert(tag.to_string(), digest.clone());
        Ok(digest)
    }

    async fn logout(&self, credentials: &Credentials) -> RuntimeResult<()> {
        self.record(RuntimeCall::Logout {
            registry: credentials.registry.clone(),
        });
        if self.inner.lock().logins.remove(&credentials.id) {
            Ok(())
        } else {
            Err(RuntimeError::NotFound {
                kind: "credentials",
                id: credentials.id.clone(),
            })
        }
    }
}

fn kind_at(tree: &Tree, path: &str) -> Option<ArtifactKind> {
    if path == "/" || path.is_empty() {
        return Some(ArtifactKind::Directory);
    }
    match tree.get(path) {
        Some(Node::File(_)) => Some(ArtifactKind::File),
        Some(Node::Dir) => Some(ArtifactKind::Directory),
        None => {
            let prefix = format!("{path}/");
            tree.keys()
                .any(|k| k.starts_with(&prefix))
                .then_some(ArtifactKind::Directory)
        }
    }
}

fn insert_dir(tree: &mut Tree, path: &str) {
    let mut current = String::new();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        current.push('/');
        current.push_str(part);
        tree.entry(current.clone()).or_insert(Node::Dir);
    }
}

fn insert_file(tree: &mut Tree, path: &str, bytes: Vec<u8>) {
    if let Some((parent, _)) = path.rsplit_once('/') {
        insert_dir(tree, parent);
    }
    tree.insert(path.to_string(), Node::File(bytes));
}

/// Copies the entry at `from_path` (file or tree) to `target`
fn graft(tree: &mut Tree, from: &Tree, from_path: &str, target: &str) {
    if let Some(Node::File(bytes)) = from.get(from_path) {
        insert_file(tree, target, bytes.clone());
        return;
    }
    insert_dir(tree, target);
    let prefix = format!("{from_path}/");
    for (path, node) in from.range(prefix.clone()..) {
        let Some(rest) = path.strip_prefix(&prefix) else {
            break;
        };
        let dest = format!("{}/{rest}", target.trim_end_matches('/'));
        match node {
            Node::File(bytes) => insert_file(tree, &dest, bytes.clone()),
            Node::Dir => insert_dir(tree, &dest),
        }
    }
}

fn load_host(tree: &mut Tree, path: &Path, at: &str, kind: ArtifactKind) -> Result<(), String> {
    match kind {
        ArtifactKind::File => {
            let bytes = std::fs::read(path).map_err(|e| format!("{}: {e}", path.display()))?;
            tree.insert(at.to_string(), Node::File(bytes));
        }
        ArtifactKind::Directory => {
            let entries = std::fs::read_dir(path).map_err(|e| format!("{}: {e}", path.display()))?;
            for entry in entries {
                let entry = entry.map_err(|e| e.to_string())?;
                let name = entry.file_name().to_string_lossy().to_string();
                let child = format!("{at}/{name}");
                let kind = if entry.path().is_dir() {
                    tree.insert(child.clone(), Node::Dir);
                    ArtifactKind::Directory
                } else {
                    ArtifactKind::File
                };
                load_host(tree, &entry.path(), &child, kind)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_at_infers_directories() {
        let mut tree = Tree::new();
        insert_file(&mut tree, "/a/b/c.txt", b"x".to_vec());

        assert_eq!(kind_at(&tree, "/a/b/c.txt"), Some(ArtifactKind::File));
        assert_eq!(kind_at(&tree, "/a/b"), Some(ArtifactKind::Directory));
        assert_eq!(kind_at(&tree, "/a/bc"), None);
    }

    #[test]
    fn test_graft_directory() {
        let mut from = Tree::new();
        insert_file(&mut from, "/w/models/trained/model.pkl", b"m".to_vec());
        insert_file(&mut from, "/w/models/trainedX/other", b"o".to_vec());

        let mut tree = Tree::new();
        graft(&mut tree, &from, "/w/models/trained", "/models/trained");

        assert_eq!(
            tree.get("/models/trained/model.pkl"),
            Some(&Node::File(b"m".to_vec()))
        );
        assert!(!tree.keys().any(|k| k.contains("other")));
    }

    #[tokio::test]
    async fn test_host_copy_and_exec_commit() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("data/raw")).unwrap();
        std::fs::write(dir.path().join("data/raw/house_data.csv"), "price\n1\n").unwrap();

        let fake = FakeRuntime::new();
        fake.on_exec("clean", |exec| {
            let raw = exec.read("data/raw/house_data.csv").unwrap_or_default();
            exec.write_file("data/processed/cleaned.csv", &raw);
            ExecOutput::default()
        });

        let base = fake.from_image("python:3.11-slim").await.unwrap();
        let mounted = fake
            .copy_in(
                &base,
                &CopySource::Host {
                    path: dir.path().to_path_buf(),
                    kind: ArtifactKind::Directory,
                },
                "/w",
            )
            .await
            .unwrap();

        let mut request = ExecRequest::new(vec!["clean".to_string()]);
        request.workdir = Some("/w".to_string());
        let outcome = fake.exec(&mounted, &request).await.unwrap();
        let state = outcome.state.unwrap();

        assert_eq!(
            fake.read(&state, "/w/data/processed/cleaned.csv").unwrap(),
            b"price\n1\n"
        );
        assert!(fake.read(&mounted, "/w/data/processed/cleaned.csv").is_none());
    }

    #[tokio::test]
    async fn test_services_visible_only_on_their_network() {
        let fake = FakeRuntime::new();
        fake.on_exec("probe", |exec| ExecOutput {
            exit_code: if exec.reachable("mlflow_server") { 0 } else { 6 },
            ..ExecOutput::default()
        });

        let a = fake.create_network("a").await.unwrap();
        let b = fake.create_network("b").await.unwrap();
        fake.start_service(&ServiceSpec::new("mlflow_server", "mlflow", 5000), &a)
            .await
            .unwrap();

        let mut request = ExecRequest::new(vec!["probe".to_string()]);
        request.network = Some(a);
        assert!(fake.exec(&StateRef::Scratch, &request).await.unwrap().output.is_success());

        request.network = Some(b);
        assert_eq!(
            fake.exec(&StateRef::Scratch, &request).await.unwrap().output.exit_code,
            6
        );
    }

    #[tokio::test]
    async fn test_build_requires_dockerfile() {
        let fake = FakeRuntime::new();
        let request = BuildRequest {
            dockerfile: "Dockerfile".to_string(),
            build_args: Vec::new(),
        };
        assert!(fake.build_image(&StateRef::Scratch, &request).await.is_err());

        let context = fake.seed_state(&[("/Dockerfile", b"FROM scratch".as_slice())]);
        let image = fake.build_image(&context, &request).await.unwrap();
        assert!(image.0.starts_with("sha256:"));
    }
}

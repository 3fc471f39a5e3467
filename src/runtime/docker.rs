//! Docker CLI backend
//!
//! Drives a Docker-compatible CLI (`docker`, or `podman` through its
//! compatible command surface) via `tokio::process`.
//!
//! Layering works by running every command in a throw-away container and
//! committing it to a new image. Copies between states are `COPY --from`
//! builds whose Dockerfile is fed on stdin, so artifacts never land on the
//! orchestrator host. Secrets reach commands through stdin only: they are
//! never part of an argv, an image config or a build argument.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use uuid::Uuid;

use super::traits::{
    BuildRequest, ContainerRuntime, CopySource, Credentials, ExecOutcome, ExecOutput, ExecRequest,
    ImageId, NetworkRef, RuntimeError, RuntimeResult, ServiceId, ServiceSpec, StateRef,
};
use crate::pipeline::{ArtifactKind, Secret};

static DIGEST_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"digest: (sha256:[0-9a-f]{64})").expect("digest pattern is valid"));

/// Reads `NAME=value` lines from stdin into the environment, then execs the command.
const SECRET_SHIM: &str = r#"while IFS= read -r line; do export "$line"; done; exec "$@""#;

const STAT_SCRIPT: &str =
    r#"if [ -d "$1" ]; then echo directory; elif [ -e "$1" ]; then echo file; else echo missing; fi"#;

/// Runtime backed by the Docker CLI
pub struct DockerRuntime {
    /// CLI executable
    binary: String,
    /// Per-login docker config directories, keyed by credential id
    auth_dirs: Mutex<HashMap<String, tempfile::TempDir>>,
}

impl DockerRuntime {
    /// Creates a runtime using the `docker` executable
    #[must_use]
    pub fn new() -> Self {
        Self::with_binary("docker")
    }

    /// Creates a runtime using a Docker-compatible executable
    #[must_use]
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            auth_dirs: Mutex::new(HashMap::new()),
        }
    }

    fn render(&self, args: &[String]) -> String {
        shell_words::join(std::iter::once(self.binary.as_str()).chain(args.iter().map(String::as_str)))
    }

    /// Runs the CLI with optional stdin, capturing output regardless of exit code
    async fn invoke(&self, args: &[String], stdin: Option<&[u8]>) -> RuntimeResult<ExecOutput> {
        let command = self.render(args);
        tracing::trace!(command = %command, "Invoking container CLI");

        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| RuntimeError::Spawn {
            command: command.clone(),
            reason: e.to_string(),
        })?;

        if let Some(bytes) = stdin
            && let Some(mut pipe) = child.stdin.take()
        {
            pipe.write_all(bytes)
                .await
                .map_err(|e| RuntimeError::Spawn {
                    command: command.clone(),
                    reason: format!("failed to write stdin: {e}"),
                })?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| RuntimeError::Spawn {
                command,
                reason: e.to_string(),
            })?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Runs the CLI and returns trimmed stdout, failing on non-zero exit
    async fn checked(&self, args: &[String], stdin: Option<&[u8]>) -> RuntimeResult<String> {
        let output = self.invoke(args, stdin).await?;
        if !output.is_success() {
            return Err(RuntimeError::CommandFailed {
                command: self.render(args),
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout.trim().to_string())
    }

    /// Builds an image from a Dockerfile fed on stdin, returning its id
    async fn build_from_stdin(
        &self,
        dockerfile: &str,
        context: Option<&Path>,
    ) -> RuntimeResult<StateRef> {
        let mut args = strings(["build", "-q"]);
        match context {
            Some(dir) => {
                args.extend(strings(["-f", "-"]));
                args.push(dir.to_string_lossy().into_owned());
            }
            None => args.push("-".to_string()),
        }
        let id = self.checked(&args, Some(dockerfile.as_bytes())).await?;
        image_state(&self.render(&args), &id)
    }

    async fn remove_container(&self, name: &str) {
        let args = strings(["rm", "-f", name]);
        if let Err(e) = self.checked(&args, None).await {
            tracing::warn!(container = %name, error = %e, "Failed to remove container");
        }
    }

    fn auth_dir(&self, credentials: &Credentials) -> RuntimeResult<PathBuf> {
        self.auth_dirs
            .lock()
            .get(&credentials.id)
            .map(|dir| dir.path().to_path_buf())
            .ok_or_else(|| RuntimeError::NotFound {
                kind: "credentials",
                id: credentials.id.clone(),
            })
    }
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DockerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerRuntime")
            .field("binary", &self.binary)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        &self.binary
    }

    async fn is_available(&self) -> bool {
        self.checked(&strings(["version", "--format", "{{.Server.Version}}"]), None)
            .await
            .is_ok()
    }

    async fn from_image(&self, image: &str) -> RuntimeResult<StateRef> {
        let inspect = strings(["image", "inspect", "--format", "{{.Id}}", image]);
        if let Ok(id) = self.checked(&inspect, None).await {
            return image_state(&self.render(&inspect), &id);
        }

        tracing::info!(image = %image, "Pulling base image");
        self.checked(&strings(["pull", "--quiet", image]), None).await?;
        let id = self.checked(&inspect, None).await?;
        image_state(&self.render(&inspect), &id)
    }

    async fn copy_in(
        &self,
        base: &StateRef,
        source: &CopySource,
        target: &str,
    ) -> RuntimeResult<StateRef> {
        let from = match base {
            StateRef::Scratch => "FROM scratch".to_string(),
            StateRef::Image(id) => format!("FROM {id}"),
        };

        match source {
            CopySource::State {
                state: StateRef::Image(src),
                path,
                ..
            } => {
                let dockerfile = format!("{from}\nCOPY --from={src} {}\n", copy_operands(path, target));
                self.build_from_stdin(&dockerfile, None).await
            }
            CopySource::State {
                state: StateRef::Scratch,
                path,
                ..
            } => Err(RuntimeError::NotFound {
                kind: "path in scratch state",
                id: path.clone(),
            }),
            CopySource::Host {
                path,
                kind: ArtifactKind::Directory,
            } => {
                let dockerfile = format!("{from}\nCOPY {}\n", copy_operands(".", target));
                self.build_from_stdin(&dockerfile, Some(path)).await
            }
            CopySource::Host {
                path,
                kind: ArtifactKind::File,
            } => {
                let (parent, name) = match (path.parent(), path.file_name()) {
                    (Some(parent), Some(name)) => (parent, name.to_string_lossy().into_owned()),
                    _ => {
                        return Err(RuntimeError::NotFound {
                            kind: "host file",
                            id: path.display().to_string(),
                        });
                    }
                };
                let dockerfile = format!("{from}\nCOPY {}\n", copy_operands(&name, target));
                self.build_from_stdin(&dockerfile, Some(parent)).await
            }
        }
    }

    async fn exec(&self, state: &StateRef, request: &ExecRequest) -> RuntimeResult<ExecOutcome> {
        let StateRef::Image(image) = state else {
            return Err(RuntimeError::NotFound {
                kind: "runnable state",
                id: state.to_string(),
            });
        };
        let Some((program, rest)) = request.argv.split_first() else {
            return Err(RuntimeError::Spawn {
                command: self.binary.clone(),
                reason: "empty command".to_string(),
            });
        };

        let name = format!("shipline-exec-{}", Uuid::new_v4().simple());
        let mut args = strings(["run", "--name", &name]);
        if let Some(network) = &request.network {
            args.extend(strings(["--network", &network.0]));
        }
        if let Some(workdir) = &request.workdir {
            args.extend(strings(["-w", workdir]));
        }
        for (key, value) in &request.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }

        let stdin = if request.secrets.is_empty() {
            args.extend(strings(["--entrypoint", program, image]));
            args.extend(rest.iter().cloned());
            None
        } else {
            args.extend(strings(["-i", "--entrypoint", "sh", image, "-c", SECRET_SHIM, "sh"]));
            args.extend(request.argv.iter().cloned());
            Some(secret_lines(&request.secrets))
        };

        let output = self.invoke(&args, stdin.as_deref()).await;
        let output = match output {
            Ok(output) => output,
            Err(e) => {
                self.remove_container(&name).await;
                return Err(e);
            }
        };

        let committed = if output.is_success() && request.commit {
            let commit = strings(["commit", &name]);
            match self.checked(&commit, None).await {
                Ok(id) => Some(image_state(&self.render(&commit), &id)),
                Err(e) => Some(Err(e)),
            }
        } else {
            None
        };

        self.remove_container(&name).await;

        Ok(ExecOutcome {
            output,
            state: committed.transpose()?,
        })
    }

    async fn stat(&self, state: &StateRef, path: &str) -> RuntimeResult<Option<ArtifactKind>> {
        let StateRef::Image(image) = state else {
            return Ok(None);
        };
        let args = strings([
            "run", "--rm", "--network", "none", "--entrypoint", "sh", image, "-c", STAT_SCRIPT, "sh",
            path,
        ]);
        let kind = self.checked(&args, None).await?;
        match kind.as_str() {
            "directory" => Ok(Some(ArtifactKind::Directory)),
            "file" => Ok(Some(ArtifactKind::File)),
            "missing" => Ok(None),
            other => Err(RuntimeError::UnexpectedOutput {
                command: self.render(&args),
                output: other.to_string(),
            }),
        }
    }

    async fn create_network(&self, name: &str) -> RuntimeResult<NetworkRef> {
        self.checked(&strings(["network", "create", name]), None)
            .await?;
        Ok(NetworkRef(name.to_string()))
    }

    async fn remove_network(&self, network: &NetworkRef) -> RuntimeResult<()> {
        self.checked(&strings(["network", "rm", &network.0]), None)
            .await?;
        Ok(())
    }

    async fn start_service(
        &self,
        spec: &ServiceSpec,
        network: &NetworkRef,
    ) -> RuntimeResult<ServiceId> {
        let name = format!("shipline-svc-{}", Uuid::new_v4().simple());
        let mut args = strings([
            "run",
            "-d",
            "--name",
            &name,
            "--network",
            &network.0,
            "--network-alias",
            &spec.hostname,
            "--expose",
            &spec.port.to_string(),
        ]);
        if spec.privileged {
            args.push("--privileged".to_string());
        }
        for volume in &spec.volumes {
            args.push("-v".to_string());
            args.push(format!("{}:{}", volume.name, volume.target));
        }
        args.push(spec.image.clone());
        args.extend(spec.args.iter().cloned());

        let id = self.checked(&args, None).await?;
        Ok(ServiceId(id))
    }

    async fn stop_service(&self, id: &ServiceId) -> RuntimeResult<()> {
        self.checked(&strings(["rm", "-f", &id.0]), None).await?;
        Ok(())
    }

    async fn build_image(
        &self,
        context: &StateRef,
        request: &BuildRequest,
    ) -> RuntimeResult<ImageId> {
        let StateRef::Image(context_image) = context else {
            return Err(RuntimeError::NotFound {
                kind: "build context",
                id: context.to_string(),
            });
        };

        // A created (never started) container exposes the context tree for export.
        let holder = self
            .checked(&strings(["create", context_image, "shipline-context"]), None)
            .await?;

        let mut build_args = strings(["build", "-q", "-f", &request.dockerfile]);
        for (key, value) in &request.build_args {
            build_args.push("--build-arg".to_string());
            build_args.push(format!("{key}={value}"));
        }
        build_args.push("-".to_string());

        let result = self.stream_context(&holder, &build_args).await;
        self.remove_container(&holder).await;

        let id = result?;
        image_state(&self.render(&build_args), &id).map(|state| ImageId(state.to_string()))
    }

    async fn login(
        &self,
        registry: &str,
        username: &str,
        token: &Secret,
    ) -> RuntimeResult<Credentials> {
        let dir = tempfile::TempDir::new().map_err(|e| RuntimeError::Spawn {
            command: format!("{} login", self.binary),
            reason: format!("failed to create config directory: {e}"),
        })?;

        let args = vec![
            "--config".to_string(),
            dir.path().to_string_lossy().into_owned(),
            "login".to_string(),
            registry.to_string(),
            "-u".to_string(),
            username.to_string(),
            "--password-stdin".to_string(),
        ];
        let password = format!("{}\n", token.expose_secret());
        let output = self.invoke(&args, Some(password.as_bytes())).await?;
        if !output.is_success() {
            return Err(RuntimeError::Registry {
                target: registry.to_string(),
                reason: output.stderr.trim().to_string(),
            });
        }

        let id = Uuid::new_v4().to_string();
        self.auth_dirs.lock().insert(id.clone(), dir);

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
        let config_dir = self.auth_dir(credentials)?;
        self.checked(&strings(["tag", &image.0, tag]), None).await?;

        let args = vec![
            "--config".to_string(),
            config_dir.to_string_lossy().into_owned(),
            "push".to_string(),
            tag.to_string(),
        ];
        let output = self.invoke(&args, None).await?;
        if !output.is_success() {
            return Err(RuntimeError::Registry {
                target: tag.to_string(),
                reason: output.stderr.trim().to_string(),
            });
        }

        parse_push_digest(&output.stdout).ok_or_else(|| RuntimeError::UnexpectedOutput {
            command: self.render(&args),
            output: output.stdout.trim().to_string(),
        })
    }

    async fn logout(&self, credentials: &Credentials) -> RuntimeResult<()> {
        let dir = self
            .auth_dirs
            .lock()
            .remove(&credentials.id)
            .ok_or_else(|| RuntimeError::NotFound {
                kind: "credentials",
                id: credentials.id.clone(),
            })?;
        let path = dir.path().display().to_string();
        dir.close().map_err(|e| RuntimeError::Spawn {
            command: format!("remove {path}"),
            reason: e.to_string(),
        })
    }
}

impl DockerRuntime {
    /// Pipes `cp <holder>:/. -` into the build command's stdin
    async fn stream_context(&self, holder: &str, build_args: &[String]) -> RuntimeResult<String> {
        let export_args = vec!["cp".to_string(), format!("{holder}:/."), "-".to_string()];
        let mut export = Command::new(&self.binary)
            .args(&export_args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(&export_args, e))?;
        let mut build = Command::new(&self.binary)
            .args(build_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(build_args, e))?;

        let (Some(mut tar), Some(mut sink)) = (export.stdout.take(), build.stdin.take()) else {
            return Err(RuntimeError::Spawn {
                command: self.render(build_args),
                reason: "context pipe unavailable".to_string(),
            });
        };

        let pump = async move {
            let copied = tokio::io::copy(&mut tar, &mut sink).await;
            drop(sink);
            copied
        };
        let (copied, exported, built) =
            tokio::join!(pump, export.wait_with_output(), build.wait_with_output());

        let exported = exported.map_err(|e| self.spawn_error(&export_args, e))?;
        if !exported.status.success() {
            return Err(RuntimeError::CommandFailed {
                command: self.render(&export_args),
                code: exported.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&exported.stderr).trim().to_string(),
            });
        }
        copied.map_err(|e| self.spawn_error(&export_args, e))?;

        let built = built.map_err(|e| self.spawn_error(build_args, e))?;
        if !built.status.success() {
            return Err(RuntimeError::CommandFailed {
                command: self.render(build_args),
                code: built.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&built.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&built.stdout).trim().to_string())
    }
}

impl DockerRuntime {
    fn spawn_error(&self, args: &[String], e: std::io::Error) -> RuntimeError {
        RuntimeError::Spawn {
            command: self.render(args),
            reason: e.to_string(),
        }
    }
}

fn strings<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}

/// Renders COPY operands in JSON form so paths with spaces survive
fn copy_operands(source: &str, target: &str) -> String {
    serde_json::to_string(&[source, target]).unwrap_or_else(|_| format!("{source} {target}"))
}

fn secret_lines(secrets: &[(String, Secret)]) -> Vec<u8> {
    let mut lines = String::new();
    for (name, secret) in secrets {
        lines.push_str(name);
        lines.push('=');
        lines.push_str(secret.expose_secret());
        lines.push('\n');
    }
    lines.into_bytes()
}

/// Takes the last line of CLI output as an image id
fn image_state(command: &str, output: &str) -> RuntimeResult<StateRef> {
    match output.lines().last().map(str::trim) {
        Some(id) if !id.is_empty() && !id.contains(char::is_whitespace) => {
            Ok(StateRef::Image(id.to_string()))
        }
        _ => Err(RuntimeError::UnexpectedOutput {
            command: command.to_string(),
            output: output.to_string(),
        }),
    }
}

/// Extracts the pushed manifest digest from `docker push` output
#[must_use]
pub fn parse_push_digest(output: &str) -> Option<String> {
    DIGEST_PATTERN
        .captures_iter(output)
        .last()
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_push_digest() {
        let output = "The push refers to repository [docker.io/owner/repo]\n\
            5f70bf18a086: Pushed\n\
            abc1234: digest: sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef size: 1573\n";

        assert_eq!(
            parse_push_digest(output).as_deref(),
            Some("sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef")
        );
        assert_eq!(parse_push_digest("denied: requested access"), None);
    }

    #[test]
    fn test_copy_operands_are_json() {
        assert_eq!(copy_operands("/a b", "c"), r#"["/a b","c"]"#);
    }

    #[test]
    fn test_secret_lines_are_newline_terminated() {
        let secrets = vec![("TOKEN".to_string(), Secret::new("TOKEN", "s3cr3t"))];
        assert_eq!(secret_lines(&secrets), b"TOKEN=s3cr3t\n".to_vec());
    }

    #[test]
    fn test_image_state_takes_last_line() {
        let state = image_state("docker build", "step output\nsha256:feed\n").unwrap();
        assert_eq!(state, StateRef::Image("sha256:feed".to_string()));
        assert!(image_state("docker build", "").is_err());
    }

    #[tokio::test]
    async fn test_logout_removes_credential_directory() {
        let runtime = DockerRuntime::new();
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().to_path_buf();
        std::fs::write(path.join("config.json"), "{}").unwrap();
        runtime.auth_dirs.lock().insert("auth-1".to_string(), dir);
        let credentials = Credentials {
            registry: "docker.io".to_string(),
            username: "alice".to_string(),
            id: "auth-1".to_string(),
        };

        runtime.logout(&credentials).await.unwrap();

        assert!(!path.exists());
        assert!(runtime.auth_dir(&credentials).is_err());
        assert!(matches!(
            runtime.logout(&credentials).await,
            Err(RuntimeError::NotFound { .. })
        ));
    }

    #[test]
    fn test_render_quotes_arguments() {
        let runtime = DockerRuntime::new();
        let rendered = runtime.render(&strings(["run", "sh", "-c", "echo hi"]));
        assert_eq!(rendered, "docker run sh -c 'echo hi'");
    }
}

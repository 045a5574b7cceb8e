//! Outbound boundary to the host container runtime.
//!
//! The Lifecycle Controller and Execution Supervisor are the only callers of
//! these operations. The runtime is an external dependency with its own
//! failure modes (daemon unreachable, quota exceeded, image missing); every
//! method surfaces those as [`Error::Runtime`] and never panics.

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::Docker;
use futures_util::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::Result;

/// Everything the runtime needs to materialize one sandbox container.
/// Built by the Lifecycle Controller from the isolation policy; the runtime
/// applies it verbatim and adds nothing.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: String,
    /// `uid:gid`, unprivileged.
    pub user: String,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub pids_limit: i64,
    /// Size cap applied to every tmpfs mount.
    pub scratch_bytes: i64,
    /// Writable paths backed by size-capped tmpfs.
    pub tmpfs_mounts: Vec<String>,
    /// Read-only bind mounts in `host:container:ro` form.
    pub binds: Vec<String>,
}

/// One demultiplexed chunk of process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

pub type OutputStream = Pin<Box<dyn Stream<Item = Result<OutputChunk>> + Send>>;

/// Exit state reported by the runtime after termination.
#[derive(Debug, Clone, Copy)]
pub struct ExitDetails {
    pub exit_code: i64,
    /// Set when the kernel's OOM killer terminated the process for exceeding
    /// the memory ceiling.
    pub oom_killed: bool,
}

/// Operations the orchestrator needs from a container runtime.
///
/// Production uses [`DockerRuntime`]; tests substitute a scripted fake so the
/// scheduling and classification logic can be exercised without a daemon.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create an isolated environment. Returns the runtime's container id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    /// Start the created container.
    async fn start(&self, id: &str) -> Result<()>;

    /// Follow the container's stdout/stderr from the beginning of execution.
    /// The stream ends when the container exits.
    fn output(&self, id: &str) -> OutputStream;

    /// Block until the container is no longer running; returns the exit code.
    async fn wait(&self, id: &str) -> Result<i64>;

    /// Forcibly terminate the container's process tree, without removing it.
    async fn kill(&self, id: &str) -> Result<()>;

    /// Exit code and OOM flag, valid after termination.
    async fn exit_details(&self, id: &str) -> Result<ExitDetails>;

    /// Remove the container and its anonymous resources. Must be idempotent:
    /// removing an already-removed container is not an error.
    async fn remove(&self, id: &str) -> Result<()>;
}

/// Docker-based container runtime using bollard.
pub struct DockerRuntime {
    docker: Docker,
}

impl std::fmt::Debug for DockerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerRuntime").finish_non_exhaustive()
    }
}

impl DockerRuntime {
    /// Connect to the local Docker daemon and verify it responds.
    ///
    /// # Errors
    ///
    /// Fails if the daemon is not running or does not answer the ping; the
    /// process must not start without a working runtime.
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Runtime(format!("failed to connect to Docker: {}", e)))?;

        docker
            .ping()
            .await
            .map_err(|e| Error::Runtime(format!("Docker ping failed: {}", e)))?;

        info!("Connected to Docker daemon");
        Ok(Self { docker })
    }

    /// Wrap a pre-configured bollard client.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Make sure the base execution image is present, pulling it if missing.
    pub async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "image already present");
            return Ok(());
        }

        let (name, tag) = parse_image_ref(image);
        info!(image = %image, "pulling image");

        let options = CreateImageOptions {
            from_image: Some(name.to_string()),
            tag: if tag.is_empty() {
                None
            } else {
                Some(tag.to_string())
            },
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| Error::Runtime(format!("failed to pull {}: {}", image, e)))?;
        }

        info!(image = %image, "image pulled");
        Ok(())
    }
}

/// Parse an image reference into name and tag.
fn parse_image_ref(image: &str) -> (&str, &str) {
    if image.contains('@') {
        return (image, "");
    }
    if let Some((name, tag)) = image.rsplit_once(':') {
        // A '/' after the ':' means the colon belonged to a registry port.
        if !tag.contains('/') {
            return (name, tag);
        }
    }
    (image, "latest")
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let tmpfs: HashMap<String, String> = spec
            .tmpfs_mounts
            .iter()
            .map(|path| {
                (
                    path.clone(),
                    format!("size={},mode=1777", spec.scratch_bytes),
                )
            })
            .collect();

        let host_config = HostConfig {
            memory: Some(spec.memory_bytes),
            // Swap clamped to the memory ceiling: no escape hatch.
            memory_swap: Some(spec.memory_bytes),
            nano_cpus: Some(spec.nano_cpus),
            pids_limit: Some(spec.pids_limit),
            readonly_rootfs: Some(true),
            network_mode: Some("none".to_string()),
            tmpfs: Some(tmpfs),
            binds: Some(spec.binds.clone()),
            ..Default::default()
        };

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            env: Some(spec.env.clone()),
            user: Some(spec.user.clone()),
            working_dir: Some(spec.working_dir.clone()),
            network_disabled: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: Some(spec.name.clone()),
            platform: String::new(),
        };

        let response = self
            .docker
            .create_container(Some(options), body)
            .await
            .map_err(|e| Error::Runtime(format!("create failed: {}", e)))?;

        debug!(container = %response.id, image = %spec.image, "container created");
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(|e| Error::Runtime(format!("start failed: {}", e)))
    }

    fn output(&self, id: &str) -> OutputStream {
        let docker = self.docker.clone();
        let id = id.to_string();
        let (tx, mut rx) = tokio::sync::mpsc::channel::<Result<OutputChunk>>(16);

        tokio::spawn(async move {
            let options = LogsOptions {
                follow: true,
                stdout: true,
                stderr: true,
                tail: "all".to_string(),
                timestamps: false,
                ..Default::default()
            };
            let mut stream = docker.logs(&id, Some(options));
            while let Some(item) = stream.next().await {
                let chunk = match item {
                    Ok(LogOutput::StdOut { message }) => Ok(OutputChunk::Stdout(message.to_vec())),
                    Ok(LogOutput::StdErr { message }) => Ok(OutputChunk::Stderr(message.to_vec())),
                    Ok(LogOutput::Console { message }) => Ok(OutputChunk::Stdout(message.to_vec())),
                    Ok(_) => continue,
                    Err(e) => Err(Error::Runtime(format!("log stream failed: {}", e))),
                };
                let failed = chunk.is_err();
                if tx.send(chunk).await.is_err() || failed {
                    break;
                }
            }
        });

        Box::pin(futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx)))
    }

    async fn wait(&self, id: &str) -> Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running".to_string(),
        };

        let mut stream = self.docker.wait_container(id, Some(options));
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports non-zero exits through this error variant; a
            // non-zero exit is the user's business, not a runtime failure.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(Error::Runtime(format!("wait failed: {}", e))),
            None => Err(Error::Runtime("wait stream closed unexpectedly".into())),
        }
    }

    async fn kill(&self, id: &str) -> Result<()> {
        // Grace of zero: SIGKILL the whole pid namespace immediately. Killing
        // init takes every process in the sandbox down with it.
        let options = StopContainerOptions {
            t: Some(0),
            signal: None,
        };

        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // Already stopped is success for our purposes.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => Ok(()),
            Err(e) => Err(Error::Runtime(format!("kill failed: {}", e))),
        }
    }

    async fn exit_details(&self, id: &str) -> Result<ExitDetails> {
        let inspect = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(|e| Error::Runtime(format!("inspect failed: {}", e)))?;

        let state = inspect
            .state
            .ok_or_else(|| Error::Runtime(format!("container {} has no state", id)))?;

        Ok(ExitDetails {
            exit_code: state.exit_code.unwrap_or(0),
            oom_killed: state.oom_killed.unwrap_or(false),
        })
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => {
                debug!(container = %id, "container removed");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container = %id, "container already gone");
                Ok(())
            }
            Err(e) => {
                warn!(container = %id, error = %e, "remove failed");
                Err(Error::Runtime(format!("remove failed: {}", e)))
            }
        }
    }
}

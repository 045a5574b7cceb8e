//! One ephemeral sandbox per execution request.
//!
//! Provisioning stages the untrusted source into a private host scratch
//! directory and asks the runtime for a container locked down per the
//! isolation policy. Teardown is idempotent and structurally guaranteed: the
//! normal path destroys explicitly, and a `Drop` backstop force-removes
//! anything that slipped past it, so a leaked sandbox is impossible rather
//! than unlikely.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::policy::IsolationPolicy;
use crate::runtime::{ContainerRuntime, ContainerSpec, ExitDetails, OutputStream};
use crate::types::ExecutionRequest;
use crate::Result;

/// In-container paths. The script and stdin are bind-mounted read-only on
/// top of the tmpfs workdir, so the program can read but never alter them.
const WORKDIR: &str = "/app";
const SCRIPT_NAME: &str = "script.py";
const STDIN_NAME: &str = "stdin";

/// Fixed interpreter environment: deterministic encoding, no ANSI noise.
const SANDBOX_ENV: [&str; 2] = ["PYTHONIOENCODING=utf-8", "PYTHON_COLORS=0"];

/// Retry budget for container creation.
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    pub attempts: u32,
    /// Initial backoff; doubles per failed attempt.
    pub backoff: Duration,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(200),
        }
    }
}

/// A live isolated environment bound to exactly one request.
///
/// Never pooled, never reused. The scratch [`TempDir`] holding the staged
/// source lives exactly as long as the sandbox.
pub struct Sandbox {
    container_id: String,
    runtime: Arc<dyn ContainerRuntime>,
    created_at: Instant,
    destroyed: AtomicBool,
    _workdir: TempDir,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("container_id", &self.container_id)
            .field("destroyed", &self.destroyed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Create an isolated environment for one request.
///
/// The writable areas are size-capped tmpfs, the root filesystem is
/// read-only, the network namespace has no interface, and the process runs
/// as the policy's unprivileged identity. Creation failures are retried up
/// to the configured budget with exponential backoff, then surfaced as
/// [`Error::Provision`].
pub async fn provision(
    runtime: Arc<dyn ContainerRuntime>,
    policy: &IsolationPolicy,
    request: &ExecutionRequest,
    retry: &ProvisionConfig,
) -> Result<Sandbox> {
    let workdir = stage_payload(request).await?;
    let spec = build_spec(policy, request, &workdir);

    let mut backoff = retry.backoff;
    let mut attempt = 0u32;
    let container_id = loop {
        attempt += 1;
        match runtime.create(&spec).await {
            Ok(id) => break id,
            Err(e) if attempt < retry.attempts => {
                warn!(
                    request = %request.id,
                    attempt,
                    error = %e,
                    "sandbox creation failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => {
                return Err(Error::Provision {
                    attempts: attempt,
                    reason: e.to_string(),
                });
            }
        }
    };

    info!(request = %request.id, container = %container_id, "sandbox provisioned");
    Ok(Sandbox {
        container_id,
        runtime,
        created_at: Instant::now(),
        destroyed: AtomicBool::new(false),
        _workdir: workdir,
    })
}

/// Write the source (and optional stdin) into a fresh scratch directory with
/// permissions the unprivileged container user can read.
async fn stage_payload(request: &ExecutionRequest) -> Result<TempDir> {
    use std::os::unix::fs::PermissionsExt;

    let workdir = tempfile::Builder::new().prefix("classbox-").tempdir()?;
    tokio::fs::set_permissions(workdir.path(), std::fs::Permissions::from_mode(0o755)).await?;

    let script_path = workdir.path().join(SCRIPT_NAME);
    tokio::fs::write(&script_path, &request.source).await?;
    tokio::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o644)).await?;

    if let Some(stdin) = &request.stdin {
        let stdin_path = workdir.path().join(STDIN_NAME);
        tokio::fs::write(&stdin_path, stdin).await?;
        tokio::fs::set_permissions(&stdin_path, std::fs::Permissions::from_mode(0o644)).await?;
    }

    debug!(request = %request.id, dir = %workdir.path().display(), "payload staged");
    Ok(workdir)
}

fn build_spec(policy: &IsolationPolicy, request: &ExecutionRequest, workdir: &TempDir) -> ContainerSpec {
    let script_host = workdir.path().join(SCRIPT_NAME);
    let script_guest = format!("{}/{}", WORKDIR, SCRIPT_NAME);

    let mut binds = vec![format!("{}:{}:ro", script_host.display(), script_guest)];

    // -u keeps the interpreter unbuffered so captured output is complete at
    // the moment of termination.
    let cmd = if request.stdin.is_some() {
        let stdin_host = workdir.path().join(STDIN_NAME);
        let stdin_guest = format!("{}/{}", WORKDIR, STDIN_NAME);
        binds.push(format!("{}:{}:ro", stdin_host.display(), stdin_guest));
        vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("python3 -u {} < {}", script_guest, stdin_guest),
        ]
    } else {
        vec!["python3".to_string(), "-u".to_string(), script_guest]
    };

    ContainerSpec {
        name: format!("classbox-{}", request.id),
        image: policy.image.clone(),
        cmd,
        env: SANDBOX_ENV.iter().map(|s| s.to_string()).collect(),
        working_dir: WORKDIR.to_string(),
        user: policy.user(),
        memory_bytes: policy.memory_bytes,
        nano_cpus: policy.nano_cpus(),
        pids_limit: policy.pids_limit,
        scratch_bytes: policy.scratch_bytes,
        tmpfs_mounts: vec![WORKDIR.to_string(), "/tmp".to_string()],
        binds,
    }
}

impl Sandbox {
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub async fn start(&self) -> Result<()> {
        self.runtime.start(&self.container_id).await
    }

    pub fn output(&self) -> OutputStream {
        self.runtime.output(&self.container_id)
    }

    pub async fn wait(&self) -> Result<i64> {
        self.runtime.wait(&self.container_id).await
    }

    pub async fn kill(&self) -> Result<()> {
        self.runtime.kill(&self.container_id).await
    }

    pub async fn exit_details(&self) -> Result<ExitDetails> {
        self.runtime.exit_details(&self.container_id).await
    }

    /// Idempotent teardown. Safe to call any number of times; only the first
    /// call reaches the runtime.
    pub async fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.runtime.remove(&self.container_id).await {
            Ok(()) => {
                debug!(container = %self.container_id, "sandbox destroyed");
                Ok(())
            }
            Err(e) => {
                error!(container = %self.container_id, error = %e, "sandbox teardown failed");
                Err(e)
            }
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        // Backstop for paths that never reached destroy(), including panics
        // in the supervisor. Runs detached; errors end up in the logs.
        let runtime = self.runtime.clone();
        let id = self.container_id.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            warn!(container = %id, "sandbox dropped without destroy, removing in background");
            handle.spawn(async move {
                let _ = runtime.remove(&id).await;
            });
        } else {
            error!(container = %id, "sandbox dropped outside a runtime; container may linger");
        }
    }
}

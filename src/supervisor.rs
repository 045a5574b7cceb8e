//! Runs one request inside its provisioned sandbox.
//!
//! The supervisor owns the request's terminal state machine: running →
//! {completed, timed-out, resource-killed, canceled, infra-error}. Timeout
//! and cancellation are first-class transitions, not ambient interrupts, so
//! every exit path is enumerable and tested. The sandbox itself is torn down
//! by the caller; the supervisor only ever starts, observes, and kills.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::lifecycle::Sandbox;
use crate::runtime::OutputChunk;
use crate::types::{Classification, ExecutionRequest, ExecutionResult};

/// Appended to a capture that hit its size cap.
pub const TRUNCATION_MARKER: &str = "\n[output truncated]\n";

/// Docker reports SIGKILL terminations as 128 + 9. On the natural exit path
/// (no host-initiated kill) that means the kernel or runtime killed the
/// process for a resource ceiling: OOM, or the pids limit stopping a fork
/// bomb.
const EXIT_SIGKILL: i64 = 137;

/// How long to wait for the log stream to flush after termination.
const CAPTURE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Wall-clock budget for one execution.
    pub timeout: Duration,
    /// Capture cap per stream, in bytes.
    pub output_cap: usize,
    /// How long to wait for a killed container to report its exit.
    pub kill_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            output_cap: 1024 * 1024,
            kill_grace: Duration::from_secs(5),
        }
    }
}

/// Sender half of a cancellation pair: cloneable, signal-once.
///
/// Cancellation is delivered to the supervisor as a terminal transition; the
/// sandboxed process is forcibly terminated within the kill-grace bound and
/// teardown still runs.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn signal(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded capture buffer. Bytes past the cap are counted as truncation and
/// discarded, so host memory never grows with the submission's output volume.
struct CappedBuffer {
    data: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl CappedBuffer {
    fn new(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            cap,
            truncated: false,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        let room = self.cap.saturating_sub(self.data.len());
        if bytes.len() > room {
            self.data.extend_from_slice(&bytes[..room]);
            self.truncated = true;
        } else {
            self.data.extend_from_slice(bytes);
        }
    }

    fn render(&self) -> (String, bool) {
        let mut text = String::from_utf8_lossy(&self.data).into_owned();
        if self.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        (text, self.truncated)
    }
}

enum Terminal {
    Exited(i64),
    Deadline,
    Canceled,
    RuntimeFailure(String),
}

/// Run the request to its terminal state and produce the immutable result.
///
/// Never returns an error: infrastructure failures become the `infra-error`
/// classification so every admitted submission yields exactly one result.
pub async fn run(
    sandbox: &Sandbox,
    request: &ExecutionRequest,
    config: &SupervisorConfig,
    cancel: watch::Receiver<bool>,
) -> ExecutionResult {
    if let Err(e) = sandbox.start().await {
        error!(request = %request.id, error = %e, "failed to start sandbox");
        return ExecutionResult::infra_error(request, &format!("failed to start sandbox: {}", e));
    }
    let started = Instant::now();
    debug!(request = %request.id, container = %sandbox.container_id(), "execution started");

    // The log stream is retained from container start, so attaching after
    // start loses nothing. Buffers are shared with the capture task so
    // partial output survives even if the task is aborted.
    let stdout = Arc::new(Mutex::new(CappedBuffer::new(config.output_cap)));
    let stderr = Arc::new(Mutex::new(CappedBuffer::new(config.output_cap)));
    let mut capture = spawn_capture(sandbox, stdout.clone(), stderr.clone());

    let terminal = wait_for_terminal(sandbox, config.timeout, cancel).await;

    let (classification, exit_code) = match terminal {
        Terminal::Exited(code) => classify_exit(sandbox, request, code).await,
        Terminal::Deadline => {
            warn!(
                request = %request.id,
                identity = %request.identity,
                timeout_secs = config.timeout.as_secs(),
                "execution timed out, killing sandbox"
            );
            terminate(sandbox, request, config.kill_grace).await;
            (Classification::TimedOut, None)
        }
        Terminal::Canceled => {
            info!(request = %request.id, "execution canceled");
            terminate(sandbox, request, config.kill_grace).await;
            (Classification::Canceled, None)
        }
        Terminal::RuntimeFailure(reason) => {
            error!(request = %request.id, error = %reason, "runtime failed during execution");
            (Classification::InfraError, None)
        }
    };

    // Let the stream flush what the container wrote right before exiting.
    if tokio::time::timeout(CAPTURE_GRACE, &mut capture).await.is_err() {
        capture.abort();
    }

    let (stdout_text, stdout_truncated) = stdout.lock().unwrap().render();
    let (stderr_text, stderr_truncated) = stderr.lock().unwrap().render();

    ExecutionResult {
        request_id: request.id,
        identity: request.identity.clone(),
        classification,
        exit_code,
        stdout: stdout_text,
        stderr: stderr_text,
        stdout_truncated,
        stderr_truncated,
        duration: started.elapsed(),
    }
}

fn spawn_capture(
    sandbox: &Sandbox,
    stdout: Arc<Mutex<CappedBuffer>>,
    stderr: Arc<Mutex<CappedBuffer>>,
) -> tokio::task::JoinHandle<()> {
    let mut stream = sandbox.output();
    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            match item {
                Ok(OutputChunk::Stdout(bytes)) => stdout.lock().unwrap().push(&bytes),
                Ok(OutputChunk::Stderr(bytes)) => stderr.lock().unwrap().push(&bytes),
                Err(e) => {
                    debug!(error = %e, "output stream ended with error");
                    break;
                }
            }
        }
    })
}

async fn wait_for_terminal(
    sandbox: &Sandbox,
    timeout: Duration,
    mut cancel: watch::Receiver<bool>,
) -> Terminal {
    tokio::select! {
        status = sandbox.wait() => match status {
            Ok(code) => Terminal::Exited(code),
            Err(e) => Terminal::RuntimeFailure(e.to_string()),
        },
        _ = tokio::time::sleep(timeout) => Terminal::Deadline,
        _ = cancel_requested(&mut cancel) => Terminal::Canceled,
    }
}

/// Resolves when cancellation is requested; never resolves if the sender
/// was dropped without signaling.
async fn cancel_requested(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Classify a natural termination. The OOM flag wins over the raw code; a
/// SIGKILL exit without it means the pids limit (fork bomb) on this path.
async fn classify_exit(
    sandbox: &Sandbox,
    request: &ExecutionRequest,
    code: i64,
) -> (Classification, Option<i64>) {
    match sandbox.exit_details().await {
        Ok(details) if details.oom_killed => {
            warn!(
                request = %request.id,
                identity = %request.identity,
                "submission OOM-killed at the memory ceiling"
            );
            (Classification::ResourceKilled, None)
        }
        Ok(_) if code == EXIT_SIGKILL => {
            warn!(
                request = %request.id,
                identity = %request.identity,
                "submission killed by the runtime, likely at the pids limit"
            );
            (Classification::ResourceKilled, None)
        }
        Ok(_) => {
            info!(request = %request.id, exit_code = code, "execution completed");
            (Classification::Completed, Some(code))
        }
        Err(e) => {
            error!(request = %request.id, error = %e, "failed to inspect exit state");
            (Classification::InfraError, None)
        }
    }
}

/// Force-stop the sandboxed process tree and wait (bounded) for it to die.
async fn terminate(sandbox: &Sandbox, request: &ExecutionRequest, grace: Duration) {
    if let Err(e) = sandbox.kill().await {
        // Teardown will force-remove the container regardless.
        error!(request = %request.id, error = %e, "kill failed");
        return;
    }
    if tokio::time::timeout(grace, sandbox.wait()).await.is_err() {
        error!(request = %request.id, "sandbox did not exit within kill grace");
    }
}

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// A single submission of untrusted code.
///
/// Owned exclusively by its request's task from admission until the terminal
/// result is produced. The identity is a verified token handed in by the
/// (out-of-scope) auth layer; the orchestrator never authenticates.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Unique id, also used to name the backing container.
    pub id: Uuid,
    /// Verified requester identity.
    pub identity: String,
    /// Source code payload. Transported as opaque bytes; never interpreted
    /// outside the sandbox boundary.
    pub source: String,
    /// Optional stdin payload, delivered to the program once at startup.
    pub stdin: Option<String>,
    /// Submission wall-clock timestamp.
    pub submitted_at: SystemTime,
}

impl ExecutionRequest {
    pub fn new(identity: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity: identity.into(),
            source: source.into(),
            stdin: None,
            submitted_at: SystemTime::now(),
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

/// Terminal classification of a submission.
///
/// Sandbox-internal failures (crashes, loops, resource ceilings) are normal
/// outcomes, never system errors. Only `InfraError` originates in the
/// orchestration layer itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    /// The program terminated on its own; the exit code carries success or
    /// failure of the user's code.
    Completed,
    /// Forcibly terminated at the wall-clock budget.
    TimedOut,
    /// Terminated by the runtime for exceeding a resource ceiling (OOM kill
    /// or process-count limit).
    ResourceKilled,
    /// Forcibly terminated by an external cancel signal.
    Canceled,
    /// The orchestration or runtime layer failed; not the user's fault.
    InfraError,
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Classification::Completed => "completed",
            Classification::TimedOut => "timed-out",
            Classification::ResourceKilled => "resource-killed",
            Classification::Canceled => "canceled",
            Classification::InfraError => "infra-error",
        };
        f.write_str(s)
    }
}

/// Outcome of one submission, produced on sandbox teardown and immutable
/// thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub request_id: Uuid,
    pub identity: String,
    pub classification: Classification,
    /// Present only when the program terminated on its own.
    pub exit_code: Option<i64>,
    /// Captured stdout, capped; carries a truncation marker when clipped.
    pub stdout: String,
    /// Captured stderr, capped; carries a truncation marker when clipped.
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    /// Wall-clock time from container start to terminal event.
    pub duration: Duration,
}

impl ExecutionResult {
    /// Result for a request that never got a running sandbox.
    pub fn infra_error(request: &ExecutionRequest, reason: &str) -> Self {
        Self {
            request_id: request.id,
            identity: request.identity.clone(),
            classification: Classification::InfraError,
            exit_code: None,
            stdout: String::new(),
            stderr: reason.to_string(),
            stdout_truncated: false,
            stderr_truncated: false,
            duration: Duration::ZERO,
        }
    }
}

//! Stable external record for the web layer.
//!
//! Pure transformation of an [`ExecutionResult`]; no side effects, no
//! sandbox access. Field names and classification strings are the wire
//! contract and must not drift.

use serde::Serialize;

use crate::types::{Classification, ExecutionResult};

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub request_id: String,
    pub identity: String,
    pub classification: Classification,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
    pub duration_ms: u64,
}

impl From<&ExecutionResult> for ExecutionReport {
    fn from(result: &ExecutionResult) -> Self {
        Self {
            request_id: result.request_id.to_string(),
            identity: result.identity.clone(),
            classification: result.classification,
            exit_code: result.exit_code,
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            truncated: result.stdout_truncated || result.stderr_truncated,
            duration_ms: result.duration.as_millis() as u64,
        }
    }
}

impl ExecutionReport {
    pub fn to_json(&self) -> String {
        // Serialization of a plain struct with string keys cannot fail.
        serde_json::to_string(self).expect("report serialization")
    }
}

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Network mode for sandboxes. Only `none` is accepted; the variant exists so
/// the config layer rejects anything else at load time instead of silently
/// granting network access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    #[default]
    None,
}

impl std::str::FromStr for NetworkMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(NetworkMode::None),
            other => Err(Error::InvalidPolicy(format!(
                "network mode must be \"none\", got \"{}\"",
                other
            ))),
        }
    }
}

/// The immutable sandbox contract: resource ceilings, filesystem mode,
/// network mode, and the identity untrusted code runs as.
///
/// Built once at process start, validated, and shared read-only by every
/// sandbox. There is no mutation path after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationPolicy {
    /// Base execution image reference.
    pub image: String,
    /// Memory ceiling in bytes. Swap is clamped to the same value, so the
    /// ceiling is absolute.
    pub memory_bytes: i64,
    /// CPU ceiling as a fraction of one core, in (0, 1].
    pub cpu_limit: f64,
    /// Size ceiling in bytes for every writable mount. Writes past it fail
    /// inside the sandbox.
    pub scratch_bytes: i64,
    /// Maximum number of processes inside the sandbox.
    pub pids_limit: i64,
    /// Unprivileged identity the sandboxed process runs as.
    pub uid: u32,
    pub gid: u32,
    /// Must be `none`.
    pub network: NetworkMode,
}

impl Default for IsolationPolicy {
    fn default() -> Self {
        Self {
            image: "python:3.12-alpine".to_string(),
            memory_bytes: 48 * 1024 * 1024,
            cpu_limit: 0.20,
            scratch_bytes: 10 * 1024 * 1024,
            pids_limit: 15,
            // nobody:nogroup
            uid: 65534,
            gid: 65534,
            network: NetworkMode::None,
        }
    }
}

impl IsolationPolicy {
    /// Fail-fast validation. The process must not start with a policy that
    /// weakens the isolation contract.
    pub fn validate(&self) -> Result<(), Error> {
        if self.image.trim().is_empty() {
            return Err(Error::InvalidPolicy("image reference is empty".into()));
        }
        if self.memory_bytes <= 0 {
            return Err(Error::InvalidPolicy(format!(
                "memory ceiling must be positive, got {}",
                self.memory_bytes
            )));
        }
        if !(self.cpu_limit > 0.0 && self.cpu_limit <= 1.0) {
            return Err(Error::InvalidPolicy(format!(
                "cpu limit must be in (0, 1], got {}",
                self.cpu_limit
            )));
        }
        if self.scratch_bytes <= 0 {
            return Err(Error::InvalidPolicy(format!(
                "scratch ceiling must be positive, got {}",
                self.scratch_bytes
            )));
        }
        if self.pids_limit <= 0 {
            return Err(Error::InvalidPolicy(format!(
                "pids limit must be positive, got {}",
                self.pids_limit
            )));
        }
        if self.uid == 0 {
            return Err(Error::InvalidPolicy(
                "execution identity resolves to root (uid 0)".into(),
            ));
        }
        Ok(())
    }

    /// Docker expresses CPU ceilings in nano-CPUs (1 core = 1e9).
    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_limit * 1_000_000_000.0) as i64
    }

    /// Identity in `uid:gid` form, as the runtime expects it.
    pub fn user(&self) -> String {
        format!("{}:{}", self.uid, self.gid)
    }
}

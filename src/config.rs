use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;
use crate::policy::{IsolationPolicy, NetworkMode};

/// Orchestrator configuration, loaded once at process start from TOML and
/// validated before anything else is constructed.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum number of sandboxes running at once. Sized below host
    /// capacity: each sandbox reserves its full memory/CPU ceiling.
    pub max_concurrent: usize,
    /// Maximum slots one identity may hold (or wait for) simultaneously.
    pub per_identity_cap: usize,
    /// How long an admitted caller may wait in the queue for a free slot.
    pub queue_wait_secs: u64,
    /// Bounded queue depth; callers beyond it are rejected immediately.
    pub max_queue_depth: usize,
    /// Wall-clock budget for one execution.
    pub execution_timeout_secs: u64,
    /// Capture cap per stream, in bytes.
    pub output_cap_bytes: usize,
    /// How long to wait for a killed container to actually exit.
    pub kill_grace_secs: u64,
    /// Provisioning retry budget.
    pub provision_attempts: u32,
    /// Initial retry backoff; doubles per attempt.
    pub provision_backoff_ms: u64,
    pub policy: PolicyConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            per_identity_cap: 2,
            queue_wait_secs: 30,
            max_queue_depth: 32,
            execution_timeout_secs: 300,
            output_cap_bytes: 1024 * 1024,
            kill_grace_secs: 5,
            provision_attempts: 3,
            provision_backoff_ms: 200,
            policy: PolicyConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, Error> {
        let config: OrchestratorConfig =
            toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.max_concurrent == 0 {
            return Err(Error::Config("max_concurrent must be positive".into()));
        }
        if self.per_identity_cap == 0 {
            return Err(Error::Config("per_identity_cap must be positive".into()));
        }
        if self.execution_timeout_secs == 0 {
            return Err(Error::Config("execution_timeout_secs must be positive".into()));
        }
        if self.output_cap_bytes == 0 {
            return Err(Error::Config("output_cap_bytes must be positive".into()));
        }
        if self.provision_attempts == 0 {
            return Err(Error::Config("provision_attempts must be positive".into()));
        }
        // Policy validation is the hard gate; it runs on the converted form.
        self.policy.to_policy().map(|_| ())
    }

    pub fn queue_wait(&self) -> Duration {
        Duration::from_secs(self.queue_wait_secs)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn provision_backoff(&self) -> Duration {
        Duration::from_millis(self.provision_backoff_ms)
    }
}

/// Human-friendly form of [`IsolationPolicy`] as it appears in the config
/// file. Sizes accept suffixed strings ("48m", "1Gi").
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub image: String,
    pub memory: String,
    pub cpu: f64,
    pub scratch: String,
    pub pids_limit: i64,
    pub user: String,
    pub network: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            image: "python:3.12-alpine".to_string(),
            memory: "48m".to_string(),
            cpu: 0.20,
            scratch: "10m".to_string(),
            pids_limit: 15,
            user: "65534:65534".to_string(),
            network: "none".to_string(),
        }
    }
}

impl PolicyConfig {
    pub fn to_policy(&self) -> Result<IsolationPolicy, Error> {
        let memory_bytes = parse_size(&self.memory).ok_or_else(|| {
            Error::InvalidPolicy(format!("unparseable memory ceiling \"{}\"", self.memory))
        })?;
        let scratch_bytes = parse_size(&self.scratch).ok_or_else(|| {
            Error::InvalidPolicy(format!("unparseable scratch ceiling \"{}\"", self.scratch))
        })?;
        let (uid, gid) = parse_user(&self.user)?;
        let network: NetworkMode = self.network.parse()?;

        let policy = IsolationPolicy {
            image: self.image.clone(),
            memory_bytes,
            cpu_limit: self.cpu,
            scratch_bytes,
            pids_limit: self.pids_limit,
            uid,
            gid,
            network,
        };
        policy.validate()?;
        Ok(policy)
    }
}

/// Parse a size string (e.g. "48m", "512Mi", "1G") to bytes.
fn parse_size(size: &str) -> Option<i64> {
    let size = size.trim();

    let mut split_idx = 0;
    for (i, c) in size.char_indices() {
        if !c.is_ascii_digit() && c != '.' {
            split_idx = i;
            break;
        }
    }

    if split_idx == 0 {
        return size.parse::<i64>().ok();
    }

    let (num_str, unit) = size.split_at(split_idx);
    let num: f64 = num_str.parse().ok()?;

    let multiplier: i64 = match unit.to_uppercase().as_str() {
        "B" | "" => 1,
        "K" | "KB" | "KI" | "KIB" => 1024,
        "M" | "MB" | "MI" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GI" | "GIB" => 1024 * 1024 * 1024,
        _ => return None,
    };

    Some((num * multiplier as f64) as i64)
}

/// Parse a numeric `uid:gid` identity. Names are deliberately not resolved:
/// the id must exist inside the container image, not on the host.
fn parse_user(user: &str) -> Result<(u32, u32), Error> {
    let (uid_str, gid_str) = user
        .split_once(':')
        .ok_or_else(|| Error::InvalidPolicy(format!("identity must be uid:gid, got \"{}\"", user)))?;
    let uid = uid_str
        .parse::<u32>()
        .map_err(|_| Error::InvalidPolicy(format!("unparseable uid \"{}\"", uid_str)))?;
    let gid = gid_str
        .parse::<u32>()
        .map_err(|_| Error::InvalidPolicy(format!("unparseable gid \"{}\"", gid_str)))?;
    Ok((uid, gid))
}

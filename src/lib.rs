//! # Classbox
//!
//! A sandboxed execution orchestrator for untrusted code submissions.
//! Given a block of source and a verified requester identity, it provisions
//! an isolated, resource-capped, network-less container, runs the code to
//! completion or forced termination, captures size-capped output, and tears
//! everything down while bounding total concurrent host load.
//!
//! The web layer, authentication, and persistence live outside this crate;
//! the only inbound surface is [`Orchestrator::submit`] and the only
//! outbound dependency is the local Docker daemon.

mod config;
mod error;
mod lifecycle;
mod policy;
mod report;
mod runtime;
mod scheduler;
mod service;
mod supervisor;
mod types;

#[cfg(test)]
pub(crate) mod testkit;

pub use config::{OrchestratorConfig, PolicyConfig};
pub use error::Error;
pub use lifecycle::{ProvisionConfig, Sandbox};
pub use policy::{IsolationPolicy, NetworkMode};
pub use report::ExecutionReport;
pub use runtime::{
    ContainerRuntime, ContainerSpec, DockerRuntime, ExitDetails, OutputChunk, OutputStream,
};
pub use scheduler::{AdmissionScheduler, AdmissionSlot, SchedulerConfig};
pub use service::Orchestrator;
pub use supervisor::{CancelHandle, SupervisorConfig, TRUNCATION_MARKER};
pub use types::{Classification, ExecutionRequest, ExecutionResult};

/// Result type for orchestrator operations
pub type Result<T> = std::result::Result<T, Error>;

//! The orchestrator facade: the single inbound interface for the web layer.
//!
//! Per request, strictly ordered: slot acquisition → provisioning →
//! execution → teardown → slot release. The slot is an RAII guard held in
//! the outermost scope, and the sandbox destroys itself structurally, so no
//! failure in between can leak either.

use std::sync::Arc;

use tracing::error;

use crate::config::OrchestratorConfig;
use crate::lifecycle::{self, ProvisionConfig};
use crate::policy::IsolationPolicy;
use crate::runtime::{ContainerRuntime, DockerRuntime};
use crate::scheduler::{AdmissionScheduler, SchedulerConfig};
use crate::supervisor::{self, CancelHandle, SupervisorConfig};
use crate::types::{Classification, ExecutionRequest, ExecutionResult};
use crate::Result;

#[derive(Clone)]
pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    policy: Arc<IsolationPolicy>,
    scheduler: AdmissionScheduler,
    supervisor: SupervisorConfig,
    provision: ProvisionConfig,
}

impl Orchestrator {
    /// Build the orchestrator over an already-connected runtime.
    ///
    /// Validates the whole configuration first; an invalid policy refuses to
    /// construct anything.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: &OrchestratorConfig) -> Result<Self> {
        config.validate()?;
        let policy = config.policy.to_policy()?;

        Ok(Self {
            runtime,
            policy: Arc::new(policy),
            scheduler: AdmissionScheduler::new(SchedulerConfig {
                max_concurrent: config.max_concurrent,
                per_identity_cap: config.per_identity_cap,
                queue_wait: config.queue_wait(),
                max_queue_depth: config.max_queue_depth,
            }),
            supervisor: SupervisorConfig {
                timeout: config.execution_timeout(),
                output_cap: config.output_cap_bytes,
                kill_grace: config.kill_grace(),
            },
            provision: ProvisionConfig {
                attempts: config.provision_attempts,
                backoff: config.provision_backoff(),
            },
        })
    }

    /// Connect to the local Docker daemon, make sure the execution image is
    /// present (pulling if needed), and build the orchestrator on top.
    pub async fn with_docker(config: &OrchestratorConfig) -> Result<Self> {
        let runtime = DockerRuntime::connect().await?;
        let policy = config.policy.to_policy()?;
        runtime.ensure_image(&policy.image).await?;
        Self::new(Arc::new(runtime), config)
    }

    /// Run one submission to its terminal classification.
    ///
    /// # Errors
    ///
    /// Only [`crate::Error::Overloaded`] reaches the caller, so upstream can
    /// show backpressure. Every admitted submission yields exactly one
    /// classified result; infrastructure failures come back as the
    /// `infra-error` classification, never as silence.
    pub async fn submit(
        &self,
        identity: &str,
        source: &str,
        stdin: Option<String>,
    ) -> Result<ExecutionResult> {
        let mut request = ExecutionRequest::new(identity, source);
        if let Some(stdin) = stdin {
            request = request.with_stdin(stdin);
        }
        self.submit_with_cancel(request, &CancelHandle::new()).await
    }

    /// Like [`submit`](Self::submit), with an external cancel signal that
    /// propagates to forcible termination of the sandboxed process.
    pub async fn submit_with_cancel(
        &self,
        request: ExecutionRequest,
        cancel: &CancelHandle,
    ) -> Result<ExecutionResult> {
        let _slot = self.scheduler.acquire(&request.identity).await?;
        Ok(self.run_admitted(&request, cancel).await)
        // _slot drops here: released exactly once, whatever happened above.
    }

    async fn run_admitted(&self, request: &ExecutionRequest, cancel: &CancelHandle) -> ExecutionResult {
        let sandbox = match lifecycle::provision(
            self.runtime.clone(),
            &self.policy,
            request,
            &self.provision,
        )
        .await
        {
            Ok(sandbox) => sandbox,
            Err(e) => {
                error!(request = %request.id, error = %e, "provisioning failed");
                return ExecutionResult::infra_error(request, &e.to_string());
            }
        };

        let mut result = supervisor::run(&sandbox, request, &self.supervisor, cancel.signal()).await;

        if sandbox.destroy().await.is_err() {
            // A teardown the runtime would not acknowledge counts against the
            // execution; the captured output is still returned.
            result.classification = Classification::InfraError;
            result.exit_code = None;
        }

        result
    }

    pub fn policy(&self) -> &IsolationPolicy {
        &self.policy
    }

    pub fn available_slots(&self) -> usize {
        self.scheduler.available_slots()
    }
}

//! Scripted in-memory container runtime for unit and fault-injection tests.
//!
//! Each [`FakeScript`] field injects one behavior: create failures exercise
//! the provisioning retry budget, `panic_on_wait` exercises unwind paths,
//! long `run_for` exercises timeout and cancel. Counters expose what the
//! orchestrator actually did so slot-leak and no-dangling-sandbox properties
//! are directly assertable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::Error;
use crate::runtime::{ContainerRuntime, ContainerSpec, ExitDetails, OutputChunk, OutputStream};
use crate::Result;

#[derive(Debug, Clone)]
pub struct FakeScript {
    /// Fail this many create calls before succeeding.
    pub create_failures: usize,
    pub start_fails: bool,
    pub wait_fails: bool,
    pub panic_on_wait: bool,
    pub remove_fails: bool,
    pub exit_code: i64,
    pub oom_killed: bool,
    /// How long the fake process "runs" before exiting on its own.
    pub run_for: Duration,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Emit the stdout/stderr chunks this many times.
    pub output_repeat: usize,
}

impl Default for FakeScript {
    fn default() -> Self {
        Self {
            create_failures: 0,
            start_fails: false,
            wait_fails: false,
            panic_on_wait: false,
            remove_fails: false,
            exit_code: 0,
            oom_killed: false,
            run_for: Duration::ZERO,
            stdout: Vec::new(),
            stderr: Vec::new(),
            output_repeat: 1,
        }
    }
}

struct FakeContainer {
    killed: Arc<Notify>,
    removed: bool,
}

pub struct FakeRuntime {
    script: FakeScript,
    remaining_create_failures: AtomicUsize,
    create_attempts: AtomicUsize,
    created: AtomicUsize,
    removed: AtomicUsize,
    kills: AtomicUsize,
    running: AtomicIsize,
    peak_running: AtomicIsize,
    next_id: AtomicUsize,
    containers: Mutex<HashMap<String, FakeContainer>>,
    last_spec: Mutex<Option<ContainerSpec>>,
}

impl FakeRuntime {
    pub fn new(script: FakeScript) -> Self {
        Self {
            remaining_create_failures: AtomicUsize::new(script.create_failures),
            script,
            create_attempts: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            removed: AtomicUsize::new(0),
            kills: AtomicUsize::new(0),
            running: AtomicIsize::new(0),
            peak_running: AtomicIsize::new(0),
            next_id: AtomicUsize::new(0),
            containers: Mutex::new(HashMap::new()),
            last_spec: Mutex::new(None),
        }
    }

    pub fn create_attempts(&self) -> usize {
        self.create_attempts.load(Ordering::Acquire)
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }

    pub fn removed_count(&self) -> usize {
        self.removed.load(Ordering::Acquire)
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::Acquire)
    }

    /// Highest number of sandboxes that existed at once.
    pub fn peak_running(&self) -> isize {
        self.peak_running.load(Ordering::Acquire)
    }

    pub fn last_spec(&self) -> Option<ContainerSpec> {
        self.last_spec.lock().unwrap().clone()
    }

    fn killed_signal(&self, id: &str) -> Arc<Notify> {
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .map(|c| c.killed.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        self.create_attempts.fetch_add(1, Ordering::AcqRel);

        let remaining = self.remaining_create_failures.load(Ordering::Acquire);
        if remaining > 0 {
            self.remaining_create_failures.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::Runtime("injected create failure".into()));
        }

        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::AcqRel));
        self.containers.lock().unwrap().insert(
            id.clone(),
            FakeContainer {
                killed: Arc::new(Notify::new()),
                removed: false,
            },
        );
        *self.last_spec.lock().unwrap() = Some(spec.clone());
        self.created.fetch_add(1, Ordering::AcqRel);

        let now = self.running.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_running.fetch_max(now, Ordering::AcqRel);
        Ok(id)
    }

    async fn start(&self, _id: &str) -> Result<()> {
        if self.script.start_fails {
            return Err(Error::Runtime("injected start failure".into()));
        }
        Ok(())
    }

    fn output(&self, _id: &str) -> OutputStream {
        let mut chunks: Vec<Result<OutputChunk>> = Vec::new();
        for _ in 0..self.script.output_repeat {
            if !self.script.stdout.is_empty() {
                chunks.push(Ok(OutputChunk::Stdout(self.script.stdout.clone())));
            }
            if !self.script.stderr.is_empty() {
                chunks.push(Ok(OutputChunk::Stderr(self.script.stderr.clone())));
            }
        }
        Box::pin(futures_util::stream::iter(chunks))
    }

    async fn wait(&self, id: &str) -> Result<i64> {
        if self.script.panic_on_wait {
            panic!("injected wait panic");
        }
        if self.script.wait_fails {
            return Err(Error::Runtime("injected wait failure".into()));
        }

        let killed = self.killed_signal(id);
        tokio::select! {
            _ = tokio::time::sleep(self.script.run_for) => Ok(self.script.exit_code),
            _ = killed.notified() => Ok(137),
        }
    }

    async fn kill(&self, id: &str) -> Result<()> {
        self.kills.fetch_add(1, Ordering::AcqRel);
        self.killed_signal(id).notify_one();
        Ok(())
    }

    async fn exit_details(&self, _id: &str) -> Result<ExitDetails> {
        Ok(ExitDetails {
            exit_code: self.script.exit_code,
            oom_killed: self.script.oom_killed,
        })
    }

    async fn remove(&self, id: &str) -> Result<()> {
        if self.script.remove_fails {
            return Err(Error::Runtime("injected remove failure".into()));
        }

        let mut containers = self.containers.lock().unwrap();
        if let Some(container) = containers.get_mut(id) {
            if !container.removed {
                container.removed = true;
                container.killed.notify_one();
                self.removed.fetch_add(1, Ordering::AcqRel);
                self.running.fetch_sub(1, Ordering::AcqRel);
            }
        }
        Ok(())
    }
}

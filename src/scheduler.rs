//! Bounds how many sandboxes the host runs at once.
//!
//! A counting-semaphore slot pool sized below host capacity (every sandbox
//! reserves its full memory/CPU ceiling, and the ceilings must sum within
//! physical limits). Callers block on a free slot up to a queue-wait
//! timeout; the queue itself is bounded, and beyond its depth callers are
//! rejected immediately rather than parked without limit. A per-identity
//! cap keeps one requester's burst from starving everyone else.
//!
//! Constructed explicitly and injected, so tests build it with tiny
//! capacities and other components can swap in fakes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, warn};

use crate::error::Error;
use crate::Result;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Size of the slot pool.
    pub max_concurrent: usize,
    /// Maximum slots one identity may hold or wait for at once.
    pub per_identity_cap: usize,
    /// How long a caller may wait for a free slot.
    pub queue_wait: Duration,
    /// Maximum callers waiting at once; beyond this, immediate rejection.
    pub max_queue_depth: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            per_identity_cap: 2,
            queue_wait: Duration::from_secs(30),
            max_queue_depth: 32,
        }
    }
}

struct Inner {
    slots: Arc<Semaphore>,
    config: SchedulerConfig,
    waiting: AtomicUsize,
    /// Slots held or waited for, per identity. The only mutable state shared
    /// between request workers, guarded here and nowhere else.
    in_flight: Mutex<HashMap<String, usize>>,
}

impl Inner {
    fn release_identity(&self, identity: &str) {
        let mut in_flight = self.in_flight.lock().unwrap();
        match in_flight.get_mut(identity) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                in_flight.remove(identity);
            }
            None => debug_assert!(false, "identity released without reservation"),
        }
    }
}

/// The capacity gate in front of sandbox provisioning.
#[derive(Clone)]
pub struct AdmissionScheduler {
    inner: Arc<Inner>,
}

/// Reservation against the per-identity cap; covers the wait in the queue as
/// well as the held slot.
struct IdentityReservation {
    inner: Arc<Inner>,
    identity: String,
}

impl Drop for IdentityReservation {
    fn drop(&mut self) {
        self.inner.release_identity(&self.identity);
    }
}

/// A granted capacity token. Releasing is dropping: one release per grant on
/// every exit path, panics included.
pub struct AdmissionSlot {
    _permit: OwnedSemaphorePermit,
    _reservation: IdentityReservation,
}

impl std::fmt::Debug for AdmissionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionSlot")
            .field("identity", &self._reservation.identity)
            .finish()
    }
}

impl AdmissionScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: Arc::new(Semaphore::new(config.max_concurrent)),
                waiting: AtomicUsize::new(0),
                in_flight: Mutex::new(HashMap::new()),
                config,
            }),
        }
    }

    /// Acquire a slot for `identity`, waiting up to the queue-wait timeout.
    ///
    /// # Errors
    ///
    /// [`Error::Overloaded`] when the identity is at its cap, the queue is
    /// full, or no slot frees up in time. Never blocks without bound.
    pub async fn acquire(&self, identity: &str) -> Result<AdmissionSlot> {
        {
            let mut in_flight = self.inner.in_flight.lock().unwrap();
            let count = in_flight.get(identity).copied().unwrap_or(0);
            if count >= self.inner.config.per_identity_cap {
                warn!(identity = %identity, held = count, "identity at concurrency cap");
                return Err(Error::Overloaded(format!(
                    "identity {} already has {} submissions in flight",
                    identity, count
                )));
            }
            in_flight.insert(identity.to_string(), count + 1);
        }
        let reservation = IdentityReservation {
            inner: self.inner.clone(),
            identity: identity.to_string(),
        };

        let permit = match self.inner.slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => self.acquire_queued(identity).await?,
            Err(TryAcquireError::Closed) => {
                return Err(Error::Overloaded("slot pool closed".into()));
            }
        };

        debug!(identity = %identity, available = self.inner.slots.available_permits(), "slot granted");
        Ok(AdmissionSlot {
            _permit: permit,
            _reservation: reservation,
        })
    }

    /// Slow path: no free slot. Join the bounded queue and wait.
    async fn acquire_queued(&self, identity: &str) -> Result<OwnedSemaphorePermit> {
        let already_waiting = self.inner.waiting.fetch_add(1, Ordering::AcqRel);
        if already_waiting >= self.inner.config.max_queue_depth {
            self.inner.waiting.fetch_sub(1, Ordering::AcqRel);
            warn!(identity = %identity, depth = already_waiting, "admission queue full");
            return Err(Error::Overloaded("admission queue is full".into()));
        }

        let waited = tokio::time::timeout(
            self.inner.config.queue_wait,
            self.inner.slots.clone().acquire_owned(),
        )
        .await;
        self.inner.waiting.fetch_sub(1, Ordering::AcqRel);

        match waited {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(Error::Overloaded("slot pool closed".into())),
            Err(_) => {
                warn!(
                    identity = %identity,
                    wait_secs = self.inner.config.queue_wait.as_secs(),
                    "no slot freed within the queue-wait timeout"
                );
                Err(Error::Overloaded(format!(
                    "no capacity within {}s",
                    self.inner.config.queue_wait.as_secs()
                )))
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.config.max_concurrent
    }

    pub fn available_slots(&self) -> usize {
        self.inner.slots.available_permits()
    }

    /// Slots currently held or waited for by `identity`.
    pub fn in_flight(&self, identity: &str) -> usize {
        self.inner
            .in_flight
            .lock()
            .unwrap()
            .get(identity)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn scheduler(max: usize, per_identity: usize, wait_ms: u64, depth: usize) -> AdmissionScheduler {
        AdmissionScheduler::new(SchedulerConfig {
            max_concurrent: max,
            per_identity_cap: per_identity,
            queue_wait: Duration::from_millis(wait_ms),
            max_queue_depth: depth,
        })
    }

    #[tokio::test]
    async fn grants_up_to_capacity_then_rejects() {
        let s = scheduler(2, 10, 50, 8);

        let a = s.acquire("alice").await.unwrap();
        let b = s.acquire("bob").await.unwrap();
        assert_eq!(s.available_slots(), 0);

        let err = s.acquire("carol").await.unwrap_err();
        assert!(err.is_overloaded());

        drop(a);
        let _c = s.acquire("carol").await.unwrap();
        drop(b);
    }

    #[tokio::test]
    async fn dropping_a_slot_releases_capacity() {
        let s = scheduler(1, 10, 50, 8);
        let slot = s.acquire("alice").await.unwrap();
        assert_eq!(s.available_slots(), 0);
        drop(slot);
        assert_eq!(s.available_slots(), 1);
        assert_eq!(s.in_flight("alice"), 0);
    }

    #[tokio::test]
    async fn per_identity_cap_rejects_immediately() {
        let s = scheduler(8, 1, 5_000, 8);

        let _held = s.acquire("alice").await.unwrap();

        // Pool has room, but alice is at her cap; rejection must not consume
        // the queue-wait budget.
        let started = Instant::now();
        let err = s.acquire("alice").await.unwrap_err();
        assert!(err.is_overloaded());
        assert!(started.elapsed() < Duration::from_millis(500));

        // Other identities are unaffected.
        let _bob = s.acquire("bob").await.unwrap();
    }

    #[tokio::test]
    async fn identity_burst_never_exceeds_cap() {
        let s = scheduler(8, 2, 50, 8);

        let mut granted = 0;
        let mut rejected = 0;
        let mut slots = Vec::new();
        for _ in 0..5 {
            match s.acquire("alice").await {
                Ok(slot) => {
                    granted += 1;
                    slots.push(slot);
                }
                Err(e) => {
                    assert!(e.is_overloaded());
                    rejected += 1;
                }
            }
        }
        assert_eq!(granted, 2);
        assert_eq!(rejected, 3);
        assert_eq!(s.in_flight("alice"), 2);

        slots.clear();
        assert_eq!(s.in_flight("alice"), 0);
    }

    #[tokio::test]
    async fn queue_wait_timeout_bounds_the_wait() {
        let s = scheduler(1, 10, 100, 8);
        let _held = s.acquire("alice").await.unwrap();

        let started = Instant::now();
        let err = s.acquire("bob").await.unwrap_err();
        assert!(err.is_overloaded());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn queued_caller_gets_the_freed_slot() {
        let s = scheduler(1, 10, 5_000, 8);
        let held = s.acquire("alice").await.unwrap();

        let s2 = s.clone();
        let waiter = tokio::spawn(async move { s2.acquire("bob").await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);

        let slot = waiter.await.unwrap().unwrap();
        drop(slot);
        assert_eq!(s.available_slots(), 1);
    }

    #[tokio::test]
    async fn full_queue_rejects_immediately() {
        let s = scheduler(1, 10, 5_000, 1);
        let _held = s.acquire("alice").await.unwrap();

        let s2 = s.clone();
        let _waiter = tokio::spawn(async move {
            // Occupies the single queue position for the full wait.
            let _ = s2.acquire("bob").await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        let err = s.acquire("carol").await.unwrap_err();
        assert!(err.is_overloaded());
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn rejected_acquire_leaves_no_identity_residue() {
        let s = scheduler(1, 10, 50, 8);
        let _held = s.acquire("alice").await.unwrap();

        let err = s.acquire("bob").await.unwrap_err();
        assert!(err.is_overloaded());
        assert_eq!(s.in_flight("bob"), 0);
    }
}

//! Idempotency leases: a request carrying an `Idempotency-Key` holds a lease
//! for that key while it is being processed. A second request with the same
//! key is rejected until the first one finishes or its lease expires.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::AdmissionError;

#[derive(Debug, Clone, Copy)]
struct Lease {
    id: u64,
    expiry: Instant,
}

#[derive(Debug, Default)]
struct Leases {
    next_id: u64,
    live: HashMap<String, Lease>,
}

#[derive(Debug)]
pub struct LeaseStore {
    ttl: Duration,
    inner: Mutex<Leases>,
}

impl LeaseStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(Leases::default()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Reserves `key`, failing with [`AdmissionError::DuplicateRequest`] while
    /// another live lease holds it. The returned guard releases on drop.
    pub fn try_acquire(self: &Arc<Self>, key: &str) -> Result<LeaseGuard, AdmissionError> {
        self.try_acquire_at(key, Instant::now())
    }

    pub fn try_acquire_at(
        self: &Arc<Self>,
        key: &str,
        now: Instant,
    ) -> Result<LeaseGuard, AdmissionError> {
        let mut leases = self.lock();
        if let Some(existing) = leases.live.get(key) {
            if now < existing.expiry {
                return Err(AdmissionError::DuplicateRequest);
            }
            debug!(key = %key, "Taking over expired idempotency lease");
        }
        leases.next_id = leases.next_id.wrapping_add(1);
        let id = leases.next_id;
        leases.live.insert(
            key.to_string(),
            Lease {
                id,
                expiry: now + self.ttl,
            },
        );
        Ok(LeaseGuard {
            store: Arc::clone(self),
            key: key.to_string(),
            id,
        })
    }

    /// Drops leases whose expiry has passed. Returns how many were removed.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut leases = self.lock();
        let before = leases.live.len();
        leases.live.retain(|_, lease| now < lease.expiry);
        before - leases.live.len()
    }

    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, key: &str, id: u64) {
        let mut leases = self.lock();
        // A holder whose lease expired and was taken over must not free the new one.
        if leases.live.get(key).map(|l| l.id) == Some(id) {
            leases.live.remove(key);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Leases> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Live reservation of an idempotency key.
#[derive(Debug)]
pub struct LeaseGuard {
    store: Arc<LeaseStore>,
    key: String,
    id: u64,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.store.release(&self.key, self.id);
    }
}

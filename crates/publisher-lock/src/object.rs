use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use publisher_storage::{ObjectStore, PutOptions};
use publisher_types::{Clock, system_clock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{BucketLock, LockConfig, LockError, LockMode};

/// Contents of the lock object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub created_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(owner: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            owner: owner.into(),
            created_at,
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Instant at which the lease stops being valid.
    pub fn expires_at(&self, ttl: Duration) -> DateTime<Utc> {
        chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| self.created_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now >= self.expires_at(ttl)
    }

    /// Same owner means the lock was already acquired by the caller.
    pub fn belongs_to(&self, owner: &str) -> bool {
        self.owner == owner
    }
}

/// Lease lock stored as a single object in a bucket.
pub struct ObjectLock<S> {
    store: S,
    config: LockConfig,
    clock: Arc<dyn Clock>,
}

impl<S: ObjectStore> ObjectLock<S> {
    pub fn new(store: S, config: LockConfig) -> Self {
        Self {
            store,
            config,
            clock: system_clock(),
        }
    }

    /// Use `clock` for lease timestamps and expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Read the lease currently stored at the lock key, if any.
    pub fn current_lease(&self) -> Result<Option<Lease>, LockError> {
        match self.store.get(&self.config.key) {
            Ok(bytes) => Ok(Some(Lease::decode(&bytes)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the key is held by another owner with an unexpired lease.
    ///
    /// Any failure to read or decode the lease counts as busy. An expired
    /// lease is left in place for the next writer to overwrite.
    pub fn is_busy(&self) -> bool {
        let bytes = match self.store.get(&self.config.key) {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return false,
            Err(e) => {
                warn!(owner = %self.config.owner, key = %self.config.key, error = %e, "cannot read lock, assuming busy");
                return true;
            }
        };
        let lease = match Lease::decode(&bytes) {
            Ok(lease) => lease,
            Err(e) => {
                warn!(owner = %self.config.owner, key = %self.config.key, error = %e, "cannot decode lock, assuming busy");
                return true;
            }
        };

        if lease.is_expired(self.config.ttl, self.clock.now()) {
            debug!(holder = %lease.owner, created_at = %lease.created_at, "lease expired");
            return false;
        }
        !lease.belongs_to(&self.config.owner)
    }

    fn wait_until_idle(&self) -> Result<(), LockError> {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        while self.is_busy() {
            if self.config.mode == LockMode::FailOnBusy || attempt >= self.config.max_retries {
                return Err(LockError::Busy);
            }
            attempt += 1;

            let mut wait = self.config.retry_backoff;
            if let Some(deadline) = self.config.deadline {
                let elapsed = started.elapsed();
                if elapsed >= deadline {
                    return Err(LockError::DeadlineExceeded(deadline));
                }
                wait = wait.min(deadline - elapsed);
            }

            info!(owner = %self.config.owner, attempt, wait = ?wait, "lock busy, waiting");
            thread::sleep(wait);
        }
        Ok(())
    }
}

impl<S: ObjectStore> BucketLock for ObjectLock<S> {
    /// Best effort only: the store has no compare-and-swap, so a concurrent
    /// writer may slip in between the checks and the write.
    fn lock(&self) -> Result<(), LockError> {
        self.wait_until_idle()?;

        let lease = Lease::new(self.config.owner.clone(), self.clock.now());
        let options = PutOptions::json().with_tagging(self.config.tags.to_query());
        self.store.put(&self.config.key, &lease.encode()?, &options)?;

        if self.is_busy() {
            warn!(owner = %self.config.owner, key = %self.config.key, "lost lock race after write");
            return Err(LockError::Busy);
        }
        info!(owner = %self.config.owner, key = %self.config.key, "lock acquired");
        Ok(())
    }

    fn release(&self) -> Result<(), LockError> {
        if self.is_busy() {
            return Err(LockError::Busy);
        }
        self.store.delete(&self.config.key)?;
        if self.is_busy() {
            return Err(LockError::Busy);
        }
        info!(owner = %self.config.owner, key = %self.config.key, "lock released");
        Ok(())
    }
}

impl<S> std::fmt::Debug for ObjectLock<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectLock")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

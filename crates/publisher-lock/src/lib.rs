//! Lease-based mutual exclusion for concurrent publish jobs.
//!
//! Publish runs execute as independent CI jobs that share nothing but a
//! bucket. Before mutating the repository tree a job takes a lease: a small
//! JSON object (`{"owner", "created_at"}`) written at the lock key. A lease
//! held by another owner blocks the job until it is released or its TTL
//! elapses.
//!
//! The object store has no compare-and-swap, so [`ObjectLock`] checks the
//! key before and after writing its lease. Two jobs can still both observe
//! an idle key and both write; the later write wins silently. This is
//! acceptable for low-contention CI scheduling and is not a linearizable lock.
//!
//! # Example
//!
//! ```
//! use publisher_lock::{BucketLock, LockConfig, ObjectLock};
//! use publisher_storage::MemoryStorage;
//!
//! let store = MemoryStorage::new("locks");
//! let first = ObjectLock::new(store.clone(), LockConfig::new("group", "nri-foo_v1.0_1"));
//! let second = ObjectLock::new(
//!     store,
//!     LockConfig::new("group", "nri-bar_v2.0_7").fail_on_busy(),
//! );
//!
//! first.lock().expect("idle key");
//! assert!(second.lock().unwrap_err().is_busy());
//! first.release().expect("release");
//! second.lock().expect("released key");
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use publisher_storage::StorageError;
use publisher_types::ResourceTags;
use serde::{Deserialize, Serialize};

mod local;
mod object;

pub use local::{InMemoryLock, NoopLock};
pub use object::{Lease, ObjectLock};

/// Lock key used when no lock group is configured.
pub const DEFAULT_LOCK_GROUP: &str = "lockgroup";
pub const DEFAULT_MAX_RETRIES: u32 = 30;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(20);
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// Errors returned by [`BucketLock`] implementations.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another owner holds an unexpired lease.
    #[error("lock is busy")]
    Busy,

    /// The lock could not be taken within the configured deadline.
    #[error("lock deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("invalid lease data: {0}")]
    Encode(#[from] serde_json::Error),
}

impl LockError {
    /// Whether the lock was contended rather than broken.
    pub fn is_busy(&self) -> bool {
        matches!(self, LockError::Busy | LockError::DeadlineExceeded(_))
    }
}

/// Mutual exclusion shared by independent processes.
pub trait BucketLock: Send + Sync {
    /// Acquire the lock, waiting according to the implementation's policy.
    fn lock(&self) -> Result<(), LockError>;

    /// Release a lock held by this owner.
    fn release(&self) -> Result<(), LockError>;
}

impl<T: BucketLock + ?Sized> BucketLock for Box<T> {
    fn lock(&self) -> Result<(), LockError> {
        (**self).lock()
    }

    fn release(&self) -> Result<(), LockError> {
        (**self).release()
    }
}

impl<T: BucketLock + ?Sized> BucketLock for std::sync::Arc<T> {
    fn lock(&self) -> Result<(), LockError> {
        (**self).lock()
    }

    fn release(&self) -> Result<(), LockError> {
        (**self).release()
    }
}

/// What to do when the lock is found busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Wait `retry_backoff` between checks, up to `max_retries` times.
    #[default]
    RetryOnBusy,
    /// Fail on the first busy check.
    FailOnBusy,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::RetryOnBusy => f.write_str("retry_on_busy"),
            LockMode::FailOnBusy => f.write_str("fail_on_busy"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid lock mode {0:?} (expected retry_on_busy or fail_on_busy)")]
pub struct InvalidLockMode(pub String);

impl FromStr for LockMode {
    type Err = InvalidLockMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "retry_on_busy" => Ok(LockMode::RetryOnBusy),
            "fail_on_busy" => Ok(LockMode::FailOnBusy),
            other => Err(InvalidLockMode(other.to_string())),
        }
    }
}

/// Settings for a lease lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    /// Object key holding the lease (the "lock group").
    pub key: String,
    /// Identity written into the lease.
    pub owner: String,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    /// Age after which a lease is considered abandoned.
    pub ttl: Duration,
    pub mode: LockMode,
    /// Upper bound on the total time spent in `lock()`.
    pub deadline: Option<Duration>,
    /// Tags attached to the lease object for ownership attribution.
    pub tags: ResourceTags,
}

impl LockConfig {
    pub fn new(key: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            owner: owner.into(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            ttl: DEFAULT_TTL,
            mode: LockMode::default(),
            deadline: None,
            tags: ResourceTags::default(),
        }
    }

    pub fn with_retries(mut self, max_retries: u32, retry_backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = retry_backoff;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_mode(mut self, mode: LockMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn fail_on_busy(self) -> Self {
        self.with_mode(LockMode::FailOnBusy)
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_tags(mut self, tags: ResourceTags) -> Self {
        self.tags = tags;
        self
    }
}

/// Failure of a lock-guarded section.
#[derive(Debug, thiserror::Error)]
pub enum GuardError<E> {
    #[error("acquiring lock: {0}")]
    Acquire(#[source] LockError),

    #[error("{0}")]
    Body(E),

    #[error("releasing lock: {0}")]
    Release(#[source] LockError),

    #[error("got 2 errors: {body}; releasing lock: {release}")]
    Both { body: E, release: LockError },
}

/// Run `f` while holding `lock`, releasing it whatever `f` returns.
pub fn with_lock<L, T, E, F>(lock: &L, f: F) -> Result<T, GuardError<E>>
where
    L: BucketLock + ?Sized,
    F: FnOnce() -> Result<T, E>,
{
    lock.lock().map_err(GuardError::Acquire)?;

    let outcome = f();
    let released = lock.release();

    match (outcome, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(release)) => Err(GuardError::Release(release)),
        (Err(body), Ok(())) => Err(GuardError::Body(body)),
        (Err(body), Err(release)) => Err(GuardError::Both { body, release }),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct CountingLock {
        locks: AtomicUsize,
        releases: AtomicUsize,
        fail_release: bool,
    }

    impl BucketLock for CountingLock {
        fn lock(&self) -> Result<(), LockError> {
            self.locks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn release(&self) -> Result<(), LockError> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            if self.fail_release {
                Err(LockError::Busy)
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn lock_mode_parses_known_values() {
        assert_eq!("".parse::<LockMode>().unwrap(), LockMode::RetryOnBusy);
        assert_eq!("retry_on_busy".parse::<LockMode>().unwrap(), LockMode::RetryOnBusy);
        assert_eq!("fail_on_busy".parse::<LockMode>().unwrap(), LockMode::FailOnBusy);
        assert_eq!(
            "sometimes".parse::<LockMode>().unwrap_err(),
            InvalidLockMode("sometimes".to_string())
        );
    }

    #[test]
    fn lock_config_defaults() {
        let config = LockConfig::new(DEFAULT_LOCK_GROUP, "owner");
        assert_eq!(config.max_retries, 30);
        assert_eq!(config.retry_backoff, Duration::from_secs(20));
        assert_eq!(config.ttl, Duration::from_secs(3600));
        assert_eq!(config.mode, LockMode::RetryOnBusy);
        assert_eq!(config.deadline, None);
        assert_eq!(config.tags, ResourceTags::default());
    }

    #[test]
    fn error_messages() {
        assert_eq!(LockError::Busy.to_string(), "lock is busy");
        assert_eq!(
            LockError::DeadlineExceeded(Duration::from_secs(90)).to_string(),
            "lock deadline of 90s exceeded"
        );
        assert!(LockError::DeadlineExceeded(Duration::from_millis(1)).is_busy());
    }

    #[test]
    fn with_lock_releases_after_success() {
        let lock = CountingLock::default();
        let value: Result<u8, GuardError<std::io::Error>> = with_lock(&lock, || Ok(7));
        assert_eq!(value.unwrap(), 7);
        assert_eq!(lock.locks.load(Ordering::SeqCst), 1);
        assert_eq!(lock.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn with_lock_releases_after_failure() {
        let lock = CountingLock::default();
        let err = with_lock(&lock, || -> Result<(), &str> { Err("upload failed") }).unwrap_err();
        assert!(matches!(err, GuardError::Body("upload failed")));
        assert_eq!(lock.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn with_lock_reports_both_failures() {
        let lock = CountingLock {
            fail_release: true,
            ..Default::default()
        };
        let err = with_lock(&lock, || -> Result<(), &str> { Err("upload failed") }).unwrap_err();
        assert_eq!(
            err.to_string(),
            "got 2 errors: upload failed; releasing lock: lock is busy"
        );
    }

    #[test]
    fn with_lock_surfaces_release_failure_after_success() {
        let lock = CountingLock {
            fail_release: true,
            ..Default::default()
        };
        let err = with_lock(&lock, || -> Result<(), &str> { Ok(()) }).unwrap_err();
        assert!(matches!(err, GuardError::Release(LockError::Busy)));
    }
}

use std::sync::Arc;
use std::time::Duration;

use publisher_storage::{ObjectMeta, ObjectStore, ReplicationStatus, StorageError};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_ATTEMPTS_PER_KEY: u32 = 5;

/// How hard to wait for each key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateConfig {
    pub attempts_per_key: u32,
    /// Bound on each metadata read. `None` waits as long as the read takes.
    pub attempt_timeout: Option<Duration>,
    /// Pause between attempts that found replication still in flight.
    pub poll_interval: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            attempts_per_key: DEFAULT_ATTEMPTS_PER_KEY,
            attempt_timeout: None,
            poll_interval: Duration::ZERO,
        }
    }
}

impl GateConfig {
    pub fn new(attempts_per_key: u32) -> Self {
        Self {
            attempts_per_key,
            ..Default::default()
        }
    }

    /// Set the per-read timeout; zero disables it.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("maximum attempts for key: {key}")]
    MaxAttempts { key: String, attempts: u32 },

    #[error("execution terminated: replication check cancelled")]
    Cancelled,

    #[error("replication check for key {key} timed out after {timeout:?}")]
    AttemptTimedOut { key: String, timeout: Duration },

    #[error("cannot get object metadata, key: {key}, error: {source}")]
    Storage {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("replication check task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Outcome for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyReport {
    pub key: String,
    /// Reads issued before the key was satisfied.
    pub attempts: u32,
    /// Status seen on the final read; `None` means replication is not
    /// configured for the key.
    pub status: Option<ReplicationStatus>,
}

/// All keys the gate found replicated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GateReport {
    pub keys: Vec<KeyReport>,
}

impl GateReport {
    pub fn total_attempts(&self) -> u32 {
        self.keys.iter().map(|k| k.attempts).sum()
    }
}

/// Waits until metadata objects report terminal replication status.
pub struct ReplicationGate {
    store: Arc<dyn ObjectStore>,
    config: GateConfig,
}

impl ReplicationGate {
    pub fn new(store: Arc<dyn ObjectStore>, config: GateConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Check `keys` one after another. Fails on the first key that does not
    /// converge, whose metadata cannot be read, or when `cancel` fires.
    ///
    /// Empty keys are skipped.
    pub async fn await_keys(
        &self,
        keys: &[String],
        cancel: &CancellationToken,
    ) -> Result<GateReport, GateError> {
        let mut report = GateReport::default();
        for key in keys.iter().filter(|k| !k.is_empty()) {
            report.keys.push(self.await_key(key, cancel).await?);
        }
        info!(keys = report.keys.len(), attempts = report.total_attempts(), "replication complete");
        Ok(report)
    }

    async fn await_key(&self, key: &str, cancel: &CancellationToken) -> Result<KeyReport, GateError> {
        let attempts = self.config.attempts_per_key;
        for attempt in 1..=attempts {
            let meta = self.read(key, cancel).await?;
            let status = meta.replication_status;
            debug!(key, attempt, status = ?status, "replication status");

            if status.as_ref().is_none_or(ReplicationStatus::is_completed) {
                return Ok(KeyReport {
                    key: key.to_string(),
                    attempts: attempt,
                    status,
                });
            }

            if attempt < attempts && !self.config.poll_interval.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(GateError::Cancelled),
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
        Err(GateError::MaxAttempts {
            key: key.to_string(),
            attempts,
        })
    }

    /// One metadata read on the blocking pool, raced against `cancel` and
    /// the per-attempt timeout.
    async fn read(&self, key: &str, cancel: &CancellationToken) -> Result<ObjectMeta, GateError> {
        let store = Arc::clone(&self.store);
        let owned_key = key.to_string();
        let task = tokio::task::spawn_blocking(move || store.head(&owned_key));

        let bounded = async {
            match self.config.attempt_timeout {
                Some(timeout) => tokio::time::timeout(timeout, task)
                    .await
                    .map_err(|_| GateError::AttemptTimedOut {
                        key: key.to_string(),
                        timeout,
                    }),
                None => Ok(task.await),
            }
        };

        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GateError::Cancelled),
            joined = bounded => joined?,
        };

        joined?.map_err(|source| GateError::Storage {
            key: key.to_string(),
            source,
        })
    }
}

impl std::fmt::Debug for ReplicationGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationGate")
            .field("bucket", &self.store.bucket())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use publisher_storage::{MemoryStorage, Operation, PutOptions};

    use super::*;

    fn store_with(keys: &[&str]) -> MemoryStorage {
        let store = MemoryStorage::new("downloads");
        for key in keys {
            store.put(key, b"<repomd/>", &PutOptions::default()).unwrap();
        }
        store
    }

    fn keys(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[tokio::test]
    async fn completed_and_unreplicated_keys_need_one_read_each() {
        let store = store_with(&["k1", "k2"]);
        store.set_replication_status("k1", Some(ReplicationStatus::Completed));
        let gate = ReplicationGate::new(Arc::new(store.clone()), GateConfig::new(5));

        let report = gate
            .await_keys(&keys(&["k1", "k2"]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(store.head_count(), 2);
        assert_eq!(
            report.keys,
            vec![
                KeyReport {
                    key: "k1".to_string(),
                    attempts: 1,
                    status: Some(ReplicationStatus::Completed)
                },
                KeyReport {
                    key: "k2".to_string(),
                    attempts: 1,
                    status: None
                },
            ]
        );
    }

    #[tokio::test]
    async fn pending_key_is_retried_until_completed() {
        let store = store_with(&["k1"]);
        store.script_replication(
            "k1",
            vec![
                Some(ReplicationStatus::Pending),
                Some(ReplicationStatus::Pending),
                Some(ReplicationStatus::Completed),
            ],
        );
        let gate = ReplicationGate::new(Arc::new(store.clone()), GateConfig::new(3));

        let report = gate.await_keys(&keys(&["k1"]), &CancellationToken::new()).await.unwrap();

        assert_eq!(report.total_attempts(), 3);
    }

    #[tokio::test]
    async fn never_completed_key_exhausts_attempts() {
        let store = store_with(&["k1", "k2"]);
        store.set_replication_status("k1", Some(ReplicationStatus::Pending));
        let gate = ReplicationGate::new(Arc::new(store.clone()), GateConfig::new(4));

        let err = gate
            .await_keys(&keys(&["k1", "k2"]), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "maximum attempts for key: k1");
        assert_eq!(store.head_count(), 4);
    }

    #[tokio::test]
    async fn failed_replication_is_not_terminal() {
        let store = store_with(&["k1"]);
        store.set_replication_status("k1", Some(ReplicationStatus::Failed));
        let gate = ReplicationGate::new(Arc::new(store), GateConfig::new(2));

        let err = gate.await_keys(&keys(&["k1"]), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, GateError::MaxAttempts { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn sdk_complete_spelling_keeps_polling() {
        let store = store_with(&["k1"]);
        store.set_replication_status("k1", Some(ReplicationStatus::from("COMPLETE")));
        let gate = ReplicationGate::new(Arc::new(store.clone()), GateConfig::new(2));

        let err = gate.await_keys(&keys(&["k1"]), &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, GateError::MaxAttempts { attempts: 2, .. }));
        assert_eq!(store.head_count(), 2);
    }

    #[tokio::test]
    async fn zero_attempts_fails_immediately() {
        let store = store_with(&["k1"]);
        let gate = ReplicationGate::new(Arc::new(store.clone()), GateConfig::new(0));

        let err = gate.await_keys(&keys(&["k1"]), &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, GateError::MaxAttempts { .. }));
        assert_eq!(store.head_count(), 0);
    }

    #[tokio::test]
    async fn read_error_is_fatal() {
        let store = store_with(&[]);
        let gate = ReplicationGate::new(Arc::new(store), GateConfig::new(3));

        let err = gate.await_keys(&keys(&["missing"]), &CancellationToken::new()).await.unwrap_err();

        match err {
            GateError::Storage { key, source } => {
                assert_eq!(key, "missing");
                assert!(source.is_not_found());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn backend_error_stops_without_retry() {
        let store = store_with(&["k1"]);
        store.fail_on("k1", Operation::Head);
        let gate = ReplicationGate::new(Arc::new(store.clone()), GateConfig::new(3));

        let err = gate.await_keys(&keys(&["k1"]), &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, GateError::Storage { .. }));
        assert_eq!(store.head_count(), 1);
    }

    #[tokio::test]
    async fn empty_keys_are_skipped() {
        let store = store_with(&["k1"]);
        let gate = ReplicationGate::new(Arc::new(store.clone()), GateConfig::new(1));

        let report = gate.await_keys(&keys(&["", "k1", ""]), &CancellationToken::new()).await.unwrap();

        assert_eq!(report.keys.len(), 1);
        assert_eq!(store.head_count(), 1);
    }

    #[tokio::test]
    async fn hung_read_times_out() {
        let store = store_with(&["k1"]);
        store.set_head_delay(Duration::from_millis(500));
        let gate = ReplicationGate::new(
            Arc::new(store),
            GateConfig::new(3).with_attempt_timeout(Duration::from_millis(20)),
        );

        let err = gate.await_keys(&keys(&["k1"]), &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(
            err,
            GateError::AttemptTimedOut { ref key, timeout } if key == "k1" && timeout == Duration::from_millis(20)
        ));
    }

    #[tokio::test]
    async fn cancellation_wins_over_hung_read() {
        let store = store_with(&["k1"]);
        store.set_head_delay(Duration::from_millis(500));
        let gate = ReplicationGate::new(Arc::new(store), GateConfig::new(3));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = gate.await_keys(&keys(&["k1"]), &cancel).await.unwrap_err();

        assert!(matches!(err, GateError::Cancelled));
        assert!(started.elapsed() < Duration::from_millis(450));
    }

    #[tokio::test]
    async fn cancellation_interrupts_poll_interval() {
        let store = store_with(&["k1"]);
        store.set_replication_status("k1", Some(ReplicationStatus::Pending));
        let gate = ReplicationGate::new(
            Arc::new(store.clone()),
            GateConfig::new(3).with_poll_interval(Duration::from_secs(30)),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = gate.await_keys(&keys(&["k1"]), &cancel).await.unwrap_err();

        assert!(matches!(err, GateError::Cancelled));
        assert_eq!(store.head_count(), 1);
    }

    #[test]
    fn zero_attempt_timeout_means_unbounded() {
        let config = GateConfig::default().with_attempt_timeout(Duration::ZERO);
        assert_eq!(config.attempt_timeout, None);
        assert_eq!(config.attempts_per_key, DEFAULT_ATTEMPTS_PER_KEY);
    }
}

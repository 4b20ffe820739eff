//! End-to-end flows built from the lock, marker and CDN crates.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use publisher_cdn::{
    FastlyClient, GateConfig, GateError, GateReport, PurgeError, PurgeResponse, PurgeTarget,
    ReplicationGate,
};
use publisher_config::Config;
use publisher_lock::{BucketLock, GuardError, NoopLock, ObjectLock, with_lock};
use publisher_release::{Mark, Marker, ObjectMarker};
use publisher_storage::{ObjectStore, build_storage_backend};
use publisher_types::ReleaseInfo;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Mutate the repository for `release` while holding `lock`, recording the
/// window in `marker`.
///
/// A failed start aborts the run before `mutate`. A failed `mutate` leaves
/// the mark open so the broken release stays visible in the log. A failed
/// end fails the run: an ordering error there means another writer touched
/// the log while the lock was held.
pub fn run_release<L, M, T, F>(lock: &L, marker: &M, release: ReleaseInfo, mutate: F) -> Result<T>
where
    L: BucketLock + ?Sized,
    M: Marker + ?Sized,
    F: FnOnce(&Mark) -> Result<T>,
{
    let app_name = release.app_name.clone();

    let outcome = with_lock(lock, || -> Result<T> {
        let mark = marker.start(release).context("cannot start release mark")?;

        let value = mutate(&mark).inspect_err(|_| {
            warn!(app_name = %app_name, start = %mark.start, "release failed, leaving mark open");
        })?;

        marker.end(&mark).map_err(|e| {
            error!(app_name = %app_name, start = %mark.start, error = %e, "cannot end release mark");
            anyhow::Error::new(e).context("cannot end release mark")
        })?;
        Ok(value)
    });

    outcome.map_err(|e| match e {
        GuardError::Body(body) => body,
        other => anyhow::Error::new(other),
    })
}

/// Result of the post-publish invalidation. Replication and CDN failures
/// are advisory: the packages are already published.
#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PurgeOutcome {
    Purged {
        replication: GateReport,
        response: PurgeResponse,
    },
    ReplicationIncomplete {
        #[serde(serialize_with = "display")]
        error: GateError,
    },
    PurgeFailed {
        replication: GateReport,
        #[serde(serialize_with = "display")]
        error: PurgeError,
    },
}

impl PurgeOutcome {
    pub fn is_purged(&self) -> bool {
        matches!(self, PurgeOutcome::Purged { .. })
    }

    /// Operator-facing warning for the advisory failures.
    pub fn warning(&self) -> Option<String> {
        match self {
            PurgeOutcome::Purged { .. } => None,
            PurgeOutcome::ReplicationIncomplete { error } => Some(format!(
                "replication did not complete ({error}); CDN not purged, manual purge required"
            )),
            PurgeOutcome::PurgeFailed { error, .. } => {
                Some(format!("CDN purge failed ({error}); manual purge required"))
            }
        }
    }
}

fn display<T: fmt::Display, S: serde::Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

/// Wait for every key in `keys` to replicate, then purge `target`.
///
/// The purge is skipped when replication does not converge, since purging
/// then would let edges re-cache stale metadata.
pub async fn purge_after_replication(
    store: Arc<dyn ObjectStore>,
    keys: &[String],
    gate: GateConfig,
    purger: &FastlyClient,
    target: &PurgeTarget,
    cancel: &CancellationToken,
) -> PurgeOutcome {
    let replication = match ReplicationGate::new(store, gate).await_keys(keys, cancel).await {
        Ok(report) => report,
        Err(error) => {
            warn!(error = %error, "replication incomplete, skipping CDN purge");
            return PurgeOutcome::ReplicationIncomplete { error };
        }
    };

    match purger.purge(target).await {
        Ok(response) => {
            info!(target = %target, id = ?response.id, "CDN cache purged");
            PurgeOutcome::Purged {
                replication,
                response,
            }
        }
        Err(error) => {
            warn!(target = %target, error = %error, "CDN purge failed");
            PurgeOutcome::PurgeFailed { replication, error }
        }
    }
}

/// Lock for this run: a no-op when locking is disabled, otherwise a lease
/// in the lock bucket.
pub fn build_lock(config: &Config) -> Result<Arc<dyn BucketLock>> {
    if config.lock.disabled {
        info!("locking disabled by configuration");
        return Ok(Arc::new(NoopLock::new()));
    }
    let store = build_storage_backend(&config.lock_storage()).context("cannot open lock bucket")?;
    Ok(Arc::new(ObjectLock::new(store, config.lock_config())))
}

/// Marker log in the repository bucket.
pub fn build_marker(config: &Config) -> Result<ObjectMarker<Arc<dyn ObjectStore>>> {
    let store =
        build_storage_backend(&config.release_storage()).context("cannot open release bucket")?;
    Ok(ObjectMarker::new(store, &config.release.marker_dir))
}

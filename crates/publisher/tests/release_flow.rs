//! Two publish jobs sharing a bucket through the filesystem backend.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use publisher::lock::{BucketLock, Lease, LockConfig, LockError, ObjectLock};
use publisher::pipeline::run_release;
use publisher::release::{Marker, MarkerError, ObjectMarker};
use publisher::storage::{FileStorage, ObjectStore};
use publisher::types::{Clock, ManualClock, ReleaseInfo};

fn job_lock(
    root: &std::path::Path,
    release: &ReleaseInfo,
    clock: &ManualClock,
) -> ObjectLock<FileStorage> {
    let config = LockConfig::new("lockgroup", release.lock_owner())
        .with_ttl(Duration::from_secs(3600))
        .fail_on_busy();
    ObjectLock::new(FileStorage::for_bucket(root.to_path_buf(), "locks"), config)
        .with_clock(Arc::new(clock.clone()))
}

fn job_marker(root: &std::path::Path, clock: &ManualClock) -> ObjectMarker<FileStorage> {
    ObjectMarker::new(FileStorage::for_bucket(root.to_path_buf(), "downloads"), "infrastructure_agent")
        .with_clock(Arc::new(clock.clone()))
}

#[test]
fn second_job_waits_for_the_first_to_finish() {
    let td = tempfile::tempdir().expect("tempdir");
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
    let foo = ReleaseInfo::new("nri-foo", "v1.0", "42");
    let bar = ReleaseInfo::new("nri-bar", "v2.0", "43");

    run_release(&job_lock(td.path(), &foo, &clock), &job_marker(td.path(), &clock), foo.clone(), |_| {
        let err = run_release(
            &job_lock(td.path(), &bar, &clock),
            &job_marker(td.path(), &clock),
            bar.clone(),
            |_| Ok(()),
        )
        .unwrap_err();
        assert!(err.to_string().contains("lock is busy"));
        Ok(())
    })
    .expect("first job");

    clock.advance(Duration::from_secs(60));
    run_release(&job_lock(td.path(), &bar, &clock), &job_marker(td.path(), &clock), bar, |_| Ok(()))
        .expect("second job after release");

    let marks = job_marker(td.path(), &clock).marks().unwrap();
    let apps: Vec<_> = marks.iter().map(|m| m.app_name()).collect();
    assert_eq!(apps, ["nri-foo", "nri-bar"]);
    assert!(marks.iter().all(|m| m.is_ended()));
}

#[test]
fn abandoned_lease_expires() {
    let td = tempfile::tempdir().expect("tempdir");
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
    let crashed = ReleaseInfo::new("nri-foo", "v1.0", "42");
    let next = ReleaseInfo::new("nri-bar", "v2.0", "43");

    job_lock(td.path(), &crashed, &clock).lock().expect("lock");
    let waiting = job_lock(td.path(), &next, &clock);
    assert!(matches!(waiting.lock(), Err(LockError::Busy)));

    clock.advance(Duration::from_secs(3600));
    waiting.lock().expect("expired lease is taken over");

    let lease = waiting.current_lease().unwrap().expect("lease");
    assert_eq!(lease, Lease::new("nri-bar_v2.0_43", clock.now()));
}

#[test]
fn crashed_release_blocks_closing_older_marks() {
    let td = tempfile::tempdir().expect("tempdir");
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
    let marker = job_marker(td.path(), &clock);

    let broken = marker.start(ReleaseInfo::new("nri-foo", "v1.0", "42")).unwrap();
    clock.advance(Duration::from_secs(1));
    let next = marker.start(ReleaseInfo::new("nri-bar", "v2.0", "43")).unwrap();

    assert!(matches!(
        marker.end(&broken),
        Err(MarkerError::NoStartedMarkerFoundForApp { .. })
    ));
    marker.end(&next).unwrap();

    let store = FileStorage::for_bucket(td.path().to_path_buf(), "downloads");
    let log: serde_json::Value =
        serde_json::from_slice(&store.get("infrastructure_agent/releases.json").unwrap()).unwrap();
    assert_eq!(log[0]["end"], "0001-01-01T00:00:00Z");
    assert_eq!(log[1]["start"], "2024-05-01T10:00:01Z");
    assert_eq!(log[1]["end"], "2024-05-01T10:00:01Z");
}

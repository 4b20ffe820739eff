//! # Publisher
//!
//! Coordination for CI jobs that publish packages into a shared
//! object-store repository (APT, YUM, Zypper trees in a bucket).
//!
//! Jobs share nothing but buckets, so this crate provides the pieces they
//! use to stay out of each other's way and leave an audit trail:
//!
//! - **Lease lock**: a best-effort mutual exclusion object with TTL,
//!   retry and owner identity ([`lock`]).
//! - **Release marker log**: an append-only JSON log of release windows,
//!   closed in strict LIFO order ([`release`]).
//! - **Replication gate + CDN purge**: wait until metadata has replicated,
//!   then invalidate the Fastly cache ([`cdn`]).
//!
//! ## Pipeline
//!
//! The core flow is **lock → mark start → mutate → mark end → release**,
//! followed after publishing by **wait for replication → purge**:
//!
//! 1. [`pipeline::run_release`] brackets the repository mutation.
//! 2. [`pipeline::purge_after_replication`] runs the advisory post-publish
//!    invalidation.
//!
//! ## Example
//!
//! ```
//! use publisher::lock::InMemoryLock;
//! use publisher::pipeline::run_release;
//! use publisher::release::ObjectMarker;
//! use publisher::storage::MemoryStorage;
//! use publisher::types::ReleaseInfo;
//!
//! let lock = InMemoryLock::new();
//! let marker = ObjectMarker::new(MemoryStorage::new("downloads"), "infrastructure_agent");
//!
//! let uploaded = run_release(&lock, &marker, ReleaseInfo::new("nri-foo", "v1.0", "42"), |_mark| {
//!     Ok(3)
//! })
//! .expect("release");
//!
//! assert_eq!(uploaded, 3);
//! assert!(marker.marks().unwrap()[0].is_ended());
//! ```
//!
//! ## Modules
//!
//! - [`types`]: release identity, clocks, resource tags
//! - [`storage`]: `ObjectStore` trait and backends
//! - [`lock`]: lease lock
//! - [`release`]: release marker log
//! - [`cdn`]: replication gate, key discovery, Fastly purge, surrogate keys
//! - [`config`]: `.publisher.toml` and environment loading
//! - [`pipeline`]: lock-bracketed release and post-publish purge

pub mod pipeline;

pub mod types {
    pub use publisher_types::*;
}

pub mod storage {
    pub use publisher_storage::*;
}

pub mod lock {
    pub use publisher_lock::*;
}

pub mod release {
    pub use publisher_release::*;
}

pub mod cdn {
    pub use publisher_cdn::*;
}

pub mod config {
    pub use publisher_config::*;
}

//! CDN invalidation for freshly published repositories.
//!
//! Repository metadata is written to a bucket that replicates asynchronously
//! to other regions. Purging the CDN before replication finishes would let
//! edges re-cache stale indexes, so the post-publish step first waits on the
//! [`ReplicationGate`] for every metadata key found by
//! [`discover_replication_keys`] and only then asks Fastly to purge.
//!
//! Nothing here needs the publish lease: it only reads already published
//! objects.

mod discover;
mod gate;
mod purge;
mod surrogate;

pub use discover::{RepositoryLayout, discover_replication_keys};
pub use gate::{
    DEFAULT_ATTEMPTS_PER_KEY, GateConfig, GateError, GateReport, KeyReport, ReplicationGate,
};
pub use purge::{
    FASTLY_API_URL, FastlyClient, PURGE_ALL_TAG, PurgeError, PurgeResponse, PurgeTarget, purge,
};
pub use surrogate::{DEFAULT_SURROGATE_KEY, SURROGATE_KEY_METADATA, tag_surrogate_keys};

//! Release marker log.
//!
//! Every publish run records when it started and when it finished in an
//! ordered JSON array stored at `<directory>/releases.json`. `start` appends
//! an open mark; `end` closes the last mark and nothing else, so releases
//! must close in the order they opened. A run that crashed before closing
//! stays visible as the open tail and blocks other closes until someone
//! repairs the log by hand.
//!
//! The log does no locking of its own. Callers hold the publish lease for
//! the whole read-modify-write.

use chrono::{DateTime, SubsecRound, Utc};
use publisher_storage::StorageError;
use publisher_types::ReleaseInfo;
use serde::{Deserialize, Serialize};

mod object;

pub use object::{MARKER_FILE, ObjectMarker};

/// Errors returned by [`Marker`] implementations.
#[derive(Debug, thiserror::Error)]
pub enum MarkerError {
    #[error("not started mark")]
    NotStartedMark,

    #[error("no started markers found")]
    NoStartedMarkersFound,

    #[error("no started marker found for app started:{} appName:{app_name}", timestamp::format(.start))]
    NoStartedMarkerFoundForApp {
        app_name: String,
        start: DateTime<Utc>,
    },

    #[error("last marker is already ended")]
    LastMarkerEnded,

    #[error("cannot write marker file: {0}")]
    CannotWriteMarkerFile(#[source] StorageError),

    #[error("cannot read marker file: {0}")]
    Storage(#[from] StorageError),

    #[error("cannot decode marker file: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("cannot encode marker file: {0}")]
    Encode(#[source] serde_json::Error),
}

/// One release window in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mark {
    #[serde(flatten)]
    pub release: ReleaseInfo,
    #[serde(with = "timestamp")]
    pub start: DateTime<Utc>,
    /// `None` while the release is still running.
    #[serde(with = "timestamp::optional")]
    pub end: Option<DateTime<Utc>>,
}

impl Mark {
    /// Open mark for `release` starting at `start`.
    pub fn open(release: ReleaseInfo, start: DateTime<Utc>) -> Self {
        Self {
            release,
            start,
            end: None,
        }
    }

    pub fn app_name(&self) -> &str {
        &self.release.app_name
    }

    pub fn is_started(&self) -> bool {
        self.start != timestamp::zero()
    }

    pub fn is_ended(&self) -> bool {
        self.end.is_some()
    }

    /// Whether `other` records the same release start. Timestamps are
    /// persisted with second precision, so sub-second parts are ignored.
    pub fn same_start(&self, other: &Mark) -> bool {
        self.start.trunc_subsecs(0) == other.start.trunc_subsecs(0)
    }
}

/// Persistence of release start and end.
pub trait Marker: Send + Sync {
    /// Append an open mark for `release` and return it. The returned mark is
    /// the handle `end` needs.
    fn start(&self, release: ReleaseInfo) -> Result<Mark, MarkerError>;

    /// Close `mark`, which must be the last entry in the log.
    fn end(&self, mark: &Mark) -> Result<(), MarkerError>;
}

impl<T: Marker + ?Sized> Marker for std::sync::Arc<T> {
    fn start(&self, release: ReleaseInfo) -> Result<Mark, MarkerError> {
        (**self).start(release)
    }

    fn end(&self, mark: &Mark) -> Result<(), MarkerError> {
        (**self).end(mark)
    }
}

/// Decode a marker log blob.
pub fn decode_log(bytes: &[u8]) -> Result<Vec<Mark>, MarkerError> {
    serde_json::from_slice(bytes).map_err(MarkerError::Decode)
}

/// Encode a marker log blob.
pub fn encode_log(marks: &[Mark]) -> Result<Vec<u8>, MarkerError> {
    serde_json::to_vec_pretty(marks).map_err(MarkerError::Encode)
}

/// RFC 3339 timestamps with second precision. The zero instant
/// `0001-01-01T00:00:00Z` stands for "unset".
pub mod timestamp {
    use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    /// The "unset" instant.
    pub fn zero() -> DateTime<Utc> {
        NaiveDate::from_ymd_opt(1, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn format(ts: &DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    pub fn parse(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(D::Error::custom)
    }

    pub mod optional {
        use chrono::{DateTime, Utc};
        use serde::{Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            ts: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            super::serialize(&ts.unwrap_or_else(super::zero), serializer)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            let ts = super::deserialize(deserializer)?;
            Ok((ts != super::zero()).then_some(ts))
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn info() -> ReleaseInfo {
        ReleaseInfo::new("nri-foo", "v1.0", "42")
    }

    #[test]
    fn open_mark_serializes_zero_end() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let json = serde_json::to_string(&Mark::open(info(), start)).unwrap();
        insta::assert_snapshot!(json, @r#"{"app_name":"nri-foo","tag":"v1.0","run_id":"42","repo_name":"","schema":"","schema_url":"","start":"2024-05-01T10:00:00Z","end":"0001-01-01T00:00:00Z"}"#);
    }

    #[test]
    fn zero_end_decodes_as_open() {
        let json = r#"{"app_name":"a","tag":"t","run_id":"1","repo_name":"","schema":"","schema_url":"","start":"2024-05-01T10:00:00Z","end":"0001-01-01T00:00:00Z"}"#;
        let mark: Mark = serde_json::from_str(json).unwrap();
        assert!(mark.is_started());
        assert!(!mark.is_ended());
    }

    #[test]
    fn offset_timestamps_are_normalized_to_utc() {
        let json = r#"{"app_name":"a","tag":"t","run_id":"1","repo_name":"","schema":"","schema_url":"","start":"2024-05-01T12:00:00+02:00","end":"2024-05-01T12:30:00+02:00"}"#;
        let mark: Mark = serde_json::from_str(json).unwrap();
        assert_eq!(mark.start, Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
        assert_eq!(mark.end, Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap()));
    }

    #[test]
    fn same_start_ignores_subseconds() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let a = Mark::open(info(), start + chrono::Duration::milliseconds(750));
        let b = Mark::open(info(), start);
        let c = Mark::open(info(), start + chrono::Duration::seconds(1));
        assert!(a.same_start(&b));
        assert!(!a.same_start(&c));
    }

    #[test]
    fn zero_start_is_not_started() {
        assert!(!Mark::open(info(), timestamp::zero()).is_started());
    }

    #[test]
    fn mismatch_error_names_app_and_start() {
        let err = MarkerError::NoStartedMarkerFoundForApp {
            app_name: "nri-foo".to_string(),
            start: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
        };
        assert_eq!(
            err.to_string(),
            "no started marker found for app started:2024-05-01T10:00:00Z appName:nri-foo"
        );
    }

    #[test]
    fn decode_rejects_non_array() {
        assert!(matches!(decode_log(b"{}"), Err(MarkerError::Decode(_))));
    }
}

//! Core domain types for the package publisher.
//!
//! This crate holds the small vocabulary shared by the lock, release-marker,
//! CDN and configuration crates: the identity of a release, how a lock owner
//! is derived from it, the clock every time-dependent component reads, and the
//! resource tags attached to objects the publisher creates.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use serde::{Deserialize, Serialize};

/// Immutable identity of a release.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseInfo {
    /// Application (package) being released, e.g. `nri-mysql`
    pub app_name: String,
    /// Release tag, e.g. `v1.2.0`
    pub tag: String,
    /// CI run identifier
    pub run_id: String,
    /// Source repository, e.g. `newrelic/nri-mysql`
    pub repo_name: String,
    /// Upload schema name
    pub schema: String,
    /// Upload schema location
    pub schema_url: String,
}

impl ReleaseInfo {
    /// Create a release identity with the three fields that make up the lock owner.
    pub fn new(app_name: impl Into<String>, tag: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            tag: tag.into(),
            run_id: run_id.into(),
            ..Default::default()
        }
    }

    pub fn with_repo_name(mut self, repo_name: impl Into<String>) -> Self {
        self.repo_name = repo_name.into();
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>, schema_url: impl Into<String>) -> Self {
        self.schema = schema.into();
        self.schema_url = schema_url.into();
        self
    }

    /// Opaque lock owner for this release: `<app_name>_<tag>_<run_id>`.
    pub fn lock_owner(&self) -> String {
        lock_owner(&self.app_name, &self.tag, &self.run_id)
    }
}

/// Derive the lock owner string from the run identity.
pub fn lock_owner(app_name: &str, tag: &str, run_id: &str) -> String {
    format!("{app_name}_{tag}_{run_id}")
}

/// Source of "now" for lease expiry and marker timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Shared handle to the system clock.
pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

/// Manually driven clock for tests and simulations.
///
/// Cloning shares the underlying instant, so a test can keep one handle and
/// hand another to the component under test.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Set the current instant.
    pub fn set(&self, instant: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now = instant;
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let step = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        *now = now.checked_add_signed(step).unwrap_or(DateTime::<Utc>::MAX_UTC);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// RFC 3986 unreserved characters pass through; everything else is escaped.
const TAG_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Default tag values attached to lock objects for cost attribution.
pub const DEFAULT_TAG_DEPARTMENT: &str = "product";
pub const DEFAULT_TAG_PRODUCT: &str = "integrations";
pub const DEFAULT_TAG_PROJECT: &str = "infrastructure-publish-action";
pub const DEFAULT_TAG_OWNING_TEAM: &str = "CAOS";
pub const DEFAULT_TAG_ENVIRONMENT: &str = "us-development";

/// Ordered set of object tags, rendered as a URL-encoded query string
/// (`key=value&key=value`), which is the form object stores accept on upload.
/// Keys and values are percent-encoded so `&`, `=` and spaces survive.
///
/// Tags are for ownership attribution only; nothing reads them back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceTags(Vec<(String, String)>);

impl ResourceTags {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Append a tag, replacing an existing one with the same key.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Render as `key=value&key=value`, percent-encoding both sides.
    pub fn to_query(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| {
                format!(
                    "{}={}",
                    utf8_percent_encode(k, TAG_ENCODE_SET),
                    utf8_percent_encode(v, TAG_ENCODE_SET)
                )
            })
            .collect::<Vec<_>>()
            .join("&")
    }
}

impl Default for ResourceTags {
    fn default() -> Self {
        Self::empty()
            .with("department", DEFAULT_TAG_DEPARTMENT)
            .with("product", DEFAULT_TAG_PRODUCT)
            .with("project", DEFAULT_TAG_PROJECT)
            .with("owning_team", DEFAULT_TAG_OWNING_TEAM)
            .with("environment", DEFAULT_TAG_ENVIRONMENT)
    }
}

impl fmt::Display for ResourceTags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_query())
    }
}

/// Error returned when a tag query string is malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid resource tag pair: {0:?} (expected key=value)")]
pub struct InvalidTags(pub String);

impl FromStr for ResourceTags {
    type Err = InvalidTags;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tags = ResourceTags::empty();
        for pair in s.split('&').filter(|p| !p.trim().is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| InvalidTags(pair.to_string()))?;
            let key = decode_tag_part(key.trim(), pair)?;
            if key.is_empty() {
                return Err(InvalidTags(pair.to_string()));
            }
            tags = tags.with(key, decode_tag_part(value.trim(), pair)?);
        }
        Ok(tags)
    }
}

fn decode_tag_part(part: &str, pair: &str) -> Result<String, InvalidTags> {
    percent_decode_str(part)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| InvalidTags(pair.to_string()))
}

impl TryFrom<String> for ResourceTags {
    type Error = InvalidTags;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceTags> for String {
    fn from(tags: ResourceTags) -> Self {
        tags.to_query()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn lock_owner_joins_identity_with_underscores() {
        let info = ReleaseInfo::new("nri-foo", "v1.0", "42");
        assert_eq!(info.lock_owner(), "nri-foo_v1.0_42");
    }

    #[test]
    fn release_info_serializes_with_snake_case_keys() {
        let info = ReleaseInfo::new("nri-foo", "v1.0", "42")
            .with_repo_name("newrelic/nri-foo")
            .with_schema("ohi", "https://example.com/schema.yml");
        let json = serde_json::to_string(&info).expect("serialize");
        assert_eq!(
            json,
            r#"{"app_name":"nri-foo","tag":"v1.0","run_id":"42","repo_name":"newrelic/nri-foo","schema":"ohi","schema_url":"https://example.com/schema.yml"}"#
        );
    }

    #[test]
    fn manual_clock_advances_shared_instant() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let handle = clock.clone();

        handle.advance(Duration::from_secs(90));

        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));
    }

    #[test]
    fn default_tags_render_in_declaration_order() {
        assert_eq!(
            ResourceTags::default().to_query(),
            "department=product&product=integrations&project=infrastructure-publish-action&owning_team=CAOS&environment=us-development"
        );
    }

    #[test]
    fn tags_parse_and_replace_duplicates() {
        let tags: ResourceTags = "team=a&env=dev&team=b".parse().expect("parse");
        assert_eq!(tags.get("team"), Some("b"));
        assert_eq!(tags.to_query(), "team=b&env=dev");
    }

    #[test]
    fn tags_reject_pairs_without_separator() {
        let err = "team=a&broken".parse::<ResourceTags>().unwrap_err();
        assert_eq!(err, InvalidTags("broken".to_string()));
    }

    #[test]
    fn tag_values_are_percent_encoded() {
        let tags = ResourceTags::empty()
            .with("owning team", "CAOS & friends")
            .with("note", "a=b/c%");
        assert_eq!(
            tags.to_query(),
            "owning%20team=CAOS%20%26%20friends&note=a%3Db%2Fc%25"
        );

        let reparsed: ResourceTags = tags.to_query().parse().expect("parse");
        assert_eq!(reparsed.get("owning team"), Some("CAOS & friends"));
        assert_eq!(reparsed.get("note"), Some("a=b/c%"));
    }

    #[test]
    fn tags_reject_invalid_utf8_escapes() {
        let err = "team=%FF".parse::<ResourceTags>().unwrap_err();
        assert_eq!(err, InvalidTags("team=%FF".to_string()));
    }

    #[test]
    fn empty_tag_string_is_empty_set() {
        let tags: ResourceTags = "".parse().expect("parse");
        assert!(tags.is_empty());
    }

    proptest! {
        #[test]
        fn tag_query_reparses_to_same_set(
            pairs in proptest::collection::vec(("[a-z_]{1,8}", "[a-zA-Z0-9 &=%+/-]{0,8}"), 0..6)
        ) {
            let tags = pairs
                .iter()
                .fold(ResourceTags::empty(), |acc, (k, v)| acc.with(k.clone(), v.clone()));
            let reparsed: ResourceTags = tags.to_query().parse().unwrap();
            prop_assert_eq!(reparsed, tags);
        }
    }
}

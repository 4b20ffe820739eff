//! Configuration for the package publisher.
//!
//! Values are resolved in three layers, later layers winning:
//!
//! 1. built-in defaults,
//! 2. a `.publisher.toml` file,
//! 3. environment variables, using the names the CI action exports
//!    (`APP_NAME`, `AWS_S3_LOCK_BUCKET_NAME`, `FASTLY_API_KEY`, ...).
//!
//! # Example
//!
//! ```
//! use publisher_config::Config;
//!
//! let config: Config = toml::from_str(r#"
//! [release]
//! app_name = "nri-foo"
//! tag = "v1.0"
//! run_id = "42"
//!
//! [lock]
//! retry_backoff = "5s"
//! "#).expect("parse");
//!
//! let lock = config.lock_config();
//! assert_eq!(lock.owner, "nri-foo_v1.0_42");
//! assert_eq!(lock.retry_backoff, std::time::Duration::from_secs(5));
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use publisher_cdn::{
    DEFAULT_ATTEMPTS_PER_KEY, FASTLY_API_URL, FastlyClient, GateConfig, PurgeTarget,
    RepositoryLayout,
};
use publisher_lock::{
    DEFAULT_LOCK_GROUP, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BACKOFF, DEFAULT_TTL, LockConfig,
    LockMode,
};
use publisher_storage::{CloudStorageConfig, StorageType};
use publisher_types::{ReleaseInfo, ResourceTags};
use serde::{Deserialize, Serialize};

/// Default configuration file name
pub const CONFIG_FILE: &str = ".publisher.toml";

/// Directory of the release marker log when none is configured.
pub const DEFAULT_MARKER_DIR: &str = "infrastructure_agent";

pub const DEFAULT_S3_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CDN_TIMEOUT: Duration = Duration::from_secs(30);

/// Environment variable names. Lookups try the upper-case name first and
/// then the lower-case one.
pub mod env {
    pub const APP_NAME: &str = "APP_NAME";
    pub const TAG: &str = "TAG";
    pub const RUN_ID: &str = "RUN_ID";
    pub const REPO_NAME: &str = "REPO_NAME";
    pub const SCHEMA: &str = "SCHEMA";
    pub const SCHEMA_URL: &str = "SCHEMA_URL";
    pub const RELEASE_MARKER_DIR: &str = "RELEASE_MARKER_DIR";

    pub const AWS_REGION: &str = "AWS_REGION";
    pub const AWS_ROLE_ARN: &str = "AWS_ROLE_ARN";
    pub const AWS_S3_LOCK_BUCKET_NAME: &str = "AWS_S3_LOCK_BUCKET_NAME";
    pub const AWS_S3_BUCKET_NAME: &str = "AWS_S3_BUCKET_NAME";
    pub const STORAGE_TYPE: &str = "STORAGE_TYPE";
    pub const STORAGE_BASE_PATH: &str = "STORAGE_BASE_PATH";
    pub const STORAGE_ENDPOINT: &str = "STORAGE_ENDPOINT";

    pub const AWS_TAGS: &str = "AWS_TAGS";
    pub const LOCK_GROUP: &str = "LOCK_GROUP";
    pub const LOCK_RETRIES: &str = "LOCK_RETRIES";
    pub const LOCK_RETRY_BACKOFF: &str = "LOCK_RETRY_BACKOFF";
    pub const LOCK_TTL: &str = "LOCK_TTL";
    pub const LOCK_MODE: &str = "LOCK_MODE";
    pub const LOCK_DEADLINE: &str = "LOCK_DEADLINE";
    pub const DISABLE_LOCK: &str = "DISABLE_LOCK";

    pub const FASTLY_API_URL: &str = "FASTLY_API_URL";
    pub const FASTLY_API_KEY: &str = "FASTLY_API_KEY";
    pub const FASTLY_SERVICE_ID: &str = "FASTLY_SERVICE_ID";
    pub const FASTLY_PURGE_TAG: &str = "FASTLY_PURGE_TAG";
    pub const FASTLY_AWS_BUCKET: &str = "FASTLY_AWS_BUCKET";
    pub const FASTLY_AWS_REGION: &str = "FASTLY_AWS_REGION";
    pub const FASTLY_AWS_ATTEMPTS: &str = "FASTLY_AWS_ATTEMPTS";
    pub const FASTLY_TIMEOUT_S3: &str = "FASTLY_TIMEOUT_S3";
    pub const FASTLY_TIMEOUT_CDN: &str = "FASTLY_TIMEOUT_CDN";
}

/// Get the config file path for a directory
pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

/// Complete publisher configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub release: ReleaseConfig,
    pub storage: StorageConfig,
    pub lock: LockSettings,
    pub fastly: FastlyConfig,
}

/// Identity of the release being published
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseConfig {
    pub app_name: String,
    pub tag: String,
    pub run_id: String,
    pub repo_name: String,
    pub schema: String,
    pub schema_url: String,
    /// Bucket directory holding `releases.json`
    pub marker_dir: String,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            app_name: String::new(),
            tag: String::new(),
            run_id: String::new(),
            repo_name: String::new(),
            schema: String::new(),
            schema_url: String::new(),
            marker_dir: DEFAULT_MARKER_DIR.to_string(),
        }
    }
}

/// Where the repository and lock buckets live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub storage_type: StorageType,
    /// Repository bucket; also holds the release marker log
    pub bucket: String,
    /// Bucket holding the lease objects
    pub lock_bucket: String,
    pub region: String,
    pub role_arn: String,
    /// Root directory for file storage
    pub base_path: String,
    /// Custom S3 endpoint
    pub endpoint: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::S3,
            bucket: String::new(),
            lock_bucket: String::new(),
            region: String::new(),
            role_arn: String::new(),
            base_path: String::new(),
            endpoint: String::new(),
        }
    }
}

/// Lease lock behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    /// Skip locking entirely
    pub disabled: bool,
    /// Lock key shared by jobs that must not overlap
    pub group: String,
    pub retries: u32,
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    pub mode: LockMode,
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub deadline: Option<Duration>,
    pub tags: ResourceTags,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            disabled: false,
            group: DEFAULT_LOCK_GROUP.to_string(),
            retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            ttl: DEFAULT_TTL,
            mode: LockMode::default(),
            deadline: None,
            tags: ResourceTags::default(),
        }
    }
}

/// Post-publish CDN purge
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FastlyConfig {
    pub api_url: String,
    pub api_key: String,
    pub service_id: String,
    /// Surrogate key to purge; empty or `purge_all` purges everything
    pub purge_tag: String,
    /// Bucket whose replication gates the purge; defaults to `storage.bucket`
    pub bucket: String,
    /// Region of `bucket`; defaults to `storage.region`
    pub region: String,
    pub attempts: u32,
    #[serde(with = "humantime_serde")]
    pub timeout_s3: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout_cdn: Duration,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    pub layout: RepositoryLayout,
}

impl Default for FastlyConfig {
    fn default() -> Self {
        Self {
            api_url: FASTLY_API_URL.to_string(),
            api_key: String::new(),
            service_id: String::new(),
            purge_tag: String::new(),
            bucket: String::new(),
            region: String::new(),
            attempts: DEFAULT_ATTEMPTS_PER_KEY,
            timeout_s3: DEFAULT_S3_TIMEOUT,
            timeout_cdn: DEFAULT_CDN_TIMEOUT,
            poll_interval: Duration::ZERO,
            layout: RepositoryLayout::default(),
        }
    }
}

impl fmt::Debug for FastlyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FastlyConfig")
            .field("api_url", &self.api_url)
            .field("api_key", &mask_secret(&self.api_key))
            .field("service_id", &self.service_id)
            .field("purge_tag", &self.purge_tag)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("attempts", &self.attempts)
            .field("timeout_s3", &self.timeout_s3)
            .field("timeout_cdn", &self.timeout_cdn)
            .field("poll_interval", &self.poll_interval)
            .field("layout", &self.layout)
            .finish()
    }
}

/// Mask a secret for display, keeping the first and last four characters of
/// long values.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}{}{tail}", "*".repeat(chars.len() - 8))
}

impl Config {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, then `<dir>/.publisher.toml`, then the process environment.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut config = load_config(dir)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    /// Override fields from `lookup`, which maps a variable name to its
    /// value. Unset variables leave the field alone.
    pub fn apply_vars<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        vars.string(env::APP_NAME, &mut self.release.app_name);
        vars.string(env::TAG, &mut self.release.tag);
        vars.string(env::RUN_ID, &mut self.release.run_id);
        vars.string(env::REPO_NAME, &mut self.release.repo_name);
        vars.string(env::SCHEMA, &mut self.release.schema);
        vars.string(env::SCHEMA_URL, &mut self.release.schema_url);
        vars.string(env::RELEASE_MARKER_DIR, &mut self.release.marker_dir);

        vars.parsed(env::STORAGE_TYPE, &mut self.storage.storage_type)?;
        vars.string(env::AWS_S3_BUCKET_NAME, &mut self.storage.bucket);
        vars.string(env::AWS_S3_LOCK_BUCKET_NAME, &mut self.storage.lock_bucket);
        vars.string(env::AWS_REGION, &mut self.storage.region);
        vars.string(env::AWS_ROLE_ARN, &mut self.storage.role_arn);
        vars.string(env::STORAGE_BASE_PATH, &mut self.storage.base_path);
        vars.string(env::STORAGE_ENDPOINT, &mut self.storage.endpoint);

        vars.flag(env::DISABLE_LOCK, &mut self.lock.disabled)?;
        vars.string(env::LOCK_GROUP, &mut self.lock.group);
        vars.parsed(env::LOCK_RETRIES, &mut self.lock.retries)?;
        vars.duration(env::LOCK_RETRY_BACKOFF, &mut self.lock.retry_backoff)?;
        vars.duration(env::LOCK_TTL, &mut self.lock.ttl)?;
        vars.parsed(env::LOCK_MODE, &mut self.lock.mode)?;
        // A blank deadline clears one set in the config file.
        if let Some(value) = vars.raw(env::LOCK_DEADLINE) {
            self.lock.deadline = if value.is_empty() {
                None
            } else {
                Some(parse_duration(env::LOCK_DEADLINE, &value)?)
            };
        }
        vars.parsed(env::AWS_TAGS, &mut self.lock.tags)?;

        vars.string(env::FASTLY_API_URL, &mut self.fastly.api_url);
        vars.string(env::FASTLY_API_KEY, &mut self.fastly.api_key);
        vars.string(env::FASTLY_SERVICE_ID, &mut self.fastly.service_id);
        vars.string(env::FASTLY_PURGE_TAG, &mut self.fastly.purge_tag);
        vars.string(env::FASTLY_AWS_BUCKET, &mut self.fastly.bucket);
        vars.string(env::FASTLY_AWS_REGION, &mut self.fastly.region);
        vars.parsed(env::FASTLY_AWS_ATTEMPTS, &mut self.fastly.attempts)?;
        vars.duration(env::FASTLY_TIMEOUT_S3, &mut self.fastly.timeout_s3)?;
        vars.duration(env::FASTLY_TIMEOUT_CDN, &mut self.fastly.timeout_cdn)?;

        Ok(())
    }

    /// Check everything a locked release run needs, reporting every problem
    /// at once.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.lock.group.trim().is_empty() {
            problems.push("lock group must not be empty".to_string());
        }
        if !self.lock.disabled {
            if self.release.run_id.is_empty() {
                problems.push(format!("missing '{}' value", env::RUN_ID.to_lowercase()));
            }
            if self.storage.lock_bucket.is_empty() {
                problems.push(format!(
                    "missing '{}' value",
                    env::AWS_S3_LOCK_BUCKET_NAME.to_lowercase()
                ));
            }
            self.storage_problems(&mut problems);
        }

        report(problems)
    }

    /// Check everything the post-publish purge needs.
    pub fn validate_purge(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.fastly.api_key.is_empty() {
            problems.push(format!("missing '{}' value", env::FASTLY_API_KEY.to_lowercase()));
        }
        if self.fastly.service_id.is_empty() {
            problems.push(format!(
                "missing '{}' value",
                env::FASTLY_SERVICE_ID.to_lowercase()
            ));
        }
        if self.fastly_storage().bucket.is_empty() {
            problems.push(format!(
                "missing '{}' value",
                env::FASTLY_AWS_BUCKET.to_lowercase()
            ));
        }
        self.storage_problems(&mut problems);

        report(problems)
    }

    fn storage_problems(&self, problems: &mut Vec<String>) {
        match self.storage.storage_type {
            StorageType::S3 => {
                if self.storage.region.is_empty() {
                    problems.push(format!("missing '{}' value", env::AWS_REGION.to_lowercase()));
                }
                // Custom endpoints (MinIO, LocalStack) run with static credentials.
                if self.storage.role_arn.is_empty() && self.storage.endpoint.is_empty() {
                    problems.push(format!(
                        "missing '{}' value",
                        env::AWS_ROLE_ARN.to_lowercase()
                    ));
                }
            }
            StorageType::File => {
                if self.storage.base_path.is_empty() {
                    problems.push(format!(
                        "missing '{}' value for file storage",
                        env::STORAGE_BASE_PATH.to_lowercase()
                    ));
                }
            }
            StorageType::Memory => {}
        }
    }

    /// Identity of this run.
    pub fn release_info(&self) -> ReleaseInfo {
        let r = &self.release;
        ReleaseInfo::new(&r.app_name, &r.tag, &r.run_id)
            .with_repo_name(&r.repo_name)
            .with_schema(&r.schema, &r.schema_url)
    }

    /// Lease settings, owned by this run.
    pub fn lock_config(&self) -> LockConfig {
        let mut config = LockConfig::new(&self.lock.group, self.release_info().lock_owner())
            .with_retries(self.lock.retries, self.lock.retry_backoff)
            .with_ttl(self.lock.ttl)
            .with_mode(self.lock.mode)
            .with_tags(self.lock.tags.clone());
        if let Some(deadline) = self.lock.deadline {
            config = config.with_deadline(deadline);
        }
        config
    }

    /// Backend for the lock bucket.
    pub fn lock_storage(&self) -> CloudStorageConfig {
        self.storage_for(&self.storage.lock_bucket, &self.storage.region)
    }

    /// Backend for the repository bucket, which also holds the marker log.
    pub fn release_storage(&self) -> CloudStorageConfig {
        self.storage_for(&self.storage.bucket, &self.storage.region)
    }

    /// Backend for the bucket whose replication gates the purge.
    pub fn fastly_storage(&self) -> CloudStorageConfig {
        let bucket = non_empty(&self.fastly.bucket).unwrap_or(&self.storage.bucket);
        let region = non_empty(&self.fastly.region).unwrap_or(&self.storage.region);
        self.storage_for(bucket, region)
    }

    pub fn gate_config(&self) -> GateConfig {
        GateConfig::new(self.fastly.attempts)
            .with_attempt_timeout(self.fastly.timeout_s3)
            .with_poll_interval(self.fastly.poll_interval)
    }

    pub fn purge_target(&self) -> PurgeTarget {
        PurgeTarget::from_tag(&self.fastly.purge_tag)
    }

    /// Fastly client bounded by the CDN timeout.
    pub fn fastly_client(&self) -> Result<FastlyClient> {
        let client = FastlyClient::new(
            &self.fastly.api_key,
            &self.fastly.service_id,
            Some(self.fastly.timeout_cdn),
        )
        .context("cannot build Fastly client")?;
        Ok(client.with_base_url(&self.fastly.api_url))
    }

    fn storage_for(&self, bucket: &str, region: &str) -> CloudStorageConfig {
        let s = &self.storage;
        CloudStorageConfig {
            storage_type: s.storage_type,
            bucket: bucket.to_string(),
            region: non_empty(region).map(str::to_string),
            role_arn: non_empty(&s.role_arn).map(str::to_string),
            base_path: s.base_path.clone(),
            endpoint: non_empty(&s.endpoint).map(str::to_string),
        }
    }
}

struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    /// Value of `name`, with blank values treated as unset. CI runners
    /// export every undeclared input as an empty string.
    fn get(&self, name: &str) -> Option<String> {
        self.raw(name).filter(|v| !v.is_empty())
    }

    /// Value of `name`, keeping blank values.
    fn raw(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .or_else(|| (self.0)(&name.to_lowercase()))
            .map(|v| v.trim().to_string())
    }

    fn string(&self, name: &str, field: &mut String) {
        if let Some(value) = self.get(name) {
            *field = value;
        }
    }

    fn parsed<T>(&self, name: &str, field: &mut T) -> Result<()>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        if let Some(value) = self.get(name) {
            *field = value
                .parse()
                .with_context(|| format!("invalid {name} value: {value:?}"))?;
        }
        Ok(())
    }

    fn duration(&self, name: &str, field: &mut Duration) -> Result<()> {
        if let Some(value) = self.get(name) {
            *field = parse_duration(name, &value)?;
        }
        Ok(())
    }

    fn flag(&self, name: &str, field: &mut bool) -> Result<()> {
        if let Some(value) = self.get(name) {
            *field = match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "" | "0" | "false" | "no" | "off" => false,
                _ => bail!("invalid {name} value: {value:?} (expected true or false)"),
            };
        }
        Ok(())
    }
}

fn parse_duration(name: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .with_context(|| format!("invalid {name} value: {value:?} (expected e.g. 20s, 1h)"))
}

fn non_empty(s: &str) -> Option<&str> {
    (!s.is_empty()).then_some(s)
}

fn report(problems: Vec<String>) -> Result<()> {
    if problems.is_empty() {
        return Ok(());
    }
    bail!("invalid configuration:\n  - {}", problems.join("\n  - "))
}

/// Load configuration from a directory
pub fn load_config(dir: &Path) -> Result<Config> {
    load_config_from_file(&config_path(dir))
}

/// Load configuration from a specific file path. A missing file yields the
/// defaults.
pub fn load_config_from_file(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;

    Ok(config)
}

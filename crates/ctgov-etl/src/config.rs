//! Configuration management
//!
//! One [`Config`] value is resolved at startup and handed to each component
//! constructor. Resolution order, later wins:
//!
//! 1. compiled defaults
//! 2. a TOML file (`--config` or `CTGOV_CONFIG`)
//! 3. `CTGOV_*` environment variables, `__` separating section and key,
//!    e.g. `CTGOV_STORAGE__BUCKET=my-bucket`

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use crate::batching::BatchPolicy;
use crate::error::{PipelineError, Result};
use crate::format::FileFormat;
use crate::writer::KeyStrategy;

pub use crate::storage::config::StorageConfig;

// ============================================================================
// Defaults
// ============================================================================

/// Registry API v2 root.
pub const DEFAULT_SOURCE_BASE_URL: &str = "https://clinicaltrials.gov/api/v2";

/// Default page size; the registry caps pages at [`MAX_PAGE_SIZE`].
pub const DEFAULT_PAGE_SIZE: u32 = 500;

pub const MAX_PAGE_SIZE: u32 = 1000;

pub const DEFAULT_BATCH_MAX_RECORDS: usize = 1000;

/// Upper bound for `source.lookback_days`, roughly a century.
pub const MAX_LOOKBACK_DAYS: u32 = 36_500;

/// Rows per INSERT that keep 19 bound columns under Postgres's 65535
/// parameter limit.
pub const MAX_INSERT_CHUNK_SIZE: usize = 3449;

/// 16 MiB serialized accumulator bound for the byte-size policy.
pub const DEFAULT_BATCH_MAX_BYTES: usize = 16 * 1024 * 1024;

pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/clinical_trials";

pub const DEFAULT_STAGING_TABLE: &str = "staging_clinical_trials";

#[allow(clippy::expect_used)]
static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}(\.[A-Za-z_][A-Za-z0-9_]{0,62})?$")
        .expect("identifier pattern is valid")
});

/// True for `table` or `schema.table` made of plain SQL identifier characters.
///
/// Table names are interpolated into statements, so anything else is refused.
pub fn is_safe_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub storage: StorageConfig,
    pub batching: BatchingConfig,
    pub warehouse: WarehouseConfig,
    pub transform: TransformConfig,
    pub quality: QualityConfig,
    pub notify: NotifyConfig,
}

/// Registry API settings
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Opaque `query.term` expression passed through to the API
    pub query_term: Option<String>,
    /// Restrict to studies updated in the last N days
    pub lookback_days: Option<u32>,
    pub page_size: u32,
    /// Stop after this many records even if more pages remain
    pub max_records: Option<usize>,
    /// Pause between page requests
    pub request_interval_ms: u64,
    pub timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_SOURCE_BASE_URL.to_string(),
            api_key: None,
            query_term: None,
            lookback_days: Some(7),
            page_size: DEFAULT_PAGE_SIZE,
            max_records: None,
            request_interval_ms: 100,
            timeout_secs: 30,
        }
    }
}

impl std::fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("query_term", &self.query_term)
            .field("lookback_days", &self.lookback_days)
            .field("page_size", &self.page_size)
            .field("max_records", &self.max_records)
            .field("request_interval_ms", &self.request_interval_ms)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchPolicyKind {
    #[default]
    RecordCount,
    ByteSize,
}

/// Micro-batch partitioning and object encoding
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    pub policy: BatchPolicyKind,
    pub max_records: usize,
    pub max_bytes: usize,
    pub format: FileFormat,
    pub key_strategy: KeyStrategy,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            policy: BatchPolicyKind::RecordCount,
            max_records: DEFAULT_BATCH_MAX_RECORDS,
            max_bytes: DEFAULT_BATCH_MAX_BYTES,
            format: FileFormat::Parquet,
            key_strategy: KeyStrategy::Timestamped,
        }
    }
}

impl BatchingConfig {
    pub fn policy(&self) -> BatchPolicy {
        match self.policy {
            BatchPolicyKind::RecordCount => BatchPolicy::RecordCount(self.max_records),
            BatchPolicyKind::ByteSize => BatchPolicy::ByteSize(self.max_bytes),
        }
    }
}

/// Warehouse connection and staging settings
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
    pub staging_table: String,
    /// Rows per multi-row INSERT statement
    pub insert_chunk_size: usize,
    /// How long the load step waits for a manifest to appear
    pub manifest_wait_secs: u64,
    pub manifest_poll_secs: u64,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: 4,
            connect_timeout_secs: 10,
            staging_table: DEFAULT_STAGING_TABLE.to_string(),
            insert_chunk_size: 500,
            manifest_wait_secs: 300,
            manifest_poll_secs: 30,
        }
    }
}

impl WarehouseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl std::fmt::Debug for WarehouseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarehouseConfig")
            .field("url", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("staging_table", &self.staging_table)
            .field("insert_chunk_size", &self.insert_chunk_size)
            .field("manifest_wait_secs", &self.manifest_wait_secs)
            .field("manifest_poll_secs", &self.manifest_poll_secs)
            .finish()
    }
}

/// dbt transform step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    pub enabled: bool,
    pub dbt_executable: String,
    pub project_dir: PathBuf,
    pub profiles_dir: Option<PathBuf>,
    /// Model selectors run in order, e.g. staging before marts
    pub selectors: Vec<String>,
    pub run_tests: bool,
    pub generate_docs: bool,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dbt_executable: "dbt".to_string(),
            project_dir: PathBuf::from("./dbt"),
            profiles_dir: None,
            selectors: vec!["staging".to_string(), "marts".to_string()],
            run_tests: true,
            generate_docs: true,
        }
    }
}

/// Standalone data-quality checks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Tables that must be non-empty
    pub tables: Vec<String>,
    pub freshness_max_days: i64,
    /// Minimum share of non-null values for key columns
    pub completeness_threshold: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            tables: vec![DEFAULT_STAGING_TABLE.to_string()],
            freshness_max_days: 7,
            completeness_threshold: 0.95,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: 10,
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

impl Config {
    /// Resolve configuration from defaults, an optional TOML file and the
    /// environment, then validate it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("CTGOV_CONFIG").ok().map(PathBuf::from));

        let config = Self::figment(path.as_deref())?.extract::<Config>()?;
        config.validate()?;
        Ok(config)
    }

    fn figment(path: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        if let Some(path) = path {
            if !path.is_file() {
                return Err(PipelineError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }

        Ok(figment.merge(Env::prefixed("CTGOV_").split("__")))
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(PipelineError::Config(msg));

        if self.source.base_url.trim().is_empty() {
            return fail("source.base_url cannot be empty".to_string());
        }
        if !(1..=MAX_PAGE_SIZE).contains(&self.source.page_size) {
            return fail(format!(
                "source.page_size must be between 1 and {} (got {})",
                MAX_PAGE_SIZE, self.source.page_size
            ));
        }
        if let Some(days) = self.source.lookback_days {
            if days > MAX_LOOKBACK_DAYS {
                return fail(format!(
                    "source.lookback_days must be at most {} (got {})",
                    MAX_LOOKBACK_DAYS, days
                ));
            }
        }
        if self.source.max_records == Some(0) {
            return fail("source.max_records must be greater than 0 when set".to_string());
        }
        if self.storage.bucket.trim().is_empty() {
            return fail("storage.bucket cannot be empty".to_string());
        }
        if !is_safe_identifier(&self.storage.dataset) {
            return fail(format!(
                "storage.dataset '{}' must be a plain identifier",
                self.storage.dataset
            ));
        }
        if self.batching.max_records == 0 {
            return fail("batching.max_records must be greater than 0".to_string());
        }
        if self.batching.max_bytes == 0 {
            return fail("batching.max_bytes must be greater than 0".to_string());
        }
        if self.warehouse.url.trim().is_empty() {
            return fail("warehouse.url cannot be empty".to_string());
        }
        if self.warehouse.max_connections == 0 {
            return fail("warehouse.max_connections must be greater than 0".to_string());
        }
        if !(1..=MAX_INSERT_CHUNK_SIZE).contains(&self.warehouse.insert_chunk_size) {
            return fail(format!(
                "warehouse.insert_chunk_size must be between 1 and {} (got {})",
                MAX_INSERT_CHUNK_SIZE, self.warehouse.insert_chunk_size
            ));
        }
        for table in std::iter::once(&self.warehouse.staging_table).chain(&self.quality.tables) {
            if !is_safe_identifier(table) {
                return fail(format!("'{}' is not a valid table identifier", table));
            }
        }
        if !(0.0..=1.0).contains(&self.quality.completeness_threshold) {
            return fail("quality.completeness_threshold must be within 0..=1".to_string());
        }
        if self.transform.enabled && self.transform.selectors.is_empty() {
            tracing::warn!("transform.selectors is empty - dbt will run every model");
        }

        Ok(())
    }
}

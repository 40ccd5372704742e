//! Warehouse staging
//!
//! Staged objects are decoded back into [`StudyRecord`]s and coerced into
//! typed [`StagingRow`]s before insert. Coercion is continue-on-error: a
//! record that cannot be stored is rejected and counted, an unparsable date
//! becomes null.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{BatchId, StudyRecord};

pub mod loader;
pub mod memory;
pub mod postgres;

pub use loader::WarehouseLoader;
pub use memory::InMemoryWarehouse;
pub use postgres::PgWarehouse;

/// Maximum length (in characters) of each bounded text column
pub const VARCHAR_LIMITS: [(&str, usize); 13] = [
    ("nct_id", 50),
    ("brief_title", 1000),
    ("official_title", 2000),
    ("overall_status", 100),
    ("study_type", 100),
    ("phase", 100),
    ("condition", 2000),
    ("intervention_name", 2000),
    ("primary_outcome_measure", 5000),
    ("location_city", 200),
    ("location_state", 100),
    ("location_country", 100),
    ("sponsor_name", 500),
];

pub const DATA_SOURCE_LIMIT: usize = 100;

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%m/%d/%Y", "%B %d, %Y"];

/// Parse the date spellings the registry uses. Month precision dates
/// (`2025-12`, `December 2025`) resolve to the first of the month.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
        .or_else(|| NaiveDate::parse_from_str(&format!("{}-01", value), "%Y-%m-%d").ok())
        .or_else(|| NaiveDate::parse_from_str(&format!("1 {}", value), "%d %B %Y").ok())
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|dt| dt.and_utc())
        })
}

/// One typed row of the staging table
#[derive(Debug, Clone, PartialEq)]
pub struct StagingRow {
    pub nct_id: Option<String>,
    pub brief_title: Option<String>,
    pub official_title: Option<String>,
    pub overall_status: Option<String>,
    pub study_type: Option<String>,
    pub phase: Option<String>,
    pub condition: Option<String>,
    pub intervention_name: Option<String>,
    pub primary_outcome_measure: Option<String>,
    pub study_first_submit_date: Option<NaiveDate>,
    pub last_update_submit_date: Option<NaiveDate>,
    pub completion_date: Option<NaiveDate>,
    pub location_city: Option<String>,
    pub location_state: Option<String>,
    pub location_country: Option<String>,
    pub sponsor_name: Option<String>,
    pub extraction_timestamp: Option<DateTime<Utc>>,
    pub data_source: Option<String>,
    pub batch_id: String,
}

impl StagingRow {
    /// Coerce a record into staging types. `Err` carries the reason the
    /// record cannot be stored.
    pub fn coerce(record: &StudyRecord, batch_id: &BatchId) -> std::result::Result<Self, String> {
        if record.nct_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            return Err("nct_id is blank".to_string());
        }
        for (column, limit) in VARCHAR_LIMITS
            .iter()
            .copied()
            .chain(std::iter::once(("data_source", DATA_SOURCE_LIMIT)))
        {
            if let Some(value) = record.get(column) {
                let length = value.chars().count();
                if length > limit {
                    return Err(format!(
                        "{} is {} characters, limit is {}",
                        column, length, limit
                    ));
                }
            }
        }

        let date = |v: &Option<String>| v.as_deref().and_then(parse_date);

        Ok(StagingRow {
            nct_id: record.nct_id.clone(),
            brief_title: record.brief_title.clone(),
            official_title: record.official_title.clone(),
            overall_status: record.overall_status.clone(),
            study_type: record.study_type.clone(),
            phase: record.phase.clone(),
            condition: record.condition.clone(),
            intervention_name: record.intervention_name.clone(),
            primary_outcome_measure: record.primary_outcome_measure.clone(),
            study_first_submit_date: date(&record.study_first_submit_date),
            last_update_submit_date: date(&record.last_update_submit_date),
            completion_date: date(&record.completion_date),
            location_city: record.location_city.clone(),
            location_state: record.location_state.clone(),
            location_country: record.location_country.clone(),
            sponsor_name: record.sponsor_name.clone(),
            extraction_timestamp: record
                .extraction_timestamp
                .as_deref()
                .and_then(parse_timestamp),
            data_source: record.data_source.clone(),
            batch_id: batch_id.to_string(),
        })
    }
}

/// A record skipped during load
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRejection {
    pub file: String,
    /// 0-based position of the record within its file
    pub row: usize,
    pub nct_id: Option<String>,
    pub reason: String,
}

/// A staged file that could not be read back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedFile {
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    /// Every staged file was read. Individual rows may still be rejected.
    Success,
    /// Some staged files were skipped
    Partial,
    /// Files were staged but none could be read
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadResult {
    pub status: LoadStatus,
    pub batch_id: BatchId,
    pub table: String,
    pub files_loaded: usize,
    pub records_staged: usize,
    pub rows_loaded: u64,
    pub rejections: Vec<RowRejection>,
    pub skipped_files: Vec<SkippedFile>,
}

impl LoadResult {
    pub fn rows_rejected(&self) -> usize {
        self.rejections.len()
    }
}

/// Destination of staged rows
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Create the staging table if it does not exist
    async fn ensure_staging_table(&self, table: &str) -> Result<()>;

    /// Start replacing every row of `batch_id` in `table`. The earlier rows
    /// are removed and nothing inserted becomes visible until
    /// [`BatchLoad::commit`]; dropping the load discards it.
    async fn begin_batch_load(&self, table: &str, batch_id: &BatchId) -> Result<Box<dyn BatchLoad>>;

    /// Replace every row of `batch_id` in `table` with `rows`, atomically.
    /// Returns the number of rows inserted.
    async fn replace_batch_rows(
        &self,
        table: &str,
        batch_id: &BatchId,
        rows: &[StagingRow],
    ) -> Result<u64> {
        let mut load = self.begin_batch_load(table, batch_id).await?;
        load.insert(rows).await?;
        load.commit().await
    }
}

/// An open, uncommitted batch replacement
#[async_trait]
pub trait BatchLoad: Send {
    /// Append rows; returns how many were inserted by this call
    async fn insert(&mut self, rows: &[StagingRow]) -> Result<u64>;

    /// Make the replacement visible. Returns the total rows inserted.
    async fn commit(self: Box<Self>) -> Result<u64>;
}

//! Core data types shared by every pipeline stage

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{PipelineError, Result};

/// Value written to `data_source` for records pulled from the registry API
pub const DATA_SOURCE_API: &str = "clinical_trials_api";

/// `strftime` pattern for batch ids and key timestamps
pub const BATCH_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// One clinical-trial study, flattened to named string fields.
///
/// Dates are kept exactly as the registry returned them. Typing (and
/// coercion of unparsable dates to null) happens at warehouse load time.
/// Duplicate `nct_id`s across pages are kept; dedup belongs to the
/// transform layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyRecord {
    pub nct_id: Option<String>,
    pub brief_title: Option<String>,
    pub official_title: Option<String>,
    pub overall_status: Option<String>,
    pub study_type: Option<String>,
    pub phase: Option<String>,
    pub condition: Option<String>,
    pub intervention_name: Option<String>,
    pub primary_outcome_measure: Option<String>,
    pub study_first_submit_date: Option<String>,
    pub last_update_submit_date: Option<String>,
    pub completion_date: Option<String>,
    pub location_city: Option<String>,
    pub location_state: Option<String>,
    pub location_country: Option<String>,
    pub sponsor_name: Option<String>,
    pub extraction_timestamp: Option<String>,
    pub data_source: Option<String>,
}

impl StudyRecord {
    /// Column names in storage order. Matches the serde field names.
    pub const COLUMNS: [&'static str; 18] = [
        "nct_id",
        "brief_title",
        "official_title",
        "overall_status",
        "study_type",
        "phase",
        "condition",
        "intervention_name",
        "primary_outcome_measure",
        "study_first_submit_date",
        "last_update_submit_date",
        "completion_date",
        "location_city",
        "location_state",
        "location_country",
        "sponsor_name",
        "extraction_timestamp",
        "data_source",
    ];

    fn slot(&self, column: &str) -> Option<&Option<String>> {
        Some(match column {
            "nct_id" => &self.nct_id,
            "brief_title" => &self.brief_title,
            "official_title" => &self.official_title,
            "overall_status" => &self.overall_status,
            "study_type" => &self.study_type,
            "phase" => &self.phase,
            "condition" => &self.condition,
            "intervention_name" => &self.intervention_name,
            "primary_outcome_measure" => &self.primary_outcome_measure,
            "study_first_submit_date" => &self.study_first_submit_date,
            "last_update_submit_date" => &self.last_update_submit_date,
            "completion_date" => &self.completion_date,
            "location_city" => &self.location_city,
            "location_state" => &self.location_state,
            "location_country" => &self.location_country,
            "sponsor_name" => &self.sponsor_name,
            "extraction_timestamp" => &self.extraction_timestamp,
            "data_source" => &self.data_source,
            _ => return None,
        })
    }

    fn slot_mut(&mut self, column: &str) -> Option<&mut Option<String>> {
        Some(match column {
            "nct_id" => &mut self.nct_id,
            "brief_title" => &mut self.brief_title,
            "official_title" => &mut self.official_title,
            "overall_status" => &mut self.overall_status,
            "study_type" => &mut self.study_type,
            "phase" => &mut self.phase,
            "condition" => &mut self.condition,
            "intervention_name" => &mut self.intervention_name,
            "primary_outcome_measure" => &mut self.primary_outcome_measure,
            "study_first_submit_date" => &mut self.study_first_submit_date,
            "last_update_submit_date" => &mut self.last_update_submit_date,
            "completion_date" => &mut self.completion_date,
            "location_city" => &mut self.location_city,
            "location_state" => &mut self.location_state,
            "location_country" => &mut self.location_country,
            "sponsor_name" => &mut self.sponsor_name,
            "extraction_timestamp" => &mut self.extraction_timestamp,
            "data_source" => &mut self.data_source,
            _ => return None,
        })
    }

    /// Value of a column by name; `None` for unknown columns and nulls
    pub fn get(&self, column: &str) -> Option<&str> {
        self.slot(column).and_then(|v| v.as_deref())
    }

    /// Set a column by name. Returns false for unknown columns.
    pub fn set(&mut self, column: &str, value: Option<String>) -> bool {
        match self.slot_mut(column) {
            Some(slot) => {
                *slot = value;
                true
            },
            None => false,
        }
    }
}

/// Identifier for one pipeline run.
///
/// Derived from the triggering window's timestamp (`YYYYMMDD_HHMMSS`) or
/// supplied by the caller. It is embedded in object keys and used as the
/// warehouse filter, so it is restricted to `[A-Za-z0-9_-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BatchId(String);

impl BatchId {
    pub fn parse(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let valid = !value.is_empty()
            && value.len() <= 64
            && value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if valid {
            Ok(Self(value))
        } else {
            Err(PipelineError::InvalidBatchId(value))
        }
    }

    pub fn from_timestamp(at: DateTime<Utc>) -> Self {
        Self(at.format(BATCH_TIMESTAMP_FORMAT).to_string())
    }

    pub fn now() -> Self {
        Self::from_timestamp(Utc::now())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for BatchId {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<BatchId> for String {
    fn from(id: BatchId) -> Self {
        id.0
    }
}

/// A micro-batch: an ordered, immutable slice of one run's records.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub batch_id: BatchId,
    /// 1-based, strictly increasing within a batch id
    pub sequence: u32,
    pub records: Vec<StudyRecord>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Zero-padded sequence used in object keys, e.g. `0003`
    pub fn sequence_label(&self) -> String {
        format!("{:04}", self.sequence)
    }
}

/// Reference to a durably written batch. The store owns the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub key: String,
    pub sequence: u32,
    pub record_count: usize,
    pub size_bytes: u64,
    pub checksum: String,
    pub encrypted: bool,
}

/// Completion marker for a run; written once, after every object write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub batch_id: BatchId,
    pub upload_timestamp: DateTime<Utc>,
    pub total_records: u64,
    /// Object keys in sequence order
    pub files: Vec<String>,
    pub file_count: usize,
}

impl Manifest {
    pub fn new(batch_id: BatchId, files: Vec<String>, total_records: u64) -> Self {
        Self {
            batch_id,
            upload_timestamp: Utc::now(),
            total_records,
            file_count: files.len(),
            files,
        }
    }
}

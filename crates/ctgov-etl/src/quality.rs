//! Data-quality checks against loaded tables
//!
//! Three families of checks, each yielding a [`CheckStatus`]:
//!
//! - record counts: every configured table must be non-empty
//! - freshness: the newest `extraction_timestamp` in the staging table is
//!   at most `freshness_max_days` old
//! - completeness: share of non-null `nct_id`, `brief_title` and
//!   `overall_status` is at least the configured threshold
//!
//! Query failures become [`CheckStatus::Error`] for that check only.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::QualityConfig;
use crate::error::Result;

/// Aggregate queries the checks need
#[async_trait]
pub trait QualityQueries: Send + Sync {
    async fn row_count(&self, table: &str) -> Result<i64>;

    async fn latest_extraction(&self, table: &str) -> Result<Option<DateTime<Utc>>>;

    async fn non_null_count(&self, table: &str, column: &str) -> Result<i64>;
}

/// Ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Fail,
    Error,
}

impl CheckStatus {
    /// Process exit code of the quality-check entry point
    pub fn exit_code(&self) -> i32 {
        match self {
            CheckStatus::Pass => 0,
            CheckStatus::Error => 1,
            CheckStatus::Fail => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

impl CheckResult {
    fn new(name: impl Into<String>, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub checked_at: DateTime<Utc>,
    pub status: CheckStatus,
    pub checks: Vec<CheckResult>,
}

impl QualityReport {
    fn from_checks(checked_at: DateTime<Utc>, checks: Vec<CheckResult>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(CheckStatus::Pass);
        Self {
            checked_at,
            status,
            checks,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }
}

pub const COMPLETENESS_COLUMNS: [&str; 3] = ["nct_id", "brief_title", "overall_status"];

pub struct QualityChecker {
    queries: Arc<dyn QualityQueries>,
    config: QualityConfig,
    staging_table: String,
}

impl QualityChecker {
    pub fn new(
        queries: Arc<dyn QualityQueries>,
        config: QualityConfig,
        staging_table: impl Into<String>,
    ) -> Self {
        Self {
            queries,
            config,
            staging_table: staging_table.into(),
        }
    }

    pub async fn run(&self) -> QualityReport {
        self.run_at(Utc::now()).await
    }

    pub async fn run_at(&self, now: DateTime<Utc>) -> QualityReport {
        info!("Starting data quality checks");

        let mut checks = Vec::new();
        for table in &self.config.tables {
            checks.push(self.check_count(table).await);
        }
        checks.push(self.check_freshness(now).await);
        checks.extend(self.check_completeness().await);

        for check in &checks {
            match check.status {
                CheckStatus::Pass => info!(check = %check.name, "{}", check.detail),
                CheckStatus::Fail => warn!(check = %check.name, "{}", check.detail),
                CheckStatus::Error => error!(check = %check.name, "{}", check.detail),
            }
        }

        let report = QualityReport::from_checks(now, checks);
        info!(status = ?report.status, "Data quality checks completed");
        report
    }

    async fn check_count(&self, table: &str) -> CheckResult {
        let name = format!("record_count:{}", table);
        match self.queries.row_count(table).await {
            Ok(count) if count > 0 => {
                CheckResult::new(name, CheckStatus::Pass, format!("{} records", count))
            },
            Ok(_) => CheckResult::new(name, CheckStatus::Fail, "table is empty"),
            Err(e) => CheckResult::new(name, CheckStatus::Error, e.to_string()),
        }
    }

    async fn check_freshness(&self, now: DateTime<Utc>) -> CheckResult {
        let name = "freshness";
        match self.queries.latest_extraction(&self.staging_table).await {
            Ok(Some(latest)) => {
                let days_old = (now - latest).num_days();
                let status = if days_old <= self.config.freshness_max_days {
                    CheckStatus::Pass
                } else {
                    CheckStatus::Fail
                };
                CheckResult::new(
                    name,
                    status,
                    format!("latest extraction {} ({} days old)", latest, days_old),
                )
            },
            Ok(None) => CheckResult::new(name, CheckStatus::Error, "no data found"),
            Err(e) => CheckResult::new(name, CheckStatus::Error, e.to_string()),
        }
    }

    async fn check_completeness(&self) -> Vec<CheckResult> {
        let table = &self.staging_table;
        let total = match self.queries.row_count(table).await {
            Ok(total) => total,
            Err(e) => {
                return vec![CheckResult::new(
                    "completeness",
                    CheckStatus::Error,
                    e.to_string(),
                )]
            },
        };

        let mut results = Vec::with_capacity(COMPLETENESS_COLUMNS.len());
        for column in COMPLETENESS_COLUMNS {
            let name = format!("completeness:{}", column);
            let result = match self.queries.non_null_count(table, column).await {
                Ok(present) => {
                    // An empty table scores zero
                    let score = if total > 0 {
                        present as f64 / total as f64
                    } else {
                        0.0
                    };
                    let status = if score >= self.config.completeness_threshold {
                        CheckStatus::Pass
                    } else {
                        CheckStatus::Fail
                    };
                    CheckResult::new(
                        name,
                        status,
                        format!(
                            "{:.3} of {} rows populated (threshold {:.2})",
                            score, total, self.config.completeness_threshold
                        ),
                    )
                },
                Err(e) => CheckResult::new(name, CheckStatus::Error, e.to_string()),
            };
            results.push(result);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BatchId, StudyRecord};
    use crate::warehouse::{InMemoryWarehouse, StagingRow, Warehouse};
    use chrono::Duration;

    const TABLE: &str = "staging_clinical_trials";

    fn config() -> QualityConfig {
        QualityConfig {
            tables: vec![TABLE.to_string()],
            freshness_max_days: 7,
            completeness_threshold: 0.95,
        }
    }

    async fn seeded(n: usize, missing_titles: usize, extracted: DateTime<Utc>) -> Arc<InMemoryWarehouse> {
        let warehouse = Arc::new(InMemoryWarehouse::new());
        let batch_id = BatchId::parse("b").unwrap();
        let rows: Vec<StagingRow> = (0..n)
            .map(|i| {
                let record = StudyRecord {
                    nct_id: Some(format!("NCT{:08}", i)),
                    brief_title: (i >= missing_titles).then(|| "Title".to_string()),
                    overall_status: Some("COMPLETED".to_string()),
                    extraction_timestamp: Some(extracted.to_rfc3339()),
                    ..StudyRecord::default()
                };
                StagingRow::coerce(&record, &batch_id).unwrap()
            })
            .collect();
        warehouse.ensure_staging_table(TABLE).await.unwrap();
        warehouse.replace_batch_rows(TABLE, &batch_id, &rows).await.unwrap();
        warehouse
    }

    #[tokio::test]
    async fn test_all_checks_pass() {
        let now = Utc::now();
        let warehouse = seeded(100, 2, now - Duration::days(1)).await;
        let report = QualityChecker::new(warehouse, config(), TABLE).run_at(now).await;

        assert_eq!(report.status, CheckStatus::Pass, "{:?}", report.checks);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.checks.len(), 5);
    }

    #[tokio::test]
    async fn test_stale_and_incomplete_fail() {
        let now = Utc::now();
        let warehouse = seeded(100, 10, now - Duration::days(30)).await;
        let report = QualityChecker::new(warehouse, config(), TABLE).run_at(now).await;

        assert_eq!(report.status, CheckStatus::Fail);
        assert_eq!(report.exit_code(), 2);
        let failed: Vec<&str> = report
            .checks
            .iter()
            .filter(|c| c.status == CheckStatus::Fail)
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(failed, vec!["freshness", "completeness:brief_title"]);
    }

    #[tokio::test]
    async fn test_missing_table_is_error() {
        let warehouse = Arc::new(InMemoryWarehouse::new());
        let report = QualityChecker::new(warehouse, config(), TABLE).run().await;
        assert_eq!(report.status, CheckStatus::Error);
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_empty_table() {
        let warehouse = Arc::new(InMemoryWarehouse::new());
        warehouse.ensure_staging_table(TABLE).await.unwrap();
        let report = QualityChecker::new(warehouse, config(), TABLE).run().await;

        let count = &report.checks[0];
        assert_eq!(count.status, CheckStatus::Fail);
        // No rows means no freshness signal
        assert_eq!(report.status, CheckStatus::Error);
    }

    #[test]
    fn test_worst_status_wins() {
        let report = QualityReport::from_checks(
            Utc::now(),
            vec![
                CheckResult::new("a", CheckStatus::Fail, ""),
                CheckResult::new("b", CheckStatus::Error, ""),
                CheckResult::new("c", CheckStatus::Pass, ""),
            ],
        );
        assert_eq!(report.status, CheckStatus::Error);
        assert_eq!(QualityReport::from_checks(Utc::now(), vec![]).status, CheckStatus::Pass);
    }
}

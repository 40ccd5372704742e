//! In-process warehouse

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{BatchLoad, StagingRow, Warehouse};
use crate::error::{PipelineError, Result};
use crate::models::BatchId;
use crate::quality::QualityQueries;

type Tables = Arc<RwLock<HashMap<String, Vec<StagingRow>>>>;

/// [`Warehouse`] keeping tables as row vectors. Like Postgres, writing to
/// a table that was never created is an error.
#[derive(Debug, Default)]
pub struct InMemoryWarehouse {
    tables: Tables,
}

impl InMemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn rows(&self, table: &str) -> Vec<StagingRow> {
        self.tables
            .read()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn rows_for_batch(&self, table: &str, batch_id: &BatchId) -> Vec<StagingRow> {
        self.rows(table)
            .await
            .into_iter()
            .filter(|r| r.batch_id == batch_id.as_str())
            .collect()
    }

    async fn table(&self, table: &str) -> Result<Vec<StagingRow>> {
        self.tables
            .read()
            .await
            .get(table)
            .cloned()
            .ok_or_else(|| missing_relation(table))
    }
}

#[async_trait]
impl Warehouse for InMemoryWarehouse {
    async fn ensure_staging_table(&self, table: &str) -> Result<()> {
        self.tables
            .write()
            .await
            .entry(table.to_string())
            .or_default();
        Ok(())
    }

    async fn begin_batch_load(&self, table: &str, batch_id: &BatchId) -> Result<Box<dyn BatchLoad>> {
        if !self.tables.read().await.contains_key(table) {
            return Err(missing_relation(table));
        }
        Ok(Box::new(MemoryBatchLoad {
            tables: Arc::clone(&self.tables),
            table: table.to_string(),
            batch_id: batch_id.clone(),
            pending: Vec::new(),
        }))
    }
}

fn missing_relation(table: &str) -> PipelineError {
    PipelineError::Warehouse(format!("relation \"{}\" does not exist", table))
}

/// Buffers inserted rows and swaps them in on commit
struct MemoryBatchLoad {
    tables: Tables,
    table: String,
    batch_id: BatchId,
    pending: Vec<StagingRow>,
}

#[async_trait]
impl BatchLoad for MemoryBatchLoad {
    async fn insert(&mut self, rows: &[StagingRow]) -> Result<u64> {
        self.pending.extend_from_slice(rows);
        Ok(rows.len() as u64)
    }

    async fn commit(self: Box<Self>) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let existing = tables
            .get_mut(&self.table)
            .ok_or_else(|| missing_relation(&self.table))?;
        existing.retain(|r| r.batch_id != self.batch_id.as_str());
        existing.extend_from_slice(&self.pending);
        Ok(self.pending.len() as u64)
    }
}

#[async_trait]
impl QualityQueries for InMemoryWarehouse {
    async fn row_count(&self, table: &str) -> Result<i64> {
        Ok(self.table(table).await?.len() as i64)
    }

    async fn latest_extraction(&self, table: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .table(table)
            .await?
            .iter()
            .filter_map(|r| r.extraction_timestamp)
            .max())
    }

    async fn non_null_count(&self, table: &str, column: &str) -> Result<i64> {
        let rows = self.table(table).await?;
        let count = rows
            .iter()
            .filter(|r| match column {
                "nct_id" => r.nct_id.is_some(),
                "brief_title" => r.brief_title.is_some(),
                "overall_status" => r.overall_status.is_some(),
                _ => false,
            })
            .count();
        Ok(count as i64)
    }
}

//! PostgreSQL warehouse

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Transaction};
use tracing::{debug, info, instrument};

use super::{BatchLoad, StagingRow, Warehouse};
use crate::config::{is_safe_identifier, WarehouseConfig, MAX_INSERT_CHUNK_SIZE};
use crate::error::{PipelineError, Result};
use crate::models::BatchId;
use crate::quality::{QualityQueries, COMPLETENESS_COLUMNS};

const INSERT_COLUMNS: &str = "nct_id, brief_title, official_title, overall_status, study_type, \
     phase, condition, intervention_name, primary_outcome_measure, study_first_submit_date, \
     last_update_submit_date, completion_date, location_city, location_state, location_country, \
     sponsor_name, extraction_timestamp, data_source, batch_id";

fn checked(table: &str) -> Result<&str> {
    if is_safe_identifier(table) {
        Ok(table)
    } else {
        Err(PipelineError::Config(format!(
            "'{}' is not a valid table identifier",
            table
        )))
    }
}

pub fn staging_table_ddl(table: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            nct_id VARCHAR(50),
            brief_title VARCHAR(1000),
            official_title VARCHAR(2000),
            overall_status VARCHAR(100),
            study_type VARCHAR(100),
            phase VARCHAR(100),
            condition VARCHAR(2000),
            intervention_name VARCHAR(2000),
            primary_outcome_measure VARCHAR(5000),
            study_first_submit_date DATE,
            last_update_submit_date DATE,
            completion_date DATE,
            location_city VARCHAR(200),
            location_state VARCHAR(100),
            location_country VARCHAR(100),
            sponsor_name VARCHAR(500),
            extraction_timestamp TIMESTAMPTZ,
            data_source VARCHAR(100),
            batch_id VARCHAR(64) NOT NULL,
            loaded_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#
    )
}

#[derive(Clone)]
pub struct PgWarehouse {
    pool: PgPool,
    insert_chunk_size: usize,
}

impl PgWarehouse {
    /// Open the pool and verify a connection can be established. Any
    /// failure here is [`PipelineError::WarehouseUnavailable`].
    pub async fn connect(config: &WarehouseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout())
            .connect(&config.url)
            .await
            .map_err(|e| PipelineError::WarehouseUnavailable(e.to_string()))?;

        info!(max_connections = config.max_connections, "Warehouse pool ready");

        Ok(Self::from_pool(pool, config.insert_chunk_size))
    }

    /// Build the pool without connecting; the first query connects.
    pub fn connect_lazy(config: &WarehouseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout())
            .connect_lazy(&config.url)
            .map_err(|e| PipelineError::Config(format!("warehouse.url: {}", e)))?;
        Ok(Self::from_pool(pool, config.insert_chunk_size))
    }

    /// Chunk size is clamped so one INSERT stays within the bind limit.
    pub fn from_pool(pool: PgPool, insert_chunk_size: usize) -> Self {
        Self {
            pool,
            insert_chunk_size: insert_chunk_size.clamp(1, MAX_INSERT_CHUNK_SIZE),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn insert_chunk_size(&self) -> usize {
        self.insert_chunk_size
    }

    async fn insert_chunk(
        tx: &mut Transaction<'static, Postgres>,
        table: &str,
        rows: &[StagingRow],
    ) -> Result<u64> {
        let mut query_builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("INSERT INTO {} ({}) ", table, INSERT_COLUMNS));

        query_builder.push_values(rows, |mut b, row| {
            b.push_bind(&row.nct_id)
                .push_bind(&row.brief_title)
                .push_bind(&row.official_title)
                .push_bind(&row.overall_status)
                .push_bind(&row.study_type)
                .push_bind(&row.phase)
                .push_bind(&row.condition)
                .push_bind(&row.intervention_name)
                .push_bind(&row.primary_outcome_measure)
                .push_bind(row.study_first_submit_date)
                .push_bind(row.last_update_submit_date)
                .push_bind(row.completion_date)
                .push_bind(&row.location_city)
                .push_bind(&row.location_state)
                .push_bind(&row.location_country)
                .push_bind(&row.sponsor_name)
                .push_bind(row.extraction_timestamp)
                .push_bind(&row.data_source)
                .push_bind(&row.batch_id);
        });

        let result = query_builder.build().execute(&mut **tx).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    #[instrument(skip(self))]
    async fn ensure_staging_table(&self, table: &str) -> Result<()> {
        let table = checked(table)?;
        let mut conn = self.pool.acquire().await?;

        sqlx::query(&staging_table_ddl(table))
            .execute(&mut *conn)
            .await?;

        let index = format!(
            "CREATE INDEX IF NOT EXISTS {}_batch_id_idx ON {} (batch_id)",
            table.replace('.', "_"),
            table
        );
        sqlx::query(&index).execute(&mut *conn).await?;

        info!(table = %table, "Staging table ready");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn begin_batch_load(&self, table: &str, batch_id: &BatchId) -> Result<Box<dyn BatchLoad>> {
        let table = checked(table)?;

        // The transaction owns its pooled connection and rolls back on drop
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query(&format!("DELETE FROM {} WHERE batch_id = $1", table))
            .bind(batch_id.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if deleted > 0 {
            info!(batch_id = %batch_id, deleted, "Replacing rows from an earlier load");
        }

        Ok(Box::new(PgBatchLoad {
            tx,
            table: table.to_string(),
            chunk_size: self.insert_chunk_size,
            inserted: 0,
        }))
    }
}

struct PgBatchLoad {
    tx: Transaction<'static, Postgres>,
    table: String,
    chunk_size: usize,
    inserted: u64,
}

#[async_trait]
impl BatchLoad for PgBatchLoad {
    async fn insert(&mut self, rows: &[StagingRow]) -> Result<u64> {
        let total_chunks = rows.len().div_ceil(self.chunk_size);
        let mut inserted = 0;
        for (chunk_idx, chunk) in rows.chunks(self.chunk_size).enumerate() {
            debug!(
                "Inserting chunk {} / {} ({} rows)",
                chunk_idx + 1,
                total_chunks,
                chunk.len()
            );
            inserted += PgWarehouse::insert_chunk(&mut self.tx, &self.table, chunk).await?;
        }
        self.inserted += inserted;
        Ok(inserted)
    }

    async fn commit(self: Box<Self>) -> Result<u64> {
        self.tx.commit().await?;
        Ok(self.inserted)
    }
}

#[async_trait]
impl QualityQueries for PgWarehouse {
    async fn row_count(&self, table: &str) -> Result<i64> {
        let table = checked(table)?;
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn latest_extraction(&self, table: &str) -> Result<Option<DateTime<Utc>>> {
        let table = checked(table)?;
        let latest: Option<DateTime<Utc>> =
            sqlx::query_scalar(&format!("SELECT MAX(extraction_timestamp) FROM {}", table))
                .fetch_one(&self.pool)
                .await?;
        Ok(latest)
    }

    async fn non_null_count(&self, table: &str, column: &str) -> Result<i64> {
        let table = checked(table)?;
        if !COMPLETENESS_COLUMNS.contains(&column) {
            return Err(PipelineError::Config(format!(
                "'{}' is not a checked column",
                column
            )));
        }
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT({}) FROM {}", column, table))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

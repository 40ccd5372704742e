//! Batch-scoped warehouse load
//!
//! A load is only attempted once the run's manifest exists. The staging
//! table is created if missing. Every object under the batch's prefix is
//! read back and coerced row by row, one file at a time, into a single
//! batch replacement, so a load can be repeated safely and holds at most
//! one staged file in memory.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::{BatchLoad, LoadResult, LoadStatus, RowRejection, SkippedFile, StagingRow, Warehouse};
use crate::config::is_safe_identifier;
use crate::error::{PipelineError, Result};
use crate::format::FileFormat;
use crate::manifest::ManifestStore;
use crate::models::{BatchId, Manifest};
use crate::storage::ObjectStore;
use crate::writer::batch_prefix;

pub struct WarehouseLoader {
    store: Arc<dyn ObjectStore>,
    manifests: ManifestStore,
    warehouse: Arc<dyn Warehouse>,
    dataset: String,
}

impl WarehouseLoader {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        warehouse: Arc<dyn Warehouse>,
        dataset: impl Into<String>,
    ) -> Self {
        let dataset = dataset.into();
        Self {
            manifests: ManifestStore::new(Arc::clone(&store), dataset.clone()),
            store,
            warehouse,
            dataset,
        }
    }

    /// Load `batch_id` into `table`. Fails with
    /// [`PipelineError::ManifestMissing`] if staging has not completed.
    pub async fn load(&self, batch_id: &BatchId, table: &str) -> Result<LoadResult> {
        let manifest = self
            .manifests
            .read(batch_id)
            .await?
            .ok_or_else(|| PipelineError::ManifestMissing(batch_id.to_string()))?;
        self.load_manifest(&manifest, table).await
    }

    /// Wait for the manifest to appear, then load
    pub async fn load_when_ready(
        &self,
        batch_id: &BatchId,
        table: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<LoadResult> {
        let manifest = self
            .manifests
            .wait_for(batch_id, timeout, poll_interval)
            .await?;
        self.load_manifest(&manifest, table).await
    }

    #[instrument(skip(self, manifest), fields(batch_id = %manifest.batch_id))]
    pub async fn load_manifest(&self, manifest: &Manifest, table: &str) -> Result<LoadResult> {
        if !is_safe_identifier(table) {
            return Err(PipelineError::Config(format!(
                "'{}' is not a valid table identifier",
                table
            )));
        }
        let batch_id = &manifest.batch_id;
        self.warehouse.ensure_staging_table(table).await?;

        let keys = self.store.list(&batch_prefix(&self.dataset, batch_id)).await?;
        let listed: BTreeSet<&str> = keys.iter().map(String::as_str).collect();
        for missing in manifest.files.iter().filter(|f| !listed.contains(f.as_str())) {
            warn!(key = %missing, "Manifest lists a file that is not in storage");
        }
        let extra = keys.iter().filter(|k| !manifest.files.contains(k)).count();
        if extra > 0 {
            warn!(extra, "Staged objects not listed in the manifest will also be loaded");
        }

        // Opened on the first readable file, so an unreadable batch writes nothing
        let mut load: Option<Box<dyn BatchLoad>> = None;
        let mut rejections = Vec::new();
        let mut skipped_files = Vec::new();
        let mut files_loaded = 0;
        let mut records_staged = 0;

        for key in &keys {
            let Some(format) = FileFormat::from_key(key) else {
                skipped_files.push(SkippedFile {
                    key: key.clone(),
                    reason: "unrecognised file extension".to_string(),
                });
                continue;
            };
            let data = self.store.get(key).await?;
            let records = match format.decode(&data) {
                Ok(records) => records,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable staged file");
                    skipped_files.push(SkippedFile {
                        key: key.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                },
            };
            drop(data);

            files_loaded += 1;
            records_staged += records.len();
            let mut rows = Vec::with_capacity(records.len());
            for (row, record) in records.iter().enumerate() {
                match StagingRow::coerce(record, batch_id) {
                    Ok(staged) => rows.push(staged),
                    Err(reason) => rejections.push(RowRejection {
                        file: key.clone(),
                        row,
                        nct_id: record.nct_id.clone(),
                        reason,
                    }),
                }
            }

            let mut active = match load.take() {
                Some(active) => active,
                None => self.warehouse.begin_batch_load(table, batch_id).await?,
            };
            let inserted = active.insert(&rows).await?;
            load = Some(active);
            debug!(key = %key, rows = inserted, "Staged file loaded");
        }

        let status = if !keys.is_empty() && files_loaded == 0 {
            LoadStatus::Error
        } else if !skipped_files.is_empty() {
            LoadStatus::Partial
        } else {
            LoadStatus::Success
        };

        let mut result = LoadResult {
            status,
            batch_id: batch_id.clone(),
            table: table.to_string(),
            files_loaded,
            records_staged,
            rows_loaded: 0,
            rejections,
            skipped_files,
        };

        if status == LoadStatus::Error {
            warn!(files = keys.len(), "No staged file could be read, nothing loaded");
            return Ok(result);
        }

        // An empty run still clears rows left by an earlier load of this batch
        let load = match load {
            Some(load) => load,
            None => self.warehouse.begin_batch_load(table, batch_id).await?,
        };
        result.rows_loaded = load.commit().await?;

        if result.rows_loaded == 0 && manifest.total_records > 0 {
            warn!(
                expected = manifest.total_records,
                "Load reported zero rows for a non-empty batch"
            );
        }
        if !result.rejections.is_empty() {
            warn!(rejected = result.rows_rejected(), "Rows rejected during load");
        }

        info!(
            table = %table,
            status = ?result.status,
            files = files_loaded,
            rows_loaded = result.rows_loaded,
            rejected = result.rows_rejected(),
            "Load complete"
        );
        Ok(result)
    }
}

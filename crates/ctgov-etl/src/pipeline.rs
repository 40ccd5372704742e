//! End-to-end run orchestration
//!
//! Steps run strictly in sequence, each consuming the previous step's
//! output:
//!
//! ```text
//! read pages -> partition -> write objects -> manifest -> load -> transform
//! ```
//!
//! Batches are written as soon as the partitioner emits them, so memory is
//! bounded by one page plus the partitioner's accumulator. Any fatal error
//! is returned unchanged. A failed [`IngestPipeline::stage`] never writes a
//! manifest, which keeps the loader away from partial runs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::batching::{BatchPolicy, Partitioner};
use crate::config::{Config, DEFAULT_STAGING_TABLE};
use crate::error::{PipelineError, Result};
use crate::format::FileFormat;
use crate::manifest::ManifestStore;
use crate::models::{BatchId, Manifest, StoredObject};
use crate::notify::Notifier;
use crate::source::{PaginatedReader, StudyQuery, StudySource};
use crate::storage::ObjectStore;
use crate::transform::{TransformOutcome, TransformRunner, TransformStatus};
use crate::warehouse::{LoadResult, LoadStatus, Warehouse, WarehouseLoader};
use crate::writer::{KeyStrategy, ObjectWriter};

/// Everything a run needs besides its collaborators
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub dataset: String,
    pub query: StudyQuery,
    pub max_records: Option<usize>,
    pub page_interval: Duration,
    pub policy: BatchPolicy,
    pub format: FileFormat,
    pub key_strategy: KeyStrategy,
    pub staging_table: String,
    pub generate_docs: bool,
    pub manifest_wait: Duration,
    pub manifest_poll: Duration,
}

impl PipelineSettings {
    pub fn new(dataset: impl Into<String>, query: StudyQuery) -> Self {
        Self {
            dataset: dataset.into(),
            query,
            max_records: None,
            page_interval: Duration::ZERO,
            policy: BatchPolicy::RecordCount(crate::config::DEFAULT_BATCH_MAX_RECORDS),
            format: FileFormat::Parquet,
            key_strategy: KeyStrategy::Timestamped,
            staging_table: DEFAULT_STAGING_TABLE.to_string(),
            generate_docs: false,
            manifest_wait: Duration::ZERO,
            manifest_poll: Duration::from_secs(1),
        }
    }

    pub fn from_config(config: &Config, today: NaiveDate) -> Result<Self> {
        Ok(Self {
            dataset: config.storage.dataset.clone(),
            query: StudyQuery::from_config(&config.source, today)?,
            max_records: config.source.max_records,
            page_interval: Duration::from_millis(config.source.request_interval_ms),
            policy: config.batching.policy(),
            format: config.batching.format,
            key_strategy: config.batching.key_strategy,
            staging_table: config.warehouse.staging_table.clone(),
            generate_docs: config.transform.generate_docs,
            manifest_wait: Duration::from_secs(config.warehouse.manifest_wait_secs),
            manifest_poll: Duration::from_secs(config.warehouse.manifest_poll_secs),
        })
    }
}

/// Outcome of the extract and stage half of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub batch_id: BatchId,
    pub pages: u32,
    pub records: u64,
    pub objects: Vec<StoredObject>,
    pub manifest: Manifest,
}

/// Summary of a completed run, logged and sent to the notifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub batch_id: BatchId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records_extracted: u64,
    pub files_written: usize,
    pub load: LoadResult,
    pub transform: Option<TransformStatus>,
}

pub struct IngestPipeline {
    source: Arc<dyn StudySource>,
    store: Arc<dyn ObjectStore>,
    warehouse: Arc<dyn Warehouse>,
    transform: Option<Arc<dyn TransformRunner>>,
    notifier: Option<Arc<dyn Notifier>>,
    settings: PipelineSettings,
}

impl IngestPipeline {
    pub fn new(
        source: Arc<dyn StudySource>,
        store: Arc<dyn ObjectStore>,
        warehouse: Arc<dyn Warehouse>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            source,
            store,
            warehouse,
            transform: None,
            notifier: None,
            settings,
        }
    }

    pub fn with_transform(mut self, runner: Arc<dyn TransformRunner>) -> Self {
        self.transform = Some(runner);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    fn manifests(&self) -> ManifestStore {
        ManifestStore::new(Arc::clone(&self.store), self.settings.dataset.clone())
    }

    fn loader(&self) -> WarehouseLoader {
        WarehouseLoader::new(
            Arc::clone(&self.store),
            Arc::clone(&self.warehouse),
            self.settings.dataset.clone(),
        )
    }

    /// Extract, partition and write every batch, then the manifest.
    #[instrument(skip(self), fields(batch_id = %batch_id))]
    pub async fn stage(&self, batch_id: &BatchId) -> Result<StageReport> {
        self.stage_inner(batch_id)
            .await
            .inspect_err(|e| error!(kind = e.kind(), "Staging failed: {}", e))
    }

    async fn stage_inner(&self, batch_id: &BatchId) -> Result<StageReport> {
        let settings = &self.settings;
        let mut reader = PaginatedReader::new(Arc::clone(&self.source), settings.query.clone())
            .with_max_records(settings.max_records)
            .with_page_interval(settings.page_interval);
        let mut partitioner = Partitioner::new(batch_id.clone(), settings.policy);
        let writer = ObjectWriter::new(
            Arc::clone(&self.store),
            settings.dataset.clone(),
            settings.format,
            settings.key_strategy,
        );

        let mut objects = Vec::new();
        while let Some(page) = reader.next_page().await? {
            for batch in partitioner.accumulate_all(page)? {
                objects.push(writer.write(&batch).await?);
            }
        }
        if let Some(batch) = partitioner.finish() {
            objects.push(writer.write(&batch).await?);
        }

        let records = reader.records_read() as u64;
        if records == 0 {
            warn!("Source returned no records");
        }

        let manifest = self.manifests().write(batch_id, &objects).await?;

        Ok(StageReport {
            batch_id: batch_id.clone(),
            pages: reader.pages_fetched(),
            records,
            objects,
            manifest,
        })
    }

    /// Load a staged batch into the staging table. The manifest must
    /// already exist, or appear within the configured wait.
    #[instrument(skip(self), fields(batch_id = %batch_id))]
    pub async fn load(&self, batch_id: &BatchId) -> Result<LoadResult> {
        let loader = self.loader();
        let table = &self.settings.staging_table;
        let result = if self.settings.manifest_wait.is_zero() {
            loader.load(batch_id, table).await?
        } else {
            loader
                .load_when_ready(
                    batch_id,
                    table,
                    self.settings.manifest_wait,
                    self.settings.manifest_poll,
                )
                .await?
        };

        if result.status == LoadStatus::Error {
            let err = PipelineError::LoadFailed {
                batch_id: batch_id.to_string(),
                message: format!(
                    "none of {} staged files could be read",
                    result.skipped_files.len()
                ),
            };
            error!(kind = err.kind(), "{}", err);
            return Err(err);
        }
        Ok(result)
    }

    /// Run the transform step, escalating an `Error` outcome. Returns
    /// `None` when no runner is configured.
    #[instrument(skip(self), fields(batch_id = %batch_id))]
    pub async fn transform(&self, batch_id: &BatchId) -> Result<Option<TransformOutcome>> {
        let Some(runner) = &self.transform else {
            info!("No transform runner configured, skipping");
            return Ok(None);
        };

        let outcome = runner.run_transform(batch_id).await?;
        match outcome.status {
            TransformStatus::Success => info!("Transform succeeded"),
            TransformStatus::Warning => {
                warn!(output = %outcome.output, "Transform completed with warnings")
            },
            TransformStatus::Error => {
                let err = PipelineError::TransformFailed {
                    batch_id: batch_id.to_string(),
                    message: outcome.output,
                };
                error!(kind = err.kind(), "{}", err);
                return Err(err);
            },
        }

        if self.settings.generate_docs {
            let docs = runner.generate_docs().await?;
            if docs.status != TransformStatus::Success {
                warn!(output = %docs.output, "Documentation generation failed");
            }
        }
        Ok(Some(outcome))
    }

    /// Every step in order, then the success notification
    pub async fn run(&self, batch_id: &BatchId) -> Result<RunReport> {
        let started_at = Utc::now();
        info!(batch_id = %batch_id, "Pipeline run started");

        let staged = self.stage(batch_id).await?;
        let load = self.load(batch_id).await?;
        let transform = self.transform(batch_id).await?.map(|o| o.status);

        let report = RunReport {
            batch_id: batch_id.clone(),
            started_at,
            finished_at: Utc::now(),
            records_extracted: staged.records,
            files_written: staged.objects.len(),
            load,
            transform,
        };

        info!(
            batch_id = %batch_id,
            records = report.records_extracted,
            files = report.files_written,
            rows_loaded = report.load.rows_loaded,
            rows_rejected = report.load.rows_rejected(),
            transform = ?report.transform,
            "Pipeline run completed successfully"
        );

        if let Some(notifier) = &self.notifier {
            if let Err(e) = notifier.notify(&report).await {
                warn!(error = %e, "Run notification failed");
            }
        }
        Ok(report)
    }
}

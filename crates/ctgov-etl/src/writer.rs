//! Batch object writer

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::format::FileFormat;
use crate::models::{Batch, BatchId, StoredObject, BATCH_TIMESTAMP_FORMAT};
use crate::storage::ObjectStore;

/// How object keys are made unique.
///
/// `Timestamped` appends the write time, so a re-run of the same batch id
/// adds files next to the old ones. `Deterministic` drops the timestamp and
/// a re-run overwrites the same keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    #[default]
    Timestamped,
    Deterministic,
}

/// Prefix holding every object of one run: `raw_data/<dataset>/<batch_id>/`
pub fn batch_prefix(dataset: &str, batch_id: &BatchId) -> String {
    format!("raw_data/{}/{}/", dataset, batch_id)
}

pub fn batch_key(
    dataset: &str,
    batch: &Batch,
    format: FileFormat,
    strategy: KeyStrategy,
    at: DateTime<Utc>,
) -> String {
    let prefix = batch_prefix(dataset, &batch.batch_id);
    match strategy {
        KeyStrategy::Timestamped => format!(
            "{}batch_{}_{}.{}",
            prefix,
            batch.sequence_label(),
            at.format(BATCH_TIMESTAMP_FORMAT),
            format.extension()
        ),
        KeyStrategy::Deterministic => {
            format!("{}batch_{}.{}", prefix, batch.sequence_label(), format.extension())
        },
    }
}

/// Encodes batches and puts them to the object store.
///
/// Writes are unconditional puts; nothing is retried here.
#[derive(Clone)]
pub struct ObjectWriter {
    store: Arc<dyn ObjectStore>,
    dataset: String,
    format: FileFormat,
    strategy: KeyStrategy,
}

impl ObjectWriter {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        dataset: impl Into<String>,
        format: FileFormat,
        strategy: KeyStrategy,
    ) -> Self {
        Self {
            store,
            dataset: dataset.into(),
            format,
            strategy,
        }
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn format(&self) -> FileFormat {
        self.format
    }

    pub async fn write(&self, batch: &Batch) -> Result<StoredObject> {
        let key = batch_key(&self.dataset, batch, self.format, self.strategy, Utc::now());
        let data = self.format.encode(&batch.records)?;
        let uploaded = self.store.put(&key, data, self.format.content_type()).await?;

        info!(
            batch_id = %batch.batch_id,
            sequence = batch.sequence,
            records = batch.len(),
            bytes = uploaded.size,
            key = %uploaded.key,
            "Wrote batch"
        );

        Ok(StoredObject {
            key: uploaded.key,
            sequence: batch.sequence,
            record_count: batch.len(),
            size_bytes: uploaded.size,
            checksum: uploaded.checksum,
            encrypted: uploaded.encrypted,
        })
    }
}

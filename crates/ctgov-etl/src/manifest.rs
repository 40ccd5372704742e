//! Run manifests
//!
//! A manifest is the completion marker for a batch id. It is written once,
//! after every batch object of the run has been durably stored, and is the
//! only thing the loader trusts to decide a run is ready.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::models::{BatchId, Manifest, StoredObject};
use crate::storage::ObjectStore;

pub fn manifest_key(dataset: &str, batch_id: &BatchId) -> String {
    format!("manifests/{}/{}/manifest.json", dataset, batch_id)
}

#[derive(Clone)]
pub struct ManifestStore {
    store: Arc<dyn ObjectStore>,
    dataset: String,
}

impl ManifestStore {
    pub fn new(store: Arc<dyn ObjectStore>, dataset: impl Into<String>) -> Self {
        Self {
            store,
            dataset: dataset.into(),
        }
    }

    /// Write the manifest for a finished run. `objects` must be in sequence
    /// order; an empty slice records a run that extracted nothing.
    pub async fn write(&self, batch_id: &BatchId, objects: &[StoredObject]) -> Result<Manifest> {
        let files = objects.iter().map(|o| o.key.clone()).collect();
        let total = objects.iter().map(|o| o.record_count as u64).sum();
        let manifest = Manifest::new(batch_id.clone(), files, total);

        let key = manifest_key(&self.dataset, batch_id);
        let body = serde_json::to_vec_pretty(&manifest)?;
        self.store.put(&key, body, "application/json").await?;

        info!(
            batch_id = %batch_id,
            files = manifest.file_count,
            records = manifest.total_records,
            key = %key,
            "Manifest written"
        );
        Ok(manifest)
    }

    /// Read the manifest for `batch_id`, or `None` if the run has not
    /// completed staging.
    pub async fn read(&self, batch_id: &BatchId) -> Result<Option<Manifest>> {
        let key = manifest_key(&self.dataset, batch_id);
        if !self.store.exists(&key).await? {
            return Ok(None);
        }
        let bytes = self.store.get(&key).await?;
        let manifest: Manifest = serde_json::from_slice(&bytes)
            .map_err(|e| PipelineError::storage_read(&key, format!("invalid manifest: {}", e)))?;
        Ok(Some(manifest))
    }

    /// Poll until the manifest appears or `timeout` elapses.
    pub async fn wait_for(
        &self,
        batch_id: &BatchId,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Manifest> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(manifest) = self.read(batch_id).await? {
                return Ok(manifest);
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(batch_id = %batch_id, ?timeout, "Manifest did not appear in time");
                return Err(PipelineError::ManifestMissing(batch_id.to_string()));
            }
            debug!(batch_id = %batch_id, "Manifest not present yet, polling");
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }
}

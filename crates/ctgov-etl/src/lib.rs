//! Clinical trials ETL pipeline
//!
//! Pulls study records from the ClinicalTrials.gov v2 API, stages them as
//! micro-batches in S3-compatible storage and loads them into a warehouse
//! staging table, batch id by batch id.
//!
//! # Overview
//!
//! - **Source**: [`source::PaginatedReader`] walks the registry's page tokens
//!   over any [`source::StudySource`]
//! - **Batching**: [`batching::Partitioner`] cuts the record stream into
//!   numbered micro-batches by record count or serialized size
//! - **Storage**: [`writer::ObjectWriter`] encodes each batch (Parquet, JSON
//!   or CSV) and puts it to an [`storage::ObjectStore`]
//! - **Manifest**: [`manifest::ManifestStore`] writes the completion marker
//!   once every batch of a run is stored
//! - **Warehouse**: [`warehouse::WarehouseLoader`] replaces a batch's rows in
//!   the staging table, skipping and counting rows it cannot store
//! - **Transform**: [`transform::TransformRunner`] is the boundary to dbt
//!
//! [`pipeline::IngestPipeline`] wires the steps together; the `ctgov-etl`
//! binary exposes each step as a subcommand for an external scheduler.
//!
//! # Key layout
//!
//! ```text
//! raw_data/<dataset>/<batch_id>/batch_<seq:04>_<YYYYMMDD_HHMMSS>.<ext>
//! manifests/<dataset>/<batch_id>/manifest.json
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod batching;
pub mod config;
pub mod error;
pub mod format;
pub mod manifest;
pub mod models;
pub mod notify;
pub mod pipeline;
pub mod quality;
pub mod source;
pub mod storage;
pub mod transform;
pub mod warehouse;
pub mod writer;

pub use config::Config;
pub use error::{PipelineError, Result};
pub use models::{Batch, BatchId, Manifest, StoredObject, StudyRecord};
pub use pipeline::{IngestPipeline, PipelineSettings, RunReport, StageReport};

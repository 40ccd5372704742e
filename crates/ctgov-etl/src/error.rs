//! Pipeline error taxonomy
//!
//! Every variant that reaches a caller is fatal to the current run. Non-fatal
//! conditions (rejected rows, transform test warnings, skipped files) are
//! carried in step results instead.

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Registry API unreachable or answered with a non-2xx status
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// Object store put failed; remaining batches of the run are abandoned
    #[error("Storage write failed for {key}: {message}")]
    StorageWriteFailed { key: String, message: String },

    #[error("Storage read failed for {key}: {message}")]
    StorageReadFailed { key: String, message: String },

    /// Could not connect or authenticate to the warehouse
    #[error("Warehouse unavailable: {0}")]
    WarehouseUnavailable(String),

    /// Statement failure after a connection was established
    #[error("Warehouse error: {0}")]
    Warehouse(String),

    #[error("No manifest found for batch {0}")]
    ManifestMissing(String),

    /// Staged files exist but none of them could be read
    #[error("Load failed for batch {batch_id}: {message}")]
    LoadFailed { batch_id: String, message: String },

    #[error("Transform failed for batch {batch_id}: {message}")]
    TransformFailed { batch_id: String, message: String },

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Invalid batch id '{0}'")]
    InvalidBatchId(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn storage_write(key: impl Into<String>, err: impl std::fmt::Display) -> Self {
        PipelineError::StorageWriteFailed {
            key: key.into(),
            message: err.to_string(),
        }
    }

    pub fn storage_read(key: impl Into<String>, err: impl std::fmt::Display) -> Self {
        PipelineError::StorageReadFailed {
            key: key.into(),
            message: err.to_string(),
        }
    }

    /// Whether the error must end the current run. Every variant that
    /// reaches a caller does; non-fatal conditions never become errors.
    pub fn is_fatal(&self) -> bool {
        match self {
            PipelineError::SourceUnavailable(_)
            | PipelineError::StorageWriteFailed { .. }
            | PipelineError::StorageReadFailed { .. }
            | PipelineError::WarehouseUnavailable(_)
            | PipelineError::Warehouse(_)
            | PipelineError::ManifestMissing(_)
            | PipelineError::LoadFailed { .. }
            | PipelineError::TransformFailed { .. }
            | PipelineError::Encoding(_)
            | PipelineError::InvalidBatchId(_)
            | PipelineError::Config(_) => true,
        }
    }

    /// Short machine-readable kind, used in logs and notifications
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::SourceUnavailable(_) => "source_unavailable",
            PipelineError::StorageWriteFailed { .. } => "storage_write_failed",
            PipelineError::StorageReadFailed { .. } => "storage_read_failed",
            PipelineError::WarehouseUnavailable(_) => "warehouse_unavailable",
            PipelineError::Warehouse(_) => "warehouse_error",
            PipelineError::ManifestMissing(_) => "manifest_missing",
            PipelineError::LoadFailed { .. } => "load_failed",
            PipelineError::TransformFailed { .. } => "transform_failed",
            PipelineError::Encoding(_) => "encoding",
            PipelineError::InvalidBatchId(_) => "invalid_batch_id",
            PipelineError::Config(_) => "config",
        }
    }
}

/// SQLSTATE classes 08 (connection exception) and 28 (invalid
/// authorization) mean the warehouse cannot be used at all.
fn is_unavailable_sqlstate(code: &str) -> bool {
    code.starts_with("08") || code.starts_with("28")
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Configuration(_) => PipelineError::WarehouseUnavailable(err.to_string()),
            sqlx::Error::Database(db_err)
                if db_err.code().is_some_and(|code| is_unavailable_sqlstate(&code)) =>
            {
                PipelineError::WarehouseUnavailable(err.to_string())
            },
            _ => PipelineError::Warehouse(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Encoding(err.to_string())
    }
}

impl From<parquet::errors::ParquetError> for PipelineError {
    fn from(err: parquet::errors::ParquetError) -> Self {
        PipelineError::Encoding(err.to_string())
    }
}

impl From<arrow::error::ArrowError> for PipelineError {
    fn from(err: arrow::error::ArrowError) -> Self {
        PipelineError::Encoding(err.to_string())
    }
}

impl From<csv::Error> for PipelineError {
    fn from(err: csv::Error) -> Self {
        PipelineError::Encoding(err.to_string())
    }
}

impl From<figment::Error> for PipelineError {
    fn from(err: figment::Error) -> Self {
        PipelineError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_timeout_maps_to_unavailable() {
        let err: PipelineError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, PipelineError::WarehouseUnavailable(_)));
        assert_eq!(err.kind(), "warehouse_unavailable");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_row_not_found_maps_to_statement_error() {
        let err: PipelineError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, PipelineError::Warehouse(_)));
    }

    #[test]
    fn test_connection_and_auth_sqlstates_are_unavailable() {
        // invalid_password, connection_failure
        assert!(is_unavailable_sqlstate("28P01"));
        assert!(is_unavailable_sqlstate("08006"));
        // undefined_table, unique_violation
        assert!(!is_unavailable_sqlstate("42P01"));
        assert!(!is_unavailable_sqlstate("23505"));
    }

    #[test]
    fn test_storage_write_message() {
        let err = PipelineError::storage_write("raw_data/x/1/batch_0001.parquet", "timed out");
        assert_eq!(
            err.to_string(),
            "Storage write failed for raw_data/x/1/batch_0001.parquet: timed out"
        );
    }
}

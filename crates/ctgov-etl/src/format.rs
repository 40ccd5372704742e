//! Batch file encodings
//!
//! Parquet is the default. Every column is stored as nullable UTF-8 so the
//! raw layer keeps dates and free text exactly as extracted; typing happens
//! at load time. JSON and CSV are kept for debugging and for consumers that
//! cannot read Parquet.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::models::StudyRecord;

/// Encoding of a stored batch.
///
/// Parquet and JSON keep empty strings. CSV cannot tell an empty field
/// from a null one and decodes both as `None`; flattened records never
/// carry blank values, so nothing is lost for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    #[default]
    Parquet,
    Json,
    Csv,
}

impl FileFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            FileFormat::Parquet => "parquet",
            FileFormat::Json => "json",
            FileFormat::Csv => "csv",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            FileFormat::Parquet => "application/octet-stream",
            FileFormat::Json => "application/json",
            FileFormat::Csv => "text/csv",
        }
    }

    /// Infer the encoding of a stored object from its key's extension
    pub fn from_key(key: &str) -> Option<Self> {
        let (_, ext) = key.rsplit_once('.')?;
        match ext.to_ascii_lowercase().as_str() {
            "parquet" => Some(FileFormat::Parquet),
            "json" => Some(FileFormat::Json),
            "csv" => Some(FileFormat::Csv),
            _ => None,
        }
    }

    pub fn encode(&self, records: &[StudyRecord]) -> Result<Vec<u8>> {
        match self {
            FileFormat::Parquet => encode_parquet(records),
            FileFormat::Json => Ok(serde_json::to_vec_pretty(records)?),
            FileFormat::Csv => encode_csv(records),
        }
    }

    pub fn decode(&self, data: &[u8]) -> Result<Vec<StudyRecord>> {
        match self {
            FileFormat::Parquet => decode_parquet(data),
            FileFormat::Json => Ok(serde_json::from_slice(data)?),
            FileFormat::Csv => decode_csv(data),
        }
    }
}

impl std::fmt::Display for FileFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

// =============================================================================
// Parquet
// =============================================================================

pub fn study_schema() -> SchemaRef {
    let fields: Vec<Field> = StudyRecord::COLUMNS
        .iter()
        .map(|name| Field::new(*name, DataType::Utf8, true))
        .collect();
    Arc::new(Schema::new(fields))
}

fn studies_to_record_batch(records: &[StudyRecord], schema: SchemaRef) -> Result<RecordBatch> {
    let columns: Vec<ArrayRef> = StudyRecord::COLUMNS
        .iter()
        .map(|name| {
            let values: StringArray = records.iter().map(|r| r.get(name)).collect();
            Arc::new(values) as ArrayRef
        })
        .collect();
    Ok(RecordBatch::try_new(schema, columns)?)
}

fn encode_parquet(records: &[StudyRecord]) -> Result<Vec<u8>> {
    let schema = study_schema();
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, Arc::clone(&schema), Some(props))?;
    if !records.is_empty() {
        let batch = studies_to_record_batch(records, schema)?;
        writer.write(&batch)?;
    }
    writer.close()?;
    Ok(buffer)
}

fn decode_parquet(data: &[u8]) -> Result<Vec<StudyRecord>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(Bytes::copy_from_slice(data))?.build()?;

    let mut records = Vec::new();
    for batch in reader {
        let batch = batch?;
        let mut rows = vec![StudyRecord::default(); batch.num_rows()];

        for name in StudyRecord::COLUMNS {
            // Files written by older layouts may lack a column; it stays null
            let Some(column) = batch.column_by_name(name) else {
                continue;
            };
            let values = column
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| {
                    PipelineError::Encoding(format!(
                        "column '{}' is {} not Utf8",
                        name,
                        column.data_type()
                    ))
                })?;
            for (i, row) in rows.iter_mut().enumerate() {
                if values.is_valid(i) {
                    row.set(name, Some(values.value(i).to_string()));
                }
            }
        }
        records.extend(rows);
    }
    Ok(records)
}

// =============================================================================
// CSV
// =============================================================================

fn encode_csv(records: &[StudyRecord]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    // Header is written explicitly so an empty batch still names its columns
    writer.write_record(StudyRecord::COLUMNS)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer
        .into_inner()
        .map_err(|e| PipelineError::Encoding(e.to_string()))
}

/// Empty CSV fields come back as null.
fn decode_csv(data: &[u8]) -> Result<Vec<StudyRecord>> {
    let mut reader = csv::Reader::from_reader(data);
    let mut records = Vec::new();
    for row in reader.deserialize() {
        records.push(row?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<StudyRecord> {
        vec![
            StudyRecord {
                nct_id: Some("NCT00000001".to_string()),
                brief_title: Some("Aspirin, \"low dose\", in adults".to_string()),
                phase: Some("PHASE2, PHASE3".to_string()),
                study_first_submit_date: Some("2023-05".to_string()),
                data_source: Some("clinical_trials_api".to_string()),
                ..StudyRecord::default()
            },
            StudyRecord {
                nct_id: Some("NCT00000002".to_string()),
                condition: Some("Asthma\nCOPD".to_string()),
                ..StudyRecord::default()
            },
        ]
    }

    #[test]
    fn test_each_format_preserves_records() {
        for format in [FileFormat::Parquet, FileFormat::Json, FileFormat::Csv] {
            let bytes = format.encode(&sample()).unwrap();
            assert_eq!(format.decode(&bytes).unwrap(), sample(), "{}", format);
        }
    }

    #[test]
    fn test_empty_batch_encodes() {
        for format in [FileFormat::Parquet, FileFormat::Json, FileFormat::Csv] {
            let bytes = format.encode(&[]).unwrap();
            assert!(!bytes.is_empty());
            assert!(format.decode(&bytes).unwrap().is_empty());
        }
    }

    #[test]
    fn test_parquet_schema_is_all_nullable_utf8() {
        let schema = study_schema();
        assert_eq!(schema.fields().len(), StudyRecord::COLUMNS.len());
        for field in schema.fields() {
            assert_eq!(field.data_type(), &DataType::Utf8);
            assert!(field.is_nullable());
        }
    }

    #[test]
    fn test_parquet_magic() {
        let bytes = FileFormat::Parquet.encode(&sample()).unwrap();
        assert_eq!(&bytes[..4], b"PAR1");
        assert_eq!(&bytes[bytes.len() - 4..], b"PAR1");
    }

    #[test]
    fn test_csv_header_row() {
        let bytes = FileFormat::Csv.encode(&[]).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("nct_id,brief_title,official_title"));
    }

    #[test]
    fn test_blank_values_by_format() {
        let record = StudyRecord {
            nct_id: Some("NCT00000001".to_string()),
            phase: Some(String::new()),
            ..StudyRecord::default()
        };
        for format in [FileFormat::Parquet, FileFormat::Json] {
            let decoded = format.decode(&format.encode(&[record.clone()]).unwrap()).unwrap();
            assert_eq!(decoded[0].phase.as_deref(), Some(""), "{}", format);
        }
        let csv = FileFormat::Csv;
        let decoded = csv.decode(&csv.encode(&[record]).unwrap()).unwrap();
        assert_eq!(decoded[0].phase, None);
        assert_eq!(decoded[0].nct_id.as_deref(), Some("NCT00000001"));
    }

    #[test]
    fn test_garbage_is_encoding_error() {
        let err = FileFormat::Parquet.decode(b"not parquet").unwrap_err();
        assert!(matches!(err, PipelineError::Encoding(_)));
        assert!(FileFormat::Json.decode(b"{").is_err());
    }

    #[test]
    fn test_from_key() {
        assert_eq!(
            FileFormat::from_key("raw_data/ct/b/batch_0001_20240101_000000.parquet"),
            Some(FileFormat::Parquet)
        );
        assert_eq!(FileFormat::from_key("a/b.CSV"), Some(FileFormat::Csv));
        assert_eq!(FileFormat::from_key("a/b.txt"), None);
        assert_eq!(FileFormat::from_key("noext"), None);
    }

    #[test]
    fn test_serde_names() {
        let format: FileFormat = serde_json::from_str("\"csv\"").unwrap();
        assert_eq!(format, FileFormat::Csv);
        assert_eq!(FileFormat::Json.content_type(), "application/json");
    }
}

//! Staged objects decoded into a read-once stream of rows.

use std::io::Cursor;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, StringArray};
use arrow::compute::cast;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

use crate::error::{Error, Result};

/// One source row; cells align with `SourceRows::headers`. Empty cells are
/// `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    pub values: Vec<Option<String>>,
}

impl SourceRow {
    pub fn new<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = Option<S>>,
        S: Into<String>,
    {
        Self {
            values: values.into_iter().map(|v| v.map(Into::into)).collect(),
        }
    }
}

pub type RowIter = Box<dyn Iterator<Item = Result<SourceRow>> + Send>;

pub struct SourceRows {
    pub name: String,
    pub headers: Vec<String>,
    pub rows: RowIter,
}

impl SourceRows {
    pub fn from_rows(name: &str, headers: Vec<String>, rows: Vec<SourceRow>) -> Self {
        Self {
            name: name.to_string(),
            headers,
            rows: Box::new(rows.into_iter().map(Ok)),
        }
    }
}

fn cell(raw: &str) -> Option<String> {
    (!raw.is_empty()).then(|| raw.to_string())
}

/// Decode by extension: `.parquet` through the Arrow reader, anything else as
/// CSV with a header row.
pub fn decode(location: &str, bytes: Vec<u8>) -> Result<SourceRows> {
    if location.to_ascii_lowercase().ends_with(".parquet") {
        decode_parquet(location, bytes)
    } else {
        decode_csv(location, bytes)
    }
}

pub fn decode_csv(name: &str, bytes: Vec<u8>) -> Result<SourceRows> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(Cursor::new(bytes));
    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();
    if headers.is_empty() {
        return Err(Error::Validation(format!("`{}` has no header row", name)));
    }

    let rows = reader.into_records().map(|record| {
        let record = record?;
        Ok(SourceRow {
            values: record.iter().map(cell).collect(),
        })
    });

    Ok(SourceRows {
        name: name.to_string(),
        headers,
        rows: Box::new(rows),
    })
}

pub fn decode_parquet(name: &str, bytes: Vec<u8>) -> Result<SourceRows> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(bytes))?;
    let headers: Vec<String> = builder
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();
    let reader = builder.with_batch_size(8192).build()?;

    let rows = reader.flat_map(|batch| match batch {
        Ok(batch) => batch_rows(&batch),
        Err(e) => vec![Err(Error::from(e))],
    });

    Ok(SourceRows {
        name: name.to_string(),
        headers,
        rows: Box::new(rows),
    })
}

fn batch_rows(batch: &RecordBatch) -> Vec<Result<SourceRow>> {
    let columns: Result<Vec<ArrayRef>> = batch
        .columns()
        .iter()
        .map(|col| match col.data_type() {
            DataType::Utf8 => Ok(Arc::clone(col)),
            _ => Ok(cast(col, &DataType::Utf8)?),
        })
        .collect();
    let columns = match columns {
        Ok(c) => c,
        Err(e) => return vec![Err(e)],
    };

    let mut strings = Vec::with_capacity(columns.len());
    for col in &columns {
        match col.as_any().downcast_ref::<StringArray>() {
            Some(s) => strings.push(s),
            None => {
                return vec![Err(Error::Validation(format!(
                    "column of type {} could not be read as text",
                    col.data_type()
                )))]
            }
        }
    }

    (0..batch.num_rows())
        .map(|i| {
            Ok(SourceRow {
                values: strings
                    .iter()
                    .map(|s| if s.is_null(i) { None } else { cell(s.value(i)) })
                    .collect(),
            })
        })
        .collect()
}

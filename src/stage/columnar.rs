use std::sync::Arc;

use arrow::array::{ArrayRef, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use crate::error::{Error, Result};

const BATCH_ROWS: usize = 8192;

/// Re-encode a headed CSV as SNAPPY Parquet. Every column is nullable Utf8;
/// empty cells become nulls.
pub fn csv_to_parquet(csv_bytes: &[u8]) -> Result<Vec<u8>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(csv_bytes);
    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();
    if headers.is_empty() {
        return Err(Error::Validation("csv has no header row".into()));
    }

    let schema: SchemaRef = Arc::new(Schema::new(
        headers
            .iter()
            .map(|h| Field::new(h, DataType::Utf8, true))
            .collect::<Vec<_>>(),
    ));
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let mut out = Vec::new();
    {
        let mut writer = ArrowWriter::try_new(&mut out, schema.clone(), Some(props))?;
        let mut columns: Vec<Vec<Option<String>>> = vec![Vec::with_capacity(BATCH_ROWS); headers.len()];
        let mut buffered = 0usize;

        for record in reader.records() {
            let record = record?;
            for (column, value) in columns.iter_mut().zip(record.iter()) {
                column.push((!value.is_empty()).then(|| value.to_string()));
            }
            buffered += 1;
            if buffered == BATCH_ROWS {
                flush(&mut writer, &schema, &mut columns)?;
                buffered = 0;
            }
        }
        if buffered > 0 {
            flush(&mut writer, &schema, &mut columns)?;
        }
        writer.close()?;
    }
    Ok(out)
}

fn flush(
    writer: &mut ArrowWriter<&mut Vec<u8>>,
    schema: &SchemaRef,
    columns: &mut [Vec<Option<String>>],
) -> Result<()> {
    let arrays: Vec<ArrayRef> = columns
        .iter_mut()
        .map(|c| Arc::new(StringArray::from(std::mem::take(c))) as ArrayRef)
        .collect();
    let batch = RecordBatch::try_new(schema.clone(), arrays)?;
    writer.write(&batch)?;
    Ok(())
}

//! Streaming NDJSON writer.

use std::fs::File;
use std::io::{BufWriter, Write};

use gpujoin_core::types::{Row, RowBatch};

use super::scalar_to_json;
use crate::error::Result;

pub struct JsonlWriter<W: Write> {
    writer: BufWriter<W>,
    columns: Vec<String>,
    rows_written: u64,
}

impl JsonlWriter<File> {
    pub fn create(path: &str, columns: Vec<String>) -> Result<Self> {
        Ok(Self::new(File::create(path)?, columns))
    }
}

impl<W: Write> JsonlWriter<W> {
    pub fn new(writer: W, columns: Vec<String>) -> Self {
        Self {
            writer: BufWriter::new(writer),
            columns,
            rows_written: 0,
        }
    }

    /// One JSON object per row, keys in column order.
    pub fn write_row(&mut self, row: &[gpujoin_core::types::Scalar]) -> Result<()> {
        let obj: serde_json::Map<String, serde_json::Value> = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let v = row.get(i).map(scalar_to_json).unwrap_or(serde_json::Value::Null);
                (name.clone(), v)
            })
            .collect();
        serde_json::to_writer(&mut self.writer, &obj)?;
        self.writer.write_all(b"\n")?;
        self.rows_written += 1;
        Ok(())
    }

    pub fn write_rows(&mut self, rows: &[Row]) -> Result<()> {
        rows.iter().try_for_each(|r| self.write_row(r))
    }

    pub fn write_batch(&mut self, batch: &RowBatch) -> Result<()> {
        if self.columns.is_empty() {
            self.columns = batch.columns.iter().map(|c| c.name.clone()).collect();
        }
        (0..batch.num_rows()).try_for_each(|r| self.write_row(&batch.row(r)))
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn finish(mut self) -> Result<W> {
        self.writer.flush()?;
        self.writer
            .into_inner()
            .map_err(|e| crate::error::Error::Io(e.into_error()))
    }
}

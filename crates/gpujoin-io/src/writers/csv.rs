//! CSV result writer.

use std::io::Write;

use gpujoin_core::types::{Row, Scalar};

use super::scalar_to_field;
use crate::error::{Error, Result};

pub struct CsvWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> CsvWriter<W> {
    /// Writes the header line immediately.
    pub fn new(writer: W, columns: &[String]) -> Result<Self> {
        let mut writer = csv::Writer::from_writer(writer);
        writer.write_record(columns)?;
        Ok(Self { writer })
    }

    pub fn write_row(&mut self, row: &[Scalar]) -> Result<()> {
        self.writer
            .write_record(row.iter().map(scalar_to_field))?;
        Ok(())
    }

    pub fn write_rows(&mut self, rows: &[Row]) -> Result<()> {
        rows.iter().try_for_each(|r| self.write_row(r))
    }

    pub fn finish(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))
    }
}

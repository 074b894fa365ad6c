//! CSV row source typed by a [`Schema`].

use std::fs::File;
use std::path::{Path, PathBuf};

use gpujoin_core::schema::{DataType, Schema};
use gpujoin_core::source::RowSource;
use gpujoin_core::types::{Row, Scalar};

use crate::error::{Error, Result};

/// Reads a CSV file row by row, converting every field to the type its
/// schema column declares. An empty field is NULL.
pub struct CsvSource {
    path: PathBuf,
    schema: Schema,
    has_headers: bool,
    reader: csv::Reader<File>,
    record: csv::StringRecord,
}

impl CsvSource {
    pub fn open(path: impl AsRef<Path>, schema: Schema, has_headers: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let reader = open_reader(&path, has_headers)?;
        Ok(Self {
            path,
            schema,
            has_headers,
            reader,
            record: csv::StringRecord::new(),
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    fn read_typed(&mut self) -> Result<Option<Row>> {
        if !self.reader.read_record(&mut self.record)? {
            return Ok(None);
        }
        let line = self.record.position().map(|p| p.line()).unwrap_or(0);
        if self.record.len() != self.schema.len() {
            return Err(Error::Parse {
                line,
                column: String::new(),
                reason: format!(
                    "expected {} fields, found {}",
                    self.schema.len(),
                    self.record.len()
                ),
            });
        }
        self.schema
            .fields
            .iter()
            .zip(self.record.iter())
            .map(|(field, raw)| {
                parse_field(field.data_type, raw).map_err(|reason| Error::Parse {
                    line,
                    column: field.name.clone(),
                    reason,
                })
            })
            .collect::<Result<Row>>()
            .map(Some)
    }
}

fn open_reader(path: &Path, has_headers: bool) -> Result<csv::Reader<File>> {
    let file = File::open(path)?;
    Ok(csv::ReaderBuilder::new()
        .has_headers(has_headers)
        .trim(csv::Trim::All)
        .from_reader(file))
}

/// Convert one CSV field; the error is a human-readable reason.
pub fn parse_field(data_type: DataType, raw: &str) -> std::result::Result<Scalar, String> {
    if raw.is_empty() {
        return Ok(Scalar::Null);
    }
    let bad = |e: &dyn std::fmt::Display| format!("'{raw}' is not {data_type:?}: {e}");
    Ok(match data_type {
        DataType::Boolean => match raw.to_ascii_lowercase().as_str() {
            "true" | "t" | "1" => Scalar::Bool(true),
            "false" | "f" | "0" => Scalar::Bool(false),
            _ => return Err(bad(&"expected true/false")),
        },
        DataType::Int32 => Scalar::I32(raw.parse().map_err(|e| bad(&e))?),
        DataType::Int64 => Scalar::I64(raw.parse().map_err(|e| bad(&e))?),
        DataType::Float32 => Scalar::F32(raw.parse().map_err(|e| bad(&e))?),
        DataType::Float64 => Scalar::F64(raw.parse().map_err(|e| bad(&e))?),
        DataType::Utf8 => Scalar::Str(raw.to_string()),
        DataType::Binary => Scalar::Bin(raw.as_bytes().to_vec()),
    })
}

impl RowSource for CsvSource {
    fn next_row(&mut self) -> gpujoin_core::error::Result<Option<Row>> {
        Ok(self.read_typed()?)
    }

    fn rewind(&mut self) -> gpujoin_core::error::Result<()> {
        self.reader = open_reader(&self.path, self.has_headers)?;
        Ok(())
    }
}

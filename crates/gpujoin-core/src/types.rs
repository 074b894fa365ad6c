//! Scalar values, rows, and the compact byte encoding used inside chunks.
//!
//! Rows travel through the engine as `Vec<Scalar>`. Whenever rows are placed
//! into a device image they are encoded with [`encode_row`], a tagged,
//! little-endian format that never depends on in-memory struct layout.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::schema::DataType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Null,
    Bool(bool),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Str(String),
    Bin(Vec<u8>),
}

/// One tuple; column `i` of the producing relation at index `i`.
pub type Row = Vec<Scalar>;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_I32: u8 = 2;
const TAG_I64: u8 = 3;
const TAG_F32: u8 = 4;
const TAG_F64: u8 = 5;
const TAG_STR: u8 = 6;
const TAG_BIN: u8 = 7;

impl Scalar {
    pub fn data_type(&self) -> DataType {
        match self {
            Scalar::Null => DataType::Utf8,
            Scalar::Bool(_) => DataType::Boolean,
            Scalar::I32(_) => DataType::Int32,
            Scalar::I64(_) => DataType::Int64,
            Scalar::F32(_) => DataType::Float32,
            Scalar::F64(_) => DataType::Float64,
            Scalar::Str(_) => DataType::Utf8,
            Scalar::Bin(_) => DataType::Binary,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    /// Bytes this value occupies in the chunk encoding.
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Scalar::Null => 0,
            Scalar::Bool(_) => 1,
            Scalar::I32(_) | Scalar::F32(_) => 4,
            Scalar::I64(_) | Scalar::F64(_) => 8,
            Scalar::Str(s) => 4 + s.len(),
            Scalar::Bin(b) => 4 + b.len(),
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Scalar::Null => out.push(TAG_NULL),
            Scalar::Bool(b) => {
                out.push(TAG_BOOL);
                out.push(*b as u8);
            }
            Scalar::I32(v) => {
                out.push(TAG_I32);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Scalar::I64(v) => {
                out.push(TAG_I64);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Scalar::F32(v) => {
                out.push(TAG_F32);
                out.extend_from_slice(&v.to_bits().to_le_bytes());
            }
            Scalar::F64(v) => {
                out.push(TAG_F64);
                out.extend_from_slice(&v.to_bits().to_le_bytes());
            }
            Scalar::Str(s) => {
                out.push(TAG_STR);
                out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Scalar::Bin(b) => {
                out.push(TAG_BIN);
                out.extend_from_slice(&(b.len() as u32).to_le_bytes());
                out.extend_from_slice(b);
            }
        }
    }

    /// Decode one value starting at `pos`; returns the value and the next offset.
    pub fn decode(buf: &[u8], pos: usize) -> Result<(Scalar, usize)> {
        let tag = *buf.get(pos).ok_or_else(|| short(pos))?;
        let body = pos + 1;
        let value = match tag {
            TAG_NULL => return Ok((Scalar::Null, body)),
            TAG_BOOL => {
                let b = *buf.get(body).ok_or_else(|| short(body))?;
                return Ok((Scalar::Bool(b != 0), body + 1));
            }
            TAG_I32 => (Scalar::I32(i32::from_le_bytes(take::<4>(buf, body)?)), body + 4),
            TAG_I64 => (Scalar::I64(i64::from_le_bytes(take::<8>(buf, body)?)), body + 8),
            TAG_F32 => (
                Scalar::F32(f32::from_bits(u32::from_le_bytes(take::<4>(buf, body)?))),
                body + 4,
            ),
            TAG_F64 => (
                Scalar::F64(f64::from_bits(u64::from_le_bytes(take::<8>(buf, body)?))),
                body + 8,
            ),
            TAG_STR | TAG_BIN => {
                let len = u32::from_le_bytes(take::<4>(buf, body)?) as usize;
                let start = body + 4;
                let bytes = buf.get(start..start + len).ok_or_else(|| short(start))?;
                let v = if tag == TAG_STR {
                    let s = std::str::from_utf8(bytes).map_err(|e| Error::Decode {
                        offset: start,
                        reason: e.to_string(),
                    })?;
                    Scalar::Str(s.to_string())
                } else {
                    Scalar::Bin(bytes.to_vec())
                };
                (v, start + len)
            }
            other => {
                return Err(Error::Decode {
                    offset: pos,
                    reason: format!("unknown scalar tag {other}"),
                })
            }
        };
        Ok(value)
    }

    /// SQL comparison: `None` when either side is NULL or the types are not
    /// comparable. Integers and floats compare across widths.
    pub fn sql_cmp(&self, other: &Scalar) -> Option<Ordering> {
        use Scalar::*;
        match (self, other) {
            (Null, _) | (_, Null) => None,
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (Str(a), Str(b)) => Some(a.cmp(b)),
            (Bin(a), Bin(b)) => Some(a.cmp(b)),
            _ => match (self.as_i64(), other.as_i64()) {
                (Some(a), Some(b)) => Some(a.cmp(&b)),
                _ => {
                    let (a, b) = (self.as_f64()?, other.as_f64()?);
                    a.partial_cmp(&b)
                }
            },
        }
    }

    pub fn sql_eq(&self, other: &Scalar) -> Option<bool> {
        self.sql_cmp(other).map(|o| o == Ordering::Equal)
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::I32(v) => Some(*v as i64),
            Scalar::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub(crate) fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::I32(v) => Some(*v as f64),
            Scalar::I64(v) => Some(*v as f64),
            Scalar::F32(v) => Some(*v as f64),
            Scalar::F64(v) => Some(*v),
            _ => None,
        }
    }
}

fn short(offset: usize) -> Error {
    Error::Decode {
        offset,
        reason: "truncated value".into(),
    }
}

fn take<const N: usize>(buf: &[u8], pos: usize) -> Result<[u8; N]> {
    buf.get(pos..pos + N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| short(pos))
}

/// Encoded size of a whole row: a `u16` column count followed by the values.
pub fn encoded_row_len(row: &[Scalar]) -> usize {
    2 + row.iter().map(Scalar::encoded_len).sum::<usize>()
}

pub fn encode_row(row: &[Scalar], out: &mut Vec<u8>) {
    out.extend_from_slice(&(row.len() as u16).to_le_bytes());
    for v in row {
        v.encode_into(out);
    }
}

/// Decode a row written by [`encode_row`] at `pos`.
pub fn decode_row(buf: &[u8], pos: usize) -> Result<(Row, usize)> {
    let ncols = u16::from_le_bytes(take::<2>(buf, pos)?) as usize;
    let mut row = Vec::with_capacity(ncols);
    let mut cur = pos + 2;
    for _ in 0..ncols {
        let (v, next) = Scalar::decode(buf, cur)?;
        row.push(v);
        cur = next;
    }
    Ok((row, cur))
}

/// Minimal column representation used by bulk (slot-format) results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub values: Vec<Scalar>,
}

impl Column {
    pub fn len(&self) -> usize {
        self.values.len()
    }
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Columnar batch of rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowBatch {
    pub columns: Vec<Column>,
}

impl RowBatch {
    pub fn num_rows(&self) -> usize {
        self.columns.first().map(|c| c.len()).unwrap_or(0)
    }

    /// Transpose rows into columns named by `names`.
    pub fn from_rows(names: &[String], rows: &[Row]) -> RowBatch {
        let mut columns: Vec<Column> = names
            .iter()
            .map(|n| Column {
                name: n.clone(),
                values: Vec::with_capacity(rows.len()),
            })
            .collect();
        for row in rows {
            for (ci, col) in columns.iter_mut().enumerate() {
                col.values.push(row.get(ci).cloned().unwrap_or(Scalar::Null));
            }
        }
        RowBatch { columns }
    }

    /// Row `idx` as an owned tuple.
    pub fn row(&self, idx: usize) -> Row {
        self.columns
            .iter()
            .map(|c| c.values.get(idx).cloned().unwrap_or(Scalar::Null))
            .collect()
    }
}

/// Compare two scalar tuples lexicographically (total order, NULLs first).
pub fn scalar_tuple_cmp(a: &[Scalar], b: &[Scalar]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        match scalar_cmp(x, y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

/// Total order over scalars for sorting.
///
/// Nulls are sorted first, NaN after every other float; mixed types order by
/// variant.
pub fn scalar_cmp(a: &Scalar, b: &Scalar) -> Ordering {
    use Scalar::*;

    match (a, b) {
        (Null, Null) => Ordering::Equal,
        (Null, _) => Ordering::Less,
        (_, Null) => Ordering::Greater,
        (Bool(x), Bool(y)) => x.cmp(y),
        (I32(x), I32(y)) => x.cmp(y),
        (I64(x), I64(y)) => x.cmp(y),
        (F32(x), F32(y)) => float_cmp(*x as f64, *y as f64),
        (F64(x), F64(y)) => float_cmp(*x, *y),
        (Str(x), Str(y)) => x.cmp(y),
        (Bin(x), Bin(y)) => x.cmp(y),
        _ => scalar_type_order(a).cmp(&scalar_type_order(b)),
    }
}

fn float_cmp(x: f64, y: f64) -> Ordering {
    match (x.is_nan(), y.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        _ => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
    }
}

fn scalar_type_order(s: &Scalar) -> u8 {
    use Scalar::*;
    match s {
        Null => TAG_NULL,
        Bool(_) => TAG_BOOL,
        I32(_) => TAG_I32,
        I64(_) => TAG_I64,
        F32(_) => TAG_F32,
        F64(_) => TAG_F64,
        Str(_) => TAG_STR,
        Bin(_) => TAG_BIN,
    }
}

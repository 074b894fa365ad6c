//! Row producers feeding a join.
//!
//! The outer relation and every inner relation are read through
//! [`RowSource`]. A source must be rewindable: the outer relation is
//! re-scanned once per inner window, and every relation on rescan.

use crate::error::Result;
use crate::types::Row;

pub trait RowSource: Send {
    /// Next row, or `None` at end of input.
    fn next_row(&mut self) -> Result<Option<Row>>;

    /// Restart from the first row.
    fn rewind(&mut self) -> Result<()>;

    /// Up to `max_rows` rows; an empty vector means end of input.
    fn next_chunk(&mut self, max_rows: usize) -> Result<Vec<Row>> {
        let mut out = Vec::with_capacity(max_rows.min(1024));
        while out.len() < max_rows {
            match self.next_row()? {
                Some(row) => out.push(row),
                None => break,
            }
        }
        Ok(out)
    }
}

impl<S: RowSource + ?Sized> RowSource for Box<S> {
    fn next_row(&mut self) -> Result<Option<Row>> {
        (**self).next_row()
    }

    fn rewind(&mut self) -> Result<()> {
        (**self).rewind()
    }

    fn next_chunk(&mut self, max_rows: usize) -> Result<Vec<Row>> {
        (**self).next_chunk(max_rows)
    }
}

/// In-memory source over owned rows.
#[derive(Debug, Clone, Default)]
pub struct VecSource {
    rows: Vec<Row>,
    pos: usize,
    rewinds: usize,
}

impl VecSource {
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows,
            pos: 0,
            rewinds: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Times [`RowSource::rewind`] was called.
    pub fn rewinds(&self) -> usize {
        self.rewinds
    }
}

impl RowSource for VecSource {
    fn next_row(&mut self) -> Result<Option<Row>> {
        let row = self.rows.get(self.pos).cloned();
        if row.is_some() {
            self.pos += 1;
        }
        Ok(row)
    }

    fn rewind(&mut self) -> Result<()> {
        self.pos = 0;
        self.rewinds += 1;
        Ok(())
    }

    fn next_chunk(&mut self, max_rows: usize) -> Result<Vec<Row>> {
        let end = self.rows.len().min(self.pos.saturating_add(max_rows));
        let out = self.rows[self.pos..end].to_vec();
        self.pos = end;
        Ok(out)
    }
}

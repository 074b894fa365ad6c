//! Rewindable row sources over files.

pub mod csv;

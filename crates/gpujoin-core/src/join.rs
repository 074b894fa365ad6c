//! Join descriptors shared by the planner and the executor.

use serde::{Deserialize, Serialize};

/// Join semantics of one depth of the N-way join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
}

impl JoinType {
    /// Unmatched *outer* rows are emitted NULL-extended (LEFT/FULL).
    pub fn is_left_outer(self) -> bool {
        matches!(self, JoinType::Left | JoinType::Full)
    }

    /// Unmatched *inner* rows are emitted NULL-extended (RIGHT/FULL); these
    /// depths carry an outer-join bitmap.
    pub fn is_right_outer(self) -> bool {
        matches!(self, JoinType::Right | JoinType::Full)
    }

    /// Whether a hash depth must be split by hash range instead of row order.
    pub fn needs_hash_partitioning(self) -> bool {
        self.is_left_outer()
    }

    pub fn label(self) -> &'static str {
        match self {
            JoinType::Inner => "",
            JoinType::Left => "Left",
            JoinType::Right => "Right",
            JoinType::Full => "Full",
        }
    }
}

/// Probe strategy of a depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinMethod {
    NestLoop,
    Hash,
}

impl JoinMethod {
    pub fn label(self) -> &'static str {
        match self {
            JoinMethod::NestLoop => "GpuNestLoop",
            JoinMethod::Hash => "GpuHashJoin",
        }
    }
}

/// Format of the destination chunk, chosen once per query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ResultFormat {
    /// Length-bounded tuple heap; capacity is counted in bytes.
    #[default]
    Row,
    /// Fixed number of row slots; capacity is counted in rows.
    Slot,
}

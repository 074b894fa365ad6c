//! The validated plan a GpuJoin executes.
//!
//! Depths are 1-indexed as in the executor; `depths[d - 1]` describes depth
//! `d`. Depth 0 always means the outer relation.

use serde::{Deserialize, Serialize};

use gpujoin_core::config::JoinConfig;
use gpujoin_core::hash::{hash_serde, Hash256};
use gpujoin_core::join::{JoinMethod, JoinType, ResultFormat};
use gpujoin_core::schema::Schema;

use crate::error::{Error, Result};
use crate::expr::{ColumnRef, Qual};

/// One equi-join key of a hash depth: a column produced by an earlier depth
/// matched against a column of this depth's inner relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashKey {
    pub outer: ColumnRef,
    pub inner_column: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthPlan {
    pub join_type: JoinType,
    pub method: JoinMethod,
    pub inner_schema: Schema,
    /// Equi-join keys (hash depths only).
    #[serde(default)]
    pub hash_keys: Vec<HashKey>,
    /// Remaining join quals, evaluated over depths `0..=d`.
    #[serde(default)]
    pub join_quals: Option<Qual>,
    /// Planned rows surviving this depth per outer input row.
    pub nrows_ratio: f64,
    /// Planned size of one inner chunk (bytes).
    pub ichunk_size: usize,
    /// Planned number of inner chunks.
    pub nbatches_plan: u32,
    /// Planned hash slots of one chunk.
    pub hash_nslots: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionItem {
    pub name: String,
    pub source: ColumnRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinPlan {
    pub outer_schema: Schema,
    pub depths: Vec<DepthPlan>,
    /// Filter applied to outer rows before depth 1.
    #[serde(default)]
    pub outer_quals: Option<Qual>,
    /// Planned fraction of outer rows passing `outer_quals`.
    pub outer_ratio: f64,
    /// Planned number of outer rows.
    pub outer_plan_rows: f64,
    /// Planned number of result rows.
    pub plan_rows: f64,
    pub projection: Vec<ProjectionItem>,
    #[serde(default)]
    pub result_format: ResultFormat,
    /// Average width of one encoded result row; 0 derives it from the schemas.
    #[serde(default)]
    pub result_width: usize,
}

impl JoinPlan {
    pub fn num_rels(&self) -> usize {
        self.depths.len()
    }

    /// Plan of depth `d` (1-indexed).
    pub fn depth(&self, d: usize) -> &DepthPlan {
        &self.depths[d - 1]
    }

    /// First RIGHT/FULL depth, or 1 when the plan has none.
    pub fn outer_join_start_depth(&self) -> usize {
        self.depths
            .iter()
            .position(|dp| dp.join_type.is_right_outer())
            .map(|i| i + 1)
            .unwrap_or(1)
    }

    pub fn has_right_outer(&self) -> bool {
        self.depths.iter().any(|dp| dp.join_type.is_right_outer())
    }

    /// Planned result-index slots per outer row: the widest depth, counting
    /// one slot per participating relation.
    pub fn kresults_ratio(&self) -> f64 {
        self.depths
            .iter()
            .enumerate()
            .map(|(i, dp)| (i + 2) as f64 * dp.nrows_ratio)
            .fold(self.outer_ratio, f64::max)
    }

    /// Planned destination rows per outer row.
    pub fn dst_nrows_ratio(&self) -> f64 {
        self.depths.last().map(|dp| dp.nrows_ratio).unwrap_or(self.outer_ratio)
    }

    /// Schema of the rows contributed by `depth`.
    pub fn schema_of(&self, depth: usize) -> Option<&Schema> {
        if depth == 0 {
            Some(&self.outer_schema)
        } else {
            self.depths.get(depth - 1).map(|dp| &dp.inner_schema)
        }
    }

    pub fn result_names(&self) -> Vec<String> {
        self.projection.iter().map(|p| p.name.clone()).collect()
    }

    /// Average encoded width of a result row.
    pub fn estimated_result_width(&self) -> usize {
        if self.result_width > 0 {
            return self.result_width;
        }
        2 + self
            .projection
            .iter()
            .map(|p| {
                self.schema_of(p.source.depth)
                    .and_then(|s| s.field(p.source.column))
                    .map(|f| f.data_type.typical_width())
                    .unwrap_or(1)
            })
            .sum::<usize>()
    }

    /// Identity of the program compiled from this plan.
    pub fn fingerprint(&self) -> Result<Hash256> {
        Ok(hash_serde(self)?)
    }

    /// Check the structural constraints the executor relies on.
    pub fn validate(&self, config: &JoinConfig) -> Result<()> {
        if self.depths.is_empty() {
            return Err(Error::Invalid("a join needs at least one inner relation".into()));
        }
        if !(self.outer_ratio >= 0.0 && self.outer_plan_rows >= 0.0) {
            return Err(Error::Invalid("planner estimates must be non-negative".into()));
        }
        for (i, dp) in self.depths.iter().enumerate() {
            let depth = i + 1;
            match dp.method {
                JoinMethod::NestLoop => {
                    if !config.enable_nestloop {
                        return Err(Error::MethodDisabled("nest-loop"));
                    }
                    if dp.join_type.is_left_outer() {
                        return Err(Error::Invalid(format!(
                            "nest-loop cannot run {:?} OUTER JOIN at depth {depth}",
                            dp.join_type
                        )));
                    }
                }
                JoinMethod::Hash => {
                    if !config.enable_hashjoin {
                        return Err(Error::MethodDisabled("hash-join"));
                    }
                    if dp.hash_keys.is_empty() {
                        return Err(Error::Invalid(format!(
                            "hash-join at depth {depth} has no hash keys"
                        )));
                    }
                }
            }
            for key in &dp.hash_keys {
                if key.outer.depth >= depth {
                    return Err(Error::Invalid(format!(
                        "hash key at depth {depth} references depth {}",
                        key.outer.depth
                    )));
                }
                self.check_column(key.outer)?;
                self.check_column(ColumnRef::new(depth, key.inner_column))?;
            }
            if let Some(q) = &dp.join_quals {
                for c in q.columns() {
                    if c.depth > depth {
                        return Err(Error::Invalid(format!(
                            "join qual at depth {depth} references later depth {}",
                            c.depth
                        )));
                    }
                    self.check_column(c)?;
                }
            }
            if !(dp.nrows_ratio >= 0.0) || dp.nbatches_plan == 0 {
                return Err(Error::Invalid(format!(
                    "bad planner estimates at depth {depth}"
                )));
            }
        }
        if let Some(q) = &self.outer_quals {
            for c in q.columns() {
                if c.depth != 0 {
                    return Err(Error::Invalid("outer quals may only read the outer relation".into()));
                }
                self.check_column(c)?;
            }
        }
        for p in &self.projection {
            self.check_column(p.source)?;
        }
        Ok(())
    }

    fn check_column(&self, c: ColumnRef) -> Result<()> {
        let schema = self
            .schema_of(c.depth)
            .ok_or_else(|| Error::Invalid(format!("no relation at depth {}", c.depth)))?;
        if c.column >= schema.len() {
            return Err(Error::Invalid(format!(
                "column {} out of range for depth {} ({} columns)",
                c.column,
                c.depth,
                schema.len()
            )));
        }
        Ok(())
    }
}

//! Explain output: planner estimates next to what the join observed.

use std::fmt;

use serde::Serialize;

use gpujoin_core::join::JoinMethod;
use gpujoin_planner::JoinPlan;

use crate::completion::JoinCounters;
use crate::inner::InnerPartitionState;
use crate::sizing::RunStats;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepthExplain {
    pub depth: usize,
    /// `GpuHashJoin` or `GpuNestLoop`, followed by the join type.
    pub label: String,
    pub rows_in: u64,
    pub rows_out: u64,
    /// Rows out per outer row, once any outer row was processed.
    pub ratio_exec: Option<f64>,
    pub ratio_plan: f64,
    /// `KDS-Hash` or `KDS-Heap`.
    pub chunk_format: &'static str,
    /// Largest chunk built for the depth, in bytes.
    pub chunk_size_exec: Option<usize>,
    pub chunk_size_plan: usize,
    pub nbatches_exec: Option<usize>,
    pub nbatches_plan: u32,
    pub inner_rows: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExplainReport {
    pub depths: Vec<DepthExplain>,
    pub outer_ratio_plan: f64,
    pub outer_ratio_exec: Option<f64>,
    pub source_rows: u64,
    pub windows: Option<usize>,
    pub counters: JoinCounters,
}

impl ExplainReport {
    pub fn build(
        plan: &JoinPlan,
        inner: &[InnerPartitionState],
        stats: &RunStats,
        counters: &JoinCounters,
        windows: Option<usize>,
    ) -> Self {
        let count = |i: usize| stats.outer_nitems.get(i).copied().unwrap_or(0);
        let depths = plan
            .depths
            .iter()
            .enumerate()
            .map(|(i, dp)| {
                let depth = i + 1;
                let state = inner.get(i).filter(|s| !s.pds_list.is_empty());
                let join_label = dp.join_type.label();
                let label = if join_label.is_empty() {
                    dp.method.label().to_string()
                } else {
                    format!("{} ({join_label})", dp.method.label())
                };
                DepthExplain {
                    depth,
                    label,
                    rows_in: count(depth - 1),
                    rows_out: count(depth),
                    ratio_exec: stats.observed_ratio(depth),
                    ratio_plan: dp.nrows_ratio,
                    chunk_format: match dp.method {
                        JoinMethod::Hash => "KDS-Hash",
                        JoinMethod::NestLoop => "KDS-Heap",
                    },
                    chunk_size_exec: state
                        .and_then(|s| s.pds_list.iter().map(|c| c.length()).max()),
                    chunk_size_plan: dp.ichunk_size,
                    nbatches_exec: state.map(|s| s.nbatches_exec()),
                    nbatches_plan: dp.nbatches_plan,
                    inner_rows: state.map(|s| s.nrows),
                }
            })
            .collect();
        Self {
            depths,
            outer_ratio_plan: plan.outer_ratio,
            outer_ratio_exec: stats.observed_ratio(0),
            source_rows: stats.source_nitems,
            windows,
            counters: counters.clone(),
        }
    }
}

fn opt<T: fmt::Display>(v: &Option<T>) -> String {
    v.as_ref().map_or_else(|| "-".to_string(), |v| v.to_string())
}

fn opt_ratio(v: Option<f64>) -> String {
    v.map_or_else(|| "-".to_string(), |r| format!("{r:.3}"))
}

impl fmt::Display for ExplainReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "GPU Join")?;
        writeln!(f, "========")?;
        writeln!(
            f,
            "Outer: {} rows, ratio exec {} / plan {:.3}",
            self.source_rows,
            opt_ratio(self.outer_ratio_exec),
            self.outer_ratio_plan
        )?;
        for d in &self.depths {
            writeln!(f)?;
            writeln!(f, "Depth {}: {}", d.depth, d.label)?;
            writeln!(f, "  Rows: in {}, out {}", d.rows_in, d.rows_out)?;
            writeln!(
                f,
                "  Ratio: exec {} / plan {:.3}",
                opt_ratio(d.ratio_exec),
                d.ratio_plan
            )?;
            writeln!(
                f,
                "  {} Size: exec {} / plan {}",
                d.chunk_format,
                opt(&d.chunk_size_exec),
                d.chunk_size_plan
            )?;
            writeln!(
                f,
                "  nBatches: exec {} / plan {}",
                opt(&d.nbatches_exec),
                d.nbatches_plan
            )?;
            if let Some(n) = d.inner_rows {
                writeln!(f, "  Inner rows: {n}")?;
            }
        }
        writeln!(f)?;
        writeln!(
            f,
            "Windows: {} ({} opened), tasks {}, outer-join tasks {}, retries {}, result rows {}",
            opt(&self.windows),
            self.counters.windows,
            self.counters.tasks,
            self.counters.outer_join_tasks,
            self.counters.retries,
            self.counters.result_rows
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpujoin_core::join::JoinType;
    use gpujoin_core::schema::{DataType, Field, Schema};
    use gpujoin_planner::{ColumnRef, DepthPlan, HashKey, ProjectionItem};

    fn plan() -> JoinPlan {
        JoinPlan {
            outer_schema: Schema::new(vec![Field::new("k", DataType::Int64, false)]),
            depths: vec![DepthPlan {
                join_type: JoinType::Right,
                method: JoinMethod::Hash,
                inner_schema: Schema::new(vec![Field::new("k", DataType::Int64, false)]),
                hash_keys: vec![HashKey {
                    outer: ColumnRef::new(0, 0),
                    inner_column: 0,
                }],
                join_quals: None,
                nrows_ratio: 2.0,
                ichunk_size: 4096,
                nbatches_plan: 1,
                hash_nslots: 64,
            }],
            outer_quals: None,
            outer_ratio: 1.0,
            outer_plan_rows: 100.0,
            plan_rows: 200.0,
            projection: vec![ProjectionItem {
                name: "k".into(),
                source: ColumnRef::new(0, 0),
            }],
            result_format: Default::default(),
            result_width: 0,
        }
    }

    #[test]
    fn test_report_before_and_after_rows() {
        let plan = plan();
        let mut stats = RunStats::new(1);
        let before = ExplainReport::build(&plan, &[], &stats, &JoinCounters::default(), None);
        assert_eq!(before.depths[0].label, "GpuHashJoin (Right)");
        assert_eq!(before.depths[0].ratio_exec, None);
        assert_eq!(before.depths[0].chunk_format, "KDS-Hash");
        assert!(before.to_string().contains("nBatches: exec - / plan 1"));

        stats.record(10, &[10, 25]);
        let after = ExplainReport::build(&plan, &[], &stats, &JoinCounters::default(), Some(1));
        assert_eq!(after.depths[0].rows_in, 10);
        assert_eq!(after.depths[0].rows_out, 25);
        assert_eq!(after.depths[0].ratio_exec, Some(2.5));
        let text = after.to_string();
        assert!(text.contains("Ratio: exec 2.500 / plan 2.000"));
        let json = serde_json::to_string(&after).expect("json");
        assert!(json.contains("\"rows_out\":25"));
    }
}

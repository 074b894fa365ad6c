//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use gpujoin::core::prelude::{JoinConfig, Row, RowSource, Scalar, VecSource};
use gpujoin::core::types::scalar_tuple_cmp;
use gpujoin::device::{GpuRuntime, SimDeviceConfig, SimRuntime};
use gpujoin::exec::layout::mrb_head_len;
use gpujoin::exec::{ColumnarChunk, GpuJoin};
use gpujoin::planner::{parse_yaml_join, JoinPlan};

/// One hash depth joining `outer(k, a)` with `i(k, b)` on `k`, projecting
/// all four columns.
pub fn single_depth_yaml(join: &str, method: &str, format: &str) -> String {
    format!(
        r#"
outer:
  source: "outer.csv"
  plan_rows: 100
  schema:
    - {{name: "k", type: "i64", nullable: true}}
    - {{name: "a", type: "Utf8", nullable: true}}
inners:
  - alias: "i"
    source: "inner.csv"
    join: "{join}"
    method: "{method}"
    on: [ {{outer: "outer.k", inner: "k"}} ]
    ichunk_size: 1024
    hash_nslots: 16
    schema:
      - {{name: "k", type: "i64", nullable: true}}
      - {{name: "b", type: "Utf8", nullable: true}}
project: ["outer.k", "outer.a", "i.k", "i.b"]
result_format: "{format}"
"#
    )
}

pub fn single_depth_plan(join: &str) -> JoinPlan {
    parse_yaml_join(&single_depth_yaml(join, "hash", "row"))
        .expect("parse join")
        .plan
}

pub fn config() -> JoinConfig {
    JoinConfig {
        spill_dir: "memory://integration".into(),
        ..JoinConfig::default()
    }
}

/// Small chunks so that tests see many tasks and a low dst floor.
pub fn small_config() -> JoinConfig {
    JoinConfig {
        chunk_size: 4096,
        chunk_size_limit: 1 << 16,
        outer_chunk_rows: 4,
        max_async_tasks: 3,
        ..config()
    }
}

pub fn sim(devices: usize) -> Arc<SimRuntime> {
    Arc::new(SimRuntime::new(SimDeviceConfig::with_devices(devices)))
}

pub fn sim_with_max_alloc(devices: usize, max_alloc_size: usize) -> Arc<SimRuntime> {
    Arc::new(SimRuntime::new(SimDeviceConfig {
        max_alloc_size,
        ..SimDeviceConfig::with_devices(devices)
    }))
}

pub fn as_runtime(sim: &Arc<SimRuntime>) -> Arc<dyn GpuRuntime> {
    Arc::clone(sim) as Arc<dyn GpuRuntime>
}

pub fn source(rows: Vec<Row>) -> Box<dyn RowSource> {
    Box::new(VecSource::new(rows))
}

fn key(k: Option<i64>) -> Scalar {
    k.map_or(Scalar::Null, Scalar::I64)
}

pub fn outer_rows(keys: &[Option<i64>]) -> Vec<Row> {
    keys.iter()
        .enumerate()
        .map(|(i, k)| vec![key(*k), Scalar::Str(format!("o{i:04}"))])
        .collect()
}

pub fn inner_rows(keys: &[Option<i64>]) -> Vec<Row> {
    keys.iter()
        .enumerate()
        .map(|(i, k)| vec![key(*k), Scalar::Str(format!("i{i:04}"))])
        .collect()
}

pub fn join_of(
    join: &str,
    cfg: JoinConfig,
    runtime: &Arc<SimRuntime>,
    outer: &[Option<i64>],
    inner: &[Option<i64>],
) -> GpuJoin {
    GpuJoin::new(
        single_depth_plan(join),
        cfg,
        as_runtime(runtime),
        source(outer_rows(outer)),
        vec![source(inner_rows(inner))],
    )
    .expect("create join")
}

/// Every result row, pulled one at a time.
pub fn drain(join: &mut GpuJoin) -> Vec<Row> {
    let mut rows = Vec::new();
    while let Some(row) = join.next_row().expect("next row") {
        rows.push(row);
    }
    rows
}

pub fn sorted(mut rows: Vec<Row>) -> Vec<Row> {
    rows.sort_by(|a, b| scalar_tuple_cmp(a, b));
    rows
}

/// One left-deep join step: every `left` row (of `left_width` columns)
/// against every `right` row whose first column equals `left[left_key]`.
pub fn naive_step(
    join: &str,
    left: &[Row],
    left_width: usize,
    left_key: usize,
    right: &[Row],
) -> Vec<Row> {
    let keep_left = matches!(join, "left" | "full");
    let keep_right = matches!(join, "right" | "full");
    let right_width = right.first().map_or(2, Vec::len);
    let nulls = |n: usize| std::iter::repeat(Scalar::Null).take(n);
    let mut right_matched = vec![false; right.len()];
    let mut out = Vec::new();
    for l in left {
        let mut any = false;
        for (j, r) in right.iter().enumerate() {
            if l[left_key].sql_eq(&r[0]) == Some(true) {
                any = true;
                right_matched[j] = true;
                out.push(l.iter().chain(r).cloned().collect());
            }
        }
        if !any && keep_left {
            out.push(l.iter().cloned().chain(nulls(right_width)).collect());
        }
    }
    if keep_right {
        for (r, _) in right.iter().zip(&right_matched).filter(|(_, m)| !**m) {
            out.push(nulls(left_width).chain(r.iter().cloned()).collect());
        }
    }
    out
}

/// Reference nested-loop evaluation of the single-depth join.
const DEPTH_SLACK: usize = 8192;

pub fn per_row() -> usize {
    ColumnarChunk::hash_consumption(&inner_rows(&[Some(0)])[0])
}

/// Allocation limit leaving room for `rows` inner rows across `num_rels`
/// depths.
pub fn max_alloc_for(num_rels: usize, rows: usize) -> usize {
    2 * (mrb_head_len(num_rels) + rows * per_row() + DEPTH_SLACK * num_rels)
}

pub fn naive_join(join: &str, outer: &[Option<i64>], inner: &[Option<i64>]) -> Vec<Row> {
    sorted(naive_step(join, &outer_rows(outer), 2, 0, &inner_rows(inner)))
}

/// `(k, "<tag>NNNN")` rows, for inner relations told apart by their tag.
pub fn tagged_rows(tag: &str, keys: &[Option<i64>]) -> Vec<Row> {
    keys.iter()
        .enumerate()
        .map(|(i, k)| vec![key(*k), Scalar::Str(format!("{tag}{i:04}"))])
        .collect()
}

/// Two hash depths: `h(k, b)` joined on `outer.k`, then `g(k, c)` joined
/// on `second_on` (`outer.k` or `h.k`); every column is projected.
pub fn chain_yaml(first: &str, second: &str, second_on: &str) -> String {
    format!(
        r#"
outer:
  source: "outer.csv"
  plan_rows: 100
  schema:
    - {{name: "k", type: "i64", nullable: true}}
    - {{name: "a", type: "Utf8", nullable: true}}
inners:
  - alias: "h"
    source: "h.csv"
    join: "{first}"
    on: [ {{outer: "outer.k", inner: "k"}} ]
    ichunk_size: 1024
    hash_nslots: 16
    schema:
      - {{name: "k", type: "i64", nullable: true}}
      - {{name: "b", type: "Utf8", nullable: true}}
  - alias: "g"
    source: "g.csv"
    join: "{second}"
    on: [ {{outer: "{second_on}", inner: "k"}} ]
    ichunk_size: 1024
    hash_nslots: 16
    schema:
      - {{name: "k", type: "i64", nullable: true}}
      - {{name: "c", type: "Utf8", nullable: true}}
project: ["outer.k", "outer.a", "h.k", "h.b", "g.k", "g.c"]
"#
    )
}

#[allow(clippy::too_many_arguments)]
pub fn chain_join(
    first: &str,
    second: &str,
    second_on: &str,
    cfg: JoinConfig,
    runtime: &Arc<SimRuntime>,
    outer: &[Option<i64>],
    h: &[Option<i64>],
    g: &[Option<i64>],
) -> GpuJoin {
    let plan = parse_yaml_join(&chain_yaml(first, second, second_on))
        .expect("parse join")
        .plan;
    GpuJoin::new(
        plan,
        cfg,
        as_runtime(runtime),
        source(outer_rows(outer)),
        vec![source(tagged_rows("h", h)), source(tagged_rows("g", g))],
    )
    .expect("create join")
}

/// Reference evaluation of [`chain_yaml`], one depth at a time.
pub fn naive_chain(
    first: &str,
    second: &str,
    second_on: &str,
    outer: &[Option<i64>],
    h: &[Option<i64>],
    g: &[Option<i64>],
) -> Vec<Row> {
    let second_key = match second_on {
        "outer.k" => 0,
        "h.k" => 2,
        other => panic!("no column {other} in the chain"),
    };
    let first_rows = naive_step(first, &outer_rows(outer), 2, 0, &tagged_rows("h", h));
    sorted(naive_step(second, &first_rows, 4, second_key, &tagged_rows("g", g)))
}

pub fn keys(range: std::ops::Range<i64>) -> Vec<Option<i64>> {
    range.map(Some).collect()
}

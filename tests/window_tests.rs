//! Joins whose inner relations do not fit one device allocation.

mod common;

use common::*;

use gpujoin::core::id::DeviceId;
use gpujoin::core::types::{Row, Scalar};
use gpujoin::device::GpuRuntime;
use gpujoin::exec::GpuJoin;
use gpujoin::planner::parse_yaml_join;

fn two_depth_yaml(second_join: &str) -> String {
    format!(
        r#"
outer:
  source: "outer.csv"
  schema:
    - {{name: "k", type: "i64"}}
    - {{name: "a", type: "Utf8"}}
inners:
  - alias: "h"
    source: "h.csv"
    on: [ {{outer: "outer.k", inner: "k"}} ]
    ichunk_size: 1024
    hash_nslots: 16
    schema:
      - {{name: "k", type: "i64"}}
      - {{name: "b", type: "Utf8"}}
  - alias: "g"
    source: "g.csv"
    join: "{second_join}"
    on: [ {{outer: "outer.k", inner: "k"}} ]
    ichunk_size: 1024
    hash_nslots: 16
    schema:
      - {{name: "k", type: "i64"}}
      - {{name: "c", type: "Utf8"}}
project: ["outer.k", "h.b", "g.c"]
"#
    )
}

fn two_depth_join(second_join: &str, max_alloc: usize, outer: &[Option<i64>]) -> GpuJoin {
    let plan = parse_yaml_join(&two_depth_yaml(second_join))
        .expect("parse")
        .plan;
    let rt = sim_with_max_alloc(1, max_alloc);
    GpuJoin::new(
        plan,
        small_config(),
        as_runtime(&rt),
        source(outer_rows(outer)),
        vec![
            source(inner_rows(&keys(0..6))),
            source(inner_rows(&keys(0..6))),
        ],
    )
    .expect("join")
}

#[test]
fn test_inner_join_over_two_windows_matches_naive() {
    let outer: Vec<Option<i64>> = (0..20).map(|i| Some(i % 12)).collect();
    let inner = keys(0..10);
    let rt = sim_with_max_alloc(1, max_alloc_for(1, 7));
    let mut join = join_of("inner", small_config(), &rt, &outer, &inner);
    let got = sorted(drain(&mut join));
    assert_eq!(got, naive_join("inner", &outer, &inner));
    assert_eq!(join.counters().windows, 2);
    let report = join.explain();
    assert_eq!(report.windows, Some(2));
    assert_eq!(report.depths[0].nbatches_exec, Some(2));
}

#[test]
fn test_windows_follow_the_odometer() {
    let outer = keys(0..10);
    let mut join = two_depth_join("inner", max_alloc_for(2, 4), &outer);
    let got = drain(&mut join);
    // Keys 0..6 match once at both depths; 6..10 match nothing.
    assert_eq!(got.len(), 6);
    for row in &got {
        let Scalar::I64(k) = row[0] else {
            panic!("unexpected key {:?}", row[0]);
        };
        assert_eq!(row[1], Scalar::Str(format!("i{k:04}")));
        assert_eq!(row[2], Scalar::Str(format!("i{k:04}")));
    }
    assert_eq!(join.counters().windows, 9);
}

#[test]
fn test_left_join_split_by_hash_range_matches_naive() {
    let outer: Vec<Option<i64>> = (0..120).map(|i| if i % 17 == 0 { None } else { Some(i * 3) }).collect();
    let inner = keys(0..300);
    let rt = sim_with_max_alloc(1, max_alloc_for(1, 100));
    let mut cfg = small_config();
    cfg.outer_chunk_rows = 16;
    let mut join = join_of("left", cfg, &rt, &outer, &inner);
    let got = sorted(drain(&mut join));
    assert_eq!(got, naive_join("left", &outer, &inner));
    assert_eq!(got.len(), outer.len());
    assert!(join.counters().windows >= 3);
    let nbatches = join.explain().depths[0].nbatches_exec;
    assert!(nbatches.is_some_and(|n| n >= 3));
}

#[test]
fn test_right_join_with_another_split_depth_matches_naive() {
    let outer = keys(0..4);
    let inner = keys(0..6);
    let rt = sim_with_max_alloc(1, max_alloc_for(2, 4));
    let mut join = chain_join("inner", "right", "outer.k", small_config(), &rt, &outer, &inner, &inner);
    let got = sorted(drain(&mut join));
    let want = naive_chain("inner", "right", "outer.k", &outer, &inner, &inner);
    assert_eq!(got, want);
    // Four matches plus g's rows 4 and 5, each emitted once.
    assert_eq!(got.len(), 6);
    assert_eq!(join.counters().windows, 9);
    // One outer-join pass per chunk of g, from the windows over h's last
    // chunk.
    assert_eq!(join.counters().outer_join_tasks, 3);
    assert_eq!(rt.mem_used(DeviceId::from_index(0)), 0);
}

#[test]
fn test_unmatched_rows_reach_every_deeper_chunk() {
    // h's unmatched rows feed g through h.k, and g is split too.
    let outer = keys(0..3);
    let inner = keys(0..6);
    let rt = sim_with_max_alloc(1, max_alloc_for(2, 4));
    let mut join = chain_join("right", "inner", "h.k", small_config(), &rt, &outer, &inner, &inner);
    let got = sorted(drain(&mut join));
    assert_eq!(got, naive_chain("right", "inner", "h.k", &outer, &inner, &inner));
    assert_eq!(got.len(), 6);
    assert_eq!(got.iter().filter(|r| r[0].is_null()).count(), 3);
    assert_eq!(join.counters().windows, 9);
}

#[test]
fn test_two_right_depths_across_windows_on_two_devices() {
    let outer: Vec<Option<i64>> = vec![Some(1), Some(4), None, Some(9), Some(4)];
    let h = keys(0..6);
    let g: Vec<Option<i64>> = vec![Some(0), Some(4), Some(5), None, Some(7), Some(2)];
    let rt = sim_with_max_alloc(2, max_alloc_for(2, 4));
    let mut join = chain_join("full", "right", "h.k", small_config(), &rt, &outer, &h, &g);
    let got = sorted(drain(&mut join));
    assert_eq!(got, naive_chain("full", "right", "h.k", &outer, &h, &g));
    assert!(join.counters().windows > 1);
    for d in 0..2 {
        assert_eq!(rt.mem_used(DeviceId::from_index(d)), 0);
    }
}

#[test]
fn test_full_join_split_by_hash_range_under_a_split_depth() {
    let outer: Vec<Option<i64>> = (0..10).map(|i| Some(i * 2)).collect();
    let inner = keys(0..6);
    let rt = sim_with_max_alloc(2, max_alloc_for(2, 4));
    let mut join = chain_join("inner", "full", "h.k", small_config(), &rt, &outer, &inner, &inner);
    let got = sorted(drain(&mut join));
    assert_eq!(got, naive_chain("inner", "full", "h.k", &outer, &inner, &inner));
    let report = join.explain();
    let g_chunks = report.depths[1].nbatches_exec.expect("loaded");
    assert!(g_chunks >= 2);
    assert_eq!(join.counters().outer_join_tasks, g_chunks as u64);
}

#[test]
fn test_rescan_forgets_matches_of_the_previous_scan() {
    let outer = keys(0..4);
    let inner = keys(0..6);
    let rt = sim_with_max_alloc(1, max_alloc_for(2, 4));
    let mut join = chain_join("inner", "right", "outer.k", small_config(), &rt, &outer, &inner, &inner);
    let first = sorted(drain(&mut join));
    join.rescan(false).expect("rescan");
    let second = sorted(drain(&mut join));
    assert_eq!(first, second);
}

#[test]
fn test_right_join_in_one_window_still_works_with_small_limit() {
    let mut join = two_depth_join("right", max_alloc_for(2, 64), &keys(3..9));
    let got: Vec<Row> = drain(&mut join);
    // Keys 3..6 match both depths; 0..3 of g are emitted unmatched.
    assert_eq!(got.len(), 6);
    assert_eq!(got.iter().filter(|r| r[0].is_null()).count(), 3);
    assert_eq!(join.counters().windows, 1);
    assert_eq!(join.counters().outer_join_tasks, 1);
}

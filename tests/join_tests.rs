//! End-to-end joins on the simulated device runtime.

mod common;

use common::*;

use gpujoin::core::id::DeviceId;
use gpujoin::core::types::Scalar;
use gpujoin::device::GpuRuntime;
use gpujoin::exec::{Error, GpuJoin};
use gpujoin::planner::parse_yaml_join;

#[test]
fn test_inner_hash_join_matches_naive() {
    let outer = keys(0..20);
    let inner: Vec<Option<i64>> = (0..30).map(|i| Some(i % 10 * 2)).collect();
    let rt = sim(1);
    let mut join = join_of("inner", small_config(), &rt, &outer, &inner);
    let got = sorted(drain(&mut join));
    assert_eq!(got, naive_join("inner", &outer, &inner));
    // Keys 0, 2, .., 18 appear three times each.
    assert_eq!(got.len(), 30);
    assert!(join.counters().tasks >= 5);
    assert_eq!(join.counters().outer_join_tasks, 0);
}

#[test]
fn test_left_join_null_extends_unmatched_outer_rows() {
    let outer = vec![Some(1), Some(2), None, Some(7)];
    let inner = vec![Some(2), Some(2), Some(3)];
    let rt = sim(1);
    let mut join = join_of("left", small_config(), &rt, &outer, &inner);
    let got = sorted(drain(&mut join));
    assert_eq!(got, naive_join("left", &outer, &inner));
    let extended = got.iter().filter(|r| r[2].is_null()).count();
    assert_eq!(extended, 3);
}

#[test]
fn test_right_join_emits_unmatched_inner_rows_once() {
    let outer = keys(1..4);
    let inner = keys(2..6);
    let rt = sim(1);
    let mut cfg = small_config();
    cfg.outer_chunk_rows = 1;
    let mut join = join_of("right", cfg, &rt, &outer, &inner);
    let got = sorted(drain(&mut join));
    assert_eq!(got, naive_join("right", &outer, &inner));

    let unmatched: Vec<_> = got.iter().filter(|r| r[0].is_null()).collect();
    assert_eq!(unmatched.len(), 2);
    assert_eq!(unmatched[0][2], Scalar::I64(4));
    assert_eq!(unmatched[1][2], Scalar::I64(5));
    assert_eq!(join.counters().outer_join_tasks, 1);
    assert_eq!(join.counters().windows, 1);
}

#[test]
fn test_right_join_with_empty_outer_emits_every_inner_row() {
    let inner = keys(0..5);
    let rt = sim(1);
    let mut join = join_of("right", small_config(), &rt, &[], &inner);
    let got = sorted(drain(&mut join));
    assert_eq!(got.len(), 5);
    assert!(got.iter().all(|r| r[0].is_null() && r[1].is_null()));
    assert_eq!(join.counters().outer_join_tasks, 1);
}

#[test]
fn test_full_join_keeps_both_sides() {
    let outer = vec![Some(1), Some(2), Some(3), None];
    let inner = vec![Some(3), Some(4), None];
    let rt = sim(1);
    let mut join = join_of("full", small_config(), &rt, &outer, &inner);
    let got = sorted(drain(&mut join));
    assert_eq!(got, naive_join("full", &outer, &inner));
    // 1 match, 3 outer-only rows, 2 inner-only rows.
    assert_eq!(got.len(), 6);
}

#[test]
fn test_right_join_over_two_devices_kicks_once() {
    let outer: Vec<Option<i64>> = (0..40).map(|i| Some(i % 13)).collect();
    let inner = keys(0..20);
    let rt = sim(2);
    let mut cfg = small_config();
    cfg.outer_chunk_rows = 3;
    cfg.max_async_tasks = 4;
    let mut join = join_of("right", cfg, &rt, &outer, &inner);
    let got = sorted(drain(&mut join));
    assert_eq!(got, naive_join("right", &outer, &inner));
    assert_eq!(got.iter().filter(|r| r[0].is_null()).count(), 7);
    assert_eq!(join.counters().outer_join_tasks, 1);
    assert!(rt.peak_used(DeviceId::from_index(0)) > 0);
    assert!(rt.peak_used(DeviceId::from_index(1)) > 0);
}

#[test]
fn test_nestloop_depth_with_extra_qual() {
    let yaml = r#"
outer:
  source: "outer.csv"
  schema:
    - {name: "k", type: "i64"}
    - {name: "a", type: "Utf8"}
inners:
  - alias: "h"
    source: "h.csv"
    on: [ {outer: "outer.k", inner: "k"} ]
    ichunk_size: 1024
    schema:
      - {name: "k", type: "i64"}
      - {name: "b", type: "Utf8"}
  - alias: "n"
    source: "n.csv"
    method: "nestloop"
    where: [ {left: "n.limit", op: ">", right: "h.k"} ]
    ichunk_size: 1024
    schema:
      - {name: "limit", type: "i64"}
project: ["outer.k", "h.b", "n.limit"]
"#;
    let parsed = parse_yaml_join(yaml).expect("parse");
    let outer = outer_rows(&keys(0..6));
    let h = inner_rows(&keys(0..6));
    let n: Vec<_> = [2i64, 4, 6].iter().map(|v| vec![Scalar::I64(*v)]).collect();
    let rt = sim(1);
    let mut join = GpuJoin::new(
        parsed.plan,
        small_config(),
        as_runtime(&rt),
        source(outer),
        vec![source(h), source(n)],
    )
    .expect("join");
    let got = drain(&mut join);
    // k=0,1 pass three limits, k=2,3 pass two, k=4,5 pass one.
    assert_eq!(got.len(), 12);
    for row in &got {
        match (&row[0], &row[2]) {
            (Scalar::I64(k), Scalar::I64(limit)) => assert!(limit > k),
            other => panic!("unexpected row {other:?}"),
        }
    }
}

#[test]
fn test_slot_format_matches_row_format() {
    let outer = vec![Some(1), Some(2), Some(3), None, Some(2)];
    let inner = vec![Some(2), Some(3), Some(3), Some(9)];
    let run = |format: &str| {
        let plan = parse_yaml_join(&single_depth_yaml("full", "hash", format))
            .expect("parse")
            .plan;
        let rt = sim(1);
        let mut join = GpuJoin::new(
            plan,
            small_config(),
            as_runtime(&rt),
            source(outer_rows(&outer)),
            vec![source(inner_rows(&inner))],
        )
        .expect("join");
        sorted(drain(&mut join))
    };
    let slot = run("slot");
    assert_eq!(slot, run("row"));
    assert_eq!(slot, naive_join("full", &outer, &inner));
}

#[test]
fn test_result_overflow_is_retried() {
    // The plan expects almost nothing per outer row; every row matches ten.
    let yaml = single_depth_yaml("inner", "hash", "row").replace(
        "ichunk_size: 1024",
        "ichunk_size: 1024\n    nrows_ratio: 0.01",
    );
    let plan = parse_yaml_join(&yaml).expect("parse").plan;
    let outer: Vec<Option<i64>> = (0..8).map(|_| Some(1)).collect();
    let inner: Vec<Option<i64>> = (0..10).map(|_| Some(1)).collect();
    let rt = sim(1);
    let mut cfg = config();
    cfg.outer_chunk_rows = 8;
    let mut join = GpuJoin::new(
        plan,
        cfg,
        as_runtime(&rt),
        source(outer_rows(&outer)),
        vec![source(inner_rows(&inner))],
    )
    .expect("join");
    let got = sorted(drain(&mut join));
    assert_eq!(got.len(), 80);
    assert_eq!(got, naive_join("inner", &outer, &inner));
    assert!(join.counters().retries >= 1);
}

#[test]
fn test_rescan_replays_and_reloads() {
    let outer: Vec<Option<i64>> = (0..12).map(|i| Some(i % 5)).collect();
    let inner = keys(0..4);
    let rt = sim(1);
    let mut join = join_of("left", small_config(), &rt, &outer, &inner);
    let first = sorted(drain(&mut join));

    join.rescan(false).expect("rescan");
    assert_eq!(sorted(drain(&mut join)), first);

    join.rescan(true).expect("rescan with new params");
    assert_eq!(join.stats().source_nitems, 0);
    assert_eq!(sorted(drain(&mut join)), first);
    assert_eq!(first, naive_join("left", &outer, &inner));
}

#[test]
fn test_end_mid_scan_releases_device_memory() {
    let outer: Vec<Option<i64>> = (0..64).map(|i| Some(i % 8)).collect();
    let inner = keys(0..8);
    let rt = sim(2);
    let mut join = join_of("right", small_config(), &rt, &outer, &inner);
    let first = join.next_chunk().expect("first chunk");
    assert!(first.is_some());
    join.end();
    for d in 0..2 {
        let dev = DeviceId::from_index(d);
        assert_eq!(rt.mem_used(dev), 0);
        assert_eq!(rt.live_allocations(dev), 0);
    }
    assert_eq!(rt.live_streams(), 0);
    assert!(join.next_chunk().expect("after end").is_none());
}

#[test]
fn test_device_memory_is_free_after_completion() {
    let outer = keys(0..30);
    let inner = keys(10..50);
    let rt = sim(1);
    let mut join = join_of("full", small_config(), &rt, &outer, &inner);
    let got = drain(&mut join);
    assert_eq!(got.len(), 30 + 20);
    assert_eq!(rt.mem_used(DeviceId::from_index(0)), 0);
    assert_eq!(rt.live_streams(), 0);
}

#[test]
fn test_bulk_pulls_need_bulk_exec() {
    let rt = sim(1);
    let mut join = join_of("inner", small_config(), &rt, &keys(0..4), &keys(0..4));
    assert!(matches!(join.next_batch(), Err(Error::Config(_))));

    let mut cfg = small_config();
    cfg.bulk_exec = true;
    let mut join = join_of("inner", cfg, &rt, &keys(0..4), &keys(0..4));
    let mut rows = 0;
    while let Some(batch) = join.next_batch().expect("batch") {
        assert_eq!(batch.columns.len(), 4);
        assert_eq!(batch.columns[0].name, "outer.k");
        rows += batch.num_rows();
    }
    assert_eq!(rows, 4);
}

#[test]
fn test_explain_reports_plan_and_execution() {
    let rt = sim(1);
    let mut join = join_of("right", small_config(), &rt, &keys(0..10), &keys(5..15));
    let before = join.explain();
    assert_eq!(before.windows, None);
    assert_eq!(before.depths[0].label, "GpuHashJoin (Right)");
    assert_eq!(before.depths[0].ratio_exec, None);

    let rows = drain(&mut join).len();
    assert_eq!(rows, 15);
    let after = join.explain();
    assert_eq!(after.windows, Some(1));
    assert_eq!(after.source_rows, 10);
    assert_eq!(after.depths[0].rows_in, 10);
    assert_eq!(after.depths[0].rows_out, 5);
    assert_eq!(after.depths[0].nbatches_exec, Some(1));
    assert_eq!(after.depths[0].inner_rows, Some(10));
    assert_eq!(after.counters.result_rows, 15);
    let text = after.to_string();
    assert!(text.contains("Depth 1: GpuHashJoin (Right)"));
    assert!(text.contains("KDS-Hash Size"));
}

#[test]
fn test_sorted_results_across_chunks() {
    let outer: Vec<Option<i64>> = (0..25).rev().map(Some).collect();
    let inner = keys(0..25);
    let rt = sim(1);
    let mut join = join_of("inner", small_config(), &rt, &outer, &inner);
    let mut chunks = Vec::new();
    while let Some(chunk) = join.next_chunk().expect("chunk") {
        chunks.push(std::sync::Arc::new(chunk));
    }
    assert!(chunks.len() > 1);
    let rows = gpujoin::exec::sort_chunks(chunks, &[gpujoin::exec::SortKey::desc(0)])
        .expect("sort");
    let ks: Vec<Scalar> = rows.iter().map(|r| r[0].clone()).collect();
    let want: Vec<Scalar> = (0..25).rev().map(Scalar::I64).collect();
    assert_eq!(ks, want);
}

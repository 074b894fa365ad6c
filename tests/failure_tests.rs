//! Device faults, missing entry points and impossible inputs.

mod common;

use std::sync::Arc;

use common::*;

use gpujoin::core::id::DeviceId;
use gpujoin::core::types::Scalar;
use gpujoin::device::{GpuRuntime, SimRuntime};
use gpujoin::exec::kernels::{KERNEL_EXEC_HASHJOIN, KERNEL_OUTER_HASHJOIN, KERNEL_PROJECTION_ROW};
use gpujoin::exec::{Error, GpuJoin, ReferenceProgram};

fn assert_released(rt: &Arc<SimRuntime>, devices: usize) {
    for d in 0..devices {
        let dev = DeviceId::from_index(d);
        assert_eq!(rt.mem_used(dev), 0, "device {d} still holds memory");
        assert_eq!(rt.live_allocations(dev), 0);
    }
    assert_eq!(rt.live_streams(), 0);
}

fn drain_result(join: &mut GpuJoin) -> Result<usize, Error> {
    let mut n = 0;
    while join.next_row()?.is_some() {
        n += 1;
    }
    Ok(n)
}

#[test]
fn test_kernel_fault_aborts_and_releases() {
    let rt = sim(2);
    rt.fault_kernel(KERNEL_EXEC_HASHJOIN);
    let mut join = join_of("inner", small_config(), &rt, &keys(0..16), &keys(0..16));
    let err = drain_result(&mut join).expect_err("kernel fault");
    assert!(matches!(err, Error::Device(_)), "got {err:?}");
    assert_released(&rt, 2);
}

#[test]
fn test_rejected_launch_aborts_and_releases() {
    let rt = sim(1);
    rt.fail_launches_of(KERNEL_PROJECTION_ROW);
    let mut join = join_of("left", small_config(), &rt, &keys(0..8), &keys(0..8));
    assert!(join.next_chunk().is_err());
    assert_released(&rt, 1);
}

#[test]
fn test_exhausted_device_falls_back_to_the_next() {
    let rt = sim(2);
    rt.fail_next_allocs(1);
    let outer = keys(0..12);
    let inner = keys(4..20);
    let mut join = join_of("right", small_config(), &rt, &outer, &inner);
    let got = sorted(drain(&mut join));
    assert_eq!(got, naive_join("right", &outer, &inner));
    assert_released(&rt, 2);
}

#[test]
fn test_exhaustion_with_nothing_running_is_fatal() {
    let rt = sim(1);
    rt.fail_next_allocs(1);
    let mut join = join_of("inner", small_config(), &rt, &keys(0..4), &keys(0..4));
    assert!(matches!(join.next_chunk(), Err(Error::Config(_))));
    assert_released(&rt, 1);
}

#[test]
fn test_missing_outer_join_entry_point() {
    let plan = Arc::new(single_depth_plan("full"));
    let program = ReferenceProgram::compile(Arc::clone(&plan))
        .expect("compile")
        .without(KERNEL_OUTER_HASHJOIN);
    let rt = sim(1);
    let err = GpuJoin::with_program(
        plan,
        small_config(),
        as_runtime(&rt),
        &program,
        source(outer_rows(&keys(0..4))),
        vec![source(inner_rows(&keys(0..4)))],
    )
    .expect_err("missing entry point");
    match err {
        Error::MissingEntryPoint(name) => assert_eq!(name, KERNEL_OUTER_HASHJOIN),
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn test_outer_row_larger_than_a_chunk() {
    let rt = sim(1);
    let mut cfg = small_config();
    cfg.chunk_size = 256;
    cfg.chunk_size_limit = 1 << 16;
    let outer = vec![vec![Scalar::I64(1), Scalar::Str("x".repeat(4096))]];
    let mut join = GpuJoin::new(
        single_depth_plan("inner"),
        cfg,
        as_runtime(&rt),
        source(outer),
        vec![source(inner_rows(&keys(0..4)))],
    )
    .expect("join");
    assert!(matches!(
        join.next_chunk(),
        Err(Error::PartitionImpossible { .. })
    ));
    assert_released(&rt, 1);
}

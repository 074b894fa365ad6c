//! YAML join definitions and CSV-backed joins.

mod common;

use std::path::PathBuf;

use common::*;

use gpujoin::core::join::{JoinMethod, JoinType};
use gpujoin::core::source::RowSource;
use gpujoin::core::types::Scalar;
use gpujoin::exec::{Error, GpuJoin};
use gpujoin::io::CsvSource;
use gpujoin::planner::{parse_yaml_join, Error as PlanError};

const TWO_DEPTHS: &str = r#"
outer:
  source: "orders.csv"
  plan_rows: 1000
  schema:
    - {name: "id", type: "i64"}
    - {name: "cust", type: "i64"}
    - {name: "item", type: "i64", nullable: true}
inners:
  - alias: "c"
    source: "customers.csv"
    join: "left"
    on: [ {outer: "outer.cust", inner: "id"} ]
    nrows_ratio: 1.0
    schema:
      - {name: "id", type: "i64"}
      - {name: "name", type: "Utf8", nullable: true}
  - alias: "p"
    source: "items.csv"
    join: "full"
    on: [ {outer: "outer.item", inner: "id"} ]
    schema:
      - {name: "id", type: "i64"}
      - {name: "price", type: "f64"}
project: ["outer.id", "c.name", "p.price"]
config:
  outer_chunk_rows: 2
"#;

fn write_tmp(name: &str, body: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("gpujoin-{}-{name}", std::process::id()));
    std::fs::write(&path, body).expect("write temp file");
    path
}

#[test]
fn test_parse_two_depth_join() {
    let parsed = parse_yaml_join(TWO_DEPTHS).expect("parse");
    let plan = &parsed.plan;
    assert_eq!(plan.num_rels(), 2);
    assert_eq!(plan.depth(1).join_type, JoinType::Left);
    assert_eq!(plan.depth(2).join_type, JoinType::Full);
    assert_eq!(plan.depth(2).method, JoinMethod::Hash);
    assert_eq!(plan.projection.len(), 3);
    assert_eq!(plan.projection[1].name, "c.name");
    assert_eq!(parsed.inners[1].alias, "p");
    assert_eq!(parsed.inners[0].source, "customers.csv");
    assert_eq!(parsed.config.outer_chunk_rows, Some(2));
}

#[test]
fn test_malformed_yaml_is_rejected() {
    let err = parse_yaml_join("outer: [unclosed").expect_err("bad yaml");
    assert!(matches!(err, PlanError::Yaml(_)));
}

#[test]
fn test_unknown_join_type_is_rejected() {
    let yaml = TWO_DEPTHS.replace("join: \"left\"", "join: \"semi\"");
    let err = parse_yaml_join(&yaml).expect_err("unknown join type");
    assert!(err.to_string().contains("unknown join type 'semi'"));
}

#[test]
fn test_bad_column_reference_is_rejected() {
    let yaml = TWO_DEPTHS.replace("\"c.name\"", "\"c.missing\"");
    assert!(matches!(parse_yaml_join(&yaml), Err(PlanError::Invalid(_))));

    let yaml = TWO_DEPTHS.replace("\"outer.cust\"", "\"z.cust\"");
    let err = parse_yaml_join(&yaml).expect_err("unknown relation");
    assert!(err.to_string().contains("unknown relation 'z'"));
}

#[test]
fn test_nestloop_left_join_is_rejected_at_open() {
    let plan = parse_yaml_join(&single_depth_yaml("left", "nestloop", "row"))
        .expect("parse")
        .plan;
    let rt = sim(1);
    let err = GpuJoin::new(
        plan,
        small_config(),
        as_runtime(&rt),
        source(Vec::new()),
        vec![source(Vec::new())],
    )
    .expect_err("nest-loop cannot run LEFT");
    assert!(matches!(err, Error::Plan(PlanError::Invalid(_))));
}

#[test]
fn test_join_over_csv_files() {
    let orders = write_tmp(
        "orders.csv",
        "id,cust,item\n1,10,100\n2,11,\n3,12,101\n4,10,100\n",
    );
    let customers = write_tmp("customers.csv", "id,name\n10,ann\n11,\n13,cid\n");
    let items = write_tmp("items.csv", "id,price\n100,2.5\n102,9.0\n");

    let parsed = parse_yaml_join(TWO_DEPTHS).expect("parse");
    let open = |path: &PathBuf, idx: usize| -> Box<dyn RowSource> {
        Box::new(CsvSource::open(path, parsed.inners[idx].schema.clone(), true).expect("open csv"))
    };
    let outer = CsvSource::open(&orders, parsed.outer.schema.clone(), true).expect("open csv");
    let inners = vec![open(&customers, 0), open(&items, 1)];

    let rt = sim(1);
    let mut join = GpuJoin::new(parsed.plan, small_config(), as_runtime(&rt), Box::new(outer), inners)
        .expect("join");
    let got = sorted(drain(&mut join));

    let name = |s: &str| Scalar::Str(s.into());
    let want = sorted(vec![
        vec![Scalar::I64(1), name("ann"), Scalar::F64(2.5)],
        vec![Scalar::I64(2), Scalar::Null, Scalar::Null],
        vec![Scalar::I64(3), Scalar::Null, Scalar::Null],
        vec![Scalar::I64(4), name("ann"), Scalar::F64(2.5)],
        vec![Scalar::Null, Scalar::Null, Scalar::F64(9.0)],
    ]);
    assert_eq!(got, want);

    for path in [orders, customers, items] {
        let _ = std::fs::remove_file(path);
    }
}

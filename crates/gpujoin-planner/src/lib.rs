#![forbid(unsafe_code)]
//! gpujoin-planner: the plan-time inputs of a GpuJoin.
//!
//! The cost model and path search are out of scope; this crate only carries
//! their *results* (per-depth join type, method, keys, quals, planner
//! estimates, projection) in a validated [`JoinPlan`], plus a small YAML DSL
//! used by the CLI and tests to describe one.

pub mod dsl;
pub mod error;
pub mod expr;
pub mod plan;

pub use dsl::yaml::{parse_yaml_join, ConfigOverrides, JoinSpec, ParsedJoin, RelationSpec};
pub use error::{Error, Result};
pub use expr::{CmpOp, ColumnRef, Operand, Qual};
pub use plan::{DepthPlan, HashKey, JoinPlan, ProjectionItem};

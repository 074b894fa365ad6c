//! Minimal YAML → JoinPlan parser.
//!
//! Example:
//! ```yaml
//! outer:
//!   source: "data/orders.csv"
//!   plan_rows: 10000
//!   schema:
//!     - {name: "id",   type: "i64"}
//!     - {name: "cust", type: "i64"}
//! inners:
//!   - alias: "c"
//!     source: "data/customers.csv"
//!     join: "left"
//!     method: "hash"
//!     on: [ {outer: "outer.cust", inner: "id"} ]
//!     nrows_ratio: 1.0
//!     schema:
//!       - {name: "id",   type: "i64"}
//!       - {name: "name", type: "Utf8", nullable: true}
//! project: ["outer.id", "c.name"]
//! result_format: "row"
//! ```

use serde::{Deserialize, Serialize};

use gpujoin_core::join::{JoinMethod, JoinType, ResultFormat};
use gpujoin_core::schema::{DataType, Field, Schema};
use gpujoin_core::types::Scalar;

use crate::error::{Error, Result};
use crate::expr::{CmpOp, ColumnRef, Operand, Qual};
use crate::plan::{DepthPlan, HashKey, JoinPlan, ProjectionItem};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinSpec {
    pub outer: OuterDef,
    pub inners: Vec<InnerDef>,
    pub project: Vec<String>,
    #[serde(default)]
    pub result_format: Option<String>,
    #[serde(default)]
    pub config: Option<ConfigOverrides>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OuterDef {
    pub source: String,
    pub schema: Vec<FieldDef>,
    #[serde(default)]
    pub plan_rows: Option<f64>,
    #[serde(default, rename = "where")]
    pub filter: Vec<CondDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InnerDef {
    #[serde(default)]
    pub alias: Option<String>,
    pub source: String,
    pub schema: Vec<FieldDef>,
    #[serde(default = "default_join")]
    pub join: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub on: Vec<KeyDef>,
    #[serde(default, rename = "where")]
    pub filter: Vec<CondDef>,
    #[serde(default)]
    pub nrows_ratio: Option<f64>,
    #[serde(default)]
    pub nbatches: Option<u32>,
    #[serde(default)]
    pub ichunk_size: Option<usize>,
    #[serde(default)]
    pub hash_nslots: Option<usize>,
}

fn default_join() -> String {
    "inner".into()
}

fn default_method() -> String {
    "hash".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub nullable: bool,
}

/// `outer` is `relation.column`; `inner` names a column of this depth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyDef {
    pub outer: String,
    pub inner: String,
}

/// `left <op> right`, where `right` is a column reference or, with
/// `value`, a literal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CondDef {
    pub left: String,
    pub op: String,
    #[serde(default)]
    pub right: Option<String>,
    #[serde(default)]
    pub value: Option<serde_yaml::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    pub chunk_size: Option<usize>,
    pub chunk_size_limit: Option<usize>,
    pub chunk_size_margin: Option<f64>,
    pub outer_chunk_rows: Option<usize>,
    pub max_async_tasks: Option<usize>,
    pub spill_dir: Option<String>,
}

/// A data source named by the YAML file.
#[derive(Debug, Clone)]
pub struct RelationSpec {
    pub alias: String,
    pub source: String,
    pub schema: Schema,
}

#[derive(Debug, Clone)]
pub struct ParsedJoin {
    pub plan: JoinPlan,
    pub outer: RelationSpec,
    pub inners: Vec<RelationSpec>,
    pub config: ConfigOverrides,
}

fn to_schema(fields: &[FieldDef]) -> Result<Schema> {
    fields
        .iter()
        .map(|f| {
            let dt = DataType::parse(&f.data_type)
                .ok_or_else(|| Error::Invalid(format!("unknown type '{}'", f.data_type)))?;
            Ok(Field::new(f.name.clone(), dt, f.nullable))
        })
        .collect::<Result<Vec<_>>>()
        .map(Schema::new)
}

struct Scope<'a> {
    relations: Vec<&'a RelationSpec>,
}

impl Scope<'_> {
    fn resolve(&self, text: &str, max_depth: usize) -> Result<ColumnRef> {
        let (rel, col) = text
            .split_once('.')
            .ok_or_else(|| Error::Invalid(format!("column reference '{text}' needs 'relation.column'")))?;
        let depth = self
            .relations
            .iter()
            .position(|r| r.alias == rel)
            .ok_or_else(|| Error::Invalid(format!("unknown relation '{rel}'")))?;
        if depth > max_depth {
            return Err(Error::Invalid(format!(
                "'{text}' is not visible here (depth {depth} > {max_depth})"
            )));
        }
        let column = self.relations[depth]
            .schema
            .index_of(col)
            .ok_or_else(|| Error::Invalid(format!("unknown column '{text}'")))?;
        Ok(ColumnRef::new(depth, column))
    }

    fn conds(&self, conds: &[CondDef], max_depth: usize) -> Result<Option<Qual>> {
        let mut quals = Vec::with_capacity(conds.len());
        for c in conds {
            let op = parse_op(&c.op)?;
            let left = Operand::Column(self.resolve(&c.left, max_depth)?);
            let right = match (&c.right, &c.value) {
                (Some(r), None) => Operand::Column(self.resolve(r, max_depth)?),
                (None, Some(v)) => Operand::Const(yaml_scalar(v)?),
                _ => {
                    return Err(Error::Invalid(format!(
                        "condition on '{}' needs exactly one of 'right' or 'value'",
                        c.left
                    )))
                }
            };
            quals.push(Qual::cmp(op, left, right));
        }
        Ok(match quals.len() {
            0 => None,
            1 => quals.pop(),
            _ => Some(Qual::And(quals)),
        })
    }
}

fn parse_op(s: &str) -> Result<CmpOp> {
    Ok(match s {
        "=" | "==" => CmpOp::Eq,
        "!=" | "<>" => CmpOp::Ne,
        "<" => CmpOp::Lt,
        "<=" => CmpOp::Le,
        ">" => CmpOp::Gt,
        ">=" => CmpOp::Ge,
        other => return Err(Error::Invalid(format!("unknown operator '{other}'"))),
    })
}

fn yaml_scalar(v: &serde_yaml::Value) -> Result<Scalar> {
    use serde_yaml::Value;
    Ok(match v {
        Value::Null => Scalar::Null,
        Value::Bool(b) => Scalar::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Scalar::I64(i),
            None => Scalar::F64(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => Scalar::Str(s.clone()),
        other => return Err(Error::Invalid(format!("unsupported literal {other:?}"))),
    })
}

fn parse_join_type(s: &str) -> Result<JoinType> {
    Ok(match s.to_ascii_lowercase().as_str() {
        "inner" => JoinType::Inner,
        "left" => JoinType::Left,
        "right" => JoinType::Right,
        "full" => JoinType::Full,
        other => return Err(Error::Invalid(format!("unknown join type '{other}'"))),
    })
}

fn parse_method(s: &str) -> Result<JoinMethod> {
    Ok(match s.to_ascii_lowercase().as_str() {
        "hash" | "hashjoin" => JoinMethod::Hash,
        "nestloop" | "nest-loop" | "nl" => JoinMethod::NestLoop,
        other => return Err(Error::Invalid(format!("unknown join method '{other}'"))),
    })
}

/// Parse a YAML join description into a plan plus the relation sources.
///
/// Planner estimates not given in the file default to a 1:1 join over
/// `plan_rows` (or 1000) outer rows.
pub fn parse_yaml_join(yaml_src: &str) -> Result<ParsedJoin> {
    let doc: JoinSpec = serde_yaml::from_str(yaml_src)?;

    let outer = RelationSpec {
        alias: "outer".into(),
        source: doc.outer.source.clone(),
        schema: to_schema(&doc.outer.schema)?,
    };
    let inners = doc
        .inners
        .iter()
        .enumerate()
        .map(|(i, d)| {
            Ok(RelationSpec {
                alias: d.alias.clone().unwrap_or_else(|| format!("inner{}", i + 1)),
                source: d.source.clone(),
                schema: to_schema(&d.schema)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let scope = Scope {
        relations: std::iter::once(&outer).chain(inners.iter()).collect(),
    };

    let mut depths = Vec::with_capacity(doc.inners.len());
    for (i, def) in doc.inners.iter().enumerate() {
        let depth = i + 1;
        let hash_keys = def
            .on
            .iter()
            .map(|k| {
                let outer = scope.resolve(&k.outer, depth - 1)?;
                let inner_column = inners[i]
                    .schema
                    .index_of(&k.inner)
                    .ok_or_else(|| Error::Invalid(format!("unknown inner key column '{}'", k.inner)))?;
                Ok(HashKey { outer, inner_column })
            })
            .collect::<Result<Vec<_>>>()?;
        let method = parse_method(&def.method)?;
        // Nest-loop depths evaluate their equi-keys as ordinary quals.
        let mut join_quals = scope.conds(&def.filter, depth)?;
        if method == JoinMethod::NestLoop && !hash_keys.is_empty() {
            let mut eqs: Vec<Qual> = hash_keys
                .iter()
                .map(|k| Qual::col_eq(k.outer, ColumnRef::new(depth, k.inner_column)))
                .collect();
            eqs.extend(join_quals.take());
            join_quals = Some(if eqs.len() == 1 { eqs.remove(0) } else { Qual::And(eqs) });
        }
        depths.push(DepthPlan {
            join_type: parse_join_type(&def.join)?,
            method,
            inner_schema: inners[i].schema.clone(),
            hash_keys: if method == JoinMethod::Hash { hash_keys } else { Vec::new() },
            join_quals,
            nrows_ratio: def.nrows_ratio.unwrap_or(1.0),
            ichunk_size: def.ichunk_size.unwrap_or(1 << 20),
            nbatches_plan: def.nbatches.unwrap_or(1).max(1),
            hash_nslots: def.hash_nslots.unwrap_or(1024),
        });
    }

    let projection = doc
        .project
        .iter()
        .map(|p| {
            let source = scope.resolve(p, doc.inners.len())?;
            Ok(ProjectionItem {
                name: p.clone(),
                source,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let result_format = match doc.result_format.as_deref() {
        None | Some("row") => ResultFormat::Row,
        Some("slot") => ResultFormat::Slot,
        Some(other) => return Err(Error::Invalid(format!("unknown result format '{other}'"))),
    };

    let outer_plan_rows = doc.outer.plan_rows.unwrap_or(1000.0);
    let plan_rows = outer_plan_rows * depths.last().map(|d| d.nrows_ratio).unwrap_or(1.0);
    let plan = JoinPlan {
        outer_schema: outer.schema.clone(),
        depths,
        outer_quals: scope.conds(&doc.outer.filter, 0)?,
        outer_ratio: 1.0,
        outer_plan_rows,
        plan_rows,
        projection,
        result_format,
        result_width: 0,
    };

    Ok(ParsedJoin {
        plan,
        outer,
        inners,
        config: doc.config.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: &str = r#"
outer:
  source: "orders.csv"
  plan_rows: 500
  schema:
    - {name: "id", type: "i64"}
    - {name: "cust", type: "i64"}
inners:
  - alias: "c"
    source: "customers.csv"
    join: "right"
    on: [ {outer: "outer.cust", inner: "id"} ]
    schema:
      - {name: "id", type: "i64"}
      - {name: "name", type: "Utf8", nullable: true}
  - alias: "r"
    source: "regions.csv"
    method: "nestloop"
    where: [ {left: "c.id", op: "<", right: "r.limit"} ]
    schema:
      - {name: "limit", type: "i64"}
project: ["outer.id", "c.name", "r.limit"]
result_format: "slot"
"#;

    #[test]
    fn test_parse_two_depth_join() {
        let parsed = parse_yaml_join(SRC).expect("parse");
        let plan = &parsed.plan;
        assert_eq!(plan.num_rels(), 2);
        assert_eq!(plan.depth(1).join_type, JoinType::Right);
        assert_eq!(plan.depth(1).hash_keys[0].outer, ColumnRef::new(0, 1));
        assert_eq!(plan.depth(2).method, JoinMethod::NestLoop);
        assert!(plan.depth(2).join_quals.is_some());
        assert_eq!(plan.projection[1].source, ColumnRef::new(1, 1));
        assert_eq!(plan.result_format, ResultFormat::Slot);
        assert_eq!(parsed.inners[1].alias, "r");
        assert_eq!(plan.outer_join_start_depth(), 1);
        plan.validate(&Default::default()).expect("valid");
    }

    #[test]
    fn test_key_cannot_see_own_depth() {
        let bad = SRC.replace("outer: \"outer.cust\"", "outer: \"c.id\"");
        assert!(parse_yaml_join(&bad).is_err());
    }
}

//! Join qualifiers over the rows of a partially joined combination.
//!
//! A combination at depth `d` holds one row per depth `0..=d` (depth 0 is the
//! outer relation); a NULL-extended position has no row at all and every
//! column read from it yields `NULL`.

use serde::{Deserialize, Serialize};

use gpujoin_core::types::Scalar;

/// Column `column` of the row contributed by `depth`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnRef {
    pub depth: usize,
    pub column: usize,
}

impl ColumnRef {
    pub const fn new(depth: usize, column: usize) -> Self {
        Self { depth, column }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Column(ColumnRef),
    Const(Scalar),
}

/// Boolean qualifier with SQL three-valued logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Qual {
    Cmp {
        op: CmpOp,
        left: Operand,
        right: Operand,
    },
    And(Vec<Qual>),
    Or(Vec<Qual>),
    Not(Box<Qual>),
    IsNull(Operand),
}

impl Qual {
    pub fn cmp(op: CmpOp, left: Operand, right: Operand) -> Self {
        Qual::Cmp { op, left, right }
    }

    /// `a.col = b.col` shorthand.
    pub fn col_eq(a: ColumnRef, b: ColumnRef) -> Self {
        Qual::cmp(CmpOp::Eq, Operand::Column(a), Operand::Column(b))
    }

    /// Evaluate against a combination; `None` means UNKNOWN.
    pub fn eval<'a, F>(&self, column: &F) -> Option<bool>
    where
        F: Fn(ColumnRef) -> Option<&'a Scalar>,
    {
        match self {
            Qual::Cmp { op, left, right } => {
                let l = resolve(left, column);
                let r = resolve(right, column);
                let ord = l.sql_cmp(r)?;
                Some(match op {
                    CmpOp::Eq => ord.is_eq(),
                    CmpOp::Ne => ord.is_ne(),
                    CmpOp::Lt => ord.is_lt(),
                    CmpOp::Le => ord.is_le(),
                    CmpOp::Gt => ord.is_gt(),
                    CmpOp::Ge => ord.is_ge(),
                })
            }
            Qual::And(items) => {
                let mut unknown = false;
                for q in items {
                    match q.eval(column) {
                        Some(false) => return Some(false),
                        None => unknown = true,
                        Some(true) => {}
                    }
                }
                if unknown {
                    None
                } else {
                    Some(true)
                }
            }
            Qual::Or(items) => {
                let mut unknown = false;
                for q in items {
                    match q.eval(column) {
                        Some(true) => return Some(true),
                        None => unknown = true,
                        Some(false) => {}
                    }
                }
                if unknown {
                    None
                } else {
                    Some(false)
                }
            }
            Qual::Not(q) => q.eval(column).map(|b| !b),
            Qual::IsNull(op) => Some(resolve(op, column).is_null()),
        }
    }

    /// Only TRUE qualifies a row.
    pub fn passes<'a, F>(&self, column: &F) -> bool
    where
        F: Fn(ColumnRef) -> Option<&'a Scalar>,
    {
        self.eval(column) == Some(true)
    }

    /// Every column the qualifier reads.
    pub fn columns(&self) -> Vec<ColumnRef> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns(&self, out: &mut Vec<ColumnRef>) {
        let mut push = |op: &Operand| {
            if let Operand::Column(c) = op {
                out.push(*c);
            }
        };
        match self {
            Qual::Cmp { left, right, .. } => {
                push(left);
                push(right);
            }
            Qual::IsNull(op) => push(op),
            Qual::Not(q) => q.collect_columns(out),
            Qual::And(items) | Qual::Or(items) => {
                for q in items {
                    q.collect_columns(out);
                }
            }
        }
    }
}

static NULL: Scalar = Scalar::Null;

fn resolve<'s, 'a: 's, F>(op: &'s Operand, column: &F) -> &'s Scalar
where
    F: Fn(ColumnRef) -> Option<&'a Scalar>,
{
    match op {
        Operand::Const(v) => v,
        Operand::Column(c) => column(*c).unwrap_or(&NULL),
    }
}

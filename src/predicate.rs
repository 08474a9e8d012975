//! Field predicates for fetches, deletes, and staleness criteria.

use crate::types::{Fields, Value};

/// Comparison operator for a single-field predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A predicate over an object's fields.
///
/// Missing fields never satisfy a comparison, with the exception of `Ne`,
/// which treats an absent field as "not equal".
#[derive(Debug, Clone)]
pub enum Predicate {
    /// Matches every object.
    All,
    Cmp {
        field: String,
        op: CmpOp,
        value: Value,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn cmp(field: impl Into<String>, op: CmpOp, value: Value) -> Self {
        Predicate::Cmp {
            field: field.into(),
            op,
            value,
        }
    }

    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::cmp(field, CmpOp::Eq, value)
    }

    pub fn matches(&self, fields: &Fields) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Cmp { field, op, value } => match fields.get(field) {
                Some(actual) => match actual.compare(value) {
                    Some(ord) => match op {
                        CmpOp::Eq => ord.is_eq(),
                        CmpOp::Ne => ord.is_ne(),
                        CmpOp::Lt => ord.is_lt(),
                        CmpOp::Le => ord.is_le(),
                        CmpOp::Gt => ord.is_gt(),
                        CmpOp::Ge => ord.is_ge(),
                    },
                    None => matches!(op, CmpOp::Ne),
                },
                None => matches!(op, CmpOp::Ne),
            },
            Predicate::And(preds) => preds.iter().all(|p| p.matches(fields)),
            Predicate::Or(preds) => preds.iter().any(|p| p.matches(fields)),
            Predicate::Not(pred) => !pred.matches(fields),
        }
    }
}

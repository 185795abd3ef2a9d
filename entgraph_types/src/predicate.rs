//! Composable filter expressions over a single entity table.
//!
//! A [`Predicate`] is plain data: the engine composes them (caller filters,
//! soft-delete filter, policy-injected tenant filters) and executors evaluate
//! them. Edge traversal is expressed with [`EdgeStep`], whose table addresses
//! are already resolved by the schema router.

use serde::{Deserialize, Serialize};

use crate::table::TableRef;
use crate::value::Value;

/// How a source row reaches its edge targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeLink {
    /// The source row carries the target id in this column (many-to-one).
    SourceColumn(String),
    /// Each target row carries the source id in this column (one-to-many).
    TargetColumn(String),
    /// A junction table holds `(owner_column = source id, target_column = target id)`.
    Junction {
        table: TableRef,
        owner_column: String,
        target_column: String,
    },
}

/// One hop across an edge, fully resolved to physical tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeStep {
    pub edge: String,
    pub target: TableRef,
    pub target_id: String,
    pub link: EdgeLink,
}

/// Boolean filter expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Eq(String, Value),
    Ne(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    In(String, Vec<Value>),
    NotIn(String, Vec<Value>),
    IsNull(String),
    NotNull(String),
    /// Substring match on a string column.
    Contains(String, String),
    /// Case-insensitive substring match.
    ContainsFold(String, String),
    HasPrefix(String, String),
    HasSuffix(String, String),
    /// A `Strings` column contains the given element.
    HasElement(String, String),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    /// At least one edge target exists (optionally matching `filter`).
    HasEdge {
        step: EdgeStep,
        filter: Option<Box<Predicate>>,
    },
}

impl Predicate {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Eq(field.into(), value.into())
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Ne(field.into(), value.into())
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Gt(field.into(), value.into())
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Gte(field.into(), value.into())
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Lt(field.into(), value.into())
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Lte(field.into(), value.into())
    }

    pub fn is_in<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Predicate::In(field.into(), values.into_iter().map(Into::into).collect())
    }

    pub fn not_in<V: Into<Value>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Predicate::NotIn(field.into(), values.into_iter().map(Into::into).collect())
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Predicate::IsNull(field.into())
    }

    pub fn not_null(field: impl Into<String>) -> Self {
        Predicate::NotNull(field.into())
    }

    pub fn contains(field: impl Into<String>, needle: impl Into<String>) -> Self {
        Predicate::Contains(field.into(), needle.into())
    }

    pub fn contains_fold(field: impl Into<String>, needle: impl Into<String>) -> Self {
        Predicate::ContainsFold(field.into(), needle.into())
    }

    pub fn has_prefix(field: impl Into<String>, prefix: impl Into<String>) -> Self {
        Predicate::HasPrefix(field.into(), prefix.into())
    }

    pub fn has_suffix(field: impl Into<String>, suffix: impl Into<String>) -> Self {
        Predicate::HasSuffix(field.into(), suffix.into())
    }

    pub fn has_element(field: impl Into<String>, element: impl Into<String>) -> Self {
        Predicate::HasElement(field.into(), element.into())
    }

    pub fn or(preds: Vec<Predicate>) -> Self {
        Predicate::Or(preds)
    }

    pub fn not(pred: Predicate) -> Self {
        Predicate::Not(Box::new(pred))
    }

    /// Conjunction of `self` and `other`, flattening nested `And`s.
    pub fn and(self, other: Predicate) -> Self {
        match (self, other) {
            (Predicate::And(mut a), Predicate::And(b)) => {
                a.extend(b);
                Predicate::And(a)
            }
            (Predicate::And(mut a), p) => {
                a.push(p);
                Predicate::And(a)
            }
            (p, Predicate::And(mut b)) => {
                b.insert(0, p);
                Predicate::And(b)
            }
            (a, b) => Predicate::And(vec![a, b]),
        }
    }

    /// Conjunction of every predicate; `None` when the list is empty.
    pub fn all(preds: Vec<Predicate>) -> Option<Predicate> {
        let mut iter = preds.into_iter();
        let first = iter.next()?;
        Some(iter.fold(first, Predicate::and))
    }

    /// Columns of the *source* table this predicate references.
    ///
    /// Filters nested inside [`Predicate::HasEdge`] address the target table and
    /// are not included.
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Predicate::Eq(f, _)
            | Predicate::Ne(f, _)
            | Predicate::Gt(f, _)
            | Predicate::Gte(f, _)
            | Predicate::Lt(f, _)
            | Predicate::Lte(f, _)
            | Predicate::In(f, _)
            | Predicate::NotIn(f, _)
            | Predicate::IsNull(f)
            | Predicate::NotNull(f)
            | Predicate::Contains(f, _)
            | Predicate::ContainsFold(f, _)
            | Predicate::HasPrefix(f, _)
            | Predicate::HasSuffix(f, _)
            | Predicate::HasElement(f, _) => out.push(f),
            Predicate::And(ps) | Predicate::Or(ps) => {
                for p in ps {
                    p.collect_columns(out);
                }
            }
            Predicate::Not(p) => p.collect_columns(out),
            Predicate::HasEdge { step, .. } => {
                if let EdgeLink::SourceColumn(col) = &step.link {
                    out.push(col);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn and_flattens_nested_conjunctions() {
        let p = Predicate::eq("a", 1i64)
            .and(Predicate::eq("b", 2i64))
            .and(Predicate::eq("c", 3i64));
        match p {
            Predicate::And(items) => assert_eq!(items.len(), 3),
            other => panic!("expected And, got {:?}", other),
        }
    }

    #[test]
    fn all_of_empty_is_none() {
        assert!(Predicate::all(vec![]).is_none());
        let single = Predicate::all(vec![Predicate::is_null("deleted_at")]).unwrap();
        assert_eq!(single, Predicate::IsNull("deleted_at".into()));
    }

    #[test]
    fn columns_skip_edge_filters() {
        let step = EdgeStep {
            edge: "owner".into(),
            target: TableRef::new("organizations"),
            target_id: "id".into(),
            link: EdgeLink::SourceColumn("owner_id".into()),
        };
        let p = Predicate::or(vec![
            Predicate::eq("title", "x"),
            Predicate::HasEdge {
                step,
                filter: Some(Box::new(Predicate::eq("name", "acme"))),
            },
        ]);
        assert_eq!(p.columns(), vec!["title", "owner_id"]);
    }
}

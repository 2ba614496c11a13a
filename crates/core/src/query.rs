//! Query vocabulary: predicates over model fields and sort specifications.
//!
//! Predicates are evaluated against the JSON form of a model, which is how
//! rows are persisted and how change events carry items.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::FieldValue;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum QuerySortOrder {
    Ascending,
    Descending,
}

/// One `(field, direction)` pair of a sort specification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuerySortBy {
    pub field: String,
    pub order: QuerySortOrder,
}

impl QuerySortBy {
    pub fn ascending(field: impl Into<String>) -> Self {
        Self { field: field.into(), order: QuerySortOrder::Ascending }
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self { field: field.into(), order: QuerySortOrder::Descending }
    }

    /// Apply this direction to a natural ordering.
    pub fn direct(&self, natural: Ordering) -> Ordering {
        match self.order {
            QuerySortOrder::Ascending => natural,
            QuerySortOrder::Descending => natural.reverse(),
        }
    }
}

/// Ordered sort specification; the first entry is the primary key.
pub type SortSpec = SmallVec<[QuerySortBy; 4]>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Boolean expression over named model fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub enum QueryPredicate {
    #[default]
    All,
    Compare { field: String, op: CompareOp, value: FieldValue },
    Between { field: String, start: FieldValue, end: FieldValue },
    BeginsWith { field: String, prefix: String },
    Contains { field: String, needle: String },
    And(Vec<QueryPredicate>),
    Or(Vec<QueryPredicate>),
    Not(Box<QueryPredicate>),
}

impl QueryPredicate {
    pub fn and(self, other: QueryPredicate) -> QueryPredicate {
        match self {
            QueryPredicate::All => other,
            QueryPredicate::And(mut v) => { v.push(other); QueryPredicate::And(v) }
            p => QueryPredicate::And(vec![p, other]),
        }
    }

    pub fn or(self, other: QueryPredicate) -> QueryPredicate {
        match self {
            QueryPredicate::Or(mut v) => { v.push(other); QueryPredicate::Or(v) }
            p => QueryPredicate::Or(vec![p, other]),
        }
    }

    pub fn negate(self) -> QueryPredicate {
        QueryPredicate::Not(Box::new(self))
    }

    pub fn is_all(&self) -> bool {
        matches!(self, QueryPredicate::All)
    }

    /// Evaluate against a model's JSON object. Missing fields read as null.
    pub fn matches(&self, record: &serde_json::Value) -> bool {
        match self {
            QueryPredicate::All => true,
            QueryPredicate::Compare { field, op, value } => {
                let actual = read(record, field);
                compare(&actual, *op, value)
            }
            QueryPredicate::Between { field, start, end } => {
                let actual = read(record, field);
                compare(&actual, CompareOp::Ge, start) && compare(&actual, CompareOp::Le, end)
            }
            QueryPredicate::BeginsWith { field, prefix } => match read(record, field) {
                FieldValue::Text(s) => s.starts_with(prefix.as_str()),
                _ => false,
            },
            QueryPredicate::Contains { field, needle } => match record.get(field.as_str()) {
                Some(serde_json::Value::String(s)) => s.contains(needle.as_str()),
                Some(serde_json::Value::Array(items)) => items.iter().any(|v| v.as_str() == Some(needle.as_str())),
                _ => false,
            },
            QueryPredicate::And(ps) => ps.iter().all(|p| p.matches(record)),
            QueryPredicate::Or(ps) => ps.iter().any(|p| p.matches(record)),
            QueryPredicate::Not(p) => !p.matches(record),
        }
    }
}

fn read(record: &serde_json::Value, field: &str) -> FieldValue {
    record.get(field).map(FieldValue::from_json).unwrap_or(FieldValue::Null)
}

fn compare(actual: &FieldValue, op: CompareOp, expected: &FieldValue) -> bool {
    match op {
        CompareOp::Eq => actual.ordering(expected) == Some(Ordering::Equal),
        CompareOp::Ne => actual.ordering(expected) != Some(Ordering::Equal),
        _ => {
            // range comparisons never match nulls
            if actual.is_null() || expected.is_null() {
                return false;
            }
            match (op, actual.ordering(expected)) {
                (CompareOp::Lt, Some(o)) => o == Ordering::Less,
                (CompareOp::Le, Some(o)) => o != Ordering::Greater,
                (CompareOp::Gt, Some(o)) => o == Ordering::Greater,
                (CompareOp::Ge, Some(o)) => o != Ordering::Less,
                _ => false,
            }
        }
    }
}

/// Builder entry point: `field("name").eq("Alan")`.
pub fn field(name: impl Into<String>) -> QueryField {
    QueryField { name: name.into() }
}

#[derive(Debug, Clone)]
pub struct QueryField {
    name: String,
}

impl QueryField {
    fn op(self, op: CompareOp, value: impl Into<FieldValue>) -> QueryPredicate {
        QueryPredicate::Compare { field: self.name, op, value: value.into() }
    }

    pub fn eq(self, value: impl Into<FieldValue>) -> QueryPredicate { self.op(CompareOp::Eq, value) }
    pub fn ne(self, value: impl Into<FieldValue>) -> QueryPredicate { self.op(CompareOp::Ne, value) }
    pub fn lt(self, value: impl Into<FieldValue>) -> QueryPredicate { self.op(CompareOp::Lt, value) }
    pub fn le(self, value: impl Into<FieldValue>) -> QueryPredicate { self.op(CompareOp::Le, value) }
    pub fn gt(self, value: impl Into<FieldValue>) -> QueryPredicate { self.op(CompareOp::Gt, value) }
    pub fn ge(self, value: impl Into<FieldValue>) -> QueryPredicate { self.op(CompareOp::Ge, value) }

    pub fn between(self, start: impl Into<FieldValue>, end: impl Into<FieldValue>) -> QueryPredicate {
        QueryPredicate::Between { field: self.name, start: start.into(), end: end.into() }
    }

    pub fn begins_with(self, prefix: impl Into<String>) -> QueryPredicate {
        QueryPredicate::BeginsWith { field: self.name, prefix: prefix.into() }
    }

    pub fn contains(self, needle: impl Into<String>) -> QueryPredicate {
        QueryPredicate::Contains { field: self.name, needle: needle.into() }
    }

    pub fn ascending(self) -> QuerySortBy { QuerySortBy::ascending(self.name) }
    pub fn descending(self) -> QuerySortBy { QuerySortBy::descending(self.name) }
}

/// Predicate and ordering for an observed query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ObserveQueryOptions {
    pub predicate: QueryPredicate,
    pub sort_by: SortSpec,
}

impl ObserveQueryOptions {
    pub fn new() -> Self { Self::default() }

    pub fn matching(mut self, predicate: QueryPredicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn sorted_by(mut self, sort: QuerySortBy) -> Self {
        self.sort_by.push(sort);
        self
    }
}

//! Structured filter predicates and their evaluator.
//!
//! A [`Predicate`] is a closed tree of field comparisons and boolean
//! combinators, evaluated against one record at a time. Trees are built either
//! programmatically (`Predicate::eq("status", json!("active"))`) or parsed from
//! a JSON filter document in the familiar operator syntax:
//!
//! ```
//! use flatshard_core::predicate::Predicate;
//! use serde_json::json;
//!
//! let filter = Predicate::from_json(&json!({
//!     "age": {"$gte": 18},
//!     "$or": [{"role": "admin"}, {"tags": {"$in": ["staff"]}}],
//! }))
//! .unwrap();
//!
//! assert!(filter.matches(&json!({"age": 30, "role": "admin"})));
//! assert!(!filter.matches(&json!({"age": 12, "role": "admin"})));
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::types::{field_value, Record};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while parsing a JSON filter document.
#[derive(Debug, thiserror::Error)]
pub enum PredicateError {
    #[error("invalid filter: expected an object for {context}")]
    NotAnObject { context: String },
    #[error("invalid filter: unknown operator {0}")]
    UnknownOperator(String),
    #[error("invalid filter: operator {op} expects {expected}")]
    InvalidOperand { op: &'static str, expected: &'static str },
    #[error("invalid filter: bad regular expression {pattern:?}: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

// ---------------------------------------------------------------------------
// Node types
// ---------------------------------------------------------------------------

/// Compiled regular expression operand for `$regex`.
///
/// Matching is a search: the pattern may match anywhere in the field value.
#[derive(Clone)]
pub struct Pattern {
    regex: Regex,
    case_insensitive: bool,
}

impl Pattern {
    /// Compiles `source`, optionally case-insensitive.
    ///
    /// # Errors
    ///
    /// Returns [`PredicateError::InvalidRegex`] if the pattern does not compile.
    pub fn new(source: &str, case_insensitive: bool) -> Result<Self, PredicateError> {
        let regex = RegexBuilder::new(source)
            .case_insensitive(case_insensitive)
            .build()
            .map_err(|source_err| PredicateError::InvalidRegex {
                pattern: source.to_string(),
                source: source_err,
            })?;
        Ok(Self {
            regex,
            case_insensitive,
        })
    }

    /// The pattern source as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    fn is_match(&self, haystack: &str) -> bool {
        self.regex.is_match(haystack)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str() && self.case_insensitive == other.case_insensitive
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pattern")
            .field("source", &self.as_str())
            .field("case_insensitive", &self.case_insensitive)
            .finish()
    }
}

/// User-supplied predicate function.
///
/// The `name` stands in for the function when a query is normalized into a
/// cache key, so two custom predicates with the same name are considered the
/// same filter.
#[derive(Clone)]
pub struct CustomPredicate {
    name: String,
    func: Arc<dyn Fn(&Record) -> bool + Send + Sync>,
}

impl CustomPredicate {
    #[must_use]
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for CustomPredicate {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl fmt::Debug for CustomPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomPredicate")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Comparison applied to a single field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldOp {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Regex(Pattern),
}

impl FieldOp {
    /// Operator name in filter-document syntax.
    #[must_use]
    pub fn operator(&self) -> &'static str {
        match self {
            Self::Eq(_) => "$eq",
            Self::Ne(_) => "$ne",
            Self::Gt(_) => "$gt",
            Self::Gte(_) => "$gte",
            Self::Lt(_) => "$lt",
            Self::Lte(_) => "$lte",
            Self::In(_) => "$in",
            Self::Nin(_) => "$nin",
            Self::Exists(_) => "$exists",
            Self::Regex(_) => "$regex",
        }
    }

    fn evaluate(&self, actual: Option<&Value>) -> bool {
        // Missing fields compare as null for equality-style operators.
        let or_null = actual.unwrap_or(&Value::Null);
        match self {
            Self::Eq(expected) => values_equal(or_null, expected),
            Self::Ne(expected) => !values_equal(or_null, expected),
            Self::Gt(bound) => compare(actual, bound) == Some(Ordering::Greater),
            Self::Gte(bound) => matches!(
                compare(actual, bound),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Self::Lt(bound) => compare(actual, bound) == Some(Ordering::Less),
            Self::Lte(bound) => matches!(
                compare(actual, bound),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Self::In(options) => options.iter().any(|o| values_equal(or_null, o)),
            Self::Nin(options) => !options.iter().any(|o| values_equal(or_null, o)),
            Self::Exists(expected) => actual.is_some() == *expected,
            Self::Regex(pattern) => actual
                .and_then(Value::as_str)
                .is_some_and(|s| pattern.is_match(s)),
        }
    }

    fn operand_json(&self) -> Value {
        match self {
            Self::Eq(v) | Self::Ne(v) | Self::Gt(v) | Self::Gte(v) | Self::Lt(v) | Self::Lte(v) => {
                v.clone()
            }
            Self::In(vs) | Self::Nin(vs) => Value::Array(vs.clone()),
            Self::Exists(b) => Value::Bool(*b),
            Self::Regex(p) => Value::String(p.as_str().to_string()),
        }
    }
}

/// A filter over records.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// All children must match. An empty list matches everything.
    And(Vec<Predicate>),
    /// At least one child must match. An empty list matches nothing.
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    /// Comparison on a (possibly dotted) field path.
    Field { path: String, op: FieldOp },
    Custom(CustomPredicate),
}

// ---------------------------------------------------------------------------
// Construction helpers
// ---------------------------------------------------------------------------

impl Predicate {
    /// Predicate that matches every record.
    #[must_use]
    pub fn all() -> Self {
        Self::And(Vec::new())
    }

    #[must_use]
    pub fn field(path: impl Into<String>, op: FieldOp) -> Self {
        Self::Field {
            path: path.into(),
            op,
        }
    }

    #[must_use]
    pub fn eq(path: impl Into<String>, value: Value) -> Self {
        Self::field(path, FieldOp::Eq(value))
    }

    #[must_use]
    pub fn ne(path: impl Into<String>, value: Value) -> Self {
        Self::field(path, FieldOp::Ne(value))
    }

    #[must_use]
    pub fn gt(path: impl Into<String>, value: Value) -> Self {
        Self::field(path, FieldOp::Gt(value))
    }

    #[must_use]
    pub fn gte(path: impl Into<String>, value: Value) -> Self {
        Self::field(path, FieldOp::Gte(value))
    }

    #[must_use]
    pub fn lt(path: impl Into<String>, value: Value) -> Self {
        Self::field(path, FieldOp::Lt(value))
    }

    #[must_use]
    pub fn lte(path: impl Into<String>, value: Value) -> Self {
        Self::field(path, FieldOp::Lte(value))
    }

    #[must_use]
    pub fn is_in(path: impl Into<String>, values: Vec<Value>) -> Self {
        Self::field(path, FieldOp::In(values))
    }

    #[must_use]
    pub fn not_in(path: impl Into<String>, values: Vec<Value>) -> Self {
        Self::field(path, FieldOp::Nin(values))
    }

    #[must_use]
    pub fn exists(path: impl Into<String>, expected: bool) -> Self {
        Self::field(path, FieldOp::Exists(expected))
    }

    /// # Errors
    ///
    /// Returns [`PredicateError::InvalidRegex`] if the pattern does not compile.
    pub fn regex(path: impl Into<String>, pattern: &str) -> Result<Self, PredicateError> {
        Ok(Self::field(path, FieldOp::Regex(Pattern::new(pattern, false)?)))
    }

    #[must_use]
    pub fn custom<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        Self::Custom(CustomPredicate::new(name, func))
    }

    #[must_use]
    pub fn and(children: Vec<Predicate>) -> Self {
        Self::And(children)
    }

    #[must_use]
    pub fn or(children: Vec<Predicate>) -> Self {
        Self::Or(children)
    }

    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn not(inner: Predicate) -> Self {
        Self::Not(Box::new(inner))
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

impl Predicate {
    /// Evaluates the predicate against one record.
    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Self::And(children) => children.iter().all(|c| c.matches(record)),
            Self::Or(children) => children.iter().any(|c| c.matches(record)),
            Self::Not(inner) => !inner.matches(record),
            Self::Field { path, op } => op.evaluate(field_value(record, path)),
            Self::Custom(custom) => (custom.func)(record),
        }
    }
}

/// Deep equality where numbers compare by numeric value (`1 == 1.0`).
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| values_equal(x, y)))
        }
        _ => a == b,
    }
}

/// Orders two values of the same primitive kind. Mixed kinds are unordered.
fn compare(actual: Option<&Value>, bound: &Value) -> Option<Ordering> {
    match (actual?, bound) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Total order used for sorting records by a field.
///
/// Missing and null sort first, then booleans, numbers, strings, and finally
/// arrays and objects (compared by their JSON text).
#[must_use]
pub fn sort_order(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(Value::Array(_)) => 4,
            Some(Value::Object(_)) => 5,
        }
    }

    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .unwrap_or(f64::NAN)
            .total_cmp(&y.as_f64().unwrap_or(f64::NAN)),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x @ (Value::Array(_) | Value::Object(_))), Some(y))
            if rank(Some(x)) == rank(Some(y)) =>
        {
            x.to_string().cmp(&y.to_string())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

// ---------------------------------------------------------------------------
// JSON filter documents
// ---------------------------------------------------------------------------

impl Predicate {
    /// Parses a JSON filter document.
    ///
    /// Top-level keys are either combinators (`$and`, `$or`, `$not`) or field
    /// paths. A field maps to a plain value (implicit `$eq`) or to an operator
    /// object; several keys or operators are combined with AND.
    ///
    /// # Errors
    ///
    /// Returns a [`PredicateError`] describing the first malformed node.
    pub fn from_json(doc: &Value) -> Result<Self, PredicateError> {
        let Value::Object(entries) = doc else {
            return Err(PredicateError::NotAnObject {
                context: "filter document".to_string(),
            });
        };

        let mut parts = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            match key.as_str() {
                "$and" => parts.push(Self::And(parse_list(value, "$and")?)),
                "$or" => parts.push(Self::Or(parse_list(value, "$or")?)),
                "$not" => parts.push(Self::not(Self::from_json(value)?)),
                op if op.starts_with('$') => {
                    return Err(PredicateError::UnknownOperator(op.to_string()))
                }
                path => parts.push(parse_field(path, value)?),
            }
        }
        Ok(collapse(parts))
    }

    /// Canonical JSON rendering of the predicate.
    ///
    /// Stable for equal predicates, so it is suitable as part of a cache key.
    /// Custom predicates render as `{"$custom": name}`.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        match self {
            Self::And(children) => {
                out.insert(
                    "$and".to_string(),
                    Value::Array(children.iter().map(Self::to_json).collect()),
                );
            }
            Self::Or(children) => {
                out.insert(
                    "$or".to_string(),
                    Value::Array(children.iter().map(Self::to_json).collect()),
                );
            }
            Self::Not(inner) => {
                out.insert("$not".to_string(), inner.to_json());
            }
            Self::Field { path, op } => {
                let mut operand = Map::new();
                operand.insert(op.operator().to_string(), op.operand_json());
                if let FieldOp::Regex(pattern) = op {
                    if pattern.case_insensitive {
                        operand.insert("$options".to_string(), Value::String("i".to_string()));
                    }
                }
                out.insert(path.clone(), Value::Object(operand));
            }
            Self::Custom(custom) => {
                out.insert("$custom".to_string(), Value::String(custom.name.clone()));
            }
        }
        Value::Object(out)
    }
}

impl Serialize for Predicate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Predicate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let doc = Value::deserialize(deserializer)?;
        Self::from_json(&doc).map_err(serde::de::Error::custom)
    }
}

fn collapse(mut parts: Vec<Predicate>) -> Predicate {
    if parts.len() == 1 {
        parts.remove(0)
    } else {
        Predicate::And(parts)
    }
}

fn parse_list(value: &Value, op: &'static str) -> Result<Vec<Predicate>, PredicateError> {
    let Value::Array(items) = value else {
        return Err(PredicateError::InvalidOperand {
            op,
            expected: "an array of filter documents",
        });
    };
    items.iter().map(Predicate::from_json).collect()
}

fn parse_field(path: &str, value: &Value) -> Result<Predicate, PredicateError> {
    // An object is an operator document only when every key is an operator.
    let ops = match value {
        Value::Object(ops) if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) => ops,
        _ => return Ok(Predicate::eq(path, value.clone())),
    };

    let case_insensitive = match ops.get("$options") {
        None => false,
        Some(Value::String(flags)) => flags.contains('i'),
        Some(_) => {
            return Err(PredicateError::InvalidOperand {
                op: "$options",
                expected: "a string of regex flags",
            })
        }
    };

    let mut parts = Vec::with_capacity(ops.len());
    for (op, operand) in ops {
        let field_op = match op.as_str() {
            "$options" => continue,
            "$not" => {
                parts.push(Predicate::not(parse_field(path, operand)?));
                continue;
            }
            "$eq" => FieldOp::Eq(operand.clone()),
            "$ne" => FieldOp::Ne(operand.clone()),
            "$gt" => FieldOp::Gt(operand.clone()),
            "$gte" => FieldOp::Gte(operand.clone()),
            "$lt" => FieldOp::Lt(operand.clone()),
            "$lte" => FieldOp::Lte(operand.clone()),
            "$in" => FieldOp::In(array_operand(operand, "$in")?),
            "$nin" => FieldOp::Nin(array_operand(operand, "$nin")?),
            "$exists" => match operand {
                Value::Bool(b) => FieldOp::Exists(*b),
                _ => {
                    return Err(PredicateError::InvalidOperand {
                        op: "$exists",
                        expected: "a boolean",
                    })
                }
            },
            "$regex" => match operand {
                Value::String(source) => FieldOp::Regex(Pattern::new(source, case_insensitive)?),
                _ => {
                    return Err(PredicateError::InvalidOperand {
                        op: "$regex",
                        expected: "a string pattern",
                    })
                }
            },
            other => return Err(PredicateError::UnknownOperator(other.to_string())),
        };
        parts.push(Predicate::field(path, field_op));
    }
    Ok(collapse(parts))
}

fn array_operand(value: &Value, op: &'static str) -> Result<Vec<Value>, PredicateError> {
    match value {
        Value::Array(items) => Ok(items.clone()),
        _ => Err(PredicateError::InvalidOperand {
            op,
            expected: "an array",
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

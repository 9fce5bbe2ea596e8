//! Structured filter and sort descriptions evaluated against JSON objects.
//!
//! Records in a [`RecordStore`](super::RecordStore) and serializable domain
//! models share one representation (`serde_json::Map`), so a predicate written
//! for a store query can also filter an in-memory collection.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    True,
    False,
    Eq(String, Value),
    Ne(String, Value),
    Lt(String, Value),
    Gt(String, Value),
    /// String field contains a substring, or array field contains a value.
    Contains(String, Value),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Default for Predicate {
    fn default() -> Self {
        Predicate::True
    }
}

impl Predicate {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Eq(field.into(), value.into())
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Ne(field.into(), value.into())
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Lt(field.into(), value.into())
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Gt(field.into(), value.into())
    }

    pub fn contains(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Contains(field.into(), value.into())
    }

    /// Conjunction, flattening nested `And`s.
    pub fn and(self, other: Predicate) -> Self {
        let mut parts = Vec::new();
        for p in [self, other] {
            match p {
                Predicate::And(inner) => parts.extend(inner),
                p => parts.push(p),
            }
        }
        Predicate::And(parts)
    }

    /// Disjunction, flattening nested `Or`s.
    pub fn or(self, other: Predicate) -> Self {
        let mut parts = Vec::new();
        for p in [self, other] {
            match p {
                Predicate::Or(inner) => parts.extend(inner),
                p => parts.push(p),
            }
        }
        Predicate::Or(parts)
    }

    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    pub fn evaluate(&self, object: &Map<String, Value>) -> bool {
        match self {
            Predicate::True => true,
            Predicate::False => false,
            Predicate::Eq(field, value) => lookup(object, field).map_or(value.is_null(), |v| v == value),
            Predicate::Ne(field, value) => lookup(object, field).map_or(!value.is_null(), |v| v != value),
            Predicate::Lt(field, value) => {
                lookup(object, field).and_then(|v| compare_values(v, value)) == Some(Ordering::Less)
            }
            Predicate::Gt(field, value) => {
                lookup(object, field).and_then(|v| compare_values(v, value)) == Some(Ordering::Greater)
            }
            Predicate::Contains(field, needle) => match (lookup(object, field), needle) {
                (Some(Value::String(haystack)), Value::String(needle)) => haystack.contains(needle.as_str()),
                (Some(Value::Array(items)), needle) => items.contains(needle),
                _ => false,
            },
            Predicate::And(parts) => parts.iter().all(|p| p.evaluate(object)),
            Predicate::Or(parts) => parts.iter().any(|p| p.evaluate(object)),
            Predicate::Not(inner) => !inner.evaluate(object),
        }
    }

    /// Evaluate against anything that serializes to a JSON object.
    /// Values that are not objects never match.
    pub fn matches<T: Serialize>(&self, element: &T) -> bool {
        match serde_json::to_value(element) {
            Ok(Value::Object(object)) => self.evaluate(&object),
            _ => false,
        }
    }
}

/// Resolve a dotted path (`settings.max_articles`) inside an object.
fn lookup<'a>(object: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = object.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    pub ascending: bool,
}

impl SortKey {
    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: true,
        }
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: false,
        }
    }

    /// Order two objects by a list of keys; missing fields sort first.
    pub fn compare(keys: &[SortKey], a: &Map<String, Value>, b: &Map<String, Value>) -> Ordering {
        for key in keys {
            let left = lookup(a, &key.field).unwrap_or(&Value::Null);
            let right = lookup(b, &key.field).unwrap_or(&Value::Null);
            let ordering = compare_values(left, right)
                .unwrap_or_else(|| type_rank(left).cmp(&type_rank(right)));
            let ordering = if key.ascending { ordering } else { ordering.reverse() };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_comparisons() {
        let article = object(json!({
            "title": "Rust 2024",
            "read": false,
            "score": 7,
            "tags": ["rust", "news"],
            "feed": { "id": "f1" }
        }));

        assert!(Predicate::eq("read", false).evaluate(&article));
        assert!(Predicate::ne("title", "Go").evaluate(&article));
        assert!(Predicate::gt("score", 5).evaluate(&article));
        assert!(!Predicate::lt("score", 5).evaluate(&article));
        assert!(Predicate::contains("title", "2024").evaluate(&article));
        assert!(Predicate::contains("tags", "rust").evaluate(&article));
        assert!(Predicate::eq("feed.id", "f1").evaluate(&article));
        assert!(Predicate::eq("missing", Value::Null).evaluate(&article));
    }

    #[test]
    fn test_compound_predicates_flatten() {
        let p = Predicate::eq("a", 1).and(Predicate::eq("b", 2)).and(Predicate::eq("c", 3));
        match &p {
            Predicate::And(parts) => assert_eq!(parts.len(), 3),
            other => panic!("expected And, got {:?}", other),
        }

        let o = Predicate::eq("a", 1).or(Predicate::eq("a", 2));
        assert!(o.evaluate(&object(json!({ "a": 2 }))));
        assert!(!o.clone().negate().evaluate(&object(json!({ "a": 2 }))));
    }

    #[test]
    fn test_matches_serializable_values() {
        #[derive(Serialize)]
        struct Item {
            name: String,
        }

        let item = Item { name: "feed".to_string() };
        assert!(Predicate::eq("name", "feed").matches(&item));
        assert!(!Predicate::True.matches(&42));
    }

    #[test]
    fn test_sort_key_ordering() {
        let older = object(json!({ "published": "2024-01-01T00:00:00Z", "title": "b" }));
        let newer = object(json!({ "published": "2024-02-01T00:00:00Z", "title": "a" }));

        let by_date = [SortKey::descending("published")];
        assert_eq!(SortKey::compare(&by_date, &newer, &older), Ordering::Less);

        let by_title = [SortKey::ascending("title")];
        assert_eq!(SortKey::compare(&by_title, &newer, &older), Ordering::Less);

        let missing = object(json!({}));
        assert_eq!(SortKey::compare(&by_title, &missing, &older), Ordering::Less);
    }
}

//! Filter normalization.
//!
//! Filters arrive from the UI as loose JSON objects. Before they become part
//! of a cache key they are canonicalized so that semantically identical filter
//! sets compare equal:
//! - `null` values and blank strings are omitted
//! - strings are trimmed
//! - arrays are sorted and deduplicated
//! - object properties are ordered
//! - fields equal to their declared default are dropped
//!
//! The same schema that declares defaults also describes how each filter
//! field constrains entity rows, so a normalized filter set can answer whether
//! a given entity still belongs to the view it describes.

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use super::entry::Entity;

/// Raw, user-chosen filters.
pub type Filters = Map<String, Value>;

/// How a filter field constrains an entity column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldMatch {
  /// Column equals the filter value. A missing boolean column reads as `false`.
  Eq,
  /// Column is one of the filter values
  AnyOf,
  /// Array column shares at least one element with the filter values
  Overlaps,
  /// Case-insensitive substring match on a text column
  Search,
  /// Sort direction; never excludes rows
  Order,
  /// Pagination cursor; never excludes rows
  Page,
}

/// Declared default for a filter field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldDefault {
  Bool(bool),
  Int(i64),
  Str(&'static str),
  EmptyList,
}

impl FieldDefault {
  pub fn to_value(self) -> Value {
    match self {
      Self::Bool(b) => Value::Bool(b),
      Self::Int(i) => Value::from(i),
      Self::Str(s) => Value::String(s.to_string()),
      Self::EmptyList => Value::Array(Vec::new()),
    }
  }

  fn matches(self, value: &Value) -> bool {
    match (self, value) {
      (Self::Bool(b), Value::Bool(v)) => b == *v,
      (Self::Int(i), Value::Number(n)) => n.as_i64() == Some(i) || n.as_f64() == Some(i as f64),
      (Self::Str(s), Value::String(v)) => s == v,
      (Self::EmptyList, Value::Array(items)) => items.is_empty(),
      _ => false,
    }
  }
}

/// A single declared filter field.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
  /// Name used in the filter object (e.g. `isArchived`)
  pub name: &'static str,
  /// Entity column the field constrains (e.g. `is_archived`)
  pub column: &'static str,
  pub matching: FieldMatch,
  pub default: Option<FieldDefault>,
}

/// Declared filter fields for one entity table.
#[derive(Debug)]
pub struct FilterSchema {
  pub entity: &'static str,
  pub fields: &'static [FieldSpec],
}

impl FilterSchema {
  pub fn field(&self, name: &str) -> Option<&FieldSpec> {
    self.fields.iter().find(|f| f.name == name)
  }
}

/// A canonical filter set. Equality, hashing and ordering are defined on the
/// canonical JSON text, so two normalized sets are equal iff they are deep-equal.
#[derive(Clone)]
pub struct NormalizedFilters {
  map: Map<String, Value>,
  canonical: String,
}

impl NormalizedFilters {
  /// Canonicalize `filters`, dropping defaults declared by `schema`.
  pub fn normalize(schema: Option<&FilterSchema>, filters: &Filters) -> Self {
    let mut sorted = BTreeMap::new();

    for (name, value) in filters {
      let name = name.trim();
      let Some(value) = canonicalize(value) else {
        continue;
      };

      let is_default = schema
        .and_then(|s| s.field(name))
        .and_then(|spec| spec.default)
        .is_some_and(|default| default.matches(&value));
      if is_default {
        continue;
      }

      sorted.insert(name.to_string(), value);
    }

    Self::from_sorted(sorted)
  }

  fn from_sorted(sorted: BTreeMap<String, Value>) -> Self {
    let map: Map<String, Value> = sorted.into_iter().collect();
    let canonical = Value::Object(map.clone()).to_string();
    Self { map, canonical }
  }

  pub fn empty() -> Self {
    Self::from_sorted(BTreeMap::new())
  }

  pub fn is_empty(&self) -> bool {
    self.map.is_empty()
  }

  pub fn get(&self, name: &str) -> Option<&Value> {
    self.map.get(name)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
    self.map.iter()
  }

  pub fn canonical(&self) -> &str {
    &self.canonical
  }

  /// The normalized set as plain filters, e.g. to hand to the remote executor.
  pub fn to_filters(&self) -> Filters {
    self.map.clone()
  }

  /// Value for `spec`, falling back to its declared default.
  pub fn effective(&self, spec: &FieldSpec) -> Option<Value> {
    self
      .map
      .get(spec.name)
      .cloned()
      .or_else(|| spec.default.map(FieldDefault::to_value))
  }

  /// Partial deep match: every entry of `pattern` is present in `self` and
  /// recursively equal. An empty pattern matches everything.
  pub fn partially_matches(&self, pattern: &NormalizedFilters) -> bool {
    pattern.map.iter().all(|(name, expected)| {
      self
        .map
        .get(name)
        .is_some_and(|actual| partial_deep_equal(actual, expected))
    })
  }

  /// Whether `entity` satisfies this filter set, declared defaults included.
  ///
  /// Fields without a schema entry cannot be evaluated client-side and never
  /// exclude a row.
  pub fn admits(&self, schema: Option<&FilterSchema>, entity: &Entity) -> bool {
    let Some(schema) = schema else {
      return true;
    };

    schema.fields.iter().all(|spec| match self.effective(spec) {
      Some(expected) => field_admits(spec.matching, &expected, entity.get(spec.column)),
      None => true,
    })
  }
}

impl Default for NormalizedFilters {
  fn default() -> Self {
    Self::empty()
  }
}

impl PartialEq for NormalizedFilters {
  fn eq(&self, other: &Self) -> bool {
    self.canonical == other.canonical
  }
}

impl Eq for NormalizedFilters {}

impl Hash for NormalizedFilters {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.canonical.hash(state);
  }
}

impl PartialOrd for NormalizedFilters {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for NormalizedFilters {
  fn cmp(&self, other: &Self) -> Ordering {
    self.canonical.cmp(&other.canonical)
  }
}

impl fmt::Debug for NormalizedFilters {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.canonical)
  }
}

impl fmt::Display for NormalizedFilters {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.canonical)
  }
}

impl Serialize for NormalizedFilters {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    self.map.serialize(serializer)
  }
}

/// Canonical form of a single filter value. `None` means "omit".
fn canonicalize(value: &Value) -> Option<Value> {
  match value {
    Value::Null => None,
    Value::String(s) => {
      let trimmed = s.trim();
      if trimmed.is_empty() {
        None
      } else {
        Some(Value::String(trimmed.to_string()))
      }
    }
    Value::Array(items) => {
      let mut items: Vec<Value> = items.iter().filter_map(canonicalize).collect();
      items.sort_by_cached_key(|v| v.to_string());
      items.dedup();
      Some(Value::Array(items))
    }
    Value::Object(fields) => {
      let sorted: BTreeMap<String, Value> = fields
        .iter()
        .filter_map(|(k, v)| canonicalize(v).map(|v| (k.clone(), v)))
        .collect();
      Some(Value::Object(sorted.into_iter().collect()))
    }
    other => Some(other.clone()),
  }
}

fn partial_deep_equal(actual: &Value, expected: &Value) -> bool {
  match (actual, expected) {
    (Value::Object(a), Value::Object(e)) => e
      .iter()
      .all(|(k, ev)| a.get(k).is_some_and(|av| partial_deep_equal(av, ev))),
    _ => actual == expected,
  }
}

fn field_admits(matching: FieldMatch, expected: &Value, actual: Option<&Value>) -> bool {
  match matching {
    FieldMatch::Eq => match expected {
      Value::Bool(b) => actual.and_then(Value::as_bool).unwrap_or(false) == *b,
      _ => actual.is_some_and(|a| scalar_eq(a, expected)),
    },
    FieldMatch::AnyOf => match expected {
      Value::Array(allowed) if allowed.is_empty() => true,
      Value::Array(allowed) => actual.is_some_and(|a| allowed.iter().any(|v| scalar_eq(a, v))),
      scalar => actual.is_some_and(|a| scalar_eq(a, scalar)),
    },
    FieldMatch::Overlaps => {
      let allowed = match expected {
        Value::Array(allowed) => allowed.as_slice(),
        scalar => std::slice::from_ref(scalar),
      };
      if allowed.is_empty() {
        return true;
      }
      match actual {
        Some(Value::Array(present)) => present
          .iter()
          .any(|p| allowed.iter().any(|v| scalar_eq(p, v))),
        _ => false,
      }
    }
    FieldMatch::Search => {
      let needle = scalar_text(expected).to_lowercase();
      actual
        .and_then(Value::as_str)
        .is_some_and(|haystack| haystack.to_lowercase().contains(&needle))
    }
    FieldMatch::Order | FieldMatch::Page => true,
  }
}

/// Compare scalars loosely so `"42"` matches `42`.
fn scalar_eq(a: &Value, b: &Value) -> bool {
  a == b || scalar_text(a) == scalar_text(b)
}

pub(crate) fn scalar_text(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  const SCHEMA: FilterSchema = FilterSchema {
    entity: "newsletters",
    fields: &[
      FieldSpec {
        name: "isArchived",
        column: "is_archived",
        matching: FieldMatch::Eq,
        default: Some(FieldDefault::Bool(false)),
      },
      FieldSpec {
        name: "sourceIds",
        column: "source_id",
        matching: FieldMatch::AnyOf,
        default: Some(FieldDefault::EmptyList),
      },
      FieldSpec {
        name: "tagIds",
        column: "tag_ids",
        matching: FieldMatch::Overlaps,
        default: Some(FieldDefault::EmptyList),
      },
      FieldSpec {
        name: "search",
        column: "title",
        matching: FieldMatch::Search,
        default: None,
      },
      FieldSpec {
        name: "page",
        column: "page",
        matching: FieldMatch::Page,
        default: Some(FieldDefault::Int(0)),
      },
    ],
  };

  fn filters(value: Value) -> Filters {
    match value {
      Value::Object(map) => map,
      _ => panic!("filters must be an object"),
    }
  }

  fn entity(value: Value) -> Entity {
    Entity::from_value(value).unwrap()
  }

  #[test]
  fn test_array_order_is_irrelevant() {
    let a = NormalizedFilters::normalize(Some(&SCHEMA), &filters(json!({"sourceIds": ["b", "a", "c"]})));
    let b = NormalizedFilters::normalize(Some(&SCHEMA), &filters(json!({"sourceIds": ["c", "b", "a", "a"]})));
    assert_eq!(a, b);
    assert_eq!(a.get("sourceIds"), Some(&json!(["a", "b", "c"])));
  }

  #[test]
  fn test_defaults_nulls_and_blanks_are_dropped() {
    let normalized = NormalizedFilters::normalize(
      Some(&SCHEMA),
      &filters(json!({
        "isArchived": false,
        "sourceIds": [],
        "search": "   ",
        "tagIds": null,
      })),
    );
    assert!(normalized.is_empty());
    assert_eq!(normalized, NormalizedFilters::empty());
  }

  #[test]
  fn test_defaults_match_padded_names_and_float_numbers() {
    for raw in [
      json!({" isArchived ": false}),
      json!({"page": 0.0}),
      json!({"page": 0, "sourceIds ": []}),
    ] {
      let normalized = NormalizedFilters::normalize(Some(&SCHEMA), &filters(raw.clone()));
      assert_eq!(normalized, NormalizedFilters::empty(), "{} kept a default", raw);
    }

    let padded = NormalizedFilters::normalize(Some(&SCHEMA), &filters(json!({" isArchived": true})));
    assert_eq!(padded.get("isArchived"), Some(&json!(true)));
    let second = NormalizedFilters::normalize(Some(&SCHEMA), &filters(json!({"page": 1.0})));
    assert_eq!(second.get("page"), Some(&json!(1.0)));
  }

  #[test]
  fn test_non_default_values_are_kept() {
    let normalized =
      NormalizedFilters::normalize(Some(&SCHEMA), &filters(json!({"isArchived": true, "search": " rust "})));
    assert_eq!(normalized.get("isArchived"), Some(&json!(true)));
    assert_eq!(normalized.get("search"), Some(&json!("rust")));
  }

  #[test]
  fn test_nested_objects_are_ordered() {
    let a = NormalizedFilters::normalize(None, &filters(json!({"range": {"to": 2, "from": 1}})));
    let b = NormalizedFilters::normalize(None, &filters(json!({"range": {"from": 1, "to": 2}})));
    assert_eq!(a.canonical(), b.canonical());
  }

  #[test]
  fn test_admits_applies_declared_defaults() {
    let active = NormalizedFilters::normalize(Some(&SCHEMA), &filters(json!({"isArchived": false})));
    assert!(active.admits(Some(&SCHEMA), &entity(json!({"id": "nl-1", "is_archived": false}))));
    assert!(active.admits(Some(&SCHEMA), &entity(json!({"id": "nl-1"}))));
    assert!(!active.admits(Some(&SCHEMA), &entity(json!({"id": "nl-1", "is_archived": true}))));
  }

  #[test]
  fn test_admits_any_of_overlaps_and_search() {
    let view = NormalizedFilters::normalize(
      Some(&SCHEMA),
      &filters(json!({"sourceIds": ["s1", "s2"], "tagIds": [7], "search": "Weekly"})),
    );
    let row = entity(json!({
      "id": "nl-1",
      "source_id": "s2",
      "tag_ids": [3, 7],
      "title": "The weekly digest",
    }));
    assert!(view.admits(Some(&SCHEMA), &row));

    let other_source = entity(json!({
      "id": "nl-2",
      "source_id": "s9",
      "tag_ids": [7],
      "title": "weekly",
    }));
    assert!(!view.admits(Some(&SCHEMA), &other_source));
  }

  #[test]
  fn test_partial_match() {
    let full = NormalizedFilters::normalize(
      Some(&SCHEMA),
      &filters(json!({"isArchived": true, "search": "rust"})),
    );
    let partial = NormalizedFilters::normalize(Some(&SCHEMA), &filters(json!({"isArchived": true})));
    assert!(full.partially_matches(&partial));
    assert!(!partial.partially_matches(&full));
    assert!(full.partially_matches(&NormalizedFilters::empty()));
  }
}

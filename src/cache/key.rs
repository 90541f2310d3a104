//! Structured cache keys and the patterns used to select them.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, Result};

use super::filters::{FilterSchema, Filters, NormalizedFilters};

/// The shape of a cached view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
  List,
  Detail,
  Relation,
}

impl Scope {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::List => "list",
      Self::Detail => "detail",
      Self::Relation => "relation",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(untagged)]
pub enum Discriminator {
  Filters(NormalizedFilters),
  Id(String),
  /// Anchor of a relation view: the entity and id the view hangs off
  Related { entity: String, id: String },
}

/// Canonical `(entity, scope, discriminator)` key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CacheKey {
  entity: String,
  scope: Scope,
  discriminator: Discriminator,
}

impl CacheKey {
  pub fn entity(&self) -> &str {
    &self.entity
  }

  pub fn scope(&self) -> Scope {
    self.scope
  }

  /// Normalized filters of a list key.
  pub fn filters(&self) -> Option<&NormalizedFilters> {
    match &self.discriminator {
      Discriminator::Filters(f) => Some(f),
      _ => None,
    }
  }

  /// Id of a detail key.
  pub fn id(&self) -> Option<&str> {
    match &self.discriminator {
      Discriminator::Id(id) => Some(id),
      _ => None,
    }
  }

  /// Stable, fixed-length identifier for this key.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.to_string().as_bytes());
    hex::encode(hasher.finalize())
  }

  /// Partial match against `pattern` (see [`KeyPattern::matches`]).
  pub fn matches(&self, pattern: &KeyPattern) -> bool {
    pattern.matches(self, false)
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}/", self.entity, self.scope.as_str())?;
    match &self.discriminator {
      Discriminator::Filters(filters) => write!(f, "{}", filters),
      Discriminator::Id(id) => write!(f, "{}", id),
      Discriminator::Related { entity, id } => write!(f, "{}:{}", entity, id),
    }
  }
}

/// Selects a region of the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyPattern {
  /// A single key, or with `exact = false` every list key of the same entity
  /// whose filters contain the pattern's filters
  Key(CacheKey),
  /// Every key of a scope, for one entity or for all of them
  Scope { entity: Option<String>, scope: Scope },
  /// Every key belonging to an entity
  Entity(String),
  /// Every relation view anchored at `entity`/`id`
  RelationsOf { entity: String, id: String },
}

impl KeyPattern {
  pub fn lists(entity: &str) -> Self {
    Self::Scope {
      entity: Some(entity.to_string()),
      scope: Scope::List,
    }
  }

  pub fn relations(entity: &str) -> Self {
    Self::Scope {
      entity: Some(entity.to_string()),
      scope: Scope::Relation,
    }
  }

  pub fn all_lists() -> Self {
    Self::Scope {
      entity: None,
      scope: Scope::List,
    }
  }

  /// `exact` only narrows `Key` patterns; the region patterns always match
  /// their whole region.
  pub fn matches(&self, key: &CacheKey, exact: bool) -> bool {
    match self {
      Self::Key(pattern) if exact => key == pattern,
      Self::Key(pattern) => {
        if key.entity != pattern.entity || key.scope != pattern.scope {
          return false;
        }
        match (&key.discriminator, &pattern.discriminator) {
          (Discriminator::Filters(actual), Discriminator::Filters(wanted)) => {
            actual.partially_matches(wanted)
          }
          (actual, wanted) => actual == wanted,
        }
      }
      Self::Scope { entity, scope } => {
        key.scope == *scope && entity.as_deref().map_or(true, |e| e == key.entity)
      }
      Self::Entity(entity) => key.entity == *entity,
      Self::RelationsOf { entity, id } => matches!(
        &key.discriminator,
        Discriminator::Related { entity: e, id: i } if e == entity && i == id
      ),
    }
  }
}

impl fmt::Display for KeyPattern {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Key(key) => write!(f, "{}", key),
      Self::Scope { entity, scope } => {
        write!(f, "{}/{}/*", entity.as_deref().unwrap_or("*"), scope.as_str())
      }
      Self::Entity(entity) => write!(f, "{}/*", entity),
      Self::RelationsOf { entity, id } => write!(f, "*/relation/{}:{}", entity, id),
    }
  }
}

/// Derives canonical keys. Holds the filter schemas that declare defaults.
#[derive(Debug, Default)]
pub struct KeyFactory {
  schemas: HashMap<&'static str, &'static FilterSchema>,
}

impl KeyFactory {
  pub fn new(schemas: &[&'static FilterSchema]) -> Self {
    Self {
      schemas: schemas.iter().map(|s| (s.entity, *s)).collect(),
    }
  }

  pub fn schema(&self, entity: &str) -> Option<&'static FilterSchema> {
    self.schemas.get(entity).copied()
  }

  pub fn list_key(&self, entity: &str, filters: &Filters) -> Result<CacheKey> {
    let entity = non_empty("entity", entity)?;
    let normalized = NormalizedFilters::normalize(self.schema(entity), filters);
    Ok(CacheKey {
      entity: entity.to_string(),
      scope: Scope::List,
      discriminator: Discriminator::Filters(normalized),
    })
  }

  pub fn detail_key(&self, entity: &str, id: &str) -> Result<CacheKey> {
    let entity = non_empty("entity", entity)?;
    let id = non_empty("id", id)?;
    Ok(CacheKey {
      entity: entity.to_string(),
      scope: Scope::Detail,
      discriminator: Discriminator::Id(id.to_string()),
    })
  }

  /// Key for a view of `entity_b` rows associated with `entity_a`/`id_a`,
  /// e.g. the groups containing a given source.
  pub fn relation_key(&self, entity_a: &str, id_a: &str, entity_b: &str) -> Result<CacheKey> {
    let entity_a = non_empty("entity", entity_a)?;
    let id_a = non_empty("id", id_a)?;
    let entity_b = non_empty("entity", entity_b)?;
    Ok(CacheKey {
      entity: entity_b.to_string(),
      scope: Scope::Relation,
      discriminator: Discriminator::Related {
        entity: entity_a.to_string(),
        id: id_a.to_string(),
      },
    })
  }
}

fn non_empty<'a>(what: &str, value: &'a str) -> Result<&'a str> {
  let trimmed = value.trim();
  if trimmed.is_empty() {
    Err(Error::invalid_argument(format!("{} must not be empty", what)))
  } else {
    Ok(trimmed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::filters::{FieldDefault, FieldMatch, FieldSpec};
  use proptest::prelude::*;
  use serde_json::{json, Value};

  static SCHEMA: FilterSchema = FilterSchema {
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
    ],
  };

  fn factory() -> KeyFactory {
    KeyFactory::new(&[&SCHEMA])
  }

  fn filters(value: Value) -> Filters {
    value.as_object().cloned().unwrap()
  }

  #[test]
  fn test_default_omission() {
    let keys = factory();
    let explicit = keys
      .list_key("newsletters", &filters(json!({"isArchived": false})))
      .unwrap();
    let implicit = keys.list_key("newsletters", &Filters::new()).unwrap();
    assert_eq!(explicit, implicit);
    assert_eq!(explicit.cache_hash(), implicit.cache_hash());
  }

  #[test]
  fn test_empty_id_is_invalid() {
    let keys = factory();
    assert!(matches!(
      keys.detail_key("newsletters", ""),
      Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
      keys.detail_key("newsletters", "  "),
      Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
      keys.relation_key("newsletter_sources", "", "source_groups"),
      Err(Error::InvalidArgument(_))
    ));
  }

  #[test]
  fn test_scopes_do_not_collide() {
    let keys = factory();
    let detail = keys.detail_key("newsletters", "nl-1").unwrap();
    let relation = keys.relation_key("newsletters", "nl-1", "newsletters").unwrap();
    assert_ne!(detail, relation);
    assert_ne!(detail.cache_hash(), relation.cache_hash());
  }

  #[test]
  fn test_partial_list_match() {
    let keys = factory();
    let archived_from_s1 = keys
      .list_key(
        "newsletters",
        &filters(json!({"isArchived": true, "sourceIds": ["s1"]})),
      )
      .unwrap();
    let archived = keys
      .list_key("newsletters", &filters(json!({"isArchived": true})))
      .unwrap();

    let pattern = KeyPattern::Key(archived.clone());
    assert!(pattern.matches(&archived_from_s1, false));
    assert!(!pattern.matches(&archived_from_s1, true));
    assert!(pattern.matches(&archived, true));
  }

  #[test]
  fn test_region_patterns() {
    let keys = factory();
    let list = keys.list_key("newsletters", &Filters::new()).unwrap();
    let detail = keys.detail_key("newsletters", "nl-1").unwrap();
    let queue = keys
      .relation_key("profiles", "me", "reading_queue")
      .unwrap();
    let groups = keys
      .relation_key("newsletter_sources", "s1", "source_groups")
      .unwrap();

    assert!(list.matches(&KeyPattern::lists("newsletters")));
    assert!(!detail.matches(&KeyPattern::lists("newsletters")));
    assert!(list.matches(&KeyPattern::all_lists()));
    assert!(detail.matches(&KeyPattern::Entity("newsletters".into())));
    assert!(queue.matches(&KeyPattern::relations("reading_queue")));
    assert!(groups.matches(&KeyPattern::RelationsOf {
      entity: "newsletter_sources".into(),
      id: "s1".into(),
    }));
    assert!(!queue.matches(&KeyPattern::RelationsOf {
      entity: "newsletter_sources".into(),
      id: "s1".into(),
    }));
  }

  proptest! {
    #[test]
    fn prop_list_key_ignores_array_order(
      ids in proptest::collection::vec("[a-z]{1,4}", 0..6),
      shift in 0usize..6,
      archived in any::<bool>(),
    ) {
      let keys = factory();
      let mut rotated = ids.clone();
      if !rotated.is_empty() {
        let by = shift % rotated.len();
        rotated.rotate_left(by);
      }
      rotated.reverse();

      let a = keys
        .list_key("newsletters", &filters(json!({"sourceIds": ids, "isArchived": archived})))
        .unwrap();
      let b = keys
        .list_key("newsletters", &filters(json!({"isArchived": archived, "sourceIds": rotated})))
        .unwrap();
      prop_assert_eq!(a.cache_hash(), b.cache_hash());
      prop_assert_eq!(a, b);
    }

    #[test]
    fn prop_list_key_is_deterministic(search in "[ a-z]{0,12}", page in 0i64..5) {
      let keys = factory();
      let f = filters(json!({"search": search, "page": page}));
      prop_assert_eq!(
        keys.list_key("newsletters", &f).unwrap(),
        keys.list_key("newsletters", &f).unwrap()
      );
    }
  }
}

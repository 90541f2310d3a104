//! Pure optimistic transforms.
//!
//! A transform maps the current value of one cache key to its optimistic
//! value. Transforms only read the value they are given and never accumulate
//! hidden deltas, so applying the same transform twice to the same starting
//! value gives the same result as applying it once.

use chrono::Utc;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

use crate::cache::{CacheEntry, CacheKey, Entity, FilterSchema, Page, Scope};

/// Field advanced by every patch.
pub const UPDATED_AT: &str = "updated_at";

pub type CustomTransform =
  Arc<dyn Fn(&CacheKey, Option<&CacheEntry>) -> Option<CacheEntry> + Send + Sync>;

#[derive(Clone)]
pub enum Transform {
  /// Merge `fields` into every copy of the listed entities. List views whose
  /// filter no longer admits a patched entity drop it instead.
  Patch {
    ids: Vec<String>,
    fields: Map<String, Value>,
  },
  /// Flip a boolean field. Resolved into a concrete `Patch` against the most
  /// recent optimistic value before it is applied.
  ToggleFlag { id: String, field: String },
  /// Drop the listed entities from every view; detail entries disappear.
  Remove { ids: Vec<String> },
  /// Add an entity to page-shaped views that admit it and don't already hold it.
  Insert {
    item: Entity,
    position: Option<usize>,
  },
  Custom(CustomTransform),
}

impl Transform {
  /// Patch that also advances `updated_at`.
  pub fn patch(ids: Vec<String>, mut fields: Map<String, Value>) -> Self {
    fields.insert(
      UPDATED_AT.to_string(),
      Value::String(Utc::now().to_rfc3339()),
    );
    Self::Patch { ids, fields }
  }

  pub fn set_flag(id: &str, field: &str, value: bool) -> Self {
    let mut fields = Map::new();
    fields.insert(field.to_string(), Value::Bool(value));
    Self::patch(vec![id.to_string()], fields)
  }

  pub fn toggle_flag(id: &str, field: &str) -> Self {
    Self::ToggleFlag {
      id: id.to_string(),
      field: field.to_string(),
    }
  }

  pub fn remove(ids: Vec<String>) -> Self {
    Self::Remove { ids }
  }

  pub fn insert(item: Entity, position: Option<usize>) -> Self {
    Self::Insert { item, position }
  }

  pub fn custom<F>(f: F) -> Self
  where
    F: Fn(&CacheKey, Option<&CacheEntry>) -> Option<CacheEntry> + Send + Sync + 'static,
  {
    Self::Custom(Arc::new(f))
  }

  /// Turn a toggle into the concrete flag value it means right now. A missing
  /// entity or field reads as `false`. Other transforms are returned unchanged.
  pub fn resolve(self, current: Option<&Entity>) -> Self {
    match self {
      Self::ToggleFlag { id, field } => {
        let value = current
          .and_then(|e| e.get(&field))
          .and_then(Value::as_bool)
          .unwrap_or(false);
        Self::set_flag(&id, &field, !value)
      }
      other => other,
    }
  }

  /// The concrete value a resolved patch writes to `field`.
  pub fn field(&self, field: &str) -> Option<&Value> {
    match self {
      Self::Patch { fields, .. } => fields.get(field),
      _ => None,
    }
  }

  /// Optimistic value for `key`. `None` means the key should hold no value.
  pub fn apply(
    &self,
    key: &CacheKey,
    current: Option<&CacheEntry>,
    schema: Option<&FilterSchema>,
  ) -> Option<CacheEntry> {
    let Some(current) = current else {
      return match self {
        Self::Custom(f) => f(key, None),
        _ => None,
      };
    };

    match self {
      Self::Patch { ids, fields } => Some(patch_entry(key, current, ids, fields, schema)),
      Self::ToggleFlag { id, .. } => self
        .clone()
        .resolve(current.find(id))
        .apply(key, Some(current), schema),
      Self::Remove { ids } => remove_from_entry(current, ids),
      Self::Insert { item, position } => {
        Some(insert_into_entry(key, current, item, *position, schema))
      }
      Self::Custom(f) => f(key, Some(current)),
    }
  }
}

impl fmt::Debug for Transform {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Patch { ids, fields } => f
        .debug_struct("Patch")
        .field("ids", ids)
        .field("fields", fields)
        .finish(),
      Self::ToggleFlag { id, field } => f
        .debug_struct("ToggleFlag")
        .field("id", id)
        .field("field", field)
        .finish(),
      Self::Remove { ids } => f.debug_struct("Remove").field("ids", ids).finish(),
      Self::Insert { item, position } => f
        .debug_struct("Insert")
        .field("item", item)
        .field("position", position)
        .finish(),
      Self::Custom(_) => f.write_str("Custom(..)"),
    }
  }
}

fn has_id(ids: &[String], entity: &Entity) -> bool {
  entity
    .id()
    .is_some_and(|id| ids.iter().any(|wanted| *wanted == id))
}

fn patch_entry(
  key: &CacheKey,
  current: &CacheEntry,
  ids: &[String],
  fields: &Map<String, Value>,
  schema: Option<&FilterSchema>,
) -> CacheEntry {
  match current {
    CacheEntry::Entity(entity) if has_id(ids, entity) => CacheEntry::Entity(entity.patched(fields)),
    CacheEntry::Page(page) => {
      let view = key.filters().filter(|_| key.scope() == Scope::List);
      let mut removed = 0u64;
      let items = page
        .items
        .iter()
        .filter_map(|item| {
          if !has_id(ids, item) {
            return Some(item.clone());
          }
          let patched = item.patched(fields);
          match view {
            Some(filters) if !filters.admits(schema, &patched) => {
              removed += 1;
              None
            }
            _ => Some(patched),
          }
        })
        .collect();
      CacheEntry::Page(Page {
        items,
        total_count: page.total_count.saturating_sub(removed),
        page_info: page.page_info.clone(),
      })
    }
    other => other.clone(),
  }
}

fn remove_from_entry(current: &CacheEntry, ids: &[String]) -> Option<CacheEntry> {
  match current {
    CacheEntry::Entity(entity) if has_id(ids, entity) => None,
    CacheEntry::Page(page) => {
      let before = page.items.len();
      let items: Vec<Entity> = page
        .items
        .iter()
        .filter(|item| !has_id(ids, item))
        .cloned()
        .collect();
      let removed = (before - items.len()) as u64;
      Some(CacheEntry::Page(Page {
        items,
        total_count: page.total_count.saturating_sub(removed),
        page_info: page.page_info.clone(),
      }))
    }
    other => Some(other.clone()),
  }
}

fn insert_into_entry(
  key: &CacheKey,
  current: &CacheEntry,
  item: &Entity,
  position: Option<usize>,
  schema: Option<&FilterSchema>,
) -> CacheEntry {
  let CacheEntry::Page(page) = current else {
    return current.clone();
  };
  let Some(id) = item.id() else {
    return current.clone();
  };
  if page.contains(&id) {
    return current.clone();
  }
  if key.scope() == Scope::List && !key.filters().map_or(true, |f| f.admits(schema, item)) {
    return current.clone();
  }

  let mut items = page.items.clone();
  let at = position.unwrap_or(items.len()).min(items.len());
  items.insert(at, item.clone());
  CacheEntry::Page(Page {
    items,
    total_count: page.total_count + 1,
    page_info: page.page_info.clone(),
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{FieldDefault, FieldMatch, FieldSpec, Filters, KeyFactory, PageInfo};
  use serde_json::json;

  static SCHEMA: FilterSchema = FilterSchema {
    entity: "newsletters",
    fields: &[FieldSpec {
      name: "isArchived",
      column: "is_archived",
      matching: FieldMatch::Eq,
      default: Some(FieldDefault::Bool(false)),
    }],
  };

  fn keys() -> KeyFactory {
    KeyFactory::new(&[&SCHEMA])
  }

  fn item(id: &str, archived: bool) -> Entity {
    Entity::from_value(json!({"id": id, "is_archived": archived, "is_liked": false})).unwrap()
  }

  fn page(ids: &[&str]) -> CacheEntry {
    CacheEntry::Page(Page {
      items: ids.iter().map(|id| item(id, false)).collect(),
      total_count: ids.len() as u64,
      page_info: PageInfo::default(),
    })
  }

  fn archive(id: &str) -> Transform {
    let mut fields = Map::new();
    fields.insert("is_archived".into(), json!(true));
    Transform::patch(vec![id.to_string()], fields)
  }

  #[test]
  fn test_archive_removes_from_active_view() {
    let key = keys()
      .list_key("newsletters", json!({"isArchived": false}).as_object().unwrap())
      .unwrap();
    let next = archive("b")
      .apply(&key, Some(&page(&["a", "b", "c"])), Some(&SCHEMA))
      .unwrap();
    let next = next.as_page().unwrap();
    assert_eq!(next.total_count, 2);
    assert!(!next.contains("b"));
    assert!(next
      .items
      .iter()
      .all(|i| i.get("is_archived") != Some(&json!(true))));
  }

  #[test]
  fn test_archive_patches_in_place_in_archived_view() {
    let key = keys()
      .list_key("newsletters", json!({"isArchived": true}).as_object().unwrap())
      .unwrap();
    let mut current = page(&["b"]);
    if let CacheEntry::Page(p) = &mut current {
      p.items[0] = item("b", true);
    }
    let next = archive("b").apply(&key, Some(&current), Some(&SCHEMA)).unwrap();
    assert_eq!(next.as_page().unwrap().total_count, 1);
  }

  #[test]
  fn test_transforms_are_idempotent() {
    let key = keys().list_key("newsletters", &Filters::new()).unwrap();
    let start = page(&["a", "b", "c"]);
    for transform in [archive("b"), Transform::remove(vec!["a".into()]), Transform::set_flag("c", "is_liked", true)] {
      let once = transform.apply(&key, Some(&start), Some(&SCHEMA));
      let twice = transform.apply(&key, once.as_ref(), Some(&SCHEMA));
      assert_eq!(once, twice);
    }
  }

  #[test]
  fn test_toggle_resolves_against_current_value() {
    let liked = Entity::from_value(json!({"id": "a", "is_liked": true})).unwrap();
    let resolved = Transform::toggle_flag("a", "is_liked").resolve(Some(&liked));
    assert_eq!(resolved.field("is_liked"), Some(&json!(false)));
    assert!(resolved.field(UPDATED_AT).is_some());

    let resolved = Transform::toggle_flag("a", "is_liked").resolve(None);
    assert_eq!(resolved.field("is_liked"), Some(&json!(true)));
  }

  #[test]
  fn test_remove_detail_and_absent_values() {
    let key = keys().detail_key("newsletters", "a").unwrap();
    let detail = CacheEntry::Entity(item("a", false));
    assert_eq!(Transform::remove(vec!["a".into()]).apply(&key, Some(&detail), None), None);
    assert_eq!(archive("a").apply(&key, None, None), None);
  }

  #[test]
  fn test_insert_skips_duplicates_and_excluded_views() {
    let key = keys().list_key("newsletters", &Filters::new()).unwrap();
    let start = page(&["a"]);

    let dup = Transform::insert(item("a", false), Some(0)).apply(&key, Some(&start), Some(&SCHEMA));
    assert_eq!(dup.as_ref(), Some(&start));

    let archived = Transform::insert(item("z", true), None).apply(&key, Some(&start), Some(&SCHEMA));
    assert_eq!(archived.as_ref(), Some(&start));

    let added = Transform::insert(item("z", false), Some(0))
      .apply(&key, Some(&start), Some(&SCHEMA))
      .unwrap();
    let added = added.as_page().unwrap();
    assert_eq!(added.position("z"), Some(0));
    assert_eq!(added.total_count, 2);
  }
}

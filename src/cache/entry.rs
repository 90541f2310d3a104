//! Values stored in the cache and metadata about where they came from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

use super::filters::scalar_text;

/// A remotely-owned row. The cache holds copies, never the source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Entity(Map<String, Value>);

impl Entity {
  /// Build an entity from a JSON object.
  pub fn from_value(value: Value) -> Result<Self> {
    match value {
      Value::Object(fields) => Ok(Self(fields)),
      other => Err(Error::invalid_argument(format!(
        "entity must be a JSON object, got {}",
        other
      ))),
    }
  }

  /// Stable identifier. Integer ids are rendered as strings.
  pub fn id(&self) -> Option<String> {
    match self.0.get("id") {
      None | Some(Value::Null) => None,
      Some(v) => Some(scalar_text(v)),
    }
  }

  pub fn get(&self, field: &str) -> Option<&Value> {
    self.0.get(field)
  }

  /// Copy of this entity with `patch` merged over its fields.
  pub fn patched(&self, patch: &Map<String, Value>) -> Self {
    let mut fields = self.0.clone();
    for (k, v) in patch {
      fields.insert(k.clone(), v.clone());
    }
    Self(fields)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
  pub offset: u64,
  pub limit: u64,
  pub has_more: bool,
}

/// A page-shaped list result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
  pub items: Vec<Entity>,
  pub total_count: u64,
  pub page_info: PageInfo,
}

impl Page {
  pub fn position(&self, id: &str) -> Option<usize> {
    self
      .items
      .iter()
      .position(|item| item.id().as_deref() == Some(id))
  }

  pub fn contains(&self, id: &str) -> bool {
    self.position(id).is_some()
  }
}

/// The value stored under a cache key. Replaced wholesale, never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CacheEntry {
  Entity(Entity),
  Page(Page),
  /// Derived value such as an unread counter
  Aggregate(Value),
}

impl CacheEntry {
  pub fn as_entity(&self) -> Option<&Entity> {
    match self {
      Self::Entity(entity) => Some(entity),
      _ => None,
    }
  }

  pub fn as_page(&self) -> Option<&Page> {
    match self {
      Self::Page(page) => Some(page),
      _ => None,
    }
  }

  /// Find an entity by id, either the entry itself or a page item.
  pub fn find(&self, id: &str) -> Option<&Entity> {
    match self {
      Self::Entity(entity) if entity.id().as_deref() == Some(id) => Some(entity),
      Self::Page(page) => page.position(id).map(|i| &page.items[i]),
      _ => None,
    }
  }
}

/// Result from a cache read, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  /// When the data was written to the cache (if served from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(data: T, cached_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached_at),
    }
  }

  /// Network unavailable, serving whatever the cache holds.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheResult<U> {
    CacheResult {
      data: f(self.data),
      source: self.source,
      cached_at: self.cached_at,
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  Network,
  CacheFresh,
  /// Served from cache while stale, e.g. because the read was cancelled
  CacheStale,
  /// Network failed, serving cached data
  Offline,
}

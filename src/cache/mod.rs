//! Structured client-side cache.
//!
//! This module provides the entity/list/detail-shaped cache the rest of the
//! engine works against:
//! - Canonical, comparable keys derived from normalized filters
//! - Patterns selecting regions of the cache (all lists, relation views, ...)
//! - A key-scoped store adapter with cancellable, deduplicated reads
//! - Stale-while-offline reads via [`CacheResult`]

mod entry;
mod filters;
mod key;
mod store;

pub use entry::{CacheEntry, CacheResult, CacheSource, Entity, Page, PageInfo};
pub(crate) use filters::scalar_text;
pub use filters::{
  FieldDefault, FieldMatch, FieldSpec, FilterSchema, Filters, NormalizedFilters,
};
pub use key::{CacheKey, KeyFactory, KeyPattern, Scope};
pub use store::{CacheStore, QueryCache, RefetchPolicy};

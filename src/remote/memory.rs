//! In-memory backend for tests.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::cache::{scalar_text, Entity, Filters, KeyFactory, NormalizedFilters, Page, PageInfo};
use crate::error::RemoteError;
use crate::newsletters::schema::SCHEMAS;

use super::{MutationOp, Pagination, RemoteExecutor};

#[derive(Default)]
pub(crate) struct MemoryExecutor {
  tables: Mutex<HashMap<String, Vec<Entity>>>,
  keys: KeyFactory,
  next_id: AtomicUsize,
  fail_mutations: AtomicBool,
  pub fetches: AtomicUsize,
  pub mutations: AtomicUsize,
}

impl MemoryExecutor {
  pub fn new() -> Self {
    Self {
      keys: KeyFactory::new(SCHEMAS),
      ..Default::default()
    }
  }

  pub fn insert(&self, table: &str, row: Value) {
    let entity = Entity::from_value(row).unwrap();
    self
      .tables
      .lock()
      .unwrap()
      .entry(table.to_string())
      .or_default()
      .push(entity);
  }

  pub fn rows(&self, table: &str) -> Vec<Entity> {
    self
      .tables
      .lock()
      .unwrap()
      .get(table)
      .cloned()
      .unwrap_or_default()
  }

  pub fn row(&self, table: &str, id: &str) -> Option<Entity> {
    self
      .rows(table)
      .into_iter()
      .find(|row| row.id().as_deref() == Some(id))
  }

  pub fn fail_mutations(&self, fail: bool) {
    self.fail_mutations.store(fail, Ordering::SeqCst);
  }

  fn admits(&self, table: &str, filters: &Filters, row: &Entity) -> bool {
    let schema = self.keys.schema(table);
    let normalized = NormalizedFilters::normalize(schema, filters);
    let declared = normalized.admits(schema, row);
    let undeclared = normalized
      .iter()
      .filter(|(name, _)| schema.and_then(|s| s.field(name)).is_none())
      .all(|(name, value)| {
        row
          .get(name)
          .is_some_and(|actual| scalar_text(actual) == scalar_text(value))
      });
    declared && undeclared
  }
}

#[async_trait]
impl RemoteExecutor for MemoryExecutor {
  async fn fetch(
    &self,
    table: &str,
    filters: &Filters,
    pagination: Pagination,
  ) -> Result<Page, RemoteError> {
    self.fetches.fetch_add(1, Ordering::SeqCst);
    let matching: Vec<Entity> = self
      .rows(table)
      .into_iter()
      .filter(|row| self.admits(table, filters, row))
      .collect();
    let total_count = matching.len() as u64;
    let items: Vec<Entity> = matching
      .into_iter()
      .skip(pagination.offset as usize)
      .take(pagination.limit.map_or(usize::MAX, |l| l as usize))
      .collect();
    let fetched = items.len() as u64;
    Ok(Page {
      items,
      total_count,
      page_info: PageInfo {
        offset: pagination.offset,
        limit: pagination.limit.unwrap_or(fetched),
        has_more: pagination.offset + fetched < total_count,
      },
    })
  }

  async fn fetch_by_id(&self, table: &str, id: &str) -> Result<Entity, RemoteError> {
    self.fetches.fetch_add(1, Ordering::SeqCst);
    self.row(table, id).ok_or_else(|| RemoteError::NotFound {
      table: table.to_string(),
      id: id.to_string(),
    })
  }

  async fn mutate(
    &self,
    table: &str,
    op: MutationOp,
    payload: Value,
  ) -> Result<Vec<Entity>, RemoteError> {
    self.mutations.fetch_add(1, Ordering::SeqCst);
    if self.fail_mutations.load(Ordering::SeqCst) {
      return Err(RemoteError::Rejected {
        status: 503,
        message: "backend unavailable".into(),
      });
    }

    let mut tables = self.tables.lock().unwrap();
    let rows = tables.entry(table.to_string()).or_default();
    match op {
      MutationOp::Insert => {
        let mut row = payload;
        if row.get("id").is_none() {
          let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
          row["id"] = json!(format!("row-{}", id));
        }
        let entity = Entity::from_value(row).map_err(|e| RemoteError::decode(e.to_string()))?;
        rows.push(entity.clone());
        Ok(vec![entity])
      }
      MutationOp::Update { ids } => {
        let fields = payload.as_object().cloned().unwrap_or_default();
        let mut updated = Vec::new();
        for row in rows.iter_mut() {
          if row.id().is_some_and(|id| ids.contains(&id)) {
            *row = row.patched(&fields);
            updated.push(row.clone());
          }
        }
        if updated.is_empty() {
          return Err(RemoteError::NotFound {
            table: table.to_string(),
            id: ids.join(","),
          });
        }
        Ok(updated)
      }
      MutationOp::Delete { ids } => {
        let (removed, kept): (Vec<Entity>, Vec<Entity>) = rows
          .drain(..)
          .partition(|row| row.id().is_some_and(|id| ids.contains(&id)));
        *rows = kept;
        Ok(removed)
      }
      MutationOp::DeleteMatching { columns } => {
        let (removed, kept): (Vec<Entity>, Vec<Entity>) = rows.drain(..).partition(|row| {
          columns.iter().all(|(name, value)| {
            row
              .get(name)
              .is_some_and(|actual| scalar_text(actual) == scalar_text(value))
          })
        });
        *rows = kept;
        Ok(removed)
      }
    }
  }
}

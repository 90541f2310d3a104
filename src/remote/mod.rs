//! Remote query executor.
//!
//! The engine talks to the backend only through [`RemoteExecutor`]: paged
//! reads of a table under a filter set, and row mutations. It never retries;
//! callers decide whether a failed call is worth repeating.

mod api_types;
#[cfg(test)]
pub(crate) mod memory;
mod rest;

use async_trait::async_trait;
use serde_json::Value;

use crate::cache::{Entity, Filters, Page};
use crate::error::RemoteError;

pub use rest::RestExecutor;

/// Window of a paged read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pagination {
  pub offset: u64,
  /// `None` reads to the end of the table
  pub limit: Option<u64>,
}

impl Pagination {
  pub fn page(page: u64, size: u64) -> Self {
    Self {
      offset: page * size,
      limit: Some(size),
    }
  }

  /// A read that only wants the total count.
  pub fn count_only() -> Self {
    Self {
      offset: 0,
      limit: Some(0),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOp {
  Insert,
  /// Patch the listed rows with the payload's fields
  Update { ids: Vec<String> },
  Delete { ids: Vec<String> },
  /// Delete every row whose columns equal the given values
  DeleteMatching { columns: Filters },
}

impl MutationOp {
  pub fn update(id: &str) -> Self {
    Self::Update {
      ids: vec![id.to_string()],
    }
  }
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync + 'static {
  /// Rows of `table` matching `filters`. Declared filter defaults apply even
  /// when the field is absent.
  async fn fetch(
    &self,
    table: &str,
    filters: &Filters,
    pagination: Pagination,
  ) -> Result<Page, RemoteError>;

  /// One row by id. List defaults do not apply, so archived rows are found.
  async fn fetch_by_id(&self, table: &str, id: &str) -> Result<Entity, RemoteError>;

  /// Apply `op` and return the affected rows as stored.
  async fn mutate(
    &self,
    table: &str,
    op: MutationOp,
    payload: Value,
  ) -> Result<Vec<Entity>, RemoteError>;
}

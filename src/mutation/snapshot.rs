//! Snapshots of cache entries taken immediately before an optimistic write.
//!
//! Rollback data is plain values rather than captured closures: each entry
//! records the key and what it held (or that it held nothing), and
//! [`SnapshotEntry::restore`] turns that into the single write that puts the
//! key back.

use serde::Serialize;

use crate::cache::{CacheEntry, CacheKey, CacheStore};
use crate::error::{Error, Result};

/// What a key held before a mutation touched it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "value", rename_all = "lowercase")]
pub enum Prior {
  Present(CacheEntry),
  Absent,
}

impl Prior {
  pub fn as_entry(&self) -> Option<&CacheEntry> {
    match self {
      Self::Present(entry) => Some(entry),
      Self::Absent => None,
    }
  }
}

impl From<Option<CacheEntry>> for Prior {
  fn from(value: Option<CacheEntry>) -> Self {
    match value {
      Some(entry) => Self::Present(entry),
      None => Self::Absent,
    }
  }
}

/// A single store write that restores a key.
#[derive(Debug, Clone, PartialEq)]
pub enum Restore {
  Set(CacheKey, CacheEntry),
  Remove(CacheKey),
}

impl Restore {
  pub fn new(key: CacheKey, prior: Prior) -> Self {
    match prior {
      Prior::Present(entry) => Self::Set(key, entry),
      Prior::Absent => Self::Remove(key),
    }
  }

  pub fn write_to<S: CacheStore + ?Sized>(self, store: &S) -> Result<()> {
    match self {
      Self::Set(key, entry) => store.set(&key, entry),
      Self::Remove(key) => store.remove(&key),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotEntry {
  pub key: CacheKey,
  pub prior: Prior,
}

impl SnapshotEntry {
  pub fn restore(&self) -> Restore {
    Restore::new(self.key.clone(), self.prior.clone())
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
  entries: Vec<SnapshotEntry>,
}

impl Snapshot {
  pub fn new(entries: Vec<SnapshotEntry>) -> Self {
    Self { entries }
  }

  pub fn entries(&self) -> &[SnapshotEntry] {
    &self.entries
  }

  /// Write every key back, last-taken first, using the write `plan` picks
  /// for each entry. Each key is restored independently; failures are
  /// collected rather than stopping the rollback.
  pub fn rollback<S, F>(&self, store: &S, mut plan: F) -> Vec<Error>
  where
    S: CacheStore + ?Sized,
    F: FnMut(&SnapshotEntry) -> Restore,
  {
    self
      .entries
      .iter()
      .rev()
      .filter_map(|entry| {
        plan(entry)
          .write_to(store)
          .err()
          .map(|e| Error::RollbackFailed {
            key: entry.key.clone(),
            reason: e.to_string(),
          })
      })
      .collect()
  }
}

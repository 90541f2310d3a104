//! Query observers: a view's handle on one cache key.
//!
//! Inspired by TanStack Query. A view subscribes to a key with a fetcher; while
//! the observer is alive the key counts as *active*, which decides whether an
//! invalidation refetches it. The observer polls the cache for changes instead
//! of holding a callback.
//!
//! # Example
//!
//! ```ignore
//! let mut observer = cache.observe(key, fetcher);
//! observer.fetch();
//!
//! // In event loop tick
//! if observer.poll() {
//!     // Cached value changed (fetch, optimistic write, rollback), re-render
//! }
//!
//! match observer.state() {
//!     QueryState::Loading => render_spinner(),
//!     QueryState::Success(entry) => render_entry(&entry),
//!     QueryState::Error(e) => render_error(&e),
//!     QueryState::Idle => {}
//! }
//! ```

use futures::future::BoxFuture;
use std::sync::Arc;

use crate::cache::{CacheEntry, CacheKey, QueryCache};
use crate::error::RemoteError;

/// A factory for futures that read one cache key from the remote store.
pub type QueryFn =
  Arc<dyn Fn() -> BoxFuture<'static, Result<CacheEntry, RemoteError>> + Send + Sync>;

/// The state of a query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryState<T> {
  /// Nothing cached and nothing in flight
  Idle,
  /// First fetch in flight
  Loading,
  Success(T),
  /// Last fetch failed and nothing is cached
  Error(String),
}

impl<T> QueryState<T> {
  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

/// An active subscription to one cache key. Dropping it makes the key inactive.
pub struct QueryObserver {
  cache: QueryCache,
  key: CacheKey,
  seen_version: u64,
}

impl QueryObserver {
  pub(crate) fn new(cache: QueryCache, key: CacheKey, fetcher: QueryFn) -> Self {
    cache.attach_observer(&key, fetcher);
    Self {
      cache,
      key,
      seen_version: 0,
    }
  }

  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  pub fn state(&self) -> QueryState<CacheEntry> {
    self.cache.state(&self.key)
  }

  pub fn data(&self) -> Option<CacheEntry> {
    self.state().data().cloned()
  }

  /// Start a fetch in the background unless the value is fresh or a fetch is
  /// already in flight.
  pub fn fetch(&self) {
    let cache = self.cache.clone();
    let key = self.key.clone();
    tokio::spawn(async move {
      if let Err(e) = cache.fetch_registered(&key).await {
        tracing::debug!(key = %key, error = %e, "observer fetch failed");
      }
    });
  }

  /// Returns `true` if the cached value changed since the last poll.
  /// Call this in your event loop tick handler.
  pub fn poll(&mut self) -> bool {
    let version = self.cache.version(&self.key);
    if version != self.seen_version {
      self.seen_version = version;
      true
    } else {
      false
    }
  }
}

impl Drop for QueryObserver {
  fn drop(&mut self) {
    self.cache.detach_observer(&self.key);
  }
}

impl std::fmt::Debug for QueryObserver {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryObserver")
      .field("key", &self.key)
      .field("seen_version", &self.seen_version)
      .finish_non_exhaustive()
  }
}

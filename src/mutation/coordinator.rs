//! Optimistic mutation coordinator.
//!
//! A mutation runs in three phases:
//!
//! 1. Under the locks of every affected key: cancel in-flight reads (and wait
//!    for them to stop), snapshot each key, write the optimistic value.
//! 2. Call the remote side with no locks held.
//! 3. Under the same locks: confirm the optimistic layers and schedule a
//!    refresh, or roll every key back.
//!
//! Key locks are FIFO and always taken in key order, so mutations sharing a
//! key apply and resolve in call order and never deadlock.

use futures::future::BoxFuture;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::cache::{CacheEntry, CacheKey, CacheStore, Entity, KeyFactory, KeyPattern, RefetchPolicy, Scope};
use crate::error::{Error, RemoteError, Result};
use crate::invalidation::{InvalidateOptions, InvalidationBatcher};

use super::ledger::{Ledger, MutationId, RollbackPlan};
use super::snapshot::{Prior, Restore, Snapshot, SnapshotEntry};
use super::transform::Transform;

/// The remote half of a mutation. Receives the transform as resolved against
/// the cache, so a toggle sends the value the user actually sees.
pub type RemoteCall<T> =
  Box<dyn FnOnce(&Transform) -> BoxFuture<'static, Result<T, RemoteError>> + Send>;

pub struct OptimisticMutation<T> {
  operation: String,
  ids: Vec<String>,
  affected: Vec<KeyPattern>,
  transform: Transform,
  remote: RemoteCall<T>,
  debounce_key: Option<String>,
}

impl<T> OptimisticMutation<T> {
  pub fn new<F>(operation: impl Into<String>, transform: Transform, remote: F) -> Self
  where
    F: FnOnce(&Transform) -> BoxFuture<'static, Result<T, RemoteError>> + Send + 'static,
  {
    Self {
      operation: operation.into(),
      ids: Vec::new(),
      affected: Vec::new(),
      transform,
      remote: Box::new(remote),
      debounce_key: None,
    }
  }

  /// Ids handed to the invalidation policy once the write is confirmed.
  pub fn with_ids(mut self, ids: Vec<String>) -> Self {
    self.ids = ids;
    self
  }

  /// Add a region the optimistic write touches. `Key` patterns name one key
  /// (which may be absent); other patterns cover every cached key they match.
  pub fn affecting(mut self, pattern: KeyPattern) -> Self {
    self.affected.push(pattern);
    self
  }

  pub fn debounce_key(mut self, key: impl Into<String>) -> Self {
    self.debounce_key = Some(key.into());
    self
  }
}

impl<T> std::fmt::Debug for OptimisticMutation<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("OptimisticMutation")
      .field("operation", &self.operation)
      .field("ids", &self.ids)
      .field("affected", &self.affected)
      .field("transform", &self.transform)
      .field("debounce_key", &self.debounce_key)
      .finish_non_exhaustive()
  }
}

struct Inner<S> {
  store: Arc<S>,
  keys: Arc<KeyFactory>,
  batcher: InvalidationBatcher<S>,
  locks: Mutex<HashMap<CacheKey, Arc<AsyncMutex<()>>>>,
  ledger: Mutex<Ledger>,
  next_id: AtomicU64,
}

pub struct MutationCoordinator<S> {
  inner: Arc<Inner<S>>,
}

impl<S> Clone for MutationCoordinator<S> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<S: CacheStore> MutationCoordinator<S> {
  pub fn new(store: Arc<S>, keys: Arc<KeyFactory>, batcher: InvalidationBatcher<S>) -> Self {
    Self {
      inner: Arc::new(Inner {
        store,
        keys,
        batcher,
        locks: Mutex::new(HashMap::new()),
        ledger: Mutex::new(Ledger::default()),
        next_id: AtomicU64::new(1),
      }),
    }
  }

  pub fn store(&self) -> &Arc<S> {
    &self.inner.store
  }

  pub fn batcher(&self) -> &InvalidationBatcher<S> {
    &self.inner.batcher
  }

  /// Run `mutation` optimistically.
  ///
  /// On success the operation's invalidation policy is scheduled and the
  /// remote result returned. On failure every touched key is restored before
  /// the remote error is returned as [`Error::RemoteMutationFailed`]; keys that
  /// could not be restored are listed in it.
  pub async fn run_optimistic<T>(&self, mutation: OptimisticMutation<T>) -> Result<T> {
    let OptimisticMutation {
      operation,
      ids,
      affected,
      transform,
      remote,
      debounce_key,
    } = mutation;
    let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
    let keys = self.resolve_keys(&affected);

    let (transform, snapshot) = {
      let _guards = self.lock_keys(&keys).await;
      for pattern in &affected {
        let exact = matches!(pattern, KeyPattern::Key(_));
        self.inner.store.cancel_matching(pattern, exact).await;
      }
      let transform = self.resolve_transform(transform, &keys);
      let snapshot = self.apply(id, &keys, &transform)?;
      (transform, snapshot)
    };
    self.prune_locks();
    debug!(operation = %operation, mutation = id, keys = snapshot.entries().len(), "optimistic write applied");

    let outcome = remote(&transform).await;

    let touched: Vec<CacheKey> = snapshot.entries().iter().map(|e| e.key.clone()).collect();
    let guards = self.lock_keys(&touched).await;
    match outcome {
      Ok(value) => {
        self.settle(id, &touched);
        drop(guards);
        self.prune_locks();

        if let Err(e) =
          self
            .inner
            .batcher
            .request_invalidation_for_operation(&operation, &ids, debounce_key.as_deref())
        {
          warn!(operation = %operation, error = %e, "could not schedule invalidation");
        }
        Ok(value)
      }
      Err(source) => {
        let rollback_failures = self.rollback(id, &snapshot);
        drop(guards);
        self.prune_locks();

        warn!(
          operation = %operation,
          error = %source,
          rollback_failures = rollback_failures.len(),
          "mutation failed, optimistic write rolled back"
        );
        Err(Error::RemoteMutationFailed {
          operation,
          source,
          rollback_failures,
        })
      }
    }
  }

  /// Concrete keys for `affected`, sorted and deduplicated.
  fn resolve_keys(&self, affected: &[KeyPattern]) -> Vec<CacheKey> {
    let mut keys = BTreeSet::new();
    for pattern in affected {
      match pattern {
        KeyPattern::Key(key) => {
          keys.insert(key.clone());
        }
        region => keys.extend(self.inner.store.find_all_matching(region, false)),
      }
    }
    keys.into_iter().collect()
  }

  /// Resolve a toggle against the most recent optimistic copy of its entity,
  /// preferring detail keys over list pages.
  fn resolve_transform(&self, transform: Transform, keys: &[CacheKey]) -> Transform {
    let toggled = match &transform {
      Transform::ToggleFlag { id, .. } => Some(id.clone()),
      _ => None,
    };
    let Some(id) = toggled else {
      return transform;
    };
    let details = keys.iter().filter(|k| k.scope() == Scope::Detail);
    let views = keys.iter().filter(|k| k.scope() != Scope::Detail);
    let current: Option<Entity> = details.chain(views).find_map(|key| {
      self
        .inner
        .store
        .get(key)
        .and_then(|entry| entry.find(&id).cloned())
    });
    transform.resolve(current.as_ref())
  }

  fn apply(&self, id: MutationId, keys: &[CacheKey], transform: &Transform) -> Result<Snapshot> {
    let store = self.inner.store.as_ref();
    let mut entries = Vec::new();

    for key in keys {
      let current = store.get(key);
      let next = transform.apply(key, current.as_ref(), self.inner.keys.schema(key.entity()));
      if next == current {
        continue;
      }
      let prior = Prior::from(current);

      if let Err(e) = write(store, key, next) {
        let failures = self.rollback(id, &Snapshot::new(entries));
        warn!(key = %key, error = %e, rollback_failures = failures.len(), "optimistic write failed");
        return Err(e);
      }
      self.ledger().record(key, id, &prior, transform);
      entries.push(SnapshotEntry {
        key: key.clone(),
        prior,
      });
    }
    Ok(Snapshot::new(entries))
  }

  fn settle(&self, id: MutationId, keys: &[CacheKey]) {
    let mut ledger = self.ledger();
    for key in keys {
      ledger.settle(key, id, self.inner.keys.schema(key.entity()));
    }
  }

  /// Restore every key in `snapshot`, last first. A key another pending
  /// mutation has written on top of is re-derived instead of overwritten, and
  /// refreshed once the store settles.
  fn rollback(&self, id: MutationId, snapshot: &Snapshot) -> Vec<Error> {
    let mut rederived = Vec::new();
    let failures = {
      let mut ledger = self.ledger();
      snapshot.rollback(self.inner.store.as_ref(), |entry| {
        let schema = self.inner.keys.schema(entry.key.entity());
        match ledger.rollback(&entry.key, id, schema) {
          RollbackPlan::Verbatim => entry.restore(),
          RollbackPlan::Rederived(value) => {
            rederived.push(entry.key.clone());
            Restore::new(entry.key.clone(), value)
          }
        }
      })
    };
    for failure in &failures {
      warn!(error = %failure, "rollback incomplete");
    }

    for key in rederived {
      debug!(key = %key, "re-derived after overlapping rollback");
      self.inner.batcher.request_invalidation(
        KeyPattern::Key(key),
        InvalidateOptions {
          exact: true,
          refetch: RefetchPolicy::Active,
        },
      );
    }
    failures
  }

  async fn lock_keys(&self, keys: &[CacheKey]) -> Vec<OwnedMutexGuard<()>> {
    let mut sorted = keys.to_vec();
    sorted.sort();
    sorted.dedup();

    let mut guards = Vec::with_capacity(sorted.len());
    for key in sorted {
      let lock = Arc::clone(self.locks().entry(key).or_default());
      guards.push(lock.lock_owned().await);
    }
    guards
  }

  /// Forget locks nobody holds or waits on.
  fn prune_locks(&self) {
    self.locks().retain(|_, lock| Arc::strong_count(lock) > 1);
  }

  fn locks(&self) -> MutexGuard<'_, HashMap<CacheKey, Arc<AsyncMutex<()>>>> {
    self.inner.locks.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn ledger(&self) -> MutexGuard<'_, Ledger> {
    self.inner.ledger.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

fn write<S: CacheStore + ?Sized>(store: &S, key: &CacheKey, value: Option<CacheEntry>) -> Result<()> {
  match value {
    Some(entry) => store.set(key, entry),
    None => store.remove(key),
  }
}

//! Cache store adapter and the in-memory reactive query cache behind it.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, RemoteError, Result};
use crate::query::{QueryFn, QueryObserver, QueryState};

use super::entry::{CacheEntry, CacheResult};
use super::key::{CacheKey, KeyPattern};

/// Which invalidated keys get refetched immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefetchPolicy {
  /// Keys with at least one observer
  Active,
  /// Keys nobody observes
  Inactive,
  All,
  /// Mark stale only
  None,
}

/// Key-scoped capability surface the engine composes against.
///
/// All components read and write the cache through these operations; nothing
/// replaces the store wholesale.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
  fn get(&self, key: &CacheKey) -> Option<CacheEntry>;

  fn set(&self, key: &CacheKey, value: CacheEntry) -> Result<()>;

  /// Drop the value under `key`.
  fn remove(&self, key: &CacheKey) -> Result<()>;

  fn find_all_matching(&self, pattern: &KeyPattern, exact: bool) -> Vec<CacheKey>;

  /// Cancel in-flight reads for matching keys. Returns once every cancelled
  /// read has acknowledged, with the number of reads cancelled.
  async fn cancel_matching(&self, pattern: &KeyPattern, exact: bool) -> usize;

  /// Mark matching keys stale and refetch those selected by `refetch`.
  async fn invalidate(&self, pattern: &KeyPattern, exact: bool, refetch: RefetchPolicy)
    -> Result<()>;
}

type Waiter = oneshot::Sender<Result<CacheEntry, RemoteError>>;

struct InFlight {
  handle: JoinHandle<()>,
  waiters: Vec<Waiter>,
}

#[derive(Default)]
struct Slot {
  value: Option<CacheEntry>,
  updated_at: Option<DateTime<Utc>>,
  stale: bool,
  /// Bumped on every write so observers can detect changes
  version: u64,
  observers: usize,
  fetcher: Option<QueryFn>,
  /// Bumped when an in-flight read is cancelled or superseded; a read only
  /// lands if the generation it started with is still current
  generation: u64,
  in_flight: Option<InFlight>,
  last_error: Option<String>,
}

struct Inner {
  slots: Mutex<HashMap<CacheKey, Slot>>,
  stale_time: Duration,
  fetches: AtomicUsize,
}

/// In-memory reactive query cache.
///
/// Reads are deduplicated per key, run on spawned tasks, and can be cancelled.
/// Cloning is cheap and shares the same cache.
#[derive(Clone)]
pub struct QueryCache {
  inner: Arc<Inner>,
}

impl QueryCache {
  pub fn new(stale_time: Duration) -> Self {
    Self {
      inner: Arc::new(Inner {
        slots: Mutex::new(HashMap::new()),
        stale_time,
        fetches: AtomicUsize::new(0),
      }),
    }
  }

  fn slots(&self) -> MutexGuard<'_, HashMap<CacheKey, Slot>> {
    self
      .inner
      .slots
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn is_expired(&self, cached_at: DateTime<Utc>) -> bool {
    Utc::now() - cached_at > self.inner.stale_time
  }

  /// Number of network reads started since creation.
  pub fn fetch_count(&self) -> usize {
    self.inner.fetches.load(Ordering::SeqCst)
  }

  pub fn is_stale(&self, key: &CacheKey) -> bool {
    self.slots().get(key).map_or(true, |slot| {
      slot.stale || slot.updated_at.map_or(true, |at| self.is_expired(at))
    })
  }

  pub fn is_fetching(&self, key: &CacheKey) -> bool {
    self
      .slots()
      .get(key)
      .is_some_and(|slot| slot.in_flight.is_some())
  }

  pub fn observer_count(&self, key: &CacheKey) -> usize {
    self.slots().get(key).map_or(0, |slot| slot.observers)
  }

  /// Subscribe to `key`. The key counts as active while the observer lives.
  pub fn observe(&self, key: CacheKey, fetcher: QueryFn) -> QueryObserver {
    QueryObserver::new(self.clone(), key, fetcher)
  }

  pub(crate) fn attach_observer(&self, key: &CacheKey, fetcher: QueryFn) {
    let mut slots = self.slots();
    let slot = slots.entry(key.clone()).or_default();
    slot.observers += 1;
    slot.fetcher = Some(fetcher);
  }

  pub(crate) fn detach_observer(&self, key: &CacheKey) {
    if let Some(slot) = self.slots().get_mut(key) {
      slot.observers = slot.observers.saturating_sub(1);
    }
  }

  pub(crate) fn version(&self, key: &CacheKey) -> u64 {
    self.slots().get(key).map_or(0, |slot| slot.version)
  }

  pub fn state(&self, key: &CacheKey) -> QueryState<CacheEntry> {
    let slots = self.slots();
    match slots.get(key) {
      None => QueryState::Idle,
      Some(slot) => match (&slot.value, &slot.in_flight, &slot.last_error) {
        (Some(value), _, _) => QueryState::Success(value.clone()),
        (None, Some(_), _) => QueryState::Loading,
        (None, None, Some(error)) => QueryState::Error(error.clone()),
        (None, None, None) => QueryState::Idle,
      },
    }
  }

  /// Cache-first read.
  ///
  /// 1. Fresh cached value: return immediately
  /// 2. Otherwise join or start a network read
  /// 3. On network failure, serve the stale value if there is one
  /// 4. If the read is cancelled (e.g. by an optimistic write), serve
  ///    whatever the cache now holds
  pub async fn fetch(&self, key: &CacheKey, fetcher: QueryFn) -> Result<CacheResult<CacheEntry>> {
    let receiver = {
      let mut slots = self.slots();
      let slot = slots.entry(key.clone()).or_default();
      slot.fetcher = Some(fetcher);
      if let Some(fresh) = self.fresh_value(slot) {
        return Ok(fresh);
      }
      self.start_fetch(key, slot)?
    };
    self.await_read(key, receiver).await
  }

  /// Like [`fetch`](Self::fetch), using the fetcher registered for `key`.
  pub async fn fetch_registered(&self, key: &CacheKey) -> Result<CacheResult<CacheEntry>> {
    let receiver = {
      let mut slots = self.slots();
      let slot = slots
        .get_mut(key)
        .ok_or_else(|| Error::store(format!("no fetcher registered for {}", key)))?;
      if let Some(fresh) = self.fresh_value(slot) {
        return Ok(fresh);
      }
      self.start_fetch(key, slot)?
    };
    self.await_read(key, receiver).await
  }

  fn fresh_value(&self, slot: &Slot) -> Option<CacheResult<CacheEntry>> {
    match (&slot.value, slot.updated_at) {
      (Some(value), Some(at)) if !slot.stale && !self.is_expired(at) => {
        Some(CacheResult::from_cache(value.clone(), at, false))
      }
      _ => None,
    }
  }

  /// Cancel the read in flight for `slot`, returning its task handle.
  fn supersede(slot: &mut Slot) -> Option<JoinHandle<()>> {
    slot.in_flight.take().map(|in_flight| {
      slot.generation += 1;
      in_flight.handle
    })
  }

  /// Join the read in flight for `key`, or spawn one. Must be called with the
  /// slot lock held so the spawned task cannot land before it is registered.
  fn start_fetch(
    &self,
    key: &CacheKey,
    slot: &mut Slot,
  ) -> Result<oneshot::Receiver<Result<CacheEntry, RemoteError>>> {
    let (tx, rx) = oneshot::channel();

    if let Some(in_flight) = slot.in_flight.as_mut() {
      in_flight.waiters.push(tx);
      return Ok(rx);
    }

    let fetcher = slot
      .fetcher
      .clone()
      .ok_or_else(|| Error::store(format!("no fetcher registered for {}", key)))?;
    let generation = slot.generation;
    let cache = self.clone();
    let task_key = key.clone();

    self.inner.fetches.fetch_add(1, Ordering::SeqCst);
    debug!(key = %key, generation, "starting read");

    let handle = tokio::spawn(async move {
      let result = fetcher().await;
      cache.complete(&task_key, generation, result);
    });

    slot.in_flight = Some(InFlight {
      handle,
      waiters: vec![tx],
    });
    Ok(rx)
  }

  /// Land a finished read unless it was cancelled or superseded meanwhile.
  fn complete(&self, key: &CacheKey, generation: u64, result: Result<CacheEntry, RemoteError>) {
    let mut slots = self.slots();
    let Some(slot) = slots.get_mut(key) else {
      return;
    };
    if slot.generation != generation {
      debug!(key = %key, generation, "discarding result of cancelled read");
      return;
    }
    let Some(in_flight) = slot.in_flight.take() else {
      return;
    };

    match &result {
      Ok(value) => {
        slot.value = Some(value.clone());
        slot.updated_at = Some(Utc::now());
        slot.stale = false;
        slot.last_error = None;
        slot.version += 1;
      }
      Err(error) => {
        slot.last_error = Some(error.to_string());
        if slot.value.is_none() {
          slot.version += 1;
        }
      }
    }

    for waiter in in_flight.waiters {
      // Receiver may have been dropped
      let _ = waiter.send(result.clone());
    }
  }

  async fn await_read(
    &self,
    key: &CacheKey,
    receiver: oneshot::Receiver<Result<CacheEntry, RemoteError>>,
  ) -> Result<CacheResult<CacheEntry>> {
    match receiver.await {
      Ok(Ok(value)) => Ok(CacheResult::from_network(value)),
      Ok(Err(error)) => match self.cached(key) {
        Some((value, cached_at)) => {
          warn!(key = %key, error = %error, "read failed, serving cached value");
          Ok(CacheResult::offline(value, cached_at))
        }
        None => Err(error.into()),
      },
      Err(_) => match self.cached(key) {
        Some((value, cached_at)) => Ok(CacheResult::from_cache(value, cached_at, true)),
        None => Err(Error::store(format!("read of {} was cancelled", key))),
      },
    }
  }

  fn cached(&self, key: &CacheKey) -> Option<(CacheEntry, DateTime<Utc>)> {
    let slots = self.slots();
    let slot = slots.get(key)?;
    let value = slot.value.clone()?;
    Some((value, slot.updated_at.unwrap_or_else(Utc::now)))
  }
}

#[async_trait]
impl CacheStore for QueryCache {
  fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
    self.slots().get(key).and_then(|slot| slot.value.clone())
  }

  fn set(&self, key: &CacheKey, value: CacheEntry) -> Result<()> {
    let superseded = {
      let mut slots = self.slots();
      let slot = slots.entry(key.clone()).or_default();
      let superseded = Self::supersede(slot);
      slot.value = Some(value);
      slot.updated_at = Some(Utc::now());
      slot.stale = false;
      slot.version += 1;
      debug!(key = %key, version = slot.version, "cache write");
      superseded
    };
    // A read still in flight predates this write and must not land after it
    if let Some(handle) = superseded {
      handle.abort();
    }
    Ok(())
  }

  fn remove(&self, key: &CacheKey) -> Result<()> {
    let superseded = {
      let mut slots = self.slots();
      let Some(slot) = slots.get_mut(key) else {
        return Ok(());
      };
      let superseded = Self::supersede(slot);
      slot.value = None;
      slot.updated_at = None;
      slot.version += 1;
      // A slot that had a read in flight always has a fetcher, so it is kept
      if slot.observers == 0 && slot.fetcher.is_none() {
        slots.remove(key);
      }
      debug!(key = %key, "cache remove");
      superseded
    };
    if let Some(handle) = superseded {
      handle.abort();
    }
    Ok(())
  }

  fn find_all_matching(&self, pattern: &KeyPattern, exact: bool) -> Vec<CacheKey> {
    let mut keys: Vec<CacheKey> = self
      .slots()
      .keys()
      .filter(|key| pattern.matches(key, exact))
      .cloned()
      .collect();
    keys.sort();
    keys
  }

  async fn cancel_matching(&self, pattern: &KeyPattern, exact: bool) -> usize {
    let handles: Vec<JoinHandle<()>> = {
      let mut slots = self.slots();
      slots
        .iter_mut()
        .filter(|(key, _)| pattern.matches(key, exact))
        .filter_map(|(_, slot)| Self::supersede(slot))
        .collect()
    };

    let cancelled = handles.len();
    for handle in handles {
      handle.abort();
      // Acknowledged once the task has stopped, whether aborted or finished
      let _ = handle.await;
    }
    if cancelled > 0 {
      debug!(pattern = %pattern, cancelled, "cancelled in-flight reads");
    }
    cancelled
  }

  async fn invalidate(
    &self,
    pattern: &KeyPattern,
    exact: bool,
    refetch: RefetchPolicy,
  ) -> Result<()> {
    let mut reads = Vec::new();
    let mut superseded = Vec::new();
    {
      let mut slots = self.slots();
      for (key, slot) in slots.iter_mut().filter(|(key, _)| pattern.matches(key, exact)) {
        slot.stale = true;
        let wanted = match refetch {
          RefetchPolicy::Active => slot.observers > 0,
          RefetchPolicy::Inactive => slot.observers == 0,
          RefetchPolicy::All => true,
          RefetchPolicy::None => false,
        };
        if !wanted || slot.fetcher.is_none() {
          continue;
        }
        superseded.extend(Self::supersede(slot));
        reads.push((key.clone(), self.start_fetch(key, slot)?));
      }
    }
    for handle in superseded {
      handle.abort();
    }

    debug!(pattern = %pattern, ?refetch, refetching = reads.len(), "invalidated");

    let results = join_all(
      reads
        .into_iter()
        .map(|(key, receiver)| async move { (key, receiver.await) }),
    )
    .await;

    let mut first_error = None;
    for (key, result) in results {
      match result {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => {
          warn!(key = %key, error = %error, "refetch failed");
          first_error.get_or_insert(Error::from(error));
        }
        // Superseded by a newer read, which owns the outcome
        Err(_) => {}
      }
    }
    match first_error {
      Some(error) => Err(error),
      None => Ok(()),
    }
  }
}

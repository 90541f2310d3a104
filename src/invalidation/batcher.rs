//! Debounced invalidation batching.
//!
//! Requests wait in a pending map keyed by `(pattern, exact, refetch)`, so
//! duplicates collapse to one. Each request belongs to a debounce bucket with
//! its own timer; a new request for a bucket resets that bucket's timer
//! instead of starting another one. When a timer fires, every request still
//! pending in its bucket is executed in parallel.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::{CacheStore, KeyFactory, KeyPattern, RefetchPolicy};
use crate::error::{Error, Result};

use super::policy::{self, OperationPolicy, FALLBACK, POLICIES};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InvalidationRequest {
  pub pattern: KeyPattern,
  pub exact: bool,
  pub refetch: RefetchPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidateOptions {
  pub exact: bool,
  pub refetch: RefetchPolicy,
}

impl Default for InvalidateOptions {
  fn default() -> Self {
    Self {
      exact: false,
      refetch: RefetchPolicy::Active,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
  /// Debounce for raw key requests
  pub key_debounce: Duration,
  /// Debounce for operation-tagged requests
  pub operation_debounce: Duration,
}

impl Default for BatchConfig {
  fn default() -> Self {
    Self {
      key_debounce: Duration::from_millis(100),
      operation_debounce: Duration::from_millis(200),
    }
  }
}

struct Timer {
  generation: u64,
  handle: JoinHandle<()>,
}

#[derive(Default)]
struct BatchState {
  /// Pending requests and the bucket each currently waits in
  pending: HashMap<InvalidationRequest, String>,
  timers: HashMap<String, Timer>,
  next_generation: u64,
}

struct Inner<S> {
  store: Arc<S>,
  keys: Arc<KeyFactory>,
  policies: &'static [OperationPolicy],
  config: BatchConfig,
  state: Mutex<BatchState>,
  flushes: AtomicUsize,
  executed: AtomicUsize,
}

/// Coalesces invalidation requests and runs them against the store after a
/// quiet period. Cloning shares the same batcher.
pub struct InvalidationBatcher<S> {
  inner: Arc<Inner<S>>,
}

impl<S> Clone for InvalidationBatcher<S> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<S: CacheStore> InvalidationBatcher<S> {
  pub fn new(store: Arc<S>, keys: Arc<KeyFactory>, config: BatchConfig) -> Self {
    Self::with_policies(store, keys, config, POLICIES)
  }

  /// Batcher that expands operations through `policies` instead of the
  /// built-in table.
  pub fn with_policies(
    store: Arc<S>,
    keys: Arc<KeyFactory>,
    config: BatchConfig,
    policies: &'static [OperationPolicy],
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        store,
        keys,
        policies,
        config,
        state: Mutex::new(BatchState::default()),
        flushes: AtomicUsize::new(0),
        executed: AtomicUsize::new(0),
      }),
    }
  }

  /// Queue a raw invalidation. Resets the debounce timer shared by identical
  /// requests.
  pub fn request_invalidation(&self, pattern: KeyPattern, options: InvalidateOptions) {
    let bucket = format!("key:{}:{}:{:?}", pattern, options.exact, options.refetch);
    let request = InvalidationRequest {
      pattern,
      exact: options.exact,
      refetch: options.refetch,
    };
    self
      .inner
      .enqueue(vec![request], bucket, self.inner.config.key_debounce);
  }

  /// Expand `operation` through its policy and queue the resulting requests.
  ///
  /// Calls sharing a `debounce_key` reset one timer. Without one, calls for the
  /// same operation and id set share a timer. Unknown operations fall back to
  /// refreshing every list view.
  pub fn request_invalidation_for_operation(
    &self,
    operation: &str,
    ids: &[String],
    debounce_key: Option<&str>,
  ) -> Result<()> {
    let policy = match policy::lookup(self.inner.policies, operation) {
      Some(policy) => policy,
      None => {
        let error = Error::UnknownOperation(operation.to_string());
        warn!(error = %error, "no invalidation policy, refreshing all list views");
        &FALLBACK
      }
    };
    let requests = policy.expand(&self.inner.keys, ids)?;

    let bucket = match debounce_key {
      Some(key) => format!("op:{}", key),
      None => {
        let mut sorted = ids.to_vec();
        sorted.sort();
        format!("op:{}:{}", operation, sorted.join(","))
      }
    };
    debug!(operation, bucket = %bucket, requests = requests.len(), "operation invalidation queued");
    self
      .inner
      .enqueue(requests, bucket, self.inner.config.operation_debounce);
    Ok(())
  }

  /// Cancel every timer and execute everything pending now. Returns once all
  /// refreshes have completed.
  pub async fn flush(&self) {
    let requests = {
      let mut state = self.inner.state();
      for (_, timer) in state.timers.drain() {
        timer.handle.abort();
      }
      let requests: Vec<InvalidationRequest> =
        state.pending.drain().map(|(request, _)| request).collect();
      requests
    };
    self.inner.execute(requests).await;
  }

  /// Drop everything pending without executing it. Returns how many requests
  /// were discarded.
  pub fn clear(&self) -> usize {
    let mut state = self.inner.state();
    for (_, timer) in state.timers.drain() {
      timer.handle.abort();
    }
    let discarded = state.pending.len();
    state.pending.clear();
    debug!(discarded, "invalidation queue cleared");
    discarded
  }

  /// Pending requests, sorted.
  pub fn pending(&self) -> Vec<InvalidationRequest> {
    let mut pending: Vec<InvalidationRequest> =
      self.inner.state().pending.keys().cloned().collect();
    pending.sort();
    pending
  }

  pub fn pending_len(&self) -> usize {
    self.inner.state().pending.len()
  }

  /// Number of batches executed so far (timer firings and flushes).
  pub fn flush_count(&self) -> usize {
    self.inner.flushes.load(Ordering::SeqCst)
  }

  /// Number of individual requests executed against the store.
  pub fn executed_count(&self) -> usize {
    self.inner.executed.load(Ordering::SeqCst)
  }
}

impl<S: CacheStore> Inner<S> {
  fn state(&self) -> MutexGuard<'_, BatchState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn enqueue(self: &Arc<Self>, requests: Vec<InvalidationRequest>, bucket: String, delay: Duration) {
    if requests.is_empty() {
      return;
    }
    let mut state = self.state();
    for request in requests {
      state.pending.insert(request, bucket.clone());
    }

    state.next_generation += 1;
    let generation = state.next_generation;
    let inner = Arc::clone(self);
    let timer_bucket = bucket.clone();
    let handle = tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      inner.fire(&timer_bucket, generation).await;
    });

    if let Some(previous) = state.timers.insert(bucket, Timer { generation, handle }) {
      previous.handle.abort();
    }
  }

  async fn fire(&self, bucket: &str, generation: u64) {
    let requests = {
      let mut state = self.state();
      match state.timers.get(bucket) {
        Some(timer) if timer.generation == generation => {}
        // Reset or flushed after this timer elapsed
        _ => return,
      }
      state.timers.remove(bucket);

      let due: Vec<InvalidationRequest> = state
        .pending
        .iter()
        .filter(|(_, b)| b.as_str() == bucket)
        .map(|(request, _)| request.clone())
        .collect();
      for request in &due {
        state.pending.remove(request);
      }
      due
    };
    self.execute(requests).await;
  }

  async fn execute(&self, requests: Vec<InvalidationRequest>) {
    if requests.is_empty() {
      return;
    }
    self.flushes.fetch_add(1, Ordering::SeqCst);
    self.executed.fetch_add(requests.len(), Ordering::SeqCst);
    debug!(requests = requests.len(), "executing invalidation batch");

    let store = &self.store;
    join_all(requests.into_iter().map(|request| async move {
      if let Err(e) = store
        .invalidate(&request.pattern, request.exact, request.refetch)
        .await
      {
        // Staleness is preferred over failing the write that queued this
        warn!(pattern = %request.pattern, error = %e, "invalidation refresh failed");
      }
    }))
    .await;
  }
}

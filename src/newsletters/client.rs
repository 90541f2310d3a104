//! Newsletter client that reads through the query cache and writes
//! optimistically.

use futures::FutureExt;
use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::cache::{
  CacheEntry, CacheKey, CacheResult, Entity, Filters, KeyFactory, KeyPattern, Page, QueryCache,
};
use crate::config::Config;
use crate::error::{Error, RemoteError, Result};
use crate::invalidation::policy::{
  ARCHIVE, DELETE, LIKE_TOGGLE, QUEUE_ADD, QUEUE_REMOVE, READ_TOGGLE, UNARCHIVE,
};
use crate::invalidation::{BatchConfig, InvalidationBatcher};
use crate::mutation::{MutationCoordinator, OptimisticMutation, Transform};
use crate::query::{QueryFn, QueryObserver};
use crate::remote::{MutationOp, Pagination, RemoteExecutor};

use super::schema::{
  IS_ARCHIVED, IS_LIKED, IS_READ, NEWSLETTERS, NEWSLETTER_SOURCES, PROFILES, READING_QUEUE,
  UNREAD_COUNT,
};

/// Column holding the reading queue row's own id once a row is keyed by its
/// newsletter.
pub const QUEUE_ID: &str = "queue_id";

#[derive(Debug, Clone)]
pub struct ClientOptions {
  pub stale_time: chrono::Duration,
  pub batch: BatchConfig,
  pub page_size: u64,
  /// Owner of the reading queue
  pub profile_id: String,
}

impl From<&Config> for ClientOptions {
  fn from(config: &Config) -> Self {
    Self {
      stale_time: config.cache.stale_time(),
      batch: config.cache.batch_config(),
      page_size: config.cache.page_size,
      profile_id: config.backend.profile_id.clone(),
    }
  }
}

/// Newsletter client with transparent caching and optimistic writes.
///
/// Reads are served from the shared [`QueryCache`] while fresh. Writes update
/// every cached copy immediately, are rolled back if the backend rejects
/// them, and schedule a debounced refresh of whatever they may have changed.
pub struct NewsletterClient<R> {
  remote: Arc<R>,
  cache: Arc<QueryCache>,
  keys: Arc<KeyFactory>,
  coordinator: MutationCoordinator<QueryCache>,
  profile_id: String,
  page_size: u64,
}

impl<R> Clone for NewsletterClient<R> {
  fn clone(&self) -> Self {
    Self {
      remote: Arc::clone(&self.remote),
      cache: Arc::clone(&self.cache),
      keys: Arc::clone(&self.keys),
      coordinator: self.coordinator.clone(),
      profile_id: self.profile_id.clone(),
      page_size: self.page_size,
    }
  }
}

impl<R: RemoteExecutor> NewsletterClient<R> {
  pub fn new(remote: Arc<R>, keys: Arc<KeyFactory>, options: ClientOptions) -> Self {
    let cache = Arc::new(QueryCache::new(options.stale_time));
    let batcher = InvalidationBatcher::new(Arc::clone(&cache), Arc::clone(&keys), options.batch);
    let coordinator = MutationCoordinator::new(Arc::clone(&cache), Arc::clone(&keys), batcher);
    Self {
      remote,
      cache,
      keys,
      coordinator,
      profile_id: options.profile_id,
      page_size: options.page_size.max(1),
    }
  }

  pub fn cache(&self) -> &Arc<QueryCache> {
    &self.cache
  }

  pub fn keys(&self) -> &Arc<KeyFactory> {
    &self.keys
  }

  pub fn batcher(&self) -> &InvalidationBatcher<QueryCache> {
    self.coordinator.batcher()
  }

  /// Run every pending refresh now.
  pub async fn flush(&self) {
    self.coordinator.batcher().flush().await;
  }

  // Reads

  /// One page of newsletters. The `page` filter selects the page.
  pub async fn list_newsletters(&self, filters: &Filters) -> Result<CacheResult<Page>> {
    let key = self.keys.list_key(NEWSLETTERS, filters)?;
    let fetcher = self.page_fetcher(&key, NEWSLETTERS, true);
    expect_page(&key, self.cache.fetch(&key, fetcher).await?)
  }

  /// Subscribe to a newsletter list view. The view counts as active, and so
  /// is refetched by invalidations, while the observer lives.
  pub fn observe_newsletters(&self, filters: &Filters) -> Result<QueryObserver> {
    let key = self.keys.list_key(NEWSLETTERS, filters)?;
    let fetcher = self.page_fetcher(&key, NEWSLETTERS, true);
    Ok(self.cache.observe(key, fetcher))
  }

  pub async fn get_newsletter(&self, id: &str) -> Result<CacheResult<Entity>> {
    let key = self.keys.detail_key(NEWSLETTERS, id)?;
    let remote = Arc::clone(&self.remote);
    let id = id.trim().to_string();
    let fetcher: QueryFn = Arc::new(move || {
      let remote = Arc::clone(&remote);
      let id = id.clone();
      async move {
        let entity = remote.fetch_by_id(NEWSLETTERS, &id).await?;
        Ok(CacheEntry::Entity(entity))
      }
      .boxed()
    });

    let result = self.cache.fetch(&key, fetcher).await?;
    match result.data.as_entity().cloned() {
      Some(entity) => Ok(result.map(|_| entity)),
      None => Err(Error::store(format!("{} holds no entity", key))),
    }
  }

  /// Unread, unarchived newsletters.
  pub async fn unread_count(&self) -> Result<CacheResult<u64>> {
    let key = self.keys.list_key(UNREAD_COUNT, &Filters::new())?;
    let remote = Arc::clone(&self.remote);
    let fetcher: QueryFn = Arc::new(move || {
      let remote = Arc::clone(&remote);
      async move {
        let mut filters = Filters::new();
        filters.insert("isRead".into(), Value::Bool(false));
        let page = remote
          .fetch(NEWSLETTERS, &filters, Pagination::count_only())
          .await?;
        Ok(CacheEntry::Aggregate(json!(page.total_count)))
      }
      .boxed()
    });

    let result = self.cache.fetch(&key, fetcher).await?;
    let count = match &result.data {
      CacheEntry::Aggregate(value) => value.as_u64(),
      _ => None,
    };
    match count {
      Some(count) => Ok(result.map(|_| count)),
      None => Err(Error::store(format!("{} holds no count", key))),
    }
  }

  pub async fn sources(&self, filters: &Filters) -> Result<CacheResult<Page>> {
    let key = self.keys.list_key(NEWSLETTER_SOURCES, filters)?;
    let fetcher = self.page_fetcher(&key, NEWSLETTER_SOURCES, false);
    expect_page(&key, self.cache.fetch(&key, fetcher).await?)
  }

  /// The profile's reading queue. Rows are keyed by newsletter id so queue
  /// membership can be toggled per newsletter; the row's own id is kept as
  /// [`QUEUE_ID`].
  pub async fn reading_queue(&self) -> Result<CacheResult<Page>> {
    let key = self.queue_key()?;
    let remote = Arc::clone(&self.remote);
    let profile_id = self.profile_id.clone();
    let fetcher: QueryFn = Arc::new(move || {
      let remote = Arc::clone(&remote);
      let profile_id = profile_id.clone();
      async move {
        let mut filters = Filters::new();
        filters.insert("user_id".into(), Value::String(profile_id));
        let mut page = remote
          .fetch(READING_QUEUE, &filters, Pagination::default())
          .await?;
        page.items = page.items.into_iter().map(keyed_by_newsletter).collect();
        Ok(CacheEntry::Page(page))
      }
      .boxed()
    });
    expect_page(&key, self.cache.fetch(&key, fetcher).await?)
  }

  fn queue_key(&self) -> Result<CacheKey> {
    self.keys.relation_key(PROFILES, &self.profile_id, READING_QUEUE)
  }

  fn page_fetcher(&self, key: &CacheKey, table: &'static str, paged: bool) -> QueryFn {
    let remote = Arc::clone(&self.remote);
    let filters = key.filters().map(|f| f.to_filters()).unwrap_or_default();
    let pagination = if paged {
      let page = filters.get("page").and_then(Value::as_u64).unwrap_or(0);
      Pagination::page(page, self.page_size)
    } else {
      Pagination::default()
    };
    Arc::new(move || {
      let remote = Arc::clone(&remote);
      let filters = filters.clone();
      async move {
        let page = remote.fetch(table, &filters, pagination).await?;
        Ok(CacheEntry::Page(page))
      }
      .boxed()
    })
  }

  // Writes

  /// Flip the liked flag. Rapid toggles of one newsletter share one refresh.
  pub async fn toggle_like(&self, id: &str) -> Result<Entity> {
    self.toggle(LIKE_TOGGLE, id, IS_LIKED, true).await
  }

  pub async fn toggle_read(&self, id: &str) -> Result<Entity> {
    self.toggle(READ_TOGGLE, id, IS_READ, false).await
  }

  async fn toggle(
    &self,
    operation: &'static str,
    id: &str,
    field: &'static str,
    shared_timer: bool,
  ) -> Result<Entity> {
    let detail = self.keys.detail_key(NEWSLETTERS, id)?;
    let id = id.trim().to_string();
    let remote = Arc::clone(&self.remote);
    let target = id.clone();

    let mut mutation = OptimisticMutation::new(
      operation,
      Transform::toggle_flag(&id, field),
      move |resolved: &Transform| {
        let mut payload = Map::new();
        payload.insert(
          field.to_string(),
          resolved.field(field).cloned().unwrap_or(Value::Null),
        );
        async move {
          let rows = remote
            .mutate(NEWSLETTERS, MutationOp::update(&target), Value::Object(payload))
            .await?;
          first_row(rows, NEWSLETTERS, &target)
        }
        .boxed()
      },
    )
    .with_ids(vec![id.clone()])
    .affecting(KeyPattern::Key(detail))
    .affecting(KeyPattern::lists(NEWSLETTERS));
    if shared_timer {
      mutation = mutation.debounce_key(format!("{}:{}", operation, id));
    }
    self.coordinator.run_optimistic(mutation).await
  }

  pub async fn archive(&self, ids: &[String]) -> Result<Vec<Entity>> {
    self.set_archived(ARCHIVE, ids, true).await
  }

  pub async fn unarchive(&self, ids: &[String]) -> Result<Vec<Entity>> {
    self.set_archived(UNARCHIVE, ids, false).await
  }

  async fn set_archived(
    &self,
    operation: &'static str,
    ids: &[String],
    archived: bool,
  ) -> Result<Vec<Entity>> {
    let ids = unique_ids(ids)?;
    let mut fields = Map::new();
    fields.insert(IS_ARCHIVED.to_string(), Value::Bool(archived));
    let remote = Arc::clone(&self.remote);
    let targets = ids.clone();

    let mut mutation = OptimisticMutation::new(
      operation,
      Transform::patch(ids.clone(), fields),
      move |_: &Transform| {
        async move {
          remote
            .mutate(
              NEWSLETTERS,
              MutationOp::Update { ids: targets },
              json!({ IS_ARCHIVED: archived }),
            )
            .await
        }
        .boxed()
      },
    )
    .with_ids(ids.clone())
    .affecting(KeyPattern::lists(NEWSLETTERS));
    for key in self.detail_keys(&ids)? {
      mutation = mutation.affecting(KeyPattern::Key(key));
    }
    self.coordinator.run_optimistic(mutation).await
  }

  /// Delete newsletters. They disappear from every list, detail and reading
  /// queue view at once.
  pub async fn delete(&self, ids: &[String]) -> Result<Vec<Entity>> {
    let ids = unique_ids(ids)?;
    let remote = Arc::clone(&self.remote);
    let targets = ids.clone();

    let mut mutation = OptimisticMutation::new(
      DELETE,
      Transform::remove(ids.clone()),
      move |_: &Transform| {
        async move {
          remote
            .mutate(NEWSLETTERS, MutationOp::Delete { ids: targets }, Value::Null)
            .await
        }
        .boxed()
      },
    )
    .with_ids(ids.clone())
    .affecting(KeyPattern::lists(NEWSLETTERS))
    .affecting(KeyPattern::relations(READING_QUEUE));
    for key in self.detail_keys(&ids)? {
      mutation = mutation.affecting(KeyPattern::Key(key));
    }
    self.coordinator.run_optimistic(mutation).await
  }

  /// Append a newsletter to the reading queue. Returns the stored queue row,
  /// keyed by newsletter.
  pub async fn add_to_queue(&self, newsletter_id: &str) -> Result<Entity> {
    let queue = self.queue_key()?;
    let newsletter_id = checked_id(newsletter_id)?;
    let item = Entity::from_value(json!({
      "id": newsletter_id,
      "newsletter_id": newsletter_id,
      "user_id": self.profile_id,
    }))?;
    let remote = Arc::clone(&self.remote);
    let row = json!({"user_id": self.profile_id, "newsletter_id": newsletter_id});
    let target = newsletter_id.clone();

    let mutation = OptimisticMutation::new(
      QUEUE_ADD,
      Transform::insert(item, None),
      move |_: &Transform| {
        async move {
          let rows = remote.mutate(READING_QUEUE, MutationOp::Insert, row).await?;
          first_row(rows, READING_QUEUE, &target).map(keyed_by_newsletter)
        }
        .boxed()
      },
    )
    .with_ids(vec![newsletter_id])
    .affecting(KeyPattern::Key(queue));
    self.coordinator.run_optimistic(mutation).await
  }

  /// Take a newsletter off the reading queue. Returns whether the backend
  /// held a matching row.
  pub async fn remove_from_queue(&self, newsletter_id: &str) -> Result<bool> {
    let queue = self.queue_key()?;
    let newsletter_id = checked_id(newsletter_id)?;
    let remote = Arc::clone(&self.remote);
    let mut columns = Filters::new();
    columns.insert("user_id".into(), Value::String(self.profile_id.clone()));
    columns.insert("newsletter_id".into(), Value::String(newsletter_id.clone()));

    let mutation = OptimisticMutation::new(
      QUEUE_REMOVE,
      Transform::remove(vec![newsletter_id.clone()]),
      move |_: &Transform| {
        async move {
          let removed = remote
            .mutate(READING_QUEUE, MutationOp::DeleteMatching { columns }, Value::Null)
            .await?;
          Ok(!removed.is_empty())
        }
        .boxed()
      },
    )
    .with_ids(vec![newsletter_id])
    .affecting(KeyPattern::Key(queue));
    self.coordinator.run_optimistic(mutation).await
  }

  fn detail_keys(&self, ids: &[String]) -> Result<Vec<CacheKey>> {
    ids
      .iter()
      .map(|id| self.keys.detail_key(NEWSLETTERS, id))
      .collect()
  }
}

fn expect_page(key: &CacheKey, result: CacheResult<CacheEntry>) -> Result<CacheResult<Page>> {
  match result.data.as_page().cloned() {
    Some(page) => Ok(result.map(|_| page)),
    None => Err(Error::store(format!("{} holds no page", key))),
  }
}

fn first_row(rows: Vec<Entity>, table: &str, id: &str) -> Result<Entity, RemoteError> {
  rows.into_iter().next().ok_or_else(|| RemoteError::NotFound {
    table: table.to_string(),
    id: id.to_string(),
  })
}

/// Re-key a reading queue row by its newsletter.
fn keyed_by_newsletter(row: Entity) -> Entity {
  let Some(newsletter_id) = row.get("newsletter_id").cloned() else {
    return row;
  };
  let mut fields = Map::new();
  if let Some(id) = row.get("id") {
    fields.insert(QUEUE_ID.to_string(), id.clone());
  }
  fields.insert("id".to_string(), newsletter_id);
  row.patched(&fields)
}

fn checked_id(id: &str) -> Result<String> {
  let id = id.trim();
  if id.is_empty() {
    return Err(Error::invalid_argument("id must not be empty"));
  }
  Ok(id.to_string())
}

fn unique_ids(ids: &[String]) -> Result<Vec<String>> {
  let mut unique: Vec<String> = Vec::with_capacity(ids.len());
  for id in ids {
    let id = checked_id(id)?;
    if !unique.contains(&id) {
      unique.push(id);
    }
  }
  if unique.is_empty() {
    return Err(Error::invalid_argument("no ids given"));
  }
  Ok(unique)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, CacheStore};
  use crate::newsletters::schema::SCHEMAS;
  use crate::remote::memory::MemoryExecutor;
  use std::sync::atomic::Ordering;

  const PROFILE: &str = "p-1";

  fn options() -> ClientOptions {
    ClientOptions {
      stale_time: chrono::Duration::minutes(5),
      batch: BatchConfig::default(),
      page_size: 2,
      profile_id: PROFILE.to_string(),
    }
  }

  fn client_with(rows: &[Value]) -> (Arc<MemoryExecutor>, NewsletterClient<MemoryExecutor>) {
    let remote = Arc::new(MemoryExecutor::new());
    for row in rows {
      remote.insert(NEWSLETTERS, row.clone());
    }
    let keys = Arc::new(KeyFactory::new(SCHEMAS));
    let client = NewsletterClient::new(Arc::clone(&remote), keys, options());
    (remote, client)
  }

  fn newsletter(id: &str) -> Value {
    json!({"id": id, "title": format!("Issue {}", id), "is_read": false, "is_liked": false, "is_archived": false})
  }

  fn filters(value: Value) -> Filters {
    value.as_object().cloned().unwrap_or_default()
  }

  fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
  }

  fn item_ids(page: &Page) -> Vec<String> {
    page.items.iter().filter_map(Entity::id).collect()
  }

  fn cached_page(client: &NewsletterClient<MemoryExecutor>, key: &CacheKey) -> Page {
    client
      .cache()
      .get(key)
      .and_then(|entry| entry.as_page().cloned())
      .unwrap()
  }

  #[tokio::test]
  async fn test_list_is_served_from_cache_while_fresh() {
    let (remote, client) = client_with(&[newsletter("a"), newsletter("b")]);

    let first = client.list_newsletters(&Filters::new()).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);
    // Spelled-out defaults name the same view
    let second = client
      .list_newsletters(&filters(json!({"isArchived": false, "page": 0, "sourceIds": []})))
      .await
      .unwrap();
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert_eq!(second.data, first.data);
    assert_eq!(remote.fetches.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_observed_view_is_refetched_after_a_write() {
    let (remote, client) = client_with(&[newsletter("a"), newsletter("b")]);
    let mut observer = client.observe_newsletters(&Filters::new()).unwrap();
    client.list_newsletters(&Filters::new()).await.unwrap();
    assert!(observer.poll());

    client.archive(&ids(&["a"])).await.unwrap();
    client.flush().await;
    assert_eq!(remote.fetches.load(Ordering::SeqCst), 2);
    let page = observer.data().and_then(|entry| entry.as_page().cloned()).unwrap();
    assert_eq!(item_ids(&page), ids(&["b"]));
    assert!(observer.poll());
  }

  #[tokio::test]
  async fn test_page_filter_selects_offset() {
    let (_, client) = client_with(&[newsletter("a"), newsletter("b"), newsletter("c")]);

    let page = client
      .list_newsletters(&filters(json!({"page": 1})))
      .await
      .unwrap()
      .data;
    assert_eq!(item_ids(&page), ids(&["c"]));
    assert_eq!(page.total_count, 3);
    assert_eq!(page.page_info.offset, 2);
    assert!(!page.page_info.has_more);
  }

  #[tokio::test]
  async fn test_archive_drops_from_inbox_then_refreshes() {
    let (remote, client) = client_with(&[newsletter("a"), newsletter("b")]);
    let inbox = client.keys().list_key(NEWSLETTERS, &Filters::new()).unwrap();
    client.list_newsletters(&Filters::new()).await.unwrap();

    let archived = client.archive(&ids(&["a"])).await.unwrap();
    assert_eq!(archived.len(), 1);
    let page = cached_page(&client, &inbox);
    assert_eq!(item_ids(&page), ids(&["b"]));
    assert_eq!(page.total_count, 1);
    assert_eq!(
      remote.row(NEWSLETTERS, "a").unwrap().get(IS_ARCHIVED),
      Some(&json!(true))
    );

    client.flush().await;
    assert!(client.cache().is_stale(&inbox));
    let archive_view = client
      .list_newsletters(&filters(json!({"isArchived": true})))
      .await
      .unwrap();
    assert_eq!(item_ids(&archive_view.data), ids(&["a"]));
  }

  #[tokio::test]
  async fn test_rejected_archive_restores_views() {
    let (remote, client) = client_with(&[newsletter("a"), newsletter("b")]);
    let inbox = client.keys().list_key(NEWSLETTERS, &Filters::new()).unwrap();
    client.list_newsletters(&Filters::new()).await.unwrap();
    client.get_newsletter("a").await.unwrap();
    let before = cached_page(&client, &inbox);
    remote.fail_mutations(true);

    let error = client.archive(&ids(&["a"])).await.unwrap_err();
    assert!(matches!(
      error,
      Error::RemoteMutationFailed {
        source: RemoteError::Rejected { status: 503, .. },
        ..
      }
    ));
    assert!(error.rollback_failures().is_empty());
    assert_eq!(cached_page(&client, &inbox), before);
    let detail = client.get_newsletter("a").await.unwrap();
    assert_eq!(detail.source, CacheSource::CacheFresh);
    assert_eq!(detail.data.get(IS_ARCHIVED), Some(&json!(false)));
    assert_eq!(client.batcher().pending_len(), 0);
  }

  #[tokio::test]
  async fn test_toggle_like_sends_the_flipped_value() {
    let (remote, client) = client_with(&[newsletter("a")]);
    client.get_newsletter("a").await.unwrap();

    let liked = client.toggle_like("a").await.unwrap();
    assert_eq!(liked.get(IS_LIKED), Some(&json!(true)));
    let cached = client.get_newsletter("a").await.unwrap().data;
    assert_eq!(cached.get(IS_LIKED), Some(&json!(true)));

    client.toggle_like("a").await.unwrap();
    assert_eq!(
      remote.row(NEWSLETTERS, "a").unwrap().get(IS_LIKED),
      Some(&json!(false))
    );
    // Both toggles share one pending refresh
    assert_eq!(client.batcher().pending_len(), 1);
  }

  #[tokio::test]
  async fn test_unread_count_follows_read_toggles() {
    let mut read = newsletter("c");
    read[IS_READ] = json!(true);
    let (_, client) = client_with(&[newsletter("a"), newsletter("b"), read]);

    assert_eq!(client.unread_count().await.unwrap().data, 2);
    client.toggle_read("a").await.unwrap();
    // Not adjusted optimistically; the refresh corrects it
    assert_eq!(client.unread_count().await.unwrap().data, 2);

    client.flush().await;
    let count = client.unread_count().await.unwrap();
    assert_eq!(count.source, CacheSource::Network);
    assert_eq!(count.data, 1);
  }

  #[tokio::test]
  async fn test_missing_newsletter_is_not_found() {
    let (_, client) = client_with(&[]);
    let error = client.get_newsletter("nope").await.unwrap_err();
    assert!(matches!(error, Error::Remote(RemoteError::NotFound { .. })));
    assert!(matches!(
      client.get_newsletter("  ").await,
      Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(client.archive(&[]).await, Err(Error::InvalidArgument(_))));
  }

  #[tokio::test]
  async fn test_reading_queue_add_and_remove() {
    let (remote, client) = client_with(&[newsletter("a")]);
    let queue = client.reading_queue().await.unwrap();
    assert!(queue.data.items.is_empty());
    let key = client.queue_key().unwrap();

    let row = client.add_to_queue("a").await.unwrap();
    assert_eq!(row.id().as_deref(), Some("a"));
    assert!(row.get(QUEUE_ID).is_some());
    assert_eq!(item_ids(&cached_page(&client, &key)), ids(&["a"]));
    assert_eq!(remote.rows(READING_QUEUE).len(), 1);

    assert!(client.remove_from_queue("a").await.unwrap());
    assert!(cached_page(&client, &key).items.is_empty());
    assert!(remote.rows(READING_QUEUE).is_empty());
  }

  #[tokio::test]
  async fn test_delete_clears_every_view() {
    let (remote, client) = client_with(&[newsletter("a"), newsletter("b")]);
    let inbox = client.keys().list_key(NEWSLETTERS, &Filters::new()).unwrap();
    let detail = client.keys().detail_key(NEWSLETTERS, "a").unwrap();
    let queue = client.queue_key().unwrap();
    client.list_newsletters(&Filters::new()).await.unwrap();
    client.get_newsletter("a").await.unwrap();
    client.reading_queue().await.unwrap();
    client.add_to_queue("a").await.unwrap();

    let deleted = client.delete(&ids(&["a", "a"])).await.unwrap();
    assert_eq!(deleted.len(), 1);
    assert_eq!(item_ids(&cached_page(&client, &inbox)), ids(&["b"]));
    assert!(client.cache().get(&detail).is_none());
    assert!(cached_page(&client, &queue).items.is_empty());
    assert!(remote.row(NEWSLETTERS, "a").is_none());
  }

  #[tokio::test]
  async fn test_queue_rows_are_keyed_by_newsletter() {
    let row = Entity::from_value(json!({"id": 9, "newsletter_id": "n-1", "user_id": PROFILE})).unwrap();
    let keyed = keyed_by_newsletter(row);
    assert_eq!(keyed.id().as_deref(), Some("n-1"));
    assert_eq!(keyed.get(QUEUE_ID), Some(&json!(9)));
  }
}

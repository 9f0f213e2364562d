//! Deferred delivery of non-idempotent requests.
//!
//! Writes that cannot reach the network are persisted per category and
//! replayed in enqueue order once connectivity returns:
//! - `Pending -> Attempting -> Completed` removes the item
//! - failed attempts return it to `Pending` with the retry count bumped
//! - client errors, malformed rows and items past the retry or age ceiling
//!   are dropped with a diagnostic

mod store;

pub use store::QueueStore;

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::classify::Category;
use crate::config::QueueConfig;
use crate::fetch::{FetchError, Fetcher};
use crate::network::{QualityTier, TimeoutPolicy};
use crate::request::{Request, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
  AiRequests,
  Documents,
  Analytics,
  General,
}

impl QueueName {
  pub const ALL: [QueueName; 4] = [
    QueueName::AiRequests,
    QueueName::Documents,
    QueueName::Analytics,
    QueueName::General,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      QueueName::AiRequests => "ai-requests",
      QueueName::Documents => "documents",
      QueueName::Analytics => "analytics",
      QueueName::General => "general",
    }
  }

  pub fn parse(name: &str) -> Option<Self> {
    let name = name.trim().to_ascii_lowercase();
    Self::ALL.into_iter().find(|q| q.as_str() == name)
  }

  /// Backing table name.
  pub fn table(self) -> &'static str {
    match self {
      QueueName::AiRequests => "queue_ai_requests",
      QueueName::Documents => "queue_documents",
      QueueName::Analytics => "queue_analytics",
      QueueName::General => "queue_general",
    }
  }

  /// Category whose timeout applies when replaying this queue.
  fn category(self) -> Category {
    match self {
      QueueName::AiRequests => Category::AiRequest,
      QueueName::Documents => Category::Document,
      QueueName::Analytics => Category::Analytics,
      QueueName::General => Category::Dynamic,
    }
  }
}

impl fmt::Display for QueueName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Persisted state of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
  Pending,
  Attempting,
}

impl ItemState {
  pub fn as_str(self) -> &'static str {
    match self {
      ItemState::Pending => "pending",
      ItemState::Attempting => "attempting",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
  pub id: i64,
  pub queue: QueueName,
  /// Serialized [`Request`]
  pub request: String,
  pub enqueued_at: DateTime<Utc>,
  pub retry_count: u32,
  pub state: ItemState,
}

/// Why an item left the queue without being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "reason", content = "status")]
pub enum DropReason {
  Expired,
  RetriesExhausted,
  ClientError(u16),
  Malformed,
}

/// Result of one attempt at delivering an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
  Completed,
  Retrying,
  Dropped(DropReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrainReport {
  pub queue: QueueName,
  pub attempted: usize,
  pub succeeded: usize,
  pub retrying: usize,
  pub dropped: Vec<(i64, DropReason)>,
  /// Another drain of this queue was already running
  pub skipped: bool,
}

impl DrainReport {
  fn new(queue: QueueName) -> Self {
    Self {
      queue,
      attempted: 0,
      succeeded: 0,
      retrying: 0,
      dropped: Vec::new(),
      skipped: false,
    }
  }

  /// Items that were not delivered and remain queued for another attempt.
  pub fn failed(&self) -> usize {
    self.retrying
  }

  fn record(&mut self, id: i64, outcome: AttemptOutcome) {
    match outcome {
      AttemptOutcome::Completed => self.succeeded += 1,
      AttemptOutcome::Retrying => self.retrying += 1,
      AttemptOutcome::Dropped(reason) => self.dropped.push((id, reason)),
    }
  }
}

/// Durable per-category queues of deferred writes.
pub struct DeferredQueue {
  store: QueueStore,
  fetcher: Arc<dyn Fetcher>,
  max_retries: u32,
  max_age: Duration,
  timeouts: TimeoutPolicy,
  draining: Mutex<HashSet<QueueName>>,
  sync_requested: AtomicBool,
}

impl DeferredQueue {
  pub fn new(
    store: QueueStore,
    fetcher: Arc<dyn Fetcher>,
    config: &QueueConfig,
    timeouts: TimeoutPolicy,
  ) -> Self {
    Self {
      store,
      fetcher,
      max_retries: config.max_retries,
      max_age: Duration::seconds(config.max_age_secs as i64),
      timeouts,
      draining: Mutex::new(HashSet::new()),
      sync_requested: AtomicBool::new(false),
    }
  }

  /// Persist a request for later delivery and ask for a sync opportunity.
  pub fn enqueue(&self, queue: QueueName, request: &Request) -> Result<QueueItem> {
    let item = self.store.insert(queue, request, Utc::now())?;
    self.sync_requested.store(true, Ordering::SeqCst);
    tracing::info!(
      "Queued {} {} in {} (item {})",
      request.method,
      request.url,
      queue,
      item.id
    );
    Ok(item)
  }

  /// Consume the pending sync request flag.
  pub fn take_sync_request(&self) -> bool {
    self.sync_requested.swap(false, Ordering::SeqCst)
  }

  pub fn pending_count(&self, queue: QueueName) -> Result<u64> {
    Ok(self.store.usage(queue)?.0)
  }

  /// Items and bytes across every queue.
  pub fn usage(&self) -> Result<(u64, u64)> {
    QueueName::ALL.into_iter().try_fold((0, 0), |(items, bytes), q| {
      let (i, b) = self.store.usage(q)?;
      Ok((items + i, bytes + b))
    })
  }

  /// Reset items interrupted mid-attempt by a previous process.
  pub fn recover(&self) -> Result<usize> {
    QueueName::ALL
      .into_iter()
      .try_fold(0, |acc, q| Ok(acc + self.store.reset_attempting(q)?))
  }

  /// Attempt every pending item of one queue in enqueue order.
  ///
  /// Re-entrant calls while the same queue is draining return a skipped
  /// report without touching any item.
  pub async fn drain(&self, queue: QueueName, quality: QualityTier) -> Result<DrainReport> {
    let mut report = DrainReport::new(queue);
    let Some(_guard) = DrainGuard::acquire(&self.draining, queue) else {
      report.skipped = true;
      return Ok(report);
    };

    let items = self.store.pending(queue)?;
    if items.is_empty() {
      return Ok(report);
    }

    tracing::info!("Draining {} ({} pending)", queue, items.len());
    let timeout = self.timeouts.timeout(queue.category(), quality);

    for item in items {
      let outcome = match self.attempt(&item, timeout).await {
        Ok(outcome) => outcome,
        Err(e) => {
          // Keep the item reachable by the next drain and move on
          tracing::error!("Failed to settle item {} in {}: {}", item.id, queue, e);
          if let Err(e) = self.store.set_state(queue, item.id, ItemState::Pending) {
            tracing::error!("Failed to return item {} in {} to pending: {}", item.id, queue, e);
          }
          AttemptOutcome::Retrying
        }
      };
      if outcome != AttemptOutcome::Dropped(DropReason::Expired)
        && outcome != AttemptOutcome::Dropped(DropReason::Malformed)
      {
        report.attempted += 1;
      }
      report.record(item.id, outcome);
    }

    tracing::info!(
      "Drained {}: {} succeeded, {} retrying, {} dropped",
      queue,
      report.succeeded,
      report.retrying,
      report.dropped.len()
    );
    Ok(report)
  }

  /// Drain every queue; queues interleave, items within a queue stay ordered.
  pub async fn drain_all(&self, quality: QualityTier) -> Vec<DrainReport> {
    let drains = QueueName::ALL.into_iter().map(|q| self.drain(q, quality));
    join_all(drains)
      .await
      .into_iter()
      .filter_map(|r| match r {
        Ok(report) => Some(report),
        Err(e) => {
          tracing::error!("Queue drain failed: {}", e);
          None
        }
      })
      .collect()
  }

  async fn attempt(&self, item: &QueueItem, timeout: std::time::Duration) -> Result<AttemptOutcome> {
    if Utc::now() - item.enqueued_at >= self.max_age {
      return self.drop_item(item, DropReason::Expired);
    }

    let request: Request = match serde_json::from_str(&item.request) {
      Ok(request) => request,
      Err(e) => {
        tracing::debug!("Unreadable queue item {}: {}", item.id, e);
        return self.drop_item(item, DropReason::Malformed);
      }
    };

    self.store.set_state(item.queue, item.id, ItemState::Attempting)?;

    let result = match tokio::time::timeout(timeout, self.fetcher.fetch(&request)).await {
      Ok(result) => result,
      Err(_) => Err(FetchError::Timeout(timeout)),
    };

    match classify_delivery(&result) {
      Delivery::Delivered => {
        self.store.remove(item.queue, item.id)?;
        tracing::debug!("Delivered queued item {} to {}", item.id, request.url);
        Ok(AttemptOutcome::Completed)
      }
      Delivery::Rejected(status) => self.drop_item(item, DropReason::ClientError(status)),
      Delivery::Transient => {
        if item.retry_count >= self.max_retries {
          return self.drop_item(item, DropReason::RetriesExhausted);
        }
        self.store.mark_retry(item.queue, item.id)?;
        Ok(AttemptOutcome::Retrying)
      }
    }
  }

  fn drop_item(&self, item: &QueueItem, reason: DropReason) -> Result<AttemptOutcome> {
    self.store.remove(item.queue, item.id)?;
    tracing::warn!(
      queue = %item.queue,
      id = item.id,
      retries = item.retry_count,
      ?reason,
      "Dropped deferred request"
    );
    Ok(AttemptOutcome::Dropped(reason))
  }
}

enum Delivery {
  Delivered,
  Rejected(u16),
  Transient,
}

fn classify_delivery(result: &Result<Response, FetchError>) -> Delivery {
  match result {
    Ok(resp) if resp.status < 400 => Delivery::Delivered,
    // Timeouts and rate limits are worth retrying
    Ok(resp) if resp.status == 408 || resp.status == 429 => Delivery::Transient,
    Ok(resp) if resp.status < 500 => Delivery::Rejected(resp.status),
    _ => Delivery::Transient,
  }
}

/// Marks a queue as draining for the guard's lifetime.
struct DrainGuard<'a> {
  draining: &'a Mutex<HashSet<QueueName>>,
  queue: QueueName,
}

impl<'a> DrainGuard<'a> {
  fn acquire(draining: &'a Mutex<HashSet<QueueName>>, queue: QueueName) -> Option<Self> {
    let mut set = draining.lock().unwrap_or_else(|e| e.into_inner());
    if !set.insert(queue) {
      return None;
    }
    Some(Self { draining, queue })
  }
}

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    let mut set = self.draining.lock().unwrap_or_else(|e| e.into_inner());
    set.remove(&self.queue);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::control::Broadcast;
  use crate::db::Database;
  use crate::fetch::MockFetcher;

  const DOC: &str = "https://app.test/api/documents/1";

  fn queue_with(fetcher: &MockFetcher) -> DeferredQueue {
    let store = QueueStore::new(Database::in_memory().unwrap());
    DeferredQueue::new(
      store,
      Arc::new(fetcher.clone()),
      &QueueConfig::default(),
      TimeoutPolicy::default(),
    )
  }

  fn put(url: &str, body: &str) -> Request {
    Request::parse("PUT", url).unwrap().with_body(body)
  }

  #[tokio::test]
  async fn test_drain_delivers_in_enqueue_order() {
    let fetcher = MockFetcher::new();
    fetcher.route(DOC, 200, "ok");
    let queue = queue_with(&fetcher);

    queue.enqueue(QueueName::Documents, &put(DOC, "first")).unwrap();
    queue.enqueue(QueueName::Documents, &put(DOC, "second")).unwrap();
    assert!(queue.take_sync_request());
    assert!(!queue.take_sync_request());

    let report = queue.drain(QueueName::Documents, QualityTier::Fast).await.unwrap();
    assert_eq!(report.attempted, 2);
    assert_eq!(report.succeeded, 2);
    assert_eq!(queue.pending_count(QueueName::Documents).unwrap(), 0);

    let bodies: Vec<Vec<u8>> = fetcher.requests().into_iter().filter_map(|r| r.body).collect();
    assert_eq!(bodies, vec![b"first".to_vec(), b"second".to_vec()]);
  }

  #[tokio::test]
  async fn test_draining_empty_queue_twice_is_noop() {
    let fetcher = MockFetcher::new();
    let queue = queue_with(&fetcher);

    for _ in 0..2 {
      let report = queue.drain(QueueName::AiRequests, QualityTier::Fast).await.unwrap();
      assert_eq!(report, DrainReport::new(QueueName::AiRequests));
    }
    assert_eq!(fetcher.call_count(), 0);
  }

  #[tokio::test]
  async fn test_concurrent_drain_is_skipped() {
    let fetcher = MockFetcher::new();
    fetcher.route(DOC, 200, "ok");
    fetcher.set_delay(std::time::Duration::from_millis(30));
    let queue = queue_with(&fetcher);
    queue.enqueue(QueueName::Documents, &put(DOC, "x")).unwrap();

    let (a, b) = tokio::join!(
      queue.drain(QueueName::Documents, QualityTier::Fast),
      queue.drain(QueueName::Documents, QualityTier::Fast)
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a.skipped ^ b.skipped);
    assert_eq!(fetcher.call_count(), 1);
  }

  #[tokio::test]
  async fn test_server_errors_retry_until_ceiling() {
    let fetcher = MockFetcher::new();
    fetcher.route(DOC, 503, "busy");
    let queue = queue_with(&fetcher);
    queue.enqueue(QueueName::Documents, &put(DOC, "x")).unwrap();

    // Three failures are retried
    for _ in 0..3 {
      let report = queue.drain(QueueName::Documents, QualityTier::Fast).await.unwrap();
      assert_eq!(report.retrying, 1);
    }
    assert_eq!(queue.pending_count(QueueName::Documents).unwrap(), 1);

    // retry_count == 3: next failure drops instead of a fourth retry
    let report = queue.drain(QueueName::Documents, QualityTier::Fast).await.unwrap();
    assert_eq!(report.retrying, 0);
    assert_eq!(report.dropped[0].1, DropReason::RetriesExhausted);
    assert_eq!(queue.pending_count(QueueName::Documents).unwrap(), 0);
    assert_eq!(fetcher.call_count(), 4);
  }

  #[tokio::test]
  async fn test_client_error_drops_immediately() {
    let fetcher = MockFetcher::new();
    fetcher.route(DOC, 422, "bad");
    let queue = queue_with(&fetcher);
    queue.enqueue(QueueName::Documents, &put(DOC, "x")).unwrap();

    let report = queue.drain(QueueName::Documents, QualityTier::Fast).await.unwrap();
    assert_eq!(report.dropped, vec![(1, DropReason::ClientError(422))]);
    assert_eq!(queue.pending_count(QueueName::Documents).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_transport_failure_retries() {
    let fetcher = MockFetcher::new();
    fetcher.set_offline(true);
    let queue = queue_with(&fetcher);
    queue.enqueue(QueueName::General, &put("https://app.test/settings", "x")).unwrap();

    let report = queue.drain(QueueName::General, QualityTier::Fast).await.unwrap();
    assert_eq!(report.retrying, 1);
    assert_eq!(queue.pending_count(QueueName::General).unwrap(), 1);
  }

  #[tokio::test]
  async fn test_old_items_drop_without_attempt() {
    let fetcher = MockFetcher::new();
    fetcher.route(DOC, 200, "ok");
    let store = QueueStore::new(Database::in_memory().unwrap());
    let serialized = serde_json::to_string(&put(DOC, "stale")).unwrap();
    store
      .insert_raw(QueueName::Documents, &serialized, Utc::now() - Duration::days(8), 0)
      .unwrap();
    let queue = DeferredQueue::new(
      store,
      Arc::new(fetcher.clone()),
      &QueueConfig::default(),
      TimeoutPolicy::default(),
    );

    let report = queue.drain(QueueName::Documents, QualityTier::Fast).await.unwrap();
    assert_eq!(report.dropped[0].1, DropReason::Expired);
    assert_eq!(report.attempted, 0);
    assert_eq!(fetcher.call_count(), 0);
  }

  #[tokio::test]
  async fn test_malformed_items_are_discarded() {
    let fetcher = MockFetcher::new();
    let store = QueueStore::new(Database::in_memory().unwrap());
    store
      .insert_raw(QueueName::Analytics, "{not json", Utc::now(), 0)
      .unwrap();
    let queue = DeferredQueue::new(
      store,
      Arc::new(fetcher.clone()),
      &QueueConfig::default(),
      TimeoutPolicy::default(),
    );

    let report = queue.drain(QueueName::Analytics, QualityTier::Fast).await.unwrap();
    assert_eq!(report.dropped[0].1, DropReason::Malformed);
    assert_eq!(queue.pending_count(QueueName::Analytics).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_drain_all_reports_every_queue() {
    let fetcher = MockFetcher::new();
    fetcher.route(DOC, 200, "ok");
    fetcher.route("https://app.test/api/ai/complete", 500, "down");
    let queue = queue_with(&fetcher);
    queue.enqueue(QueueName::Documents, &put(DOC, "a")).unwrap();
    queue
      .enqueue(
        QueueName::AiRequests,
        &Request::parse("POST", "https://app.test/api/ai/complete").unwrap(),
      )
      .unwrap();

    let reports = queue.drain_all(QualityTier::Fast).await;
    assert_eq!(reports.len(), QueueName::ALL.len());
    let succeeded: usize = reports.iter().map(|r| r.succeeded).sum();
    let failed: usize = reports.iter().map(DrainReport::failed).sum();
    assert_eq!((succeeded, failed), (1, 1));
    assert_eq!(Broadcast::sync_complete(&reports), Broadcast::SyncComplete {
      successful: 1,
      failed: 1,
      dropped: 0,
    });
  }

  #[tokio::test]
  async fn test_store_failure_keeps_item_pending_and_continues() {
    let fetcher = MockFetcher::new();
    fetcher.route(DOC, 200, "ok");
    let db = Database::in_memory().unwrap();
    let queue = DeferredQueue::new(
      QueueStore::new(db.clone()),
      Arc::new(fetcher.clone()),
      &QueueConfig::default(),
      TimeoutPolicy::default(),
    );
    let first = queue.enqueue(QueueName::Documents, &put(DOC, "first")).unwrap();
    queue.enqueue(QueueName::Documents, &put(DOC, "second")).unwrap();

    db.lock()
      .unwrap()
      .execute_batch(&format!(
        "CREATE TRIGGER fail_first BEFORE DELETE ON queue_documents
         WHEN OLD.id = {} BEGIN SELECT RAISE(ABORT, 'disk'); END;",
        first.id
      ))
      .unwrap();

    let report = queue.drain(QueueName::Documents, QualityTier::Fast).await.unwrap();
    assert_eq!(report.attempted, 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed(), 1);

    // The item is still pending, so a later drain picks it up
    db.lock().unwrap().execute_batch("DROP TRIGGER fail_first;").unwrap();
    let pending = queue.store.pending(QueueName::Documents).unwrap();
    assert_eq!(pending.iter().map(|i| i.id).collect::<Vec<_>>(), vec![first.id]);

    let report = queue.drain(QueueName::Documents, QualityTier::Fast).await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(queue.pending_count(QueueName::Documents).unwrap(), 0);
    assert_eq!(fetcher.call_count(), 3);
  }

  #[tokio::test]
  async fn test_undecodable_rows_are_dropped_as_malformed() {
    let fetcher = MockFetcher::new();
    let db = Database::in_memory().unwrap();
    let store = QueueStore::new(db.clone());
    db.lock()
      .unwrap()
      .execute(
        "INSERT INTO queue_analytics (request, size, enqueued_at, retry_count, state)
         VALUES (?, 2, ?, -1, 'pending')",
        rusqlite::params!["{}", Utc::now().timestamp_millis()],
      )
      .unwrap();
    let queue = DeferredQueue::new(
      store,
      Arc::new(fetcher.clone()),
      &QueueConfig::default(),
      TimeoutPolicy::default(),
    );
    assert_eq!(queue.pending_count(QueueName::Analytics).unwrap(), 1);

    let report = queue.drain(QueueName::Analytics, QualityTier::Fast).await.unwrap();
    assert_eq!(report.dropped[0].1, DropReason::Malformed);
    assert_eq!(queue.pending_count(QueueName::Analytics).unwrap(), 0);
    assert_eq!(fetcher.call_count(), 0);
  }

  #[test]
  fn test_recover_resets_attempting_items() {
    let fetcher = MockFetcher::new();
    let queue = queue_with(&fetcher);
    let item = queue.enqueue(QueueName::Documents, &put(DOC, "x")).unwrap();
    queue
      .store
      .set_state(QueueName::Documents, item.id, ItemState::Attempting)
      .unwrap();
    assert!(queue.store.pending(QueueName::Documents).unwrap().is_empty());

    assert_eq!(queue.recover().unwrap(), 1);
    assert_eq!(queue.store.pending(QueueName::Documents).unwrap().len(), 1);
  }
}

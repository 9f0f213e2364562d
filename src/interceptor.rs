//! Composition root for the interception layer.
//!
//! One [`Interceptor`] owns every component for the life of the process.
//! Requests flow through [`Interceptor::handle`]; control commands through
//! [`Interceptor::command`]; connectivity transitions through
//! [`Interceptor::on_transition`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::cache::{SqliteStorage, StrategyExecutor, TierName, TierSet, TierStorage};
use crate::classify::Classifier;
use crate::config::Config;
use crate::control::{Broadcast, Command};
use crate::db::Database;
use crate::fetch::Fetcher;
use crate::governor::{spawn_cleanup_task, StorageGovernor, StorageSnapshot, UsageCheck};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::network::{spawn_probe_task, NetworkMonitor, NetworkState, TimeoutPolicy, Transition};
use crate::queue::{DeferredQueue, DrainReport, QueueName, QueueStore};
use crate::request::{Request, Response};

const BROADCAST_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize)]
pub struct Status {
  pub version: String,
  pub network: NetworkState,
  pub storage: StorageSnapshot,
  pub queues: BTreeMap<QueueName, u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PreloadReport {
  pub stored: Vec<String>,
  pub failed: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivateReport {
  pub previous_version: Option<String>,
  pub dropped_namespaces: usize,
  pub recovered_items: usize,
}

pub struct Interceptor {
  config: Config,
  db: Database,
  classifier: Classifier,
  tiers: Arc<TierSet>,
  executor: StrategyExecutor,
  queue: Arc<DeferredQueue>,
  governor: Arc<StorageGovernor>,
  monitor: Arc<NetworkMonitor>,
  metrics: Arc<Metrics>,
  fetcher: Arc<dyn Fetcher>,
  broadcasts: broadcast::Sender<Broadcast>,
}

impl Interceptor {
  pub fn new(config: Config, db: Database, fetcher: Arc<dyn Fetcher>) -> Self {
    let tiers = Arc::new(TierSet::new(&config.version, &config.tiers));
    let storage: Arc<dyn TierStorage> = Arc::new(SqliteStorage::new(db.clone()));
    let metrics = Arc::new(Metrics::new());
    let monitor = Arc::new(NetworkMonitor::new(Duration::from_secs(
      config.network.probe_interval_secs,
    )));
    let queue = Arc::new(DeferredQueue::new(
      QueueStore::new(db.clone()),
      Arc::clone(&fetcher),
      &config.queue,
      TimeoutPolicy::new(config.network.timeout_scale),
    ));
    let governor = Arc::new(StorageGovernor::new(
      Arc::clone(&storage),
      Arc::clone(&tiers),
      Arc::clone(&queue),
      Arc::clone(&metrics),
      &config.storage,
    ));
    let executor = StrategyExecutor::new(
      storage,
      Arc::clone(&tiers),
      Arc::clone(&fetcher),
      Arc::clone(&monitor),
      Arc::clone(&queue),
      Arc::clone(&metrics),
      &config,
    );
    let classifier = Classifier::new(config.origin.clone(), &config.module_name);
    let (broadcasts, _) = broadcast::channel(BROADCAST_CAPACITY);

    Self {
      config,
      db,
      classifier,
      tiers,
      executor,
      queue,
      governor,
      monitor,
      metrics,
      fetcher,
      broadcasts,
    }
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn monitor(&self) -> Arc<NetworkMonitor> {
    Arc::clone(&self.monitor)
  }

  pub fn subscribe(&self) -> broadcast::Receiver<Broadcast> {
    self.broadcasts.subscribe()
  }

  /// Start the latency probe and the periodic cleanup task.
  pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
    let probe = spawn_probe_task(
      Arc::clone(&self.monitor),
      Arc::clone(&self.fetcher),
      self.config.probe_url(),
      Duration::from_secs(self.config.network.probe_interval_secs),
    );

    let broadcasts = self.broadcasts.clone();
    let cleanup = spawn_cleanup_task(
      Arc::clone(&self.governor),
      Duration::from_secs(self.config.storage.cleanup_interval_secs),
      self.executor.cleanup_signal(),
      move |check| {
        if let Some(warning) = storage_warning(&check) {
          let _ = broadcasts.send(warning);
        }
      },
    );

    vec![probe, cleanup]
  }

  /// Precache the app shell. Failures are logged and reported, never fatal.
  pub async fn install(&self) -> PreloadReport {
    tracing::info!("Installing cache version {}", self.tiers.version());
    let report = self.preload(&self.config.precache).await;
    if !report.failed.is_empty() {
      tracing::warn!("Precache incomplete: {} of {} failed", report.failed.len(), self.config.precache.len());
    }
    report
  }

  /// Drop tiers of older versions and recover interrupted queue items.
  pub fn activate(&self) -> Result<ActivateReport> {
    let previous_version = self.db.active_version()?;
    let dropped_namespaces = self.governor.drop_stale_namespaces()?;
    let recovered_items = self.queue.recover()?;
    self.db.set_active_version(self.tiers.version())?;

    tracing::info!(
      "Activated cache version {} (previous: {:?}, dropped {} namespaces, recovered {} items)",
      self.tiers.version(),
      previous_version,
      dropped_namespaces,
      recovered_items
    );
    Ok(ActivateReport {
      previous_version,
      dropped_namespaces,
      recovered_items,
    })
  }

  /// Route one intercepted request through its strategy.
  pub async fn handle(&self, request: Request) -> Response {
    let class = self.classifier.classify(&request);
    tracing::debug!(
      "{} {} -> {:?} / {:?}",
      request.method,
      request.url,
      class.category,
      class.strategy
    );
    self.executor.execute(&request, class).await
  }

  /// React to a connectivity or quality change.
  pub async fn on_transition(&self, transition: Transition) -> Vec<DrainReport> {
    if transition == Transition::Unchanged {
      return Vec::new();
    }

    let state = self.monitor.state();
    let _ = self.broadcasts.send(Broadcast::StatusChanged {
      online: state.is_online,
      quality: state.quality,
    });

    if transition != Transition::CameOnline {
      return Vec::new();
    }
    match self.sync(None).await {
      Ok(reports) => reports,
      Err(e) => {
        tracing::error!("Sync after reconnect failed: {}", e);
        Vec::new()
      }
    }
  }

  /// Drain one queue or all of them, then announce the result.
  /// Does nothing while offline.
  pub async fn sync(&self, queue: Option<QueueName>) -> Result<Vec<DrainReport>> {
    let state = self.monitor.state();
    if !state.is_online {
      tracing::debug!("Skipping sync while offline");
      return Ok(Vec::new());
    }

    let reports = match queue {
      Some(q) => vec![self.queue.drain(q, state.quality).await?],
      None => self.queue.drain_all(state.quality).await,
    };
    let _ = self.broadcasts.send(Broadcast::sync_complete(&reports));
    Ok(reports)
  }

  /// Periodic sync opportunity: drain when online and anything is waiting.
  pub async fn sync_tick(&self) -> Result<Vec<DrainReport>> {
    let requested = self.queue.take_sync_request();
    let (pending, _) = self.queue.usage()?;
    if !self.monitor.is_online() || (!requested && pending == 0) {
      return Ok(Vec::new());
    }
    self.sync(None).await
  }

  pub fn status(&self) -> Result<Status> {
    let mut queues = BTreeMap::new();
    for queue in QueueName::ALL {
      queues.insert(queue, self.queue.pending_count(queue)?);
    }
    Ok(Status {
      version: self.tiers.version().to_string(),
      network: self.monitor.state(),
      storage: self.governor.snapshot()?,
      queues,
    })
  }

  pub fn clear_cache(&self, tier: Option<TierName>) -> Result<usize> {
    self.governor.clear(tier)
  }

  /// Fetch and store every URL regardless of what is cached.
  pub async fn preload(&self, urls: &[String]) -> PreloadReport {
    let attempts = urls.iter().map(|url| async move {
      let outcome = match self.config.resolve(url) {
        Ok(resolved) => {
          let request = Request::get(resolved);
          let class = self.classifier.classify(&request);
          match self.executor.preload(&request, class).await {
            Ok(resp) if resp.is_success() => Ok(()),
            Ok(resp) => Err(format!("HTTP {}", resp.status)),
            Err(e) => Err(e.to_string()),
          }
        }
        Err(e) => Err(e.to_string()),
      };
      (url.clone(), outcome)
    });

    let mut report = PreloadReport::default();
    for (url, outcome) in join_all(attempts).await {
      match outcome {
        Ok(()) => report.stored.push(url),
        Err(e) => {
          tracing::debug!("Preload of {} failed: {}", url, e);
          report.failed.insert(url, e);
        }
      }
    }
    report
  }

  pub fn metrics(&self) -> MetricsSnapshot {
    self.metrics.snapshot()
  }

  /// Drop stale namespaces, run every cleanup pass and compact the database.
  pub fn optimize(&self) -> Result<Value> {
    let stale_namespaces = self.governor.drop_stale_namespaces()?;
    let cleanup = self.governor.cleanup(Utc::now())?;
    self.db.vacuum()?;
    let storage = self.governor.snapshot()?;

    Ok(json!({
      "stale_namespaces": stale_namespaces,
      "cleanup": cleanup,
      "storage": storage,
    }))
  }

  /// Execute one control command.
  pub async fn command(&self, command: Command) -> Result<Value> {
    match command {
      Command::GetStatus => to_value(&self.status()?),
      Command::ClearCache { tier } => Ok(json!({ "cleared": self.clear_cache(tier)? })),
      Command::ForceSync { queue } => {
        let reports = self.sync(queue).await?;
        Ok(json!({ "summary": Broadcast::sync_complete(&reports), "reports": reports }))
      }
      Command::Preload { urls } => to_value(&self.preload(&urls).await),
      Command::GetMetrics => to_value(&self.metrics()),
      Command::OptimizeStorage => self.optimize(),
      Command::Fetch {
        method,
        url,
        headers,
        body,
      } => {
        let mut request = Request::new(&method, self.config.resolve(&url)?);
        for (name, value) in &headers {
          request = request.with_header(name, value);
        }
        if let Some(body) = body {
          request = request.with_body(body);
        }
        Ok(response_json(&self.handle(request).await))
      }
      Command::Network {
        online,
        effective_type,
      } => {
        // Transitions are picked up by subscribers of the monitor
        if let Some(online) = online {
          self.monitor.set_online(online);
        }
        if let Some(effective_type) = effective_type {
          self.monitor.record_effective_type(&effective_type);
        }
        to_value(&self.monitor.state())
      }
    }
  }
}

/// Warning broadcast for a check that crossed the threshold.
pub fn storage_warning(check: &UsageCheck) -> Option<Broadcast> {
  check.warning.then(|| Broadcast::StorageWarning {
    used_bytes: check.before.used_bytes,
    quota_bytes: check.before.quota_bytes,
    ratio: check.before.ratio,
  })
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
  serde_json::to_value(value).map_err(|e| eyre!("Failed to serialize reply: {}", e))
}

fn response_json(resp: &Response) -> Value {
  json!({
    "status": resp.status,
    "headers": resp.headers,
    "body": resp.body_text(),
    "meta": resp.meta,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::fetch::MockFetcher;
  use crate::governor::CleanupReport;
  use url::Url;

  fn config(version: &str) -> Config {
    Config {
      origin: Url::parse("https://app.test").unwrap(),
      version: version.to_string(),
      ..Default::default()
    }
  }

  fn interceptor(db: Database, fetcher: &MockFetcher, version: &str) -> Interceptor {
    Interceptor::new(config(version), db, Arc::new(fetcher.clone()))
  }

  fn get(url: &str) -> Request {
    Request::parse("GET", url).unwrap()
  }

  #[tokio::test]
  async fn test_install_precaches_app_shell() {
    let fetcher = MockFetcher::new();
    for path in ["/", "/index.html", "/offline.html"] {
      fetcher.route(&format!("https://app.test{}", path), 200, format!("shell {}", path));
    }
    let app = interceptor(Database::in_memory().unwrap(), &fetcher, "v1");

    let report = app.install().await;
    assert_eq!(report.stored.len(), 3);
    assert!(report.failed.contains_key("/manifest.json"));

    app.monitor().set_online(false);
    let resp = app.handle(get("https://app.test/index.html")).await;
    assert_eq!(resp.body_text(), "shell /index.html");
    assert_ne!(resp.meta.source, CacheSource::Network);
  }

  #[tokio::test]
  async fn test_activate_drops_previous_version() {
    let db = Database::in_memory().unwrap();
    let fetcher = MockFetcher::new();
    fetcher.route("https://app.test/img/logo.png", 200, "png");

    let v1 = interceptor(db.clone(), &fetcher, "v1");
    v1.activate().unwrap();
    v1.handle(get("https://app.test/img/logo.png")).await;
    assert_eq!(v1.status().unwrap().storage.tiers[&TierName::Images].entries, 1);

    let v2 = interceptor(db.clone(), &fetcher, "v2");
    let report = v2.activate().unwrap();
    assert_eq!(report.previous_version.as_deref(), Some("v1"));
    assert_eq!(report.dropped_namespaces, 1);
    assert_eq!(db.active_version().unwrap().as_deref(), Some("v2"));

    // The old entry is gone, so the next read goes to the network
    v2.handle(get("https://app.test/img/logo.png")).await;
    assert_eq!(fetcher.calls_to("https://app.test/img/logo.png"), 2);
  }

  #[tokio::test]
  async fn test_reconnect_drains_queues_and_broadcasts() {
    let fetcher = MockFetcher::new();
    fetcher.route("https://app.test/api/ai/complete", 200, "done");
    fetcher.route("https://app.test/api/documents/1", 503, "busy");
    fetcher.route("https://app.test/api/analytics/event", 422, "bad");
    let app = interceptor(Database::in_memory().unwrap(), &fetcher, "v1");
    let mut rx = app.subscribe();

    let monitor = app.monitor();
    monitor.set_online(false);
    for (method, url) in [
      ("POST", "https://app.test/api/ai/complete"),
      ("PUT", "https://app.test/api/documents/1"),
      ("POST", "https://app.test/api/analytics/event"),
    ] {
      let resp = app.handle(Request::parse(method, url).unwrap().with_body("{}")).await;
      assert_eq!(resp.status, 202);
    }
    assert_eq!(fetcher.call_count(), 0);

    let transition = monitor.set_online(true);
    assert_eq!(transition, Transition::CameOnline);
    let reports = app.on_transition(transition).await;
    assert_eq!(reports.len(), QueueName::ALL.len());

    assert!(matches!(rx.try_recv().unwrap(), Broadcast::StatusChanged { online: true, .. }));
    assert_eq!(
      rx.try_recv().unwrap(),
      Broadcast::SyncComplete {
        successful: 1,
        failed: 1,
        dropped: 1
      }
    );

    let status = app.status().unwrap();
    assert_eq!(status.queues[&QueueName::AiRequests], 0);
    assert_eq!(status.queues[&QueueName::Documents], 1);
    assert_eq!(status.queues[&QueueName::Analytics], 0);
  }

  #[tokio::test]
  async fn test_sync_is_skipped_offline() {
    let fetcher = MockFetcher::new();
    let app = interceptor(Database::in_memory().unwrap(), &fetcher, "v1");
    app.monitor().set_online(false);
    app
      .handle(Request::parse("POST", "https://app.test/api/ai/complete").unwrap())
      .await;

    assert!(app.sync_tick().await.unwrap().is_empty());
    assert!(app.sync(None).await.unwrap().is_empty());
    assert_eq!(fetcher.call_count(), 0);
  }

  #[tokio::test]
  async fn test_sync_tick_drains_when_online() {
    let fetcher = MockFetcher::new();
    fetcher.route("https://app.test/api/documents/2", 200, "ok");
    let app = interceptor(Database::in_memory().unwrap(), &fetcher, "v1");
    fetcher.set_offline(true);
    let resp = app
      .handle(Request::parse("PUT", "https://app.test/api/documents/2").unwrap())
      .await;
    assert_eq!(resp.status, 202);

    fetcher.set_offline(false);
    let reports = app.sync_tick().await.unwrap();
    assert_eq!(reports.iter().map(|r| r.succeeded).sum::<usize>(), 1);
    assert!(app.sync_tick().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_commands() {
    let fetcher = MockFetcher::new();
    fetcher.route("https://app.test/api/documents/9", 200, "doc 9");
    fetcher.route("https://app.test/fonts/inter.woff2", 200, "font");
    let app = interceptor(Database::in_memory().unwrap(), &fetcher, "v1");

    let status = app.command(Command::GetStatus).await.unwrap();
    assert_eq!(status["version"], "v1");
    assert_eq!(status["network"]["is_online"], true);

    let reply = app
      .command(Command::Fetch {
        method: "GET".to_string(),
        url: "/api/documents/9".to_string(),
        headers: BTreeMap::new(),
        body: None,
      })
      .await
      .unwrap();
    assert_eq!(reply["status"], 200);
    assert_eq!(reply["body"], "doc 9");
    assert_eq!(reply["meta"]["source"], "network");

    let reply = app
      .command(Command::Preload {
        urls: vec!["/fonts/inter.woff2".to_string()],
      })
      .await
      .unwrap();
    assert_eq!(reply["stored"][0], "/fonts/inter.woff2");

    let reply = app.command(Command::ClearCache { tier: None }).await.unwrap();
    assert_eq!(reply["cleared"], 2);

    let metrics = app.command(Command::GetMetrics).await.unwrap();
    assert_eq!(metrics["network_fetches"], 2);

    let reply = app.command(Command::OptimizeStorage).await.unwrap();
    assert_eq!(reply["stale_namespaces"], 0);

    let reply = app
      .command(Command::Network {
        online: Some(false),
        effective_type: None,
      })
      .await
      .unwrap();
    assert_eq!(reply["is_online"], false);
  }

  #[test]
  fn test_storage_warning_only_over_threshold() {
    let snapshot = StorageSnapshot {
      used_bytes: 82,
      quota_bytes: 100,
      ratio: 0.82,
      tiers: BTreeMap::new(),
      queued_items: 0,
      queued_bytes: 0,
    };
    let mut check = UsageCheck {
      before: snapshot.clone(),
      report: CleanupReport::default(),
      after: snapshot,
      warning: true,
    };
    assert!(matches!(
      storage_warning(&check),
      Some(Broadcast::StorageWarning { used_bytes: 82, .. })
    ));

    check.warning = false;
    assert!(storage_warning(&check).is_none());
  }
}

//! Strategy executor that orchestrates caching logic with network fetching.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::json;
use tokio::sync::Notify;
use url::Url;

use super::key::CacheKey;
use super::storage::TierStorage;
use super::tier::{CacheTier, TierName, TierSet};
use super::entry::{CachedEntry, ResponseMeta};
use crate::classify::{Category, Classification, Strategy};
use crate::config::Config;
use crate::fetch::{FetchError, Fetcher};
use crate::integrity::IntegrityValidator;
use crate::metrics::Metrics;
use crate::network::{NetworkMonitor, TimeoutPolicy};
use crate::queue::DeferredQueue;
use crate::request::{Request, Response};

/// A network refresh that every waiter on the same key shares.
type SharedFetch = Shared<BoxFuture<'static, Result<Response, FetchError>>>;

/// Executes the caching strategy bound to a request's category.
///
/// This sits between the application and the network, serving responses
/// from the cache tiers with bounded staleness and deferring writes that
/// cannot be delivered.
#[derive(Clone)]
pub struct StrategyExecutor {
  storage: Arc<dyn TierStorage>,
  tiers: Arc<TierSet>,
  fetcher: Arc<dyn Fetcher>,
  monitor: Arc<NetworkMonitor>,
  queue: Arc<DeferredQueue>,
  metrics: Arc<Metrics>,
  validator: IntegrityValidator,
  timeouts: TimeoutPolicy,
  in_flight: Arc<Mutex<HashMap<String, SharedFetch>>>,
  /// Notified after writes of at least `large_write_bytes`
  large_write: Arc<Notify>,
  large_write_bytes: u64,
  offline_page: Url,
  ai_params: Arc<Vec<String>>,
}

impl StrategyExecutor {
  pub fn new(
    storage: Arc<dyn TierStorage>,
    tiers: Arc<TierSet>,
    fetcher: Arc<dyn Fetcher>,
    monitor: Arc<NetworkMonitor>,
    queue: Arc<DeferredQueue>,
    metrics: Arc<Metrics>,
    config: &Config,
  ) -> Self {
    Self {
      storage,
      tiers,
      fetcher,
      monitor,
      queue,
      metrics,
      validator: IntegrityValidator::new(&config.module_name),
      timeouts: TimeoutPolicy::new(config.network.timeout_scale),
      in_flight: Arc::new(Mutex::new(HashMap::new())),
      large_write: Arc::new(Notify::new()),
      large_write_bytes: config.storage.large_write_bytes,
      offline_page: config
        .origin
        .join("/offline.html")
        .unwrap_or_else(|_| config.origin.clone()),
      ai_params: Arc::new(config.ai.cache_key_params.clone()),
    }
  }

  /// Signal raised after large writes so cleanup can run early.
  pub fn cleanup_signal(&self) -> Arc<Notify> {
    Arc::clone(&self.large_write)
  }

  pub fn cache_key(&self, request: &Request, category: Category) -> CacheKey {
    CacheKey::for_url(&request.url, category, &self.ai_params)
  }

  /// Run the request through its strategy. Never fails: missing fallbacks
  /// produce a synthesized failure response.
  pub async fn execute(&self, request: &Request, class: Classification) -> Response {
    let Some(tier_name) = class.tier() else {
      return self.network_only(request, class).await;
    };
    let tier = self.tiers.get(tier_name).clone();
    let key = self.cache_key(request, class.category);

    match class.strategy {
      Strategy::CacheFirst => self.cache_first(request, class, &tier, &key).await,
      Strategy::NetworkFirst => self.network_first(request, class, &tier, &key).await,
      Strategy::StaleWhileRevalidate => {
        self
          .stale_while_revalidate(request, class, &tier, &key)
          .await
      }
      Strategy::NetworkOnly => self.network_only(request, class).await,
    }
  }

  /// Fetch and store a cacheable request regardless of what is cached.
  pub async fn preload(&self, request: &Request, class: Classification) -> Result<Response, FetchError> {
    let Some(tier_name) = class.tier() else {
      return Err(FetchError::Invalid(format!("{} is not cacheable", request.url)));
    };
    let tier = self.tiers.get(tier_name).clone();
    let key = self.cache_key(request, class.category);
    self.fetch_shared(request, class, &tier, &key).await
  }

  /// 1. Fresh, trusted entry - return it without touching the network
  /// 2. Otherwise fetch and store
  /// 3. On failure serve the stale copy, else fail
  async fn cache_first(
    &self,
    request: &Request,
    class: Classification,
    tier: &CacheTier,
    key: &CacheKey,
  ) -> Response {
    let cached = self.lookup(tier, key);
    if let Some(entry) = &cached {
      if self.is_fresh(entry, tier) && self.trusted(class.category, entry) {
        self.metrics.record_hit();
        tracing::debug!("Cache hit for {} in {}", key.description(), tier.name);
        return entry.to_response(ResponseMeta::from_cache(entry.stored_at, false));
      }
    }

    self.metrics.record_miss();
    let result = self.fetch_shared(request, class, tier, key).await;
    self.settle(request, class, cached, result)
  }

  async fn network_first(
    &self,
    request: &Request,
    class: Classification,
    tier: &CacheTier,
    key: &CacheKey,
  ) -> Response {
    if !self.monitor.is_online() {
      let cached = self.lookup(tier, key);
      return self.fallback(request, class, cached, &FetchError::Offline);
    }

    let result = self.fetch_shared(request, class, tier, key).await;
    let cached = match &result {
      Ok(resp) if resp.status < 500 => None,
      _ => self.lookup(tier, key),
    };
    self.settle(request, class, cached, result)
  }

  async fn stale_while_revalidate(
    &self,
    request: &Request,
    class: Classification,
    tier: &CacheTier,
    key: &CacheKey,
  ) -> Response {
    let cached = self
      .lookup(tier, key)
      .filter(|entry| self.trusted(class.category, entry));

    if let Some(entry) = cached {
      self.metrics.record_hit();
      if self.monitor.is_online() {
        self.metrics.record_background_refresh();
        let refresh = self.fetch_shared(request, class, tier, key);
        let url = request.url.clone();
        tokio::spawn(async move {
          if let Err(e) = refresh.await {
            tracing::debug!("Background refresh of {} failed: {}", url, e);
          }
        });
      }
      let stale = !self.is_fresh(&entry, tier);
      return entry.to_response(ResponseMeta::from_cache(entry.stored_at, stale));
    }

    self.metrics.record_miss();
    self.network_first(request, class, tier, key).await
  }

  async fn network_only(&self, request: &Request, class: Classification) -> Response {
    let state = self.monitor.state();
    if !state.is_online {
      if class.sync_eligible {
        return self.defer(request, class);
      }
      return self.failure(request, class.category, &FetchError::Offline);
    }

    let timeout = self.timeouts.timeout(class.category, state.quality);
    let result = match tokio::time::timeout(timeout, self.fetcher.fetch(request)).await {
      Ok(result) => result,
      Err(_) => Err(FetchError::Timeout(timeout)),
    };
    self.metrics.record_fetch(result.is_ok());

    match result {
      Ok(resp) => resp,
      Err(e) if class.sync_eligible => {
        tracing::debug!("Deferring {} {} after failure: {}", request.method, request.url, e);
        self.defer(request, class)
      }
      Err(e) => self.failure(request, class.category, &e),
    }
  }

  /// Join the in-flight refresh for this key, or start one.
  fn fetch_shared(
    &self,
    request: &Request,
    class: Classification,
    tier: &CacheTier,
    key: &CacheKey,
  ) -> SharedFetch {
    let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(existing) = in_flight.get(key.as_str()) {
      self.metrics.record_dedup_join();
      return existing.clone();
    }

    let this = self.clone();
    let request = request.clone();
    let tier = tier.clone();
    let key = key.as_str().to_string();
    let map_key = key.clone();

    let fetch = async move {
      let result = this
        .fetch_and_store(&request, class.category, &tier, &key)
        .await;
      this
        .in_flight
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&key);
      result
    }
    .boxed()
    .shared();

    in_flight.insert(map_key, fetch.clone());
    fetch
  }

  /// One bounded network attempt. Successful responses are stored; binary
  /// modules only after passing integrity validation.
  async fn fetch_and_store(
    &self,
    request: &Request,
    category: Category,
    tier: &CacheTier,
    key: &str,
  ) -> Result<Response, FetchError> {
    let before = self.monitor.state();
    if !before.is_online {
      return Err(FetchError::Offline);
    }

    let timeout = self.timeouts.timeout(category, before.quality);
    let result = match tokio::time::timeout(timeout, self.fetcher.fetch(request)).await {
      Ok(result) => result,
      Err(_) => Err(FetchError::Timeout(timeout)),
    };
    self.metrics.record_fetch(result.is_ok());
    let response = result?;

    // Responses that outlive an online -> offline transition are not trusted
    if self.monitor.state().offline_epoch != before.offline_epoch {
      return Err(FetchError::Interrupted);
    }
    if !response.is_success() {
      return Ok(response);
    }

    if category == Category::BinaryModule && !self.validator.validate(&request.url, &response.body) {
      self.metrics.record_integrity_failure();
      tracing::warn!("Discarding {}: failed integrity check", request.url);
      return Err(FetchError::Integrity(request.url.to_string()));
    }

    let entry = CachedEntry::from_response(key, request.url.as_str(), &response);
    match self.storage.put(&tier.namespace, &entry) {
      Ok(()) => {
        if entry.size() >= self.large_write_bytes {
          self.large_write.notify_one();
        }
      }
      Err(e) => tracing::error!("Failed to cache {}: {}", request.url, e),
    }
    Ok(response)
  }

  /// Turn a network outcome into a response, falling back to `cached`.
  fn settle(
    &self,
    request: &Request,
    class: Classification,
    cached: Option<CachedEntry>,
    result: Result<Response, FetchError>,
  ) -> Response {
    match result {
      Ok(resp) if resp.status < 500 => resp,
      Ok(resp) => match cached.filter(|e| self.trusted(class.category, e)) {
        Some(entry) => {
          self.metrics.record_fallback();
          entry.to_response(ResponseMeta::from_cache(entry.stored_at, true))
        }
        None => resp,
      },
      Err(err) => self.fallback(request, class, cached, &err),
    }
  }

  /// Serve any stored copy regardless of freshness. An untrusted binary
  /// module is served only when no network path exists, and flagged.
  fn fallback(
    &self,
    request: &Request,
    class: Classification,
    cached: Option<CachedEntry>,
    err: &FetchError,
  ) -> Response {
    if let Some(entry) = cached {
      let trusted = self.trusted(class.category, &entry);
      if trusted || err.is_unreachable() {
        self.metrics.record_fallback();
        let mut meta = if err.is_unreachable() {
          ResponseMeta::offline(entry.stored_at)
        } else {
          ResponseMeta::from_cache(entry.stored_at, true)
        };
        if !trusted {
          tracing::warn!("Serving unverified cached module {}", request.url);
          meta = meta.with_integrity_warning();
        }
        return entry.to_response(meta);
      }
    }
    self.failure(request, class.category, err)
  }

  /// Category-specific response when nothing can be served.
  fn failure(&self, request: &Request, category: Category, err: &FetchError) -> Response {
    tracing::debug!("No fallback for {} {}: {}", request.method, request.url, err);
    let offline = err.is_unreachable();

    match (err, category) {
      (FetchError::Integrity(_), _) => Response::json(
        500,
        &json!({ "error": err.to_string(), "offline": false }),
        ResponseMeta::synthesized(false, false),
      ),
      (_, Category::AppShell) if request.is_get() => self.offline_page(),
      (_, Category::Image | Category::Font) if request.is_get() => {
        Response::new(404, Vec::new()).with_meta(ResponseMeta::synthesized(offline, false))
      }
      _ => Response::json(
        if offline { 503 } else { 500 },
        &json!({ "error": err.to_string(), "offline": offline }),
        ResponseMeta::synthesized(offline, false),
      ),
    }
  }

  fn offline_page(&self) -> Response {
    let tier = self.tiers.get(TierName::AppShell);
    let key = CacheKey::for_url(&self.offline_page, Category::AppShell, &[]);
    match self.lookup(tier, &key) {
      Some(entry) => entry.to_response(ResponseMeta::offline(entry.stored_at)),
      None => Response::new(503, "<!doctype html><title>Offline</title><h1>You are offline</h1>")
        .with_header("content-type", "text/html; charset=utf-8")
        .with_meta(ResponseMeta::synthesized(true, false)),
    }
  }

  /// Hand a failed write to the deferred queue.
  fn defer(&self, request: &Request, class: Classification) -> Response {
    let queue = class.category.queue();
    match self.queue.enqueue(queue, request) {
      Ok(item) => {
        self.metrics.record_queued();
        Response::json(
          202,
          &json!({ "queued": true, "queue": queue, "id": item.id }),
          ResponseMeta::synthesized(true, true),
        )
      }
      Err(e) => {
        tracing::error!("Failed to queue {} {}: {}", request.method, request.url, e);
        Response::json(
          503,
          &json!({ "error": "request could not be queued", "offline": true, "queued": false }),
          ResponseMeta::synthesized(true, false),
        )
      }
    }
  }

  fn lookup(&self, tier: &CacheTier, key: &CacheKey) -> Option<CachedEntry> {
    match self.storage.get(&tier.namespace, key.as_str()) {
      Ok(entry) => entry,
      Err(e) => {
        tracing::error!("Cache read failed in {}: {}", tier.name, e);
        None
      }
    }
  }

  fn is_fresh(&self, entry: &CachedEntry, tier: &CacheTier) -> bool {
    entry.age(Utc::now()) < tier.policy.max_age()
  }

  /// Binary modules must pass validation before they are trusted.
  fn trusted(&self, category: Category, entry: &CachedEntry) -> bool {
    if category != Category::BinaryModule {
      return true;
    }
    Url::parse(&entry.url)
      .map(|url| self.validator.validate(&url, &entry.payload))
      .unwrap_or(false)
  }
}

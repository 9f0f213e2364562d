//! Counters reported through the control channel.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Lock-free request counters.
#[derive(Debug, Default)]
pub struct Metrics {
  cache_hits: AtomicU64,
  cache_misses: AtomicU64,
  network_fetches: AtomicU64,
  network_failures: AtomicU64,
  fallbacks: AtomicU64,
  dedup_joins: AtomicU64,
  background_refreshes: AtomicU64,
  queued: AtomicU64,
  integrity_failures: AtomicU64,
  evictions: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
  pub cache_hits: u64,
  pub cache_misses: u64,
  pub network_fetches: u64,
  pub network_failures: u64,
  pub fallbacks: u64,
  pub dedup_joins: u64,
  pub background_refreshes: u64,
  pub queued: u64,
  pub integrity_failures: u64,
  pub evictions: u64,
}

impl Metrics {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn record_hit(&self) {
    self.cache_hits.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_miss(&self) {
    self.cache_misses.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_fetch(&self, ok: bool) {
    self.network_fetches.fetch_add(1, Ordering::Relaxed);
    if !ok {
      self.network_failures.fetch_add(1, Ordering::Relaxed);
    }
  }

  pub fn record_fallback(&self) {
    self.fallbacks.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_dedup_join(&self) {
    self.dedup_joins.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_background_refresh(&self) {
    self.background_refreshes.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_queued(&self) {
    self.queued.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_integrity_failure(&self) {
    self.integrity_failures.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_evictions(&self, count: usize) {
    self.evictions.fetch_add(count as u64, Ordering::Relaxed);
  }

  pub fn snapshot(&self) -> MetricsSnapshot {
    MetricsSnapshot {
      cache_hits: self.cache_hits.load(Ordering::Relaxed),
      cache_misses: self.cache_misses.load(Ordering::Relaxed),
      network_fetches: self.network_fetches.load(Ordering::Relaxed),
      network_failures: self.network_failures.load(Ordering::Relaxed),
      fallbacks: self.fallbacks.load(Ordering::Relaxed),
      dedup_joins: self.dedup_joins.load(Ordering::Relaxed),
      background_refreshes: self.background_refreshes.load(Ordering::Relaxed),
      queued: self.queued.load(Ordering::Relaxed),
      integrity_failures: self.integrity_failures.load(Ordering::Relaxed),
      evictions: self.evictions.load(Ordering::Relaxed),
    }
  }
}

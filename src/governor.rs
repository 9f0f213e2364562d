//! Storage quota governor.
//!
//! Measures usage across every tier and queue, and evicts cache entries when
//! tiers exceed their own limits or total usage crosses the warning ratio.
//! Queued requests are counted but never evicted here.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::interval;

use crate::cache::{EntryStamp, TierName, TierSet, TierStorage, TierUsage};
use crate::config::StorageConfig;
use crate::metrics::Metrics;
use crate::queue::DeferredQueue;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageSnapshot {
  pub used_bytes: u64,
  pub quota_bytes: u64,
  pub ratio: f64,
  pub tiers: BTreeMap<TierName, TierUsage>,
  pub queued_items: u64,
  pub queued_bytes: u64,
}

/// Entries removed by one cleanup run, per pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
  pub expired: usize,
  pub over_entries: usize,
  pub over_quota: usize,
  pub pressure: usize,
  pub bytes_freed: u64,
}

impl CleanupReport {
  pub fn total(&self) -> usize {
    self.expired + self.over_entries + self.over_quota + self.pressure
  }
}

#[derive(Debug, Clone)]
pub struct UsageCheck {
  pub before: StorageSnapshot,
  pub report: CleanupReport,
  pub after: StorageSnapshot,
  /// Usage was at or above the warning ratio before cleanup
  pub warning: bool,
}

pub struct StorageGovernor {
  storage: Arc<dyn TierStorage>,
  tiers: Arc<TierSet>,
  queue: Arc<DeferredQueue>,
  metrics: Arc<Metrics>,
  quota_bytes: u64,
  warning_ratio: f64,
}

impl StorageGovernor {
  pub fn new(
    storage: Arc<dyn TierStorage>,
    tiers: Arc<TierSet>,
    queue: Arc<DeferredQueue>,
    metrics: Arc<Metrics>,
    config: &StorageConfig,
  ) -> Self {
    Self {
      storage,
      tiers,
      queue,
      metrics,
      quota_bytes: config.quota_bytes,
      warning_ratio: config.warning_ratio,
    }
  }

  /// Usage in bytes at which pressure eviction starts.
  pub fn threshold(&self) -> u64 {
    (self.quota_bytes as f64 * self.warning_ratio) as u64
  }

  pub fn snapshot(&self) -> Result<StorageSnapshot> {
    let mut tiers = BTreeMap::new();
    for tier in self.tiers.iter() {
      tiers.insert(tier.name, self.storage.usage(&tier.namespace)?);
    }
    let (queued_items, queued_bytes) = self.queue.usage()?;
    let used_bytes = tiers.values().map(|u| u.bytes).sum::<u64>() + queued_bytes;

    Ok(StorageSnapshot {
      used_bytes,
      quota_bytes: self.quota_bytes,
      ratio: if self.quota_bytes == 0 {
        1.0
      } else {
        used_bytes as f64 / self.quota_bytes as f64
      },
      tiers,
      queued_items,
      queued_bytes,
    })
  }

  /// Measure, clean up and measure again.
  pub fn check_usage(&self, now: DateTime<Utc>) -> Result<UsageCheck> {
    let before = self.snapshot()?;
    let warning = before.ratio >= self.warning_ratio;
    if warning {
      tracing::warn!(
        "Storage usage at {:.0}% ({} of {} bytes)",
        before.ratio * 100.0,
        before.used_bytes,
        before.quota_bytes
      );
    }

    let report = self.cleanup(now)?;
    let after = self.snapshot()?;
    Ok(UsageCheck {
      before,
      report,
      after,
      warning,
    })
  }

  /// Run the eviction passes in order:
  /// 1. Entries past their tier's maximum age
  /// 2. Oldest entries over the tier entry ceiling
  /// 3. Oldest entries over the tier byte quota
  /// 4. Oldest entries across all tiers while usage is above the threshold
  ///
  /// No pass removes an entry younger than its tier's minimum retention.
  pub fn cleanup(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();
    let mut remaining: Vec<(EntryStamp, Duration)> = Vec::new();

    for tier in self.tiers.iter() {
      let policy = &tier.policy;
      let evictable = |s: &EntryStamp| now - s.stored_at >= policy.min_retention();

      let cutoff = now - policy.max_age().max(policy.min_retention());
      let bytes_before = self.storage.usage(&tier.namespace)?.bytes;
      let expired = self.storage.remove_older_than(&tier.namespace, cutoff)?;
      if expired > 0 {
        report.expired += expired;
        let bytes_after = self.storage.usage(&tier.namespace)?.bytes;
        report.bytes_freed += bytes_before.saturating_sub(bytes_after);
      }

      let live = self.storage.stamps(&tier.namespace)?;

      let mut count = live.len();
      let mut bytes: u64 = live.iter().map(|s| s.size).sum();
      let mut kept = Vec::new();
      for stamp in live {
        if count > policy.max_entries && evictable(&stamp) {
          self.evict(&stamp, &mut report)?;
          report.over_entries += 1;
          count -= 1;
          bytes = bytes.saturating_sub(stamp.size);
        } else {
          kept.push(stamp);
        }
      }

      for stamp in kept {
        if bytes > policy.quota_bytes && evictable(&stamp) {
          self.evict(&stamp, &mut report)?;
          report.over_quota += 1;
          bytes = bytes.saturating_sub(stamp.size);
        } else {
          remaining.push((stamp, policy.min_retention()));
        }
      }
    }

    let threshold = self.threshold();
    let mut used = self.snapshot()?.used_bytes;
    if used >= threshold {
      remaining.sort_by(|(a, _), (b, _)| a.stored_at.cmp(&b.stored_at));
      for (stamp, min_retention) in remaining {
        if used < threshold {
          break;
        }
        if now - stamp.stored_at < min_retention {
          continue;
        }
        self.evict(&stamp, &mut report)?;
        report.pressure += 1;
        used = used.saturating_sub(stamp.size);
      }
      if used >= threshold {
        tracing::warn!("Storage still above threshold after cleanup ({} bytes)", used);
      }
    }

    let total = report.total();
    self.metrics.record_evictions(total);
    if total > 0 {
      tracing::info!(
        "Cleanup: evicted {} entries ({} bytes)",
        total,
        report.bytes_freed
      );
    } else {
      tracing::debug!("Cleanup: nothing to evict");
    }
    Ok(report)
  }

  /// Clear one tier, or every tier.
  pub fn clear(&self, tier: Option<TierName>) -> Result<usize> {
    let mut cleared = 0;
    for t in self.tiers.iter().filter(|t| tier.map_or(true, |name| t.name == name)) {
      cleared += self.storage.clear(&t.namespace)?;
    }
    tracing::info!("Cleared {} cache entries", cleared);
    Ok(cleared)
  }

  /// Remove namespaces that belong to no current tier, such as those of an
  /// older cache version.
  pub fn drop_stale_namespaces(&self) -> Result<usize> {
    let current = self.tiers.namespaces();
    let mut dropped = 0;
    for namespace in self.storage.namespaces()? {
      if !current.contains(&namespace) {
        let removed = self.storage.clear(&namespace)?;
        tracing::info!("Dropped stale namespace {} ({} entries)", namespace, removed);
        dropped += 1;
      }
    }
    Ok(dropped)
  }

  fn evict(&self, stamp: &EntryStamp, report: &mut CleanupReport) -> Result<()> {
    if self.storage.remove(&stamp.namespace, &stamp.key)? {
      report.bytes_freed += stamp.size;
    }
    Ok(())
  }
}

/// Spawn the periodic cleanup task.
///
/// Runs on every interval tick and whenever `signal` is notified after a
/// large write. Each completed check is handed to `on_check`.
pub fn spawn_cleanup_task<F>(
  governor: Arc<StorageGovernor>,
  period: StdDuration,
  signal: Arc<Notify>,
  on_check: F,
) -> tokio::task::JoinHandle<()>
where
  F: Fn(UsageCheck) + Send + 'static,
{
  tokio::spawn(async move {
    tracing::info!("Cleanup task started (interval: {:?})", period);
    let mut timer = interval(period);

    loop {
      tokio::select! {
        _ = timer.tick() => {}
        _ = signal.notified() => tracing::debug!("Cleanup requested after large write"),
      }

      match governor.check_usage(Utc::now()) {
        Ok(check) => on_check(check),
        Err(e) => tracing::error!("Cleanup error: {}", e),
      }
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CachedEntry, SqliteStorage};
  use crate::config::{QueueConfig, TierOverride};
  use crate::db::Database;
  use crate::fetch::{Fetcher, MockFetcher};
  use crate::network::TimeoutPolicy;
  use crate::queue::{QueueName, QueueStore};
  use crate::request::Request;
  use std::sync::Mutex;

  struct Harness {
    governor: StorageGovernor,
    storage: Arc<SqliteStorage>,
    tiers: Arc<TierSet>,
    queue: Arc<DeferredQueue>,
    metrics: Arc<Metrics>,
  }

  fn harness(quota_bytes: u64, overrides: BTreeMap<TierName, TierOverride>) -> Harness {
    let db = Database::in_memory().unwrap();
    let storage = Arc::new(SqliteStorage::new(db.clone()));
    let fetcher: Arc<dyn Fetcher> = Arc::new(MockFetcher::new());
    let queue = Arc::new(DeferredQueue::new(
      QueueStore::new(db),
      fetcher,
      &QueueConfig::default(),
      TimeoutPolicy::default(),
    ));
    let tiers = Arc::new(TierSet::new("v1", &overrides));
    let metrics = Arc::new(Metrics::new());
    let config = StorageConfig {
      quota_bytes,
      ..Default::default()
    };
    let governor = StorageGovernor::new(
      storage.clone(),
      Arc::clone(&tiers),
      Arc::clone(&queue),
      Arc::clone(&metrics),
      &config,
    );
    Harness {
      governor,
      storage,
      tiers,
      queue,
      metrics,
    }
  }

  impl Harness {
    fn put(&self, tier: TierName, key: &str, size: usize, age: Duration) {
      let entry = CachedEntry {
        key: key.to_string(),
        url: String::new(),
        status: 200,
        headers: BTreeMap::new(),
        payload: vec![0; size],
        stored_at: Utc::now() - age,
      };
      self.storage.put(&self.tiers.get(tier).namespace, &entry).unwrap();
    }

    fn has(&self, tier: TierName, key: &str) -> bool {
      self
        .storage
        .get(&self.tiers.get(tier).namespace, key)
        .unwrap()
        .is_some()
    }
  }

  fn override_for(tier: TierName, o: TierOverride) -> BTreeMap<TierName, TierOverride> {
    BTreeMap::from([(tier, o)])
  }

  #[test]
  fn test_snapshot_counts_tiers_and_queues() {
    let h = harness(10_000, BTreeMap::new());
    h.put(TierName::Images, "a", 1000, Duration::hours(2));
    h.queue
      .enqueue(QueueName::General, &Request::parse("POST", "https://app.test/x").unwrap())
      .unwrap();

    let snapshot = h.governor.snapshot().unwrap();
    assert_eq!(snapshot.tiers[&TierName::Images].bytes, 1000);
    assert_eq!(snapshot.queued_items, 1);
    assert_eq!(snapshot.used_bytes, 1000 + snapshot.queued_bytes);
    assert!(snapshot.ratio > 0.1);
  }

  #[test]
  fn test_expired_entries_removed() {
    let h = harness(u64::MAX, BTreeMap::new());
    h.put(TierName::AiResponses, "old", 10, Duration::days(2));
    h.put(TierName::AiResponses, "new", 10, Duration::hours(2));

    let report = h.governor.cleanup(Utc::now()).unwrap();
    assert_eq!(report.expired, 1);
    assert!(!h.has(TierName::AiResponses, "old"));
    assert!(h.has(TierName::AiResponses, "new"));
    assert_eq!(h.metrics.snapshot().evictions, 1);
  }

  #[test]
  fn test_min_retention_outranks_max_age() {
    let h = harness(
      u64::MAX,
      override_for(
        TierName::Static,
        TierOverride {
          max_age_secs: Some(60),
          min_retention_secs: Some(3600),
          ..Default::default()
        },
      ),
    );
    h.put(TierName::Static, "young", 10, Duration::minutes(5));

    let report = h.governor.cleanup(Utc::now()).unwrap();
    assert_eq!(report.total(), 0);
    assert!(h.has(TierName::Static, "young"));
  }

  #[test]
  fn test_entry_ceiling_removes_oldest() {
    let h = harness(
      u64::MAX,
      override_for(
        TierName::Images,
        TierOverride {
          max_entries: Some(3),
          ..Default::default()
        },
      ),
    );
    for i in 0..5 {
      h.put(TierName::Images, &format!("img{}", i), 10, Duration::hours(10 - i));
    }

    let report = h.governor.cleanup(Utc::now()).unwrap();
    assert_eq!(report.over_entries, 2);
    assert!(!h.has(TierName::Images, "img0"));
    assert!(!h.has(TierName::Images, "img1"));
    assert!(h.has(TierName::Images, "img2"));
    assert!(h.has(TierName::Images, "img4"));
  }

  #[test]
  fn test_tier_quota_removes_oldest() {
    let h = harness(
      u64::MAX,
      override_for(
        TierName::Documents,
        TierOverride {
          quota_bytes: Some(2500),
          ..Default::default()
        },
      ),
    );
    for i in 0..3 {
      h.put(TierName::Documents, &format!("doc{}", i), 1000, Duration::hours(5 - i));
    }

    let report = h.governor.cleanup(Utc::now()).unwrap();
    assert_eq!(report.over_quota, 1);
    assert_eq!(report.bytes_freed, 1000);
    assert!(!h.has(TierName::Documents, "doc0"));
    assert!(h.has(TierName::Documents, "doc1"));
  }

  #[test]
  fn test_pressure_evicts_oldest_until_under_threshold() {
    // 8200 of 10000 bytes used: 82% against an 80% warning ratio
    let h = harness(10_000, BTreeMap::new());
    h.put(TierName::Images, "oldest", 1000, Duration::hours(9));
    h.put(TierName::Documents, "older", 1000, Duration::hours(8));
    for i in 0..6 {
      h.put(TierName::Static, &format!("s{}", i), 1000, Duration::hours(2));
    }
    h.put(TierName::Fonts, "recent", 200, Duration::hours(7));

    let check = h.governor.check_usage(Utc::now()).unwrap();
    assert!(check.warning);
    assert_eq!(check.before.used_bytes, 8200);
    assert!(check.after.used_bytes < h.governor.threshold());
    assert_eq!(check.report.pressure, 1);
    assert!(!h.has(TierName::Images, "oldest"));
    assert!(h.has(TierName::Documents, "older"));
  }

  #[test]
  fn test_pressure_respects_min_retention() {
    let h = harness(1000, BTreeMap::new());
    h.put(TierName::Documents, "fresh", 900, Duration::minutes(1));

    let check = h.governor.check_usage(Utc::now()).unwrap();
    assert!(check.warning);
    assert_eq!(check.report.total(), 0);
    assert!(h.has(TierName::Documents, "fresh"));
  }

  #[test]
  fn test_clear() {
    let h = harness(u64::MAX, BTreeMap::new());
    h.put(TierName::Images, "a", 10, Duration::hours(1));
    h.put(TierName::Fonts, "b", 10, Duration::hours(1));

    assert_eq!(h.governor.clear(Some(TierName::Images)).unwrap(), 1);
    assert!(h.has(TierName::Fonts, "b"));
    assert_eq!(h.governor.clear(None).unwrap(), 1);
  }

  #[test]
  fn test_drop_stale_namespaces() {
    let h = harness(u64::MAX, BTreeMap::new());
    h.put(TierName::Images, "keep", 10, Duration::hours(1));
    let old = CachedEntry {
      key: "k".to_string(),
      url: String::new(),
      status: 200,
      headers: BTreeMap::new(),
      payload: vec![1],
      stored_at: Utc::now(),
    };
    h.storage.put("v0-images", &old).unwrap();

    assert_eq!(h.governor.drop_stale_namespaces().unwrap(), 1);
    assert!(h.storage.get("v0-images", "k").unwrap().is_none());
    assert!(h.has(TierName::Images, "keep"));
  }

  #[tokio::test]
  async fn test_cleanup_task_runs_on_signal() {
    let h = harness(u64::MAX, BTreeMap::new());
    h.put(TierName::AiResponses, "old", 10, Duration::days(3));
    let storage = Arc::clone(&h.storage);
    let namespace = h.tiers.get(TierName::AiResponses).namespace.clone();

    let checks = Arc::new(Mutex::new(0));
    let seen = Arc::clone(&checks);
    let signal = Arc::new(Notify::new());
    let handle = spawn_cleanup_task(
      Arc::new(h.governor),
      StdDuration::from_secs(3600),
      Arc::clone(&signal),
      move |_| *seen.lock().unwrap() += 1,
    );

    // First tick fires immediately; the signal forces a second run
    tokio::time::sleep(StdDuration::from_millis(10)).await;
    signal.notify_one();
    tokio::time::sleep(StdDuration::from_millis(10)).await;
    handle.abort();

    assert_eq!(*checks.lock().unwrap(), 2);
    assert!(storage.get(&namespace, "old").unwrap().is_none());
  }
}

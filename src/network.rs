//! Network condition monitoring.
//!
//! The monitor owns the process-wide [`NetworkState`]. Consumers read copies
//! or subscribe to changes through a watch channel; only connectivity
//! signals and latency probes mutate it.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::interval;
use url::Url;

use crate::classify::Category;
use crate::fetch::Fetcher;
use crate::request::Request;

/// Coarse network speed classification used to scale timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum QualityTier {
  Fast,
  Moderate,
  Slow,
  Offline,
}

impl QualityTier {
  pub fn from_latency(latency: Duration) -> Self {
    match latency.as_millis() {
      0..=299 => QualityTier::Fast,
      300..=999 => QualityTier::Moderate,
      _ => QualityTier::Slow,
    }
  }

  /// Map a browser-style effective connection type.
  pub fn from_effective_type(effective_type: &str) -> Option<Self> {
    match effective_type.trim().to_ascii_lowercase().as_str() {
      "4g" | "5g" | "wifi" | "ethernet" => Some(QualityTier::Fast),
      "3g" => Some(QualityTier::Moderate),
      "2g" | "slow-2g" => Some(QualityTier::Slow),
      _ => None,
    }
  }

  fn timeout_factor(self) -> f64 {
    match self {
      QualityTier::Fast => 1.0,
      QualityTier::Moderate => 1.5,
      QualityTier::Slow | QualityTier::Offline => 2.5,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NetworkState {
  pub is_online: bool,
  pub quality: QualityTier,
  /// Incremented on every online to offline transition
  pub offline_epoch: u64,
  pub latency_ms: Option<u64>,
}

impl Default for NetworkState {
  fn default() -> Self {
    Self {
      is_online: true,
      quality: QualityTier::Moderate,
      offline_epoch: 0,
      latency_ms: None,
    }
  }
}

/// What changed after a connectivity or quality signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
  Unchanged,
  CameOnline,
  WentOffline,
  QualityChanged,
}

impl Transition {
  /// Classify the difference between two observed states.
  pub fn between(prev: &NetworkState, next: &NetworkState) -> Self {
    match (prev.is_online, next.is_online) {
      (false, true) => Transition::CameOnline,
      (true, false) => Transition::WentOffline,
      _ if prev.offline_epoch != next.offline_epoch => Transition::CameOnline,
      _ if prev.quality != next.quality => Transition::QualityChanged,
      _ => Transition::Unchanged,
    }
  }
}

pub struct NetworkMonitor {
  tx: watch::Sender<NetworkState>,
  probe_interval: Duration,
  last_quality_update: Mutex<Option<Instant>>,
}

impl NetworkMonitor {
  pub fn new(probe_interval: Duration) -> Self {
    let (tx, _rx) = watch::channel(NetworkState::default());
    Self {
      tx,
      probe_interval,
      last_quality_update: Mutex::new(None),
    }
  }

  /// Copy of the current state.
  pub fn state(&self) -> NetworkState {
    *self.tx.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.tx.borrow().is_online
  }

  pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
    self.tx.subscribe()
  }

  /// Apply a connectivity signal.
  pub fn set_online(&self, online: bool) -> Transition {
    let mut transition = Transition::Unchanged;
    self.tx.send_if_modified(|state| {
      if state.is_online == online {
        return false;
      }
      state.is_online = online;
      if online {
        state.quality = state
          .latency_ms
          .map(|ms| QualityTier::from_latency(Duration::from_millis(ms)))
          .unwrap_or(QualityTier::Moderate);
        transition = Transition::CameOnline;
      } else {
        state.quality = QualityTier::Offline;
        state.offline_epoch += 1;
        transition = Transition::WentOffline;
      }
      true
    });

    if transition != Transition::Unchanged {
      self.mark_quality_updated();
      tracing::info!("Network transition: {:?} ({:?})", transition, self.state().quality);
    }
    transition
  }

  /// Apply the outcome of a latency probe.
  pub fn record_probe(&self, outcome: Result<Duration, ()>) -> Transition {
    match outcome {
      Err(()) => self.set_online(false),
      Ok(latency) => {
        let ms = latency.as_millis() as u64;
        self.tx.send_modify(|state| state.latency_ms = Some(ms));

        let transition = self.set_online(true);
        if transition != Transition::Unchanged {
          return transition;
        }
        self.update_quality(QualityTier::from_latency(latency))
      }
    }
  }

  /// Apply an effective connection type hint such as `3g`.
  pub fn record_effective_type(&self, effective_type: &str) -> Transition {
    match QualityTier::from_effective_type(effective_type) {
      Some(quality) if self.is_online() => self.update_quality(quality),
      _ => Transition::Unchanged,
    }
  }

  /// Recompute quality at most once per probe interval.
  fn update_quality(&self, quality: QualityTier) -> Transition {
    {
      let last = self
        .last_quality_update
        .lock()
        .unwrap_or_else(|e| e.into_inner());
      if last.is_some_and(|t| t.elapsed() < self.probe_interval) {
        return Transition::Unchanged;
      }
    }
    self.mark_quality_updated();

    let changed = self.tx.send_if_modified(|state| {
      if state.quality == quality {
        return false;
      }
      state.quality = quality;
      true
    });

    if changed {
      tracing::debug!("Network quality now {:?}", quality);
      Transition::QualityChanged
    } else {
      Transition::Unchanged
    }
  }

  fn mark_quality_updated(&self) {
    let mut last = self
      .last_quality_update
      .lock()
      .unwrap_or_else(|e| e.into_inner());
    *last = Some(Instant::now());
  }
}

/// Network timeout per category, scaled by quality.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
  scale: f64,
}

impl TimeoutPolicy {
  pub fn new(scale: f64) -> Self {
    Self { scale }
  }

  pub fn base(category: Category) -> Duration {
    match category {
      Category::AppShell | Category::StaticAsset => Duration::from_secs(3),
      Category::Image | Category::Font | Category::Analytics => Duration::from_secs(5),
      Category::Dynamic => Duration::from_secs(8),
      Category::Document => Duration::from_secs(10),
      Category::BinaryModule => Duration::from_secs(15),
      Category::AiRequest => Duration::from_secs(30),
    }
  }

  pub fn timeout(&self, category: Category, quality: QualityTier) -> Duration {
    Self::base(category).mul_f64(quality.timeout_factor() * self.scale)
  }
}

impl Default for TimeoutPolicy {
  fn default() -> Self {
    Self::new(1.0)
  }
}

/// Spawn a background latency probe.
///
/// Any HTTP response counts as reachable; transport failures and timeouts
/// count as offline. Transitions are published through the monitor.
pub fn spawn_probe_task(
  monitor: Arc<NetworkMonitor>,
  fetcher: Arc<dyn Fetcher>,
  probe_url: Url,
  probe_interval: Duration,
) -> tokio::task::JoinHandle<()> {
  tokio::spawn(async move {
    tracing::info!("Probe task started (interval: {:?})", probe_interval);
    let mut timer = interval(probe_interval);
    let request = Request::new("HEAD", probe_url);

    loop {
      timer.tick().await;

      let started = Instant::now();
      let outcome = tokio::time::timeout(Duration::from_secs(5), fetcher.fetch(&request)).await;
      let result = match outcome {
        Ok(Ok(_)) => Ok(started.elapsed()),
        Ok(Err(e)) => {
          tracing::debug!("Probe failed: {}", e);
          Err(())
        }
        Err(_) => {
          tracing::debug!("Probe timed out");
          Err(())
        }
      };
      monitor.record_probe(result);
    }
  })
}

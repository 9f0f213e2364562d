//! Named cache tiers and their retention policies.

use std::collections::BTreeMap;
use std::fmt;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::config::TierOverride;

const MIB: u64 = 1024 * 1024;
const HOUR: u64 = 60 * 60;
const DAY: u64 = 24 * HOUR;

/// Identity of a cache tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TierName {
  AppShell,
  Static,
  BinaryModules,
  AiResponses,
  Documents,
  Images,
  Fonts,
  /// Dynamic same-origin GETs that fit no other tier
  Runtime,
}

impl TierName {
  pub const ALL: [TierName; 8] = [
    TierName::AppShell,
    TierName::Static,
    TierName::BinaryModules,
    TierName::AiResponses,
    TierName::Documents,
    TierName::Images,
    TierName::Fonts,
    TierName::Runtime,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      TierName::AppShell => "app-shell",
      TierName::Static => "static",
      TierName::BinaryModules => "binary-modules",
      TierName::AiResponses => "ai-responses",
      TierName::Documents => "documents",
      TierName::Images => "images",
      TierName::Fonts => "fonts",
      TierName::Runtime => "runtime",
    }
  }

  pub fn parse(name: &str) -> Option<Self> {
    let name = name.trim().to_ascii_lowercase();
    Self::ALL.into_iter().find(|t| t.as_str() == name)
  }

  /// Built-in policy for this tier.
  pub fn default_policy(self) -> TierPolicy {
    let (max_age_secs, max_entries, quota_bytes, min_retention_secs) = match self {
      TierName::AppShell => (7 * DAY, 50, 5 * MIB, DAY),
      TierName::Static => (30 * DAY, 200, 20 * MIB, HOUR),
      TierName::BinaryModules => (30 * DAY, 10, 30 * MIB, DAY),
      TierName::AiResponses => (DAY, 100, 5 * MIB, 300),
      TierName::Documents => (7 * DAY, 500, 20 * MIB, HOUR),
      TierName::Images => (30 * DAY, 200, 15 * MIB, HOUR),
      TierName::Fonts => (365 * DAY, 30, 5 * MIB, DAY),
      TierName::Runtime => (DAY, 100, 5 * MIB, 300),
    };
    TierPolicy {
      max_age_secs,
      max_entries,
      quota_bytes,
      min_retention_secs,
    }
  }
}

impl fmt::Display for TierName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Expiration, size and retention limits of one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPolicy {
  /// Entries older than this are stale and removed by cleanup
  pub max_age_secs: u64,
  pub max_entries: usize,
  pub quota_bytes: u64,
  /// Entries younger than this survive ceiling and quota eviction
  pub min_retention_secs: u64,
}

impl TierPolicy {
  pub fn max_age(&self) -> Duration {
    Duration::seconds(self.max_age_secs as i64)
  }

  pub fn min_retention(&self) -> Duration {
    Duration::seconds(self.min_retention_secs as i64)
  }

  fn apply(mut self, over: &TierOverride) -> Self {
    if let Some(v) = over.max_age_secs {
      self.max_age_secs = v;
    }
    if let Some(v) = over.max_entries {
      self.max_entries = v;
    }
    if let Some(v) = over.quota_bytes {
      self.quota_bytes = v;
    }
    if let Some(v) = over.min_retention_secs {
      self.min_retention_secs = v;
    }
    self
  }
}

/// A configured tier bound to the active version's storage namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTier {
  pub name: TierName,
  pub namespace: String,
  pub policy: TierPolicy,
}

/// Every tier of one cache version.
#[derive(Debug, Clone)]
pub struct TierSet {
  version: String,
  tiers: BTreeMap<TierName, CacheTier>,
}

impl TierSet {
  pub fn new(version: &str, overrides: &BTreeMap<TierName, TierOverride>) -> Self {
    let tiers = TierName::ALL
      .into_iter()
      .map(|name| {
        let policy = match overrides.get(&name) {
          Some(over) => name.default_policy().apply(over),
          None => name.default_policy(),
        };
        let tier = CacheTier {
          name,
          namespace: format!("{}-{}", version, name),
          policy,
        };
        (name, tier)
      })
      .collect();

    Self {
      version: version.to_string(),
      tiers,
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn get(&self, name: TierName) -> &CacheTier {
    // Every TierName is inserted by `new`
    &self.tiers[&name]
  }

  pub fn iter(&self) -> impl Iterator<Item = &CacheTier> {
    self.tiers.values()
  }

  pub fn namespaces(&self) -> Vec<String> {
    self.tiers.values().map(|t| t.namespace.clone()).collect()
  }
}

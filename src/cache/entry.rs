//! Core types shared by the cache tiers and the strategy executor.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::request::Response;

/// A stored response. Entries are never mutated; a newer response replaces
/// the whole row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
  /// Canonical key hash
  pub key: String,
  pub url: String,
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub payload: Vec<u8>,
  pub stored_at: DateTime<Utc>,
}

impl CachedEntry {
  pub fn from_response(key: &str, url: &str, response: &Response) -> Self {
    Self {
      key: key.to_string(),
      url: url.to_string(),
      status: response.status,
      headers: response.headers.clone(),
      payload: response.body.clone(),
      stored_at: Utc::now(),
    }
  }

  /// Size counted against tier and total quotas.
  pub fn size(&self) -> u64 {
    let headers: usize = self.headers.iter().map(|(k, v)| k.len() + v.len()).sum();
    (self.payload.len() + headers + self.url.len()) as u64
  }

  pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
    now - self.stored_at
  }

  /// Rebuild a response from this entry with the given metadata.
  pub fn to_response(&self, meta: ResponseMeta) -> Response {
    Response {
      status: self.status,
      headers: self.headers.clone(),
      body: self.payload.clone(),
      meta,
    }
  }
}

/// Metadata about where a response came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseMeta {
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub stored_at: Option<DateTime<Utc>>,
  /// Served from cache although it failed integrity validation
  pub integrity_warning: bool,
  /// Network was unavailable while producing this response
  pub offline: bool,
  /// The request was deferred for later delivery
  pub queued: bool,
}

impl ResponseMeta {
  /// Fresh data from the network.
  pub fn from_network() -> Self {
    Self {
      source: CacheSource::Network,
      stored_at: None,
      integrity_warning: false,
      offline: false,
      queued: false,
    }
  }

  /// Data from a cache tier.
  pub fn from_cache(stored_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      stored_at: Some(stored_at),
      ..Self::from_network()
    }
  }

  /// Cached data served because the network was unavailable.
  pub fn offline(stored_at: DateTime<Utc>) -> Self {
    Self {
      source: CacheSource::Offline,
      stored_at: Some(stored_at),
      offline: true,
      ..Self::from_network()
    }
  }

  /// A response produced by this layer rather than by the origin.
  pub fn synthesized(offline: bool, queued: bool) -> Self {
    Self {
      source: CacheSource::Synthesized,
      offline,
      queued,
      ..Self::from_network()
    }
  }

  pub fn with_integrity_warning(mut self) -> Self {
    self.integrity_warning = true;
    self
  }
}

/// Indicates where response data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache past its expiration window
  CacheStale,
  /// Offline mode - network unavailable, serving cached data
  Offline,
  /// Built by the interception layer (failure or queued acknowledgement)
  Synthesized,
}

//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use super::entry::CachedEntry;
use crate::db::Database;

/// Entry count and byte usage of one namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierUsage {
  pub entries: u64,
  pub bytes: u64,
}

/// Identity, size and age of a stored entry, without its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStamp {
  pub namespace: String,
  pub key: String,
  pub size: u64,
  pub stored_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// A namespace holds the entries of one tier for one cache version.
pub trait TierStorage: Send + Sync {
  /// Get a single entry by key.
  fn get(&self, namespace: &str, key: &str) -> Result<Option<CachedEntry>>;

  /// Store an entry, replacing any previous entry with the same key.
  fn put(&self, namespace: &str, entry: &CachedEntry) -> Result<()>;

  /// Remove one entry. Returns whether it existed.
  fn remove(&self, namespace: &str, key: &str) -> Result<bool>;

  /// Remove every entry of a namespace.
  fn clear(&self, namespace: &str) -> Result<usize>;

  fn usage(&self, namespace: &str) -> Result<TierUsage>;

  /// Stamps of a namespace ordered oldest first.
  fn stamps(&self, namespace: &str) -> Result<Vec<EntryStamp>>;

  /// Remove entries stored before the cutoff.
  fn remove_older_than(&self, namespace: &str, cutoff: DateTime<Utc>) -> Result<usize>;

  /// Every namespace that currently holds entries.
  fn namespaces(&self) -> Result<Vec<String>>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  db: Database,
}

impl SqliteStorage {
  pub fn new(db: Database) -> Self {
    Self { db }
  }
}

impl TierStorage for SqliteStorage {
  fn get(&self, namespace: &str, key: &str) -> Result<Option<CachedEntry>> {
    let conn = self.db.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT url, status, headers, payload, stored_at FROM cache_entries
         WHERE namespace = ? AND key = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(String, u16, String, Vec<u8>, i64)> = stmt
      .query_row(params![namespace, key], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
      })
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    match row {
      Some((url, status, headers, payload, stored_at)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers of {}: {}", url, e))?;
        Ok(Some(CachedEntry {
          key: key.to_string(),
          url,
          status,
          headers,
          payload,
          stored_at: from_millis(stored_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, namespace: &str, entry: &CachedEntry) -> Result<()> {
    let conn = self.db.lock()?;
    let headers = serde_json::to_string(&entry.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries
           (namespace, key, url, status, headers, payload, size, stored_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
          namespace,
          entry.key,
          entry.url,
          entry.status,
          headers,
          entry.payload,
          entry.size() as i64,
          entry.stored_at.timestamp_millis()
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    Ok(())
  }

  fn remove(&self, namespace: &str, key: &str) -> Result<bool> {
    let conn = self.db.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE namespace = ? AND key = ?",
        params![namespace, key],
      )
      .map_err(|e| eyre!("Failed to remove cache entry: {}", e))?;
    Ok(removed > 0)
  }

  fn clear(&self, namespace: &str) -> Result<usize> {
    let conn = self.db.lock()?;
    conn
      .execute(
        "DELETE FROM cache_entries WHERE namespace = ?",
        params![namespace],
      )
      .map_err(|e| eyre!("Failed to clear namespace {}: {}", namespace, e))
  }

  fn usage(&self, namespace: &str) -> Result<TierUsage> {
    let conn = self.db.lock()?;
    let (entries, bytes): (i64, i64) = conn
      .query_row(
        "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM cache_entries WHERE namespace = ?",
        params![namespace],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .map_err(|e| eyre!("Failed to measure namespace {}: {}", namespace, e))?;

    Ok(TierUsage {
      entries: entries as u64,
      bytes: bytes as u64,
    })
  }

  fn stamps(&self, namespace: &str) -> Result<Vec<EntryStamp>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT key, size, stored_at FROM cache_entries
         WHERE namespace = ?
         ORDER BY stored_at, key",
      )
      .map_err(|e| eyre!("Failed to prepare stamp query: {}", e))?;

    let rows: Vec<(String, i64, i64)> = stmt
      .query_map(params![namespace], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
      })
      .map_err(|e| eyre!("Failed to query stamps: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    rows
      .into_iter()
      .map(|(key, size, stored_at)| {
        Ok(EntryStamp {
          namespace: namespace.to_string(),
          key,
          size: size as u64,
          stored_at: from_millis(stored_at)?,
        })
      })
      .collect()
  }

  fn remove_older_than(&self, namespace: &str, cutoff: DateTime<Utc>) -> Result<usize> {
    let conn = self.db.lock()?;
    conn
      .execute(
        "DELETE FROM cache_entries WHERE namespace = ? AND stored_at < ?",
        params![namespace, cutoff.timestamp_millis()],
      )
      .map_err(|e| eyre!("Failed to expire entries of {}: {}", namespace, e))
  }

  fn namespaces(&self) -> Result<Vec<String>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare("SELECT DISTINCT namespace FROM cache_entries ORDER BY namespace")
      .map_err(|e| eyre!("Failed to prepare namespace query: {}", e))?;

    let namespaces = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list namespaces: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(namespaces)
  }
}

/// Convert a stored millisecond timestamp.
fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
  DateTime::from_timestamp_millis(ms).ok_or_else(|| eyre!("Invalid stored timestamp {}", ms))
}

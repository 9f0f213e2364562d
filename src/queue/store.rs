//! Durable storage for deferred requests, one table per queue.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;

use super::{ItemState, QueueItem, QueueName};
use crate::db::Database;
use crate::request::Request;

pub struct QueueStore {
  db: Database,
}

impl QueueStore {
  pub fn new(db: Database) -> Self {
    Self { db }
  }

  /// Persist a new pending item and return it.
  pub fn insert(&self, queue: QueueName, request: &Request, enqueued_at: DateTime<Utc>) -> Result<QueueItem> {
    let serialized =
      serde_json::to_string(request).map_err(|e| eyre!("Failed to serialize request: {}", e))?;

    let conn = self.db.lock()?;
    conn
      .execute(
        &format!(
          "INSERT INTO {} (request, size, enqueued_at, retry_count, state) VALUES (?, ?, ?, 0, ?)",
          queue.table()
        ),
        params![
          serialized,
          serialized.len() as i64,
          enqueued_at.timestamp_millis(),
          ItemState::Pending.as_str()
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue into {}: {}", queue, e))?;

    Ok(QueueItem {
      id: conn.last_insert_rowid(),
      queue,
      request: serialized,
      enqueued_at,
      retry_count: 0,
      state: ItemState::Pending,
    })
  }

  /// Pending items in enqueue order.
  pub fn pending(&self, queue: QueueName) -> Result<Vec<QueueItem>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare(&format!(
        "SELECT id, request, enqueued_at, retry_count FROM {} WHERE state = ? ORDER BY id",
        queue.table()
      ))
      .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

    let items = stmt
      .query_map(params![ItemState::Pending.as_str()], |row| {
        let id: i64 = row.get(0)?;
        let fields = (
          row.get::<_, String>(1),
          row.get::<_, i64>(2),
          row.get::<_, u32>(3),
        );
        Ok(match fields {
          (Ok(request), Ok(enqueued_at), Ok(retry_count)) => QueueItem {
            id,
            queue,
            request,
            // Unreadable timestamps age out on the next drain
            enqueued_at: DateTime::from_timestamp_millis(enqueued_at).unwrap_or_default(),
            retry_count,
            state: ItemState::Pending,
          },
          _ => {
            tracing::warn!("Undecodable row {} in {}", id, queue);
            // An empty request fails to parse, so the drain drops it as malformed
            QueueItem {
              id,
              queue,
              request: String::new(),
              enqueued_at: Utc::now(),
              retry_count: 0,
              state: ItemState::Pending,
            }
          }
        })
      })
      .map_err(|e| eyre!("Failed to read queue {}: {}", queue, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read queue {}: {}", queue, e))?;

    Ok(items)
  }

  pub fn set_state(&self, queue: QueueName, id: i64, state: ItemState) -> Result<()> {
    let conn = self.db.lock()?;
    conn
      .execute(
        &format!("UPDATE {} SET state = ? WHERE id = ?", queue.table()),
        params![state.as_str(), id],
      )
      .map_err(|e| eyre!("Failed to update item {} in {}: {}", id, queue, e))?;
    Ok(())
  }

  /// Record a failed attempt and return the item to pending.
  pub fn mark_retry(&self, queue: QueueName, id: i64) -> Result<()> {
    let conn = self.db.lock()?;
    conn
      .execute(
        &format!(
          "UPDATE {} SET retry_count = retry_count + 1, state = ? WHERE id = ?",
          queue.table()
        ),
        params![ItemState::Pending.as_str(), id],
      )
      .map_err(|e| eyre!("Failed to schedule retry of {} in {}: {}", id, queue, e))?;
    Ok(())
  }

  pub fn remove(&self, queue: QueueName, id: i64) -> Result<()> {
    let conn = self.db.lock()?;
    conn
      .execute(
        &format!("DELETE FROM {} WHERE id = ?", queue.table()),
        params![id],
      )
      .map_err(|e| eyre!("Failed to remove item {} from {}: {}", id, queue, e))?;
    Ok(())
  }

  /// Return items stuck in `attempting` (after a crash) to pending.
  pub fn reset_attempting(&self, queue: QueueName) -> Result<usize> {
    let conn = self.db.lock()?;
    conn
      .execute(
        &format!("UPDATE {} SET state = ? WHERE state = ?", queue.table()),
        params![ItemState::Pending.as_str(), ItemState::Attempting.as_str()],
      )
      .map_err(|e| eyre!("Failed to reset queue {}: {}", queue, e))
  }

  /// Item count and serialized bytes held by a queue.
  pub fn usage(&self, queue: QueueName) -> Result<(u64, u64)> {
    let conn = self.db.lock()?;
    let (count, bytes): (i64, i64) = conn
      .query_row(
        &format!("SELECT COUNT(*), COALESCE(SUM(size), 0) FROM {}", queue.table()),
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .map_err(|e| eyre!("Failed to measure queue {}: {}", queue, e))?;
    Ok((count as u64, bytes as u64))
  }

  #[cfg(test)]
  pub(crate) fn insert_raw(
    &self,
    queue: QueueName,
    request: &str,
    enqueued_at: DateTime<Utc>,
    retry_count: u32,
  ) -> Result<i64> {
    let conn = self.db.lock()?;
    conn
      .execute(
        &format!(
          "INSERT INTO {} (request, size, enqueued_at, retry_count, state) VALUES (?, ?, ?, ?, 'pending')",
          queue.table()
        ),
        params![request, request.len() as i64, enqueued_at.timestamp_millis(), retry_count],
      )
      .map_err(|e| eyre!("Failed to insert raw item: {}", e))?;
    Ok(conn.last_insert_rowid())
  }
}

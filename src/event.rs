use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};

use crate::control::Broadcast;
use crate::network::NetworkState;

/// Application events
#[derive(Debug)]
pub enum Event {
  /// One line of control input
  Line(String),
  /// Control input reached end of file
  InputClosed,
  /// Observed network state changed
  Network(NetworkState),
  /// Periodic opportunity to drain queued requests
  SyncTick,
  /// Event to forward to clients
  Broadcast(Broadcast),
}

/// Event handler that merges control input, network changes, broadcasts and
/// a sync timer into one stream
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler with the given sync interval
  pub fn new(sync_interval: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    let ticks = tx.clone();
    tokio::spawn(async move {
      let mut timer = interval(sync_interval);
      timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
      // The first tick completes immediately
      timer.tick().await;
      loop {
        timer.tick().await;
        if ticks.send(Event::SyncTick).is_err() {
          break;
        }
      }
    });

    Self { tx, rx }
  }

  /// Read control lines until end of input
  pub fn read_lines<R>(&self, reader: R)
  where
    R: AsyncRead + Unpin + Send + 'static,
  {
    let tx = self.tx.clone();
    tokio::spawn(async move {
      let mut lines = BufReader::new(reader).lines();
      loop {
        match lines.next_line().await {
          Ok(Some(line)) => {
            if line.trim().is_empty() {
              continue;
            }
            if tx.send(Event::Line(line)).is_err() {
              break;
            }
          }
          Ok(None) => {
            let _ = tx.send(Event::InputClosed);
            break;
          }
          Err(e) => {
            tracing::error!("Failed to read control input: {}", e);
            let _ = tx.send(Event::InputClosed);
            break;
          }
        }
      }
    });
  }

  /// Forward every network state change
  pub fn watch_network(&self, mut rx: watch::Receiver<NetworkState>) {
    let tx = self.tx.clone();
    tokio::spawn(async move {
      while rx.changed().await.is_ok() {
        let state = *rx.borrow_and_update();
        if tx.send(Event::Network(state)).is_err() {
          break;
        }
      }
    });
  }

  /// Forward broadcasts published by the interceptor
  pub fn forward_broadcasts(&self, mut rx: broadcast::Receiver<Broadcast>) {
    let tx = self.tx.clone();
    tokio::spawn(async move {
      loop {
        match rx.recv().await {
          Ok(message) => {
            if tx.send(Event::Broadcast(message)).is_err() {
              break;
            }
          }
          Err(broadcast::error::RecvError::Lagged(missed)) => {
            tracing::warn!("Dropped {} broadcasts", missed);
          }
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    });
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_reads_lines_then_closes() {
    let mut events = EventHandler::new(Duration::from_secs(3600));
    events.read_lines(&b"{\"type\":\"get-status\"}\n\n{\"type\":\"get-metrics\"}\n"[..]);

    assert!(matches!(events.next().await, Some(Event::Line(l)) if l.contains("get-status")));
    assert!(matches!(events.next().await, Some(Event::Line(l)) if l.contains("get-metrics")));
    assert!(matches!(events.next().await, Some(Event::InputClosed)));
  }

  #[tokio::test]
  async fn test_forwards_network_changes() {
    let (state_tx, state_rx) = watch::channel(NetworkState::default());
    let mut events = EventHandler::new(Duration::from_secs(3600));
    events.watch_network(state_rx);

    state_tx.send_modify(|s| s.is_online = false);
    match events.next().await {
      Some(Event::Network(state)) => assert!(!state.is_online),
      other => panic!("unexpected {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_sync_ticks() {
    let mut events = EventHandler::new(Duration::from_millis(10));
    assert!(matches!(events.next().await, Some(Event::SyncTick)));
  }
}

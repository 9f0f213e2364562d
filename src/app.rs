use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::control::{Envelope, Reply};
use crate::event::{Event, EventHandler};
use crate::interceptor::Interceptor;
use crate::network::{NetworkState, Transition};

/// Main application state for `serve` mode
pub struct App<W> {
  interceptor: Interceptor,

  /// Replies and broadcasts, one JSON document per line
  out: W,

  /// Last network state seen by the loop
  network: NetworkState,

  /// Whether to quit
  should_quit: bool,
}

impl<W: AsyncWrite + Unpin> App<W> {
  pub fn new(interceptor: Interceptor, out: W) -> Self {
    let network = interceptor.monitor().state();
    Self {
      interceptor,
      out,
      network,
      should_quit: false,
    }
  }

  pub fn interceptor(&self) -> &Interceptor {
    &self.interceptor
  }

  /// Process events one at a time until control input closes.
  pub async fn run(&mut self, events: &mut EventHandler) -> Result<()> {
    while !self.should_quit {
      match events.next().await {
        Some(event) => self.handle_event(event).await?,
        None => break,
      }
    }
    tracing::info!("Control input closed, shutting down");
    Ok(())
  }

  async fn handle_event(&mut self, event: Event) -> Result<()> {
    match event {
      Event::Line(line) => self.handle_line(&line).await?,
      Event::InputClosed => self.should_quit = true,
      Event::Network(state) => {
        let transition = Transition::between(&self.network, &state);
        self.network = state;
        self.interceptor.on_transition(transition).await;
      }
      Event::SyncTick => {
        if let Err(e) = self.interceptor.sync_tick().await {
          tracing::error!("Sync tick failed: {}", e);
        }
      }
      Event::Broadcast(message) => self.write_json(&message).await?,
    }
    Ok(())
  }

  async fn handle_line(&mut self, line: &str) -> Result<()> {
    let reply = match Envelope::parse(line) {
      Ok(envelope) => {
        tracing::debug!("Control command: {:?}", envelope.command);
        match self.interceptor.command(envelope.command).await {
          Ok(result) => Reply::ok(envelope.id, result),
          Err(e) => Reply::error(envelope.id, e.to_string()),
        }
      }
      Err(e) => Reply::error(None, format!("invalid command: {}", e)),
    };
    self.write_json(&reply).await
  }

  async fn write_json<T: Serialize>(&mut self, value: &T) -> Result<()> {
    let mut line =
      serde_json::to_vec(value).map_err(|e| eyre!("Failed to serialize output: {}", e))?;
    line.push(b'\n');
    self
      .out
      .write_all(&line)
      .await
      .map_err(|e| eyre!("Failed to write output: {}", e))?;
    self
      .out
      .flush()
      .await
      .map_err(|e| eyre!("Failed to flush output: {}", e))
  }
}

//! Network access abstraction.
//!
//! The strategies and the deferred queue reach the network only through the
//! [`Fetcher`] trait, so tests can count and script every outbound call.

pub mod mock;

pub use mock::MockFetcher;

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use thiserror::Error;

use crate::request::{Request, Response};

/// Network failures. `Clone` so one in-flight fetch can be shared by every
/// waiter on the same key.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
  /// The fetch did not complete within its deadline.
  #[error("request timed out after {0:?}")]
  Timeout(Duration),

  /// The connection could not be established or was dropped.
  #[error("connection failed: {0}")]
  Connection(String),

  /// Known to be offline; no attempt was made.
  #[error("network unavailable")]
  Offline,

  /// Connectivity was lost while the fetch was in flight.
  #[error("connectivity lost during request")]
  Interrupted,

  /// A binary module failed validation and was discarded.
  #[error("integrity check failed for {0}")]
  Integrity(String),

  /// The request could not be built or the body could not be read.
  #[error("invalid request: {0}")]
  Invalid(String),
}

impl FetchError {
  /// True when the failure means no network path exists right now.
  pub fn is_unreachable(&self) -> bool {
    matches!(
      self,
      FetchError::Timeout(_) | FetchError::Connection(_) | FetchError::Offline | FetchError::Interrupted
    )
  }
}

/// Performs outbound requests.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// Fetcher backed by a shared reqwest client.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("offgrid/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| FetchError::Invalid(e.to_string()))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let resp = builder.send().await.map_err(|e| {
      if e.is_timeout() {
        FetchError::Timeout(Duration::ZERO)
      } else if e.is_builder() {
        FetchError::Invalid(e.to_string())
      } else {
        FetchError::Connection(e.to_string())
      }
    })?;

    let status = resp.status().as_u16();
    let headers = resp
      .headers()
      .iter()
      .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
      .collect();
    let body = resp
      .bytes()
      .await
      .map_err(|e| FetchError::Connection(e.to_string()))?;

    let mut response = Response::new(status, body.to_vec());
    response.headers = headers;
    Ok(response)
  }
}

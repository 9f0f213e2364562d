//! Mock fetcher for testing.
//!
//! Serves scripted responses per URL and records every request it receives.

use super::{FetchError, Fetcher};
use crate::request::{Request, Response};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Mock fetcher for testing.
///
/// Responses are looked up by full URL; a queued one-shot outcome takes
/// precedence over the standing route. Unknown URLs fail with a connection
/// error, as does every call while the mock is set offline.
#[derive(Debug, Default, Clone)]
pub struct MockFetcher {
  inner: Arc<Mutex<MockFetcherInner>>,
}

#[derive(Debug, Default)]
struct MockFetcherInner {
  routes: HashMap<String, Response>,
  queued: HashMap<String, VecDeque<Result<Response, FetchError>>>,
  requests: Vec<Request>,
  delay: Option<Duration>,
  offline: bool,
}

impl MockFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  /// Always answer `url` with the given status and body.
  pub fn route(&self, url: &str, status: u16, body: impl Into<Vec<u8>>) {
    let mut inner = self.inner.lock().unwrap();
    inner.routes.insert(url.to_string(), Response::new(status, body));
  }

  /// Answer the next call to `url` with the given outcome.
  pub fn queue(&self, url: &str, outcome: Result<Response, FetchError>) {
    let mut inner = self.inner.lock().unwrap();
    inner.queued.entry(url.to_string()).or_default().push_back(outcome);
  }

  /// Delay every response, simulating a slow network.
  pub fn set_delay(&self, delay: Duration) {
    self.inner.lock().unwrap().delay = Some(delay);
  }

  /// Fail every call with a connection error.
  pub fn set_offline(&self, offline: bool) {
    self.inner.lock().unwrap().offline = offline;
  }

  /// Every request received so far.
  pub fn requests(&self) -> Vec<Request> {
    self.inner.lock().unwrap().requests.clone()
  }

  pub fn call_count(&self) -> usize {
    self.inner.lock().unwrap().requests.len()
  }

  /// Number of calls made for one URL.
  pub fn calls_to(&self, url: &str) -> usize {
    let inner = self.inner.lock().unwrap();
    inner
      .requests
      .iter()
      .filter(|r| r.url.as_str() == url)
      .count()
  }
}

#[async_trait]
impl Fetcher for MockFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let (outcome, delay) = {
      let mut inner = self.inner.lock().unwrap();
      inner.requests.push(request.clone());

      let url = request.url.as_str();
      let outcome = if inner.offline {
        Err(FetchError::Connection("mock offline".to_string()))
      } else if let Some(next) = inner.queued.get_mut(url).and_then(VecDeque::pop_front) {
        next
      } else if let Some(resp) = inner.routes.get(url) {
        Ok(resp.clone())
      } else {
        Err(FetchError::Connection(format!("no route for {}", url)))
      };
      (outcome, inner.delay)
    };

    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }
    outcome
  }
}

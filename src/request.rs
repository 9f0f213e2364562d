//! Request and response values that flow through the interception layer.

use std::collections::BTreeMap;

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::cache::ResponseMeta;

/// An intercepted outbound request.
///
/// This is also the serialized form persisted by the deferred delivery queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
  pub method: String,
  pub url: Url,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  #[serde(default, with = "hex_body")]
  pub body: Option<Vec<u8>>,
}

impl Request {
  /// Build a request, normalizing the method to upper case.
  pub fn new(method: &str, url: Url) -> Self {
    Self {
      method: method.to_ascii_uppercase(),
      url,
      headers: BTreeMap::new(),
      body: None,
    }
  }

  /// Shorthand for a GET request.
  pub fn get(url: Url) -> Self {
    Self::new("GET", url)
  }

  /// Parse a URL and build a request for it.
  pub fn parse(method: &str, url: &str) -> Result<Self> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid request URL '{}': {}", url, e))?;
    Ok(Self::new(method, url))
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn is_get(&self) -> bool {
    self.method.eq_ignore_ascii_case("GET")
  }

  /// True when scheme, host and port match the given origin.
  pub fn is_same_origin(&self, origin: &Url) -> bool {
    self.url.origin() == origin.origin()
  }
}

/// A response returned to the application, either from the network, from a
/// cache tier, or synthesized by this layer.
#[derive(Debug, Clone)]
pub struct Response {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
  pub meta: ResponseMeta,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: body.into(),
      meta: ResponseMeta::from_network(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn with_meta(mut self, meta: ResponseMeta) -> Self {
    self.meta = meta;
    self
  }

  /// Build a synthesized JSON response carrying the offline/queued flags.
  pub fn json(status: u16, value: &serde_json::Value, meta: ResponseMeta) -> Self {
    let body = serde_json::to_vec(value).unwrap_or_default();
    Self {
      status,
      headers: BTreeMap::from([("content-type".to_string(), "application/json".to_string())]),
      body,
      meta,
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
  }

  pub fn body_text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// Hex encoding for request bodies so arbitrary bytes survive JSON.
mod hex_body {
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(body: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
    match body {
      Some(bytes) => s.serialize_some(&hex::encode(bytes)),
      None => s.serialize_none(),
    }
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
    let encoded: Option<String> = Option::deserialize(d)?;
    encoded
      .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
      .transpose()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_method_is_normalized() {
    let req = Request::parse("post", "https://app.test/api/ai/complete").unwrap();
    assert_eq!(req.method, "POST");
    assert!(!req.is_get());
  }

  #[test]
  fn test_same_origin() {
    let origin = Url::parse("https://app.test").unwrap();
    let local = Request::parse("GET", "https://app.test/api/documents/1").unwrap();
    let remote = Request::parse("GET", "https://cdn.test/app.css").unwrap();
    let other_port = Request::parse("GET", "https://app.test:8443/").unwrap();

    assert!(local.is_same_origin(&origin));
    assert!(!remote.is_same_origin(&origin));
    assert!(!other_port.is_same_origin(&origin));
  }

  #[test]
  fn test_serialized_request_keeps_binary_body() {
    let req = Request::parse("PUT", "https://app.test/api/documents/7")
      .unwrap()
      .with_header("Content-Type", "application/octet-stream")
      .with_body(vec![0u8, 159, 146, 150]);

    let json = serde_json::to_string(&req).unwrap();
    assert!(json.contains("009f9296"));

    let back: Request = serde_json::from_str(&json).unwrap();
    assert_eq!(back, req);
  }
}

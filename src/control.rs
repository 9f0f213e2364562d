//! Client control protocol.
//!
//! Clients send one JSON command per line and receive one reply per command.
//! Broadcasts are pushed to every subscriber independently of replies.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::TierName;
use crate::network::QualityTier;
use crate::queue::{DrainReport, QueueName};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Command {
  GetStatus,
  ClearCache {
    #[serde(default)]
    tier: Option<TierName>,
  },
  ForceSync {
    #[serde(default)]
    queue: Option<QueueName>,
  },
  Preload {
    urls: Vec<String>,
  },
  GetMetrics,
  OptimizeStorage,
  /// Submit a request through the interception layer
  Fetch {
    #[serde(default = "default_method")]
    method: String,
    url: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<String>,
  },
  /// Connectivity signal from the host
  Network {
    #[serde(default)]
    online: Option<bool>,
    #[serde(default)]
    effective_type: Option<String>,
  },
}

fn default_method() -> String {
  "GET".to_string()
}

impl Command {
  /// Whether repeating the command has no further effect.
  pub fn is_idempotent(&self) -> bool {
    !matches!(self, Command::ClearCache { .. })
  }
}

/// A command plus the client's correlation id, echoed in the reply.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Envelope {
  #[serde(default)]
  pub id: Option<Value>,
  #[serde(flatten)]
  pub command: Command,
}

impl Envelope {
  pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(line)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub id: Option<Value>,
  #[serde(flatten)]
  pub body: ReplyBody,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyBody {
  Result(Value),
  Error(String),
}

impl Reply {
  pub fn ok(id: Option<Value>, result: Value) -> Self {
    Self {
      id,
      body: ReplyBody::Result(result),
    }
  }

  pub fn error(id: Option<Value>, message: impl Into<String>) -> Self {
    Self {
      id,
      body: ReplyBody::Error(message.into()),
    }
  }
}

/// Events pushed to every subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Broadcast {
  StatusChanged {
    online: bool,
    quality: QualityTier,
  },
  SyncComplete {
    successful: usize,
    failed: usize,
    dropped: usize,
  },
  StorageWarning {
    used_bytes: u64,
    quota_bytes: u64,
    ratio: f64,
  },
}

impl Broadcast {
  /// Summarize a set of drains.
  pub fn sync_complete(reports: &[DrainReport]) -> Self {
    Broadcast::SyncComplete {
      successful: reports.iter().map(|r| r.succeeded).sum(),
      failed: reports.iter().map(DrainReport::failed).sum(),
      dropped: reports.iter().map(|r| r.dropped.len()).sum(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_parse_commands() {
    let env = Envelope::parse(r#"{"type":"get-status","id":7}"#).unwrap();
    assert_eq!(env.command, Command::GetStatus);
    assert_eq!(env.id, Some(json!(7)));

    let env = Envelope::parse(r#"{"type":"clear-cache","tier":"images"}"#).unwrap();
    assert_eq!(
      env.command,
      Command::ClearCache {
        tier: Some(TierName::Images)
      }
    );
    assert_eq!(env.id, None);

    let env = Envelope::parse(r#"{"type":"force-sync"}"#).unwrap();
    assert_eq!(env.command, Command::ForceSync { queue: None });

    let env = Envelope::parse(r#"{"type":"fetch","url":"/api/documents/1"}"#).unwrap();
    match env.command {
      Command::Fetch { method, url, .. } => {
        assert_eq!(method, "GET");
        assert_eq!(url, "/api/documents/1");
      }
      other => panic!("unexpected {:?}", other),
    }
  }

  #[test]
  fn test_rejects_unknown_commands() {
    assert!(Envelope::parse(r#"{"type":"self-destruct"}"#).is_err());
    assert!(Envelope::parse(r#"{"type":"clear-cache","tier":"bogus"}"#).is_err());
    assert!(Envelope::parse("not json").is_err());
  }

  #[test]
  fn test_idempotence() {
    assert!(Command::GetStatus.is_idempotent());
    assert!(Command::OptimizeStorage.is_idempotent());
    assert!(!Command::ClearCache { tier: None }.is_idempotent());
  }

  #[test]
  fn test_reply_shape() {
    let ok = serde_json::to_value(Reply::ok(Some(json!("a")), json!({"n": 1}))).unwrap();
    assert_eq!(ok, json!({"id": "a", "result": {"n": 1}}));

    let err = serde_json::to_value(Reply::error(None, "bad")).unwrap();
    assert_eq!(err, json!({"error": "bad"}));
  }

  #[test]
  fn test_broadcast_shape() {
    let value = serde_json::to_value(Broadcast::StatusChanged {
      online: false,
      quality: QualityTier::Offline,
    })
    .unwrap();
    assert_eq!(
      value,
      json!({"type": "STATUS_CHANGED", "online": false, "quality": "offline"})
    );

    let value = serde_json::to_value(Broadcast::sync_complete(&[])).unwrap();
    assert_eq!(value["type"], "SYNC_COMPLETE");
    assert_eq!(value["successful"], 0);
  }
}

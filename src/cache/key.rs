//! Canonical cache keys for requests.

use sha2::{Digest, Sha256};
use url::Url;

use crate::classify::Category;

/// Canonical identity of a cached response.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
  hash: String,
  description: String,
}

impl CacheKey {
  /// Build the key for a URL of the given category.
  ///
  /// The method never takes part in the key. Fragments are dropped and query
  /// pairs sorted; AI requests keep only the allow-listed parameters so that
  /// cosmetic or per-call parameters do not fragment the cache.
  pub fn for_url(url: &Url, category: Category, ai_params: &[String]) -> Self {
    let mut pairs: Vec<(String, String)> = url
      .query_pairs()
      .map(|(k, v)| {
        let k = if category == Category::AiRequest {
          k.to_lowercase()
        } else {
          k.into_owned()
        };
        (k, v.into_owned())
      })
      .filter(|(k, _)| category != Category::AiRequest || ai_params.contains(k))
      .collect();
    pairs.sort();

    let mut description = format!(
      "{}://{}{}",
      url.scheme(),
      url.host_str().unwrap_or_default(),
      url.port().map(|p| format!(":{}", p)).unwrap_or_default()
    );
    description.push_str(url.path());
    if !pairs.is_empty() {
      let query: Vec<String> = pairs.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
      description.push('?');
      description.push_str(&query.join("&"));
    }

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(description.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Self { hash, description }
  }

  pub fn as_str(&self) -> &str {
    &self.hash
  }

  /// Normalized URL the hash was computed from.
  pub fn description(&self) -> &str {
    &self.description
  }
}

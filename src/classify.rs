//! Request classification.
//!
//! Every request maps to exactly one [`Category`] through an ordered rule
//! table; the first matching rule wins. The category then determines the
//! caching strategy, the cache tier and, for writes, the deferred queue.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::cache::TierName;
use crate::queue::QueueName;
use crate::request::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
  AppShell,
  StaticAsset,
  BinaryModule,
  AiRequest,
  Document,
  Image,
  Font,
  Analytics,
  Dynamic,
}

impl Category {
  /// Tier that stores GET responses of this category.
  pub fn tier(self) -> Option<TierName> {
    match self {
      Category::AppShell => Some(TierName::AppShell),
      Category::StaticAsset => Some(TierName::Static),
      Category::BinaryModule => Some(TierName::BinaryModules),
      Category::AiRequest => Some(TierName::AiResponses),
      Category::Document => Some(TierName::Documents),
      Category::Image => Some(TierName::Images),
      Category::Font => Some(TierName::Fonts),
      Category::Analytics => None,
      Category::Dynamic => Some(TierName::Runtime),
    }
  }

  /// Queue that holds deferred writes of this category.
  pub fn queue(self) -> QueueName {
    match self {
      Category::AiRequest => QueueName::AiRequests,
      Category::Document => QueueName::Documents,
      Category::Analytics => QueueName::Analytics,
      _ => QueueName::General,
    }
  }

  fn get_strategy(self) -> Strategy {
    match self {
      Category::AppShell => Strategy::StaleWhileRevalidate,
      Category::StaticAsset | Category::BinaryModule | Category::Image | Category::Font => {
        Strategy::CacheFirst
      }
      Category::AiRequest | Category::Document | Category::Dynamic => Strategy::NetworkFirst,
      Category::Analytics => Strategy::NetworkOnly,
    }
  }

  fn always_sync_eligible(self) -> bool {
    matches!(
      self,
      Category::AiRequest | Category::Document | Category::Analytics
    )
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
  NetworkOnly,
}

/// Outcome of classifying one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
  pub category: Category,
  pub strategy: Strategy,
  /// Non-idempotent request that is deferred rather than lost when it fails
  pub sync_eligible: bool,
}

impl Classification {
  /// Tier used by the strategy, if it touches one.
  pub fn tier(&self) -> Option<TierName> {
    match self.strategy {
      Strategy::NetworkOnly => None,
      _ => self.category.tier(),
    }
  }
}

/// How a rule inspects the request URL.
#[derive(Debug, Clone)]
enum Matcher {
  ExactPath(&'static [&'static str]),
  PathPrefix(&'static [&'static str]),
  PathContains(&'static [&'static str]),
  Extension(&'static [&'static str]),
  Host(&'static [&'static str]),
  /// File name contains the configured binary module token
  ModuleToken,
}

impl Matcher {
  fn matches(&self, url: &Url, module_token: &str) -> bool {
    let path = url.path();
    match self {
      Matcher::ExactPath(paths) => paths.contains(&path),
      Matcher::PathPrefix(prefixes) => prefixes.iter().any(|p| path.starts_with(p)),
      Matcher::PathContains(parts) => parts.iter().any(|p| path.contains(p)),
      Matcher::Extension(exts) => extension(path).is_some_and(|e| exts.contains(&e.as_str())),
      Matcher::Host(hosts) => url.host_str().is_some_and(|h| hosts.contains(&h)),
      Matcher::ModuleToken => {
        !module_token.is_empty() && file_name(path).is_some_and(|f| f.contains(module_token))
      }
    }
  }
}

/// Ordered classification rules; first match wins.
const RULES: &[(Matcher, Category)] = &[
  (
    Matcher::ExactPath(&["/", "/index.html", "/offline.html", "/manifest.json"]),
    Category::AppShell,
  ),
  (Matcher::PathContains(&["/wasm/"]), Category::BinaryModule),
  (Matcher::ModuleToken, Category::BinaryModule),
  (Matcher::PathPrefix(&["/api/ai/"]), Category::AiRequest),
  (Matcher::PathContains(&["completion", "chat"]), Category::AiRequest),
  (
    Matcher::PathPrefix(&["/api/documents", "/api/projects"]),
    Category::Document,
  ),
  (Matcher::PathPrefix(&["/api/analytics"]), Category::Analytics),
  (Matcher::PathContains(&["/analytics/"]), Category::Analytics),
  (
    Matcher::PathPrefix(&["/styles/", "/scripts/", "/icons/"]),
    Category::StaticAsset,
  ),
  (
    Matcher::Host(&["fonts.googleapis.com", "fonts.gstatic.com"]),
    Category::Font,
  ),
  (
    Matcher::Extension(&["woff", "woff2", "ttf", "otf", "eot"]),
    Category::Font,
  ),
  (
    Matcher::Extension(&["png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "avif"]),
    Category::Image,
  ),
  (
    Matcher::Extension(&["css", "js", "mjs", "map", "webmanifest"]),
    Category::StaticAsset,
  ),
];

/// Pure request classifier.
#[derive(Debug, Clone)]
pub struct Classifier {
  origin: Url,
  module_token: String,
}

impl Classifier {
  pub fn new(origin: Url, module_token: &str) -> Self {
    Self {
      origin,
      module_token: module_token.to_string(),
    }
  }

  pub fn category(&self, url: &Url) -> Category {
    RULES
      .iter()
      .find(|(matcher, _)| matcher.matches(url, &self.module_token))
      .map(|(_, category)| *category)
      .unwrap_or(Category::Dynamic)
  }

  pub fn classify(&self, request: &Request) -> Classification {
    let category = self.category(&request.url);

    if request.is_get() {
      // Only same-origin dynamic responses belong in the runtime tier
      let strategy = if category == Category::Dynamic && !request.is_same_origin(&self.origin) {
        Strategy::NetworkOnly
      } else {
        category.get_strategy()
      };
      return Classification {
        category,
        strategy,
        sync_eligible: false,
      };
    }

    Classification {
      category,
      strategy: Strategy::NetworkOnly,
      sync_eligible: category.always_sync_eligible() || request.is_same_origin(&self.origin),
    }
  }
}

fn file_name(path: &str) -> Option<&str> {
  path.rsplit('/').next().filter(|f| !f.is_empty())
}

fn extension(path: &str) -> Option<String> {
  let name = file_name(path)?;
  let (_, ext) = name.rsplit_once('.')?;
  Some(ext.to_ascii_lowercase())
}

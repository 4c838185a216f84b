/* src/server/core/rust/src/cache.rs */

use std::cmp::Ordering;

/// Parsed `cache-control` value, enough to rank how restrictive it is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheDirectives {
  pub no_store: bool,
  pub private: bool,
  pub no_cache: bool,
  pub public: bool,
  pub max_age: Option<u64>,
  raw: Vec<String>,
}

impl CacheDirectives {
  pub fn parse(value: &str) -> Self {
    let mut out = Self::default();
    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
      let lower = part.to_ascii_lowercase();
      match lower.split_once('=') {
        Some(("max-age", secs)) => out.max_age = secs.trim().trim_matches('"').parse().ok(),
        _ => match lower.as_str() {
          "no-store" => out.no_store = true,
          "private" => out.private = true,
          "no-cache" => out.no_cache = true,
          "public" => out.public = true,
          _ => {}
        },
      }
      out.raw.push(part.to_string());
    }
    out
  }

  fn rank(&self) -> u8 {
    if self.no_store {
      0
    } else if self.private {
      1
    } else if self.no_cache {
      2
    } else {
      3
    }
  }

  /// `Less` means `self` allows less caching than `other`.
  pub fn restrictiveness(&self, other: &Self) -> Ordering {
    self.rank().cmp(&other.rank()).then_with(|| {
      let a = self.max_age.unwrap_or(u64::MAX);
      let b = other.max_age.unwrap_or(u64::MAX);
      a.cmp(&b)
    })
  }

  /// Rewrite for a response that depends on the visitor.
  fn privatize(&self) -> String {
    if self.no_store {
      return self.to_string();
    }
    let mut parts: Vec<String> = self
      .raw
      .iter()
      .filter(|p| {
        let lower = p.to_ascii_lowercase();
        lower != "public" && lower != "private" && !lower.starts_with("s-maxage")
      })
      .cloned()
      .collect();
    parts.insert(0, "private".to_string());
    parts.join(", ")
  }
}

impl std::fmt::Display for CacheDirectives {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.raw.join(", "))
  }
}

/// Pick the most restrictive of the values set during the request.
pub fn most_restrictive(values: &[String]) -> Option<CacheDirectives> {
  values
    .iter()
    .map(|v| CacheDirectives::parse(v))
    .filter(|d| !d.raw.is_empty())
    .min_by(CacheDirectives::restrictiveness)
}

/// Cache-control for the final response. Personalized responses (tracked
/// cookie reads, credentialed fetches) are never publicly cacheable.
pub fn resolve_cache_control(
  explicit: &[String],
  personalized: bool,
  default: Option<&str>,
) -> Option<String> {
  let chosen = most_restrictive(explicit);
  match (chosen, personalized) {
    (Some(d), true) => Some(d.privatize()),
    (None, true) => Some("private, no-cache".to_string()),
    (Some(d), false) => Some(d.to_string()),
    (None, false) => default.map(str::to_string),
  }
}

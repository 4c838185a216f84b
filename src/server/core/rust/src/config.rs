/* src/server/core/rust/src/config.rs */

use serde::Deserialize;

/// Runtime options, read from the `options` block of the route manifest or
/// built in code.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
  /// Mount prefix stripped before matching, e.g. "/app". Empty for root.
  pub base_path: String,
  /// Trailing segment that turns a page request into a data request.
  pub data_suffix: String,
  /// Nesting limit for in-process dispatch of internal fetches.
  pub max_fetch_depth: usize,
  /// Cache-control applied when no load set one and nothing was personalized.
  pub default_cache_control: Option<String>,
  /// Include unexpected error messages in responses (development only).
  pub expose_errors: bool,
  /// Script id for the hydration payload.
  pub data_id: String,
  pub app_template: Option<String>,
  pub generic_error_message: String,
}

impl Default for ServerOptions {
  fn default() -> Self {
    Self {
      base_path: String::new(),
      data_suffix: "__data.json".to_string(),
      max_fetch_depth: 8,
      default_cache_control: Some("no-cache".to_string()),
      expose_errors: false,
      data_id: "__loam_data".to_string(),
      app_template: None,
      generic_error_message: "Internal Error".to_string(),
    }
  }
}

impl ServerOptions {
  pub fn app_template(&self) -> &str {
    self.app_template.as_deref().unwrap_or(loam_engine::DEFAULT_APP_TEMPLATE)
  }

  /// Strip `base_path` from a request path; `None` when outside the mount.
  pub fn strip_base<'a>(&self, path: &'a str) -> Option<&'a str> {
    let base = self.base_path.trim_end_matches('/');
    if base.is_empty() {
      return Some(path);
    }
    let rest = path.strip_prefix(base)?;
    if rest.is_empty() {
      Some("/")
    } else if rest.starts_with('/') {
      Some(rest)
    } else {
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn partial_json_keeps_defaults() {
    let opts: ServerOptions =
      serde_json::from_value(serde_json::json!({"expose_errors": true})).unwrap();
    assert!(opts.expose_errors);
    assert_eq!(opts.data_suffix, "__data.json");
    assert_eq!(opts.default_cache_control.as_deref(), Some("no-cache"));
  }

  #[test]
  fn strip_base_path() {
    let opts = ServerOptions { base_path: "/app/".into(), ..Default::default() };
    assert_eq!(opts.strip_base("/app"), Some("/"));
    assert_eq!(opts.strip_base("/app/x"), Some("/x"));
    assert_eq!(opts.strip_base("/apple"), None);
    assert_eq!(ServerOptions::default().strip_base("/x"), Some("/x"));
  }
}

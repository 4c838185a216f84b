/* src/server/core/rust/src/cookies.rs */

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::errors::LoadError;
use crate::url::{Url, decode_uri_component, encode_uri_component};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
  Strict,
  Lax,
  None,
}

impl SameSite {
  fn as_str(self) -> &'static str {
    match self {
      Self::Strict => "Strict",
      Self::Lax => "Lax",
      Self::None => "None",
    }
  }
}

/// Attributes a caller may set; unset fields fall back to the jar defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CookieOptions {
  pub path: Option<String>,
  pub domain: Option<String>,
  pub http_only: Option<bool>,
  pub secure: Option<bool>,
  pub same_site: Option<SameSite>,
  pub max_age: Option<i64>,
  /// Preformatted HTTP date.
  pub expires: Option<String>,
}

impl CookieOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn path(mut self, path: impl Into<String>) -> Self {
    self.path = Some(path.into());
    self
  }

  pub fn domain(mut self, domain: impl Into<String>) -> Self {
    self.domain = Some(domain.into());
    self
  }

  pub fn http_only(mut self, on: bool) -> Self {
    self.http_only = Some(on);
    self
  }

  pub fn secure(mut self, on: bool) -> Self {
    self.secure = Some(on);
    self
  }

  pub fn same_site(mut self, same_site: SameSite) -> Self {
    self.same_site = Some(same_site);
    self
  }

  pub fn max_age(mut self, seconds: i64) -> Self {
    self.max_age = Some(seconds);
    self
  }

  pub fn expires(mut self, http_date: impl Into<String>) -> Self {
    self.expires = Some(http_date.into());
    self
  }
}

/// Options with every default applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCookieOptions {
  pub path: String,
  pub domain: Option<String>,
  pub http_only: bool,
  pub secure: bool,
  pub same_site: SameSite,
  pub max_age: Option<i64>,
  pub expires: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CookieEntry {
  pub name: String,
  pub value: String,
  pub options: ResolvedCookieOptions,
}

impl CookieEntry {
  fn is_deletion(&self) -> bool {
    self.options.max_age == Some(0)
  }

  fn key(&self) -> (&str, &str, Option<String>) {
    let domain = self.options.domain.as_deref();
    (&self.name, &self.options.path, domain.map(|d| d.trim_start_matches('.').to_ascii_lowercase()))
  }

  /// `Set-Cookie` header value.
  pub fn to_header(&self) -> String {
    let o = &self.options;
    let mut out = format!("{}={}", self.name, encode_uri_component(&self.value));
    if let Some(max_age) = o.max_age {
      let _ = write!(out, "; Max-Age={max_age}");
    }
    if let Some(domain) = &o.domain {
      let _ = write!(out, "; Domain={domain}");
    }
    let _ = write!(out, "; Path={}", o.path);
    if let Some(expires) = &o.expires {
      let _ = write!(out, "; Expires={expires}");
    }
    if o.http_only {
      out.push_str("; HttpOnly");
    }
    if o.secure {
      out.push_str("; Secure");
    }
    let _ = write!(out, "; SameSite={}", o.same_site.as_str());
    out
  }
}

#[derive(Debug, thiserror::Error)]
pub enum CookieError {
  #[error("invalid cookie name `{0}`")]
  InvalidName(String),
  #[error("invalid cookie {attribute} `{value}`")]
  InvalidAttribute { attribute: &'static str, value: String },
}

impl From<CookieError> for LoadError {
  fn from(err: CookieError) -> Self {
    LoadError::unexpected(err)
  }
}

fn is_token(name: &str) -> bool {
  !name.is_empty()
    && name.bytes().all(|b| {
      b.is_ascii_graphic()
        && !matches!(
          b,
          b'(' | b')' | b'<' | b'>' | b'@' | b',' | b';' | b':' | b'\\' | b'"' | b'/' | b'[' | b']'
            | b'?' | b'=' | b'{' | b'}'
        )
    })
}

fn check_attribute(attribute: &'static str, value: &str) -> Result<(), CookieError> {
  if value.bytes().any(|b| b == b';' || b.is_ascii_control()) {
    return Err(CookieError::InvalidAttribute { attribute, value: value.to_string() });
  }
  Ok(())
}

/// `constraint` matches `path` when equal, when `path` continues it after a
/// `/`, or when the constraint itself ends with `/` and prefixes `path`.
pub fn path_matches(path: &str, constraint: &str) -> bool {
  if path == constraint {
    return true;
  }
  if constraint.ends_with('/') {
    return path.starts_with(constraint);
  }
  path.strip_prefix(constraint).is_some_and(|rest| rest.starts_with('/'))
}

/// `constraint` matches when equal to `hostname` or a dot-preceded suffix of it.
pub fn domain_matches(hostname: &str, constraint: Option<&str>) -> bool {
  let Some(constraint) = constraint else {
    return true;
  };
  let constraint = constraint.strip_prefix('.').unwrap_or(constraint).to_ascii_lowercase();
  let hostname = hostname.to_ascii_lowercase();
  hostname == constraint
    || hostname.strip_suffix(&constraint).is_some_and(|head| head.ends_with('.'))
}

/// Parse a `Cookie` request header. The first occurrence of a name wins.
pub fn parse_cookie_header(header: &str) -> BTreeMap<String, String> {
  let mut out = BTreeMap::new();
  for pair in header.split(';') {
    let Some((name, value)) = pair.split_once('=') else {
      continue;
    };
    let name = name.trim();
    if name.is_empty() {
      continue;
    }
    let value = value.trim();
    let value = value.strip_prefix('"').and_then(|v| v.strip_suffix('"')).unwrap_or(value);
    out.entry(name.to_string()).or_insert_with(|| decode_uri_component(value));
  }
  out
}

struct JarState {
  url: Url,
  initial: BTreeMap<String, String>,
  new_cookies: Vec<CookieEntry>,
  personalized: bool,
}

/// Request-scoped cookie store. Cloning shares the same jar.
#[derive(Clone)]
pub struct CookieJar {
  inner: Arc<Mutex<JarState>>,
}

impl CookieJar {
  pub fn new(url: Url, cookie_header: Option<&str>) -> Self {
    let initial = cookie_header.map(parse_cookie_header).unwrap_or_default();
    let state = JarState { url, initial, new_cookies: Vec::new(), personalized: false };
    Self { inner: Arc::new(Mutex::new(state)) }
  }

  fn state(&self) -> MutexGuard<'_, JarState> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Current value as seen by this request: cookies set for a matching
  /// path and domain shadow the incoming ones.
  pub fn get(&self, name: &str) -> Option<String> {
    let state = self.state();
    let visible = state.new_cookies.iter().rev().find(|c| {
      c.name == name
        && domain_matches(state.url.hostname(), c.options.domain.as_deref())
        && path_matches(state.url.pathname(), &c.options.path)
    });
    match visible {
      Some(c) if c.is_deletion() => None,
      Some(c) => Some(c.value.clone()),
      None => state.initial.get(name).cloned(),
    }
  }

  pub fn get_all(&self) -> Vec<(String, String)> {
    let state = self.state();
    Self::visible_for(&state, &state.url).into_iter().collect()
  }

  fn visible_for(state: &JarState, target: &Url) -> BTreeMap<String, String> {
    let mut all = state.initial.clone();
    for c in &state.new_cookies {
      if !domain_matches(target.hostname(), c.options.domain.as_deref())
        || !path_matches(target.pathname(), &c.options.path)
      {
        continue;
      }
      if c.is_deletion() {
        all.remove(&c.name);
      } else {
        all.insert(c.name.clone(), c.value.clone());
      }
    }
    all
  }

  fn resolve(&self, options: CookieOptions) -> Result<ResolvedCookieOptions, CookieError> {
    let insecure_local = {
      let state = self.state();
      state.url.scheme() == "http" && state.url.hostname() == "localhost"
    };
    let path = options.path.unwrap_or_else(|| "/".to_string());
    check_attribute("path", &path)?;
    if let Some(domain) = &options.domain {
      check_attribute("domain", domain)?;
    }
    if let Some(expires) = &options.expires {
      check_attribute("expires", expires)?;
    }
    Ok(ResolvedCookieOptions {
      path,
      domain: options.domain,
      http_only: options.http_only.unwrap_or(true),
      secure: options.secure.unwrap_or(!insecure_local),
      same_site: options.same_site.unwrap_or(SameSite::Lax),
      max_age: options.max_age,
      expires: options.expires,
    })
  }

  /// Build a `Set-Cookie` value without storing it.
  pub fn serialize(
    &self,
    name: &str,
    value: &str,
    options: CookieOptions,
  ) -> Result<String, CookieError> {
    if !is_token(name) {
      return Err(CookieError::InvalidName(name.to_string()));
    }
    let options = self.resolve(options)?;
    Ok(CookieEntry { name: name.to_string(), value: value.to_string(), options }.to_header())
  }

  /// Store a cookie. A later write for the same name, path and domain
  /// replaces the earlier one.
  pub fn set(&self, name: &str, value: &str, options: CookieOptions) -> Result<(), CookieError> {
    if !is_token(name) {
      return Err(CookieError::InvalidName(name.to_string()));
    }
    let options = self.resolve(options)?;
    let entry = CookieEntry { name: name.to_string(), value: value.to_string(), options };
    let mut state = self.state();
    state.new_cookies.retain(|c| c.key() != entry.key());
    state.new_cookies.push(entry);
    Ok(())
  }

  pub fn delete(&self, name: &str, options: CookieOptions) -> Result<(), CookieError> {
    self.set(name, "", CookieOptions { max_age: Some(0), ..options })
  }

  /// Merge a `Set-Cookie` header received from an internal fetch.
  pub fn apply_set_cookie(&self, header: &str) -> Result<(), CookieError> {
    let mut parts = header.split(';');
    let Some((name, value)) = parts.next().and_then(|p| p.split_once('=')) else {
      return Ok(());
    };
    let mut options = CookieOptions::new();
    for attr in parts {
      let (key, val) = attr.split_once('=').unwrap_or((attr, ""));
      let val = val.trim();
      match key.trim().to_ascii_lowercase().as_str() {
        "path" => options.path = Some(val.to_string()),
        "domain" => options.domain = Some(val.to_string()),
        "max-age" => options.max_age = val.parse().ok(),
        "expires" => options.expires = Some(val.to_string()),
        "httponly" => options.http_only = Some(true),
        "secure" => options.secure = Some(true),
        "samesite" => {
          options.same_site = match val.to_ascii_lowercase().as_str() {
            "strict" => Some(SameSite::Strict),
            "none" => Some(SameSite::None),
            _ => Some(SameSite::Lax),
          }
        }
        _ => {}
      }
    }
    options.http_only.get_or_insert(false);
    options.secure.get_or_insert(false);
    self.set(name.trim(), &decode_uri_component(value.trim()), options)
  }

  /// `Cookie` header to forward to a same-origin fetch of `target`.
  pub fn cookie_header_for(&self, target: &Url) -> Option<String> {
    let state = self.state();
    let all = Self::visible_for(&state, target);
    if all.is_empty() {
      return None;
    }
    let pairs: Vec<String> =
      all.iter().map(|(k, v)| format!("{k}={}", encode_uri_component(v))).collect();
    Some(pairs.join("; "))
  }

  /// One `Set-Cookie` value per (name, path, domain); the last write wins.
  pub fn set_cookie_headers(&self) -> Vec<String> {
    self.state().new_cookies.iter().map(CookieEntry::to_header).collect()
  }

  pub fn new_cookies(&self) -> Vec<CookieEntry> {
    self.state().new_cookies.clone()
  }

  /// Mark the response as depending on the caller's cookies.
  pub fn mark_personalized(&self) {
    self.state().personalized = true;
  }

  pub fn is_personalized(&self) -> bool {
    self.state().personalized
  }
}

#[cfg(test)]
mod tests;

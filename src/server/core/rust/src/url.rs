/* src/server/core/rust/src/url.rs */

use std::fmt;

use http::Uri;

/// Absolute http(s) URL split into the parts the pipeline compares.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Url {
  scheme: String,
  authority: String,
  path: String,
  query: Option<String>,
}

impl Url {
  /// Parse an absolute URL. Fragments are dropped.
  pub fn parse(input: &str) -> Option<Self> {
    let input = input.split('#').next().unwrap_or_default();
    let uri: Uri = input.parse().ok()?;
    let scheme = uri.scheme_str()?.to_ascii_lowercase();
    let authority = uri.authority()?.as_str().to_ascii_lowercase();
    let path = match uri.path() {
      "" => "/".to_string(),
      p => normalize_path(p),
    };
    Some(Self { scheme, authority, path, query: uri.query().map(str::to_string) })
  }

  /// Build from an origin plus a path-and-query, as received by a server.
  pub fn from_origin(origin: &str, path_and_query: &str) -> Option<Self> {
    Self::parse(origin)?.join(path_and_query)
  }

  /// Resolve `href` against this URL the way a browser resolves links.
  pub fn join(&self, href: &str) -> Option<Self> {
    let href = href.split('#').next().unwrap_or_default();
    if has_scheme(href) {
      return Self::parse(href);
    }
    if let Some(rest) = href.strip_prefix("//") {
      return Self::parse(&format!("{}://{rest}", self.scheme));
    }
    let (path_part, query) = match href.split_once('?') {
      Some((p, q)) => (p, Some(q.to_string())),
      None => (href, None),
    };
    let path = if path_part.is_empty() {
      self.path.clone()
    } else if path_part.starts_with('/') {
      normalize_path(path_part)
    } else {
      let dir = match self.path.rfind('/') {
        Some(i) => &self.path[..=i],
        None => "/",
      };
      normalize_path(&format!("{dir}{path_part}"))
    };
    let query = if path_part.is_empty() && query.is_none() { self.query.clone() } else { query };
    Some(Self { scheme: self.scheme.clone(), authority: self.authority.clone(), path, query })
  }

  pub fn scheme(&self) -> &str {
    &self.scheme
  }

  pub fn origin(&self) -> String {
    format!("{}://{}", self.scheme, self.authority)
  }

  pub fn hostname(&self) -> &str {
    let host = self.authority.rsplit('@').next().unwrap_or(&self.authority);
    if host.starts_with('[') {
      return host.split_inclusive(']').next().unwrap_or(host);
    }
    host.split(':').next().unwrap_or(host)
  }

  pub fn pathname(&self) -> &str {
    &self.path
  }

  pub fn query(&self) -> Option<&str> {
    self.query.as_deref()
  }

  /// Path plus `?query`, as sent on the request line.
  pub fn path_and_query(&self) -> String {
    match &self.query {
      Some(q) => format!("{}?{q}", self.path),
      None => self.path.clone(),
    }
  }

  pub fn with_path(&self, path: &str) -> Self {
    Self { path: normalize_path(path), ..self.clone() }
  }

  pub fn with_query(&self, query: Option<String>) -> Self {
    Self { query: query.filter(|q| !q.is_empty()), ..self.clone() }
  }

  pub fn same_origin(&self, other: &Url) -> bool {
    self.scheme == other.scheme && self.authority == other.authority
  }

  /// Decoded `key=value` pairs of the query string, in order.
  pub fn search_params(&self) -> Vec<(String, String)> {
    let Some(query) = &self.query else {
      return Vec::new();
    };
    query
      .split('&')
      .filter(|pair| !pair.is_empty())
      .map(|pair| {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        (decode_form(k), decode_form(v))
      })
      .collect()
  }

  pub fn search_param(&self, name: &str) -> Option<String> {
    self.search_params().into_iter().find(|(k, _)| k == name).map(|(_, v)| v)
  }
}

impl fmt::Display for Url {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}://{}{}", self.scheme, self.authority, self.path)?;
    if let Some(q) = &self.query {
      write!(f, "?{q}")?;
    }
    Ok(())
  }
}

fn has_scheme(href: &str) -> bool {
  let Some((scheme, _)) = href.split_once(':') else {
    return false;
  };
  !scheme.is_empty()
    && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
    && scheme.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

/// Remove `.` and `..` segments.
fn normalize_path(path: &str) -> String {
  let mut out: Vec<&str> = Vec::new();
  let segments: Vec<&str> = path.split('/').skip(1).collect();
  let last = segments.len().saturating_sub(1);
  for (i, seg) in segments.iter().enumerate() {
    match *seg {
      "." => {
        if i == last {
          out.push("");
        }
      }
      ".." => {
        out.pop();
        if i == last {
          out.push("");
        }
      }
      s => out.push(s),
    }
  }
  format!("/{}", out.join("/"))
}

/// Percent-decode a path segment. Invalid sequences are kept verbatim.
pub fn decode_uri_component(input: &str) -> String {
  if !input.contains('%') {
    return input.to_string();
  }
  let bytes = input.as_bytes();
  let mut out = Vec::with_capacity(bytes.len());
  let mut i = 0;
  while i < bytes.len() {
    if bytes[i] == b'%'
      && i + 2 < bytes.len()
      && let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2]))
    {
      out.push(hi << 4 | lo);
      i += 3;
      continue;
    }
    out.push(bytes[i]);
    i += 1;
  }
  String::from_utf8(out).unwrap_or_else(|_| input.to_string())
}

fn decode_form(input: &str) -> String {
  decode_uri_component(&input.replace('+', " "))
}

fn hex_value(b: u8) -> Option<u8> {
  match b {
    b'0'..=b'9' => Some(b - b'0'),
    b'a'..=b'f' => Some(b - b'a' + 10),
    b'A'..=b'F' => Some(b - b'A' + 10),
    _ => None,
  }
}

/// Percent-encode everything outside the unreserved set plus the
/// characters `encodeURIComponent` leaves alone.
pub fn encode_uri_component(input: &str) -> String {
  let mut out = String::with_capacity(input.len());
  for b in input.bytes() {
    if b.is_ascii_alphanumeric()
      || matches!(b, b'-' | b'_' | b'.' | b'!' | b'~' | b'*' | b'\'' | b'(' | b')')
    {
      out.push(b as char);
    } else {
      out.push_str(&format!("%{b:02X}"));
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn parse_parts() {
    let u = url("HTTP://Example.com:8080/a/b?x=1#frag");
    assert_eq!(u.origin(), "http://example.com:8080");
    assert_eq!(u.hostname(), "example.com");
    assert_eq!(u.pathname(), "/a/b");
    assert_eq!(u.query(), Some("x=1"));
    assert_eq!(u.to_string(), "http://example.com:8080/a/b?x=1");
  }

  #[test]
  fn join_relative_forms() {
    let base = url("https://site.dev/blog/post?p=1");
    assert_eq!(base.join("/api/x").unwrap().to_string(), "https://site.dev/api/x");
    assert_eq!(base.join("other").unwrap().to_string(), "https://site.dev/blog/other");
    assert_eq!(base.join("../up").unwrap().to_string(), "https://site.dev/up");
    assert_eq!(base.join("?q=2").unwrap().to_string(), "https://site.dev/blog/post?q=2");
    assert_eq!(base.join("").unwrap().to_string(), "https://site.dev/blog/post?p=1");
    assert_eq!(base.join("//cdn.dev/x").unwrap().to_string(), "https://cdn.dev/x");
    assert_eq!(base.join("http://other.dev").unwrap().to_string(), "http://other.dev/");
  }

  #[test]
  fn same_origin_compares_port() {
    assert!(url("http://a.dev/x").same_origin(&url("http://a.dev/y")));
    assert!(!url("http://a.dev/x").same_origin(&url("http://a.dev:81/y")));
    assert!(!url("http://a.dev/x").same_origin(&url("https://a.dev/x")));
  }

  #[test]
  fn search_params_decode() {
    let u = url("http://a.dev/?q=hello+world&tag=a%2Fb&flag");
    assert_eq!(
      u.search_params(),
      vec![
        ("q".to_string(), "hello world".to_string()),
        ("tag".to_string(), "a/b".to_string()),
        ("flag".to_string(), String::new()),
      ]
    );
    assert_eq!(u.search_param("tag").as_deref(), Some("a/b"));
  }

  #[test]
  fn percent_round_trip_edges() {
    assert_eq!(decode_uri_component("caf%C3%A9"), "café");
    assert_eq!(decode_uri_component("100%"), "100%");
    assert_eq!(decode_uri_component("%zz"), "%zz");
    assert_eq!(encode_uri_component("a b;c"), "a%20b%3Bc");
  }
}

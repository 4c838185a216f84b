/* src/server/core/rust/src/errors.rs */

use std::fmt;
use std::sync::Arc;

use serde_json::{Value, json};

/// Expected failure carrying a status and a body safe to show to users.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpError {
  code: String,
  message: String,
  status: u16,
  body: Option<Value>,
}

fn default_status(code: &str) -> u16 {
  match code {
    "VALIDATION_ERROR" => 400,
    "UNAUTHORIZED" => 401,
    "FORBIDDEN" => 403,
    "NOT_FOUND" => 404,
    "METHOD_NOT_ALLOWED" => 405,
    "RATE_LIMITED" => 429,
    _ => 500,
  }
}

impl HttpError {
  pub fn new(code: impl Into<String>, message: impl Into<String>, status: u16) -> Self {
    Self { code: code.into(), message: message.into(), status, body: None }
  }

  pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
    let code = code.into();
    let status = default_status(&code);
    Self { code, message: message.into(), status, body: None }
  }

  /// Build from a bare status, deriving the code from it.
  pub fn status_only(status: u16, message: impl Into<String>) -> Self {
    let code = match status {
      400 => "VALIDATION_ERROR",
      401 => "UNAUTHORIZED",
      403 => "FORBIDDEN",
      404 => "NOT_FOUND",
      405 => "METHOD_NOT_ALLOWED",
      429 => "RATE_LIMITED",
      _ if status < 500 => "HTTP_ERROR",
      _ => "INTERNAL_ERROR",
    };
    Self::new(code, message, status)
  }

  pub fn validation(msg: impl Into<String>) -> Self {
    Self::with_code("VALIDATION_ERROR", msg)
  }

  pub fn not_found(msg: impl Into<String>) -> Self {
    Self::with_code("NOT_FOUND", msg)
  }

  pub fn internal(msg: impl Into<String>) -> Self {
    Self::with_code("INTERNAL_ERROR", msg)
  }

  pub fn unauthorized(msg: impl Into<String>) -> Self {
    Self::with_code("UNAUTHORIZED", msg)
  }

  pub fn forbidden(msg: impl Into<String>) -> Self {
    Self::with_code("FORBIDDEN", msg)
  }

  pub fn method_not_allowed(msg: impl Into<String>) -> Self {
    Self::with_code("METHOD_NOT_ALLOWED", msg)
  }

  /// Attach extra fields merged into the public error body.
  pub fn with_body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  pub fn code(&self) -> &str {
    &self.code
  }

  pub fn message(&self) -> &str {
    &self.message
  }

  pub fn status(&self) -> u16 {
    self.status
  }

  /// Public JSON body: `{code, message}` plus any attached fields.
  pub fn to_body(&self) -> Value {
    let mut body = json!({ "code": self.code, "message": self.message });
    if let (Some(Value::Object(extra)), Some(obj)) = (&self.body, body.as_object_mut()) {
      for (k, v) in extra {
        obj.insert(k.clone(), v.clone());
      }
    }
    body
  }
}

impl fmt::Display for HttpError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}: {}", self.code, self.message)
  }
}

impl std::error::Error for HttpError {}

/// Control-flow signal that short-circuits a request with a 3xx response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
  pub status: u16,
  pub location: String,
}

impl Redirect {
  /// Statuses outside 300..=308 are coerced to 302.
  pub fn new(status: u16, location: impl Into<String>) -> Self {
    let status = if (300..=308).contains(&status) { status } else { 302 };
    Self { status, location: location.into() }
  }

  pub fn see_other(location: impl Into<String>) -> Self {
    Self::new(303, location)
  }

  pub fn temporary(location: impl Into<String>) -> Self {
    Self::new(307, location)
  }
}

/// Outcome of a failed load, hook or endpoint.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
  #[error("redirect {} to {}", .0.status, .0.location)]
  Redirect(Redirect),
  #[error(transparent)]
  Http(HttpError),
  #[error("unexpected error: {0}")]
  Unexpected(Arc<anyhow::Error>),
}

impl LoadError {
  pub fn unexpected(err: impl Into<anyhow::Error>) -> Self {
    Self::Unexpected(Arc::new(err.into()))
  }

  pub fn redirect(status: u16, location: impl Into<String>) -> Self {
    Self::Redirect(Redirect::new(status, location))
  }

  /// Status the response carries: redirect code, expected status, or 500.
  pub fn status(&self) -> u16 {
    match self {
      Self::Redirect(r) => r.status,
      Self::Http(e) => e.status(),
      Self::Unexpected(_) => 500,
    }
  }

  pub fn is_unexpected(&self) -> bool {
    matches!(self, Self::Unexpected(_))
  }
}

impl From<HttpError> for LoadError {
  fn from(err: HttpError) -> Self {
    Self::Http(err)
  }
}

impl From<Redirect> for LoadError {
  fn from(r: Redirect) -> Self {
    Self::Redirect(r)
  }
}

impl From<anyhow::Error> for LoadError {
  fn from(err: anyhow::Error) -> Self {
    Self::Unexpected(Arc::new(err))
  }
}

impl From<serde_json::Error> for LoadError {
  fn from(err: serde_json::Error) -> Self {
    Self::unexpected(err)
  }
}

/// Infrastructure failures while building or loading a manifest.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
  #[error("invalid route id `{id}`: {reason}")]
  RouteId { id: String, reason: String },
  #[error("route `{route}` references unknown node `{node}`")]
  UnknownNode { route: String, node: String },
  #[error("route `{route}` uses unregistered matcher `{matcher}`")]
  UnknownMatcher { route: String, matcher: String },
  #[error("node `{node}` declares a {kind} that is not registered")]
  MissingHandler { node: String, kind: &'static str },
  #[error("failed to read build output: {0}")]
  Io(#[from] std::io::Error),
  #[error("malformed build output: {0}")]
  Json(#[from] serde_json::Error),
}

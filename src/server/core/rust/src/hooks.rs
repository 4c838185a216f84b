/* src/server/core/rust/src/hooks.rs */

use serde_json::{Value, json};

use crate::body::Body;
use crate::errors::LoadError;
use crate::event::RequestEvent;
use crate::fetch::{FetchRequest, FetchResponse};
use crate::load::BoxFuture;

pub type Response = http::Response<Body>;

/// The rest of the pipeline after `handle`: matching, loading and rendering.
pub struct Resolve {
  run: Box<dyn FnOnce() -> BoxFuture<Result<Response, LoadError>> + Send>,
}

impl Resolve {
  pub(crate) fn new(
    run: impl FnOnce() -> BoxFuture<Result<Response, LoadError>> + Send + 'static,
  ) -> Self {
    Self { run: Box::new(run) }
  }

  pub fn run(self) -> BoxFuture<Result<Response, LoadError>> {
    (self.run)()
  }
}

/// The fetch that `handle_fetch` wraps.
pub struct FetchNext {
  run: Box<dyn FnOnce(FetchRequest) -> BoxFuture<Result<FetchResponse, LoadError>> + Send>,
}

impl FetchNext {
  pub(crate) fn new(
    run: impl FnOnce(FetchRequest) -> BoxFuture<Result<FetchResponse, LoadError>> + Send + 'static,
  ) -> Self {
    Self { run: Box::new(run) }
  }

  pub fn run(self, request: FetchRequest) -> BoxFuture<Result<FetchResponse, LoadError>> {
    (self.run)(request)
  }
}

/// Application hooks around every request. All methods default to passing
/// through.
pub trait Hooks: Send + Sync {
  /// Wrap request resolution: set locals, short-circuit, or post-process the
  /// response.
  fn handle(
    &self,
    _event: RequestEvent,
    resolve: Resolve,
  ) -> BoxFuture<Result<Response, LoadError>> {
    resolve.run()
  }

  /// Called once per unexpected error. Returning `Some` replaces the generic
  /// public error body.
  fn handle_error(
    &self,
    error: &LoadError,
    event: &RequestEvent,
    status: u16,
    message: &str,
  ) -> Option<Value> {
    tracing::error!(
      status,
      path = event.url().pathname(),
      route = event.route_id().unwrap_or("-"),
      error = %error,
      "{message}"
    );
    None
  }

  /// Rewrite or intercept fetches issued during server rendering.
  fn handle_fetch(
    &self,
    request: FetchRequest,
    _event: RequestEvent,
    next: FetchNext,
  ) -> BoxFuture<Result<FetchResponse, LoadError>> {
    next.run(request)
  }
}

/// Hooks that pass everything through.
pub struct DefaultHooks;

impl Hooks for DefaultHooks {}

/// Public body of an error: the hook's body, or `{message}`.
pub(crate) fn error_body(custom: Option<Value>, message: &str) -> Value {
  custom.unwrap_or_else(|| json!({ "message": message }))
}

/* src/server/core/rust/src/fetch.rs */

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::future::{Shared, WeakShared};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;

use crate::errors::{HttpError, LoadError};
use crate::load::BoxFuture;

/// Outgoing request issued by a load or hook. `url` may be relative.
#[derive(Debug, Clone)]
pub struct FetchRequest {
  pub method: Method,
  pub url: String,
  pub headers: HeaderMap,
  pub body: Bytes,
}

impl FetchRequest {
  pub fn new(method: Method, url: impl Into<String>) -> Self {
    Self { method, url: url.into(), headers: HeaderMap::new(), body: Bytes::new() }
  }

  pub fn get(url: impl Into<String>) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn post(url: impl Into<String>, body: impl Into<Bytes>) -> Self {
    Self { body: body.into(), ..Self::new(Method::POST, url) }
  }

  /// Invalid header names or values are skipped.
  pub fn header(mut self, name: &str, value: &str) -> Self {
    if let (Ok(name), Ok(value)) =
      (HeaderName::try_from(name), HeaderValue::try_from(value))
    {
      self.headers.insert(name, value);
    }
    self
  }

  pub fn json(mut self, value: &impl Serialize) -> Result<Self, LoadError> {
    self.body = Bytes::from(serde_json::to_vec(value)?);
    self.headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(self)
  }
}

/// Fully buffered response.
#[derive(Debug, Clone)]
pub struct FetchResponse {
  pub status: StatusCode,
  pub headers: HeaderMap,
  pub body: Bytes,
}

impl FetchResponse {
  pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
    Self { status, headers: HeaderMap::new(), body: body.into() }
  }

  pub fn ok(&self) -> bool {
    self.status.is_success()
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  pub fn json<T: DeserializeOwned>(&self) -> Result<T, LoadError> {
    Ok(serde_json::from_slice(&self.body)?)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(name).and_then(|v| v.to_str().ok())
  }

  /// Fail with the response status unless it is 2xx.
  pub fn error_for_status(self) -> Result<Self, LoadError> {
    if self.ok() {
      return Ok(self);
    }
    let status = self.status.as_u16();
    Err(HttpError::status_only(status, format!("upstream responded with {status}")).into())
  }
}

/// Which kind of caller issued a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
  /// Server loads, hooks and endpoints.
  Server,
  /// Universal loads; responses are recorded for hydration.
  Universal,
}

/// Request-scoped fetch as seen by loads.
pub trait Fetch: Send + Sync {
  fn fetch(
    &self,
    request: FetchRequest,
    mode: FetchMode,
  ) -> BoxFuture<Result<FetchResponse, LoadError>>;
}

/// Network access supplied by the host for targets outside the app.
/// Receives absolute URLs only.
pub trait PlatformFetch: Send + Sync {
  fn send(&self, request: FetchRequest) -> BoxFuture<Result<FetchResponse, LoadError>>;
}

impl<F> PlatformFetch for F
where
  F: Fn(FetchRequest) -> BoxFuture<Result<FetchResponse, LoadError>> + Send + Sync,
{
  fn send(&self, request: FetchRequest) -> BoxFuture<Result<FetchResponse, LoadError>> {
    self(request)
  }
}

/// Platform without network access: every external fetch fails.
pub struct NoNetwork;

impl PlatformFetch for NoNetwork {
  fn send(&self, request: FetchRequest) -> BoxFuture<Result<FetchResponse, LoadError>> {
    let url = request.url;
    Box::pin(async move {
      Err(LoadError::unexpected(anyhow::anyhow!("no network access for fetch to {url}")))
    })
  }
}

type SharedFetch = Shared<BoxFuture<Result<FetchResponse, LoadError>>>;
type WeakFetch = WeakShared<BoxFuture<Result<FetchResponse, LoadError>>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct FetchKey {
  method: Method,
  href: String,
  body: Bytes,
}

impl FetchKey {
  pub(crate) fn new(method: &Method, href: &str, body: &Bytes) -> Self {
    Self { method: method.clone(), href: href.to_string(), body: body.clone() }
  }
}

/// Coalesces identical calls while the first is still pending. Entries are
/// weak: a call every caller gave up on is dropped, not kept alive.
#[derive(Clone, Default)]
pub(crate) struct Inflight {
  pending: Arc<Mutex<HashMap<FetchKey, WeakFetch>>>,
}

impl Inflight {
  pub(crate) fn run(
    &self,
    key: FetchKey,
    start: impl FnOnce() -> BoxFuture<Result<FetchResponse, LoadError>>,
  ) -> BoxFuture<Result<FetchResponse, LoadError>> {
    let live = self.lock().get(&key).and_then(WeakShared::upgrade);
    if let Some(shared) = live {
      tracing::debug!(method = %key.method, url = %key.href, "coalesced in-flight fetch");
      return Box::pin(shared);
    }
    // started unlocked: a hook may issue nested fetches synchronously
    let fut = start();
    let registry = Arc::clone(&self.pending);
    let done_key = key.clone();
    let shared: SharedFetch = async move {
      let out = fut.await;
      registry.lock().unwrap_or_else(PoisonError::into_inner).remove(&done_key);
      out
    }
    .boxed()
    .shared();
    if let Some(weak) = shared.downgrade() {
      self.lock().insert(key, weak);
    }
    Box::pin(shared)
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<FetchKey, WeakFetch>> {
    self.pending.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// Cancels in-flight fetches of a request.
pub struct AbortController {
  tx: watch::Sender<bool>,
}

impl AbortController {
  pub fn new() -> Self {
    Self { tx: watch::channel(false).0 }
  }

  pub fn signal(&self) -> AbortSignal {
    AbortSignal { rx: self.tx.subscribe() }
  }

  pub fn abort(&self) {
    self.tx.send_replace(true);
  }
}

impl Default for AbortController {
  fn default() -> Self {
    Self::new()
  }
}

#[derive(Clone)]
pub struct AbortSignal {
  rx: watch::Receiver<bool>,
}

impl Default for AbortSignal {
  fn default() -> Self {
    Self::never()
  }
}

impl AbortSignal {
  /// A signal that never fires.
  pub fn never() -> Self {
    Self { rx: watch::channel(false).1 }
  }

  pub fn is_aborted(&self) -> bool {
    *self.rx.borrow()
  }

  /// Resolves once the controller aborts. Pending forever if it was dropped.
  pub async fn aborted(&self) {
    let mut rx = self.rx.clone();
    loop {
      if *rx.borrow_and_update() {
        return;
      }
      if rx.changed().await.is_err() {
        std::future::pending::<()>().await;
      }
    }
  }

  /// Race `fut` against the signal.
  pub async fn guard<T>(
    &self,
    fut: impl Future<Output = Result<T, LoadError>>,
  ) -> Result<T, LoadError> {
    tokio::select! {
      biased;
      () = self.aborted() => Err(LoadError::unexpected(anyhow::anyhow!("request aborted"))),
      out = fut => out,
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  use super::*;

  fn counting_fetch(counter: Arc<AtomicUsize>) -> BoxFuture<Result<FetchResponse, LoadError>> {
    Box::pin(async move {
      counter.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(10)).await;
      Ok(FetchResponse::new(StatusCode::OK, "{\"n\":1}"))
    })
  }

  #[tokio::test]
  async fn concurrent_identical_calls_coalesce() {
    let inflight = Inflight::default();
    let counter = Arc::new(AtomicUsize::new(0));
    let key = || FetchKey::new(&Method::GET, "http://a.dev/api/x", &Bytes::new());
    let a = inflight.run(key(), || counting_fetch(counter.clone()));
    let b = inflight.run(key(), || counting_fetch(counter.clone()));
    let (a, b) = futures_util::join!(a, b);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(a.unwrap().text(), b.unwrap().text());
  }

  #[tokio::test]
  async fn different_bodies_do_not_coalesce() {
    let inflight = Inflight::default();
    let counter = Arc::new(AtomicUsize::new(0));
    let a = inflight.run(FetchKey::new(&Method::POST, "http://a.dev/x", &Bytes::from("1")), || {
      counting_fetch(counter.clone())
    });
    let b = inflight.run(FetchKey::new(&Method::POST, "http://a.dev/x", &Bytes::from("2")), || {
      counting_fetch(counter.clone())
    });
    let _ = futures_util::join!(a, b);
    assert_eq!(counter.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn settled_calls_are_released() {
    let inflight = Inflight::default();
    let counter = Arc::new(AtomicUsize::new(0));
    let key = || FetchKey::new(&Method::GET, "http://a.dev/api/x", &Bytes::new());
    inflight.run(key(), || counting_fetch(counter.clone())).await.unwrap();
    inflight.run(key(), || counting_fetch(counter.clone())).await.unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn abort_cancels_guarded_future() {
    let controller = AbortController::new();
    let signal = controller.signal();
    let slow = async {
      tokio::time::sleep(Duration::from_secs(30)).await;
      Ok::<_, LoadError>(())
    };
    let guarded = signal.guard(slow);
    controller.abort();
    let err = guarded.await.unwrap_err();
    assert!(err.to_string().contains("aborted"));
    assert!(signal.is_aborted());
  }

  #[tokio::test]
  async fn never_signal_lets_future_finish() {
    let out = AbortSignal::never().guard(async { Ok::<_, LoadError>(7) }).await.unwrap();
    assert_eq!(out, 7);
  }

  #[test]
  fn error_for_status_maps_code() {
    let res = FetchResponse::new(StatusCode::NOT_FOUND, "");
    assert_eq!(res.error_for_status().unwrap_err().status(), 404);
  }

  #[test]
  fn request_builders() {
    let req = FetchRequest::get("/api").header("x-a", "1").header("bad header", "v");
    assert_eq!(req.headers.len(), 1);
    let req = FetchRequest::post("/api", "x").json(&serde_json::json!({"a": 1})).unwrap();
    assert_eq!(req.body, Bytes::from("{\"a\":1}"));
    assert_eq!(req.headers[http::header::CONTENT_TYPE], "application/json");
  }
}

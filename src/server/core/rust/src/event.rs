/* src/server/core/rust/src/event.rs */

use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::Bytes;
use futures_util::future::Shared;
use http::header::{CACHE_CONTROL, HeaderName, HeaderValue, SET_COOKIE};
use http::{Extensions, HeaderMap, Method};
use serde_json::{Map, Value};

use crate::cookies::{CookieError, CookieJar, CookieOptions};
use crate::deps::LoadTracker;
use crate::errors::LoadError;
use crate::fetch::{AbortSignal, Fetch, FetchMode, FetchRequest, FetchResponse};
use crate::load::BoxFuture;
use crate::matcher::Params;
use crate::url::Url;

/// Merged data of every ancestor node, computed at most once per node.
pub type ParentData = Shared<BoxFuture<Result<Arc<Map<String, Value>>, LoadError>>>;

/// Everything known about an incoming request before loads run.
pub struct RequestInit {
  pub method: Method,
  pub headers: HeaderMap,
  pub body: Bytes,
  pub url: Url,
  pub route_id: Option<String>,
  pub params: Params,
  pub platform: Option<Arc<dyn Any + Send + Sync>>,
  pub env: Arc<BTreeMap<String, String>>,
  pub is_data_request: bool,
  pub abort: AbortSignal,
}

impl RequestInit {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      headers: HeaderMap::new(),
      body: Bytes::new(),
      url,
      route_id: None,
      params: Params::new(),
      platform: None,
      env: Arc::default(),
      is_data_request: false,
      abort: AbortSignal::never(),
    }
  }
}

/// Headers set by loads and hooks for the outgoing response.
#[derive(Default)]
pub(crate) struct ResponseHeaders {
  pub(crate) headers: HeaderMap,
  pub(crate) cache_control: Vec<String>,
}

struct RequestInner {
  init: RequestInit,
  cookies: CookieJar,
  fetch: Arc<dyn Fetch>,
  locals: Mutex<Extensions>,
  response_headers: Mutex<ResponseHeaders>,
}

/// Per-request context shared by hooks, loads, actions and endpoints.
#[derive(Clone)]
pub struct RequestEvent {
  inner: Arc<RequestInner>,
}

/// Non-owning handle, for fetchers that need the event they belong to.
#[derive(Clone)]
pub struct WeakRequestEvent {
  inner: Weak<RequestInner>,
}

impl WeakRequestEvent {
  pub fn upgrade(&self) -> Option<RequestEvent> {
    self.inner.upgrade().map(|inner| RequestEvent { inner })
  }
}

impl RequestEvent {
  /// Build an event whose fetch implementation refers back to it.
  pub fn new_cyclic(
    init: RequestInit,
    cookies: CookieJar,
    make_fetch: impl FnOnce(WeakRequestEvent) -> Arc<dyn Fetch>,
  ) -> Self {
    let inner = Arc::new_cyclic(|weak| RequestInner {
      init,
      cookies,
      fetch: make_fetch(WeakRequestEvent { inner: weak.clone() }),
      locals: Mutex::new(Extensions::new()),
      response_headers: Mutex::new(ResponseHeaders::default()),
    });
    Self { inner }
  }

  pub fn new(init: RequestInit, cookies: CookieJar, fetch: Arc<dyn Fetch>) -> Self {
    Self::new_cyclic(init, cookies, |_| fetch)
  }

  pub fn method(&self) -> &Method {
    &self.inner.init.method
  }

  pub fn headers(&self) -> &HeaderMap {
    &self.inner.init.headers
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.inner.init.headers.get(name).and_then(|v| v.to_str().ok())
  }

  pub fn body(&self) -> &Bytes {
    &self.inner.init.body
  }

  /// Decode an `application/x-www-form-urlencoded` body.
  pub fn form_data(&self) -> Vec<(String, String)> {
    let body = String::from_utf8_lossy(&self.inner.init.body);
    Url::parse("http://form.local/")
      .map(|u| u.with_query(Some(body.into_owned())).search_params())
      .unwrap_or_default()
  }

  pub fn url(&self) -> &Url {
    &self.inner.init.url
  }

  pub fn route_id(&self) -> Option<&str> {
    self.inner.init.route_id.as_deref()
  }

  pub fn params(&self) -> &Params {
    &self.inner.init.params
  }

  pub fn cookies(&self) -> &CookieJar {
    &self.inner.cookies
  }

  pub fn platform(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
    self.inner.init.platform.as_ref()
  }

  pub fn env(&self) -> &BTreeMap<String, String> {
    &self.inner.init.env
  }

  pub fn is_data_request(&self) -> bool {
    self.inner.init.is_data_request
  }

  pub fn abort_signal(&self) -> &AbortSignal {
    &self.inner.init.abort
  }

  pub fn fetch(&self, request: FetchRequest) -> BoxFuture<Result<FetchResponse, LoadError>> {
    self.inner.fetch.fetch(request, FetchMode::Server)
  }

  pub(crate) fn fetcher(&self) -> &Arc<dyn Fetch> {
    &self.inner.fetch
  }

  pub fn set_local<T: Clone + Send + Sync + 'static>(&self, value: T) {
    self.inner.locals.lock().unwrap_or_else(PoisonError::into_inner).insert(value);
  }

  pub fn local<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
    self.inner.locals.lock().unwrap_or_else(PoisonError::into_inner).get::<T>().cloned()
  }

  /// Set response headers. `set-cookie` is refused (use the cookie jar) and
  /// a header other than `cache-control` may only be set once.
  pub fn set_headers<'a>(
    &self,
    headers: impl IntoIterator<Item = (&'a str, &'a str)>,
  ) -> Result<(), LoadError> {
    let mut out = self.response_headers();
    for (name, value) in headers {
      let name = HeaderName::try_from(name).map_err(LoadError::unexpected)?;
      let value = HeaderValue::try_from(value).map_err(LoadError::unexpected)?;
      if name == SET_COOKIE {
        return Err(LoadError::unexpected(anyhow::anyhow!(
          "use `cookies().set(..)` instead of `set_headers` to set cookies"
        )));
      }
      if name == CACHE_CONTROL {
        out.cache_control.push(value.to_str().unwrap_or_default().to_string());
        continue;
      }
      if out.headers.contains_key(&name) {
        return Err(LoadError::unexpected(anyhow::anyhow!("`{name}` header is already set")));
      }
      out.headers.insert(name, value);
    }
    Ok(())
  }

  pub(crate) fn response_headers(&self) -> MutexGuard<'_, ResponseHeaders> {
    self.inner.response_headers.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// Cookie access from a load: reads mark the load impure and the response
/// personalized unless made inside `untrack`.
pub struct TrackedCookies<'a> {
  jar: &'a CookieJar,
  tracker: &'a LoadTracker,
}

impl TrackedCookies<'_> {
  fn note_read(&self) {
    if self.tracker.is_tracking() {
      self.tracker.record_impure();
      self.jar.mark_personalized();
    }
  }

  pub fn get(&self, name: &str) -> Option<String> {
    self.note_read();
    self.jar.get(name)
  }

  pub fn get_all(&self) -> Vec<(String, String)> {
    self.note_read();
    self.jar.get_all()
  }

  pub fn set(&self, name: &str, value: &str, options: CookieOptions) -> Result<(), CookieError> {
    self.jar.set(name, value, options)
  }

  pub fn delete(&self, name: &str, options: CookieOptions) -> Result<(), CookieError> {
    self.jar.delete(name, options)
  }
}

/// Argument of a server load.
#[derive(Clone)]
pub struct ServerLoadEvent {
  request: RequestEvent,
  tracker: LoadTracker,
  parent: ParentData,
}

impl ServerLoadEvent {
  pub(crate) fn new(request: RequestEvent, tracker: LoadTracker, parent: ParentData) -> Self {
    Self { request, tracker, parent }
  }

  /// Untracked access to the underlying request.
  pub fn request(&self) -> &RequestEvent {
    &self.request
  }

  pub fn url(&self) -> &Url {
    self.tracker.record_url();
    self.request.url()
  }

  pub fn search_param(&self, name: &str) -> Option<String> {
    self.tracker.record_search_param(name);
    self.request.url().search_param(name)
  }

  pub fn params(&self) -> &Params {
    self.tracker.record_params(self.request.params().keys());
    self.request.params()
  }

  pub fn param(&self, name: &str) -> Option<&str> {
    self.tracker.record_param(name);
    self.request.params().get(name).map(String::as_str)
  }

  pub fn route_id(&self) -> Option<&str> {
    self.tracker.record_route();
    self.request.route_id()
  }

  pub fn cookies(&self) -> TrackedCookies<'_> {
    TrackedCookies { jar: self.request.cookies(), tracker: &self.tracker }
  }

  pub fn local<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
    self.request.local()
  }

  pub fn platform(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
    self.request.platform()
  }

  pub fn env(&self) -> &BTreeMap<String, String> {
    self.request.env()
  }

  pub fn set_headers<'a>(
    &self,
    headers: impl IntoIterator<Item = (&'a str, &'a str)>,
  ) -> Result<(), LoadError> {
    self.request.set_headers(headers)
  }

  /// Fetch through the request-scoped fetcher, recording the target URL.
  pub fn fetch(&self, request: FetchRequest) -> BoxFuture<Result<FetchResponse, LoadError>> {
    if let Some(target) = self.request.url().join(&request.url) {
      self.tracker.record_fetch(&target.to_string());
    }
    self.request.fetcher().fetch(request, FetchMode::Server)
  }

  pub fn depends(&self, key: &str) {
    self.tracker.depends(key, self.request.url());
  }

  pub fn untrack<R>(&self, f: impl FnOnce() -> R) -> R {
    self.tracker.untrack(f)
  }

  /// Merged data of ancestor server loads.
  pub fn parent(
    &self,
  ) -> impl Future<Output = Result<Map<String, Value>, LoadError>> + Send + 'static {
    self.tracker.record_parent();
    let parent = self.parent.clone();
    async move { parent.await.map(|data| (*data).clone()) }
  }
}

/// What a universal load may observe; identical on server and client.
pub struct LoadScope {
  pub url: Url,
  pub params: Params,
  pub route_id: Option<String>,
  pub fetch: Arc<dyn Fetch>,
  /// Present while rendering on the server.
  pub request: Option<RequestEvent>,
}

/// Argument of a universal load.
#[derive(Clone)]
pub struct LoadEvent {
  scope: Arc<LoadScope>,
  data: Option<Arc<Map<String, Value>>>,
  tracker: LoadTracker,
  parent: ParentData,
}

impl LoadEvent {
  pub(crate) fn new(
    scope: Arc<LoadScope>,
    data: Option<Arc<Map<String, Value>>>,
    tracker: LoadTracker,
    parent: ParentData,
  ) -> Self {
    Self { scope, data, tracker, parent }
  }

  pub fn url(&self) -> &Url {
    self.tracker.record_url();
    &self.scope.url
  }

  pub fn search_param(&self, name: &str) -> Option<String> {
    self.tracker.record_search_param(name);
    self.scope.url.search_param(name)
  }

  pub fn params(&self) -> &Params {
    self.tracker.record_params(self.scope.params.keys());
    &self.scope.params
  }

  pub fn param(&self, name: &str) -> Option<&str> {
    self.tracker.record_param(name);
    self.scope.params.get(name).map(String::as_str)
  }

  pub fn route_id(&self) -> Option<&str> {
    self.tracker.record_route();
    self.scope.route_id.as_deref()
  }

  /// This node's own server data, if it has a server load.
  pub fn data(&self) -> Option<&Map<String, Value>> {
    self.data.as_deref()
  }

  pub fn is_server(&self) -> bool {
    self.scope.request.is_some()
  }

  /// Applied to the response on the server, ignored in the browser.
  pub fn set_headers<'a>(
    &self,
    headers: impl IntoIterator<Item = (&'a str, &'a str)>,
  ) -> Result<(), LoadError> {
    match &self.scope.request {
      Some(request) => request.set_headers(headers),
      None => Ok(()),
    }
  }

  pub fn fetch(&self, request: FetchRequest) -> BoxFuture<Result<FetchResponse, LoadError>> {
    if let Some(target) = self.scope.url.join(&request.url) {
      self.tracker.record_fetch(&target.to_string());
    }
    self.scope.fetch.fetch(request, FetchMode::Universal)
  }

  pub fn depends(&self, key: &str) {
    self.tracker.depends(key, &self.scope.url);
  }

  pub fn untrack<R>(&self, f: impl FnOnce() -> R) -> R {
    self.tracker.untrack(f)
  }

  /// Merged data of ancestor nodes (server and universal results).
  pub fn parent(
    &self,
  ) -> impl Future<Output = Result<Map<String, Value>, LoadError>> + Send + 'static {
    self.tracker.record_parent();
    let parent = self.parent.clone();
    async move { parent.await.map(|data| (*data).clone()) }
  }
}

#[cfg(test)]
mod tests;

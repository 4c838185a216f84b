/* src/server/core/rust/src/server/mod.rs */

mod fetcher;
mod render;
mod respond;

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{COOKIE, HOST};
use tracing::Instrument;

use crate::config::ServerOptions;
use crate::cookies::CookieJar;
use crate::errors::LoadError;
use crate::event::{RequestEvent, RequestInit};
use crate::fetch::{AbortSignal, FetchRequest, FetchResponse, NoNetwork, PlatformFetch};
use crate::hooks::{DefaultHooks, Hooks, Resolve, Response};
use crate::load::BoxFuture;
use crate::manifest::Manifest;
use crate::url::Url;

use fetcher::{FetchLog, ServerFetcher};
pub use render::{ClientOnly, PageRenderer, RenderContext, RenderedPage};

/// Host-supplied, per-request values that are not part of the HTTP request.
#[derive(Clone, Default)]
pub struct RequestContext {
  pub platform: Option<Arc<dyn Any + Send + Sync>>,
  /// Seeded once, never mutated by the pipeline.
  pub env: Arc<BTreeMap<String, String>>,
  pub abort: AbortSignal,
}

pub(crate) struct ServerInner {
  pub(crate) manifest: Arc<Manifest>,
  pub(crate) options: ServerOptions,
  pub(crate) hooks: Arc<dyn Hooks>,
  pub(crate) renderer: Arc<dyn PageRenderer>,
  pub(crate) platform: Arc<dyn PlatformFetch>,
}

/// Request pipeline over an immutable manifest. Cloning is cheap.
#[derive(Clone)]
pub struct Server {
  inner: Arc<ServerInner>,
}

impl Server {
  pub fn builder(manifest: Manifest) -> ServerBuilder {
    ServerBuilder::new(manifest)
  }

  pub fn manifest(&self) -> &Arc<Manifest> {
    &self.inner.manifest
  }

  pub fn options(&self) -> &ServerOptions {
    &self.inner.options
  }

  /// Resolve one request into a response. Never fails: errors are rendered.
  pub async fn respond(&self, request: http::Request<Bytes>, ctx: RequestContext) -> Response {
    self.inner.dispatch(request, ctx, 0).await
  }
}

pub struct ServerBuilder {
  manifest: Arc<Manifest>,
  options: ServerOptions,
  hooks: Arc<dyn Hooks>,
  renderer: Arc<dyn PageRenderer>,
  platform: Arc<dyn PlatformFetch>,
}

impl ServerBuilder {
  pub fn new(manifest: Manifest) -> Self {
    Self::shared(Arc::new(manifest))
  }

  /// Build over a manifest that is also handed to a client router.
  pub fn shared(manifest: Arc<Manifest>) -> Self {
    Self {
      manifest,
      options: ServerOptions::default(),
      hooks: Arc::new(DefaultHooks),
      renderer: Arc::new(ClientOnly),
      platform: Arc::new(NoNetwork),
    }
  }

  pub fn options(mut self, options: ServerOptions) -> Self {
    self.options = options;
    self
  }

  pub fn hooks(mut self, hooks: impl Hooks + 'static) -> Self {
    self.hooks = Arc::new(hooks);
    self
  }

  pub fn renderer(mut self, renderer: impl PageRenderer + 'static) -> Self {
    self.renderer = Arc::new(renderer);
    self
  }

  /// Network access for fetches that leave the app.
  pub fn platform_fetch(mut self, platform: impl PlatformFetch + 'static) -> Self {
    self.platform = Arc::new(platform);
    self
  }

  pub fn build(self) -> Server {
    Server {
      inner: Arc::new(ServerInner {
        manifest: self.manifest,
        options: self.options,
        hooks: self.hooks,
        renderer: self.renderer,
        platform: self.platform,
      }),
    }
  }
}

/// Absolute URL of an incoming request; origin-form targets use `Host`.
fn request_url(parts: &http::request::Parts) -> Option<Url> {
  let uri = &parts.uri;
  if uri.scheme().is_some() && uri.authority().is_some() {
    return Url::parse(&uri.to_string());
  }
  let host = parts.headers.get(HOST).and_then(|v| v.to_str().ok()).unwrap_or("localhost");
  let path = uri.path_and_query().map_or("/", |pq| pq.as_str());
  Url::from_origin(&format!("http://{host}"), path)
}

impl ServerInner {
  pub(crate) async fn dispatch(
    self: &Arc<Self>,
    request: http::Request<Bytes>,
    ctx: RequestContext,
    depth: usize,
  ) -> Response {
    let (parts, body) = request.into_parts();
    let Some(url) = request_url(&parts) else {
      return respond::plain(400, "Invalid request URL");
    };
    let span = tracing::info_span!(
      "request",
      method = %parts.method,
      path = url.pathname(),
      route = tracing::field::Empty,
      depth,
    );
    self.handle(parts, body, url, ctx, depth).instrument(span).await
  }

  /// Page path for a data request (`/a/__data.json` → `/a`).
  fn data_page_path(&self, path: &str) -> Option<String> {
    let rest = path.strip_suffix(self.options.data_suffix.as_str())?;
    let page = rest.strip_suffix('/')?;
    Some(if page.is_empty() { "/".to_string() } else { page.to_string() })
  }

  /// Whether a same-origin pathname is served by this app.
  pub(crate) fn owns_path(&self, pathname: &str) -> bool {
    let Some(path) = self.options.strip_base(pathname) else {
      return false;
    };
    let page = self.data_page_path(path);
    self.manifest.match_path(page.as_deref().unwrap_or(path)).is_some()
  }

  async fn handle(
    self: &Arc<Self>,
    parts: http::request::Parts,
    body: Bytes,
    url: Url,
    ctx: RequestContext,
    depth: usize,
  ) -> Response {
    let Some(path) = self.options.strip_base(url.pathname()).map(str::to_string) else {
      return respond::plain(404, "Not Found");
    };
    let base = self.options.base_path.trim_end_matches('/');

    let (path, url, invalidated) = match self.data_page_path(&path) {
      Some(page) => {
        let bits = url.search_param("x-invalidated");
        let query: Vec<String> = url
          .query()
          .unwrap_or_default()
          .split('&')
          .filter(|p| !p.is_empty() && !p.starts_with("x-invalidated="))
          .map(str::to_string)
          .collect();
        let page_url = url.with_path(&format!("{base}{page}")).with_query(Some(query.join("&")));
        (page, page_url, Some(bits.unwrap_or_default()))
      }
      None => (path, url, None),
    };

    if invalidated.is_none() && path.len() > 1 && path.ends_with('/') {
      let trimmed = match path.trim_end_matches('/') {
        "" => "/",
        p => p,
      };
      let target = url.with_path(&format!("{base}{trimmed}"));
      return respond::redirect(308, &target.path_and_query());
    }

    let (route_id, params) = match self.manifest.match_path(&path) {
      Some(m) => (Some(m.route.id().to_string()), m.params),
      None => (None, Default::default()),
    };
    if let Some(id) = &route_id {
      tracing::Span::current().record("route", id.as_str());
    }

    let cookie_header = parts.headers.get(COOKIE).and_then(|v| v.to_str().ok());
    let cookies = CookieJar::new(url.clone(), cookie_header);
    let log = FetchLog::default();
    let init = RequestInit {
      method: parts.method,
      headers: parts.headers,
      body,
      url,
      route_id,
      params,
      platform: ctx.platform,
      env: ctx.env,
      is_data_request: invalidated.is_some(),
      abort: ctx.abort,
    };
    let event = RequestEvent::new_cyclic(init, cookies, |weak| {
      Arc::new(ServerFetcher::new(Arc::clone(self), weak, depth, Arc::clone(&log)))
    });

    let this = Arc::clone(self);
    let resolve_event = event.clone();
    let resolve = Resolve::new(move || {
      let fut: BoxFuture<Result<Response, LoadError>> =
        Box::pin(async move { Ok(this.resolve(resolve_event, log, invalidated).await) });
      fut
    });
    let response = match self.hooks.handle(event.clone(), resolve).await {
      Ok(response) => response,
      Err(error) => self.error_response(&event, &error),
    };
    let response = self.finish(&event, response);
    tracing::debug!(status = response.status().as_u16(), "responded");
    response
  }

  /// In-process dispatch of a same-origin fetch issued during rendering.
  pub(crate) async fn dispatch_internal(
    self: &Arc<Self>,
    event: &RequestEvent,
    request: FetchRequest,
    depth: usize,
  ) -> Result<FetchResponse, LoadError> {
    let uri: http::Uri = request.url.parse().map_err(LoadError::unexpected)?;
    let mut inner = http::Request::new(request.body);
    *inner.method_mut() = request.method;
    *inner.uri_mut() = uri;
    *inner.headers_mut() = request.headers;
    let ctx = RequestContext {
      platform: event.platform().cloned(),
      env: Arc::new(event.env().clone()),
      abort: event.abort_signal().clone(),
    };
    let (parts, body) = self.dispatch(inner, ctx, depth).await.into_parts();
    Ok(FetchResponse { status: parts.status, headers: parts.headers, body: body.collect().await })
  }
}

#[cfg(test)]
mod tests;

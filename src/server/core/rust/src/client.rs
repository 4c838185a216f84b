/* src/server/core/rust/src/client.rs */

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::future::ready;
use futures_util::{StreamExt, stream};
use http::header::{AGE, CACHE_CONTROL, HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use loam_engine::{ChunkOutcome, DataLine, HydrationPayload, NodePayload, RecordedFetch};
use serde_json::{Map, Value, json};
use tokio::sync::watch;

use crate::cache::CacheDirectives;
use crate::config::ServerOptions;
use crate::deps::{Invalidation, LoadedNode, NavigationChange, Uses, plan_reruns, resolve_key};
use crate::errors::{HttpError, LoadError};
use crate::event::LoadScope;
use crate::fetch::{
  Fetch, FetchKey, FetchMode, FetchRequest, FetchResponse, Inflight, PlatformFetch,
};
use crate::load::{BoxFuture, BoxStream};
use crate::manifest::{Manifest, NodeDef};
use crate::matcher::Params;
use crate::orchestrate::{
  BranchOutcome, NodeResult, ServerNodeResult, node_slots, ready_server_slot, settle_branch,
};
use crate::server::{RequestContext, Server};
use crate::stream::{fill_deferred, placeholder_id};
use crate::url::Url;

const MAX_REDIRECTS: usize = 10;

/// Lines of one data response in arrival order.
pub type DataLines = BoxStream<Result<DataLine, LoadError>>;

/// Where the client router gets server-load data for a navigation.
pub trait ServerDataSource: Send + Sync {
  /// Stream `<url>/__data.json` for the nodes flagged in `invalidated`: the
  /// node line first, then deferred chunks as they settle.
  fn load(&self, url: &Url, invalidated: &[bool]) -> DataLines;
}

/// Data request URL: the page path plus the data suffix and the
/// `x-invalidated` bits.
pub fn data_url(url: &Url, suffix: &str, invalidated: &[bool]) -> Url {
  let path = url.pathname();
  let path = if path.ends_with('/') {
    format!("{path}{suffix}")
  } else {
    format!("{path}/{suffix}")
  };
  let bits: String = invalidated.iter().map(|b| if *b { '1' } else { '0' }).collect();
  let query = match url.query() {
    Some(q) => format!("{q}&x-invalidated={bits}"),
    None => format!("x-invalidated={bits}"),
  };
  url.with_path(&path).with_query(Some(query))
}

/// Talks to a `Server` in the same process: data requests and plain
/// fetches go through `Server::respond`.
#[derive(Clone)]
pub struct InProcess {
  server: Server,
}

impl InProcess {
  pub fn new(server: Server) -> Self {
    Self { server }
  }
}

impl ServerDataSource for InProcess {
  fn load(&self, url: &Url, invalidated: &[bool]) -> DataLines {
    let target = data_url(url, &self.server.options().data_suffix, invalidated);
    let server = self.server.clone();
    let body = async move {
      let request =
        http::Request::get(target.to_string()).body(Bytes::new()).map_err(LoadError::unexpected)?;
      Ok::<_, LoadError>(server.respond(request, RequestContext::default()).await.into_body())
    };
    stream::once(body)
      .flat_map(|body| match body {
        Ok(body) => body
          .into_lines()
          .filter(|line| ready(!line.trim_ascii().is_empty()))
          .map(|line| serde_json::from_slice::<DataLine>(&line).map_err(LoadError::from))
          .boxed(),
        Err(error) => stream::once(ready(Err(error))).boxed(),
      })
      .boxed()
  }
}

impl PlatformFetch for InProcess {
  fn send(&self, request: FetchRequest) -> BoxFuture<Result<FetchResponse, LoadError>> {
    let server = self.server.clone();
    Box::pin(async move {
      let uri: http::Uri = request.url.parse().map_err(LoadError::unexpected)?;
      let mut inner = http::Request::new(request.body);
      *inner.method_mut() = request.method;
      *inner.uri_mut() = uri;
      *inner.headers_mut() = request.headers;
      let (parts, body) = server.respond(inner, RequestContext::default()).await.into_parts();
      Ok(FetchResponse { status: parts.status, headers: parts.headers, body: body.collect().await })
    })
  }
}

struct CachedFetch {
  fetch: RecordedFetch,
  stored: Instant,
}

impl CachedFetch {
  /// Remaining freshness from `cache-control: max-age` minus `age`.
  fn fresh(&self) -> bool {
    let headers = &self.fetch.headers;
    let Some(max_age) =
      headers.get(CACHE_CONTROL.as_str()).and_then(|v| CacheDirectives::parse(v).max_age)
    else {
      return false;
    };
    let age = headers.get(AGE.as_str()).and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
    let ttl = Duration::from_secs(max_age.saturating_sub(age));
    self.stored.elapsed() < ttl
  }

  fn response(&self) -> FetchResponse {
    let mut headers = HeaderMap::new();
    for (name, value) in &self.fetch.headers {
      if let (Ok(name), Ok(value)) =
        (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str()))
      {
        headers.insert(name, value);
      }
    }
    let status = StatusCode::from_u16(self.fetch.status).unwrap_or(StatusCode::OK);
    FetchResponse { status, headers, body: Bytes::from(self.fetch.body.clone()) }
  }
}

/// Browser-side fetch shared by every navigation: replays responses
/// captured during server rendering and coalesces identical calls.
pub struct ClientFetch {
  transport: Arc<dyn PlatformFetch>,
  cache: Mutex<Vec<CachedFetch>>,
  hydrating: AtomicBool,
  inflight: Inflight,
}

impl ClientFetch {
  pub fn new(transport: Arc<dyn PlatformFetch>) -> Self {
    Self {
      transport,
      cache: Mutex::new(Vec::new()),
      hydrating: AtomicBool::new(false),
      inflight: Inflight::default(),
    }
  }

  fn cache(&self) -> MutexGuard<'_, Vec<CachedFetch>> {
    self.cache.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn seed(&self, fetches: Vec<RecordedFetch>) {
    let stored = Instant::now();
    let mut cache = self.cache();
    cache.clear();
    cache.extend(fetches.into_iter().map(|fetch| CachedFetch { fetch, stored }));
  }

  pub fn clear(&self) {
    self.cache().clear();
  }

  fn cached(&self, method: &str, href: &str, body: &Bytes) -> Option<FetchResponse> {
    let hydrating = self.hydrating.load(Ordering::SeqCst);
    let request_body = (!body.is_empty()).then(|| String::from_utf8_lossy(body).into_owned());
    let mut cache = self.cache();
    cache.retain(|c| hydrating || c.fresh());
    cache
      .iter()
      .find(|c| {
        c.fetch.url == href && c.fetch.method == method && c.fetch.request_body == request_body
      })
      .map(CachedFetch::response)
  }

  fn fetch_from(
    &self,
    base: &Url,
    mut request: FetchRequest,
  ) -> BoxFuture<Result<FetchResponse, LoadError>> {
    let Some(target) = base.join(&request.url) else {
      let url = request.url;
      return Box::pin(async move {
        Err(LoadError::unexpected(anyhow::anyhow!("invalid fetch url `{url}`")))
      });
    };
    let href = target.to_string();
    if let Some(hit) = self.cached(request.method.as_str(), &href, &request.body) {
      tracing::debug!(url = %href, "served fetch from hydration cache");
      return Box::pin(async move { Ok(hit) });
    }
    request.url.clone_from(&href);
    let key = FetchKey::new(&request.method, &href, &request.body);
    let transport = Arc::clone(&self.transport);
    self.inflight.run(key, move || transport.send(request))
  }
}

/// `fetch` of one navigation, resolving relative URLs against its page.
struct NavigationFetch {
  shared: Arc<ClientFetch>,
  base: Url,
}

impl Fetch for NavigationFetch {
  fn fetch(
    &self,
    request: FetchRequest,
    _mode: FetchMode,
  ) -> BoxFuture<Result<FetchResponse, LoadError>> {
    self.shared.fetch_from(&self.base, request)
  }
}

#[derive(Debug)]
struct PageNodes {
  nodes: Vec<Arc<NodeResult>>,
  /// Chunks may still arrive.
  open: bool,
}

/// Server data of `node` and its merged data with one deferred field filled.
fn fill_node(node: &NodeResult, key: &str, id: u64, value: &Value) -> Option<NodeResult> {
  let server = node.server.as_ref()?;
  let mut server_data = server.data.clone();
  if !fill_deferred(&mut server_data, key, id, value.clone()) {
    return None;
  }
  let mut data = node.data.clone();
  fill_deferred(&mut data, key, id, value.clone());
  Some(NodeResult {
    data,
    server: Some(Arc::new(ServerNodeResult { data: server_data, uses: server.uses.clone() })),
    universal_uses: node.universal_uses.clone(),
  })
}

fn has_placeholder(node: &NodeResult) -> bool {
  node.server.as_ref().is_some_and(|s| s.data.values().any(|v| placeholder_id(v).is_some()))
}

/// The page the router currently shows. Deferred fields arrive after the
/// page is committed; `data()` reflects every chunk applied so far.
#[derive(Debug, Clone)]
pub struct ClientPage {
  pub url: Url,
  pub route_id: Option<String>,
  pub params: Params,
  /// Ids of the rendered nodes; shorter than the branch on error pages.
  pub node_ids: Vec<String>,
  pub form: Option<Value>,
  pub error: Option<Value>,
  pub status: u16,
  /// Nodes whose server data came with this page and may receive chunks.
  streamed: Vec<bool>,
  nodes: Arc<watch::Sender<PageNodes>>,
}

impl ClientPage {
  fn new(url: Url, nodes: Vec<Arc<NodeResult>>, streamed: Vec<bool>) -> Self {
    Self {
      url,
      route_id: None,
      params: Params::new(),
      node_ids: Vec::new(),
      form: None,
      error: None,
      status: 200,
      streamed,
      nodes: Arc::new(watch::Sender::new(PageNodes { nodes, open: false })),
    }
  }

  fn blank(url: Url) -> Self {
    Self::new(url, Vec::new(), Vec::new())
  }

  fn failed(url: Url, status: u16, error: Value) -> Self {
    Self { error: Some(error), status, ..Self::blank(url) }
  }

  /// Current state of every rendered node.
  pub fn nodes(&self) -> Vec<Arc<NodeResult>> {
    self.nodes.borrow().nodes.clone()
  }

  /// Merged data of every rendered node.
  pub fn data(&self) -> Map<String, Value> {
    let mut merged = Map::new();
    for node in &self.nodes.borrow().nodes {
      for (k, v) in &node.data {
        merged.insert(k.clone(), v.clone());
      }
    }
    merged
  }

  fn pending_in(&self, nodes: &[Arc<NodeResult>]) -> usize {
    nodes
      .iter()
      .zip(&self.streamed)
      .filter(|(node, streamed)| **streamed && has_placeholder(node))
      .count()
  }

  /// Nodes still holding a deferred placeholder.
  pub fn pending(&self) -> usize {
    self.pending_in(&self.nodes.borrow().nodes)
  }

  /// Fill a deferred field from a `chunk` line, streamed by a data request
  /// or read from a `data-loam-chunk` script of the server-rendered page.
  /// Returns false when no placeholder matches.
  pub fn apply_chunk(&self, line: &DataLine) -> bool {
    let DataLine::Chunk { id, key, outcome } = line else {
      return false;
    };
    let value = match outcome {
      ChunkOutcome::Data(value) => value.clone(),
      ChunkOutcome::Error(error) => json!({ "error": error }),
    };
    self.nodes.send_if_modified(|state| {
      for (node, streamed) in state.nodes.iter_mut().zip(&self.streamed) {
        if !*streamed {
          continue;
        }
        if let Some(filled) = fill_node(node, key, *id, &value) {
          *node = Arc::new(filled);
          return true;
        }
      }
      false
    })
  }

  fn open(&self) {
    self.nodes.send_modify(|state| state.open = true);
  }

  /// No more chunks will arrive; unfilled placeholders stay in place.
  pub fn finish(&self) {
    self.nodes.send_if_modified(|state| std::mem::replace(&mut state.open, false));
  }

  /// Wait until every deferred field has arrived or its stream ended.
  pub async fn settled(&self) {
    let mut rx = self.nodes.subscribe();
    let _ = rx.wait_for(|state| !state.open || self.pending_in(&state.nodes) == 0).await;
  }
}

async fn stream_chunks(page: Arc<ClientPage>, mut lines: DataLines) {
  while let Some(line) = lines.next().await {
    match line {
      Ok(DataLine::End) => break,
      Ok(line) => {
        if !page.apply_chunk(&line) {
          tracing::debug!(?line, "data line matched no deferred field");
        }
      }
      Err(error) => {
        tracing::warn!(%error, "data stream failed");
        break;
      }
    }
  }
  page.finish();
}

#[derive(Debug, Clone)]
pub enum NavigationOutcome {
  Rendered(Arc<ClientPage>),
  /// A redirect left the app's origin; the host performs a full load.
  External(String),
  /// A newer navigation started first, or there was nothing to rerun.
  Cancelled,
}

enum Step {
  /// A page plus the rest of its data response, if chunks may follow.
  Page(ClientPage, Option<DataLines>),
  Redirect(String),
}

fn client_error(error: &LoadError) -> (u16, Value) {
  match error {
    LoadError::Http(e) => (e.status(), e.to_body()),
    LoadError::Redirect(r) => (r.status, json!({ "location": r.location })),
    LoadError::Unexpected(err) => {
      tracing::error!(error = %err, "unexpected error during client navigation");
      (500, json!({ "message": "Internal Error" }))
    }
  }
}

fn error_from_body(status: u16, body: Value) -> LoadError {
  let message = body.get("message").and_then(Value::as_str).unwrap_or("Error").to_string();
  HttpError::status_only(status, message).with_body(body).into()
}

type ServerResult = Result<Option<Arc<ServerNodeResult>>, LoadError>;

/// Fold a data response into `server`. Returns the redirect target, if any.
fn apply_data_lines(
  lines: Vec<DataLine>,
  invalidated: &[bool],
  server: &mut [ServerResult],
) -> Option<String> {
  let mut fresh: Vec<Option<(Map<String, Value>, Uses)>> = vec![None; server.len()];
  let mut loaded = vec![false; server.len()];
  let mut chunks = Vec::new();
  for line in lines {
    match line {
      DataLine::Nodes { nodes: payloads } => {
        for (i, payload) in payloads.into_iter().enumerate().take(server.len()) {
          match payload {
            NodePayload::Skip => {}
            NodePayload::Data { data, uses } => {
              loaded[i] = true;
              if let Value::Object(data) = data {
                fresh[i] = Some((data, serde_json::from_value(uses).unwrap_or_default()));
              }
            }
            NodePayload::Error { status, error } => server[i] = Err(error_from_body(status, error)),
          }
        }
      }
      DataLine::Chunk { id, key, outcome } => chunks.push((id, key, outcome)),
      DataLine::Redirect { location, .. } => return Some(location),
      DataLine::Error { status, error } => {
        if let Some(first) = invalidated.iter().position(|b| *b) {
          server[first] = Err(error_from_body(status, error));
        }
      }
      DataLine::End => {}
    }
  }
  for (id, key, outcome) in chunks {
    let value = match outcome {
      ChunkOutcome::Data(value) => value,
      ChunkOutcome::Error(error) => json!({ "error": error }),
    };
    for (data, _) in fresh.iter_mut().flatten() {
      if fill_deferred(data, &key, id, value.clone()) {
        break;
      }
    }
  }
  for (i, entry) in fresh.into_iter().enumerate() {
    if server[i].is_err() {
      continue;
    }
    if let Some((data, uses)) = entry {
      server[i] = Ok(Some(Arc::new(ServerNodeResult { data, uses })));
    } else if loaded[i] {
      server[i] = Ok(None);
    }
  }
  None
}

/// Client-side router: runs the same matcher, orchestrator and tracker as
/// the server against the shared manifest, reusing still-valid data.
pub struct ClientRouter {
  manifest: Arc<Manifest>,
  options: ServerOptions,
  data: Arc<dyn ServerDataSource>,
  fetch: Arc<ClientFetch>,
  current: Mutex<Option<Arc<ClientPage>>>,
  latest: AtomicU64,
}

impl ClientRouter {
  pub fn new(
    manifest: Arc<Manifest>,
    data: impl ServerDataSource + 'static,
    transport: impl PlatformFetch + 'static,
  ) -> Self {
    Self {
      manifest,
      options: ServerOptions::default(),
      data: Arc::new(data),
      fetch: Arc::new(ClientFetch::new(Arc::new(transport))),
      current: Mutex::new(None),
      latest: AtomicU64::new(0),
    }
  }

  /// Router backed by a server in the same process.
  pub fn in_process(server: &Server) -> Self {
    let remote = InProcess::new(server.clone());
    Self::new(Arc::clone(server.manifest()), remote.clone(), remote)
      .options(server.options().clone())
  }

  /// Routing options shared with the server, notably `base_path`.
  pub fn options(mut self, options: ServerOptions) -> Self {
    self.options = options;
    self
  }

  pub fn current(&self) -> Option<Arc<ClientPage>> {
    self.current.lock().unwrap_or_else(PoisonError::into_inner).clone()
  }

  fn begin(&self) -> u64 {
    self.latest.fetch_add(1, Ordering::SeqCst) + 1
  }

  fn is_latest(&self, id: u64) -> bool {
    self.latest.load(Ordering::SeqCst) == id
  }

  /// Resume from a server render: server data comes from the payload and
  /// universal loads replay the recorded fetches. Deferred fields stay
  /// placeholders until the host passes the page's `data-loam-chunk` lines
  /// to `ClientPage::apply_chunk`, then calls `ClientPage::finish`.
  pub async fn hydrate(&self, payload: HydrationPayload) -> NavigationOutcome {
    let id = self.begin();
    let Some(url) = Url::parse(&payload.url) else {
      tracing::warn!(url = %payload.url, "hydration payload carries an invalid url");
      return NavigationOutcome::Cancelled;
    };
    let branch: Vec<Arc<NodeDef>> = payload
      .route
      .as_deref()
      .and_then(|route| self.manifest.route(route))
      .and_then(|route| route.page.clone())
      .unwrap_or_default();
    let shown = payload.nodes.len().min(branch.len());
    let branch = &branch[..shown];

    let server: Vec<_> = payload.nodes[..shown]
      .iter()
      .map(|node| {
        let result = node.as_ref().and_then(|n| match &n.data {
          Value::Object(data) => Some(Arc::new(ServerNodeResult {
            data: data.clone(),
            uses: serde_json::from_value(n.uses.clone()).unwrap_or_default(),
          })),
          _ => None,
        });
        ready_server_slot(Ok(result))
      })
      .collect();

    self.fetch.seed(payload.fetches);
    self.fetch.hydrating.store(true, Ordering::SeqCst);
    let scope = self.scope(&url, &payload.params, payload.route.as_deref());
    let outcome = settle_branch(branch, node_slots(branch, &scope, &server, &[])).await;
    self.fetch.hydrating.store(false, Ordering::SeqCst);

    let route = payload.route.clone();
    let streamed = payload.nodes[..shown].iter().map(Option::is_some).collect();
    let step = Self::page_from_outcome(outcome, branch, &url, route, payload.params, streamed);
    let step = match step {
      Step::Page(mut page, _) => {
        if page.error.is_none() {
          page.error = payload.error;
          page.status = payload.status;
        }
        page.form = payload.form;
        if page.pending() > 0 {
          page.open();
        }
        Step::Page(page, None)
      }
      redirect => redirect,
    };
    self.commit(id, url, step, &[]).await
  }

  /// Client-side navigation to `href`, resolved against the current page.
  pub async fn navigate(&self, href: &str) -> NavigationOutcome {
    let id = self.begin();
    let base = self.current().map(|page| page.url.clone());
    let url = match &base {
      Some(base) => base.join(href),
      None => Url::parse(href),
    };
    let Some(url) = url else {
      return NavigationOutcome::External(href.to_string());
    };
    if base.as_ref().is_some_and(|b| !b.same_origin(&url)) {
      return NavigationOutcome::External(url.to_string());
    }
    let step = self.load(&url, &[]).await;
    self.commit(id, url, step, &[]).await
  }

  /// Rerun loads that depend on `key` (a custom key or a URL).
  pub async fn invalidate(&self, key: &str) -> NavigationOutcome {
    let Some(page) = self.current() else {
      return NavigationOutcome::Cancelled;
    };
    let key = resolve_key(key, &page.url);
    self.rerun(vec![Invalidation::Key(key)]).await
  }

  /// Rerun loads whose dependencies satisfy `predicate`.
  pub async fn invalidate_where(
    &self,
    predicate: impl Fn(&str) -> bool + Send + Sync + 'static,
  ) -> NavigationOutcome {
    self.rerun(vec![Invalidation::predicate(predicate)]).await
  }

  /// Rerun every load of the current page.
  pub async fn invalidate_all(&self) -> NavigationOutcome {
    self.rerun(vec![Invalidation::All]).await
  }

  async fn rerun(&self, invalidations: Vec<Invalidation>) -> NavigationOutcome {
    let Some(page) = self.current() else {
      return NavigationOutcome::Cancelled;
    };
    let id = self.begin();
    self.fetch.clear();
    let url = page.url.clone();
    let step = self.load(&url, &invalidations).await;
    self.commit(id, url, step, &invalidations).await
  }

  /// Publish the result of navigation `id`, following same-origin
  /// redirects. Superseded navigations are discarded.
  async fn commit(
    &self,
    id: u64,
    mut url: Url,
    mut step: Step,
    invalidations: &[Invalidation],
  ) -> NavigationOutcome {
    for _ in 0..MAX_REDIRECTS {
      if !self.is_latest(id) {
        tracing::debug!(id, "discarded superseded navigation");
        return NavigationOutcome::Cancelled;
      }
      match step {
        Step::Page(page, lines) => {
          let page = Arc::new(page);
          *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&page));
          if let Some(lines) = lines
            && page.pending() > 0
          {
            page.open();
            tokio::spawn(stream_chunks(Arc::clone(&page), lines));
          }
          return NavigationOutcome::Rendered(page);
        }
        Step::Redirect(location) => match url.join(&location) {
          Some(next) if next.same_origin(&url) => {
            tracing::debug!(%location, "following redirect");
            url = next;
            step = self.load(&url, invalidations).await;
          }
          _ => return NavigationOutcome::External(location),
        },
      }
    }
    let error = json!({ "message": "Too many redirects" });
    let page = Arc::new(ClientPage::failed(url, 500, error));
    if self.is_latest(id) {
      *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&page));
    }
    NavigationOutcome::Rendered(page)
  }

  fn scope(&self, url: &Url, params: &Params, route_id: Option<&str>) -> Arc<LoadScope> {
    Arc::new(LoadScope {
      url: url.clone(),
      params: params.clone(),
      route_id: route_id.map(str::to_string),
      fetch: Arc::new(NavigationFetch { shared: Arc::clone(&self.fetch), base: url.clone() }),
      request: None,
    })
  }

  async fn load(&self, url: &Url, invalidations: &[Invalidation]) -> Step {
    let not_found = || {
      let error = HttpError::not_found(format!("Not found: {}", url.pathname())).to_body();
      Step::Page(ClientPage::failed(url.clone(), 404, error), None)
    };
    let Some(path) = self.options.strip_base(url.pathname()) else {
      return not_found();
    };
    let Some(matched) = self.manifest.match_path(path) else {
      return not_found();
    };
    let Some(branch) = matched.route.page.clone() else {
      return not_found();
    };
    let route_id = matched.route.id().to_string();
    let params = matched.params;

    let previous = self.current();
    let empty = ClientPage::blank(url.clone());
    let prev = previous.as_deref().unwrap_or(&empty);
    let prev_nodes = prev.nodes();
    let combined: Vec<Option<Uses>> = prev_nodes
      .iter()
      .map(|n| match (n.server.as_ref().map(|s| &s.uses), n.universal_uses.as_ref()) {
        (Some(a), Some(b)) => Some(a.merge(b)),
        (Some(a), None) | (None, Some(a)) => Some(a.clone()),
        (None, None) => None,
      })
      .collect();
    let loaded: Vec<LoadedNode<'_>> = prev
      .node_ids
      .iter()
      .zip(&combined)
      .map(|(id, uses)| LoadedNode { id, uses: uses.as_ref() })
      .collect();
    let next_ids: Vec<&str> = branch.iter().map(|n| n.id.as_str()).collect();
    let change = NavigationChange {
      from_url: &prev.url,
      to_url: url,
      from_params: &prev.params,
      to_params: &params,
      from_route: prev.route_id.as_deref(),
      to_route: Some(route_id.as_str()),
    };
    let mut plan = plan_reruns(&loaded, &next_ids, Some(&change), invalidations);
    // A node still waiting for deferred chunks reruns, and so does every
    // node below it.
    if prev.nodes.borrow().open
      && let Some(first) = (0..plan.len()).find(|&i| {
        prev.streamed.get(i).copied().unwrap_or(false)
          && prev_nodes.get(i).is_some_and(|node| has_placeholder(node))
      })
    {
      plan[first..].iter_mut().for_each(|rerun| *rerun = true);
    }

    let mut server: Vec<ServerResult> = plan
      .iter()
      .enumerate()
      .map(|(i, rerun)| match (*rerun, prev_nodes.get(i)) {
        (false, Some(node)) => Ok(node.server.clone()),
        _ => Ok(None),
      })
      .collect();
    let invalidated: Vec<bool> =
      plan.iter().zip(&branch).map(|(rerun, node)| *rerun && node.server_load.is_some()).collect();
    let mut rest = None;
    if let Some(first) = invalidated.iter().position(|b| *b) {
      let mut lines = self.data.load(url, &invalidated);
      match lines.next().await {
        Some(Ok(head)) => {
          if let Some(location) = apply_data_lines(vec![head], &invalidated, &mut server) {
            return Step::Redirect(location);
          }
          rest = Some(lines);
        }
        Some(Err(error)) => server[first] = Err(error),
        None => {
          server[first] = Err(LoadError::unexpected(anyhow::anyhow!("empty data response")));
        }
      }
    }

    let reuse: Vec<Option<Arc<NodeResult>>> = plan
      .iter()
      .enumerate()
      .map(|(i, rerun)| if *rerun { None } else { prev_nodes.get(i).cloned() })
      .collect();
    let slots: Vec<_> = server.into_iter().map(ready_server_slot).collect();
    let scope = self.scope(url, &params, Some(&route_id));
    let outcome = settle_branch(&branch, node_slots(&branch, &scope, &slots, &reuse)).await;
    match Self::page_from_outcome(outcome, &branch, url, Some(route_id), params, invalidated) {
      Step::Page(page, _) => Step::Page(page, rest),
      redirect => redirect,
    }
  }

  fn page_from_outcome(
    outcome: BranchOutcome,
    branch: &[Arc<NodeDef>],
    url: &Url,
    route_id: Option<String>,
    params: Params,
    streamed: Vec<bool>,
  ) -> Step {
    let page = |nodes: Vec<Arc<NodeResult>>, error: Option<Value>, status: u16| ClientPage {
      route_id,
      params,
      node_ids: branch.iter().take(nodes.len()).map(|n| n.id.clone()).collect(),
      error,
      status,
      ..ClientPage::new(url.clone(), nodes, streamed)
    };
    match outcome {
      BranchOutcome::Complete(nodes) => Step::Page(page(nodes, None, 200), None),
      BranchOutcome::Redirect(r) => Step::Redirect(r.location),
      BranchOutcome::Error { error, nodes, .. } => {
        let (status, body) = client_error(&error);
        Step::Page(page(nodes, Some(body), status), None)
      }
    }
  }
}

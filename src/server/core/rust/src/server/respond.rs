/* src/server/core/rust/src/server/respond.rs */

use std::sync::{Arc, PoisonError};

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream;
use http::header::{CACHE_CONTROL, CONTENT_TYPE, LOCATION, SET_COOKIE};
use http::{HeaderValue, Method, StatusCode};
use loam_engine::{
  ChunkOutcome, DataLine, HydrationNode, HydrationPayload, NodePayload, assemble_document,
  chunk_script, default_error_page, encode_line, inject_data_script, script_safe_json,
  split_for_stream,
};
use serde_json::{Map, Value, json};

use super::ServerInner;
use super::fetcher::FetchLog;
use super::render::RenderContext;
use crate::actions::{ActionOutcome, action_name};
use crate::body::Body;
use crate::cache::resolve_cache_control;
use crate::errors::{HttpError, LoadError};
use crate::event::{LoadScope, RequestEvent};
use crate::hooks::{Response, error_body};
use crate::manifest::{EndpointDef, NodeDef, RouteDef};
use crate::orchestrate::{
  BranchOutcome, NodeResult, ServerNodeOutcome, find_boundary, load_branch, load_server_data,
};
use crate::stream::{DeferredChunk, DeferredRegistry, deferred_stream, serialize};

const HTML: &str = "text/html; charset=utf-8";
const NDJSON: &str = "application/x-ndjson";
const JSON: &str = "application/json";
const TEXT: &str = "text/plain; charset=utf-8";

fn response(status: u16, content_type: &'static str, body: Body) -> Response {
  let mut response = http::Response::new(body);
  *response.status_mut() =
    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
  response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
  response
}

pub(super) fn plain(status: u16, text: &'static str) -> Response {
  response(status, TEXT, Body::from(text))
}

pub(super) fn redirect(status: u16, location: &str) -> Response {
  let mut res = response(status, TEXT, Body::empty());
  if let Ok(value) = HeaderValue::try_from(location) {
    res.headers_mut().insert(LOCATION, value);
  }
  res
}

fn json_response(status: u16, body: &Value) -> Response {
  response(status, JSON, Body::from(body.to_string()))
}

fn method_not_allowed(allow: &str) -> Response {
  let mut res = plain(405, "Method Not Allowed");
  if let Ok(value) = HeaderValue::try_from(allow) {
    res.headers_mut().insert(http::header::ALLOW, value);
  }
  res
}

fn accepts(event: &RequestEvent, mime: &str) -> bool {
  event.header("accept").is_some_and(|accept| accept.contains(mime))
}

/// How a matched route serves this request.
enum Target<'a> {
  Page(&'a [Arc<NodeDef>]),
  Endpoint(&'a EndpointDef),
  NotAllowed(String),
}

/// Pages answer GET/HEAD from browsers and POST when the page has actions;
/// everything else goes to the route's endpoint if it has one.
fn select_target<'a>(route: &'a RouteDef, event: &RequestEvent) -> Target<'a> {
  let method = event.method();
  let reads = *method == Method::GET || *method == Method::HEAD;
  if let Some(branch) = route.page.as_deref() {
    let has_actions = branch.last().is_some_and(|leaf| !leaf.actions.is_empty());
    let page_wants = (reads && (route.endpoint.is_none() || accepts(event, "text/html")))
      || (*method == Method::POST && has_actions);
    if page_wants {
      return Target::Page(branch);
    }
    if route.endpoint.is_none() {
      let allow = if has_actions { "GET, HEAD, POST" } else { "GET, HEAD" };
      return Target::NotAllowed(allow.to_string());
    }
  }
  match &route.endpoint {
    Some(endpoint) => Target::Endpoint(endpoint),
    None => Target::NotAllowed(String::new()),
  }
}

/// `x-invalidated` bits: `1` reruns the node. Missing positions rerun.
fn invalidated_nodes(bits: &str, len: usize) -> Vec<bool> {
  let mut chars = bits.chars();
  (0..len).map(|_| chars.next().is_none_or(|c| c == '1')).collect()
}

/// One rendered document: the branch prefix shown and its node results.
struct PageState<'a> {
  branch: &'a [Arc<NodeDef>],
  nodes: &'a [Arc<NodeResult>],
  form: Option<&'a Value>,
  error: Option<&'a Value>,
  status: u16,
}

impl ServerInner {
  pub(super) async fn resolve(
    self: Arc<Self>,
    event: RequestEvent,
    log: FetchLog,
    invalidated: Option<String>,
  ) -> Response {
    let manifest = Arc::clone(&self.manifest);
    let route = event.route_id().and_then(|id| manifest.route(id));

    if let Some(bits) = invalidated {
      return match route.and_then(|r| r.page.as_deref()) {
        Some(branch) => self.data_response(&event, branch, &bits).await,
        None => self.data_error(&event, &HttpError::not_found("Not Found").into()),
      };
    }

    let Some(route) = route else {
      let root: Vec<Arc<NodeDef>> = manifest.root().cloned().into_iter().collect();
      let error = HttpError::not_found(format!("Not found: {}", event.url().pathname()));
      return self.error_page(&event, &log, &root, &error.into()).await;
    };
    match select_target(route, &event) {
      Target::Endpoint(endpoint) => self.endpoint_response(&event, endpoint).await,
      Target::Page(branch) if *event.method() == Method::POST => {
        self.action_response(&event, branch, &log).await
      }
      Target::Page(branch) => self.page_response(&event, branch, &log, None, 200).await,
      Target::NotAllowed(allow) => method_not_allowed(&allow),
    }
  }

  /// Status and public body of an error. Unexpected errors go through
  /// `handle_error` and lose their message unless errors are exposed.
  pub(super) fn public_error(&self, event: &RequestEvent, error: &LoadError) -> (u16, Value) {
    match error {
      LoadError::Http(e) => (e.status(), e.to_body()),
      LoadError::Redirect(r) => (r.status, json!({ "location": r.location })),
      LoadError::Unexpected(err) => {
        let message = if self.options.expose_errors {
          format!("{err:#}")
        } else {
          self.options.generic_error_message.clone()
        };
        let custom = self.hooks.handle_error(error, event, 500, &message);
        (500, error_body(custom, &message))
      }
    }
  }

  /// Response for an error escaping `handle` or `resolve`.
  pub(super) fn error_response(&self, event: &RequestEvent, error: &LoadError) -> Response {
    if let LoadError::Redirect(r) = error {
      return redirect(r.status, &r.location);
    }
    if event.is_data_request() {
      return self.data_error(event, error);
    }
    let (status, body) = self.public_error(event, error);
    if accepts(event, JSON) && !accepts(event, "text/html") {
      return json_response(status, &body);
    }
    fallback_page(status, &body)
  }

  async fn endpoint_response(&self, event: &RequestEvent, endpoint: &EndpointDef) -> Response {
    let Some(handler) = endpoint.resolve(event.method()) else {
      return method_not_allowed(&endpoint.allowed().join(", "));
    };
    match handler(event.clone()).await {
      Ok(res) => res.map(Body::Full),
      Err(LoadError::Redirect(r)) => redirect(r.status, &r.location),
      Err(error) => {
        let (status, body) = self.public_error(event, &error);
        json_response(status, &body)
      }
    }
  }

  fn chunk_line(&self, event: &RequestEvent, chunk: DeferredChunk) -> DataLine {
    let outcome = match chunk.outcome {
      Ok(value) => ChunkOutcome::Data(value),
      Err(error) => ChunkOutcome::Error(self.public_error(event, &error).1),
    };
    DataLine::Chunk { id: chunk.id, key: chunk.key, outcome }
  }

  fn data_error(&self, event: &RequestEvent, error: &LoadError) -> Response {
    let (status, line) = match error {
      LoadError::Redirect(r) => {
        (200, DataLine::Redirect { status: r.status, location: r.location.clone() })
      }
      _ => {
        let (status, body) = self.public_error(event, error);
        (status, DataLine::Error { status, error: body })
      }
    };
    response(status, NDJSON, Body::from(encode_line(&line)))
  }

  /// `__data.json`: server data of the invalidated nodes as NDJSON, then
  /// their deferred chunks in settle order, then the end marker.
  async fn data_response(
    self: &Arc<Self>,
    event: &RequestEvent,
    branch: &[Arc<NodeDef>],
    bits: &str,
  ) -> Response {
    let include = invalidated_nodes(bits, branch.len());
    let registry = DeferredRegistry::new();
    let outcomes = load_server_data(branch, event, &registry, &include).await;

    let mut nodes = Vec::with_capacity(outcomes.len());
    let mut eager = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
      match outcome {
        ServerNodeOutcome::Skipped => {
          nodes.push(NodePayload::Skip);
          eager.push(None);
        }
        ServerNodeOutcome::Loaded(None) => {
          nodes.push(NodePayload::Data { data: Value::Null, uses: Value::Null });
          eager.push(None);
        }
        ServerNodeOutcome::Loaded(Some(result)) => {
          nodes.push(NodePayload::Data {
            data: Value::Object(result.data.clone()),
            uses: serde_json::to_value(&result.uses).unwrap_or(Value::Null),
          });
          eager.push(Some(result.data.clone()));
        }
        ServerNodeOutcome::Failed(LoadError::Redirect(r)) => {
          return self.data_error(event, &LoadError::Redirect(r));
        }
        ServerNodeOutcome::Failed(error) => {
          let (status, body) = self.public_error(event, &error);
          nodes.push(NodePayload::Error { status, error: body });
          eager.push(None);
        }
      }
    }

    let serialized = serialize(eager, &registry);
    let head = encode_line(&DataLine::Nodes { nodes });
    let end = encode_line(&DataLine::End);
    if serialized.pending == 0 {
      return response(200, NDJSON, Body::from(head + &end));
    }
    let this = Arc::clone(self);
    let event = event.clone();
    let chunks = serialized.deferred.map(move |chunk| encode_line(&this.chunk_line(&event, chunk)));
    let body = stream::once(async move { head })
      .chain(chunks)
      .chain(stream::once(async move { end }))
      .map(Bytes::from)
      .boxed();
    response(200, NDJSON, Body::Stream(body))
  }

  fn load_scope(event: &RequestEvent) -> Arc<LoadScope> {
    Arc::new(LoadScope {
      url: event.url().clone(),
      params: event.params().clone(),
      route_id: event.route_id().map(str::to_string),
      fetch: Arc::clone(event.fetcher()),
      request: Some(event.clone()),
    })
  }

  async fn page_response(
    self: &Arc<Self>,
    event: &RequestEvent,
    branch: &[Arc<NodeDef>],
    log: &FetchLog,
    form: Option<Value>,
    status: u16,
  ) -> Response {
    let registry = DeferredRegistry::new();
    let scope = Self::load_scope(event);
    tracing::debug!(nodes = branch.len(), "loading branch");
    match load_branch(branch, event, &scope, &registry).await {
      BranchOutcome::Complete(nodes) => {
        let state = PageState { branch, nodes: &nodes, form: form.as_ref(), error: None, status };
        self.render(event, log, &registry, &state)
      }
      BranchOutcome::Redirect(r) => redirect(r.status, &r.location),
      BranchOutcome::Error { error, boundary: Some(b), nodes, failed_at } => {
        tracing::debug!(failed_at, boundary = b, "rendering error boundary");
        let (status, body) = self.public_error(event, &error);
        let state = PageState {
          branch: &branch[..=b],
          nodes: &nodes,
          form: None,
          error: Some(&body),
          status,
        };
        self.render(event, log, &registry, &state)
      }
      BranchOutcome::Error { error, boundary: None, .. } => {
        let (status, body) = self.public_error(event, &error);
        fallback_page(status, &body)
      }
    }
  }

  /// Render `branch` (a boundary and its ancestors) around an error raised
  /// outside the branch loads.
  async fn error_page(
    self: &Arc<Self>,
    event: &RequestEvent,
    log: &FetchLog,
    branch: &[Arc<NodeDef>],
    error: &LoadError,
  ) -> Response {
    if let LoadError::Redirect(r) = error {
      return redirect(r.status, &r.location);
    }
    let (status, body) = self.public_error(event, error);
    if branch.is_empty() {
      return fallback_page(status, &body);
    }
    let registry = DeferredRegistry::new();
    let scope = Self::load_scope(event);
    match load_branch(branch, event, &scope, &registry).await {
      BranchOutcome::Complete(nodes) => {
        let state = PageState { branch, nodes: &nodes, form: None, error: Some(&body), status };
        self.render(event, log, &registry, &state)
      }
      BranchOutcome::Redirect(r) => redirect(r.status, &r.location),
      BranchOutcome::Error { .. } => fallback_page(status, &body),
    }
  }

  async fn action_response(
    self: &Arc<Self>,
    event: &RequestEvent,
    branch: &[Arc<NodeDef>],
    log: &FetchLog,
  ) -> Response {
    let result = match action_name(event.url().query()) {
      Ok(name) => match branch.last().and_then(|leaf| leaf.actions.get(&name)) {
        Some(action) => {
          tracing::debug!(action = %name, "running form action");
          action(event.clone()).await
        }
        None => Err(HttpError::not_found(format!("No action named `{name}`")).into()),
      },
      Err(error) => Err(error),
    };

    if accepts(event, JSON) {
      return match result {
        Ok(outcome) => {
          let status = match &outcome {
            ActionOutcome::Failure { status, .. } => *status,
            _ => 200,
          };
          json_response(status, &outcome.to_json())
        }
        Err(LoadError::Redirect(r)) => json_response(200, &ActionOutcome::Redirect(r).to_json()),
        Err(error) => {
          let (status, body) = self.public_error(event, &error);
          json_response(status, &json!({ "type": "error", "status": status, "error": body }))
        }
      };
    }

    match result {
      Ok(ActionOutcome::Success(data)) => self.page_response(event, branch, log, data, 200).await,
      Ok(ActionOutcome::Failure { status, data }) => {
        self.page_response(event, branch, log, Some(data), status).await
      }
      Ok(ActionOutcome::Redirect(r)) | Err(LoadError::Redirect(r)) => {
        redirect(r.status, &r.location)
      }
      Err(error) => {
        let boundary = branch.len().checked_sub(1).and_then(|leaf| find_boundary(branch, leaf));
        let shown = boundary.map_or(&branch[..0], |b| &branch[..=b]);
        self.error_page(event, log, shown, &error).await
      }
    }
  }

  /// Host-rendered document plus hydration payload; deferred fields of the
  /// shown nodes stream as chunk scripts before `</body>`.
  fn render(
    self: &Arc<Self>,
    event: &RequestEvent,
    log: &FetchLog,
    registry: &DeferredRegistry,
    state: &PageState<'_>,
  ) -> Response {
    let data: Vec<Map<String, Value>> = state.nodes.iter().map(|n| n.data.clone()).collect();
    let ctx = RenderContext {
      route_id: event.route_id(),
      url: event.url(),
      params: event.params(),
      nodes: state.branch,
      data: &data,
      form: state.form,
      error: state.error,
      status: state.status,
    };
    let rendered = match self.renderer.render(&ctx) {
      Ok(rendered) => rendered,
      Err(err) => {
        let (status, body) = self.public_error(event, &LoadError::unexpected(err));
        return fallback_page(status, &body);
      }
    };

    let payload = HydrationPayload {
      route: event.route_id().map(str::to_string),
      params: event.params().clone(),
      url: event.url().to_string(),
      nodes: state
        .nodes
        .iter()
        .map(|n| {
          n.server.as_ref().map(|s| HydrationNode {
            data: Value::Object(s.data.clone()),
            uses: serde_json::to_value(&s.uses).unwrap_or(Value::Null),
          })
        })
        .collect(),
      form: state.form.cloned(),
      error: state.error.cloned(),
      status: state.status,
      fetches: log.lock().unwrap_or_else(PoisonError::into_inner).clone(),
    };
    let json = serde_json::to_string(&payload).unwrap_or_default();
    let html = assemble_document(self.options.app_template(), &rendered.head, &rendered.body);
    let html = inject_data_script(&html, &self.options.data_id, &script_safe_json(&json));

    let shown = state.nodes.len();
    let entries = registry.drain(|node| node < shown);
    if entries.is_empty() {
      return response(state.status, HTML, Body::from(html));
    }
    let (prefix, suffix) = split_for_stream(&html);
    let (prefix, suffix) = (prefix.to_string(), suffix.to_string());
    let this = Arc::clone(self);
    let event = event.clone();
    let chunks = deferred_stream(entries).map(move |chunk| {
      chunk_script(&this.options.data_id, &this.chunk_line(&event, chunk))
    });
    let body = stream::once(async move { prefix })
      .chain(chunks)
      .chain(stream::once(async move { suffix }))
      .map(Bytes::from)
      .boxed();
    response(state.status, HTML, Body::Stream(body))
  }

  /// Apply `set_headers`, computed cache-control and the jar's cookies.
  pub(super) fn finish(&self, event: &RequestEvent, mut res: Response) -> Response {
    let mut cache_values = {
      let explicit = event.response_headers();
      for (name, value) in &explicit.headers {
        res.headers_mut().insert(name.clone(), value.clone());
      }
      explicit.cache_control.clone()
    };
    let headers = res.headers_mut();
    if let Some(existing) = headers.get(CACHE_CONTROL).and_then(|v| v.to_str().ok()) {
      cache_values.push(existing.to_string());
    }
    let rendered = headers
      .get(CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .is_some_and(|ct| ct.starts_with("text/html") || ct.starts_with(NDJSON));
    let default = if rendered { self.options.default_cache_control.as_deref() } else { None };
    let personalized = event.cookies().is_personalized();
    if let Some(value) = resolve_cache_control(&cache_values, personalized, default)
      && let Ok(value) = HeaderValue::try_from(value)
    {
      headers.insert(CACHE_CONTROL, value);
    }
    for cookie in event.cookies().set_cookie_headers() {
      if let Ok(value) = HeaderValue::try_from(cookie) {
        headers.append(SET_COOKIE, value);
      }
    }
    if *event.method() == Method::HEAD {
      return res.map(|_| Body::empty());
    }
    res
  }
}

/// Built-in error document, used when no boundary can render the error.
fn fallback_page(status: u16, body: &Value) -> Response {
  let message = body.get("message").and_then(Value::as_str).unwrap_or("Error");
  response(status, HTML, Body::from(default_error_page(status, message)))
}

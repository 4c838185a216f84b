/* src/server/core/rust/src/manifest.rs */

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use http::Method;

use crate::actions::ActionFn;
use crate::errors::{LoadError, ServerError};
use crate::event::RequestEvent;
use crate::load::{BoxFuture, ServerLoadFn, UniversalLoadFn};
use crate::matcher::{MatcherMap, ParamMatcher, RouteMatch, match_path};
use crate::route::{CompiledRoute, compare_specificity, parse_route_id};

/// One layout or page.
#[derive(Clone, Default)]
pub struct NodeDef {
  pub id: String,
  pub server_load: Option<ServerLoadFn>,
  pub universal_load: Option<UniversalLoadFn>,
  /// Renders failures of descendant nodes.
  pub error_boundary: bool,
  pub actions: BTreeMap<String, ActionFn>,
}

impl NodeDef {
  pub fn new(id: impl Into<String>) -> Self {
    Self { id: id.into(), ..Self::default() }
  }

  pub fn server_load(mut self, load: ServerLoadFn) -> Self {
    self.server_load = Some(load);
    self
  }

  pub fn universal_load(mut self, load: UniversalLoadFn) -> Self {
    self.universal_load = Some(load);
    self
  }

  pub fn error_boundary(mut self) -> Self {
    self.error_boundary = true;
    self
  }

  pub fn action(mut self, name: impl Into<String>, action: ActionFn) -> Self {
    self.actions.insert(name.into(), action);
    self
  }
}

pub type EndpointFn =
  Arc<dyn Fn(RequestEvent) -> BoxFuture<Result<http::Response<Bytes>, LoadError>> + Send + Sync>;

pub fn endpoint<F, Fut>(f: F) -> EndpointFn
where
  F: Fn(RequestEvent) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<http::Response<Bytes>, LoadError>> + Send + 'static,
{
  Arc::new(move |event| Box::pin(f(event)))
}

/// Method handlers of a `+server`-style route.
#[derive(Clone, Default)]
pub struct EndpointDef {
  handlers: BTreeMap<String, EndpointFn>,
}

impl EndpointDef {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn handler(mut self, method: Method, f: EndpointFn) -> Self {
    self.handlers.insert(method.as_str().to_string(), f);
    self
  }

  pub fn get(self, f: EndpointFn) -> Self {
    self.handler(Method::GET, f)
  }

  pub fn post(self, f: EndpointFn) -> Self {
    self.handler(Method::POST, f)
  }

  /// HEAD falls back to GET.
  pub fn resolve(&self, method: &Method) -> Option<&EndpointFn> {
    self.handlers.get(method.as_str()).or_else(|| {
      if method == Method::HEAD { self.handlers.get(Method::GET.as_str()) } else { None }
    })
  }

  pub fn allowed(&self) -> Vec<&str> {
    self.handlers.keys().map(String::as_str).collect()
  }
}

/// A compiled manifest entry.
pub struct RouteDef {
  pub compiled: CompiledRoute,
  /// Root-to-leaf layout and page nodes, if the route renders a page.
  pub page: Option<Vec<Arc<NodeDef>>>,
  pub endpoint: Option<EndpointDef>,
}

impl RouteDef {
  pub fn id(&self) -> &str {
    &self.compiled.id
  }
}

/// Immutable route table shared by the server and the client router.
pub struct Manifest {
  routes: Vec<RouteDef>,
  matchers: MatcherMap,
  nodes: HashMap<String, Arc<NodeDef>>,
  root: Option<Arc<NodeDef>>,
}

impl Manifest {
  pub fn builder() -> ManifestBuilder {
    ManifestBuilder::new()
  }

  /// Routes in priority order.
  pub fn routes(&self) -> &[RouteDef] {
    &self.routes
  }

  pub fn route(&self, id: &str) -> Option<&RouteDef> {
    self.routes.iter().find(|r| r.id() == id)
  }

  pub fn node(&self, id: &str) -> Option<&Arc<NodeDef>> {
    self.nodes.get(id)
  }

  /// Root layout, rendered around errors that match no route.
  pub fn root(&self) -> Option<&Arc<NodeDef>> {
    self.root.as_ref()
  }

  pub fn match_path(&self, pathname: &str) -> Option<RouteMatch<'_>> {
    match_path(&self.routes, &self.matchers, pathname)
  }
}

struct PendingRoute {
  id: String,
  page: Option<Vec<String>>,
  endpoint: Option<EndpointDef>,
}

/// Registers nodes, routes and matchers, then compiles them.
#[derive(Default)]
pub struct ManifestBuilder {
  nodes: Vec<NodeDef>,
  routes: Vec<PendingRoute>,
  matchers: MatcherMap,
  root: Option<String>,
}

impl ManifestBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn node(mut self, node: NodeDef) -> Self {
    self.nodes.push(node);
    self
  }

  fn entry(&mut self, id: &str) -> &mut PendingRoute {
    let pos = match self.routes.iter().position(|r| r.id == id) {
      Some(pos) => pos,
      None => {
        self.routes.push(PendingRoute { id: id.to_string(), page: None, endpoint: None });
        self.routes.len() - 1
      }
    };
    &mut self.routes[pos]
  }

  /// Declare a page route rendered by `branch` (layout ids then the page id).
  pub fn page(mut self, id: &str, branch: &[&str]) -> Self {
    self.entry(id).page = Some(branch.iter().map(|s| (*s).to_string()).collect());
    self
  }

  pub fn endpoint(mut self, id: &str, endpoint: EndpointDef) -> Self {
    self.entry(id).endpoint = Some(endpoint);
    self
  }

  pub fn matcher(mut self, name: impl Into<String>, matcher: ParamMatcher) -> Self {
    self.matchers.insert(name.into(), matcher);
    self
  }

  pub fn root(mut self, node_id: impl Into<String>) -> Self {
    self.root = Some(node_id.into());
    self
  }

  pub fn build(self) -> Result<Manifest, ServerError> {
    let nodes: HashMap<String, Arc<NodeDef>> =
      self.nodes.into_iter().map(|n| (n.id.clone(), Arc::new(n))).collect();
    let lookup = |route: &str, id: &str| {
      nodes
        .get(id)
        .cloned()
        .ok_or_else(|| ServerError::UnknownNode { route: route.to_string(), node: id.to_string() })
    };

    let mut routes = Vec::with_capacity(self.routes.len());
    for pending in self.routes {
      let compiled = parse_route_id(&pending.id)?;
      for param in &compiled.params {
        if let Some(m) = &param.matcher
          && !self.matchers.contains_key(m)
        {
          return Err(ServerError::UnknownMatcher { route: pending.id, matcher: m.clone() });
        }
      }
      let page = match pending.page {
        Some(ids) => {
          Some(ids.iter().map(|id| lookup(&pending.id, id)).collect::<Result<Vec<_>, _>>()?)
        }
        None => None,
      };
      routes.push(RouteDef { compiled, page, endpoint: pending.endpoint });
    }
    routes.sort_by(|a, b| compare_specificity(&a.compiled, &b.compiled));

    let root = match self.root {
      Some(id) => Some(lookup("<root>", &id)?),
      None => None,
    };
    Ok(Manifest { routes, matchers: self.matchers, nodes, root })
  }
}

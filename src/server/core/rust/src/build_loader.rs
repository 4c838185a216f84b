/* src/server/core/rust/src/build_loader.rs */

mod types;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::actions::ActionFn;
use crate::config::ServerOptions;
use crate::errors::ServerError;
use crate::load::{ServerLoadFn, UniversalLoadFn};
use crate::manifest::{EndpointDef, Manifest, NodeDef};
use crate::matcher::{MatcherMap, ParamMatcher};

use types::RouteManifest;

/// Handlers compiled into the app, keyed by the node ids and endpoint names
/// the build output refers to.
#[derive(Default)]
pub struct NodeRegistry {
  server_loads: HashMap<String, ServerLoadFn>,
  universal_loads: HashMap<String, UniversalLoadFn>,
  actions: HashMap<String, BTreeMap<String, ActionFn>>,
  endpoints: HashMap<String, EndpointDef>,
  matchers: MatcherMap,
}

impl NodeRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn server_load(mut self, node: impl Into<String>, load: ServerLoadFn) -> Self {
    self.server_loads.insert(node.into(), load);
    self
  }

  pub fn universal_load(mut self, node: impl Into<String>, load: UniversalLoadFn) -> Self {
    self.universal_loads.insert(node.into(), load);
    self
  }

  pub fn action(mut self, node: impl Into<String>, name: impl Into<String>, f: ActionFn) -> Self {
    self.actions.entry(node.into()).or_default().insert(name.into(), f);
    self
  }

  pub fn endpoint(mut self, name: impl Into<String>, endpoint: EndpointDef) -> Self {
    self.endpoints.insert(name.into(), endpoint);
    self
  }

  pub fn matcher(mut self, name: impl Into<String>, matcher: ParamMatcher) -> Self {
    self.matchers.insert(name.into(), matcher);
    self
  }
}

fn missing(node: &str, kind: &'static str) -> ServerError {
  ServerError::MissingHandler { node: node.to_string(), kind }
}

/// Compile a route manifest against `registry`.
pub fn parse_route_manifest(
  json: &str,
  registry: NodeRegistry,
) -> Result<(Manifest, ServerOptions), ServerError> {
  compile(serde_json::from_str(json)?, registry)
}

fn compile(
  parsed: RouteManifest,
  mut registry: NodeRegistry,
) -> Result<(Manifest, ServerOptions), ServerError> {
  let mut builder = Manifest::builder();

  for (id, entry) in &parsed.nodes {
    let mut node = NodeDef::new(id.as_str());
    if entry.server {
      let load = registry.server_loads.remove(id).ok_or_else(|| missing(id, "server load"))?;
      node = node.server_load(load);
    }
    if entry.universal {
      let load =
        registry.universal_loads.remove(id).ok_or_else(|| missing(id, "universal load"))?;
      node = node.universal_load(load);
    }
    if entry.error_boundary {
      node = node.error_boundary();
    }
    let mut actions = registry.actions.remove(id).unwrap_or_default();
    for name in &entry.actions {
      let action = actions.remove(name).ok_or_else(|| missing(id, "form action"))?;
      node = node.action(name.as_str(), action);
    }
    builder = builder.node(node);
  }

  for node in registry.server_loads.keys().chain(registry.universal_loads.keys()) {
    tracing::warn!(node = %node, "registered load is not referenced by the build output");
  }

  for (id, route) in &parsed.routes {
    if let Some(branch) = &route.page {
      let ids: Vec<&str> = branch.iter().map(String::as_str).collect();
      builder = builder.page(id, &ids);
    }
    if let Some(name) = &route.endpoint {
      let endpoint =
        registry.endpoints.get(name).cloned().ok_or_else(|| missing(name, "endpoint"))?;
      builder = builder.endpoint(id, endpoint);
    }
  }
  for (name, matcher) in registry.matchers {
    builder = builder.matcher(name, matcher);
  }
  if let Some(root) = parsed.root {
    builder = builder.root(root);
  }

  let manifest = builder.build()?;
  Ok((manifest, parsed.options))
}

/// Read `route-manifest.json` (and the app shell it names) from a build
/// directory.
pub fn load_build_output(
  dir: &Path,
  registry: NodeRegistry,
) -> Result<(Manifest, ServerOptions), ServerError> {
  let json = std::fs::read_to_string(dir.join("route-manifest.json"))?;
  let mut parsed: RouteManifest = serde_json::from_str(&json)?;
  let template = parsed.template.take();
  let (manifest, mut options) = compile(parsed, registry)?;
  if options.app_template.is_none()
    && let Some(file) = template
  {
    options.app_template = Some(std::fs::read_to_string(dir.join(file))?);
  }
  tracing::info!(
    dir = %dir.display(),
    routes = manifest.routes().len(),
    "loaded build output"
  );
  Ok((manifest, options))
}

/* src/server/core/rust/src/orchestrate.rs */

use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::{Shared, join_all};
use serde_json::{Map, Value};

use crate::deps::{LoadTracker, Uses};
use crate::errors::{LoadError, Redirect};
use crate::event::{LoadEvent, LoadScope, ParentData, RequestEvent, ServerLoadEvent};
use crate::load::{BoxFuture, shallow_merge};
use crate::manifest::NodeDef;
use crate::stream::DeferredRegistry;

/// Output of a node's server load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerNodeResult {
  pub data: Map<String, Value>,
  pub uses: Uses,
}

/// Final state of one branch node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeResult {
  /// Server data shallow-merged with the universal result.
  pub data: Map<String, Value>,
  pub server: Option<Arc<ServerNodeResult>>,
  pub universal_uses: Option<Uses>,
}

pub type ServerSlot = Shared<BoxFuture<Result<Option<Arc<ServerNodeResult>>, LoadError>>>;

pub type NodeSlot = Shared<BoxFuture<Result<Arc<NodeResult>, LoadError>>>;

/// A slot that is already settled, e.g. server data received by the client.
pub fn ready_server_slot(value: Result<Option<Arc<ServerNodeResult>>, LoadError>) -> ServerSlot {
  let fut: BoxFuture<_> = Box::pin(async move { value });
  fut.shared()
}

pub fn ready_node_slot(value: Result<Arc<NodeResult>, LoadError>) -> NodeSlot {
  let fut: BoxFuture<_> = Box::pin(async move { value });
  fut.shared()
}

fn server_parent(slots: &[ServerSlot]) -> ParentData {
  let ancestors = slots.to_vec();
  let fut: BoxFuture<Result<Arc<Map<String, Value>>, LoadError>> = Box::pin(async move {
    let mut merged = Map::new();
    for slot in ancestors {
      if let Some(result) = slot.await? {
        merged = shallow_merge(&merged, &result.data);
      }
    }
    Ok(Arc::new(merged))
  });
  fut.shared()
}

fn node_parent(slots: &[NodeSlot]) -> ParentData {
  let ancestors = slots.to_vec();
  let fut: BoxFuture<Result<Arc<Map<String, Value>>, LoadError>> = Box::pin(async move {
    let mut merged = Map::new();
    for slot in ancestors {
      merged = shallow_merge(&merged, &slot.await?.data);
    }
    Ok(Arc::new(merged))
  });
  fut.shared()
}

/// Create one lazily-started server load per branch node, root first. A node
/// runs when its slot is awaited, directly or through a descendant's
/// `parent()`; each runs at most once.
pub fn server_slots(
  branch: &[Arc<NodeDef>],
  event: &RequestEvent,
  registry: &DeferredRegistry,
) -> Vec<ServerSlot> {
  let mut slots: Vec<ServerSlot> = Vec::with_capacity(branch.len());
  for (index, node) in branch.iter().enumerate() {
    let parent = server_parent(&slots);
    let node = Arc::clone(node);
    let event = event.clone();
    let registry = registry.clone();
    let fut: BoxFuture<Result<Option<Arc<ServerNodeResult>>, LoadError>> = Box::pin(async move {
      let Some(load) = node.server_load.clone() else {
        return Ok(None);
      };
      tracing::debug!(node = %node.id, "running server load");
      let tracker = LoadTracker::new();
      let output = load(ServerLoadEvent::new(event, tracker.clone(), parent)).await?;
      let data = registry.register(index, output);
      Ok(Some(Arc::new(ServerNodeResult { data, uses: tracker.snapshot() })))
    });
    slots.push(fut.shared());
  }
  slots
}

/// Create the universal phase on top of `server`. `reuse[i]` short-circuits
/// node `i` with a previous result (client navigations).
pub fn node_slots(
  branch: &[Arc<NodeDef>],
  scope: &Arc<LoadScope>,
  server: &[ServerSlot],
  reuse: &[Option<Arc<NodeResult>>],
) -> Vec<NodeSlot> {
  let mut slots: Vec<NodeSlot> = Vec::with_capacity(branch.len());
  for (index, node) in branch.iter().enumerate() {
    if let Some(Some(previous)) = reuse.get(index) {
      slots.push(ready_node_slot(Ok(Arc::clone(previous))));
      continue;
    }
    let parent = node_parent(&slots);
    let node = Arc::clone(node);
    let scope = Arc::clone(scope);
    let server_slot = server.get(index).cloned().unwrap_or_else(|| ready_server_slot(Ok(None)));
    let fut: BoxFuture<Result<Arc<NodeResult>, LoadError>> = Box::pin(async move {
      let server = server_slot.await?;
      let server_data = server.as_ref().map(|s| s.data.clone()).unwrap_or_default();
      let Some(load) = node.universal_load.clone() else {
        return Ok(Arc::new(NodeResult { data: server_data, server, universal_uses: None }));
      };
      tracing::debug!(node = %node.id, "running universal load");
      let tracker = LoadTracker::new();
      let own = server.as_ref().map(|s| Arc::new(s.data.clone()));
      let output = load(LoadEvent::new(scope, own, tracker.clone(), parent)).await?;
      let mut universal = output.data;
      // universal loads resolve their deferred fields before the node settles
      for (key, value) in output.deferred {
        universal.insert(key, value.await?);
      }
      Ok(Arc::new(NodeResult {
        data: shallow_merge(&server_data, &universal),
        server,
        universal_uses: Some(tracker.snapshot()),
      }))
    });
    slots.push(fut.shared());
  }
  slots
}

/// How a branch finished loading.
#[derive(Debug, Clone)]
pub enum BranchOutcome {
  Complete(Vec<Arc<NodeResult>>),
  Redirect(Redirect),
  /// `nodes` holds the results of the nodes up to and including `boundary`.
  Error {
    error: LoadError,
    failed_at: usize,
    boundary: Option<usize>,
    nodes: Vec<Arc<NodeResult>>,
  },
}

/// Nearest strict ancestor of `failed_at` that declares an error boundary.
pub fn find_boundary(branch: &[Arc<NodeDef>], failed_at: usize) -> Option<usize> {
  (0..failed_at.min(branch.len())).rev().find(|&i| branch[i].error_boundary)
}

/// Await every node slot and fold the results into an outcome. The first
/// failing node in branch order decides the error.
pub async fn settle_branch(branch: &[Arc<NodeDef>], slots: Vec<NodeSlot>) -> BranchOutcome {
  let results = join_all(slots).await;
  let mut nodes = Vec::with_capacity(results.len());
  for (index, result) in results.into_iter().enumerate() {
    match result {
      Ok(node) => nodes.push(node),
      Err(LoadError::Redirect(redirect)) => return BranchOutcome::Redirect(redirect),
      Err(error) => {
        let boundary = find_boundary(branch, index);
        nodes.truncate(boundary.map_or(0, |b| b + 1));
        return BranchOutcome::Error { error, failed_at: index, boundary, nodes };
      }
    }
  }
  BranchOutcome::Complete(nodes)
}

/// Server render: run all server loads then all universal loads.
pub async fn load_branch(
  branch: &[Arc<NodeDef>],
  event: &RequestEvent,
  scope: &Arc<LoadScope>,
  registry: &DeferredRegistry,
) -> BranchOutcome {
  let server = server_slots(branch, event, registry);
  let slots = node_slots(branch, scope, &server, &[]);
  settle_branch(branch, slots).await
}

/// Per-node result of a data request.
#[derive(Debug, Clone)]
pub enum ServerNodeOutcome {
  Skipped,
  Loaded(Option<Arc<ServerNodeResult>>),
  Failed(LoadError),
}

/// Data request: run the server loads of the nodes in `include` only.
/// Results stop at the first failure.
pub async fn load_server_data(
  branch: &[Arc<NodeDef>],
  event: &RequestEvent,
  registry: &DeferredRegistry,
  include: &[bool],
) -> Vec<ServerNodeOutcome> {
  let slots = server_slots(branch, event, registry);
  let wanted = |i: usize| include.get(i).copied().unwrap_or(true);
  let pending = slots
    .iter()
    .enumerate()
    .filter(|(i, _)| wanted(*i))
    .map(|(i, slot)| slot.clone().map(move |r| (i, r)));
  let mut settled: Vec<Option<Result<Option<Arc<ServerNodeResult>>, LoadError>>> =
    vec![None; branch.len()];
  for (i, result) in join_all(pending).await {
    settled[i] = Some(result);
  }
  let mut out = Vec::with_capacity(branch.len());
  for result in settled {
    match result {
      None => out.push(ServerNodeOutcome::Skipped),
      Some(Ok(data)) => out.push(ServerNodeOutcome::Loaded(data)),
      Some(Err(error)) => {
        out.push(ServerNodeOutcome::Failed(error));
        break;
      }
    }
  }
  out
}

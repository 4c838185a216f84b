/* src/server/core/rust/src/stream.rs */

use std::sync::{Arc, Mutex, PoisonError};

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use serde_json::{Map, Value};

use crate::errors::LoadError;
use crate::load::{BoxStream, DeferredValue, LoadOutput};

pub use loam_engine::{deferred_placeholder, placeholder_id};

/// A deferred field waiting to be streamed.
pub struct DeferredEntry {
  pub id: u64,
  /// Branch index of the node that produced it.
  pub node: usize,
  pub key: String,
  future: DeferredValue,
}

/// One settled deferred field.
#[derive(Debug, Clone)]
pub struct DeferredChunk {
  pub id: u64,
  pub node: usize,
  pub key: String,
  pub outcome: Result<Value, LoadError>,
}

#[derive(Default)]
struct RegistryState {
  next_id: u64,
  entries: Vec<DeferredEntry>,
}

/// Collects deferred fields of every load in one request.
#[derive(Clone, Default)]
pub struct DeferredRegistry {
  inner: Arc<Mutex<RegistryState>>,
}

impl DeferredRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Move the deferred fields of `output` into the registry and return its
  /// eager data with a placeholder under each deferred key.
  pub fn register(&self, node: usize, output: LoadOutput) -> Map<String, Value> {
    let LoadOutput { mut data, deferred } = output;
    if deferred.is_empty() {
      return data;
    }
    let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
    for (key, future) in deferred {
      state.next_id += 1;
      let id = state.next_id;
      data.insert(key.clone(), deferred_placeholder(id));
      state.entries.push(DeferredEntry { id, node, key, future });
    }
    data
  }

  /// Remove and return the entries produced by nodes accepted by `include`.
  /// Entries of other nodes are dropped.
  pub fn drain(&self, include: impl Fn(usize) -> bool) -> Vec<DeferredEntry> {
    let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
    std::mem::take(&mut state.entries).into_iter().filter(|e| include(e.node)).collect()
  }
}

/// Await every entry independently, yielding chunks in settle order. The
/// stream ends once all entries have settled.
pub fn deferred_stream(entries: Vec<DeferredEntry>) -> BoxStream<DeferredChunk> {
  let pending: FuturesUnordered<_> = entries
    .into_iter()
    .map(|DeferredEntry { id, node, key, future }| async move {
      DeferredChunk { id, node, key, outcome: future.await }
    })
    .collect();
  pending.boxed()
}

/// Eager data of each included node plus the stream of its deferred fields.
pub struct Serialized {
  pub eager: Vec<Option<Map<String, Value>>>,
  /// Number of chunks `deferred` will yield.
  pub pending: usize,
  pub deferred: BoxStream<DeferredChunk>,
}

pub fn serialize(
  eager: Vec<Option<Map<String, Value>>>,
  registry: &DeferredRegistry,
) -> Serialized {
  let included: Vec<bool> = eager.iter().map(Option::is_some).collect();
  let entries = registry.drain(|node| included.get(node).copied().unwrap_or(false));
  Serialized { eager, pending: entries.len(), deferred: deferred_stream(entries) }
}

/// Replace the placeholder for `id` under `key` with the settled value.
/// Returns false if the key no longer holds that placeholder.
pub fn fill_deferred(data: &mut Map<String, Value>, key: &str, id: u64, value: Value) -> bool {
  match data.get_mut(key) {
    Some(slot) if placeholder_id(slot) == Some(id) => {
      *slot = value;
      true
    }
    _ => false,
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use serde_json::json;

  use super::*;
  use crate::errors::HttpError;

  fn sleep_then(ms: u64, value: Value) -> impl Future<Output = Result<Value, LoadError>> {
    async move {
      tokio::time::sleep(Duration::from_millis(ms)).await;
      Ok(value)
    }
  }

  #[tokio::test]
  async fn eager_first_then_arrival_order() {
    let registry = DeferredRegistry::new();
    let output = LoadOutput::new()
      .with("x", 1)
      .defer("y", sleep_then(100, json!("slow")))
      .defer("z", sleep_then(10, json!("fast")));
    let data = registry.register(0, output);
    assert_eq!(data["x"], 1);
    assert_eq!(placeholder_id(&data["y"]), Some(1));
    assert_eq!(placeholder_id(&data["z"]), Some(2));

    let serialized = serialize(vec![Some(data)], &registry);
    let keys: Vec<String> = serialized.deferred.map(|c| c.key).collect().await;
    assert_eq!(keys, vec!["z", "y"]);
  }

  #[tokio::test]
  async fn errors_become_chunks() {
    let registry = DeferredRegistry::new();
    let output = LoadOutput::new().defer("bad", async {
      Err::<Value, _>(LoadError::from(HttpError::not_found("nope")))
    });
    registry.register(0, output);
    let chunks: Vec<DeferredChunk> = deferred_stream(registry.drain(|_| true)).collect().await;
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].outcome.as_ref().unwrap_err().status(), 404);
  }

  #[tokio::test]
  async fn skipped_nodes_are_dropped() {
    let registry = DeferredRegistry::new();
    registry.register(0, LoadOutput::new().defer("a", async { Ok(1) }));
    registry.register(1, LoadOutput::new().defer("b", async { Ok(2) }));
    let serialized = serialize(vec![None, Some(Map::new())], &registry);
    let chunks: Vec<DeferredChunk> = serialized.deferred.collect().await;
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].node, 1);
    assert_eq!(chunks[0].outcome.as_ref().unwrap(), &json!(2));
  }

  #[tokio::test]
  async fn empty_stream_closes() {
    let chunks: Vec<DeferredChunk> = deferred_stream(Vec::new()).collect().await;
    assert!(chunks.is_empty());
  }

  #[test]
  fn fill_replaces_matching_placeholder() {
    let mut data = Map::new();
    data.insert("y".into(), deferred_placeholder(4));
    assert!(!fill_deferred(&mut data, "y", 5, json!(1)));
    assert!(fill_deferred(&mut data, "y", 4, json!("done")));
    assert_eq!(data["y"], "done");
  }
}

/* src/server/core/rust/src/load.rs */

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_core::Stream;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::errors::LoadError;
use crate::event::{LoadEvent, ServerLoadEvent};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// A value still being computed when the eager data is flushed.
pub type DeferredValue = BoxFuture<Result<Value, LoadError>>;

/// Result of one load: eager fields plus deferred ones keyed by name.
#[derive(Default)]
pub struct LoadOutput {
  pub data: Map<String, Value>,
  pub deferred: Vec<(String, DeferredValue)>,
}

impl LoadOutput {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn from_map(data: Map<String, Value>) -> Self {
    Self { data, deferred: Vec::new() }
  }

  pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
    self.data.insert(key.into(), value.into());
    self
  }

  /// Stream `fut` after the eager data. Its key is taken out of the eager map.
  pub fn defer<F, T>(mut self, key: impl Into<String>, fut: F) -> Self
  where
    F: Future<Output = Result<T, LoadError>> + Send + 'static,
    T: Serialize,
  {
    let key = key.into();
    self.data.remove(&key);
    let value: DeferredValue = Box::pin(async move { Ok(serde_json::to_value(fut.await?)?) });
    self.deferred.push((key, value));
    self
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty() && self.deferred.is_empty()
  }
}

/// Conversion of a load's return value into a `LoadOutput`.
/// Any serializable value producing a JSON object (or unit) works.
pub trait IntoLoadOutput {
  fn into_load_output(self) -> Result<LoadOutput, LoadError>;
}

impl IntoLoadOutput for LoadOutput {
  fn into_load_output(self) -> Result<LoadOutput, LoadError> {
    Ok(self)
  }
}

impl<T: Serialize> IntoLoadOutput for T {
  fn into_load_output(self) -> Result<LoadOutput, LoadError> {
    match serde_json::to_value(self)? {
      Value::Object(map) => Ok(LoadOutput::from_map(map)),
      Value::Null => Ok(LoadOutput::new()),
      other => Err(LoadError::unexpected(anyhow::anyhow!(
        "load must return an object, got {}",
        json_kind(&other)
      ))),
    }
  }
}

fn json_kind(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "a boolean",
    Value::Number(_) => "a number",
    Value::String(_) => "a string",
    Value::Array(_) => "an array",
    Value::Object(_) => "an object",
  }
}

pub type ServerLoadFn =
  Arc<dyn Fn(ServerLoadEvent) -> BoxFuture<Result<LoadOutput, LoadError>> + Send + Sync>;

pub type UniversalLoadFn =
  Arc<dyn Fn(LoadEvent) -> BoxFuture<Result<LoadOutput, LoadError>> + Send + Sync>;

/// Wrap an async closure as a server load.
pub fn server_load<F, Fut, T>(f: F) -> ServerLoadFn
where
  F: Fn(ServerLoadEvent) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T, LoadError>> + Send + 'static,
  T: IntoLoadOutput,
{
  Arc::new(move |event| {
    let fut = f(event);
    Box::pin(async move { fut.await?.into_load_output() })
  })
}

/// Wrap an async closure as a universal load.
pub fn universal_load<F, Fut, T>(f: F) -> UniversalLoadFn
where
  F: Fn(LoadEvent) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T, LoadError>> + Send + 'static,
  T: IntoLoadOutput,
{
  Arc::new(move |event| {
    let fut = f(event);
    Box::pin(async move { fut.await?.into_load_output() })
  })
}

/// Shallow merge: keys of `overlay` win.
pub(crate) fn shallow_merge(
  base: &Map<String, Value>,
  overlay: &Map<String, Value>,
) -> Map<String, Value> {
  let mut out = base.clone();
  for (k, v) in overlay {
    out.insert(k.clone(), v.clone());
  }
  out
}

/* src/server/core/rust/src/server/render.rs */

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::manifest::NodeDef;
use crate::matcher::Params;
use crate::url::Url;

/// What the host renderer receives for one document.
pub struct RenderContext<'a> {
  pub route_id: Option<&'a str>,
  pub url: &'a Url,
  pub params: &'a Params,
  /// Rendered branch: the full branch, or the nodes up to the error boundary.
  pub nodes: &'a [Arc<NodeDef>],
  /// Data of each node in `nodes`. Deferred fields hold placeholders.
  pub data: &'a [Map<String, Value>],
  pub form: Option<&'a Value>,
  /// Public error body when rendering an error boundary.
  pub error: Option<&'a Value>,
  pub status: u16,
}

impl RenderContext<'_> {
  /// Shallow merge of every node's data, leaf keys winning.
  pub fn page_data(&self) -> Map<String, Value> {
    let mut merged = Map::new();
    for data in self.data {
      for (k, v) in data {
        merged.insert(k.clone(), v.clone());
      }
    }
    merged
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedPage {
  pub head: String,
  pub body: String,
}

/// Host component renderer. The pipeline owns the document shell,
/// hydration payload and streamed chunks.
pub trait PageRenderer: Send + Sync {
  fn render(&self, ctx: &RenderContext<'_>) -> anyhow::Result<RenderedPage>;
}

/// Renders an empty shell; the client renders everything from the payload.
pub struct ClientOnly;

impl PageRenderer for ClientOnly {
  fn render(&self, _ctx: &RenderContext<'_>) -> anyhow::Result<RenderedPage> {
    Ok(RenderedPage::default())
  }
}

/* src/server/engine/rust/src/payload.rs */

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::escape::script_safe_json;

/// Key of the object standing in for a deferred value inside eager data.
pub const DEFERRED_MARKER: &str = "__loam_deferred";

pub fn deferred_placeholder(id: u64) -> Value {
  json!({ DEFERRED_MARKER: id })
}

/// Returns the deferred id if `value` is a placeholder object.
pub fn placeholder_id(value: &Value) -> Option<u64> {
  let obj = value.as_object()?;
  if obj.len() != 1 {
    return None;
  }
  obj.get(DEFERRED_MARKER)?.as_u64()
}

/// Per-node entry of the eager envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NodePayload {
  Data {
    data: Value,
    #[serde(default)]
    uses: Value,
  },
  Skip,
  Error {
    status: u16,
    error: Value,
  },
}

/// Settled value of a deferred field: `{"data": ..}` or `{"error": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkOutcome {
  Data(Value),
  Error(Value),
}

/// One line of the newline-delimited data stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DataLine {
  #[serde(rename = "data")]
  Nodes { nodes: Vec<NodePayload> },
  Chunk {
    id: u64,
    key: String,
    #[serde(flatten)]
    outcome: ChunkOutcome,
  },
  Redirect { status: u16, location: String },
  Error {
    status: u16,
    #[serde(default)]
    error: Value,
  },
  End,
}

/// Serialize one line, newline-terminated.
pub fn encode_line(line: &DataLine) -> String {
  let mut out = serde_json::to_string(line).unwrap_or_default();
  out.push('\n');
  out
}

pub fn decode_line(line: &str) -> Result<DataLine, serde_json::Error> {
  serde_json::from_str(line)
}

/// Parse a complete newline-delimited payload. Blank lines are ignored.
pub fn decode_lines(text: &str) -> Result<Vec<DataLine>, serde_json::Error> {
  text.lines().filter(|l| !l.trim().is_empty()).map(decode_line).collect()
}

/// A response captured during server rendering, replayed by the client
/// while hydrating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedFetch {
  pub url: String,
  pub method: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub request_body: Option<String>,
  pub status: u16,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HydrationNode {
  pub data: Value,
  #[serde(default)]
  pub uses: Value,
}

/// Everything the client router needs to resume from a server render.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HydrationPayload {
  #[serde(default)]
  pub route: Option<String>,
  #[serde(default)]
  pub params: BTreeMap<String, String>,
  #[serde(default)]
  pub url: String,
  /// Server data per branch node; `None` for nodes without a server load.
  #[serde(default)]
  pub nodes: Vec<Option<HydrationNode>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub form: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<Value>,
  pub status: u16,
  #[serde(default)]
  pub fetches: Vec<RecordedFetch>,
}

/// Script element carrying one streamed line inside an HTML document.
pub fn chunk_script(data_id: &str, line: &DataLine) -> String {
  let json = script_safe_json(encode_line(line).trim_end());
  format!(r#"<script type="application/json" data-loam-chunk="{data_id}">{json}</script>"#)
}

/* src/server/engine/rust/src/lib.rs */

pub mod document;
pub mod escape;
pub mod payload;

// Public API re-exports
pub use document::{
  BODY_SLOT, DEFAULT_APP_TEMPLATE, HEAD_SLOT, assemble_document, data_script, default_error_page,
  inject_data_script, split_for_stream,
};
pub use escape::{escape_html, script_safe_json};
pub use payload::{
  ChunkOutcome, DEFERRED_MARKER, DataLine, HydrationNode, HydrationPayload, NodePayload,
  RecordedFetch, chunk_script, decode_line, decode_lines, deferred_placeholder, encode_line,
  placeholder_id,
};

/* src/server/engine/rust/src/document.rs */

use crate::escape::escape_html;

pub const HEAD_SLOT: &str = "%loam.head%";
pub const BODY_SLOT: &str = "%loam.body%";

/// Fallback app shell used when the build output carries no template.
pub const DEFAULT_APP_TEMPLATE: &str = concat!(
  "<!doctype html><html><head><meta charset=\"utf-8\">",
  "%loam.head%</head><body>%loam.body%</body></html>"
);

/// Fill the head and body slots of an app template.
pub fn assemble_document(template: &str, head: &str, body: &str) -> String {
  template.replacen(HEAD_SLOT, head, 1).replacen(BODY_SLOT, body, 1)
}

/// Split an assembled document so streamed chunks can be written before the
/// closing `</body>`. Returns `(prefix, suffix)`; a document without a body
/// tag streams everything as prefix.
pub fn split_for_stream(html: &str) -> (&str, &str) {
  match html.rfind("</body>") {
    Some(pos) => html.split_at(pos),
    None => (html, ""),
  }
}

/// Inject a `<script>` tag with JSON data before `</body>`.
pub fn inject_data_script(html: &str, data_id: &str, json: &str) -> String {
  let script = data_script(data_id, json);
  if let Some(pos) = html.rfind("</body>") {
    let mut result = String::with_capacity(html.len() + script.len());
    result.push_str(&html[..pos]);
    result.push_str(&script);
    result.push_str(&html[pos..]);
    result
  } else {
    format!("{html}{script}")
  }
}

pub fn data_script(data_id: &str, json: &str) -> String {
  format!(r#"<script id="{data_id}" type="application/json">{json}</script>"#)
}

/// Minimal error document rendered when no layout boundary can handle a failure.
pub fn default_error_page(status: u16, message: &str) -> String {
  let message = escape_html(message);
  format!(
    "<!doctype html><html><head><meta charset=\"utf-8\"><title>{status}</title></head>\
     <body><h1>{status}</h1><p>{message}</p></body></html>"
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn assemble_fills_slots() {
    let html = assemble_document(DEFAULT_APP_TEMPLATE, "<title>Hi</title>", "<main>x</main>");
    assert!(html.contains("<head><meta charset=\"utf-8\"><title>Hi</title></head>"));
    assert!(html.contains("<body><main>x</main></body>"));
  }

  #[test]
  fn assemble_only_first_slot() {
    let html = assemble_document("%loam.body%|%loam.body%", "", "a");
    assert_eq!(html, "a|%loam.body%");
  }

  #[test]
  fn split_before_closing_body() {
    let (head, tail) = split_for_stream("<html><body><p>x</p></body></html>");
    assert_eq!(head, "<html><body><p>x</p>");
    assert_eq!(tail, "</body></html>");
  }

  #[test]
  fn split_without_body() {
    assert_eq!(split_for_stream("<p>x</p>"), ("<p>x</p>", ""));
  }

  #[test]
  fn inject_data_script_before_body() {
    let html = "<html><body><p>Content</p></body></html>";
    let result = inject_data_script(html, "__loam_data", r#"{"a":1}"#);
    assert!(
      result
        .contains(r#"<script id="__loam_data" type="application/json">{"a":1}</script></body>"#)
    );
  }

  #[test]
  fn inject_data_script_no_body() {
    let result = inject_data_script("<p>Content</p>", "__loam_data", "{}");
    assert!(result.ends_with(r#"<script id="__loam_data" type="application/json">{}</script>"#));
  }

  #[test]
  fn error_page_escapes_message() {
    let html = default_error_page(404, "<nope>");
    assert!(html.contains("<h1>404</h1>"));
    assert!(html.contains("&lt;nope&gt;"));
  }
}

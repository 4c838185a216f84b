/* src/server/core/rust/src/server/tests.rs */

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use http::header::{ALLOW, CACHE_CONTROL, CONTENT_TYPE, LOCATION, SET_COOKIE};
use http::{Method, StatusCode};
use loam_engine::{DataLine, NodePayload, decode_lines};
use serde_json::{Value, json};

use super::*;
use crate::actions::{ActionOutcome, action};
use crate::cookies::CookieOptions;
use crate::errors::HttpError;
use crate::load::{LoadOutput, server_load};
use crate::manifest::{EndpointDef, NodeDef, endpoint};

/// Writes the merged page data, error and form into `<main>` as JSON.
struct JsonRenderer;

impl PageRenderer for JsonRenderer {
  fn render(&self, ctx: &RenderContext<'_>) -> anyhow::Result<RenderedPage> {
    let nodes: Vec<&str> = ctx.nodes.iter().map(|n| n.id.as_str()).collect();
    let body = json!({
      "nodes": nodes,
      "data": ctx.page_data(),
      "error": ctx.error,
      "form": ctx.form,
      "status": ctx.status,
    });
    Ok(RenderedPage { head: String::new(), body: format!("<main>{body}</main>") })
  }
}

fn main_json(html: &str) -> Value {
  let start = html.find("<main>").unwrap() + "<main>".len();
  let end = html.find("</main>").unwrap();
  serde_json::from_str(&html[start..end]).unwrap()
}

fn text_endpoint<F>(f: F) -> EndpointDef
where
  F: Fn(RequestEvent) -> String + Send + Sync + 'static,
{
  let f = Arc::new(f);
  EndpointDef::new().get(endpoint(move |event| {
    let f = Arc::clone(&f);
    async move { Ok(http::Response::new(Bytes::from(f(event)))) }
  }))
}

fn server(manifest: Manifest) -> Server {
  Server::builder(manifest).renderer(JsonRenderer).build()
}

async fn send(server: &Server, request: http::Request<Bytes>) -> (http::response::Parts, String) {
  let (parts, body) = server.respond(request, RequestContext::default()).await.into_parts();
  (parts, body.text().await)
}

async fn get(server: &Server, path: &str) -> (http::response::Parts, String) {
  let request = http::Request::get(format!("https://app.dev{path}")).body(Bytes::new()).unwrap();
  send(server, request).await
}

fn layout() -> NodeDef {
  NodeDef::new("layout").error_boundary()
}

fn data_node(id: &str, value: Value) -> NodeDef {
  NodeDef::new(id).server_load(server_load(move |_ev| {
    let value = value.clone();
    async move { Ok(value) }
  }))
}

#[tokio::test]
async fn static_route_beats_dynamic() {
  let manifest = Manifest::builder()
    .node(layout())
    .node(data_node("latest", json!({ "which": "latest" })))
    .node(NodeDef::new("post").server_load(server_load(|ev| async move {
      Ok(json!({ "which": "post", "slug": ev.param("slug").unwrap_or_default() }))
    })))
    .page("/blog/latest", &["layout", "latest"])
    .page("/blog/[slug]", &["layout", "post"])
    .build()
    .unwrap();
  let app = server(manifest);

  let (parts, html) = get(&app, "/blog/latest").await;
  assert_eq!(parts.status, StatusCode::OK);
  assert_eq!(parts.headers[CONTENT_TYPE], "text/html; charset=utf-8");
  assert_eq!(main_json(&html)["data"]["which"], "latest");

  let (_, html) = get(&app, "/blog/hello").await;
  let page = main_json(&html);
  assert_eq!(page["data"]["which"], "post");
  assert_eq!(page["data"]["slug"], "hello");
  assert!(html.contains(r#"<script id="__loam_data" type="application/json">"#));
}

#[tokio::test]
async fn unmatched_path_renders_root_layout_with_404() {
  let manifest = Manifest::builder()
    .node(data_node("layout", json!({ "site": "loam" })).error_boundary())
    .node(NodeDef::new("home"))
    .page("/", &["layout", "home"])
    .root("layout")
    .build()
    .unwrap();
  let (parts, html) = get(&server(manifest), "/missing").await;
  assert_eq!(parts.status, StatusCode::NOT_FOUND);
  let page = main_json(&html);
  assert_eq!(page["nodes"], json!(["layout"]));
  assert_eq!(page["data"]["site"], "loam");
  assert_eq!(page["error"]["message"], "Not found: /missing");
}

#[tokio::test]
async fn leaf_error_rendered_by_nearest_boundary() {
  let manifest = Manifest::builder()
    .node(data_node("layout", json!({ "site": "loam" })).error_boundary())
    .node(NodeDef::new("admin").server_load(server_load(|_ev| async move {
      Err::<(), _>(HttpError::forbidden("members only").into())
    })))
    .page("/admin", &["layout", "admin"])
    .build()
    .unwrap();
  let (parts, html) = get(&server(manifest), "/admin").await;
  assert_eq!(parts.status, StatusCode::FORBIDDEN);
  let page = main_json(&html);
  assert_eq!(page["nodes"], json!(["layout"]));
  assert_eq!(page["error"]["message"], "members only");
}

struct CustomErrors(Arc<AtomicUsize>);

impl Hooks for CustomErrors {
  fn handle_error(
    &self,
    _error: &LoadError,
    _event: &RequestEvent,
    status: u16,
    message: &str,
  ) -> Option<serde_json::Value> {
    self.0.fetch_add(1, Ordering::SeqCst);
    Some(json!({ "message": message, "status": status, "ticket": "T-1" }))
  }
}

#[tokio::test]
async fn unexpected_errors_are_masked_and_reported_once() {
  let manifest = Manifest::builder()
    .node(NodeDef::new("boom").server_load(server_load(|_ev| async move {
      Err::<(), _>(LoadError::unexpected(anyhow::anyhow!("database password is hunter2")))
    })))
    .page("/boom", &["boom"])
    .build()
    .unwrap();
  let reported = Arc::new(AtomicUsize::new(0));
  let app = Server::builder(manifest)
    .renderer(JsonRenderer)
    .hooks(CustomErrors(reported.clone()))
    .build();

  let (parts, html) = get(&app, "/boom").await;
  assert_eq!(parts.status, StatusCode::INTERNAL_SERVER_ERROR);
  assert!(html.contains("Internal Error"));
  assert!(!html.contains("hunter2"));
  assert_eq!(reported.load(Ordering::SeqCst), 1);

  let (parts, body) = get(&app, "/boom/__data.json").await;
  assert_eq!(parts.status, StatusCode::OK);
  let lines = decode_lines(&body).unwrap();
  let DataLine::Nodes { nodes } = &lines[0] else { panic!("expected nodes line, got {lines:?}") };
  assert_eq!(
    nodes[0],
    NodePayload::Error {
      status: 500,
      error: json!({ "message": "Internal Error", "status": 500, "ticket": "T-1" }),
    }
  );
}

#[tokio::test]
async fn identical_fetches_share_one_call() {
  let calls = Arc::new(AtomicUsize::new(0));
  let counter = calls.clone();
  let count_endpoint = EndpointDef::new().get(endpoint(move |_event| {
    let counter = counter.clone();
    async move {
      counter.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(20)).await;
      Ok(http::Response::new(Bytes::from_static(br#"{"n":7}"#)))
    }
  }));
  let fetching = |id: &str| {
    NodeDef::new(id).server_load(server_load(|ev| async move {
      let body: Value = ev.fetch(FetchRequest::get("/api/n")).await?.json()?;
      Ok(json!({ "n": body["n"] }))
    }))
  };
  let manifest = Manifest::builder()
    .node(fetching("layout"))
    .node(fetching("page"))
    .page("/", &["layout", "page"])
    .endpoint("/api/n", count_endpoint)
    .build()
    .unwrap();
  let (parts, html) = get(&server(manifest), "/").await;
  assert_eq!(parts.status, StatusCode::OK);
  assert_eq!(main_json(&html)["data"]["n"], 7);
  assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cookies_set_by_a_load_reach_later_loads_and_fetches() {
  let manifest = Manifest::builder()
    .node(NodeDef::new("layout").server_load(server_load(|ev| async move {
      ev.cookies().set("theme", "dark", CookieOptions::new())?;
      Ok(json!({}))
    })))
    .node(NodeDef::new("page").server_load(server_load(|ev| async move {
      ev.parent().await?;
      let seen = ev.cookies().get("theme");
      let echoed = ev.fetch(FetchRequest::get("/api/theme")).await?.text();
      Ok(json!({ "seen": seen, "echoed": echoed }))
    })))
    .page("/", &["layout", "page"])
    .endpoint("/api/theme", text_endpoint(|ev| ev.cookies().get("theme").unwrap_or_default()))
    .build()
    .unwrap();
  let (parts, html) = get(&server(manifest), "/").await;
  let page = main_json(&html);
  assert_eq!(page["data"]["seen"], "dark");
  assert_eq!(page["data"]["echoed"], "dark");
  let set_cookie = parts.headers[SET_COOKIE].to_str().unwrap();
  assert!(set_cookie.starts_with("theme=dark"));
  assert!(set_cookie.contains("Path=/"));
}

#[tokio::test]
async fn cookie_path_limits_forwarding() {
  let echo = || text_endpoint(|ev| ev.header("cookie").unwrap_or_default().to_string());
  let manifest = Manifest::builder()
    .node(NodeDef::new("page").server_load(server_load(|ev| async move {
      ev.cookies().set("scoped", "1", CookieOptions::new().path("/a"))?;
      let nested = ev.fetch(FetchRequest::get("/a/x")).await?.text();
      let sibling = ev.fetch(FetchRequest::get("/ab")).await?.text();
      Ok(json!({ "nested": nested, "sibling": sibling }))
    })))
    .page("/", &["page"])
    .endpoint("/a/x", echo())
    .endpoint("/ab", echo())
    .build()
    .unwrap();
  let (_, html) = get(&server(manifest), "/").await;
  let page = main_json(&html);
  assert_eq!(page["data"]["nested"], "scoped=1");
  assert_eq!(page["data"]["sibling"], "");
}

#[tokio::test]
async fn deferred_fields_stream_in_settle_order() {
  let manifest = Manifest::builder()
    .node(NodeDef::new("page").server_load(server_load(|_ev| async move {
      Ok(
        LoadOutput::new()
          .with("x", "value-x")
          .defer("y", async {
            tokio::time::sleep(Duration::from_millis(40)).await;
            Ok::<_, LoadError>("value-y")
          })
          .defer("z", async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok::<_, LoadError>("value-z")
          }),
      )
    })))
    .page("/", &["page"])
    .build()
    .unwrap();
  let app = server(manifest);

  let (parts, html) = get(&app, "/").await;
  assert_eq!(parts.status, StatusCode::OK);
  let x = html.find("value-x").unwrap();
  let z = html.find("value-z").unwrap();
  let y = html.find("value-y").unwrap();
  assert!(x < z && z < y, "unexpected order in {html}");
  assert!(html.ends_with("</body></html>"));

  let (_, body) = get(&app, "/__data.json").await;
  let lines = decode_lines(&body).unwrap();
  assert_eq!(lines.len(), 4);
  assert!(matches!(&lines[1], DataLine::Chunk { key, .. } if key == "z"));
  assert!(matches!(&lines[2], DataLine::Chunk { key, .. } if key == "y"));
  assert_eq!(lines[3], DataLine::End);
}

#[tokio::test]
async fn trailing_slash_redirects_permanently() {
  let manifest = Manifest::builder()
    .node(NodeDef::new("page"))
    .page("/docs", &["page"])
    .build()
    .unwrap();
  let (parts, _) = get(&server(manifest), "/docs/?tab=1").await;
  assert_eq!(parts.status, StatusCode::PERMANENT_REDIRECT);
  assert_eq!(parts.headers[LOCATION], "/docs?tab=1");
}

#[tokio::test]
async fn data_request_runs_only_invalidated_nodes() {
  let calls = Arc::new(AtomicUsize::new(0));
  let counter = calls.clone();
  let manifest = Manifest::builder()
    .node(NodeDef::new("layout").server_load(server_load(move |_ev| {
      let counter = counter.clone();
      async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "user": "ada" }))
      }
    })))
    .node(NodeDef::new("plain"))
    .node(NodeDef::new("post").server_load(server_load(|ev| async move {
      Ok(json!({ "slug": ev.param("slug").unwrap_or_default() }))
    })))
    .page("/blog/[slug]", &["layout", "plain", "post"])
    .build()
    .unwrap();
  let app = server(manifest);

  let (parts, body) = get(&app, "/blog/a/__data.json?x-invalidated=011").await;
  assert_eq!(parts.headers[CONTENT_TYPE], "application/x-ndjson");
  assert_eq!(calls.load(Ordering::SeqCst), 0);
  let lines = decode_lines(&body).unwrap();
  assert_eq!(
    lines,
    vec![
      DataLine::Nodes {
        nodes: vec![
          NodePayload::Skip,
          NodePayload::Data { data: Value::Null, uses: Value::Null },
          NodePayload::Data { data: json!({ "slug": "a" }), uses: json!({ "params": ["slug"] }) },
        ],
      },
      DataLine::End,
    ]
  );

  let (_, body) = get(&app, "/nowhere/__data.json").await;
  assert!(matches!(decode_lines(&body).unwrap()[0], DataLine::Error { status: 404, .. }));
}

#[tokio::test]
async fn data_request_redirect_is_a_line() {
  let manifest = Manifest::builder()
    .node(NodeDef::new("gate").server_load(server_load(|_ev| async move {
      Err::<(), _>(LoadError::redirect(303, "/login"))
    })))
    .page("/private", &["gate"])
    .build()
    .unwrap();
  let app = server(manifest);

  let (parts, body) = get(&app, "/private/__data.json").await;
  assert_eq!(parts.status, StatusCode::OK);
  assert_eq!(
    decode_lines(&body).unwrap(),
    vec![DataLine::Redirect { status: 303, location: "/login".into() }]
  );

  let (parts, _) = get(&app, "/private").await;
  assert_eq!(parts.status, StatusCode::SEE_OTHER);
  assert_eq!(parts.headers[LOCATION], "/login");
}

fn login_manifest() -> Manifest {
  let login = action(|event| async move {
    let form = event.form_data();
    match form.iter().find(|(k, _)| k == "email") {
      Some((_, email)) => ActionOutcome::success(json!({ "welcome": email })),
      None => ActionOutcome::fail(422, json!({ "missing": "email" })),
    }
  });
  let logout = action(|_event| async move { Err(LoadError::redirect(303, "/")) });
  Manifest::builder()
    .node(layout())
    .node(
      data_node("login", json!({ "title": "Sign in" }))
        .action("login", login)
        .action("logout", logout),
    )
    .page("/login", &["layout", "login"])
    .build()
    .unwrap()
}

fn post(path: &str, accept: &str, body: &'static str) -> http::Request<Bytes> {
  http::Request::post(format!("https://app.dev{path}"))
    .header("accept", accept)
    .header("content-type", "application/x-www-form-urlencoded")
    .body(Bytes::from_static(body.as_bytes()))
    .unwrap()
}

#[tokio::test]
async fn form_actions_answer_json_clients() {
  let app = server(login_manifest());

  let (parts, body) = send(&app, post("/login?/login", "application/json", "name=x")).await;
  assert_eq!(parts.status, StatusCode::UNPROCESSABLE_ENTITY);
  let body: Value = serde_json::from_str(&body).unwrap();
  assert_eq!(body, json!({ "type": "failure", "status": 422, "data": { "missing": "email" } }));

  let (parts, body) = send(&app, post("/login?/logout", "application/json", "")).await;
  assert_eq!(parts.status, StatusCode::OK);
  let body: Value = serde_json::from_str(&body).unwrap();
  assert_eq!(body["type"], "redirect");
  assert_eq!(body["location"], "/");

  let (parts, _) = send(&app, post("/login?/nope", "application/json", "")).await;
  assert_eq!(parts.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn form_actions_rerender_html_pages() {
  let app = server(login_manifest());

  let (parts, html) = send(&app, post("/login?/login", "text/html", "email=a%40b.dev")).await;
  assert_eq!(parts.status, StatusCode::OK);
  let page = main_json(&html);
  assert_eq!(page["form"]["welcome"], "a@b.dev");
  assert_eq!(page["data"]["title"], "Sign in");

  let (parts, html) = send(&app, post("/login?/login", "text/html", "")).await;
  assert_eq!(parts.status, StatusCode::UNPROCESSABLE_ENTITY);
  assert_eq!(main_json(&html)["form"]["missing"], "email");

  let (parts, _) = send(&app, post("/login?/logout", "text/html", "")).await;
  assert_eq!(parts.status, StatusCode::SEE_OTHER);
}

#[tokio::test]
async fn unsupported_methods_get_405() {
  let manifest = Manifest::builder()
    .node(NodeDef::new("page"))
    .page("/", &["page"])
    .endpoint("/api/n", text_endpoint(|_| "1".to_string()))
    .build()
    .unwrap();
  let app = server(manifest);

  let request = http::Request::post("https://app.dev/api/n").body(Bytes::new()).unwrap();
  let (parts, _) = send(&app, request).await;
  assert_eq!(parts.status, StatusCode::METHOD_NOT_ALLOWED);
  assert_eq!(parts.headers[ALLOW], "GET");

  let request = http::Request::delete("https://app.dev/").body(Bytes::new()).unwrap();
  let (parts, _) = send(&app, request).await;
  assert_eq!(parts.status, StatusCode::METHOD_NOT_ALLOWED);
  assert_eq!(parts.headers[ALLOW], "GET, HEAD");

  let request =
    http::Request::builder().method(Method::HEAD).uri("https://app.dev/api/n").body(Bytes::new());
  let (parts, body) = send(&app, request.unwrap()).await;
  assert_eq!(parts.status, StatusCode::OK);
  assert!(body.is_empty());
}

#[tokio::test]
async fn cache_control_follows_loads_and_personalization() {
  let manifest = Manifest::builder()
    .node(NodeDef::new("cached").server_load(server_load(|ev| async move {
      ev.set_headers([("cache-control", "public, max-age=60")])?;
      Ok(json!({}))
    })))
    .node(NodeDef::new("mine").server_load(server_load(|ev| async move {
      ev.set_headers([("cache-control", "public, max-age=60")])?;
      Ok(json!({ "session": ev.cookies().get("session") }))
    })))
    .node(NodeDef::new("plain"))
    .page("/cached", &["cached"])
    .page("/mine", &["mine"])
    .page("/plain", &["plain"])
    .build()
    .unwrap();
  let app = server(manifest);

  let (parts, _) = get(&app, "/cached").await;
  assert_eq!(parts.headers[CACHE_CONTROL], "public, max-age=60");
  let (parts, _) = get(&app, "/mine").await;
  assert_eq!(parts.headers[CACHE_CONTROL], "private, max-age=60");
  let (parts, _) = get(&app, "/plain").await;
  assert_eq!(parts.headers[CACHE_CONTROL], "no-cache");
}

struct Gatekeeper;

impl Hooks for Gatekeeper {
  fn handle(
    &self,
    event: RequestEvent,
    resolve: Resolve,
  ) -> BoxFuture<Result<Response, LoadError>> {
    Box::pin(async move {
      if event.url().pathname().starts_with("/admin") {
        return Err(HttpError::unauthorized("sign in first").into());
      }
      event.set_local(String::from("ada"));
      let mut response = resolve.run().await?;
      response.headers_mut().insert("x-served-by", http::HeaderValue::from_static("loam"));
      Ok(response)
    })
  }
}

#[tokio::test]
async fn handle_hook_wraps_resolution() {
  let manifest = Manifest::builder()
    .node(NodeDef::new("page").server_load(server_load(|ev| async move {
      Ok(json!({ "user": ev.local::<String>() }))
    })))
    .node(NodeDef::new("admin"))
    .page("/", &["page"])
    .page("/admin", &["admin"])
    .build()
    .unwrap();
  let app = Server::builder(manifest).renderer(JsonRenderer).hooks(Gatekeeper).build();

  let (parts, html) = get(&app, "/").await;
  assert_eq!(parts.headers["x-served-by"], "loam");
  assert_eq!(main_json(&html)["data"]["user"], "ada");

  let (parts, html) = get(&app, "/admin").await;
  assert_eq!(parts.status, StatusCode::UNAUTHORIZED);
  assert!(html.contains("sign in first"));
}

#[tokio::test]
async fn external_fetches_use_the_platform() {
  let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
  let log = seen.clone();
  let platform = move |request: FetchRequest| -> BoxFuture<Result<FetchResponse, LoadError>> {
    log.lock().unwrap().push((request.url.clone(), request.headers.contains_key("cookie")));
    Box::pin(async { Ok(FetchResponse::new(StatusCode::OK, "remote")) })
  };
  let manifest = Manifest::builder()
    .node(NodeDef::new("page").server_load(server_load(|ev| async move {
      let body = ev.fetch(FetchRequest::get("https://api.other.dev/v1")).await?.text();
      Ok(json!({ "body": body }))
    })))
    .page("/", &["page"])
    .build()
    .unwrap();
  let app = Server::builder(manifest).renderer(JsonRenderer).platform_fetch(platform).build();

  let request = http::Request::get("https://app.dev/")
    .header("cookie", "session=abc")
    .body(Bytes::new())
    .unwrap();
  let (_, html) = send(&app, request).await;
  assert_eq!(main_json(&html)["data"]["body"], "remote");
  assert_eq!(*seen.lock().unwrap(), vec![("https://api.other.dev/v1".to_string(), false)]);
}

#[tokio::test]
async fn base_path_scopes_the_app() {
  let manifest = Manifest::builder()
    .node(data_node("page", json!({ "ok": true })))
    .page("/", &["page"])
    .build()
    .unwrap();
  let options = ServerOptions { base_path: "/app".into(), ..Default::default() };
  let app = Server::builder(manifest).renderer(JsonRenderer).options(options).build();

  let (parts, html) = get(&app, "/app").await;
  assert_eq!(parts.status, StatusCode::OK);
  assert_eq!(main_json(&html)["data"]["ok"], true);
  let (parts, _) = get(&app, "/other").await;
  assert_eq!(parts.status, StatusCode::NOT_FOUND);
}

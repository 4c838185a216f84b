/* src/server/core/rust/src/event/tests.rs */

use futures_util::FutureExt;
use http::StatusCode;

use super::*;

struct EchoFetch;

impl Fetch for EchoFetch {
  fn fetch(
    &self,
    request: FetchRequest,
    _mode: FetchMode,
  ) -> BoxFuture<Result<FetchResponse, LoadError>> {
    Box::pin(async move { Ok(FetchResponse::new(StatusCode::OK, request.url)) })
  }
}

fn event(url: &str, cookie: Option<&str>) -> RequestEvent {
  let url = Url::parse(url).unwrap();
  let mut init = RequestInit::get(url.clone());
  init.params.insert("slug".into(), "hello".into());
  init.params.insert("lang".into(), "en".into());
  init.route_id = Some("/[lang]/blog/[slug]".into());
  RequestEvent::new(init, CookieJar::new(url, cookie), Arc::new(EchoFetch))
}

fn no_parent() -> ParentData {
  let fut: BoxFuture<Result<Arc<Map<String, Value>>, LoadError>> =
    Box::pin(async { Ok(Arc::new(Map::new())) });
  fut.shared()
}

#[test]
fn set_headers_rules() {
  let ev = event("https://a.dev/", None);
  ev.set_headers([("x-custom", "1"), ("cache-control", "max-age=60")]).unwrap();
  ev.set_headers([("cache-control", "private")]).unwrap();
  assert!(ev.set_headers([("x-custom", "2")]).is_err());
  assert!(ev.set_headers([("set-cookie", "a=b")]).is_err());
  let headers = ev.response_headers();
  assert_eq!(headers.headers["x-custom"], "1");
  assert_eq!(headers.cache_control, vec!["max-age=60", "private"]);
}

#[test]
fn locals_are_typed() {
  #[derive(Clone, PartialEq, Debug)]
  struct User(String);
  let ev = event("https://a.dev/", None);
  assert_eq!(ev.local::<User>(), None);
  ev.set_local(User("ada".into()));
  assert_eq!(ev.local::<User>(), Some(User("ada".into())));
}

#[test]
fn form_data_decodes_body() {
  let url = Url::parse("https://a.dev/login").unwrap();
  let mut init = RequestInit::get(url.clone());
  init.method = Method::POST;
  init.body = Bytes::from("user=ada&note=hi+there");
  let ev = RequestEvent::new(init, CookieJar::new(url, None), Arc::new(EchoFetch));
  assert_eq!(
    ev.form_data(),
    vec![("user".to_string(), "ada".to_string()), ("note".to_string(), "hi there".to_string())]
  );
}

#[test]
fn server_event_tracks_reads() {
  let tracker = LoadTracker::new();
  let request = event("https://a.dev/en/blog/hello?page=2", None);
  let ev = ServerLoadEvent::new(request, tracker.clone(), no_parent());
  assert_eq!(ev.param("slug"), Some("hello"));
  assert_eq!(ev.search_param("page").as_deref(), Some("2"));
  let route = ev.untrack(|| ev.route_id().map(str::to_string));
  assert_eq!(route.as_deref(), Some("/[lang]/blog/[slug]"));
  ev.depends("app:posts");
  let uses = tracker.snapshot();
  assert!(uses.params.contains("slug"));
  assert!(!uses.params.contains("lang"));
  assert!(uses.search_params.contains("page"));
  assert!(!uses.route);
  assert!(!uses.url);
  assert!(uses.dependencies.contains("app:posts"));
}

#[test]
fn tracked_cookie_read_is_impure_and_personal() {
  let tracker = LoadTracker::new();
  let request = event("https://a.dev/", Some("sid=1"));
  let ev = ServerLoadEvent::new(request.clone(), tracker.clone(), no_parent());
  ev.untrack(|| ev.cookies().get("sid"));
  assert!(!tracker.snapshot().impure);
  assert!(!request.cookies().is_personalized());
  assert_eq!(ev.cookies().get("sid").as_deref(), Some("1"));
  assert!(tracker.snapshot().impure);
  assert!(request.cookies().is_personalized());
}

#[tokio::test]
async fn fetch_records_resolved_url() {
  let tracker = LoadTracker::new();
  let request = event("https://a.dev/en/blog/hello", None);
  let ev = ServerLoadEvent::new(request, tracker.clone(), no_parent());
  let res = ev.fetch(FetchRequest::get("/api/posts")).await.unwrap();
  assert_eq!(res.text(), "/api/posts");
  assert!(tracker.snapshot().dependencies.contains("https://a.dev/api/posts"));
}

#[tokio::test]
async fn parent_marks_usage() {
  let tracker = LoadTracker::new();
  let ev = ServerLoadEvent::new(event("https://a.dev/", None), tracker.clone(), no_parent());
  assert!(ev.parent().await.unwrap().is_empty());
  assert!(tracker.snapshot().parent);
}

#[test]
fn universal_event_sees_own_data_only() {
  let scope = Arc::new(LoadScope {
    url: Url::parse("https://a.dev/x").unwrap(),
    params: Params::new(),
    route_id: Some("/x".into()),
    fetch: Arc::new(EchoFetch),
    request: None,
  });
  let mut own = Map::new();
  own.insert("mine".into(), Value::from(1));
  let ev = LoadEvent::new(scope, Some(Arc::new(own)), LoadTracker::new(), no_parent());
  assert_eq!(ev.data().and_then(|d| d.get("mine")), Some(&Value::from(1)));
  assert!(!ev.is_server());
  assert!(ev.set_headers([("x-a", "1")]).is_ok());
}

/* src/server/core/rust/src/cookies/tests.rs */

use super::*;

fn jar(url: &str, header: Option<&str>) -> CookieJar {
  CookieJar::new(Url::parse(url).unwrap(), header)
}

#[test]
fn path_matching_rules() {
  assert!(path_matches("/a", "/a"));
  assert!(path_matches("/a/b", "/a"));
  assert!(!path_matches("/ab", "/a"));
  assert!(path_matches("/a/b", "/a/"));
  assert!(!path_matches("/a", "/a/"));
  assert!(path_matches("/anything", "/"));
}

#[test]
fn domain_matching_rules() {
  assert!(domain_matches("example.com", Some("example.com")));
  assert!(domain_matches("api.example.com", Some("example.com")));
  assert!(domain_matches("api.example.com", Some(".example.com")));
  assert!(!domain_matches("badexample.com", Some("example.com")));
  assert!(domain_matches("anything", None));
}

#[test]
fn parses_and_decodes_request_cookies() {
  let jar = jar("https://a.dev/", Some("a=1; b=hello%20world; a=2; c=\"q\""));
  assert_eq!(jar.get("a").as_deref(), Some("1"));
  assert_eq!(jar.get("b").as_deref(), Some("hello world"));
  assert_eq!(jar.get("c").as_deref(), Some("q"));
  assert_eq!(jar.get("missing"), None);
}

#[test]
fn set_is_visible_to_get() {
  let jar = jar("https://a.dev/page", Some("theme=light"));
  jar.set("theme", "dark", CookieOptions::new()).unwrap();
  assert_eq!(jar.get("theme").as_deref(), Some("dark"));
  jar.delete("theme", CookieOptions::new()).unwrap();
  assert_eq!(jar.get("theme"), None);
}

#[test]
fn cookie_for_other_path_not_visible() {
  let jar = jar("https://a.dev/ab", None);
  jar.set("s", "1", CookieOptions::new().path("/a")).unwrap();
  assert_eq!(jar.get("s"), None);
}

#[test]
fn last_write_wins_per_key() {
  let jar = jar("https://a.dev/", None);
  jar.set("x", "1", CookieOptions::new()).unwrap();
  jar.set("x", "2", CookieOptions::new().path("/sub")).unwrap();
  jar.set("x", "3", CookieOptions::new()).unwrap();
  let headers = jar.set_cookie_headers();
  assert_eq!(headers.len(), 2);
  assert!(headers.iter().any(|h| h.starts_with("x=3;")));
  assert!(headers.iter().any(|h| h.starts_with("x=2;") && h.contains("Path=/sub")));
}

#[test]
fn domain_spellings_share_a_key() {
  let jar = jar("https://api.x.com/", None);
  jar.set("x", "1", CookieOptions::new().domain(".x.com")).unwrap();
  jar.set("x", "2", CookieOptions::new().domain("X.com")).unwrap();
  let headers = jar.set_cookie_headers();
  assert_eq!(headers.len(), 1);
  assert!(headers[0].starts_with("x=2;"));
}

#[test]
fn defaults_applied() {
  let jar = jar("https://a.dev/", None);
  let header = jar.serialize("sid", "a b", CookieOptions::new()).unwrap();
  assert_eq!(header, "sid=a%20b; Path=/; HttpOnly; Secure; SameSite=Lax");
}

#[test]
fn localhost_http_is_not_secure() {
  let jar = jar("http://localhost:5173/", None);
  let header = jar.serialize("sid", "1", CookieOptions::new()).unwrap();
  assert!(!header.contains("Secure"));
}

#[test]
fn explicit_attributes_serialized() {
  let jar = jar("https://a.dev/", None);
  let opts = CookieOptions::new()
    .domain("a.dev")
    .max_age(60)
    .http_only(false)
    .same_site(SameSite::Strict);
  let header = jar.serialize("k", "v", opts).unwrap();
  assert_eq!(header, "k=v; Max-Age=60; Domain=a.dev; Path=/; Secure; SameSite=Strict");
}

#[test]
fn invalid_names_and_attributes_rejected() {
  let jar = jar("https://a.dev/", None);
  let err = jar.set("bad name", "v", CookieOptions::new());
  assert!(matches!(err, Err(CookieError::InvalidName(_))));
  assert!(jar.set("", "v", CookieOptions::new()).is_err());
  assert!(jar.set("ok", "v", CookieOptions::new().path("/a;b")).is_err());
}

#[test]
fn forwarded_header_respects_target_path() {
  let jar = jar("https://a.dev/", Some("sid=1"));
  jar.set("scoped", "yes", CookieOptions::new().path("/a")).unwrap();
  let for_sub = jar.cookie_header_for(&Url::parse("https://a.dev/a/b").unwrap()).unwrap();
  assert_eq!(for_sub, "scoped=yes; sid=1");
  let for_other = jar.cookie_header_for(&Url::parse("https://a.dev/ab").unwrap()).unwrap();
  assert_eq!(for_other, "sid=1");
}

#[test]
fn deleted_cookie_not_forwarded() {
  let jar = jar("https://a.dev/", Some("sid=1"));
  jar.delete("sid", CookieOptions::new()).unwrap();
  assert_eq!(jar.cookie_header_for(&Url::parse("https://a.dev/x").unwrap()), None);
  assert_eq!(
    jar.set_cookie_headers(),
    vec!["sid=; Max-Age=0; Path=/; HttpOnly; Secure; SameSite=Lax"]
  );
}

#[test]
fn applies_set_cookie_from_fetch() {
  let jar = jar("https://a.dev/", None);
  jar.apply_set_cookie("token=abc%3D; Path=/api; HttpOnly; SameSite=None; Max-Age=30").unwrap();
  let cookies = jar.new_cookies();
  assert_eq!(cookies.len(), 1);
  assert_eq!(cookies[0].value, "abc=");
  assert_eq!(cookies[0].options.path, "/api");
  assert!(cookies[0].options.http_only);
  assert!(!cookies[0].options.secure);
  assert_eq!(cookies[0].options.same_site, SameSite::None);
  assert_eq!(cookies[0].options.max_age, Some(30));
}

#[test]
fn get_all_merges_visible() {
  let jar = jar("https://a.dev/x", Some("a=1; b=2"));
  jar.set("b", "3", CookieOptions::new()).unwrap();
  jar.set("c", "4", CookieOptions::new().path("/other")).unwrap();
  assert_eq!(
    jar.get_all(),
    vec![("a".to_string(), "1".to_string()), ("b".to_string(), "3".to_string())]
  );
}

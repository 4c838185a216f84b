/* src/server/core/rust/src/server/fetcher.rs */

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use http::header::{AGE, AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE, COOKIE, SET_COOKIE};
use http::{HeaderValue, Method};
use loam_engine::RecordedFetch;

use super::ServerInner;
use crate::errors::LoadError;
use crate::event::{RequestEvent, WeakRequestEvent};
use crate::fetch::{Fetch, FetchKey, FetchMode, FetchRequest, FetchResponse, Inflight};
use crate::hooks::FetchNext;
use crate::load::BoxFuture;
use crate::url::Url;

/// Universal-load responses captured for the hydration payload.
pub(crate) type FetchLog = Arc<Mutex<Vec<RecordedFetch>>>;

/// `event.fetch` during server rendering.
pub(crate) struct ServerFetcher {
  server: Arc<ServerInner>,
  event: WeakRequestEvent,
  depth: usize,
  inflight: Inflight,
  log: FetchLog,
}

impl ServerFetcher {
  pub(crate) fn new(
    server: Arc<ServerInner>,
    event: WeakRequestEvent,
    depth: usize,
    log: FetchLog,
  ) -> Self {
    Self { server, event, depth, inflight: Inflight::default(), log }
  }
}

fn fail(message: String) -> BoxFuture<Result<FetchResponse, LoadError>> {
  Box::pin(async move { Err(LoadError::unexpected(anyhow::anyhow!(message))) })
}

impl Fetch for ServerFetcher {
  fn fetch(
    &self,
    mut request: FetchRequest,
    mode: FetchMode,
  ) -> BoxFuture<Result<FetchResponse, LoadError>> {
    let Some(event) = self.event.upgrade() else {
      return fail(format!("fetch to {} after the request finished", request.url));
    };
    let Some(target) = event.url().join(&request.url) else {
      return fail(format!("invalid fetch url `{}`", request.url));
    };
    let href = target.to_string();
    request.url.clone_from(&href);
    let method = request.method.clone();
    let body = request.body.clone();
    let signal = event.abort_signal().clone();

    let server = Arc::clone(&self.server);
    let depth = self.depth;
    let key = FetchKey::new(&method, &href, &body);
    let pending = self.inflight.run(key, move || {
      let next_server = Arc::clone(&server);
      let next_event = event.clone();
      let next = FetchNext::new(move |request| send(next_server, next_event, request, depth));
      server.hooks.handle_fetch(request, event, next)
    });

    let log = Arc::clone(&self.log);
    Box::pin(async move {
      let response = signal.guard(pending).await?;
      if mode == FetchMode::Universal {
        record(&log, &method, &href, &body, &response);
      }
      Ok(response)
    })
  }
}

/// Perform a fetch after `handle_fetch`: app routes in process, anything
/// else through the platform.
fn send(
  server: Arc<ServerInner>,
  event: RequestEvent,
  mut request: FetchRequest,
  depth: usize,
) -> BoxFuture<Result<FetchResponse, LoadError>> {
  Box::pin(async move {
    let target = event.url().join(&request.url).ok_or_else(|| {
      LoadError::unexpected(anyhow::anyhow!("invalid fetch url `{}`", request.url))
    })?;
    request.url = target.to_string();
    if !target.same_origin(event.url()) {
      return server.platform.send(request).await;
    }

    forward_credentials(&event, &target, &mut request);
    let response = if server.owns_path(target.pathname()) {
      let max = server.options.max_fetch_depth;
      if depth >= max {
        return Err(LoadError::unexpected(anyhow::anyhow!(
          "internal fetch to {} nested deeper than {max} levels",
          request.url
        )));
      }
      tracing::debug!(url = %request.url, depth, "dispatching internal fetch in process");
      server.dispatch_internal(&event, request, depth + 1).await?
    } else {
      server.platform.send(request).await?
    };

    for value in response.headers.get_all(SET_COOKIE) {
      let Ok(value) = value.to_str() else { continue };
      if let Err(err) = event.cookies().apply_set_cookie(value) {
        tracing::warn!(%err, "ignored set-cookie from internal fetch");
      }
    }
    Ok(response)
  })
}

/// Same-origin targets receive the jar's matching cookies and the caller's
/// `authorization` header; either makes the response personalized.
fn forward_credentials(event: &RequestEvent, target: &Url, request: &mut FetchRequest) {
  let mut credentialed = false;
  if !request.headers.contains_key(COOKIE)
    && let Some(cookie) = event.cookies().cookie_header_for(target)
    && let Ok(value) = HeaderValue::try_from(cookie)
  {
    request.headers.insert(COOKIE, value);
    credentialed = true;
  }
  if !request.headers.contains_key(AUTHORIZATION)
    && let Some(auth) = event.headers().get(AUTHORIZATION)
  {
    request.headers.insert(AUTHORIZATION, auth.clone());
    credentialed = true;
  }
  if credentialed {
    event.cookies().mark_personalized();
  }
}

fn record(log: &FetchLog, method: &Method, href: &str, body: &Bytes, response: &FetchResponse) {
  let request_body = (!body.is_empty()).then(|| String::from_utf8_lossy(body).into_owned());
  let mut log = log.lock().unwrap_or_else(PoisonError::into_inner);
  let seen = log
    .iter()
    .any(|f| f.url == href && f.method == method.as_str() && f.request_body == request_body);
  if seen {
    return;
  }
  let headers: BTreeMap<String, String> = [CACHE_CONTROL, AGE, CONTENT_TYPE]
    .iter()
    .filter_map(|name| {
      let value = response.headers.get(name)?.to_str().ok()?;
      Some((name.as_str().to_string(), value.to_string()))
    })
    .collect();
  log.push(RecordedFetch {
    url: href.to_string(),
    method: method.as_str().to_string(),
    request_body,
    status: response.status.as_u16(),
    headers,
    body: response.text(),
  });
}

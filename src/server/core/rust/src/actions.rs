/* src/server/core/rust/src/actions.rs */

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::errors::{LoadError, Redirect};
use crate::event::RequestEvent;
use crate::load::BoxFuture;

/// Result of a form action.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
  /// Re-render the page with `form` set to the data.
  Success(Option<Value>),
  /// Validation failure returned to the caller with its status; no boundary.
  Failure { status: u16, data: Value },
  Redirect(Redirect),
}

impl ActionOutcome {
  pub fn success(data: impl Serialize) -> Result<Self, LoadError> {
    Ok(Self::Success(Some(serde_json::to_value(data)?)))
  }

  /// Statuses outside 400..=499 are coerced to 400.
  pub fn fail(status: u16, data: impl Serialize) -> Result<Self, LoadError> {
    let status = if (400..500).contains(&status) { status } else { 400 };
    Ok(Self::Failure { status, data: serde_json::to_value(data)? })
  }

  pub fn status(&self) -> u16 {
    match self {
      Self::Success(_) => 200,
      Self::Failure { status, .. } => *status,
      Self::Redirect(r) => r.status,
    }
  }

  /// Body sent to clients that asked for JSON.
  pub fn to_json(&self) -> Value {
    match self {
      Self::Success(data) => {
        serde_json::json!({ "type": "success", "status": 200, "data": data })
      }
      Self::Failure { status, data } => {
        serde_json::json!({ "type": "failure", "status": status, "data": data })
      }
      Self::Redirect(r) => {
        serde_json::json!({ "type": "redirect", "status": r.status, "location": r.location })
      }
    }
  }
}

pub type ActionFn =
  Arc<dyn Fn(RequestEvent) -> BoxFuture<Result<ActionOutcome, LoadError>> + Send + Sync>;

pub fn action<F, Fut>(f: F) -> ActionFn
where
  F: Fn(RequestEvent) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<ActionOutcome, LoadError>> + Send + 'static,
{
  Arc::new(move |event| Box::pin(f(event)))
}

/// Action name from a `?/name` query; `default` for a bare POST.
pub fn action_name(query: Option<&str>) -> Result<String, LoadError> {
  let Some(query) = query else {
    return Ok("default".to_string());
  };
  let named = query.split('&').find_map(|pair| pair.strip_prefix('/'));
  match named {
    Some("default") => Err(
      crate::errors::HttpError::validation("use `?/` without a name to call the default action")
        .into(),
    ),
    Some(name) if !name.is_empty() => Ok(name.split('=').next().unwrap_or(name).to_string()),
    _ => Ok("default".to_string()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn name_from_query() {
    assert_eq!(action_name(None).unwrap(), "default");
    assert_eq!(action_name(Some("/login")).unwrap(), "login");
    assert_eq!(action_name(Some("x=1&/logout")).unwrap(), "logout");
    assert_eq!(action_name(Some("/")).unwrap(), "default");
    assert!(action_name(Some("/default")).is_err());
  }

  #[test]
  fn fail_status_coerced() {
    assert_eq!(ActionOutcome::fail(422, "bad").unwrap().status(), 422);
    assert_eq!(ActionOutcome::fail(500, "bad").unwrap().status(), 400);
  }

  #[test]
  fn json_shapes() {
    let ok = ActionOutcome::success(serde_json::json!({"id": 1})).unwrap().to_json();
    assert_eq!(ok, serde_json::json!({"type": "success", "status": 200, "data": {"id": 1}}));
    let redirect = ActionOutcome::Redirect(Redirect::see_other("/done")).to_json();
    assert_eq!(redirect["location"], "/done");
    assert_eq!(redirect["status"], 303);
  }
}

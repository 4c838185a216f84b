/* src/server/core/rust/src/matcher.rs */

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::manifest::RouteDef;
use crate::route::CompiledRoute;
use crate::url::decode_uri_component;

/// Decoded route parameters. Absent optional parameters have no entry.
pub type Params = BTreeMap<String, String>;

/// Named predicate consulted for `[param=name]` slots.
pub type ParamMatcher = Arc<dyn Fn(&str) -> bool + Send + Sync>;

pub type MatcherMap = HashMap<String, ParamMatcher>;

/// Wrap a closure as a param matcher.
pub fn param_matcher(f: impl Fn(&str) -> bool + Send + Sync + 'static) -> ParamMatcher {
  Arc::new(f)
}

/// A route resolved for one pathname.
pub struct RouteMatch<'a> {
  pub route: &'a RouteDef,
  pub params: Params,
}

/// Extract params from `pathname` if `route` matches it and every declared
/// matcher accepts its value.
pub fn exec(route: &CompiledRoute, pathname: &str, matchers: &MatcherMap) -> Option<Params> {
  let caps = route.pattern.captures(pathname)?;
  let mut params = Params::new();
  for (i, param) in route.params.iter().enumerate() {
    let raw = caps.get(i + 1).map(|m| m.as_str());
    let value = match raw {
      Some(v) if !(param.optional && v.is_empty()) => decode_param(v, param.rest),
      _ if param.rest => String::new(),
      _ => continue,
    };
    if let Some(name) = &param.matcher {
      // unregistered matchers are rejected when the manifest is built
      let accepted = matchers.get(name).is_some_and(|m| m(&value));
      if !accepted {
        return None;
      }
    }
    params.insert(param.name.clone(), value);
  }
  Some(params)
}

fn decode_param(raw: &str, rest: bool) -> String {
  if rest {
    // decode per segment so an encoded `%2F` stays inside its segment
    raw.split('/').map(decode_uri_component).collect::<Vec<_>>().join("/")
  } else {
    decode_uri_component(raw)
  }
}

/// First route in priority order whose pattern and matchers accept `pathname`.
pub fn match_path<'a>(
  routes: &'a [RouteDef],
  matchers: &MatcherMap,
  pathname: &str,
) -> Option<RouteMatch<'a>> {
  routes.iter().find_map(|route| {
    exec(&route.compiled, pathname, matchers).map(|params| RouteMatch { route, params })
  })
}

/* src/server/core/rust/src/route.rs */

use std::cmp::{Ordering, Reverse};

use regex::Regex;

use crate::errors::ServerError;

/// One parameter slot of a route id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteParam {
  pub name: String,
  pub matcher: Option<String>,
  pub optional: bool,
  pub rest: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
  Static(String),
  Param(RouteParam),
}

/// A route id segment after `(group)` segments are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Segment {
  parts: Vec<Part>,
}

impl Segment {
  fn sole_param(&self) -> Option<&RouteParam> {
    match self.parts.as_slice() {
      [Part::Param(p)] => Some(p),
      _ => None,
    }
  }

  fn is_rest(&self) -> bool {
    self.sole_param().is_some_and(|p| p.rest)
  }

  /// Lower ranks are more specific.
  fn rank(&self) -> (u8, Reverse<usize>) {
    let static_len: usize = self
      .parts
      .iter()
      .map(|p| match p {
        Part::Static(s) => s.len(),
        Part::Param(_) => 0,
      })
      .sum();
    if let Some(p) = self.sole_param() {
      let kind = if p.rest {
        5
      } else if p.optional {
        4
      } else if p.matcher.is_some() {
        2
      } else {
        3
      };
      return (kind, Reverse(0));
    }
    if self.parts.iter().all(|p| matches!(p, Part::Static(_))) {
      (0, Reverse(static_len))
    } else {
      (1, Reverse(static_len))
    }
  }
}

/// A route id compiled to its matching regex.
#[derive(Debug, Clone)]
pub struct CompiledRoute {
  pub id: String,
  pub pattern: Regex,
  pub params: Vec<RouteParam>,
  pub(crate) segments: Vec<Segment>,
}

fn invalid(id: &str, reason: impl Into<String>) -> ServerError {
  ServerError::RouteId { id: id.to_string(), reason: reason.into() }
}

fn valid_name(name: &str) -> bool {
  let mut chars = name.chars();
  chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_group(segment: &str) -> bool {
  segment.len() > 2 && segment.starts_with('(') && segment.ends_with(')')
}

fn parse_param(id: &str, inner: &str, optional: bool) -> Result<RouteParam, ServerError> {
  let (rest, body) = match inner.strip_prefix("...") {
    Some(b) => (true, b),
    None => (false, inner),
  };
  if rest && optional {
    return Err(invalid(id, "a rest parameter is already optional"));
  }
  let (name, matcher) = match body.split_once('=') {
    Some((n, m)) => (n, Some(m)),
    None => (body, None),
  };
  if !valid_name(name) {
    return Err(invalid(id, format!("invalid parameter name `{name}`")));
  }
  if let Some(m) = matcher
    && !valid_name(m)
  {
    return Err(invalid(id, format!("invalid matcher name `{m}`")));
  }
  Ok(RouteParam { name: name.to_string(), matcher: matcher.map(str::to_string), optional, rest })
}

fn parse_segment(id: &str, raw: &str) -> Result<Segment, ServerError> {
  let mut parts = Vec::new();
  let mut rest = raw;
  while !rest.is_empty() {
    let Some(open) = rest.find('[') else {
      if rest.contains(']') {
        return Err(invalid(id, "unbalanced `]`"));
      }
      parts.push(Part::Static(rest.to_string()));
      break;
    };
    if open > 0 {
      let literal = &rest[..open];
      if literal.contains(']') {
        return Err(invalid(id, "unbalanced `]`"));
      }
      parts.push(Part::Static(literal.to_string()));
    }
    let after = &rest[open..];
    let (optional, inner, consumed) = if let Some(body) = after.strip_prefix("[[") {
      let close = body.find("]]").ok_or_else(|| invalid(id, "unterminated `[[`"))?;
      (true, &body[..close], close + 4)
    } else {
      let close = after.find(']').ok_or_else(|| invalid(id, "unterminated `[`"))?;
      (false, &after[1..close], close + 1)
    };
    if matches!(parts.last(), Some(Part::Param(_))) {
      return Err(invalid(id, "parameters must be separated by static text"));
    }
    parts.push(Part::Param(parse_param(id, inner, optional)?));
    rest = &after[consumed..];
  }
  Ok(Segment { parts })
}

/// Compile a route id such as `/blog/[slug]` or `/files/[...path]`.
pub fn parse_route_id(id: &str) -> Result<CompiledRoute, ServerError> {
  if !id.starts_with('/') {
    return Err(invalid(id, "route ids start with `/`"));
  }
  let mut segments = Vec::new();
  for raw in id.split('/').skip(1) {
    if raw.is_empty() || is_group(raw) {
      continue;
    }
    segments.push(parse_segment(id, raw)?);
  }

  let mut source = String::from("^");
  let mut params = Vec::new();
  for segment in &segments {
    if let Some(p) = segment.sole_param()
      && (p.rest || p.optional)
    {
      source.push_str(if p.rest { "(?:/(.*))?" } else { "(?:/([^/]+))?" });
      params.push(p.clone());
      continue;
    }
    source.push('/');
    for part in &segment.parts {
      match part {
        Part::Static(s) => source.push_str(&regex::escape(s)),
        Part::Param(p) => {
          source.push_str(if p.rest {
            "(.*?)"
          } else if p.optional {
            "([^/]*)?"
          } else {
            "([^/]+?)"
          });
          params.push(p.clone());
        }
      }
    }
  }
  if segments.is_empty() {
    source.push('/');
  } else {
    source.push_str("/?");
  }
  source.push('$');

  let mut seen = std::collections::HashSet::new();
  for p in &params {
    if !seen.insert(p.name.as_str()) {
      return Err(invalid(id, format!("duplicate parameter `{}`", p.name)));
    }
  }

  let pattern = Regex::new(&source).map_err(|e| invalid(id, e.to_string()))?;
  Ok(CompiledRoute { id: id.to_string(), pattern, params, segments })
}

/// Specificity order: static > matcher-constrained > dynamic > optional > rest.
/// A route that stops where the other continues with only optional or rest
/// segments sorts first. Equal routes compare `Equal` so a stable sort keeps
/// declaration order.
pub(crate) fn compare_specificity(a: &CompiledRoute, b: &CompiledRoute) -> Ordering {
  let (sa, sb) = (&a.segments, &b.segments);
  for i in 0..sa.len().max(sb.len()) {
    match (sa.get(i), sb.get(i)) {
      (None, Some(_)) => return Ordering::Less,
      (Some(_), None) => return Ordering::Greater,
      (Some(x), Some(y)) => {
        if x.is_rest() && y.is_rest() {
          // a rest followed by more segments is the narrower route
          let (tail_a, tail_b) = (sa.len() - i, sb.len() - i);
          if tail_a != tail_b {
            return tail_b.cmp(&tail_a);
          }
          continue;
        }
        match x.rank().cmp(&y.rank()) {
          Ordering::Equal => {}
          ord => return ord,
        }
      }
      (None, None) => break,
    }
  }
  Ordering::Equal
}

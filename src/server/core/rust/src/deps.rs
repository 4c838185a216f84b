/* src/server/core/rust/src/deps.rs */

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::matcher::Params;
use crate::url::Url;

/// What a single load read while it ran.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Uses {
  /// Custom keys from `depends` plus resolved hrefs of fetched URLs.
  #[serde(skip_serializing_if = "BTreeSet::is_empty")]
  pub dependencies: BTreeSet<String>,
  #[serde(skip_serializing_if = "BTreeSet::is_empty")]
  pub params: BTreeSet<String>,
  #[serde(skip_serializing_if = "BTreeSet::is_empty")]
  pub search_params: BTreeSet<String>,
  #[serde(skip_serializing_if = "std::ops::Not::not")]
  pub parent: bool,
  #[serde(skip_serializing_if = "std::ops::Not::not")]
  pub route: bool,
  #[serde(skip_serializing_if = "std::ops::Not::not")]
  pub url: bool,
  /// Read an impure source (cookies) while tracked.
  #[serde(skip_serializing_if = "std::ops::Not::not")]
  pub impure: bool,
}

impl Uses {
  /// Union of two records, e.g. a node's server and universal loads.
  pub fn merge(&self, other: &Uses) -> Uses {
    Uses {
      dependencies: self.dependencies.union(&other.dependencies).cloned().collect(),
      params: self.params.union(&other.params).cloned().collect(),
      search_params: self.search_params.union(&other.search_params).cloned().collect(),
      parent: self.parent || other.parent,
      route: self.route || other.route,
      url: self.url || other.url,
      impure: self.impure || other.impure,
    }
  }
}

#[derive(Default)]
struct TrackerInner {
  uses: Mutex<Uses>,
  untracked: AtomicUsize,
}

/// Records dependencies for one load invocation.
#[derive(Clone, Default)]
pub struct LoadTracker {
  inner: Arc<TrackerInner>,
}

impl LoadTracker {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn is_tracking(&self) -> bool {
    self.inner.untracked.load(Ordering::SeqCst) == 0
  }

  fn record(&self, f: impl FnOnce(&mut Uses)) {
    if !self.is_tracking() {
      return;
    }
    let mut uses = self.inner.uses.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut uses);
  }

  /// Declare a dependency. Keys starting with `/` or `.` are resolved
  /// against `base` so they compare equal to fetched URLs.
  pub fn depends(&self, key: &str, base: &Url) {
    let key = resolve_key(key, base);
    self.record(|u| {
      u.dependencies.insert(key);
    });
  }

  pub fn record_fetch(&self, href: &str) {
    self.record(|u| {
      u.dependencies.insert(href.to_string());
    });
  }

  pub fn record_param(&self, name: &str) {
    self.record(|u| {
      u.params.insert(name.to_string());
    });
  }

  pub fn record_params<'a>(&self, names: impl IntoIterator<Item = &'a String>) {
    self.record(|u| u.params.extend(names.into_iter().cloned()));
  }

  pub fn record_search_param(&self, name: &str) {
    self.record(|u| {
      u.search_params.insert(name.to_string());
    });
  }

  pub fn record_url(&self) {
    self.record(|u| u.url = true);
  }

  pub fn record_route(&self) {
    self.record(|u| u.route = true);
  }

  pub fn record_parent(&self) {
    self.record(|u| u.parent = true);
  }

  pub fn record_impure(&self) {
    self.record(|u| u.impure = true);
  }

  /// Run `f` without recording anything it reads.
  pub fn untrack<R>(&self, f: impl FnOnce() -> R) -> R {
    self.inner.untracked.fetch_add(1, Ordering::SeqCst);
    let guard = UntrackGuard(&self.inner.untracked);
    let out = f();
    drop(guard);
    out
  }

  pub fn snapshot(&self) -> Uses {
    self.inner.uses.lock().unwrap_or_else(PoisonError::into_inner).clone()
  }
}

struct UntrackGuard<'a>(&'a AtomicUsize);

impl Drop for UntrackGuard<'_> {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}

pub(crate) fn resolve_key(key: &str, base: &Url) -> String {
  if (key.starts_with('/') || key.starts_with('.'))
    && let Some(url) = base.join(key)
  {
    return url.to_string();
  }
  key.to_string()
}

/// A request to rerun loads.
#[derive(Clone)]
pub enum Invalidation {
  /// A custom key or a resolved href.
  Key(String),
  /// Matches any recorded dependency for which the predicate holds.
  Predicate(Arc<dyn Fn(&str) -> bool + Send + Sync>),
  All,
}

impl Invalidation {
  pub fn predicate(f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
    Self::Predicate(Arc::new(f))
  }

  fn hits(&self, uses: &Uses) -> bool {
    match self {
      Self::All => true,
      Self::Key(key) => uses.dependencies.contains(key),
      Self::Predicate(f) => uses.dependencies.iter().any(|d| f(d)),
    }
  }
}

impl fmt::Debug for Invalidation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Key(k) => f.debug_tuple("Key").field(k).finish(),
      Self::Predicate(_) => f.write_str("Predicate(..)"),
      Self::All => f.write_str("All"),
    }
  }
}

/// A load is stale under a non-empty invalidation set when it declared or
/// fetched an invalidated key, or when it read an impure source.
pub fn stale_on_invalidation(uses: &Uses, invalidations: &[Invalidation]) -> bool {
  if invalidations.is_empty() {
    return false;
  }
  uses.impure || invalidations.iter().any(|inv| inv.hits(uses))
}

/// The two ends of a client navigation.
pub struct NavigationChange<'a> {
  pub from_url: &'a Url,
  pub to_url: &'a Url,
  pub from_params: &'a Params,
  pub to_params: &'a Params,
  pub from_route: Option<&'a str>,
  pub to_route: Option<&'a str>,
}

/// Staleness caused by the navigation itself, ignoring node identity.
pub fn stale_on_navigation(uses: &Uses, change: &NavigationChange<'_>) -> bool {
  if uses.url && change.from_url != change.to_url {
    return true;
  }
  if uses.route && change.from_route != change.to_route {
    return true;
  }
  if uses.params.iter().any(|p| change.from_params.get(p) != change.to_params.get(p)) {
    return true;
  }
  if !uses.search_params.is_empty() {
    let (from, to) = (change.from_url, change.to_url);
    return uses.search_params.iter().any(|p| from.search_param(p) != to.search_param(p));
  }
  false
}

/// What the planner knows about a previously loaded node.
pub struct LoadedNode<'a> {
  pub id: &'a str,
  /// `None` when the node has no server load.
  pub uses: Option<&'a Uses>,
}

/// Decide per branch index whether the node must rerun. Once a node reruns
/// every descendant reruns too.
pub fn plan_reruns(
  previous: &[LoadedNode<'_>],
  next_ids: &[&str],
  change: Option<&NavigationChange<'_>>,
  invalidations: &[Invalidation],
) -> Vec<bool> {
  let mut plan = Vec::with_capacity(next_ids.len());
  let mut ancestor_reran = false;
  for (i, id) in next_ids.iter().enumerate() {
    let rerun = ancestor_reran
      || match previous.get(i) {
        None => true,
        Some(prev) if prev.id != *id => true,
        Some(prev) => prev.uses.is_some_and(|uses| {
          stale_on_invalidation(uses, invalidations)
            || change.is_some_and(|c| stale_on_navigation(uses, c))
        }),
      };
    ancestor_reran |= rerun;
    plan.push(rerun);
  }
  plan
}

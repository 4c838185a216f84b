/* src/server/core/rust/src/build_loader/types.rs */

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::config::ServerOptions;

/// `route-manifest.json` as written by the build.
#[derive(Deserialize)]
pub(super) struct RouteManifest {
  #[serde(default)]
  pub(super) nodes: BTreeMap<String, NodeEntry>,
  pub(super) routes: BTreeMap<String, RouteEntry>,
  #[serde(default)]
  pub(super) root: Option<String>,
  /// App shell file, relative to the build directory.
  #[serde(default)]
  pub(super) template: Option<String>,
  #[serde(default)]
  pub(super) options: ServerOptions,
}

/// Which handlers the build expects the registry to supply for a node.
#[derive(Deserialize, Default)]
#[serde(default)]
pub(super) struct NodeEntry {
  pub(super) server: bool,
  pub(super) universal: bool,
  pub(super) error_boundary: bool,
  pub(super) actions: Vec<String>,
}

#[derive(Deserialize)]
pub(super) struct RouteEntry {
  #[serde(default)]
  pub(super) page: Option<Vec<String>>,
  /// Registry name of the route's endpoint.
  #[serde(default)]
  pub(super) endpoint: Option<String>,
}

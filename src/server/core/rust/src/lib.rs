/* src/server/core/rust/src/lib.rs */

pub mod actions;
pub mod body;
pub mod build_loader;
pub mod cache;
pub mod client;
pub mod config;
pub mod cookies;
pub mod deps;
pub mod errors;
pub mod event;
pub mod fetch;
pub mod hooks;
pub mod load;
pub mod manifest;
pub mod matcher;
pub mod orchestrate;
pub mod route;
pub mod server;
pub mod stream;
pub mod url;

// Re-exports for ergonomic use
pub use actions::{ActionFn, ActionOutcome, action};
pub use body::Body;
pub use build_loader::{NodeRegistry, load_build_output, parse_route_manifest};
pub use client::{ClientPage, ClientRouter, InProcess, NavigationOutcome, ServerDataSource};
pub use config::ServerOptions;
pub use cookies::{CookieJar, CookieOptions, SameSite};
pub use deps::{Invalidation, Uses};
pub use errors::{HttpError, LoadError, Redirect, ServerError};
pub use event::{LoadEvent, RequestEvent, ServerLoadEvent};
pub use fetch::{
  AbortController, AbortSignal, Fetch, FetchRequest, FetchResponse, NoNetwork, PlatformFetch,
};
pub use hooks::{DefaultHooks, FetchNext, Hooks, Resolve, Response};
pub use load::{
  BoxFuture, BoxStream, IntoLoadOutput, LoadOutput, ServerLoadFn, UniversalLoadFn, server_load,
  universal_load,
};
pub use loam_macros::{loam_load, loam_server_load};
pub use manifest::{EndpointDef, EndpointFn, Manifest, ManifestBuilder, NodeDef, endpoint};
pub use matcher::{ParamMatcher, Params, param_matcher};
pub use server::{
  ClientOnly, PageRenderer, RenderContext, RenderedPage, RequestContext, Server, ServerBuilder,
};
pub use url::Url;

#[cfg(test)]
extern crate self as loam_server;

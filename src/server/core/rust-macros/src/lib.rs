/* src/server/core/rust-macros/src/lib.rs */

mod load;

use proc_macro::TokenStream;
use syn::{ItemFn, parse_macro_input};

/// Mark an `async fn(ServerLoadEvent) -> Result<T, LoadError>` as a node's
/// server load. Generates `<fn>_server_load()` and `register_<fn>(registry)`;
/// `#[loam_server_load(node = "id")]` overrides the node id.
#[proc_macro_attribute]
pub fn loam_server_load(attr: TokenStream, item: TokenStream) -> TokenStream {
  let item = parse_macro_input!(item as ItemFn);
  load::expand(attr.into(), item, load::Kind::Server)
    .unwrap_or_else(syn::Error::into_compile_error)
    .into()
}

/// Mark an `async fn(LoadEvent) -> Result<T, LoadError>` as a node's
/// universal load. Generates `<fn>_load()` and `register_<fn>(registry)`.
#[proc_macro_attribute]
pub fn loam_load(attr: TokenStream, item: TokenStream) -> TokenStream {
  let item = parse_macro_input!(item as ItemFn);
  load::expand(attr.into(), item, load::Kind::Universal)
    .unwrap_or_else(syn::Error::into_compile_error)
    .into()
}

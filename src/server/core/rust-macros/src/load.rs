/* src/server/core/rust-macros/src/load.rs */

use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::parse::{Parse, ParseStream};
use syn::{FnArg, ItemFn, LitStr, Pat, ReturnType, Token};

#[derive(Clone, Copy)]
pub(crate) enum Kind {
  Server,
  Universal,
}

impl Kind {
  fn label(self) -> &'static str {
    match self {
      Kind::Server => "server_load",
      Kind::Universal => "load",
    }
  }
}

pub(crate) struct LoadAttr {
  pub node: Option<String>,
}

impl Parse for LoadAttr {
  fn parse(input: ParseStream) -> syn::Result<Self> {
    let mut node = None;
    while !input.is_empty() {
      let ident: syn::Ident = input.parse()?;
      if ident == "node" {
        input.parse::<Token![=]>()?;
        let lit: LitStr = input.parse()?;
        node = Some(lit.value());
      } else {
        return Err(syn::Error::new_spanned(ident, "expected `node`"));
      }
      if input.is_empty() {
        break;
      }
      input.parse::<Token![,]>()?;
    }
    Ok(LoadAttr { node })
  }
}

/// Keep the function and add `<fn>_<kind>()` returning the boxed load plus
/// `register_<fn>(registry)` that files it under its node id.
pub(crate) fn expand(attr: TokenStream, item: ItemFn, kind: Kind) -> syn::Result<TokenStream> {
  let attr: LoadAttr = syn::parse2(attr)?;
  check_signature(&item, kind)?;

  let fn_name = &item.sig.ident;
  let vis = &item.vis;
  let factory = format_ident!("{}_{}", fn_name, kind.label());
  let register = format_ident!("register_{}", fn_name);
  let node = attr.node.unwrap_or_else(|| fn_name.to_string());

  let (fn_type, wrap, add) = match kind {
    Kind::Server => (
      quote! { loam_server::ServerLoadFn },
      quote! { loam_server::server_load },
      quote! { server_load },
    ),
    Kind::Universal => (
      quote! { loam_server::UniversalLoadFn },
      quote! { loam_server::universal_load },
      quote! { universal_load },
    ),
  };

  Ok(quote! {
    #item

    #vis fn #factory() -> #fn_type {
      #wrap(#fn_name)
    }

    #vis fn #register(registry: loam_server::NodeRegistry) -> loam_server::NodeRegistry {
      registry.#add(#node, #factory())
    }
  })
}

fn check_signature(item: &ItemFn, kind: Kind) -> syn::Result<()> {
  let sig = &item.sig;
  if sig.asyncness.is_none() {
    return Err(syn::Error::new_spanned(sig.fn_token, "load functions must be `async`"));
  }
  if !sig.generics.params.is_empty() {
    return Err(syn::Error::new_spanned(&sig.generics, "load functions cannot be generic"));
  }
  let event = match kind {
    Kind::Server => "ServerLoadEvent",
    Kind::Universal => "LoadEvent",
  };
  if sig.inputs.len() != 1 {
    return Err(syn::Error::new_spanned(
      &sig.inputs,
      format!("load functions take exactly one `{event}` argument"),
    ));
  }
  match sig.inputs.first() {
    Some(FnArg::Typed(pat_type)) if matches!(&*pat_type.pat, Pat::Ident(_) | Pat::Wild(_)) => {}
    Some(FnArg::Typed(pat_type)) => {
      return Err(syn::Error::new_spanned(&pat_type.pat, "expected a simple identifier pattern"));
    }
    Some(arg @ FnArg::Receiver(_)) => {
      return Err(syn::Error::new_spanned(arg, "load functions cannot take self"));
    }
    None => {}
  }
  if let ReturnType::Default = sig.output {
    return Err(syn::Error::new_spanned(sig, "load functions must return `Result<_, LoadError>`"));
  }
  Ok(())
}

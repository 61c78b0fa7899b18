//! Procedural macros for the settee project.
//!
//! `#[derive(Document)]` implements the `Document` marker trait, and with
//! `#[document(tag = "...")]` also `TaggedDocument`:
//!
//! ```ignore
//! #[derive(Debug, Clone, Serialize, Deserialize, Document)]
//! #[document(tag = "user-v2")]
//! pub struct User {
//!     pub name: String,
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as settee_macros;

use proc_macro::TokenStream;
use quote::quote;
use syn::{DeriveInput, LitStr, parse_macro_input};

#[proc_macro_derive(Document, attributes(document))]
pub fn derive_document(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    expand(input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand(input: DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let mut tag: Option<LitStr> = None;

    for attr in input.attrs.iter().filter(|attr| attr.path().is_ident("document")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("tag") {
                if tag.is_some() {
                    return Err(meta.error("duplicate `tag`"));
                }
                let value: LitStr = meta.value()?.parse()?;
                if value.value().is_empty() {
                    return Err(syn::Error::new(value.span(), "tag must not be empty"));
                }
                tag = Some(value);
                Ok(())
            } else {
                Err(meta.error("unsupported document attribute, expected `tag`"))
            }
        })?;
    }

    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let tagged = tag.map(|tag| {
        quote! {
            impl #impl_generics ::settee::document::TaggedDocument for #name #ty_generics #where_clause {
                const TAG: &'static str = #tag;
            }
        }
    });

    Ok(quote! {
        impl #impl_generics ::settee::document::Document for #name #ty_generics #where_clause {}

        #tagged
    })
}

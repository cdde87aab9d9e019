//! Proc macros for sim parameter declarations.
//!
//! Provides `#[derive(Parameters)]`, which turns a struct with named fields
//! into a declared parameter set: one `Parameter` per field, described by the
//! field's doc comment and marked optional when the field is an `Option` or
//! carries `#[param(optional)]`.
//!
//! # Example
//!
//! ```ignore
//! /// Say something to another character
//! #[derive(Deserialize, Parameters)]
//! struct SpeakArgs {
//!     /// The character who is speaking
//!     actor_character_id: SimId,
//!     /// What gets said
//!     speech: String,
//!     /// Tone of voice, if any
//!     tone: Option<String>,
//! }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, DeriveInput, Field, Lit, Meta, Type};

/// Derive macro implementing `sim_core::parameter::ParameterSet`.
///
/// # Attributes
///
/// - `#[param(optional)]` on fields - Declare the field as not required even
///   when its type is not an `Option` (pair it with `#[serde(default)]`)
#[proc_macro_derive(Parameters, attributes(param))]
pub fn derive_parameters(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand_parameters(input)
        .unwrap_or_else(|err| err.to_compile_error())
        .into()
}

fn expand_parameters(input: DeriveInput) -> syn::Result<TokenStream2> {
    let struct_name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let description = get_doc_comment(&input.attrs);

    let fields = match &input.data {
        syn::Data::Struct(data) => match &data.fields {
            syn::Fields::Named(named) => &named.named,
            _ => {
                return Err(syn::Error::new_spanned(
                    &input,
                    "Parameters derive only supports structs with named fields",
                ))
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                &input,
                "Parameters derive only supports structs",
            ))
        }
    };

    let mut parameter_tokens = Vec::new();

    for field in fields {
        let name = field_name(field)?;
        let field_desc = get_doc_comment(&field.attrs);
        let required = !is_marked_optional(field)? && !is_option_type(&field.ty);

        parameter_tokens.push(quote! {
            parameters.insert(
                #name.to_string(),
                ::sim_core::parameter::Parameter::new(#name, #field_desc, #required),
            );
        });
    }

    Ok(quote! {
        impl #impl_generics ::sim_core::parameter::ParameterSet for #struct_name #ty_generics #where_clause {
            fn description() -> &'static str {
                #description
            }

            fn parameters() -> ::sim_core::parameter::ParameterMap {
                let mut parameters = ::sim_core::parameter::ParameterMap::new();
                #(#parameter_tokens)*
                parameters
            }
        }
    })
}

fn field_name(field: &Field) -> syn::Result<String> {
    field
        .ident
        .as_ref()
        .map(|ident| ident.to_string().trim_start_matches("r#").to_string())
        .ok_or_else(|| syn::Error::new_spanned(field, "expected a named field"))
}

fn is_marked_optional(field: &Field) -> syn::Result<bool> {
    for attr in &field.attrs {
        if attr.path().is_ident("param") {
            let meta = attr.parse_args::<Meta>()?;
            match meta {
                Meta::Path(path) if path.is_ident("optional") => return Ok(true),
                other => {
                    return Err(syn::Error::new_spanned(
                        other,
                        "unsupported param attribute, expected `optional`",
                    ))
                }
            }
        }
    }
    Ok(false)
}

fn get_doc_comment(attrs: &[syn::Attribute]) -> String {
    let mut docs = Vec::new();
    for attr in attrs {
        if attr.path().is_ident("doc") {
            if let Meta::NameValue(nv) = &attr.meta {
                if let syn::Expr::Lit(expr_lit) = &nv.value {
                    if let Lit::Str(s) = &expr_lit.lit {
                        let line = s.value().trim().to_string();
                        if !line.is_empty() {
                            docs.push(line);
                        }
                    }
                }
            }
        }
    }
    docs.join(" ")
}

fn is_option_type(ty: &Type) -> bool {
    if let Type::Path(type_path) = ty {
        if let Some(segment) = type_path.path.segments.last() {
            return segment.ident == "Option";
        }
    }
    false
}

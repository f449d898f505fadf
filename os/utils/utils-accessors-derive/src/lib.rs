//! # Accessor Derive
//!
//! Derive macros generating getters and builder-style setters for the named
//! fields of a struct.

use proc_macro::TokenStream;
use quote::{ToTokens, format_ident, quote};
use syn::punctuated::Punctuated;
use syn::token::Comma;
use syn::{Data, DeriveInput, Field, Fields, LitBool, parse_macro_input, spanned::Spanned};

/// Derive to generate `.set_<field>(&mut self, value: Ty) -> &mut Self` and
/// `const .with_<field>(mut self, value: Ty) -> Self` for each **named** field.
///
/// - Skipping a field: `#[setters(skip)]`
///
/// # Example
///
/// ```
/// use utils_accessors_derive::Setters;
///
/// #[derive(Setters)]
/// struct Foo<T> where T: Default {
///     a: u32,
///     #[setters(skip)]
///     _phantom: T,
/// }
///
/// let mut f = Foo { a: 1, _phantom: u8::default() };
/// f.set_a(10).set_a(11);
/// let f2 = f.with_a(42);
/// assert_eq!(f2.a, 42);
/// ```
#[proc_macro_derive(Setters, attributes(setters))]
pub fn derive_generate_setters(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let fields = match named_fields(&input, "Setters") {
        Ok(fields) => fields,
        Err(e) => return e.to_compile_error().into(),
    };

    let mut methods = Vec::new();
    for field in fields {
        let Some(fname) = &field.ident else { continue };
        if has_flag(&field.attrs, "setters", "skip") {
            continue;
        }

        let ty = &field.ty;
        let set_name = format_ident!("set_{}", fname);
        let with_name = format_ident!("with_{}", fname);

        methods.push(quote! {
            #[inline]
            pub fn #set_name(&mut self, value: #ty) -> &mut Self {
                self.#fname = value;
                self
            }

            #[inline]
            pub const fn #with_name(mut self, value: #ty) -> Self {
                self.#fname = value;
                self
            }
        });
    }

    expand(&input, &methods)
}

/// Derive to generate `.<field>(&self) -> &Ty` for each **named** field.
///
/// - Returning by value for `Copy` fields: `#[getters(copy)]`
/// - Skipping a field: `#[getters(skip)]`
///
/// # Example
///
/// ```
/// use utils_accessors_derive::Getters;
///
/// #[derive(Getters)]
/// struct Note {
///     #[getters(copy)]
///     id: u64,
///     text: String,
///     #[getters(skip)]
///     _secret: u8,
/// }
///
/// let n = Note { id: 3, text: "hi".into(), _secret: 0 };
/// assert_eq!(n.id(), 3);
/// assert_eq!(n.text(), "hi");
/// ```
#[proc_macro_derive(Getters, attributes(getters))]
pub fn derive_generate_getters(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let fields = match named_fields(&input, "Getters") {
        Ok(fields) => fields,
        Err(e) => return e.to_compile_error().into(),
    };

    let mut methods = Vec::new();
    for field in fields {
        let Some(fname) = &field.ident else { continue };
        if has_flag(&field.attrs, "getters", "skip") {
            continue;
        }

        let ty = &field.ty;
        methods.push(if has_flag(&field.attrs, "getters", "copy") {
            quote! {
                #[inline]
                #[must_use]
                pub const fn #fname(&self) -> #ty {
                    self.#fname
                }
            }
        } else {
            quote! {
                #[inline]
                #[must_use]
                pub const fn #fname(&self) -> &#ty {
                    &self.#fname
                }
            }
        });
    }

    expand(&input, &methods)
}

fn named_fields<'a>(
    input: &'a DeriveInput,
    derive: &str,
) -> syn::Result<&'a Punctuated<Field, Comma>> {
    match &input.data {
        Data::Struct(s) => match &s.fields {
            Fields::Named(n) => Ok(&n.named),
            Fields::Unnamed(u) => Err(syn::Error::new(
                u.span(),
                format!("{derive} only supports named fields"),
            )),
            Fields::Unit => Err(syn::Error::new(
                input.ident.span(),
                format!("{derive} does not apply to unit structs"),
            )),
        },
        _ => Err(syn::Error::new(
            input.ident.span(),
            format!("{derive} can only be derived for structs"),
        )),
    }
}

fn expand<T: ToTokens>(input: &DeriveInput, methods: &[T]) -> TokenStream {
    let ident = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let expanded = quote! {
        impl #impl_generics #ident #ty_generics #where_clause {
            #(#methods)*
        }
    };
    TokenStream::from(expanded)
}

/// Accepts `#[attr(flag)]` and `#[attr(flag = true)]`.
fn has_flag(attrs: &[syn::Attribute], attr_name: &str, flag: &str) -> bool {
    let mut set = false;
    for attr in attrs {
        if !attr.path().is_ident(attr_name) {
            continue;
        }

        let _ = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident(flag) {
                if meta.input.is_empty() || meta.input.peek(Comma) {
                    set = true;
                } else if let Ok(v) = meta.value()?.parse::<LitBool>()
                    && v.value
                {
                    set = true;
                }
            }
            Ok(())
        });
    }
    set
}

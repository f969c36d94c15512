use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, ItemStruct};

extern crate proc_macro;

/// Marks a struct as a report summary.
///
/// Adds the serde and comparison derives every summary needs and implements the
/// `Summary` marker trait, which must be in scope at the call site.
#[proc_macro_attribute]
pub fn summary(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(item as ItemStruct);
    let input_struct = &ast.ident;
    let (impl_generics, ty_generics, where_clause) = ast.generics.split_for_impl();
    let expanded = quote! {
        #[derive(
            serde::Serialize,
            serde::Deserialize,
            std::cmp::PartialEq,
            std::fmt::Debug,
            std::clone::Clone
        )]
        #ast

        impl #impl_generics Summary for #input_struct #ty_generics #where_clause {}
    };

    TokenStream::from(expanded)
}

/// Derives the serde and debug traits for a reported record without tying it to
/// the `Summary` trait.
#[proc_macro_attribute]
pub fn record(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(item as ItemStruct);
    let expanded = quote! {
        #[derive(
            serde::Serialize,
            serde::Deserialize,
            std::cmp::PartialEq,
            std::fmt::Debug,
            std::clone::Clone
        )]
        #ast
    };

    TokenStream::from(expanded)
}

//! Implementation of `#[derive(HostType)]`.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Data, DeriveInput, Fields, parse_macro_input, spanned::Spanned};

use crate::attrs::{FieldAttrs, TypeAttrs};

pub fn derive_host_type_impl(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match derive_host_type_inner(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn derive_host_type_inner(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let attrs = TypeAttrs::from_attrs(&input.attrs)?;
    let class_name = attrs.name.unwrap_or_else(|| name.to_string());

    if !input.generics.params.is_empty() {
        return Err(syn::Error::new(
            input.generics.span(),
            "HostType cannot be derived for generic types",
        ));
    }

    let properties = collect_properties(input)?;

    Ok(quote! {
        impl ::hostbind::class::HostType for #name {
            const NAME: &'static str = #class_name;

            fn register_fields(
                builder: ::hostbind::class::ClassBuilder<'_, Self>,
            ) -> ::std::result::Result<::hostbind::class::ClassBuilder<'_, Self>, ::hostbind::BindError> {
                #(let builder = #properties?;)*
                Ok(builder)
            }
        }

        impl ::hostbind::convert::ToStack for #name {
            fn to_stack(self, state: &mut ::hostbind::State) -> ::std::result::Result<(), ::hostbind::BindError> {
                ::hostbind::class::push_host(state, self).map(|_| ())
            }
        }
    })
}

/// One builder call per exposed field.
fn collect_properties(input: &DeriveInput) -> syn::Result<Vec<TokenStream2>> {
    let mut properties = Vec::new();

    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new(
            input.ident.span(),
            "HostType can only be derived for structs",
        ));
    };

    let Fields::Named(fields) = &data.fields else {
        return Ok(properties);
    };

    for field in &fields.named {
        let field_attrs = FieldAttrs::from_attrs(&field.attrs)?;
        if !field_attrs.exposed() {
            continue;
        }

        let Some(field_name) = field.ident.as_ref() else {
            continue;
        };
        let prop_name = field_attrs
            .name
            .clone()
            .unwrap_or_else(|| field_name.to_string());
        let field_ty = &field.ty;

        if field_attrs.set {
            properties.push(quote! {
                builder.property(
                    #prop_name,
                    |this: &Self| -> #field_ty { ::std::clone::Clone::clone(&this.#field_name) },
                    |this: &mut Self, value: #field_ty| this.#field_name = value,
                )
            });
        } else {
            properties.push(quote! {
                builder.property_readonly(
                    #prop_name,
                    |this: &Self| -> #field_ty { ::std::clone::Clone::clone(&this.#field_name) },
                )
            });
        }
    }

    Ok(properties)
}

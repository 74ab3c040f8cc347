//! Derive macros for `rpcpack::Pack` and `rpcpack::Unpack`.
//!
//! - Structs with named fields become records. Decoding skips unknown
//!   fields and fills absent ones with `Default::default()`, so every field
//!   type must implement `Default`.
//! - Unit structs become empty records.
//! - Enums become tagged unions keyed by variant name. Variants may be unit
//!   (`Case`) or carry a single value (`Case(T)`).

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::format_ident;
use quote::quote;
use syn::Data;
use syn::DeriveInput;
use syn::Fields;
use syn::FieldsNamed;
use syn::parse_macro_input;
use syn::ext::IdentExt;

#[proc_macro_derive(Pack)]
pub fn derive_pack(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand_pack(&input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

#[proc_macro_derive(Unpack)]
pub fn derive_unpack(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand_unpack(&input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand_pack(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let body = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(named) => pack_record(named, |field| quote!(&self.#field)),
            Fields::Unit => quote! {
                enc.record_begin()?;
                enc.record_end()
            },
            Fields::Unnamed(_) => {
                return Err(syn::Error::new_spanned(name, "tuple structs cannot be packed as records"));
            }
        },
        Data::Enum(data) => {
            let mut arms = Vec::new();
            for variant in &data.variants {
                let ident = &variant.ident;
                let case = ident.unraw().to_string();
                let arm = match &variant.fields {
                    Fields::Unit => quote! {
                        Self::#ident => {
                            enc.union_begin(#case)?;
                            enc.unit()?;
                        }
                    },
                    Fields::Unnamed(fields) if fields.unnamed.len() == 1 => quote! {
                        Self::#ident(value) => {
                            enc.union_begin(#case)?;
                            ::rpcpack::Pack::pack(value, enc)?;
                        }
                    },
                    _ => {
                        return Err(syn::Error::new_spanned(
                            variant,
                            "union cases must be unit or carry exactly one value",
                        ));
                    }
                };
                arms.push(arm);
            }
            quote! {
                match self {
                    #(#arms)*
                }
                enc.union_end()
            }
        }
        Data::Union(_) => {
            return Err(syn::Error::new_spanned(name, "untagged unions are not supported"));
        }
    };

    Ok(quote! {
        impl #impl_generics ::rpcpack::Pack for #name #ty_generics #where_clause {
            fn pack(&self, enc: &mut ::rpcpack::Encoder) -> ::rpcpack::Result<()> {
                #body
            }
        }
    })
}

fn pack_record(named: &FieldsNamed, access: impl Fn(&syn::Ident) -> TokenStream2) -> TokenStream2 {
    let writes = named.named.iter().filter_map(|field| {
        let ident = field.ident.as_ref()?;
        let key = ident.unraw().to_string();
        let value = access(ident);
        Some(quote! {
            enc.field_begin(#key)?;
            ::rpcpack::Pack::pack(#value, enc)?;
            enc.field_end()?;
        })
    });
    quote! {
        enc.record_begin()?;
        #(#writes)*
        enc.record_end()
    }
}

fn expand_unpack(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let body = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(named) => unpack_record(named),
            Fields::Unit => quote! {
                let mut fields = dec.record()?;
                while fields.next()?.is_some() {}
                ::core::result::Result::Ok(Self)
            },
            Fields::Unnamed(_) => {
                return Err(syn::Error::new_spanned(name, "tuple structs cannot be unpacked as records"));
            }
        },
        Data::Enum(data) => {
            let mut arms = Vec::new();
            for variant in &data.variants {
                let ident = &variant.ident;
                let case = ident.unraw().to_string();
                let arm = match &variant.fields {
                    // a payload added by a newer peer is ignored
                    Fields::Unit => quote! {
                        #case => ::core::result::Result::Ok(Self::#ident),
                    },
                    Fields::Unnamed(fields) if fields.unnamed.len() == 1 => quote! {
                        #case => ::core::result::Result::Ok(Self::#ident(
                            ::rpcpack::Unpack::unpack(&mut payload)?,
                        )),
                    },
                    _ => {
                        return Err(syn::Error::new_spanned(
                            variant,
                            "union cases must be unit or carry exactly one value",
                        ));
                    }
                };
                arms.push(arm);
            }
            quote! {
                let (case, mut payload) = dec.union()?;
                let _ = &mut payload;
                match case {
                    #(#arms)*
                    other => ::core::result::Result::Err(::rpcpack::traits::unknown_variant(other)),
                }
            }
        }
        Data::Union(_) => {
            return Err(syn::Error::new_spanned(name, "untagged unions are not supported"));
        }
    };

    Ok(quote! {
        impl #impl_generics ::rpcpack::Unpack for #name #ty_generics #where_clause {
            fn unpack(dec: &mut ::rpcpack::Decoder<'_>) -> ::rpcpack::Result<Self> {
                #body
            }
        }
    })
}

fn unpack_record(named: &FieldsNamed) -> TokenStream2 {
    let mut slots = Vec::new();
    let mut arms = Vec::new();
    let mut inits = Vec::new();

    for field in &named.named {
        let Some(ident) = field.ident.as_ref() else { continue };
        let ty = &field.ty;
        let key = ident.unraw().to_string();
        let slot = format_ident!("__slot_{}", ident.unraw());

        slots.push(quote! {
            let mut #slot: ::core::option::Option<#ty> = ::core::option::Option::None;
        });
        arms.push(quote! {
            #key => #slot = ::core::option::Option::Some(::rpcpack::Unpack::unpack(&mut value)?),
        });
        inits.push(quote! {
            #ident: #slot.unwrap_or_default(),
        });
    }

    quote! {
        let mut fields = dec.record()?;
        #(#slots)*
        while let ::core::option::Option::Some((name, mut value)) = fields.next()? {
            let _ = &mut value;
            match name {
                #(#arms)*
                _ => {}
            }
        }
        ::core::result::Result::Ok(Self {
            #(#inits)*
        })
    }
}

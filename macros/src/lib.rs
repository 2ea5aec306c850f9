extern crate proc_macro;

use proc_macro::TokenStream;
use proc_macro2::{Ident, Span};
use quote::quote;

#[derive(Default)]
struct Configuration {
    crate_name: Option<Ident>,
    grow_threshold: Option<usize>,
    default_size: Option<usize>,
}

impl Configuration {
    fn set_crate_name(&mut self, lit: syn::Lit) -> Result<(), syn::Error> {
        let span = lit.span();
        if self.crate_name.is_some() {
            return Err(syn::Error::new(span, "crate name already set"));
        }
        if let syn::Lit::Str(s) = lit {
            if let Ok(path) = s.parse::<syn::Path>() {
                if let Some(ident) = path.get_ident() {
                    self.crate_name = Some(ident.clone());
                    return Ok(());
                }
            }
            return Err(syn::Error::new(span, format!("invalid crate name: {}", s.value())));
        }
        Err(syn::Error::new(span, "invalid crate name"))
    }

    fn parse_size(name: &str, current: Option<usize>, lit: syn::Lit) -> Result<usize, syn::Error> {
        let span = lit.span();
        if current.is_some() {
            return Err(syn::Error::new(span, format!("{} already set", name)));
        }
        if let syn::Lit::Int(lit) = lit {
            let size = lit.base10_parse::<usize>()?;
            if size > 0 {
                return Ok(size);
            }
        }
        Err(syn::Error::new(span, format!("{} should be positive integer", name)))
    }

    fn set_grow_threshold(&mut self, lit: syn::Lit) -> Result<(), syn::Error> {
        self.grow_threshold = Some(Self::parse_size("grow_threshold", self.grow_threshold, lit)?);
        Ok(())
    }

    fn set_default_size(&mut self, lit: syn::Lit) -> Result<(), syn::Error> {
        self.default_size = Some(Self::parse_size("default_size", self.default_size, lit)?);
        Ok(())
    }
}

fn parse_config(args: syn::AttributeArgs) -> Result<Configuration, syn::Error> {
    let mut config = Configuration::default();
    for arg in args.into_iter() {
        match arg {
            syn::NestedMeta::Meta(syn::Meta::NameValue(name_value)) => {
                let name = name_value
                    .path
                    .get_ident()
                    .ok_or_else(|| syn::Error::new_spanned(&name_value, "invalid attribute name"))?
                    .to_string();
                match name.as_str() {
                    "grow_threshold" => config.set_grow_threshold(name_value.lit)?,
                    "default_size" => config.set_default_size(name_value.lit)?,
                    "crate" => config.set_crate_name(name_value.lit)?,
                    _ => return Err(syn::Error::new_spanned(&name_value, "unknown attribute name")),
                }
            },
            _ => return Err(syn::Error::new_spanned(arg, "unknown attribute")),
        }
    }
    Ok(config)
}

fn generate(is_test: bool, attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = syn::parse_macro_input!(attr as syn::AttributeArgs);
    let config = match parse_config(args) {
        Ok(config) => config,
        Err(err) => return TokenStream::from(err.into_compile_error()),
    };
    let input = syn::parse_macro_input!(item as syn::ItemFn);

    let ret = &input.sig.output;
    let inputs = &input.sig.inputs;
    let name = &input.sig.ident;
    let body = &input.block;
    let attrs = &input.attrs;
    let vis = &input.vis;

    let macro_name = if is_test { "#[stackcopy::test]" } else { "#[stackcopy::main]" };

    if input.sig.asyncness.is_some() {
        let err =
            syn::Error::new_spanned(input, format!("only synchronous function can be tagged with {}", macro_name));
        return TokenStream::from(err.into_compile_error());
    }

    if !inputs.is_empty() {
        let err = syn::Error::new_spanned(inputs, format!("function tagged with {} takes no arguments", macro_name));
        return TokenStream::from(err.into_compile_error());
    }

    if !is_test && name != "main" {
        let err = syn::Error::new_spanned(name, "only the main function can be tagged with #[stackcopy::main]");
        return TokenStream::from(err.into_compile_error());
    }

    let header = if is_test {
        quote! {
            #[::core::prelude::v1::test]
        }
    } else {
        quote! {}
    };

    let crate_name = config.crate_name.unwrap_or_else(|| Ident::new("stackcopy", Span::call_site()));
    let grow_threshold = config.grow_threshold.unwrap_or(0);
    let default_size = config.default_size.unwrap_or(0);
    let result = quote! {
        #header
        #(#attrs)*
        #vis fn #name() #ret {
            fn entry() #ret {
                #body
            }

            let mut builder = #crate_name::runtime::Builder::default();
            if #grow_threshold != 0 {
                builder.grow_threshold(#grow_threshold);
            }
            if #default_size != 0 {
                builder.default_size(#default_size);
            }
            builder.run(entry)
        }
    };

    result.into()
}

/// Runs marked main function as root coroutine of main thread.
///
/// ## Options
/// * `grow_threshold`: positive integer to specify minimum headroom of saved stack buffers
/// * `default_size`: positive integer to specify initial capacity of saved stack buffers
///
/// ## Examples
/// ```rust,ignore
/// #[stackcopy::main]
/// fn main() {
///     let co = stackcopy::create(|v| v).unwrap();
///     stackcopy::call(co, stackcopy::Value::NONE).unwrap();
/// }
/// ```
///
/// ```rust,ignore
/// #[stackcopy::main(default_size = 16384)]
/// fn main() {
///     assert_eq!(stackcopy::Thresholds::default().grow(), 1024);
/// }
/// ```
#[cfg(not(test))]
#[proc_macro_attribute]
pub fn main(attr: TokenStream, item: TokenStream) -> TokenStream {
    generate(false, attr, item)
}

/// Runs marked test function as root coroutine of test thread.
///
/// See [macro@main] for configurable options.
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    generate(true, attr, item)
}

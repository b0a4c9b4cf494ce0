use proc_macro2::{Span, TokenStream};
use quote::quote;
use syn::parse::Parser;
use syn::spanned::Spanned;

// syn::AttributeArgs does not implement syn::Parse
type AttributeArgs = syn::punctuated::Punctuated<syn::Meta, syn::Token![,]>;

pub(crate) fn main(args: TokenStream, item: TokenStream) -> TokenStream {
    expand(args, item, false)
}

pub(crate) fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    expand(args, item, true)
}

#[derive(Clone, Copy, PartialEq)]
enum Flavor {
    Inline,
    Stealing,
}

impl Flavor {
    fn from_str(s: &str, span: Span) -> Result<Flavor, syn::Error> {
        match s {
            "inline" => Ok(Flavor::Inline),
            "stealing" => Ok(Flavor::Stealing),
            other => Err(syn::Error::new(
                span,
                format!(
                    "no such runtime flavor `{other}`; the flavors are `inline` and `stealing`"
                ),
            )),
        }
    }
}

struct Config {
    flavor: Flavor,
    worker_threads: Option<usize>,
}

fn expand(args: TokenStream, item: TokenStream, is_test: bool) -> TokenStream {
    // On failure, still expand to something close to the expected output so
    // IDE completions inside the function body keep working.
    let mut input: syn::ItemFn = match syn::parse2(item.clone()) {
        Ok(input) => input,
        Err(err) => return token_stream_with_error(item, err),
    };

    let config = match parse_config(&input, args, is_test) {
        Ok(config) => config,
        Err(err) => return token_stream_with_error(item, err),
    };

    if input.sig.asyncness.take().is_none() {
        let err = syn::Error::new_spanned(
            input.sig.fn_token,
            "the `async` keyword is missing from the function declaration",
        );
        return token_stream_with_error(item, err);
    }

    let mut rt = match config.flavor {
        Flavor::Inline => quote! { polliwog::runtime::Builder::new_inline() },
        Flavor::Stealing => quote! { polliwog::runtime::Builder::new_stealing() },
    };
    if let Some(worker_threads) = config.worker_threads {
        rt = quote! { #rt.worker_threads(#worker_threads) };
    }

    let body = &input.block;
    let block = quote! {{
        let body = async #body;
        #rt.try_build()
            .expect("failed building the runtime")
            .block_on(body)
    }};
    input.block = match syn::parse2(block) {
        Ok(block) => Box::new(block),
        Err(err) => return token_stream_with_error(item, err),
    };

    if is_test {
        quote! {
            #[::core::prelude::v1::test]
            #input
        }
    } else {
        quote! { #input }
    }
}

fn parse_config(
    input: &syn::ItemFn,
    args: TokenStream,
    is_test: bool,
) -> Result<Config, syn::Error> {
    let macro_name = if is_test {
        "polliwog::test"
    } else {
        "polliwog::main"
    };

    if !is_test && input.sig.ident == "main" && !input.sig.inputs.is_empty() {
        return Err(syn::Error::new_spanned(
            &input.sig.ident,
            "the main function cannot accept arguments",
        ));
    }
    if is_test && let Some(attr) = input.attrs.iter().find(|attr| is_test_attribute(attr)) {
        return Err(syn::Error::new_spanned(
            attr,
            "second test attribute is supplied, consider removing it",
        ));
    }

    let mut flavor = None;
    let mut worker_threads = None;

    for arg in AttributeArgs::parse_terminated.parse2(args)? {
        let namevalue = match arg {
            syn::Meta::NameValue(namevalue) => namevalue,
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    format!("unknown attribute inside `#[{macro_name}]`"),
                ));
            }
        };
        let name = namevalue
            .path
            .get_ident()
            .ok_or_else(|| syn::Error::new_spanned(&namevalue, "must have a specified ident"))?
            .to_string()
            .to_lowercase();
        let syn::Expr::Lit(syn::ExprLit { lit, .. }) = &namevalue.value else {
            return Err(syn::Error::new_spanned(
                &namevalue.value,
                "must be a literal",
            ));
        };
        match name.as_str() {
            "flavor" => {
                if flavor.is_some() {
                    return Err(syn::Error::new(lit.span(), "`flavor` set multiple times"));
                }
                flavor = Some(Flavor::from_str(
                    &parse_string(lit, "flavor")?,
                    lit.span(),
                )?);
            }
            "worker_threads" => {
                if worker_threads.is_some() {
                    return Err(syn::Error::new(
                        lit.span(),
                        "`worker_threads` set multiple times",
                    ));
                }
                let value = parse_int(lit, "worker_threads")?;
                if value == 0 {
                    return Err(syn::Error::new(lit.span(), "`worker_threads` may not be 0"));
                }
                worker_threads = Some((value, lit.span()));
            }
            other => {
                return Err(syn::Error::new_spanned(
                    namevalue,
                    format!(
                        "unknown attribute `{other}`; expected one of: `flavor`, `worker_threads`"
                    ),
                ));
            }
        }
    }

    let flavor = flavor.unwrap_or(if is_test {
        Flavor::Inline
    } else {
        Flavor::Stealing
    });

    let worker_threads = match (flavor, worker_threads) {
        (Flavor::Inline, Some((_, span))) => {
            return Err(syn::Error::new(
                span,
                format!(
                    "the `worker_threads` option requires the `stealing` flavor; \
                     use `#[{macro_name}(flavor = \"stealing\")]`"
                ),
            ));
        }
        (Flavor::Stealing, Some((value, _))) => Some(value),
        (_, None) => None,
    };

    Ok(Config {
        flavor,
        worker_threads,
    })
}

fn parse_string(lit: &syn::Lit, field: &str) -> Result<String, syn::Error> {
    match lit {
        syn::Lit::Str(s) => Ok(s.value()),
        _ => Err(syn::Error::new(
            lit.span(),
            format!("failed to parse value of `{field}` as a string"),
        )),
    }
}

fn parse_int(lit: &syn::Lit, field: &str) -> Result<usize, syn::Error> {
    match lit {
        syn::Lit::Int(int) => int.base10_parse::<usize>().map_err(|err| {
            syn::Error::new(
                lit.span(),
                format!("failed to parse value of `{field}` as an integer: {err}"),
            )
        }),
        _ => Err(syn::Error::new(
            lit.span(),
            format!("failed to parse value of `{field}` as an integer"),
        )),
    }
}

/// Detect a bare `#[test]` (or fully qualified prelude form) so we can point
/// at the conflict instead of producing a confusing duplicate-symbol error.
fn is_test_attribute(attr: &syn::Attribute) -> bool {
    let syn::Meta::Path(path) = &attr.meta else {
        return false;
    };
    if path.leading_colon.is_none()
        && path.segments.len() == 1
        && path.segments[0].arguments.is_none()
        && path.segments[0].ident == "test"
    {
        return true;
    }
    let candidates = [
        ["core", "prelude", "*", "test"],
        ["std", "prelude", "*", "test"],
    ];
    if path.segments.len() != candidates[0].len() {
        return false;
    }
    candidates.into_iter().any(|segments| {
        path.segments.iter().zip(segments).all(|(segment, name)| {
            segment.arguments.is_none() && (name == "*" || segment.ident == name)
        })
    })
}

fn token_stream_with_error(mut tokens: TokenStream, error: syn::Error) -> TokenStream {
    tokens.extend(error.into_compile_error());
    tokens
}

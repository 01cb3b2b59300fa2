use proc_macro::TokenStream;
use quote::quote;
use syn::{parse::Parse, parse::ParseStream, parse_macro_input, FnArg, ItemFn, Result, Token};

struct InterceptorArgs {
    real: syn::Expr,
}

impl Parse for InterceptorArgs {
    fn parse(input: ParseStream) -> Result<Self> {
        let mut real = None;

        while !input.is_empty() {
            let ident: syn::Ident = input.parse()?;
            input.parse::<Token![=]>()?;

            match ident.to_string().as_str() {
                "real" => real = Some(input.parse()?),
                _ => {
                    return Err(syn::Error::new(
                        ident.span(),
                        format!("unknown parameter: {}", ident),
                    ))
                }
            }

            if !input.is_empty() {
                input.parse::<Token![,]>()?;
            }
        }

        Ok(InterceptorArgs {
            real: real.ok_or_else(|| input.error("missing real"))?,
        })
    }
}

/// turns a policy-wrapped function into the exported C entry point
///
/// the generated function carries `#[no_mangle]`, takes the thread-local
/// reentrancy guard and, when the guard is already held (a call made by
/// the injector itself) or thread-local storage is gone, forwards the
/// arguments straight to the real function named by `real`.
///
/// # Example
/// ```ignore
/// #[interceptor(real = REAL_OPEN)]
/// pub unsafe extern "C" fn open(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
///     INTERPOSER.open(Hook::Open, path, flags, mode)
/// }
/// ```
#[proc_macro_attribute]
pub fn interceptor(args: TokenStream, input: TokenStream) -> TokenStream {
    let args = parse_macro_input!(args as InterceptorArgs);
    let input_fn = parse_macro_input!(input as ItemFn);

    if input_fn.sig.abi.is_none() {
        return syn::Error::new_spanned(
            &input_fn.sig.fn_token,
            "interceptor functions must be declared extern \"C\"",
        )
        .to_compile_error()
        .into();
    }

    let InterceptorArgs { real } = args;

    let fn_attrs = &input_fn.attrs;
    let fn_vis = &input_fn.vis;
    let fn_sig = &input_fn.sig;
    let fn_name_str = input_fn.sig.ident.to_string();
    let body = &input_fn.block;

    // parameter names, forwarded untouched on the reentrant path
    let param_names: Vec<_> = input_fn
        .sig
        .inputs
        .iter()
        .filter_map(|arg| {
            if let FnArg::Typed(pat_type) = arg {
                if let syn::Pat::Ident(pat_ident) = &*pat_type.pat {
                    return Some(&pat_ident.ident);
                }
            }
            None
        })
        .collect();

    if param_names.len() != input_fn.sig.inputs.len() {
        return syn::Error::new_spanned(
            &input_fn.sig.inputs,
            "interceptor parameters must be plain identifiers",
        )
        .to_compile_error()
        .into();
    }

    let expanded = quote! {
        #(#fn_attrs)*
        #[no_mangle]
        #fn_vis #fn_sig {
            const FN_NAME: &str = #fn_name_str;

            let _guard = match crate::state::InterceptGuard::enter() {
                Some(guard) => guard,
                None => return (#real.get())(#(#param_names),*),
            };

            tracing::trace!(pid = std::process::id(), "{} intercepted", FN_NAME);

            #body
        }
    };

    TokenStream::from(expanded)
}

//! Test attributes that fail a test once it runs past a wall-clock budget.
//!
//! ```ignore
//! #[test_timeout::timeout(5)]
//! fn sync_case() { .. }
//!
//! #[test_timeout::tokio_timeout_test(10, multi_thread)]
//! async fn async_case() { .. }
//! ```
//!
//! The budget defaults to 60 seconds. Setting `SHEET_TEST_TIMEOUT_SECS` at
//! test run time overrides every budget, which helps on slow CI machines.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::{Attribute, Expr, ExprLit, ExprPath, ItemFn, Lit, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const OVERRIDE_ENV: &str = "SHEET_TEST_TIMEOUT_SECS";

struct Options {
    timeout_secs: u64,
    multi_thread: bool,
}

fn parse_options(attr: TokenStream) -> syn::Result<Options> {
    let mut options = Options {
        timeout_secs: DEFAULT_TIMEOUT_SECS,
        multi_thread: false,
    };
    let args = Punctuated::<Expr, Token![,]>::parse_terminated.parse(attr)?;
    for arg in args {
        match &arg {
            Expr::Lit(ExprLit {
                lit: Lit::Int(lit), ..
            }) => {
                let secs: u64 = lit.base10_parse()?;
                if secs == 0 {
                    return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
                }
                options.timeout_secs = secs;
            }
            Expr::Path(ExprPath { path, .. }) if path.is_ident("multi_thread") => {
                options.multi_thread = true;
            }
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "expected a timeout in seconds or `multi_thread`",
                ))
            }
        }
    }
    Ok(options)
}

/// Runs `body` on a helper thread and panics if it has not finished within
/// the budget. Panics inside the body are re-raised on the test thread.
fn guarded(timeout_secs: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let timeout_duration = std::env::var(#OVERRIDE_ENV)
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(std::time::Duration::from_secs)
            .unwrap_or(std::time::Duration::from_secs(#timeout_secs));
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || { #body }));
            let _ = sender.send(result);
        });
        match receiver.recv_timeout(timeout_duration) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test timed out after {:?}", timeout_duration)
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread failed before reporting result")
            }
        }
    }
}

fn has_path(attr: &Attribute, expected: &[&str]) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    segments.iter().map(String::as_str).eq(expected.iter().copied())
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = match parse_options(attr) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = match syn::parse::<ItemFn>(item) {
        Ok(item) => item,
        Err(err) => return err.to_compile_error().into(),
    };

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !has_path(attr, &["tokio", "test"]))
        .collect();

    let builder = if options.multi_thread {
        quote! { tokio::runtime::Builder::new_multi_thread().worker_threads(2) }
    } else {
        quote! { tokio::runtime::Builder::new_current_thread() }
    };
    let body = guarded(
        options.timeout_secs,
        quote! {
            let runtime = #builder
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async move #block)
        },
    );

    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    }
    .into()
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = match parse_options(attr) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = match syn::parse::<ItemFn>(item) {
        Ok(item) => item,
        Err(err) => return err.to_compile_error().into(),
    };

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }
    if options.multi_thread {
        return syn::Error::new_spanned(
            &sig.ident,
            "`multi_thread` only applies to tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !has_path(attr, &["test"]))
        .collect();
    let body = guarded(options.timeout_secs, quote! { #block });

    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    }
    .into()
}

//! Test attributes that fail a test instead of letting it hang.
//!
//! `#[timeout]` wraps a synchronous test, `#[tokio_timeout_test]` an async
//! one on a current-thread runtime. Both take an optional limit in seconds.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_SECS: u64 = 60;

fn limit_secs(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

fn last_segments_are(attr: &Attribute, expected: &[&str]) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|s| s.ident.to_string())
        .collect();
    segments == expected
}

/// Run `body` on a watchdog thread and fail once `secs` pass without a result.
fn watchdog(secs: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let limit = ::std::time::Duration::from_secs(#secs);
        let (done, outcome) = ::std::sync::mpsc::channel();
        ::std::thread::spawn(move || {
            let result = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| { #body }));
            let _ = done.send(result);
        });
        match outcome.recv_timeout(limit) {
            Ok(Ok(_)) => {}
            Ok(Err(panic)) => ::std::panic::resume_unwind(panic),
            Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test exceeded {}s", #secs)
            }
            Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread exited without reporting")
            }
        }
    }
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = match limit_secs(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);
    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(&sig.ident, "use tokio_timeout_test for async tests")
            .to_compile_error()
            .into();
    }
    let attrs = attrs.into_iter().filter(|a| !last_segments_are(a, &["test"]));
    let body = watchdog(secs, quote! { #block });
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
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = match limit_secs(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);
    if sig.asyncness.take().is_none() {
        return syn::Error::new_spanned(&sig.ident, "tokio_timeout_test expects an async fn")
            .to_compile_error()
            .into();
    }
    let attrs = attrs
        .into_iter()
        .filter(|a| !last_segments_are(a, &["tokio", "test"]));
    let body = watchdog(
        secs,
        quote! {
            let runtime = ::tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build test runtime");
            runtime.block_on(async move {
                if ::tokio::time::timeout(limit, async move #block).await.is_err() {
                    panic!("test exceeded {}s", #secs);
                }
            });
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

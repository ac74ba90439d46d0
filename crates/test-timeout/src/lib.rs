//! `#[timeout]` test attribute used across the channel workspace.
//!
//! Wraps a test body so that it runs on a watchdog thread and panics with
//! `test timed out` when it exceeds its budget. Async test bodies get a
//! current-thread Tokio runtime with all drivers enabled, so the attribute
//! replaces `#[tokio::test]` rather than stacking on top of it.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout_secs = if attr.is_empty() {
        DEFAULT_TIMEOUT_SECS
    } else {
        let lit = parse_macro_input!(attr as LitInt);
        match lit.base10_parse::<u64>() {
            Ok(0) => {
                return syn::Error::new_spanned(lit, "timeout must be greater than zero")
                    .to_compile_error()
                    .into()
            }
            Ok(secs) => secs,
            Err(err) => return err.to_compile_error().into(),
        }
    };

    let function = parse_macro_input!(item as ItemFn);
    expand(function, timeout_secs).into()
}

fn expand(function: ItemFn, timeout_secs: u64) -> TokenStream2 {
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = function;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_marker(attr))
        .collect();

    let body = if sig.asyncness.take().is_some() {
        quote! {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async move #block)
        }
    } else {
        quote! { #block }
    };

    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let budget = std::time::Duration::from_secs(#timeout_secs);
            let (report, outcome) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #body }));
                let _ = report.send(result);
            });
            match outcome.recv_timeout(budget) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test timed out after {}s", #timeout_secs)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting a result")
                }
            }
        }
    }
}

/// `#[test]` and `#[tokio::test(..)]` are dropped; the expansion emits its own
/// `#[test]`.
fn is_test_marker(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}

//! Test attributes that abort hung tests instead of letting the suite stall.
//!
//! `#[test_deadline::deadline]` wraps a synchronous test and
//! `#[test_deadline::tokio_deadline_test]` wraps an async test in a
//! current-thread Tokio runtime. Both fail the test if it runs past the
//! deadline (seconds, default 60):
//!
//! ```ignore
//! #[test_deadline::deadline(5)]
//! fn finishes_quickly() { /* ... */ }
//!
//! #[test_deadline::tokio_deadline_test]
//! async fn talks_to_a_server() { /* ... */ }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_DEADLINE_SECS: u64 = 60;

fn deadline_secs(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_DEADLINE_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new(lit.span(), "deadline must be at least one second"));
    }
    Ok(secs)
}

/// Drop `#[test]` / `#[tokio::test]` markers so the expansion controls the
/// harness registration itself.
fn keep_attr(attr: &Attribute) -> bool {
    let path = attr.path();
    if path.is_ident("test") {
        return false;
    }
    let segments: Vec<_> = path.segments.iter().map(|s| s.ident.to_string()).collect();
    !(segments.len() == 2 && segments[0] == "tokio" && segments[1] == "test")
}

/// Run `body` on a watchdog thread and panic in the test thread if it does
/// not report back before the deadline. Panics inside `body` are re-raised
/// so ordinary assertion failures keep their messages.
fn with_watchdog(secs: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let deadline = std::time::Duration::from_secs(#secs);
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                #body
            }));
            let _ = done_tx.send(outcome);
        });
        match done_rx.recv_timeout(deadline) {
            Ok(Ok(())) => {}
            Ok(Err(panic)) => std::panic::resume_unwind(panic),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test ran past its {}s deadline", #secs);
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test worker exited without reporting a result");
            }
        }
    }
}

#[proc_macro_attribute]
pub fn deadline(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = match deadline_secs(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn { attrs, vis, sig, block } = parse_macro_input!(item as ItemFn);
    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "deadline wraps synchronous tests; use tokio_deadline_test for async",
        )
        .to_compile_error()
        .into();
    }
    let attrs: Vec<Attribute> = attrs.into_iter().filter(keep_attr).collect();
    let guarded = with_watchdog(secs, quote!(#block));
    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #guarded
        }
    })
}

#[proc_macro_attribute]
pub fn tokio_deadline_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = match deadline_secs(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);
    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_deadline_test wraps async tests; use deadline for synchronous ones",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;
    let attrs: Vec<Attribute> = attrs.into_iter().filter(keep_attr).collect();
    // A second timeout inside the runtime lets in-flight tasks unwind before
    // the watchdog gives up on the whole thread.
    let guarded = with_watchdog(
        secs,
        quote! {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build test runtime");
            runtime.block_on(async {
                tokio::time::timeout(deadline, async move #block)
                    .await
                    .expect("test ran past its deadline");
            });
        },
    );
    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #guarded
        }
    })
}

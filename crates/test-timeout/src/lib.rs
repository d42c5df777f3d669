//! Test attributes that run an async test body on a dedicated Tokio runtime and
//! fail it after a wall-clock budget instead of letting a stuck hold or shared
//! fetch hang the whole test binary.
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test]
//! async fn defaults_to_sixty_seconds() {}
//!
//! #[test_timeout::tokio_timeout_test(5)]
//! async fn five_second_budget() {}
//!
//! #[test_timeout::tokio_timeout_test(secs = 10, flavor = "multi_thread", worker_threads = 4)]
//! async fn concurrent_fan_out() {}
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt, LitStr};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    CurrentThread,
    MultiThread,
}

struct TestOptions {
    secs: u64,
    flavor: Flavor,
    worker_threads: Option<usize>,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            secs: DEFAULT_TIMEOUT_SECS,
            flavor: Flavor::CurrentThread,
            worker_threads: None,
        }
    }
}

impl TestOptions {
    fn runtime_builder(&self) -> TokenStream2 {
        match self.flavor {
            Flavor::CurrentThread => quote! {
                tokio::runtime::Builder::new_current_thread()
            },
            Flavor::MultiThread => {
                let threads = self.worker_threads.unwrap_or(2);
                quote! {
                    tokio::runtime::Builder::new_multi_thread().worker_threads(#threads)
                }
            }
        }
    }
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
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();

    let timeout = options.secs;
    let builder = options.runtime_builder();

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = #builder
                        .enable_all()
                        .build()
                        .expect("failed to build Tokio runtime");
                    runtime.block_on(async {
                        tokio::time::timeout(timeout_duration, async move #block)
                            .await
                            .expect("test timed out");
                    });
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration + std::time::Duration::from_secs(1)) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn parse_options(attr: TokenStream) -> syn::Result<TestOptions> {
    let mut options = TestOptions::default();
    if attr.is_empty() {
        return Ok(options);
    }

    // Bare form: #[tokio_timeout_test(5)]
    if let Ok(lit) = syn::parse::<LitInt>(attr.clone()) {
        options.secs = parse_secs(&lit)?;
        return Ok(options);
    }

    let parser = syn::meta::parser(|meta| {
        if meta.path.is_ident("secs") {
            let lit: LitInt = meta.value()?.parse()?;
            options.secs = parse_secs(&lit)?;
            Ok(())
        } else if meta.path.is_ident("flavor") {
            let lit: LitStr = meta.value()?.parse()?;
            options.flavor = match lit.value().as_str() {
                "current_thread" => Flavor::CurrentThread,
                "multi_thread" => Flavor::MultiThread,
                other => {
                    return Err(syn::Error::new_spanned(
                        &lit,
                        format!("unknown runtime flavor `{other}`"),
                    ))
                }
            };
            Ok(())
        } else if meta.path.is_ident("worker_threads") {
            let lit: LitInt = meta.value()?.parse()?;
            let threads: usize = lit.base10_parse()?;
            if threads == 0 {
                return Err(syn::Error::new_spanned(&lit, "worker_threads must be positive"));
            }
            options.worker_threads = Some(threads);
            Ok(())
        } else {
            Err(meta.error("expected `secs`, `flavor`, or `worker_threads`"))
        }
    });
    syn::parse::Parser::parse(parser, attr)?;

    if options.worker_threads.is_some() && options.flavor == Flavor::CurrentThread {
        options.flavor = Flavor::MultiThread;
    }
    Ok(options)
}

fn parse_secs(lit: &LitInt) -> syn::Result<u64> {
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

fn is_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    match (segments.next(), segments.next(), segments.next()) {
        (Some(only), None, None) => only.ident == "test",
        (Some(first), Some(second), None) => first.ident == "tokio" && second.ident == "test",
        _ => false,
    }
}

//! Code generation for the `#[kernel_test(...)]` attribute macro.
//!
//! Emits the original test function and a linker-section descriptor entry,
//! both gated behind `#[cfg(ktest)]` so release kernels carry no test code.

use proc_macro2::{Ident, Span, TokenStream};
use quote::quote;
use syn::ItemFn;

use crate::parse::{KernelTestDef, TestStage};

/// Generates the test function plus its linkset descriptor.
pub fn generate(def: &KernelTestDef, func: &ItemFn) -> syn::Result<TokenStream> {
    if func.sig.asyncness.is_some() {
        return Err(syn::Error::new_spanned(
            &func.sig,
            "kernel tests are plain functions; with_sched tests run in their own thread",
        ));
    }
    if !func.sig.inputs.is_empty() {
        return Err(syn::Error::new_spanned(&func.sig, "kernel tests must not take parameters"));
    }

    let fn_name = &func.sig.ident;
    let fn_name_str = fn_name.to_string();
    let stage_tokens = gen_stage(def.stage);
    let timeout = def.timeout.unwrap_or(0);
    let static_name = gen_static_name(fn_name);

    Ok(quote! {
        #[cfg(ktest)]
        #func

        #[cfg(ktest)]
        orion_linkset::linkset_entry!("orion_kernel_tests",
            #static_name: orion_ktest::KernelTestDescriptor =
                orion_ktest::KernelTestDescriptor {
                    name: #fn_name_str,
                    module_path: module_path!(),
                    stage: #stage_tokens,
                    timeout_secs: #timeout,
                    test_fn: #fn_name,
                }
        );
    })
}

fn gen_stage(stage: TestStage) -> TokenStream {
    match stage {
        TestStage::EarlyBoot => quote! { orion_ktest::TestStage::EarlyBoot },
        TestStage::BeforeSched => quote! { orion_ktest::TestStage::BeforeSched },
        TestStage::WithSched => quote! { orion_ktest::TestStage::WithSched },
        TestStage::Userspace => quote! { orion_ktest::TestStage::Userspace },
    }
}

fn gen_static_name(fn_name: &Ident) -> Ident {
    let upper = fn_name.to_string().to_uppercase();
    Ident::new(&format!("__KTEST_{upper}"), Span::call_site())
}

//! Parsing of `#[kernel_test(...)]` attribute arguments.

use syn::parse::{Parse, ParseStream};
use syn::{Ident, LitInt, LitStr, Token};

/// Test stage — controls when during boot the test runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStage {
    EarlyBoot,
    BeforeSched,
    WithSched,
    Userspace,
}

/// Parsed `#[kernel_test(...)]` attribute.
pub struct KernelTestDef {
    pub stage: TestStage,
    pub timeout: Option<u32>,
}

impl Parse for KernelTestDef {
    fn parse(input: ParseStream<'_>) -> syn::Result<Self> {
        let mut stage = None;
        let mut timeout = None;

        while !input.is_empty() {
            let key: Ident = input.parse()?;
            input.parse::<Token![=]>()?;

            match key.to_string().as_str() {
                "stage" => {
                    let value: LitStr = input.parse()?;
                    stage = Some(match value.value().as_str() {
                        "early_boot" => TestStage::EarlyBoot,
                        "before_sched" => TestStage::BeforeSched,
                        "with_sched" => TestStage::WithSched,
                        "userspace" => TestStage::Userspace,
                        _ => {
                            return Err(syn::Error::new(
                                value.span(),
                                "expected one of: \"early_boot\", \"before_sched\", \
                                 \"with_sched\", \"userspace\"",
                            ));
                        }
                    });
                }
                "timeout" => {
                    let lit: LitInt = input.parse()?;
                    let val: u32 = lit.base10_parse()?;
                    if val == 0 {
                        return Err(syn::Error::new(lit.span(), "timeout must be greater than 0"));
                    }
                    timeout = Some(val);
                }
                _ => {
                    return Err(syn::Error::new(
                        key.span(),
                        format!("unknown attribute `{key}`; expected one of: stage, timeout"),
                    ));
                }
            }

            if !input.is_empty() {
                input.parse::<Token![,]>()?;
            }
        }

        Ok(Self { stage: stage.unwrap_or(TestStage::EarlyBoot), timeout })
    }
}

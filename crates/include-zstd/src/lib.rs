use std::env;
use std::fs;
use std::path::PathBuf;

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{Error, LitByteStr, LitStr, parse_macro_input};

const LEVEL: i32 = 19;

macro_rules! bail {
    ($span:expr, $call:expr) => {
        match $call {
            Ok(val) => val,
            Err(err) => return Error::new($span, err).to_compile_error().into(),
        }
    };
}

/// Embed a UTF-8 text file as zstd-compressed bytes: `include_zstd!("path/relative/to/manifest.md")`.
///
/// Prompts are decoded back to `String` at runtime, so anything that is not valid UTF-8 (or is
/// empty) is rejected here instead of at the first call site.
#[proc_macro]
pub fn include_zstd(input: TokenStream) -> TokenStream {
    let path = parse_macro_input!(input as LitStr);
    let span = path.span();

    let manifest_dir = bail!(span, env::var("CARGO_MANIFEST_DIR"));
    let full_path = PathBuf::from(manifest_dir).join(path.value());

    let content = bail!(span, fs::read(&full_path));
    if content.is_empty() {
        return Error::new(span, format!("{} is empty", full_path.display()))
            .to_compile_error()
            .into();
    }
    bail!(span, std::str::from_utf8(&content));

    let compressed = bail!(span, zstd::stream::encode_all(&content[..], LEVEL));
    let literal_bytes = LitByteStr::new(&compressed, Span::call_site());
    let tracked_path = full_path.display().to_string();

    // The `include_bytes!` of the source keeps cargo rebuilding when the prompt changes.
    quote!({
        const _: &[u8] = include_bytes!(#tracked_path);
        #literal_bytes
    })
    .into()
}

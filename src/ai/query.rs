use std::collections::HashMap;
use std::io::Cursor;
use std::sync::LazyLock;

use regex::Regex;
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use tracing::{error, trace};

use crate::{AppError, AppResult};
use crate::ai::prompt::PromptTemplate;

/// First `{` through last `}`, across lines.
static JSON_SPAN: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}"));

/// Metadata pulled from a type's JSON Schema.
pub trait SchemaInfo {
    fn schema_value() -> serde_json::Value;

    fn title() -> String {
        Self::schema_value()
            .get("title")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string()
    }

    fn description() -> String {
        Self::schema_value()
            .get("description")
            .and_then(|d| d.as_str())
            .unwrap_or_default()
            .to_string()
    }
}

impl<T: JsonSchema> SchemaInfo for T {
    fn schema_value() -> serde_json::Value {
        schema_for!(T).as_value().to_owned()
    }
}

/// Decompress a prompt embedded with `include_zstd!`.
pub fn decode_prompt(bytes: &[u8]) -> AppResult<String> {
    let raw = zstd::decode_all(Cursor::new(bytes))?;
    String::from_utf8(raw).map_err(|e| AppError::Other(format!("prompt is not UTF-8: {e}")))
}

/// The brace-delimited span of `s`, if any.
pub fn json_span(s: &str) -> AppResult<Option<&str>> {
    let re = JSON_SPAN
        .as_ref()
        .map_err(|e| AppError::Other(format!("invalid JSON span pattern: {e}")))?;
    Ok(re.find(s).map(|m| m.as_str()))
}

/// A structured answer the model must return as one JSON object.
pub trait Query: JsonSchema + Serialize + for<'de> Deserialize<'de> + SchemaInfo {
    const PROMPT: &'static [u8];

    fn template() -> AppResult<PromptTemplate<'static>> {
        Ok(PromptTemplate::new(decode_prompt(Self::PROMPT)?))
    }

    fn prompt(vars: &HashMap<&str, &str>) -> AppResult<String> {
        Ok(Self::template()?.render(vars))
    }

    /// Extract the JSON object from free text and deserialize it strictly.
    fn from_str(s: &str) -> AppResult<Self> {
        trace!("Raw content: {s}");

        let Some(span) = json_span(s)? else {
            return Err(AppError::Contract(format!(
                "no JSON object in {} response",
                Self::title()
            )));
        };
        let mut jd = serde_json::Deserializer::from_str(span);
        match serde_path_to_error::deserialize(&mut jd) {
            Ok(res) => {
                jd.end().map_err(|e| {
                    error!("Trailing content after the {} object: {span}", Self::title());
                    AppError::Contract(format!("{} must be a single JSON object: {e}", Self::title()))
                })?;
                Ok(res)
            }
            Err(e) => {
                error!("Failed to deserialize {}: {e}", Self::title());
                error!("Response content was: {span}");
                error!("Failed to parse JSON at path: {}", e.path());
                Err(AppError::Contract(format!(
                    "{} at {}: {}",
                    Self::title(),
                    e.path(),
                    e.inner()
                )))
            }
        }
    }
}

#[macro_export]
#[allow(clippy::crate_in_macro_def)]
macro_rules! impl_query {
    ($struct_name:ident, $prompt:ident) => {
        impl crate::ai::query::Query for $struct_name {
            const PROMPT: &'static [u8] = $prompt;
        }
    };
}

//! Field coercion.
//!
//! Coercion never fails: empty or unparseable input becomes the field's
//! default. Whether that default is acceptable is decided by validation.

use taxroll_source_models::config::TransformConfig;

use crate::record::Value;
use crate::schema::{FieldSchema, FieldType};

/// Whitespace handling applied before type conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoerceOptions {
    pub strip: bool,
    pub normalize_whitespace: bool,
}

impl From<&TransformConfig> for CoerceOptions {
    fn from(config: &TransformConfig) -> Self {
        Self {
            strip: config.strip_fields,
            normalize_whitespace: config.normalize_whitespace,
        }
    }
}

impl Default for CoerceOptions {
    fn default() -> Self {
        Self {
            strip: true,
            normalize_whitespace: true,
        }
    }
}

const TRUE_WORDS: [&str; 5] = ["true", "1", "yes", "y", "t"];

/// Largest magnitude that survives an `f64` to `i64` conversion.
const I64_SAFE: f64 = 9.2e18;

/// Coerces raw text into the field's type.
#[must_use]
pub fn coerce(raw: Option<&str>, field: &FieldSchema, options: CoerceOptions) -> Value {
    let Some(raw) = raw else {
        return field.default_value();
    };

    let mut text = if options.strip { raw.trim() } else { raw }.to_string();
    if options.normalize_whitespace {
        text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    }
    if text.trim().is_empty() {
        return field.default_value();
    }

    let parsed = match field.kind {
        FieldType::Int => parse_int(&text).map(Value::Int),
        FieldType::Float | FieldType::Decimal => parse_number(&text).map(Value::Float),
        FieldType::Bool => Some(Value::Bool(
            TRUE_WORDS.contains(&text.to_ascii_lowercase().as_str()),
        )),
        FieldType::Str => Some(Value::Str(truncate(text, field.max_length, options.strip))),
    };
    parsed.unwrap_or_else(|| field.default_value())
}

/// Parses a number after removing currency symbols and thousands
/// separators. Non-finite results are rejected.
#[must_use]
pub fn parse_number(text: &str) -> Option<f64> {
    let cleaned: String = text.chars().filter(|c| !matches!(c, '$' | ',')).collect();
    cleaned
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
}

/// Parses via float and truncates toward zero, so `"123.00"` is `123`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn parse_int(text: &str) -> Option<i64> {
    if let Ok(i) = text.parse::<i64>() {
        return Some(i);
    }
    parse_number(text)
        .filter(|f| f.abs() < I64_SAFE)
        .map(|f| f.trunc() as i64)
}

fn truncate(text: String, max_length: Option<usize>, strip: bool) -> String {
    match max_length {
        Some(max) if text.chars().count() > max => {
            let cut: String = text.chars().take(max).collect();
            if strip {
                cut.trim_end().to_string()
            } else {
                cut
            }
        }
        _ => text,
    }
}

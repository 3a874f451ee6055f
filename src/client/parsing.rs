//! Parsing helpers for Elasticsearch setting values.
//!
//! Elasticsearch reports watermarks and sizes as strings such as `"85%"`,
//! `"0.95"` or `"10gb"`. These functions are pure so they can be tested
//! without a live cluster.

use regex::Regex;

use super::types::{ParseError, Watermark};

/// Parse a byte size such as `"512mb"`, `"10gb"` or `"1024"` into bytes.
///
/// # Example
/// ```
/// use elasticsearch_operator::client::parsing::parse_byte_size;
///
/// assert_eq!(parse_byte_size("2kb").unwrap(), 2048);
/// ```
pub fn parse_byte_size(value: &str) -> Result<u64, ParseError> {
    let size_regex = Regex::new(r"^(\d+(?:\.\d+)?)\s*(b|kb|mb|gb|tb|pb)?$")
        .map_err(|e| ParseError::InvalidByteSize(e.to_string()))?;

    let normalized = value.trim().to_lowercase();
    let caps = size_regex
        .captures(&normalized)
        .ok_or_else(|| ParseError::InvalidByteSize(value.to_string()))?;

    let number: f64 = caps
        .get(1)
        .map(|m| m.as_str())
        .unwrap_or_default()
        .parse()
        .map_err(|_| ParseError::InvalidByteSize(value.to_string()))?;

    let multiplier: u64 = match caps.get(2).map(|m| m.as_str()) {
        None | Some("b") => 1,
        Some("kb") => 1 << 10,
        Some("mb") => 1 << 20,
        Some("gb") => 1 << 30,
        Some("tb") => 1 << 40,
        Some("pb") => 1 << 50,
        Some(other) => return Err(ParseError::InvalidByteSize(other.to_string())),
    };

    Ok((number * multiplier as f64) as u64)
}

/// Parse a watermark value.
///
/// Accepts a percentage (`"85%"`), a ratio (`"0.85"`) or an absolute free-space
/// floor (`"500mb"`).
pub fn parse_watermark(value: &str) -> Result<Watermark, ParseError> {
    let trimmed = value.trim();

    if let Some(percent) = trimmed.strip_suffix('%') {
        let parsed: f64 = percent
            .trim()
            .parse()
            .map_err(|_| ParseError::InvalidWatermark(value.to_string()))?;
        return Ok(Watermark::Percent(parsed));
    }

    // A bare number up to 1.0 is a ratio
    if let Ok(ratio) = trimmed.parse::<f64>()
        && ratio <= 1.0
    {
        return Ok(Watermark::Percent(ratio * 100.0));
    }

    parse_byte_size(trimmed)
        .map(Watermark::Bytes)
        .map_err(|_| ParseError::InvalidWatermark(value.to_string()))
}

/// Look up a dotted setting key in a `_cluster/settings` response.
///
/// Transient settings take precedence over persistent ones, which take
/// precedence over defaults (when `include_defaults=true` was requested).
/// Both flat (`"a.b.c": v`) and nested (`{"a": {"b": {"c": v}}}`) layouts are
/// handled.
pub fn lookup_setting<'a>(
    settings: &'a serde_json::Value,
    key: &str,
) -> Option<&'a serde_json::Value> {
    ["transient", "persistent", "defaults"]
        .iter()
        .filter_map(|section| settings.get(*section))
        .find_map(|section| lookup_dotted(section, key))
}

fn lookup_dotted<'a>(value: &'a serde_json::Value, key: &str) -> Option<&'a serde_json::Value> {
    if let Some(flat) = value.get(key) {
        return Some(flat);
    }
    let (head, rest) = key.split_once('.')?;
    let child = value.get(head)?;
    lookup_dotted(child, rest)
}

/// Read a setting that may be encoded as either a JSON string or a number.
pub fn setting_as_i32(value: &serde_json::Value) -> Option<i32> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().and_then(|v| i32::try_from(v).ok()),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Read a boolean setting that may be encoded as a JSON string.
pub fn setting_as_bool(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

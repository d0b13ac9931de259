//! Asset payload decoding and normalization.

use crate::error::{InstallError, InstallResult};
use serde_json::Value;

/// Decode an asset file into the canonical payload handed to appliers.
///
/// `.json` files are parsed as JSON and everything else as YAML. `metadata`
/// assets may be wrapped as `{format, data}`; the wrapper is removed and a
/// string `data` is parsed according to `format`.
pub fn normalize_payload(asset_type: &str, path: &str, bytes: &[u8]) -> InstallResult<Value> {
    let decoded = if path.ends_with(".json") {
        parse_json(path, bytes)?
    } else {
        parse_yaml(path, bytes)?
    };

    if asset_type == "metadata" {
        return unwrap_metadata(path, decoded);
    }
    Ok(decoded)
}

fn unwrap_metadata(path: &str, value: Value) -> InstallResult<Value> {
    let Value::Object(map) = &value else {
        return Ok(value);
    };
    if map.len() != 2 || !map.contains_key("format") || !map.contains_key("data") {
        return Ok(value);
    }

    let format = map
        .get("format")
        .and_then(Value::as_str)
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| payload_error(path, "metadata 'format' must be a string"))?;

    match map.get("data") {
        Some(Value::String(text)) => match format.as_str() {
            "json" => parse_json(path, text.as_bytes()),
            "yaml" | "yml" => parse_yaml(path, text.as_bytes()),
            other => Err(payload_error(path, format!("unsupported metadata format '{other}'"))),
        },
        Some(data) => Ok(data.clone()),
        None => Ok(Value::Null),
    }
}

fn parse_json(path: &str, bytes: &[u8]) -> InstallResult<Value> {
    serde_json::from_slice(bytes).map_err(|e| payload_error(path, format!("invalid JSON: {e}")))
}

fn parse_yaml(path: &str, bytes: &[u8]) -> InstallResult<Value> {
    serde_yaml::from_slice(bytes).map_err(|e| payload_error(path, format!("invalid YAML: {e}")))
}

fn payload_error(path: &str, message: impl Into<String>) -> InstallError {
    InstallError::PayloadFormat {
        path: path.to_string(),
        message: message.into(),
    }
}

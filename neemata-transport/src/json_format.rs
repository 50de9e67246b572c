//! The reference `Format` implementation: plain `serde_json`.

use neemata_core::format::{Format, FormatError};
use serde_json::Value;

/// Supports `application/json` (and, for convenience, no content-type at
/// all — many minimal clients omit it). Encodes/decodes via `serde_json`
/// directly; no schema validation happens here, that's the dispatcher's
/// job against the procedure's declared `Schema`.
pub struct JsonFormat;

impl Format for JsonFormat {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, FormatError> {
        serde_json::to_vec(value).map_err(|e| FormatError(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, FormatError> {
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(bytes).map_err(|e| FormatError(e.to_string()))
    }

    fn supports(&self, content_type: &str) -> bool {
        content_type.is_empty() || content_type == "application/json"
    }

    fn content_type(&self) -> &str {
        "application/json"
    }
}

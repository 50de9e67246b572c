//! Serialization format selection.
//!
//! The core dispatcher never picks a concrete wire format itself — it asks
//! a [`FormatSelector`] for "whatever supports this content-type" and
//! delegates encode/decode to it, the same indirection `r2e_core::http`
//! leaves to `axum`'s extractors but made explicit and pluggable here
//! since streaming/events need it outside of HTTP bodies too.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

#[derive(Debug)]
pub struct FormatError(pub String);

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for FormatError {}

/// A wire serialization format, selected by content-type.
pub trait Format: Send + Sync {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, FormatError>;
    fn decode(&self, bytes: &[u8]) -> Result<Value, FormatError>;
    fn supports(&self, content_type: &str) -> bool;
    fn content_type(&self) -> &str;
}

/// Chooses the first registered format that supports a given content-type.
/// Mirrors the precedence rule in §6: "the selector chooses the first
/// supporting format."
#[derive(Clone, Default)]
pub struct FormatSelector {
    formats: Vec<Arc<dyn Format>>,
}

impl FormatSelector {
    pub fn new() -> Self {
        FormatSelector { formats: Vec::new() }
    }

    pub fn register(&mut self, format: Arc<dyn Format>) -> &mut Self {
        self.formats.push(format);
        self
    }

    pub fn select(&self, content_type: &str) -> Option<Arc<dyn Format>> {
        self.formats.iter().find(|f| f.supports(content_type)).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Always(&'static str);
    impl Format for Always {
        fn encode(&self, value: &Value) -> Result<Vec<u8>, FormatError> {
            Ok(value.to_string().into_bytes())
        }
        fn decode(&self, bytes: &[u8]) -> Result<Value, FormatError> {
            serde_json::from_slice(bytes).map_err(|e| FormatError(e.to_string()))
        }
        fn supports(&self, content_type: &str) -> bool {
            content_type == self.0
        }
        fn content_type(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn selects_first_supporting_format() {
        let mut selector = FormatSelector::new();
        selector.register(Arc::new(Always("application/json")));
        selector.register(Arc::new(Always("application/cbor")));
        let found = selector.select("application/cbor");
        assert!(found.is_some());
        assert_eq!(found.unwrap().content_type(), "application/cbor");
        assert!(selector.select("application/xml").is_none());
    }
}

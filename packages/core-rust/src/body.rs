//! Message payloads with lazy conversion between text, bytes and JSON.

use std::borrow::Cow;

use bytes::Bytes;

/// Typed message payload.
///
/// The body keeps whatever representation the producer handed over and
/// converts only when a consumer asks for a different one. Conversions never
/// mutate the stored representation.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Body {
    /// No payload.
    #[default]
    Empty,
    /// UTF-8 text.
    Text(String),
    /// Raw bytes. Cheap to clone.
    Bytes(Bytes),
    /// Structured JSON document.
    Json(serde_json::Value),
}

impl Body {
    /// Returns `true` if there is no payload.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Text(s) => s.is_empty(),
            Self::Bytes(b) => b.is_empty(),
            Self::Json(_) => false,
        }
    }

    /// Views the body as text.
    ///
    /// Bytes convert only when they are valid UTF-8. JSON strings yield their
    /// content; other JSON documents are serialized.
    #[must_use]
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Self::Empty => None,
            Self::Text(s) => Some(Cow::Borrowed(s)),
            Self::Bytes(b) => std::str::from_utf8(b).ok().map(Cow::Borrowed),
            Self::Json(serde_json::Value::String(s)) => Some(Cow::Borrowed(s)),
            Self::Json(v) => Some(Cow::Owned(v.to_string())),
        }
    }

    /// Converts the body to bytes. JSON is serialized compactly.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::Empty => Bytes::new(),
            Self::Text(s) => Bytes::copy_from_slice(s.as_bytes()),
            Self::Bytes(b) => b.clone(),
            Self::Json(v) => Bytes::from(v.to_string()),
        }
    }

    /// Parses the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns the parse error when text or bytes are not valid JSON.
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::Empty => Ok(serde_json::Value::Null),
            Self::Text(s) => serde_json::from_str(s),
            Self::Bytes(b) => serde_json::from_slice(b),
            Self::Json(v) => Ok(v.clone()),
        }
    }

    /// Length of the payload in bytes, without converting JSON.
    #[must_use]
    pub fn len_hint(&self) -> Option<usize> {
        match self {
            Self::Empty => Some(0),
            Self::Text(s) => Some(s.len()),
            Self::Bytes(b) => Some(b.len()),
            Self::Json(_) => None,
        }
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Vec<u8>> for Body {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(b))
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self {
        Self::Bytes(b)
    }
}

impl From<serde_json::Value> for Body {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

//! Message model: headers, body and attachments.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::body::Body;
use crate::types::Value;

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

/// Message headers with case-insensitive keys.
///
/// Entries keep insertion order. Inserting a key that already exists under
/// any casing replaces the value in place and adopts the casing of the new
/// key (last write wins).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    entries: Vec<(String, Value)>,
}

impl Headers {
    /// Creates an empty header set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name))
    }

    /// Looks up a header regardless of key casing.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.position(name)
            .and_then(|idx| self.entries.get(idx))
            .map(|(_, value)| value)
    }

    /// Inserts or replaces a header, returning the previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let name = name.into();
        let value = value.into();
        match self.position(&name).and_then(|idx| self.entries.get_mut(idx)) {
            Some(entry) => {
                entry.0 = name;
                Some(std::mem::replace(&mut entry.1, value))
            }
            None => {
                self.entries.push((name, value));
                None
            }
        }
    }

    /// Removes a header regardless of key casing.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.position(name).map(|idx| self.entries.remove(idx).1)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates headers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A message carried by an exchange.
///
/// Cloning produces an independent copy; bodies backed by `Bytes` share
/// their buffer, which is immutable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    headers: Headers,
    body: Body,
    attachments: BTreeMap<String, Bytes>,
}

impl Message {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a message with the given body and no headers.
    #[must_use]
    pub fn with_body(body: impl Into<Body>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.headers.insert(name, value);
    }

    pub fn remove_header(&mut self, name: &str) -> Option<Value> {
        self.headers.remove(name)
    }

    #[must_use]
    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.body = body.into();
    }

    /// Moves the body out, leaving `Body::Empty` behind.
    pub fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.body)
    }

    #[must_use]
    pub fn attachment(&self, name: &str) -> Option<&Bytes> {
        self.attachments.get(name)
    }

    pub fn add_attachment(&mut self, name: impl Into<String>, data: impl Into<Bytes>) {
        self.attachments.insert(name.into(), data.into());
    }

    pub fn remove_attachment(&mut self, name: &str) -> Option<Bytes> {
        self.attachments.remove(name)
    }

    /// Iterates attachments in name order.
    pub fn attachments(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.attachments.iter().map(|(k, v)| (k.as_str(), v))
    }
}


#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn last_insert_wins_for_any_casing(
            key in "[a-zA-Z]{1,8}",
            a in 0_i64..100,
            b in 0_i64..100,
        ) {
            let mut headers = Headers::new();
            headers.insert(key.to_lowercase(), a);
            headers.insert(key.to_uppercase(), b);
            prop_assert_eq!(headers.len(), 1);
            prop_assert_eq!(headers.get(&key), Some(&Value::Int(b)));
        }
    }
}

//! The wire unit carried by every backend.

use std::collections::HashMap;

use bytes::Bytes;

/// String-keyed metadata attached to a message.
///
/// Empty unless tracing is enabled, in which case it carries the serialized
/// trace context (`traceparent`, and `tracestate` when present).
pub type Headers = HashMap<String, String>;

/// Opaque payload plus headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub body: Bytes,
    pub headers: Headers,
}

impl Message {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            headers: Headers::new(),
        }
    }

    pub fn with_headers(body: impl Into<Bytes>, headers: Headers) -> Self {
        Self {
            body: body.into(),
            headers,
        }
    }

    /// Look up a header value.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

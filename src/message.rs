//! Control messages pages post to the worker.
//!
//! Wire format is JSON:
//! `{ "type": "SKIP_WAITING" }` or `{ "type": "CACHE_URLS", "payload": ["/a", "/b"] }`.
//! The older `{ "action": "skipWaiting" }` form is accepted too.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// A command sent to the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Activate the waiting worker now instead of when clients close.
    SkipWaiting,
    /// Add these URLs to the cache, all-or-nothing.
    CacheUrls(Vec<String>),
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: Option<String>,
    action: Option<String>,
    payload: Option<Value>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<&'a [String]>,
}

impl ControlMessage {
    /// Parses a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Message`] for unknown types or a malformed payload.
    pub fn from_value(value: Value) -> Result<Self> {
        let raw: RawMessage = serde_json::from_value(value)
            .map_err(|e| Error::Message(format!("not a control message: {e}")))?;

        match (raw.kind.as_deref(), raw.action.as_deref()) {
            (Some("SKIP_WAITING"), _) | (None, Some("skipWaiting")) => Ok(Self::SkipWaiting),
            (Some("CACHE_URLS"), _) => {
                let payload = raw
                    .payload
                    .ok_or_else(|| Error::Message("CACHE_URLS requires a payload".to_string()))?;
                let urls: Vec<String> = serde_json::from_value(payload).map_err(|_| {
                    Error::Message("CACHE_URLS payload must be an array of strings".to_string())
                })?;
                Ok(Self::CacheUrls(urls))
            }
            (Some(other), _) => Err(Error::Message(format!("unknown type {other:?}"))),
            (None, Some(other)) => Err(Error::Message(format!("unknown action {other:?}"))),
            (None, None) => Err(Error::Message("missing type".to_string())),
        }
    }

    /// Encodes the message in its canonical wire form.
    #[must_use]
    pub fn to_json(&self) -> String {
        let wire = match self {
            Self::SkipWaiting => WireMessage {
                kind: "SKIP_WAITING",
                payload: None,
            },
            Self::CacheUrls(urls) => WireMessage {
                kind: "CACHE_URLS",
                payload: Some(urls),
            },
        };
        serde_json::to_string(&wire).unwrap_or_default()
    }
}

impl FromStr for ControlMessage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(s)?)
    }
}

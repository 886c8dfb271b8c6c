//! Payload and header codecs.
//!
//! Headers are entered as a JSON object whose values are either a string or
//! a list of strings. Anything else is rejected with
//! [`ConsoleError::InvalidHeader`] instead of being coerced.

use async_nats::HeaderMap;
use bytes::Bytes;
use serde::Deserialize;
use tracing::trace;

use crate::error::{ConsoleError, ConsoleResult};
use crate::metrics;
use crate::models::Headers;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HeaderValues {
    One(String),
    Many(Vec<String>),
}

/// Parse header JSON into a typed header map.
///
/// Blank input means "no headers" and yields `None`.
pub fn parse_headers(input: &str) -> ConsoleResult<Option<Headers>> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(None);
    }

    let raw: serde_json::Map<String, serde_json::Value> = serde_json::from_str(input)
        .map_err(|e| ConsoleError::InvalidHeader(format!("expected a JSON object: {e}")))?;

    let mut headers = Headers::new();
    for (name, value) in raw {
        validate_header_name(&name)?;
        let values = match serde_json::from_value::<HeaderValues>(value) {
            Ok(HeaderValues::One(v)) => vec![v],
            Ok(HeaderValues::Many(vs)) => vs,
            Err(_) => {
                return Err(ConsoleError::InvalidHeader(format!(
                    "header '{name}' must be a string or a list of strings"
                )));
            }
        };
        if let Some(bad) = values.iter().find(|v| v.contains(|c: char| c == '\r' || c == '\n')) {
            return Err(ConsoleError::InvalidHeader(format!(
                "header '{name}' value {bad:?} contains a line break"
            )));
        }
        headers.insert(name, values);
    }
    Ok(Some(headers))
}

fn validate_header_name(name: &str) -> ConsoleResult<()> {
    if name.is_empty() {
        return Err(ConsoleError::InvalidHeader("empty header name".into()));
    }
    if let Some(c) = name
        .chars()
        .find(|c| c.is_whitespace() || c.is_control() || *c == ':')
    {
        return Err(ConsoleError::InvalidHeader(format!(
            "header name '{name}' contains invalid character {c:?}"
        )));
    }
    Ok(())
}

/// Convert typed headers into the library's wire header map.
pub fn to_header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, values) in headers {
        for value in values {
            map.append(name.as_str(), value.as_str());
        }
    }
    map
}

/// Convert the library's header map back into typed headers.
pub fn from_header_map(map: &HeaderMap) -> Headers {
    map.iter()
        .map(|(name, values)| {
            (
                name.to_string(),
                values.iter().map(|v| v.as_str().to_owned()).collect(),
            )
        })
        .collect()
}

/// Encode a text payload for the wire.
pub fn encode_payload(text: &str) -> Bytes {
    Bytes::copy_from_slice(text.as_bytes())
}

/// Decode a payload as UTF-8 text, substituting a byte-count placeholder if
/// it is not valid text. Never fails.
pub fn decode_payload(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_owned(),
        Err(err) => {
            metrics::PAYLOAD_DECODE_FALLBACKS.inc();
            trace!(len = payload.len(), error = %err, "payload is not utf-8, using placeholder");
            placeholder(payload.len())
        }
    }
}

/// Placeholder shown for payloads that cannot be displayed as text.
pub fn placeholder(len: usize) -> String {
    format!("<{len} bytes>")
}

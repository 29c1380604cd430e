//! Compact JWT codec
//!
//! Splits a token into header, payload and signature and decodes them
//! without making any trust decision. Malformed input never errors: it yields
//! an empty JSON object, which the claims validator then rejects because the
//! required claims are missing.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::{Map, Value};

/// Position of a segment inside a compact JWT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Header = 0,
    Payload = 1,
    Signature = 2,
}

/// Split a compact token into its three segments.
///
/// Returns `None` unless the token has exactly three `.`-separated parts.
pub fn split(token: &str) -> Option<[&str; 3]> {
    let mut parts = token.split('.');
    let header = parts.next()?;
    let payload = parts.next()?;
    let signature = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some([header, payload, signature])
}

/// Raw (still base64url-encoded) segment of a token.
pub fn raw_segment(token: &str, segment: Segment) -> Option<&str> {
    split(token).map(|parts| parts[segment as usize])
}

/// Decode a base64url string, tolerating trailing `=` padding.
pub fn decode_base64url(input: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD.decode(input.trim_end_matches('=')).ok()
}

/// Decode a segment as JSON. Anything undecodable becomes `{}`.
pub fn decode_segment(token: &str, segment: Segment) -> Value {
    raw_segment(token, segment)
        .and_then(decode_base64url)
        .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok())
        .filter(Value::is_object)
        .unwrap_or_else(empty)
}

fn segment_value(token: Option<&str>, encoded: bool, segment: Segment) -> Value {
    let Some(token) = token else {
        return empty();
    };
    if encoded {
        return raw_segment(token, segment)
            .map(|raw| Value::String(raw.to_owned()))
            .unwrap_or_else(empty);
    }
    decode_segment(token, segment)
}

/// Token header: JSON object, or the raw segment as a string when `encoded`.
pub fn get_header(token: Option<&str>, encoded: bool) -> Value {
    segment_value(token, encoded, Segment::Header)
}

/// Token payload (claims): JSON object, or the raw segment as a string when `encoded`.
pub fn get_payload(token: Option<&str>, encoded: bool) -> Value {
    segment_value(token, encoded, Segment::Payload)
}

/// Token signature: the raw segment when `encoded`; signatures are not JSON,
/// so the decoded form is always `{}`. Use [`signature_bytes`] for the bytes.
pub fn get_signature(token: Option<&str>, encoded: bool) -> Value {
    segment_value(token, encoded, Segment::Signature)
}

/// Decoded signature bytes.
pub fn signature_bytes(token: &str) -> Option<Vec<u8>> {
    raw_segment(token, Segment::Signature).and_then(decode_base64url)
}

/// Whether a decoded claims value carries nothing usable.
pub fn is_empty_claims(claims: &Value) -> bool {
    claims.as_object().is_none_or(Map::is_empty)
}

fn empty() -> Value {
    Value::Object(Map::new())
}

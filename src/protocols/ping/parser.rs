//! Ping protocol parser.
//!
//! Messages are never reassembled: whatever one receive returned is the
//! whole message.

/// Parsed ping request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Exactly the expected request token.
    Ping,
    /// Anything else, including an empty payload.
    Invalid,
}

/// Decode one receive's bytes as text with trailing whitespace removed.
///
/// Invalid UTF-8 is replaced rather than rejected; such a payload can never
/// equal the request token anyway.
pub fn decode(input: &[u8]) -> String {
    String::from_utf8_lossy(input).trim_end().to_string()
}

/// Match a decoded payload against the request token (case-sensitive).
pub fn parse(payload: &str, request: &str) -> Request {
    if payload == request {
        Request::Ping
    } else {
        Request::Invalid
    }
}

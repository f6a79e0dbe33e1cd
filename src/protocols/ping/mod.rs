//! Ping protocol implementation.
//!
//! A minimal request/reply protocol:
//! - Client sends: `ping`, optionally followed by a line terminator
//! - Server responds: `pong`, with no terminator
//!
//! Anything else is a protocol violation. The server closes the
//! connection without replying.
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  ping\n
//! Response: pong
//! ```
//!
//! Both tokens come from configuration; `ping`/`pong` are the defaults.

pub mod parser;

pub use parser::{decode, Request};

/// Request and reply tokens for one server instance.
#[derive(Debug, Clone)]
pub struct PingProtocol {
    request: String,
    reply: Vec<u8>,
}

impl PingProtocol {
    pub fn new(request: impl Into<String>, reply: impl AsRef<[u8]>) -> Self {
        Self {
            request: request.into(),
            reply: reply.as_ref().to_vec(),
        }
    }

    /// Classify a decoded payload.
    pub fn check(&self, payload: &str) -> Request {
        parser::parse(payload, &self.request)
    }

    /// Bytes sent back for a valid request.
    pub fn reply(&self) -> &[u8] {
        &self.reply
    }

    /// Reply as text, for logging.
    pub fn reply_text(&self) -> String {
        String::from_utf8_lossy(&self.reply).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tokens() {
        let protocol = PingProtocol::new("ping", "pong");
        assert_eq!(protocol.check("ping"), Request::Ping);
        assert_eq!(protocol.check("pong"), Request::Invalid);
        assert_eq!(protocol.reply(), b"pong");
        assert_eq!(protocol.reply_text(), "pong");
    }

    #[test]
    fn test_custom_tokens() {
        let protocol = PingProtocol::new("hello", b"world".as_slice());
        assert_eq!(protocol.check("hello"), Request::Ping);
        assert_eq!(protocol.check("ping"), Request::Invalid);
        assert_eq!(protocol.reply(), b"world");
    }
}

//! Protocol implementations.
//!
//! Each protocol has a parser module used by the runtime event loop.
//!
//! - `ping`: one-shot request/reply, `ping` answered with `pong`

pub mod ping;

//! Packet framers.
//!
//! A framer converts between the socket's byte stream and discrete
//! messages. It owns no storage: inbound it consumes the socket's receive
//! buffer and hands whole messages to a sink, outbound it serializes into
//! the send buffer. Incomplete input is never an error; the framer simply
//! returns and waits for more bytes.

mod http;
mod length;

pub use http::HttpTextFramer;
pub use length::{LengthPrefixFramer, LENGTH_HEADER};

use engine_buffer::Buffer;

/// Framing violations. Each of these is terminal for the connection; the
/// socket layer translates them into a drop with the peer's `conn_id`
/// logged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// A header was malformed or truncated in a way more bytes cannot fix.
    #[error("truncated or malformed header")]
    ShortHeader,
    /// A message declared a size past the framer's limit.
    #[error("message of {len} bytes exceeds limit of {max}")]
    Oversize { len: usize, max: usize },
    /// A message failed its integrity check.
    #[error("checksum mismatch")]
    ChecksumMismatch,
    /// The payload could not be decoded.
    #[error("decode failed: {0}")]
    Decode(&'static str),
}

/// Receiver for whole decoded messages.
pub trait MessageSink {
    fn on_message(&mut self, msg: &[u8]);
}

impl<F: FnMut(&[u8])> MessageSink for F {
    fn on_message(&mut self, msg: &[u8]) {
        self(msg)
    }
}

/// A byte-stream to message converter.
pub trait Framer: Send {
    /// Consume every complete message currently in `rx`, dispatching each
    /// to `sink`. Returns the number of messages dispatched. `scratch` is
    /// caller-owned storage for messages that span buffer chunks.
    fn on_readable(
        &mut self,
        rx: &mut Buffer,
        scratch: &mut Vec<u8>,
        sink: &mut dyn MessageSink,
    ) -> Result<usize, FrameError>;

    /// Serialize one outbound message into `tx`.
    fn pack(&mut self, msg: &[u8], tx: &mut Buffer) -> Result<(), FrameError>;
}

/// Which framer a connection uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum FramerKind {
    /// Big-endian u16 payload-length prefix.
    #[default]
    #[cfg_attr(feature = "serde", serde(alias = "length-prefix", alias = "binary"))]
    Length,
    /// HTTP-like text: header block then Content-Length body.
    #[cfg_attr(feature = "serde", serde(alias = "text"))]
    Http,
}

impl FramerKind {
    pub fn create(self) -> Box<dyn Framer> {
        match self {
            FramerKind::Length => Box::new(LengthPrefixFramer::default()),
            FramerKind::Http => Box::new(HttpTextFramer::default()),
        }
    }
}

impl std::fmt::Display for FramerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FramerKind::Length => write!(f, "length"),
            FramerKind::Http => write!(f, "http"),
        }
    }
}

impl std::str::FromStr for FramerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "length" | "length-prefix" | "binary" => Ok(FramerKind::Length),
            "http" | "text" => Ok(FramerKind::Http),
            _ => Err(format!("unknown framer: {}", s)),
        }
    }
}

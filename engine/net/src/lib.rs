//! Socket layer: per-connection state machines over the reactor.
//!
//! A [`Socket`] ties a file descriptor to a send/receive [`Buffer`] pair,
//! an [`IoAdapter`] (plain TCP or TLS), and a packet
//! [`Framer`](protocol_framing::Framer). The [`SessionManager`] owns every
//! socket, drives their I/O from reactor readiness events, and surfaces
//! accepts, connects, messages, and closes to the embedding through an
//! [`EventHandler`].
//!
//! [`Buffer`]: engine_buffer::Buffer

mod adapter;
mod options;
mod session;
mod socket;
mod tls;

pub use adapter::{IoAdapter, IoStatus, PlainIo};
pub use options::resolve;
pub use session::{EventHandler, SessionConfig, SessionManager};
pub use socket::{ConnState, ConnType, OverflowPolicy, Socket, SocketStats};
pub use tls::{load_server_config, TlsIo};

// The framer types are part of this crate's API surface.
pub use protocol_framing::{FrameError, Framer, FramerKind};

use std::fmt;

/// Process-unique connection identifier. Allocated from a monotonic
/// counter and never reused for the lifetime of the process, so a stale
/// id can at worst miss, never hit the wrong connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why a connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// This side asked for the close.
    Local,
    /// The peer shut the connection down.
    PeerClosed,
    /// The peer violated the framing protocol.
    Protocol,
    /// A buffer exceeded its chunk cap under the disconnect policy.
    Overflow,
    /// A terminal transport error.
    IoError,
}

/// Wire-codec tag carried per connection. The codecs themselves live with
/// the embedding; the core only stores and reports the selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum CodecKind {
    #[default]
    None,
    Json,
    FlatBuffers,
    Protobuf,
}

/// Errors surfaced by the embedding-facing session API.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("unknown connection {0}")]
    UnknownConn(ConnId),
    #[error("connection {0} is not writable")]
    NotWritable(ConnId),
    #[error(transparent)]
    Frame(#[from] protocol_framing::FrameError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

//! Engine-level error types.

use std::net::SocketAddr;

use crate::buffer::BufferError;
use crate::framing::FrameError;
use crate::peer::PeerId;
use crate::state::ConnectionState;
use crate::status::{DisconnectReason, Transport};

/// Errors reported by a server or client, either returned from a call or
/// delivered as [`NetEvent::NetworkError`](crate::NetEvent::NetworkError).
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// A socket operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Could not reach the server.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// Address the connect was attempted on.
        addr: SocketAddr,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// The host name did not resolve to any address.
    #[error("could not resolve {0}")]
    Resolve(String),

    /// A handshake step did not finish in time.
    #[error("handshake timed out while in state {0:?}")]
    HandshakeTimeout(ConnectionState),

    /// The remote sent something that could not be read.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The remote sent a valid frame at the wrong moment.
    #[error("unexpected {got} while in state {state:?}")]
    UnexpectedFrame {
        /// Description of what arrived.
        got: &'static str,
        /// State the handshake was in.
        state: ConnectionState,
    },

    /// A handshake frame could not be written.
    #[error("send failed: {0}")]
    Send(#[from] SendError),

    /// The remote closed the connection before the handshake finished.
    #[error("remote closed the handshake: {0}")]
    Rejected(DisconnectReason),

    /// Every peer ID is in use.
    #[error("no peer IDs left")]
    IdsExhausted,
}

/// Errors returned by `send`.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// No established peer has this ID.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    /// The connection is not established, or already closed.
    #[error("not connected")]
    NotConnected,

    /// The payload is larger than the transport allows.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// Bytes written to the buffer.
        size: usize,
        /// Configured maximum for the transport.
        max: usize,
    },

    /// The buffer was rented for the other transport.
    #[error("buffer belongs to {buffer}, cannot send over {requested}")]
    TransportMismatch {
        /// Transport the buffer was created for.
        buffer: Transport,
        /// Transport the send asked for.
        requested: Transport,
    },

    /// The peer has no datagram address yet.
    #[error("peer has no datagram address")]
    NoDatagramAddress,

    /// The buffer could not be stamped.
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// The socket write failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SendError {
    /// The reason a peer is disconnected with when a handshake write fails.
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            Self::Io(e) => DisconnectReason::from_io(e),
            _ => DisconnectReason::ClosedForcefully,
        }
    }
}

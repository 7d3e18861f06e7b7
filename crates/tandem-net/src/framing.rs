//! Length-prefixed framing for both transports.
//!
//! Every frame on the wire starts with a signed 32-bit big-endian prefix:
//!
//! ```text
//! +-------------------+--------------------------------------+
//! | prefix (4 bytes)  | body                                 |
//! +-------------------+--------------------------------------+
//!   0                   heartbeat, no body
//!   n > 0               n payload bytes
//!   n < 0               status code, body depends on the code:
//!                         KeyReply           i32 count + UTF-8 key
//!                         TokenRequest/Token u64 token
//!                         Accepted           u32 peer ID
//!                         ClosedWithMessage  nested [i32 len][payload]
//!                         other codes        no body
//! ```
//!
//! On the stream the frame boundary comes from the prefix. A datagram carries
//! exactly one frame, so its prefix is checked against the received size.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::buffer::{BufferError, BufferPool, FrameBuffer, PREFIX_LEN};
use crate::status::{DisconnectReason, StatusCode};

/// Errors that can occur while reading a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The declared length exceeds the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The declared size.
        size: usize,
        /// The configured maximum.
        max: usize,
    },

    /// The connection was closed before a complete frame was received.
    #[error("connection closed")]
    ConnectionClosed,

    /// The prefix was a negative value with no status code.
    #[error("unknown status code {0}")]
    UnknownStatus(i32),

    /// A status body could not be decoded.
    #[error("malformed status body: {0}")]
    Malformed(#[from] BufferError),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// The reason a peer is disconnected with when this error ends its stream.
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            Self::PayloadTooLarge { .. } => DisconnectReason::PacketTooLarge,
            Self::ConnectionClosed => DisconnectReason::ClosedForcefully,
            Self::UnknownStatus(_) | Self::Malformed(_) => DisconnectReason::InvalidPacket,
            Self::Io(e) => DisconnectReason::from_io(e),
        }
    }
}

/// A decoded control frame.
#[derive(Debug)]
pub enum Control {
    /// Server asks for the key.
    KeyChallenge,
    /// Candidate's key.
    KeyReply(String),
    /// Server-issued rendezvous token.
    TokenRequest(u64),
    /// Token echoed over the datagram channel.
    Token(u64),
    /// Handshake complete with the assigned peer ID.
    Accepted(u32),
    /// Remote side is closing.
    Disconnect {
        /// Announced reason.
        reason: DisconnectReason,
        /// Message attached to [`DisconnectReason::ClosedWithMessage`].
        message: Option<FrameBuffer>,
    },
}

impl Control {
    /// The status code this control travels under.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::KeyChallenge => StatusCode::KeyChallenge,
            Self::KeyReply(_) => StatusCode::KeyReply,
            Self::TokenRequest(_) => StatusCode::TokenRequest,
            Self::Token(_) => StatusCode::Token,
            Self::Accepted(_) => StatusCode::Accepted,
            Self::Disconnect { reason, .. } => reason.status_code(),
        }
    }

    /// Short name for log lines and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::KeyChallenge => "key challenge",
            Self::KeyReply(_) => "key reply",
            Self::TokenRequest(_) => "token request",
            Self::Token(_) => "token",
            Self::Accepted(_) => "accepted",
            Self::Disconnect { .. } => "disconnect",
        }
    }

    /// Encode into a buffer rented from `pool`, status code in the prefix slot.
    pub fn encode(&self, pool: &Arc<BufferPool>) -> Result<FrameBuffer, BufferError> {
        let mut buf = pool.rent_control();
        buf.stamp_status(self.status_code())?;
        match self {
            Self::KeyChallenge => {}
            Self::KeyReply(key) => buf.write(key)?,
            Self::TokenRequest(token) | Self::Token(token) => buf.write(token)?,
            Self::Accepted(id) => buf.write(id)?,
            Self::Disconnect { message, .. } => {
                if let Some(message) = message {
                    buf.write_framed(message)?;
                }
            }
        }
        Ok(buf)
    }
}

/// One frame read from a stream.
#[derive(Debug)]
pub enum StreamFrame {
    /// Zero-length keep-alive.
    Heartbeat,
    /// Application payload, read cursor at its start.
    Packet(FrameBuffer),
    /// A status code and its body.
    Control(Control),
}

/// Read one frame from `reader`.
///
/// Payload buffers are rented from `pool`. A declared payload, key, or
/// nested message longer than `max_payload` fails with
/// [`FrameError::PayloadTooLarge`] before any of it is read.
pub async fn read_stream_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    pool: &Arc<BufferPool>,
    max_payload: usize,
) -> Result<StreamFrame, FrameError> {
    let prefix = read_i32(reader).await?;

    if prefix == 0 {
        return Ok(StreamFrame::Heartbeat);
    }
    if prefix > 0 {
        let buf = read_body(reader, pool, prefix as usize, max_payload).await?;
        return Ok(StreamFrame::Packet(buf));
    }

    let code = StatusCode::from_prefix(prefix).ok_or(FrameError::UnknownStatus(prefix))?;
    let control = match code {
        StatusCode::KeyChallenge => Control::KeyChallenge,
        StatusCode::KeyReply => {
            let len = read_length(reader).await?;
            let body = read_body(reader, pool, len, max_payload).await?;
            let bytes = body.payload()?.to_vec();
            let key = String::from_utf8(bytes).map_err(|_| BufferError::InvalidUtf8)?;
            Control::KeyReply(key)
        }
        StatusCode::TokenRequest => Control::TokenRequest(read_u64(reader).await?),
        StatusCode::Token => Control::Token(read_u64(reader).await?),
        StatusCode::Accepted => Control::Accepted(read_u32(reader).await?),
        StatusCode::ClosedWithMessage => {
            let len = read_length(reader).await?;
            let message = read_body(reader, pool, len, max_payload).await?;
            Control::Disconnect {
                reason: DisconnectReason::ClosedWithMessage,
                message: Some(message),
            }
        }
        other => match other.disconnect_reason() {
            Some(reason) => Control::Disconnect {
                reason,
                message: None,
            },
            None => return Err(FrameError::UnknownStatus(prefix)),
        },
    };
    Ok(StreamFrame::Control(control))
}

/// Classification of one received datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramKind {
    /// Zero prefix, nothing after it.
    Heartbeat,
    /// A rendezvous token.
    Token(u64),
    /// Any other status code.
    Status(i32),
    /// A complete payload of the given length following the prefix.
    Payload(usize),
    /// Fewer bytes arrived than the prefix declared.
    Partial,
    /// More bytes arrived than the prefix declared.
    Overlong,
}

/// Classify a datagram by comparing its prefix with its size.
pub fn classify_datagram(datagram: &[u8]) -> DatagramKind {
    let Some((prefix, body)) = split_prefix(datagram) else {
        return DatagramKind::Partial;
    };

    let declared = match prefix {
        0 => 0,
        p if p == StatusCode::Token.prefix() => 8,
        p if p < 0 => return DatagramKind::Status(p),
        p => p as usize,
    };

    if body.len() < declared {
        return DatagramKind::Partial;
    }
    if body.len() > declared {
        return DatagramKind::Overlong;
    }

    match prefix {
        0 => DatagramKind::Heartbeat,
        p if p == StatusCode::Token.prefix() => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(body);
            DatagramKind::Token(u64::from_be_bytes(raw))
        }
        _ => DatagramKind::Payload(declared),
    }
}

/// The prefix of a datagram, if it is long enough to carry one.
pub fn datagram_prefix(datagram: &[u8]) -> Option<i32> {
    split_prefix(datagram).map(|(prefix, _)| prefix)
}

/// The 4-byte wire form of a heartbeat.
pub const HEARTBEAT_FRAME: [u8; PREFIX_LEN] = [0; PREFIX_LEN];

/// The wire form of a datagram token frame.
pub fn token_datagram(token: u64) -> [u8; PREFIX_LEN + 8] {
    let mut out = [0u8; PREFIX_LEN + 8];
    out[..PREFIX_LEN].copy_from_slice(&StatusCode::Token.prefix().to_be_bytes());
    out[PREFIX_LEN..].copy_from_slice(&token.to_be_bytes());
    out
}

fn split_prefix(datagram: &[u8]) -> Option<(i32, &[u8])> {
    if datagram.len() < PREFIX_LEN {
        return None;
    }
    let (head, body) = datagram.split_at(PREFIX_LEN);
    let mut raw = [0u8; PREFIX_LEN];
    raw.copy_from_slice(head);
    Some((i32::from_be_bytes(raw), body))
}

async fn read_body<R: AsyncRead + Unpin>(
    reader: &mut R,
    pool: &Arc<BufferPool>,
    len: usize,
    max_payload: usize,
) -> Result<FrameBuffer, FrameError> {
    if len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: max_payload,
        });
    }
    let mut buf = pool.rent();
    let body = buf.fill(len)?;
    if len > 0 {
        read_exact(reader, body).await?;
    }
    buf.stamp_length()?;
    Ok(buf)
}

async fn read_length<R: AsyncRead + Unpin>(reader: &mut R) -> Result<usize, FrameError> {
    let len = read_i32(reader).await?;
    usize::try_from(len).map_err(|_| FrameError::Malformed(BufferError::NegativeLength(len)))
}

async fn read_i32<R: AsyncRead + Unpin>(reader: &mut R) -> Result<i32, FrameError> {
    let mut raw = [0u8; 4];
    read_exact(reader, &mut raw).await?;
    Ok(i32::from_be_bytes(raw))
}

async fn read_u32<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u32, FrameError> {
    let mut raw = [0u8; 4];
    read_exact(reader, &mut raw).await?;
    Ok(u32::from_be_bytes(raw))
}

async fn read_u64<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u64, FrameError> {
    let mut raw = [0u8; 8];
    read_exact(reader, &mut raw).await?;
    Ok(u64::from_be_bytes(raw))
}

async fn read_exact<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(FrameError::ConnectionClosed),
        Err(e) => Err(FrameError::Io(e)),
    }
}

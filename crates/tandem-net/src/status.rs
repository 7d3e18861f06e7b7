//! In-band status codes and disconnect reasons.
//!
//! A status code travels in the length-prefix position of a frame. Zero is a
//! heartbeat, negative values are control codes, positive values are payload
//! lengths and never appear here.

use std::fmt;
use std::io;

/// The two transports that make up one logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Reliable, ordered TCP channel. Carries the handshake and control frames.
    Stream,
    /// Unreliable UDP channel. No ordering or retransmission.
    Datagram,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream => f.write_str("stream"),
            Self::Datagram => f.write_str("datagram"),
        }
    }
}

/// Control codes carried as the signed 32-bit length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StatusCode {
    /// Zero-length keep-alive.
    Heartbeat = 0,
    /// Server asks the candidate for its key. No payload.
    KeyChallenge = -1,
    /// Candidate answers with its key. Payload: string.
    KeyReply = -2,
    /// Server issues a rendezvous token over the stream. Payload: `u64`.
    TokenRequest = -3,
    /// Client echoes the token over the datagram channel. Payload: `u64`.
    Token = -4,
    /// Handshake complete. Payload: assigned `u32` peer ID.
    Accepted = -5,
    /// Graceful close.
    Closed = -6,
    /// Graceful close followed by a nested length-prefixed message.
    ClosedWithMessage = -7,
    /// Close without notification.
    ClosedForcefully = -8,
    /// Gate denied the connection or the key did not match.
    Denied = -9,
    /// No traffic within the configured timeout.
    Lost = -10,
    /// Pending token was never confirmed over the datagram channel.
    TokenTimedOut = -11,
    /// Declared length exceeded the configured maximum payload size.
    PacketTooLarge = -12,
    /// Frame violated the wire protocol.
    InvalidPacket = -13,
    /// Platform socket failure.
    SocketError = -14,
}

impl StatusCode {
    /// Decode a length-prefix value into a status code.
    ///
    /// Returns `None` for positive values (payload lengths) and for negative
    /// values outside the known range.
    pub fn from_prefix(prefix: i32) -> Option<Self> {
        let code = match prefix {
            0 => Self::Heartbeat,
            -1 => Self::KeyChallenge,
            -2 => Self::KeyReply,
            -3 => Self::TokenRequest,
            -4 => Self::Token,
            -5 => Self::Accepted,
            -6 => Self::Closed,
            -7 => Self::ClosedWithMessage,
            -8 => Self::ClosedForcefully,
            -9 => Self::Denied,
            -10 => Self::Lost,
            -11 => Self::TokenTimedOut,
            -12 => Self::PacketTooLarge,
            -13 => Self::InvalidPacket,
            -14 => Self::SocketError,
            _ => return None,
        };
        Some(code)
    }

    /// The wire value of this code.
    pub fn prefix(self) -> i32 {
        self as i32
    }

    /// The disconnect reason this code announces, if it is a disconnect code.
    ///
    /// [`StatusCode::SocketError`] decodes with code `0`; the platform error
    /// code is never transmitted.
    pub fn disconnect_reason(self) -> Option<DisconnectReason> {
        let reason = match self {
            Self::Closed => DisconnectReason::Closed,
            Self::ClosedWithMessage => DisconnectReason::ClosedWithMessage,
            Self::ClosedForcefully => DisconnectReason::ClosedForcefully,
            Self::Denied => DisconnectReason::Denied,
            Self::Lost => DisconnectReason::Lost,
            Self::TokenTimedOut => DisconnectReason::TokenTimedOut,
            Self::PacketTooLarge => DisconnectReason::PacketTooLarge,
            Self::InvalidPacket => DisconnectReason::InvalidPacket,
            Self::SocketError => DisconnectReason::SocketError(0),
            _ => return None,
        };
        Some(reason)
    }
}

/// Why a peer left the connected state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// Graceful close by either side.
    Closed,
    /// Graceful close carrying an application message.
    ClosedWithMessage,
    /// Closed without a notification frame, or the socket hit EOF.
    ClosedForcefully,
    /// Denied by the gate, by a key mismatch, or by the connection limit.
    Denied,
    /// Liveness timeout.
    Lost,
    /// Rendezvous token expired before it was seen over the datagram channel.
    TokenTimedOut,
    /// Declared length above the configured maximum.
    PacketTooLarge,
    /// Protocol violation.
    InvalidPacket,
    /// Platform socket failure with its OS error code.
    SocketError(i32),
}

impl DisconnectReason {
    /// The status code announcing this reason on the wire.
    pub fn status_code(self) -> StatusCode {
        match self {
            Self::Closed => StatusCode::Closed,
            Self::ClosedWithMessage => StatusCode::ClosedWithMessage,
            Self::ClosedForcefully => StatusCode::ClosedForcefully,
            Self::Denied => StatusCode::Denied,
            Self::Lost => StatusCode::Lost,
            Self::TokenTimedOut => StatusCode::TokenTimedOut,
            Self::PacketTooLarge => StatusCode::PacketTooLarge,
            Self::InvalidPacket => StatusCode::InvalidPacket,
            Self::SocketError(_) => StatusCode::SocketError,
        }
    }

    /// Map an I/O error to [`DisconnectReason::SocketError`].
    pub fn from_io(error: &io::Error) -> Self {
        Self::SocketError(error.raw_os_error().unwrap_or(0))
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::ClosedWithMessage => f.write_str("closed with message"),
            Self::ClosedForcefully => f.write_str("closed forcefully"),
            Self::Denied => f.write_str("denied"),
            Self::Lost => f.write_str("connection lost"),
            Self::TokenTimedOut => f.write_str("token timed out"),
            Self::PacketTooLarge => f.write_str("packet too large"),
            Self::InvalidPacket => f.write_str("invalid packet"),
            Self::SocketError(code) => write!(f, "socket error (os error {code})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_values_match_wire_table() {
        assert_eq!(StatusCode::Heartbeat.prefix(), 0);
        assert_eq!(StatusCode::KeyChallenge.prefix(), -1);
        assert_eq!(StatusCode::Token.prefix(), -4);
        assert_eq!(StatusCode::Accepted.prefix(), -5);
        assert_eq!(StatusCode::Closed.prefix(), -6);
        assert_eq!(StatusCode::SocketError.prefix(), -14);
    }

    #[test]
    fn test_every_code_decodes_from_its_prefix() {
        for prefix in -14..=0 {
            let code = StatusCode::from_prefix(prefix).unwrap();
            assert_eq!(code.prefix(), prefix);
        }
        assert_eq!(StatusCode::from_prefix(-15), None);
        assert_eq!(StatusCode::from_prefix(12), None);
    }

    #[test]
    fn test_only_disconnect_codes_carry_reasons() {
        assert!(StatusCode::KeyReply.disconnect_reason().is_none());
        assert!(StatusCode::Accepted.disconnect_reason().is_none());
        assert_eq!(
            StatusCode::Denied.disconnect_reason(),
            Some(DisconnectReason::Denied)
        );
        assert_eq!(
            StatusCode::SocketError.disconnect_reason(),
            Some(DisconnectReason::SocketError(0))
        );
    }

    #[test]
    fn test_reason_status_code_roundtrip() {
        let reasons = [
            DisconnectReason::Closed,
            DisconnectReason::ClosedWithMessage,
            DisconnectReason::ClosedForcefully,
            DisconnectReason::Denied,
            DisconnectReason::Lost,
            DisconnectReason::TokenTimedOut,
            DisconnectReason::PacketTooLarge,
            DisconnectReason::InvalidPacket,
        ];
        for reason in reasons {
            assert_eq!(reason.status_code().disconnect_reason(), Some(reason));
        }
    }

    #[test]
    fn test_socket_error_code_stays_out_of_band() {
        let err = io::Error::from_raw_os_error(104);
        let reason = DisconnectReason::from_io(&err);
        assert_eq!(reason, DisconnectReason::SocketError(104));
        assert_eq!(reason.status_code(), StatusCode::SocketError);
        assert_eq!(reason.to_string(), "socket error (os error 104)");
    }
}

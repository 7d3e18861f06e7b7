//! Observable handshake state.
//!
//! The state of a connection is published through a [`watch`] channel so any
//! number of consumers can follow the handshake without polling.

use tokio::sync::watch;

/// Handshake and connection lifecycle, in the order a client walks through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// TCP connect in progress.
    StreamConnecting,
    /// Stream open, waiting for the server's key challenge.
    AwaitingKeyChallenge,
    /// Key reply written.
    KeySent,
    /// Waiting for the rendezvous token.
    AwaitingToken,
    /// Repeating the token over the datagram channel.
    BroadcastingToken,
    /// Token echoed, waiting for the server to accept.
    AwaitingAccept,
    /// Both channels bound, traffic flows.
    Connected,
    /// Connection ended, or never started.
    Disconnected,
}

impl ConnectionState {
    /// Whether the handshake is still in progress.
    pub fn is_handshaking(self) -> bool {
        !matches!(self, Self::Connected | Self::Disconnected)
    }
}

/// Observable connection state backed by a [`watch`] channel.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a new watch initialized to [`ConnectionState::Disconnected`].
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }

    /// Set the current state, notifying subscribers if it changed.
    pub fn set(&self, state: ConnectionState) {
        self.tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    /// Move to `state` unless the connection is already disconnected.
    ///
    /// Handshake steps racing a teardown use this so a late step cannot
    /// resurrect a closed connection.
    pub fn advance(&self, state: ConnectionState) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == ConnectionState::Disconnected || *current == state {
                return false;
            }
            *current = state;
            true
        })
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_starts_disconnected() {
        let watch = ConnectionStateWatch::new();
        assert_eq!(watch.current(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_state_transitions() {
        let watch = ConnectionStateWatch::new();
        watch.set(ConnectionState::StreamConnecting);
        for next in [
            ConnectionState::AwaitingKeyChallenge,
            ConnectionState::KeySent,
            ConnectionState::AwaitingToken,
            ConnectionState::BroadcastingToken,
            ConnectionState::AwaitingAccept,
            ConnectionState::Connected,
        ] {
            assert!(watch.advance(next));
            assert_eq!(watch.current(), next);
        }
        watch.set(ConnectionState::Disconnected);
        assert_eq!(watch.current(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_advance_never_leaves_disconnected() {
        let watch = ConnectionStateWatch::new();
        watch.set(ConnectionState::AwaitingToken);
        watch.set(ConnectionState::Disconnected);
        assert!(!watch.advance(ConnectionState::Connected));
        assert_eq!(watch.current(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_is_handshaking() {
        assert!(ConnectionState::AwaitingAccept.is_handshaking());
        assert!(!ConnectionState::Connected.is_handshaking());
        assert!(!ConnectionState::Disconnected.is_handshaking());
    }

    #[tokio::test]
    async fn test_subscriber_receives_updates() {
        let watch = ConnectionStateWatch::new();
        let mut rx = watch.subscribe();
        watch.set(ConnectionState::Connected);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectionState::Connected);
    }
}

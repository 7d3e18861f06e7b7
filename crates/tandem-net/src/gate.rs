//! The host's accept/deny decision for an incoming connection.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;

use crate::peer::{PeerId, PeerInfo};

/// Error returned when a gate is decided twice.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    /// `accept_if_key` or `deny` was already called for this candidate.
    #[error("connection from {0} already decided")]
    AlreadyDecided(PeerId),
}

/// What the host decided for a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum GateDecision {
    /// Continue the handshake, requiring this key.
    Accept { key: String },
    /// Reject the candidate.
    Deny,
}

struct GateInner {
    peer: PeerInfo,
    decision: Mutex<Option<oneshot::Sender<GateDecision>>>,
}

/// Handle passed to the host for each incoming connection.
///
/// The first call to [`accept_if_key`](Self::accept_if_key) or
/// [`deny`](Self::deny) wins. A gate whose clones are all dropped without a
/// decision denies the connection.
#[derive(Clone)]
pub struct ConnectionGate {
    inner: Arc<GateInner>,
}

impl ConnectionGate {
    pub(crate) fn new(peer: PeerInfo) -> (Self, oneshot::Receiver<GateDecision>) {
        let (tx, rx) = oneshot::channel();
        let gate = Self {
            inner: Arc::new(GateInner {
                peer,
                decision: Mutex::new(Some(tx)),
            }),
        };
        (gate, rx)
    }

    /// The candidate, with the ID it keeps if the handshake completes.
    pub fn peer(&self) -> &PeerInfo {
        &self.inner.peer
    }

    /// Whether a decision was already made.
    pub fn is_decided(&self) -> bool {
        self.lock().is_none()
    }

    /// Continue the handshake; the candidate must present `key`.
    pub fn accept_if_key(&self, key: impl Into<String>) -> Result<(), GateError> {
        self.decide(GateDecision::Accept { key: key.into() })
    }

    /// Reject the candidate with [`Denied`](crate::DisconnectReason::Denied).
    pub fn deny(&self) -> Result<(), GateError> {
        self.decide(GateDecision::Deny)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<oneshot::Sender<GateDecision>>> {
        self.inner.decision.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn decide(&self, decision: GateDecision) -> Result<(), GateError> {
        let tx = self
            .lock()
            .take()
            .ok_or(GateError::AlreadyDecided(self.inner.peer.id))?;
        // The handshake may already have timed out; the decision is moot then.
        let _ = tx.send(decision);
        Ok(())
    }
}

impl std::fmt::Debug for ConnectionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGate")
            .field("peer", &self.inner.peer)
            .field("decided", &self.is_decided())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> PeerInfo {
        PeerInfo {
            id: PeerId::UNASSIGNED,
            stream_addr: "127.0.0.1:5000".parse().unwrap(),
            datagram_addr: None,
        }
    }

    #[tokio::test]
    async fn test_accept_delivers_key() {
        let (gate, rx) = ConnectionGate::new(info());
        gate.accept_if_key("secret").unwrap();
        assert_eq!(
            rx.await.unwrap(),
            GateDecision::Accept {
                key: "secret".into()
            }
        );
    }

    #[tokio::test]
    async fn test_second_decision_fails() {
        let (gate, rx) = ConnectionGate::new(info());
        let copy = gate.clone();
        gate.deny().unwrap();
        assert!(copy.is_decided());
        assert_eq!(
            copy.accept_if_key("late"),
            Err(GateError::AlreadyDecided(PeerId::UNASSIGNED))
        );
        assert_eq!(rx.await.unwrap(), GateDecision::Deny);
    }

    #[tokio::test]
    async fn test_dropped_gate_closes_channel() {
        let (gate, rx) = ConnectionGate::new(info());
        drop(gate);
        assert!(rx.await.is_err());
    }

    #[test]
    fn test_decision_after_receiver_gone_is_ok() {
        let (gate, rx) = ConnectionGate::new(info());
        drop(rx);
        assert!(gate.deny().is_ok());
    }
}

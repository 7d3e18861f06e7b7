//! Connection bookkeeping: stream and datagram lookup tables plus the
//! pending-token table used during the rendezvous.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio::sync::{RwLock, oneshot};

use crate::peer::{Peer, PeerId};

/// Error returned when the connection map is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("connection limit reached")]
pub struct ConnectionLimitReached;

#[derive(Default)]
struct Tables {
    by_stream: HashMap<SocketAddr, Arc<Peer>>,
    by_datagram: HashMap<SocketAddr, Arc<Peer>>,
}

/// Every live peer, keyed by stream address and, once established, by
/// datagram address.
pub struct ConnectionMap {
    inner: RwLock<Tables>,
    max_connections: usize,
}

impl ConnectionMap {
    /// Create a map that holds at most `max_connections` streams.
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: RwLock::new(Tables::default()),
            max_connections,
        }
    }

    /// Register an accepted stream. Returns `Err` if the map is at capacity.
    pub async fn insert_stream(&self, peer: Arc<Peer>) -> Result<(), ConnectionLimitReached> {
        let mut tables = self.inner.write().await;
        if tables.by_stream.len() >= self.max_connections {
            return Err(ConnectionLimitReached);
        }
        tables.by_stream.insert(peer.stream_addr(), peer);
        Ok(())
    }

    /// Index `peer` by its datagram address, making it an established peer.
    pub async fn establish(&self, peer: Arc<Peer>, addr: SocketAddr) {
        self.inner.write().await.by_datagram.insert(addr, peer);
    }

    /// Drop `peer` from both tables.
    ///
    /// Entries are only removed if they still point at this exact peer, so a
    /// stale teardown never evicts a newer connection from the same address.
    pub async fn remove(&self, peer: &Arc<Peer>) {
        let mut tables = self.inner.write().await;
        let stream_addr = peer.stream_addr();
        if tables
            .by_stream
            .get(&stream_addr)
            .is_some_and(|p| Arc::ptr_eq(p, peer))
        {
            tables.by_stream.remove(&stream_addr);
        }
        if let Some(addr) = peer.datagram_addr()
            && tables
                .by_datagram
                .get(&addr)
                .is_some_and(|p| Arc::ptr_eq(p, peer))
        {
            tables.by_datagram.remove(&addr);
        }
    }

    /// Established peer whose datagrams come from `addr`.
    pub async fn by_datagram(&self, addr: &SocketAddr) -> Option<Arc<Peer>> {
        self.inner.read().await.by_datagram.get(addr).cloned()
    }

    /// Established peer with `id`.
    pub async fn find(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.inner
            .read()
            .await
            .by_datagram
            .values()
            .find(|p| p.id() == id)
            .cloned()
    }

    /// Every established peer.
    pub async fn established(&self) -> Vec<Arc<Peer>> {
        self.inner.read().await.by_datagram.values().cloned().collect()
    }

    /// Every peer with an open stream, established or not.
    pub async fn all(&self) -> Vec<Arc<Peer>> {
        self.inner.read().await.by_stream.values().cloned().collect()
    }

    /// Number of open streams.
    pub async fn stream_len(&self) -> usize {
        self.inner.read().await.by_stream.len()
    }

    /// Number of established peers.
    pub async fn established_len(&self) -> usize {
        self.inner.read().await.by_datagram.len()
    }

    /// Return whether no stream is open.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.by_stream.is_empty()
    }
}

/// A peer that passed the key check and is waiting for its token to arrive
/// over the datagram channel.
pub struct PendingCandidate {
    /// The waiting peer.
    pub peer: Arc<Peer>,
    /// When the token stops being honoured.
    pub expires_at: Instant,
    /// Fired once the token has been correlated.
    pub finalized: oneshot::Sender<()>,
}

/// Outstanding rendezvous tokens.
#[derive(Default)]
pub struct PendingTable {
    inner: Mutex<HashMap<u64, PendingCandidate>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingCandidate>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `candidate` under `token`. Returns `false` if the token is
    /// already taken.
    pub fn insert(&self, token: u64, candidate: PendingCandidate) -> bool {
        let mut map = self.lock();
        if map.contains_key(&token) {
            return false;
        }
        map.insert(token, candidate);
        true
    }

    /// Remove and return the candidate for `token` if it has not expired.
    ///
    /// Expired entries stay put for the sweeper, which reports them.
    pub fn take_valid(&self, token: u64, now: Instant) -> Option<PendingCandidate> {
        let mut map = self.lock();
        match map.get(&token) {
            Some(candidate) if candidate.expires_at > now => map.remove(&token),
            _ => None,
        }
    }

    /// Remove and return every candidate whose token expired by `now`.
    pub fn drain_expired(&self, now: Instant) -> Vec<PendingCandidate> {
        let mut map = self.lock();
        let expired: Vec<u64> = map
            .iter()
            .filter(|(_, c)| c.expires_at <= now)
            .map(|(token, _)| *token)
            .collect();
        expired.into_iter().filter_map(|t| map.remove(&t)).collect()
    }

    /// Forget `token`.
    pub fn remove(&self, token: u64) -> Option<PendingCandidate> {
        self.lock().remove(&token)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    async fn make_peer(id: u32) -> (Arc<Peer>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (stream, from) = listener.accept().await.unwrap();
        let (_reader, writer) = stream.into_split();
        (Peer::new(PeerId(id), from, writer), remote)
    }

    fn candidate(peer: Arc<Peer>, expires_at: Instant) -> (PendingCandidate, oneshot::Receiver<()>) {
        let (finalized, rx) = oneshot::channel();
        (
            PendingCandidate {
                peer,
                expires_at,
                finalized,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_max_connections_enforced() {
        let map = ConnectionMap::new(2);
        let (a, _ra) = make_peer(1).await;
        let (b, _rb) = make_peer(2).await;
        let (c, _rc) = make_peer(3).await;
        map.insert_stream(a).await.unwrap();
        map.insert_stream(b).await.unwrap();
        assert_eq!(map.insert_stream(c).await, Err(ConnectionLimitReached));
        assert_eq!(map.stream_len().await, 2);
    }

    #[tokio::test]
    async fn test_establish_and_lookup() {
        let map = ConnectionMap::new(8);
        let (peer, _remote) = make_peer(5).await;
        let udp: SocketAddr = "127.0.0.1:9000".parse().unwrap();

        map.insert_stream(Arc::clone(&peer)).await.unwrap();
        assert_eq!(map.established_len().await, 0);
        assert!(map.find(PeerId(5)).await.is_none());

        peer.bind_datagram(udp);
        map.establish(Arc::clone(&peer), udp).await;
        assert!(Arc::ptr_eq(&map.by_datagram(&udp).await.unwrap(), &peer));
        assert!(Arc::ptr_eq(&map.find(PeerId(5)).await.unwrap(), &peer));
        assert_eq!(map.established().await.len(), 1);

        map.remove(&peer).await;
        assert!(map.is_empty().await);
        assert_eq!(map.established_len().await, 0);
    }

    #[tokio::test]
    async fn test_remove_ignores_replaced_entry() {
        let map = ConnectionMap::new(8);
        let (old, _r1) = make_peer(1).await;
        let (new, _r2) = make_peer(2).await;
        let udp: SocketAddr = "127.0.0.1:9001".parse().unwrap();

        old.bind_datagram(udp);
        new.bind_datagram(udp);
        map.establish(Arc::clone(&old), udp).await;
        map.establish(Arc::clone(&new), udp).await;

        map.remove(&old).await;
        assert!(Arc::ptr_eq(&map.by_datagram(&udp).await.unwrap(), &new));
    }

    #[tokio::test]
    async fn test_pending_token_lifecycle() {
        let table = PendingTable::new();
        let (peer, _remote) = make_peer(1).await;
        let now = Instant::now();
        let (entry, _rx) = candidate(Arc::clone(&peer), now + Duration::from_secs(5));

        assert!(table.insert(42, entry));
        let (dup, _rx2) = candidate(peer, now + Duration::from_secs(5));
        assert!(!table.insert(42, dup), "tokens are unique");

        assert!(table.take_valid(7, now).is_none());
        let taken = table.take_valid(42, now).unwrap();
        assert_eq!(taken.peer.id(), PeerId(1));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_expired_token_is_not_taken() {
        let table = PendingTable::new();
        let (peer, _remote) = make_peer(1).await;
        let now = Instant::now();
        let (entry, _rx) = candidate(peer, now + Duration::from_millis(10));
        table.insert(9, entry);

        let later = now + Duration::from_millis(20);
        assert!(table.take_valid(9, later).is_none());
        assert_eq!(table.len(), 1, "left for the sweeper");

        let expired = table.drain_expired(later);
        assert_eq!(expired.len(), 1);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_drain_keeps_live_tokens() {
        let table = PendingTable::new();
        let (a, _ra) = make_peer(1).await;
        let (b, _rb) = make_peer(2).await;
        let now = Instant::now();
        let (live, _rx1) = candidate(a, now + Duration::from_secs(5));
        let (dead, _rx2) = candidate(b, now);
        table.insert(1, live);
        table.insert(2, dead);

        let expired = table.drain_expired(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].peer.id(), PeerId(2));
        assert!(table.remove(1).is_some());
    }
}

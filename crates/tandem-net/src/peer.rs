//! Per-connection state shared between the engine's tasks.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, watch};

use crate::state::{ConnectionState, ConnectionStateWatch};
use crate::status::Transport;

/// Identifier assigned to a peer once it is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u32);

impl PeerId {
    /// The ID of a peer that has not finished its handshake.
    pub const UNASSIGNED: PeerId = PeerId(0);

    /// Whether this is a real, allocated ID.
    pub fn is_assigned(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Snapshot of a peer handed to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Assigned ID, or [`PeerId::UNASSIGNED`] during the handshake.
    pub id: PeerId,
    /// Remote address of the stream channel.
    pub stream_addr: SocketAddr,
    /// Remote address of the datagram channel once bound.
    pub datagram_addr: Option<SocketAddr>,
}

/// Idle and timeout counters for both transports, in milliseconds.
///
/// Idle counts time since the last send, timeout counts time since the last
/// receive. Both are touched from several tasks without a lock.
#[derive(Debug, Default)]
pub struct PeerCounters {
    stream_idle: AtomicU64,
    stream_timeout: AtomicU64,
    datagram_idle: AtomicU64,
    datagram_timeout: AtomicU64,
}

impl PeerCounters {
    fn pair(&self, transport: Transport) -> (&AtomicU64, &AtomicU64) {
        match transport {
            Transport::Stream => (&self.stream_idle, &self.stream_timeout),
            Transport::Datagram => (&self.datagram_idle, &self.datagram_timeout),
        }
    }

    /// Add `elapsed` to both counters of `transport` and return the new
    /// `(idle, timeout)` values.
    pub fn advance(&self, transport: Transport, elapsed: Duration) -> (Duration, Duration) {
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        let (idle, timeout) = self.pair(transport);
        let idle = idle.fetch_add(ms, Ordering::Relaxed).saturating_add(ms);
        let timeout = timeout.fetch_add(ms, Ordering::Relaxed).saturating_add(ms);
        (Duration::from_millis(idle), Duration::from_millis(timeout))
    }

    /// Something was sent on `transport`.
    pub fn reset_idle(&self, transport: Transport) {
        self.pair(transport).0.store(0, Ordering::Relaxed);
    }

    /// Something was received on `transport`.
    pub fn reset_timeout(&self, transport: Transport) {
        self.pair(transport).1.store(0, Ordering::Relaxed);
    }

    /// Current `(idle, timeout)` of `transport`.
    pub fn get(&self, transport: Transport) -> (Duration, Duration) {
        let (idle, timeout) = self.pair(transport);
        (
            Duration::from_millis(idle.load(Ordering::Relaxed)),
            Duration::from_millis(timeout.load(Ordering::Relaxed)),
        )
    }
}

/// One connection, from the moment its stream is accepted until teardown.
pub struct Peer {
    id: AtomicU32,
    stream_addr: SocketAddr,
    datagram_addr: OnceLock<SocketAddr>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    counters: PeerCounters,
    state: Arc<ConnectionStateWatch>,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
    pending_token: AtomicU64,
}

impl Peer {
    /// Wrap the write half of a freshly accepted stream.
    pub fn new(id: PeerId, stream_addr: SocketAddr, writer: OwnedWriteHalf) -> Arc<Self> {
        let state = Arc::new(ConnectionStateWatch::new());
        state.set(ConnectionState::StreamConnecting);
        Self::with_state(id, stream_addr, writer, state)
    }

    /// Wrap a stream whose handshake state is already being tracked.
    pub(crate) fn with_state(
        id: PeerId,
        stream_addr: SocketAddr,
        writer: OwnedWriteHalf,
        state: Arc<ConnectionStateWatch>,
    ) -> Arc<Self> {
        let (close_tx, _) = watch::channel(false);
        Arc::new(Self {
            id: AtomicU32::new(id.0),
            stream_addr,
            datagram_addr: OnceLock::new(),
            writer: Mutex::new(Some(writer)),
            counters: PeerCounters::default(),
            state,
            closed: AtomicBool::new(false),
            close_tx,
            pending_token: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> PeerId {
        PeerId(self.id.load(Ordering::Acquire))
    }

    pub(crate) fn set_id(&self, id: PeerId) {
        self.id.store(id.0, Ordering::Release);
    }

    pub fn stream_addr(&self) -> SocketAddr {
        self.stream_addr
    }

    pub fn datagram_addr(&self) -> Option<SocketAddr> {
        self.datagram_addr.get().copied()
    }

    /// Bind the remote datagram address. Only the first call wins.
    pub(crate) fn bind_datagram(&self, addr: SocketAddr) -> bool {
        self.datagram_addr.set(addr).is_ok()
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id(),
            stream_addr: self.stream_addr,
            datagram_addr: self.datagram_addr(),
        }
    }

    pub fn counters(&self) -> &PeerCounters {
        &self.counters
    }

    pub fn state(&self) -> &ConnectionStateWatch {
        &self.state
    }

    /// Token this peer is waiting on, if any.
    pub fn pending_token(&self) -> Option<u64> {
        match self.pending_token.load(Ordering::Acquire) {
            0 => None,
            token => Some(token),
        }
    }

    pub(crate) fn set_pending_token(&self, token: Option<u64>) {
        self.pending_token.store(token.unwrap_or(0), Ordering::Release);
    }

    /// Write raw bytes to the stream.
    pub(crate) async fn write_stream(&self, bytes: &[u8]) -> std::io::Result<()> {
        self.announce_and_write(bytes, || {}).await
    }

    /// Run `announce` while holding the stream writer, then write `bytes`.
    ///
    /// No other write reaches the stream between the two. A write still
    /// pending when the peer is torn down fails with `NotConnected`.
    pub(crate) async fn announce_and_write(
        &self,
        bytes: &[u8],
        announce: impl FnOnce(),
    ) -> std::io::Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotConnected))?;
        announce();
        self.write_until_closed(writer, bytes).await
    }

    /// Write `bytes` unless another write currently holds the stream.
    ///
    /// Returns `None` when the writer is busy.
    pub(crate) async fn try_write_stream(&self, bytes: &[u8]) -> Option<std::io::Result<()>> {
        let mut guard = self.writer.try_lock().ok()?;
        let Some(writer) = guard.as_mut() else {
            return Some(Err(std::io::ErrorKind::NotConnected.into()));
        };
        Some(self.write_until_closed(writer, bytes).await)
    }

    async fn write_until_closed(&self, writer: &mut OwnedWriteHalf, bytes: &[u8]) -> std::io::Result<()> {
        tokio::select! {
            written = writer.write_all(bytes) => written,
            _ = wait_signal(self.closed_signal()) => Err(std::io::ErrorKind::NotConnected.into()),
        }
    }

    /// Close the write side of the stream. Later writes fail.
    ///
    /// Call after [`Peer::signal_closed`] so a write blocked on a full
    /// socket gives the writer up.
    pub(crate) async fn shutdown_stream(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
    }

    /// Claim the teardown. Returns `true` for exactly one caller.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wake every task waiting on [`Peer::closed_signal`].
    pub(crate) fn signal_closed(&self) {
        self.close_tx.send_replace(true);
    }

    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id())
            .field("stream_addr", &self.stream_addr)
            .field("datagram_addr", &self.datagram_addr())
            .field("state", &self.state.current())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Resolve once `signal` carries `true` or its sender is gone.
pub(crate) async fn wait_signal(mut signal: watch::Receiver<bool>) {
    loop {
        if *signal.borrow_and_update() {
            return;
        }
        if signal.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn peer_pair() -> (Arc<Peer>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let remote = TcpStream::connect(addr).await.unwrap();
        let (stream, from) = listener.accept().await.unwrap();
        let (_reader, writer) = stream.into_split();
        (Peer::new(PeerId(3), from, writer), remote)
    }

    #[test]
    fn test_counters_advance_and_reset() {
        let counters = PeerCounters::default();
        counters.advance(Transport::Stream, Duration::from_millis(300));
        let (idle, timeout) = counters.advance(Transport::Stream, Duration::from_millis(200));
        assert_eq!(idle, Duration::from_millis(500));
        assert_eq!(timeout, Duration::from_millis(500));

        counters.reset_idle(Transport::Stream);
        assert_eq!(counters.get(Transport::Stream).0, Duration::ZERO);
        assert_eq!(counters.get(Transport::Stream).1, Duration::from_millis(500));
        assert_eq!(counters.get(Transport::Datagram), (Duration::ZERO, Duration::ZERO));
    }

    #[tokio::test]
    async fn test_write_then_shutdown() {
        let (peer, mut remote) = peer_pair().await;
        peer.write_stream(b"ping").await.unwrap();
        peer.shutdown_stream().await;

        let mut received = Vec::new();
        remote.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"ping");

        let err = peer.write_stream(b"late").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_busy_writer_is_skipped() {
        let (peer, mut remote) = peer_pair().await;
        {
            let _held = peer.writer.lock().await;
            assert!(peer.try_write_stream(b"beat").await.is_none());
        }
        peer.try_write_stream(b"beat").await.unwrap().unwrap();

        let mut received = [0u8; 4];
        remote.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"beat");
    }

    #[tokio::test]
    async fn test_blocked_write_gives_up_on_close() {
        let (peer, _remote) = peer_pair().await;
        let writer = Arc::clone(&peer);
        // The remote never reads, so this fills both socket buffers.
        let flood = tokio::spawn(async move {
            let chunk = vec![0u8; 64 * 1024];
            loop {
                if let Err(e) = writer.write_stream(&chunk).await {
                    return e;
                }
            }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!flood.is_finished());

        peer.signal_closed();
        let err = tokio::time::timeout(Duration::from_secs(2), flood)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);
        tokio::time::timeout(Duration::from_secs(1), peer.shutdown_stream())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_mark_closed_wins_once() {
        let (peer, _remote) = peer_pair().await;
        assert!(peer.mark_closed());
        assert!(!peer.mark_closed());
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn test_closed_signal_wakes_waiters() {
        let (peer, _remote) = peer_pair().await;
        let signal = peer.closed_signal();
        let waiter = tokio::spawn(wait_signal(signal));
        peer.signal_closed();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        // Late subscribers see the signal immediately.
        wait_signal(peer.closed_signal()).await;
    }

    #[tokio::test]
    async fn test_datagram_binds_once() {
        let (peer, _remote) = peer_pair().await;
        let first: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let second: SocketAddr = "127.0.0.1:4001".parse().unwrap();
        assert!(peer.bind_datagram(first));
        assert!(!peer.bind_datagram(second));
        assert_eq!(peer.info().datagram_addr, Some(first));
        assert_eq!(peer.info().id, PeerId(3));
    }

    #[test]
    fn test_peer_id_display() {
        assert!(!PeerId::UNASSIGNED.is_assigned());
        assert_eq!(PeerId(12).to_string(), "#12");
    }

    #[tokio::test]
    async fn test_pending_token_zero_means_none() {
        let (peer, _remote) = peer_pair().await;
        assert_eq!(peer.pending_token(), None);
        peer.set_pending_token(Some(77));
        assert_eq!(peer.pending_token(), Some(77));
        peer.set_pending_token(None);
        assert_eq!(peer.pending_token(), None);
    }
}

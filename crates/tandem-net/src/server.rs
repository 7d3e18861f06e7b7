//! Listening side of the transport.
//!
//! Each accepted stream walks through the gate, the key check, and the token
//! rendezvous before it counts as a peer. On the server a peer's state moves
//! `StreamConnecting` (gate pending) → `AwaitingKeyChallenge` (challenge
//! sent) → `BroadcastingToken` (token issued) → `AwaitingAccept` (token seen
//! over UDP) → `Connected`.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinSet;

use crate::buffer::{FrameBuffer, PoolStats};
use crate::config::EngineConfig;
use crate::engine::{Abort, Core, Farewell, Role, Step};
use crate::error::{NetError, SendError};
use crate::events::{EventPump, NetEvent, ServerHandler, server_sink};
use crate::framing::Control;
use crate::gate::{ConnectionGate, GateDecision};
use crate::peer::{Peer, PeerId, PeerInfo, wait_signal};
use crate::platform::{configure_stream, create_datagram_socket, create_listener, ipv4_bind_address};
use crate::state::ConnectionState;
use crate::status::{DisconnectReason, Transport};
use crate::tables::PendingCandidate;
use crate::traffic::TrafficSnapshot;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A listening endpoint that accepts peers over TCP and UDP on one port.
pub struct Server {
    core: Arc<Core>,
    pump: EventPump,
    local_addr: SocketAddr,
}

impl Server {
    /// Listen on `0.0.0.0:port`. Port 0 picks a free port.
    pub async fn listen(config: EngineConfig, port: u16) -> Result<Self, NetError> {
        Self::listen_on(config, ipv4_bind_address(port)).await
    }

    /// Listen on `addr`. The UDP socket binds the same address and port as
    /// the TCP listener.
    pub async fn listen_on(config: EngineConfig, addr: SocketAddr) -> Result<Self, NetError> {
        let config = config.validated();
        let listener = create_listener(addr, &config.socket).await?;
        let local_addr = listener.local_addr()?;
        let udp = create_datagram_socket(local_addr, &config.socket, &config.datagram)?;
        let (core, pump) = Core::new(config, Role::Server, udp);

        tokio::spawn(accept_loop(Arc::clone(&core), listener));
        tokio::spawn(Arc::clone(&core).run_datagram_receiver());
        tokio::spawn(Arc::clone(&core).run_heartbeat(Transport::Stream));
        tokio::spawn(Arc::clone(&core).run_heartbeat(Transport::Datagram));
        tokio::spawn(Arc::clone(&core).run_token_sweeper());

        tracing::info!("Server listening on {local_addr}");
        Ok(Self {
            core,
            pump,
            local_addr,
        })
    }

    /// Address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Register a handler. Handlers are called from [`poll`](Self::poll) in
    /// registration order.
    pub fn subscribe<H: ServerHandler + Send + 'static>(&self, handler: H) {
        self.pump.subscribe(server_sink(handler));
    }

    /// Dispatch queued events to the handlers. Returns how many were
    /// dispatched.
    pub fn poll(&self) -> usize {
        self.pump.poll()
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.pump.subscriber_count()
    }

    /// An empty buffer for a message over `transport`.
    pub fn create_buffer(&self, transport: Transport) -> FrameBuffer {
        self.core.pool(transport).rent()
    }

    /// Send `buffer` to the connected peer `id`.
    pub async fn send(&self, id: PeerId, buffer: FrameBuffer, transport: Transport) -> Result<(), SendError> {
        let peer = self.core.connections.find(id).await.ok_or(SendError::UnknownPeer(id))?;
        self.core.send(&peer, buffer, transport).await
    }

    /// Send `buffer` to every connected peer. Returns how many sends
    /// succeeded.
    pub async fn broadcast(&self, buffer: &FrameBuffer, transport: Transport) -> Result<usize, SendError> {
        let payload = buffer.payload()?;
        let mut sent = 0;
        for peer in self.core.connections.established().await {
            let copy = self.core.pool(transport).rent_with(payload)?;
            match self.core.send(&peer, copy, transport).await {
                Ok(()) => sent += 1,
                Err(e) => tracing::debug!("broadcast to {} failed: {e}", peer.id()),
            }
        }
        Ok(sent)
    }

    /// Close the connection to `id`, telling it why. With a message the
    /// peer sees "closed with message" and receives the payload.
    pub async fn disconnect(&self, id: PeerId, message: Option<FrameBuffer>) -> Result<(), SendError> {
        let peer = self.core.connections.find(id).await.ok_or(SendError::UnknownPeer(id))?;
        let max = self.core.config.stream.max_payload_size;
        if let Some(message) = &message
            && message.len() > max
        {
            return Err(SendError::PayloadTooLarge {
                size: message.len(),
                max,
            });
        }
        let reason = match message {
            Some(_) => DisconnectReason::ClosedWithMessage,
            None => DisconnectReason::Closed,
        };
        self.core.disconnect(&peer, reason, Farewell::Send(message)).await;
        Ok(())
    }

    /// Close the connection to `id` without notifying it.
    pub async fn disconnect_forcefully(&self, id: PeerId) -> Result<(), SendError> {
        let peer = self.core.connections.find(id).await.ok_or(SendError::UnknownPeer(id))?;
        self.core
            .disconnect(&peer, DisconnectReason::ClosedForcefully, Farewell::Skip)
            .await;
        Ok(())
    }

    /// Close every connection, handshaking ones included, then stop
    /// listening. Events already queued can still be polled.
    pub async fn close_all(&self) {
        let mut teardowns = JoinSet::new();
        for peer in self.core.connections.all().await {
            let core = Arc::clone(&self.core);
            teardowns.spawn(async move {
                core.disconnect(&peer, DisconnectReason::Closed, Farewell::Send(None))
                    .await;
            });
        }
        teardowns.join_all().await;
        self.core.shutdown();
        tracing::info!("Server on {} closed", self.local_addr);
    }

    /// Every connected peer.
    pub async fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .core
            .connections
            .established()
            .await
            .iter()
            .map(|p| p.info())
            .collect();
        peers.sort_by_key(|p| p.id);
        peers
    }

    /// Number of connected peers.
    pub async fn peer_count(&self) -> usize {
        self.core.connections.established_len().await
    }

    /// Number of open streams, handshaking ones included.
    pub async fn stream_count(&self) -> usize {
        self.core.connections.stream_len().await
    }

    /// The connected peer with `id`.
    pub async fn peer(&self, id: PeerId) -> Option<PeerInfo> {
        self.core.connections.find(id).await.map(|p| p.info())
    }

    /// Candidates waiting for their token to arrive over UDP.
    pub fn pending_count(&self) -> usize {
        self.core.pending.len()
    }

    /// Bytes and messages moved since the server started.
    pub fn traffic(&self) -> TrafficSnapshot {
        self.core.traffic.snapshot()
    }

    /// Buffer pool counters for `transport`.
    pub fn pool_stats(&self, transport: Transport) -> PoolStats {
        self.core.pool(transport).stats()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.core.shutdown();
    }
}

async fn accept_loop(core: Arc<Core>, listener: TcpListener) {
    run_accept(core, || listener.accept()).await;
}

async fn run_accept<F, Fut>(core: Arc<Core>, mut accept: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<(TcpStream, SocketAddr)>>,
{
    loop {
        let accepted = tokio::select! {
            accepted = accept() => accepted,
            _ = wait_signal(core.shutdown_signal()) => {
                tracing::info!("Server shutting down");
                return;
            }
        };
        match accepted {
            Ok((stream, addr)) => {
                tokio::spawn(handshake(Arc::clone(&core), stream, addr));
            }
            Err(e) => {
                // Errors such as running out of file descriptors persist.
                tracing::warn!("accept failed, retrying in {ACCEPT_BACKOFF:?}: {e}");
                core.events.push(NetEvent::NetworkError(e.into()));
                tokio::select! {
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                    _ = wait_signal(core.shutdown_signal()) => return,
                }
            }
        }
    }
}

async fn handshake(core: Arc<Core>, stream: TcpStream, addr: SocketAddr) {
    if let Err(e) = configure_stream(&stream, &core.config.socket, &core.config.stream) {
        tracing::warn!("could not configure stream from {addr}: {e}");
    }
    let Some(id) = core.allocate_id() else {
        tracing::warn!("no peer IDs left, dropping {addr}");
        core.events.push(NetEvent::NetworkError(NetError::IdsExhausted));
        return;
    };
    let (mut reader, writer) = stream.into_split();
    let peer = Peer::new(id, addr, writer);

    if core.connections.insert_stream(Arc::clone(&peer)).await.is_err() {
        tracing::warn!("Connection limit reached, denying {addr}");
        core.disconnect(&peer, DisconnectReason::Denied, Farewell::Send(None))
            .await;
        return;
    }
    tracing::info!("Accepted stream from {addr} as {id}");

    match admit(&core, &peer, &mut reader).await {
        Ok(()) => Arc::clone(&core).run_stream_receiver(peer, reader).await,
        Err(abort) => core.abort(&peer, abort, false).await,
    }
}

/// Gate, key check, and rendezvous for one accepted stream.
async fn admit(core: &Arc<Core>, peer: &Arc<Peer>, reader: &mut OwnedReadHalf) -> Result<(), Abort> {
    let limit = core.config.handshake_timeout;

    let (gate, decision) = ConnectionGate::new(peer.info());
    core.events.push(NetEvent::ConnectionRequested(gate));
    let key = match core.step(peer, limit, decision).await {
        Step::Done(Ok(GateDecision::Accept { key })) => key,
        Step::Done(_) | Step::TimedOut => {
            tracing::info!("{} denied by the host", peer.stream_addr());
            core.disconnect(peer, DisconnectReason::Denied, Farewell::Send(None))
                .await;
            return Err(Abort::Cancelled);
        }
        Step::Cancelled => return Err(Abort::Cancelled),
    };

    core.send_control(peer, &Control::KeyChallenge)
        .await
        .map_err(Abort::send_failed)?;
    peer.state().advance(ConnectionState::AwaitingKeyChallenge);

    match core.expect_control(peer, reader, limit).await? {
        Control::KeyReply(reply) if reply == key => {}
        Control::KeyReply(_) => {
            tracing::info!("{} presented the wrong key", peer.stream_addr());
            core.disconnect(peer, DisconnectReason::Denied, Farewell::Send(None))
                .await;
            return Err(Abort::Cancelled);
        }
        other => return Err(Abort::unexpected(&other, peer.state().current())),
    }

    let (token, finalized) = issue_token(core, peer);
    if peer.is_closed() {
        core.pending.remove(token);
        return Err(Abort::Cancelled);
    }
    core.send_control(peer, &Control::TokenRequest(token))
        .await
        .map_err(Abort::send_failed)?;
    peer.state().advance(ConnectionState::BroadcastingToken);
    tracing::debug!("{} issued token, waiting for it over UDP", peer.id());

    // The candidate sends nothing on the stream while it broadcasts, so
    // anything read here ends the handshake.
    tokio::select! {
        result = finalized => {
            if result.is_err() {
                // Expired or torn down; the sweeper or teardown reported it.
                return Err(Abort::Cancelled);
            }
        }
        outcome = core.expect_control(peer, reader, core.config.datagram.timeout * 2) => {
            return Err(match outcome {
                Ok(control) => Abort::unexpected(&control, peer.state().current()),
                Err(abort) => abort,
            });
        }
    }

    peer.state().advance(ConnectionState::AwaitingAccept);
    let id = peer.id();
    // The host sees Connected before anything it sends can reach the peer.
    core.announce_control(peer, &Control::Accepted(id.0), || {
        peer.state().advance(ConnectionState::Connected);
        core.events.push(NetEvent::Connected(peer.info()));
    })
    .await
    .map_err(Abort::send_failed)?;

    tracing::info!(
        "{id} connected from {} (datagram {:?})",
        peer.stream_addr(),
        peer.datagram_addr()
    );
    Ok(())
}

/// Register a fresh token for `peer`, expiring after the datagram timeout.
fn issue_token(core: &Core, peer: &Arc<Peer>) -> (u64, oneshot::Receiver<()>) {
    let mut rng = rand::rng();
    loop {
        let token: u64 = rng.random();
        if token == 0 {
            continue;
        }
        let (tx, rx) = oneshot::channel();
        let candidate = PendingCandidate {
            peer: Arc::clone(peer),
            expires_at: Instant::now() + core.config.datagram.timeout,
            finalized: tx,
        };
        if core.pending.insert(token, candidate) {
            peer.set_pending_token(Some(token));
            return (token, rx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;

    fn config() -> EngineConfig {
        EngineConfig {
            handshake_timeout: Duration::from_millis(300),
            ..EngineConfig::default()
        }
        .with_max_payload(1024)
    }

    #[tokio::test]
    async fn test_failing_accept_backs_off() {
        let server = Server::listen(config(), 0).await.unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let accepting = tokio::spawn(run_accept(Arc::clone(&server.core), move || {
            counter.fetch_add(1, Ordering::Relaxed);
            async { Err::<(TcpStream, SocketAddr), _>(std::io::Error::other("too many open files")) }
        }));

        tokio::time::sleep(Duration::from_millis(250)).await;
        server.core.shutdown();
        tokio::time::timeout(Duration::from_secs(1), accepting)
            .await
            .unwrap()
            .unwrap();

        let tries = attempts.load(Ordering::Relaxed);
        assert!((2..=4).contains(&tries), "{tries} accept attempts");
        assert_eq!(server.poll(), tries, "one NetworkError per failure");
    }

    #[tokio::test]
    async fn test_server_binds_to_port() {
        let server = Server::listen(config(), 0).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(server.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_undecided_gate_denies_after_timeout() {
        let server = Server::listen(config(), 0).await.unwrap();
        let addr = SocketAddr::from(([127, 0, 0, 1], server.local_addr().port()));
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let mut wire = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut wire))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(i32::from_be_bytes(wire), DisconnectReason::Denied.status_code().prefix());
    }

    #[tokio::test]
    async fn test_connection_limit_denies_before_gate() {
        let config = EngineConfig {
            max_connections: 1,
            ..config()
        };
        let server = Server::listen(config, 0).await.unwrap();
        let addr = SocketAddr::from(([127, 0, 0, 1], server.local_addr().port()));

        let _first = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut second = TcpStream::connect(addr).await.unwrap();

        let mut wire = [0u8; 4];
        tokio::time::timeout(Duration::from_millis(200), second.read_exact(&mut wire))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(i32::from_be_bytes(wire), DisconnectReason::Denied.status_code().prefix());
        assert_eq!(server.stream_count().await, 1);
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let server = Server::listen(config(), 0).await.unwrap();
        let buffer = server.create_buffer(Transport::Stream);
        let err = server.send(PeerId(9), buffer, Transport::Stream).await.unwrap_err();
        assert!(matches!(err, SendError::UnknownPeer(PeerId(9))));
    }

    #[tokio::test]
    async fn test_close_all_stops_accepting() {
        let server = Server::listen(config(), 0).await.unwrap();
        let addr = SocketAddr::from(([127, 0, 0, 1], server.local_addr().port()));
        server.close_all().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(TcpStream::connect(addr).await.is_err());
    }
}

//! Connecting side of the transport.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use tokio::net::{TcpStream, lookup_host};
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{oneshot, watch};
use tokio::time::MissedTickBehavior;

use crate::buffer::{FrameBuffer, PoolStats};
use crate::config::EngineConfig;
use crate::engine::{Abort, Core, Farewell, Role};
use crate::error::{NetError, SendError};
use crate::events::{ClientHandler, EventPump, NetEvent, client_sink};
use crate::framing::{Control, token_datagram};
use crate::peer::{Peer, PeerId, PeerInfo, wait_signal};
use crate::platform::{configure_stream, create_datagram_socket, local_wildcard_for};
use crate::state::{ConnectionState, ConnectionStateWatch};
use crate::status::{DisconnectReason, Transport};
use crate::traffic::TrafficSnapshot;

/// One connection to a server.
///
/// [`connect`](Self::connect) returns as soon as the sockets are set up; the
/// handshake runs in the background and its outcome arrives through
/// [`poll`](Self::poll) as a Connected or Disconnected event.
pub struct Client {
    core: Arc<Core>,
    pump: EventPump,
    state: Arc<ConnectionStateWatch>,
    server: SocketAddr,
    peer: Arc<OnceLock<Arc<Peer>>>,
}

impl Client {
    /// Start connecting to `address:port`, presenting `key` when challenged.
    pub async fn connect(
        config: EngineConfig,
        address: &str,
        port: u16,
        key: impl Into<String>,
    ) -> Result<Self, NetError> {
        let config = config.validated();
        let server = lookup_host((address, port))
            .await?
            .next()
            .ok_or_else(|| NetError::Resolve(format!("{address}:{port}")))?;
        let udp = create_datagram_socket(local_wildcard_for(&server), &config.socket, &config.datagram)?;
        let (core, pump) = Core::new(config, Role::Client, udp);

        let state = Arc::new(ConnectionStateWatch::new());
        state.set(ConnectionState::StreamConnecting);
        let peer = Arc::new(OnceLock::new());

        tokio::spawn(Arc::clone(&core).run_datagram_receiver());
        tokio::spawn(Arc::clone(&core).run_heartbeat(Transport::Stream));
        tokio::spawn(Arc::clone(&core).run_heartbeat(Transport::Datagram));
        tokio::spawn(handshake(
            Arc::clone(&core),
            Arc::clone(&state),
            server,
            key.into(),
            Arc::clone(&peer),
        ));

        tracing::info!("Connecting to {server}");
        Ok(Self {
            core,
            pump,
            state,
            server,
            peer,
        })
    }

    /// Server address the client connects to.
    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    /// Local address of the datagram socket.
    pub fn local_datagram_addr(&self) -> std::io::Result<SocketAddr> {
        self.core.udp.local_addr()
    }

    /// Current handshake or connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.current()
    }

    /// Receiver that observes every state transition.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// ID the server assigned, once accepted.
    pub fn id(&self) -> Option<PeerId> {
        self.peer.get().map(|p| p.id()).filter(|id| id.is_assigned())
    }

    /// Register a handler. Handlers are called from [`poll`](Self::poll) in
    /// registration order.
    pub fn subscribe<H: ClientHandler + Send + 'static>(&self, handler: H) {
        self.pump.subscribe(client_sink(handler));
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

    /// Send `buffer` to the server.
    pub async fn send(&self, buffer: FrameBuffer, transport: Transport) -> Result<(), SendError> {
        let peer = self.peer.get().ok_or(SendError::NotConnected)?;
        self.core.send(peer, buffer, transport).await
    }

    /// Close the connection, telling the server why. Stops a handshake in
    /// progress.
    pub async fn disconnect(&self, message: Option<FrameBuffer>) {
        let reason = match message {
            Some(_) => DisconnectReason::ClosedWithMessage,
            None => DisconnectReason::Closed,
        };
        self.teardown(reason, Farewell::Send(message)).await;
    }

    /// Close the connection without notifying the server.
    pub async fn disconnect_forcefully(&self) {
        self.teardown(DisconnectReason::ClosedForcefully, Farewell::Skip)
            .await;
    }

    /// Close the connection and stop every background task.
    pub async fn close_all(&self) {
        self.disconnect(None).await;
    }

    async fn teardown(&self, reason: DisconnectReason, farewell: Farewell) {
        match self.peer.get() {
            Some(peer) => self.core.disconnect(peer, reason, farewell).await,
            None => {
                // Still dialing: nothing to notify.
                self.state.set(ConnectionState::Disconnected);
                self.core.shutdown();
            }
        }
    }

    /// Bytes and messages moved since the client started.
    pub fn traffic(&self) -> TrafficSnapshot {
        self.core.traffic.snapshot()
    }

    /// Buffer pool counters for `transport`.
    pub fn pool_stats(&self, transport: Transport) -> PoolStats {
        self.core.pool(transport).stats()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.core.shutdown();
    }
}

async fn handshake(
    core: Arc<Core>,
    state: Arc<ConnectionStateWatch>,
    server: SocketAddr,
    key: String,
    slot: Arc<OnceLock<Arc<Peer>>>,
) {
    let limit = core.config.handshake_timeout;
    let dial = tokio::select! {
        dial = tokio::time::timeout(limit, TcpStream::connect(server)) => dial,
        _ = wait_signal(core.shutdown_signal()) => return,
    };
    let stream = match dial {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            let reason = DisconnectReason::from_io(&e);
            dial_failed(&core, &state, server, NetError::Connect { addr: server, source: e }, reason);
            return;
        }
        Err(_) => {
            let error = NetError::HandshakeTimeout(ConnectionState::StreamConnecting);
            dial_failed(&core, &state, server, error, DisconnectReason::Lost);
            return;
        }
    };
    if let Err(e) = configure_stream(&stream, &core.config.socket, &core.config.stream) {
        tracing::warn!("could not configure stream to {server}: {e}");
    }

    let (mut reader, writer) = stream.into_split();
    let peer = Peer::with_state(PeerId::UNASSIGNED, server, writer, Arc::clone(&state));
    if slot.set(Arc::clone(&peer)).is_err() {
        return;
    }
    let _ = core.connections.insert_stream(Arc::clone(&peer)).await;
    if !state.advance(ConnectionState::AwaitingKeyChallenge) {
        // Disconnected by the host while dialing.
        core.disconnect(&peer, DisconnectReason::Closed, Farewell::Skip).await;
        return;
    }
    tracing::debug!("stream to {server} open, awaiting key challenge");

    match join(&core, &peer, &mut reader, key).await {
        Ok(()) => core.run_stream_receiver(peer, reader).await,
        Err(abort) => core.abort(&peer, abort, true).await,
    }
}

/// Key exchange, token broadcast, and acceptance.
async fn join(core: &Arc<Core>, peer: &Arc<Peer>, reader: &mut OwnedReadHalf, key: String) -> Result<(), Abort> {
    let limit = core.config.handshake_timeout;

    match core.expect_control(peer, reader, limit).await? {
        Control::KeyChallenge => {}
        other => return Err(Abort::unexpected(&other, peer.state().current())),
    }
    core.send_control(peer, &Control::KeyReply(key))
        .await
        .map_err(Abort::send_failed)?;
    peer.state().advance(ConnectionState::KeySent);

    peer.state().advance(ConnectionState::AwaitingToken);
    let token = match core.expect_control(peer, reader, limit).await? {
        Control::TokenRequest(token) => token,
        other => return Err(Abort::unexpected(&other, peer.state().current())),
    };

    peer.state().advance(ConnectionState::BroadcastingToken);
    let (stop_tx, stop_rx) = oneshot::channel();
    tokio::spawn(broadcast_token(Arc::clone(core), Arc::clone(peer), token, stop_rx));

    let accepted = core
        .expect_control(peer, reader, limit + core.config.datagram.timeout)
        .await;
    drop(stop_tx);
    let id = match accepted? {
        Control::Accepted(id) if id != 0 => PeerId(id),
        other => return Err(Abort::unexpected(&other, peer.state().current())),
    };

    let server = peer.stream_addr();
    peer.set_id(id);
    peer.bind_datagram(server);
    core.connections.establish(Arc::clone(peer), server).await;
    peer.counters().reset_timeout(Transport::Datagram);
    if !peer.state().advance(ConnectionState::Connected) {
        return Err(Abort::Cancelled);
    }
    core.events.push(NetEvent::Connected(peer.info()));
    tracing::info!("Connected to {server} as {id}");
    Ok(())
}

/// Repeat the token over UDP every datagram heartbeat until stopped.
async fn broadcast_token(core: Arc<Core>, peer: Arc<Peer>, token: u64, mut stop: oneshot::Receiver<()>) {
    let frame = token_datagram(token);
    let server = peer.stream_addr();
    let mut ticker = tokio::time::interval(core.config.datagram.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut stop => return,
            _ = wait_signal(peer.closed_signal()) => return,
            _ = wait_signal(core.shutdown_signal()) => return,
        }
        match core.udp.send_to(&frame, server).await {
            Ok(sent) => {
                core.traffic.record_send(Transport::Datagram, sent);
                if peer.state().current() == ConnectionState::BroadcastingToken {
                    peer.state().advance(ConnectionState::AwaitingAccept);
                }
                tracing::trace!("token sent to {server}");
            }
            Err(e) => tracing::debug!("token broadcast to {server} failed: {e}"),
        }
    }
}

/// Report a failure that happened before any stream existed.
fn dial_failed(
    core: &Core,
    state: &ConnectionStateWatch,
    server: SocketAddr,
    error: NetError,
    reason: DisconnectReason,
) {
    tracing::warn!("{error}");
    state.set(ConnectionState::Disconnected);
    core.events.push(NetEvent::NetworkError(error));
    core.events.push(NetEvent::Disconnected {
        peer: PeerInfo {
            id: PeerId::UNASSIGNED,
            stream_addr: server,
            datagram_addr: None,
        },
        reason,
        message: None,
    });
    core.shutdown();
}

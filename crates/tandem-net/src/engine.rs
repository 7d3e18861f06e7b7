//! State and background tasks shared by the server and the client.
//!
//! A [`Core`] owns the buffer pools, the connection and pending tables, the
//! ID allocator, the UDP socket, and the event queue. The server and the
//! client each wrap one and spawn the tasks they need on top of it.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::buffer::{BufferPool, FrameBuffer, PREFIX_LEN};
use crate::config::EngineConfig;
use crate::error::{NetError, SendError};
use crate::events::{EventPump, EventQueue, NetEvent};
use crate::framing::{
    Control, DatagramKind, FrameError, HEARTBEAT_FRAME, StreamFrame, classify_datagram,
    datagram_prefix, read_stream_frame,
};
use crate::ids::IdAllocator;
use crate::peer::{Peer, PeerId, wait_signal};
use crate::state::ConnectionState;
use crate::status::{DisconnectReason, Transport};
use crate::tables::{ConnectionMap, PendingTable};
use crate::traffic::TrafficCounters;

/// Which side of the connection an engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Server,
    Client,
}

/// What to do about the status frame when tearing a peer down.
pub(crate) enum Farewell {
    /// Tell the remote why, with an optional message.
    Send(Option<FrameBuffer>),
    /// Close without a status frame.
    Skip,
    /// The remote closed first, possibly with a message.
    Received(Option<FrameBuffer>),
}

impl Farewell {
    /// Notify unless the socket itself is already unusable.
    pub(crate) fn for_failure(reason: DisconnectReason) -> Self {
        match reason {
            DisconnectReason::ClosedForcefully | DisconnectReason::SocketError(_) => Self::Skip,
            _ => Self::Send(None),
        }
    }
}

/// Outcome of a handshake step raced against its deadline and the
/// peer's teardown.
pub(crate) enum Step<T> {
    Done(T),
    TimedOut,
    Cancelled,
}

/// Why a handshake stopped.
pub(crate) enum Abort {
    /// The remote closed with this reason.
    Remote(DisconnectReason, Option<FrameBuffer>),
    /// A local failure, reported with `error`.
    Failed(NetError, DisconnectReason),
    /// The peer was already torn down or the engine is stopping.
    Cancelled,
}

impl Abort {
    pub(crate) fn unexpected(control: &Control, state: ConnectionState) -> Self {
        Self::Failed(
            NetError::UnexpectedFrame {
                got: control.name(),
                state,
            },
            DisconnectReason::InvalidPacket,
        )
    }

    pub(crate) fn send_failed(error: SendError) -> Self {
        let reason = error.disconnect_reason();
        Self::Failed(error.into(), reason)
    }
}

pub(crate) struct Core {
    pub(crate) config: EngineConfig,
    pub(crate) role: Role,
    pub(crate) stream_pool: Arc<BufferPool>,
    pub(crate) datagram_pool: Arc<BufferPool>,
    pub(crate) connections: ConnectionMap,
    pub(crate) pending: PendingTable,
    pub(crate) events: EventQueue,
    pub(crate) traffic: TrafficCounters,
    pub(crate) udp: UdpSocket,
    ids: Mutex<IdAllocator>,
    shutdown_tx: watch::Sender<bool>,
}

impl Core {
    /// `config` must already be validated.
    pub(crate) fn new(config: EngineConfig, role: Role, udp: UdpSocket) -> (Arc<Self>, EventPump) {
        let (events, pump) = EventPump::new();
        let (shutdown_tx, _) = watch::channel(false);
        let core = Arc::new(Self {
            stream_pool: BufferPool::new(Transport::Stream, config.stream.max_payload_size),
            datagram_pool: BufferPool::new(Transport::Datagram, config.datagram.max_payload_size),
            connections: ConnectionMap::new(config.max_connections),
            pending: PendingTable::new(),
            events,
            traffic: TrafficCounters::new(),
            udp,
            ids: Mutex::new(IdAllocator::new()),
            shutdown_tx,
            config,
            role,
        });
        (core, pump)
    }

    pub(crate) fn pool(&self, transport: Transport) -> &Arc<BufferPool> {
        match transport {
            Transport::Stream => &self.stream_pool,
            Transport::Datagram => &self.datagram_pool,
        }
    }

    pub(crate) fn allocate_id(&self) -> Option<PeerId> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner).allocate()
    }

    fn release_id(&self, id: PeerId) {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner).release(id);
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Stop every background task.
    pub(crate) fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Run `fut` until it finishes, `limit` passes, or the peer or engine
    /// shuts down.
    pub(crate) async fn step<T>(&self, peer: &Peer, limit: Duration, fut: impl Future<Output = T>) -> Step<T> {
        tokio::select! {
            result = tokio::time::timeout(limit, fut) => match result {
                Ok(value) => Step::Done(value),
                Err(_) => Step::TimedOut,
            },
            _ = wait_signal(peer.closed_signal()) => Step::Cancelled,
            _ = wait_signal(self.shutdown_signal()) => Step::Cancelled,
        }
    }

    /// Wait for the next control frame of a handshake.
    ///
    /// Heartbeats are skipped, a payload is a protocol violation, and a
    /// disconnect status ends the handshake.
    pub(crate) async fn expect_control(
        &self,
        peer: &Peer,
        reader: &mut OwnedReadHalf,
        limit: Duration,
    ) -> Result<Control, Abort> {
        let state = peer.state().current();
        let max = self.config.stream.max_payload_size;
        let read = async {
            loop {
                match read_stream_frame(reader, &self.stream_pool, max).await? {
                    StreamFrame::Heartbeat => {
                        peer.counters().reset_timeout(Transport::Stream);
                    }
                    other => return Ok::<_, FrameError>(other),
                }
            }
        };
        match self.step(peer, limit, read).await {
            Step::Done(Ok(StreamFrame::Control(Control::Disconnect { reason, message }))) => {
                Err(Abort::Remote(reason, message))
            }
            Step::Done(Ok(StreamFrame::Control(control))) => Ok(control),
            Step::Done(Ok(_)) => Err(Abort::Failed(
                NetError::UnexpectedFrame {
                    got: "payload",
                    state,
                },
                DisconnectReason::InvalidPacket,
            )),
            Step::Done(Err(e)) => {
                let reason = e.disconnect_reason();
                Err(Abort::Failed(e.into(), reason))
            }
            Step::TimedOut => Err(Abort::Failed(
                NetError::HandshakeTimeout(state),
                DisconnectReason::Lost,
            )),
            Step::Cancelled => Err(Abort::Cancelled),
        }
    }

    /// Tear down a peer whose handshake stopped. `report` also raises the
    /// failure as a [`NetEvent::NetworkError`].
    pub(crate) async fn abort(&self, peer: &Arc<Peer>, abort: Abort, report: bool) {
        match abort {
            Abort::Remote(reason, message) => {
                tracing::info!("{} closed the handshake: {reason}", peer.stream_addr());
                if report {
                    self.events.push(NetEvent::NetworkError(NetError::Rejected(reason)));
                }
                self.disconnect(peer, reason, Farewell::Received(message)).await;
            }
            Abort::Failed(error, reason) => {
                tracing::warn!("handshake with {} failed: {error}", peer.stream_addr());
                if report {
                    self.events.push(NetEvent::NetworkError(error));
                }
                self.disconnect(peer, reason, Farewell::for_failure(reason)).await;
            }
            Abort::Cancelled => {}
        }
    }

    /// Stamp `buffer` and send it to a connected peer.
    pub(crate) async fn send(
        &self,
        peer: &Peer,
        mut buffer: FrameBuffer,
        transport: Transport,
    ) -> Result<(), SendError> {
        if peer.is_closed() || peer.state().current() != ConnectionState::Connected {
            return Err(SendError::NotConnected);
        }
        if buffer.transport() != transport {
            return Err(SendError::TransportMismatch {
                buffer: buffer.transport(),
                requested: transport,
            });
        }
        let max = self.config.transport(transport).max_payload_size;
        if buffer.len() > max {
            return Err(SendError::PayloadTooLarge {
                size: buffer.len(),
                max,
            });
        }
        buffer.stamp_length()?;
        let wire = buffer.wire()?;

        match transport {
            Transport::Stream => peer.write_stream(wire).await?,
            Transport::Datagram => {
                let addr = peer.datagram_addr().ok_or(SendError::NoDatagramAddress)?;
                self.udp.send_to(wire, addr).await?;
            }
        }
        peer.counters().reset_idle(transport);
        self.traffic.record_send(transport, wire.len());
        tracing::trace!("sent {} bytes to {} over {transport}", wire.len(), peer.id());
        Ok(())
    }

    /// Write a control frame to the peer's stream.
    pub(crate) async fn send_control(&self, peer: &Peer, control: &Control) -> Result<(), SendError> {
        let frame = control.encode(&self.stream_pool)?;
        let wire = frame.wire()?;
        peer.write_stream(wire).await?;
        peer.counters().reset_idle(Transport::Stream);
        self.traffic.record_send(Transport::Stream, wire.len());
        Ok(())
    }

    /// Write `control` while running `announce` under the stream writer, so
    /// nothing the host sends can overtake it.
    pub(crate) async fn announce_control(
        &self,
        peer: &Peer,
        control: &Control,
        announce: impl FnOnce(),
    ) -> Result<(), SendError> {
        let frame = control.encode(&self.stream_pool)?;
        let wire = frame.wire()?;
        peer.announce_and_write(wire, announce).await?;
        peer.counters().reset_idle(Transport::Stream);
        self.traffic.record_send(Transport::Stream, wire.len());
        Ok(())
    }

    /// A stream heartbeat is skipped while another write holds the writer.
    async fn send_heartbeat(self: Arc<Self>, peer: Arc<Peer>, transport: Transport) {
        let result = match transport {
            Transport::Stream => match peer.try_write_stream(&HEARTBEAT_FRAME).await {
                Some(result) => result,
                None => return,
            },
            Transport::Datagram => match peer.datagram_addr() {
                Some(addr) => self.udp.send_to(&HEARTBEAT_FRAME, addr).await.map(|_| ()),
                None => return,
            },
        };
        match result {
            Ok(()) => {
                self.traffic.record_send(transport, HEARTBEAT_FRAME.len());
                tracing::trace!("heartbeat to {} over {transport}", peer.id());
            }
            Err(e) => tracing::debug!("heartbeat to {} over {transport} failed: {e}", peer.id()),
        }
    }

    /// Tear `peer` down. Only the first call for a peer has any effect.
    ///
    /// The status frame gets at most the handshake timeout. The rest of the
    /// teardown happens whether or not it was written.
    pub(crate) async fn disconnect(&self, peer: &Arc<Peer>, reason: DisconnectReason, farewell: Farewell) {
        if !peer.mark_closed() {
            return;
        }

        let message = match farewell {
            Farewell::Send(message) => {
                let notify = !matches!(
                    reason,
                    DisconnectReason::ClosedForcefully | DisconnectReason::SocketError(_)
                );
                if notify {
                    let reason = match (reason, &message) {
                        (DisconnectReason::ClosedWithMessage, None) => DisconnectReason::Closed,
                        _ => reason,
                    };
                    let control = Control::Disconnect { reason, message };
                    let limit = self.config.handshake_timeout;
                    match tokio::time::timeout(limit, self.send_control(peer, &control)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            tracing::debug!("could not notify {} of {reason}: {e}", peer.stream_addr());
                        }
                        Err(_) => tracing::warn!(
                            "{} did not take the {reason} notice within {limit:?}",
                            peer.stream_addr()
                        ),
                    }
                }
                None
            }
            Farewell::Skip => None,
            Farewell::Received(message) => message,
        };

        peer.signal_closed();
        peer.shutdown_stream().await;
        self.connections.remove(peer).await;
        if let Some(token) = peer.pending_token() {
            self.pending.remove(token);
            peer.set_pending_token(None);
        }

        let info = peer.info();
        if self.role == Role::Server {
            self.release_id(info.id);
        }
        peer.state().set(ConnectionState::Disconnected);
        tracing::info!("{} ({}) disconnected: {reason}", info.id, info.stream_addr);

        self.events.push(NetEvent::Disconnected {
            peer: info,
            reason,
            message,
        });
        if self.role == Role::Client {
            self.shutdown();
        }
    }

    /// Read frames from an established peer's stream until it closes.
    pub(crate) async fn run_stream_receiver(self: Arc<Self>, peer: Arc<Peer>, mut reader: OwnedReadHalf) {
        let max = self.config.stream.max_payload_size;
        loop {
            let frame = tokio::select! {
                frame = read_stream_frame(&mut reader, &self.stream_pool, max) => frame,
                _ = wait_signal(peer.closed_signal()) => return,
                _ = wait_signal(self.shutdown_signal()) => return,
            };

            match frame {
                Ok(StreamFrame::Heartbeat) => {
                    peer.counters().reset_timeout(Transport::Stream);
                    self.traffic.record_receive(Transport::Stream, PREFIX_LEN);
                }
                Ok(StreamFrame::Packet(buffer)) => {
                    peer.counters().reset_timeout(Transport::Stream);
                    self.traffic.record_receive(Transport::Stream, PREFIX_LEN + buffer.len());
                    tracing::trace!("{} bytes from {} over stream", buffer.len(), peer.id());
                    self.events.push(NetEvent::PacketReceived {
                        peer: peer.info(),
                        transport: Transport::Stream,
                        buffer,
                    });
                }
                Ok(StreamFrame::Control(Control::Disconnect { reason, message })) => {
                    self.disconnect(&peer, reason, Farewell::Received(message)).await;
                    return;
                }
                Ok(StreamFrame::Control(control)) => {
                    tracing::warn!("{} sent {} after the handshake", peer.id(), control.name());
                    self.disconnect(&peer, DisconnectReason::InvalidPacket, Farewell::Send(None))
                        .await;
                    return;
                }
                Err(e) => {
                    let reason = e.disconnect_reason();
                    if reason != DisconnectReason::ClosedForcefully {
                        tracing::warn!("stream from {} failed: {e}", peer.id());
                    }
                    self.disconnect(&peer, reason, Farewell::for_failure(reason)).await;
                    return;
                }
            }
        }
    }

    /// Read every datagram arriving on the shared UDP socket.
    pub(crate) async fn run_datagram_receiver(self: Arc<Self>) {
        let max = self.config.datagram.max_payload_size;
        // One spare byte so an overlong datagram is detected instead of
        // silently truncated.
        let mut scratch = vec![0u8; PREFIX_LEN + max + 1];
        loop {
            let received = tokio::select! {
                received = self.udp.recv_from(&mut scratch) => received,
                _ = wait_signal(self.shutdown_signal()) => return,
            };
            let (len, from) = match received {
                Ok(received) => received,
                Err(e) => {
                    // ICMP errors for earlier sends surface here on some
                    // platforms; the socket stays usable.
                    tracing::debug!("datagram receive failed: {e}");
                    continue;
                }
            };
            let datagram = &scratch[..len];

            match self.connections.by_datagram(&from).await {
                Some(peer) => self.handle_peer_datagram(&peer, datagram).await,
                None => self.handle_stranger_datagram(from, datagram).await,
            }
        }
    }

    async fn handle_peer_datagram(&self, peer: &Arc<Peer>, datagram: &[u8]) {
        let max = self.config.datagram.max_payload_size;
        if datagram_prefix(datagram).is_some_and(|p| p > 0 && p as usize > max) {
            tracing::warn!("{} declared an oversized datagram", peer.id());
            self.disconnect(peer, DisconnectReason::PacketTooLarge, Farewell::Send(None))
                .await;
            return;
        }

        match classify_datagram(datagram) {
            DatagramKind::Heartbeat => {
                peer.counters().reset_timeout(Transport::Datagram);
                self.traffic.record_receive(Transport::Datagram, datagram.len());
            }
            DatagramKind::Payload(_) => {
                peer.counters().reset_timeout(Transport::Datagram);
                self.traffic.record_receive(Transport::Datagram, datagram.len());
                match self.datagram_pool.rent_with(&datagram[PREFIX_LEN..]) {
                    Ok(buffer) => self.events.push(NetEvent::PacketReceived {
                        peer: peer.info(),
                        transport: Transport::Datagram,
                        buffer,
                    }),
                    Err(e) => tracing::warn!("dropping datagram from {}: {e}", peer.id()),
                }
            }
            DatagramKind::Partial => {
                tracing::trace!("dropping partial datagram from {}", peer.id());
            }
            DatagramKind::Token(_) => {
                // Repeats of the rendezvous token still in flight.
            }
            DatagramKind::Overlong | DatagramKind::Status(_) => {
                tracing::warn!("invalid datagram from {}", peer.id());
                self.disconnect(peer, DisconnectReason::InvalidPacket, Farewell::Send(None))
                    .await;
            }
        }
    }

    async fn handle_stranger_datagram(&self, from: SocketAddr, datagram: &[u8]) {
        match (self.role, classify_datagram(datagram)) {
            (Role::Server, DatagramKind::Token(token)) => self.correlate(token, from).await,
            _ => tracing::trace!("ignoring datagram from unknown {from}"),
        }
    }

    /// Bind `from` to the candidate waiting on `token`.
    async fn correlate(&self, token: u64, from: SocketAddr) {
        let Some(candidate) = self.pending.take_valid(token, Instant::now()) else {
            tracing::trace!("no live token matches datagram from {from}");
            return;
        };
        let peer = candidate.peer;
        peer.set_pending_token(None);
        if peer.is_closed() || !peer.bind_datagram(from) {
            return;
        }
        self.connections.establish(Arc::clone(&peer), from).await;
        if peer.is_closed() {
            // Lost the race with a teardown that already cleaned the tables.
            self.connections.remove(&peer).await;
            return;
        }
        peer.counters().reset_timeout(Transport::Datagram);
        tracing::debug!("{} bound datagram address {from}", peer.id());
        let _ = candidate.finalized.send(());
    }

    /// Tear `peer` down on its own task so a sweep never waits on one peer.
    fn spawn_disconnect(self: &Arc<Self>, peer: Arc<Peer>, reason: DisconnectReason) {
        let core = Arc::clone(self);
        tokio::spawn(async move {
            core.disconnect(&peer, reason, Farewell::Send(None)).await;
        });
    }

    /// Keep connected peers alive on `transport` and drop silent ones.
    pub(crate) async fn run_heartbeat(self: Arc<Self>, transport: Transport) {
        let config = self.config.transport(transport).clone();
        let mut ticker = tokio::time::interval(config.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last = Instant::now();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = wait_signal(self.shutdown_signal()) => return,
            }
            let now = Instant::now();
            let elapsed = now.duration_since(last);
            last = now;

            for peer in self.connections.established().await {
                if peer.is_closed() || peer.state().current() != ConnectionState::Connected {
                    continue;
                }
                let (idle, silent) = peer.counters().advance(transport, elapsed);
                if silent > config.timeout {
                    tracing::info!("{} silent on {transport} for {silent:?}", peer.id());
                    self.spawn_disconnect(peer, DisconnectReason::Lost);
                } else if idle >= config.heartbeat_interval {
                    peer.counters().reset_idle(transport);
                    tokio::spawn(Arc::clone(&self).send_heartbeat(peer, transport));
                }
            }
        }
    }

    /// Disconnect candidates whose rendezvous token expired.
    pub(crate) async fn run_token_sweeper(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.datagram.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = wait_signal(self.shutdown_signal()) => return,
            }
            for candidate in self.pending.drain_expired(Instant::now()) {
                let peer = candidate.peer;
                peer.set_pending_token(None);
                tracing::info!("token for {} expired", peer.stream_addr());
                self.spawn_disconnect(peer, DisconnectReason::TokenTimedOut);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::create_datagram_socket;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn core(role: Role) -> (Arc<Core>, EventPump) {
        let config = EngineConfig::default().with_max_payload(64).validated();
        let udp = create_datagram_socket("127.0.0.1:0".parse().unwrap(), &config.socket, &config.datagram)
            .unwrap();
        Core::new(config, role, udp)
    }

    async fn connected_peer(core: &Core, id: PeerId) -> (Arc<Peer>, TcpStream, OwnedReadHalf) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (stream, from) = listener.accept().await.unwrap();
        let (reader, writer) = stream.into_split();
        let peer = Peer::new(id, from, writer);
        core.connections.insert_stream(Arc::clone(&peer)).await.unwrap();
        peer.state().set(ConnectionState::Connected);
        (peer, remote, reader)
    }

    #[tokio::test]
    async fn test_send_checks_transport_and_size() {
        let (core, _pump) = core(Role::Server).await;
        let (peer, _remote, _reader) = connected_peer(&core, PeerId(1)).await;

        let buffer = core.pool(Transport::Stream).rent();
        let err = core.send(&peer, buffer, Transport::Datagram).await.unwrap_err();
        assert!(matches!(err, SendError::TransportMismatch { .. }));

        let buffer = core.pool(Transport::Datagram).rent();
        let err = core.send(&peer, buffer, Transport::Datagram).await.unwrap_err();
        assert!(matches!(err, SendError::NoDatagramAddress));
    }

    #[tokio::test]
    async fn test_send_writes_stamped_frame() {
        let (core, _pump) = core(Role::Server).await;
        let (peer, mut remote, _reader) = connected_peer(&core, PeerId(1)).await;

        let mut buffer = core.pool(Transport::Stream).rent();
        buffer.write(&7u16).unwrap();
        core.send(&peer, buffer, Transport::Stream).await.unwrap();

        let mut wire = [0u8; 6];
        remote.read_exact(&mut wire).await.unwrap();
        assert_eq!(wire, [0, 0, 0, 2, 0, 7]);
        assert_eq!(core.traffic.snapshot().stream.bytes_sent, 6);
        assert_eq!(core.stream_pool.stats().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_send_to_handshaking_peer_fails() {
        let (core, _pump) = core(Role::Server).await;
        let (peer, _remote, _reader) = connected_peer(&core, PeerId(1)).await;
        peer.state().set(ConnectionState::AwaitingAccept);
        let buffer = core.pool(Transport::Stream).rent();
        let err = core.send(&peer, buffer, Transport::Stream).await.unwrap_err();
        assert!(matches!(err, SendError::NotConnected));
    }

    #[tokio::test]
    async fn test_disconnect_runs_once_and_recycles_id() {
        let (core, pump) = core(Role::Server).await;
        let id = core.allocate_id().unwrap();
        let (peer, mut remote, _reader) = connected_peer(&core, id).await;

        core.disconnect(&peer, DisconnectReason::Closed, Farewell::Send(None)).await;
        core.disconnect(&peer, DisconnectReason::Lost, Farewell::Send(None)).await;

        let mut wire = Vec::new();
        remote.read_to_end(&mut wire).await.unwrap();
        assert_eq!(wire, DisconnectReason::Closed.status_code().prefix().to_be_bytes());

        assert!(core.connections.is_empty().await);
        assert_eq!(core.allocate_id(), Some(id));
        assert_eq!(peer.state().current(), ConnectionState::Disconnected);
        assert_eq!(pump.poll(), 1, "one Disconnected event");
    }

    #[tokio::test]
    async fn test_forceful_disconnect_sends_nothing() {
        let (core, _pump) = core(Role::Server).await;
        let (peer, mut remote, _reader) = connected_peer(&core, PeerId(1)).await;
        core.disconnect(&peer, DisconnectReason::ClosedForcefully, Farewell::Skip).await;

        let mut wire = Vec::new();
        remote.read_to_end(&mut wire).await.unwrap();
        assert!(wire.is_empty());
    }

    #[tokio::test]
    async fn test_client_disconnect_stops_engine() {
        let (core, _pump) = core(Role::Client).await;
        let (peer, _remote, _reader) = connected_peer(&core, PeerId(4)).await;
        core.disconnect(&peer, DisconnectReason::Closed, Farewell::Skip).await;
        assert!(*core.shutdown_signal().borrow());
    }

    #[test]
    fn test_farewell_for_failure() {
        assert!(matches!(
            Farewell::for_failure(DisconnectReason::ClosedForcefully),
            Farewell::Skip
        ));
        assert!(matches!(
            Farewell::for_failure(DisconnectReason::SocketError(104)),
            Farewell::Skip
        ));
        assert!(matches!(
            Farewell::for_failure(DisconnectReason::InvalidPacket),
            Farewell::Send(None)
        ));
    }
}

//! Event queue and dispatch.
//!
//! Background tasks never call into the host. They push [`NetEvent`]s onto
//! an unbounded queue, and the host drains it by calling `poll`, which hands
//! each event to every subscribed handler in registration order.

use std::sync::{Mutex, PoisonError, TryLockError};

use tokio::sync::mpsc;

use crate::buffer::FrameBuffer;
use crate::error::NetError;
use crate::gate::ConnectionGate;
use crate::peer::{PeerId, PeerInfo};
use crate::status::{DisconnectReason, Transport};

/// Something that happened on a server or client.
#[derive(Debug)]
pub enum NetEvent {
    /// A stream was accepted and waits for the host's gate decision.
    ConnectionRequested(ConnectionGate),
    /// A peer finished the handshake.
    Connected(PeerInfo),
    /// A peer left.
    Disconnected {
        /// The peer as it was when it left.
        peer: PeerInfo,
        /// Why it left.
        reason: DisconnectReason,
        /// Message attached to a close with message.
        message: Option<FrameBuffer>,
    },
    /// An application payload arrived.
    PacketReceived {
        /// Sender.
        peer: PeerInfo,
        /// Channel it arrived on.
        transport: Transport,
        /// Payload, read cursor at its start.
        buffer: FrameBuffer,
    },
    /// A failure not tied to an established peer.
    NetworkError(NetError),
}

impl NetEvent {
    /// Reset the read cursor of any buffer the event carries.
    fn rewind(&mut self) {
        match self {
            Self::PacketReceived { buffer, .. } => buffer.rewind(),
            Self::Disconnected {
                message: Some(message),
                ..
            } => message.rewind(),
            _ => {}
        }
    }
}

/// Callbacks for a listening server. Every method defaults to a no-op.
pub trait ServerHandler {
    /// Decide whether to continue the handshake with a new stream.
    ///
    /// Call [`ConnectionGate::accept_if_key`] or [`ConnectionGate::deny`],
    /// now or later from a clone of the gate. A gate left undecided until
    /// the handshake timeout denies the connection.
    fn on_connection_request(&mut self, _gate: &ConnectionGate) {}

    fn on_connected(&mut self, _peer: &PeerInfo) {}

    fn on_disconnected(
        &mut self,
        _peer: &PeerInfo,
        _reason: DisconnectReason,
        _message: Option<&mut FrameBuffer>,
    ) {
    }

    fn on_packet(&mut self, _peer: &PeerInfo, _transport: Transport, _buffer: &mut FrameBuffer) {}

    fn on_error(&mut self, _error: &NetError) {}
}

/// Callbacks for a client. Every method defaults to a no-op.
pub trait ClientHandler {
    fn on_connected(&mut self, _id: PeerId) {}

    fn on_disconnected(&mut self, _reason: DisconnectReason, _message: Option<&mut FrameBuffer>) {}

    fn on_packet(&mut self, _transport: Transport, _buffer: &mut FrameBuffer) {}

    fn on_error(&mut self, _error: &NetError) {}
}

type Sink = Box<dyn FnMut(&mut NetEvent) + Send>;

/// Fan-out of events to every subscribed sink.
#[derive(Default)]
pub(crate) struct Dispatcher {
    sinks: Vec<Sink>,
}

impl Dispatcher {
    pub(crate) fn add(&mut self, sink: Sink) {
        self.sinks.push(sink);
    }

    pub(crate) fn dispatch(&mut self, event: &mut NetEvent) {
        for sink in &mut self.sinks {
            event.rewind();
            sink(event);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.sinks.len()
    }
}

/// Route events to a [`ServerHandler`].
pub(crate) fn server_sink<H: ServerHandler + Send + 'static>(mut handler: H) -> Sink {
    Box::new(move |event| match event {
        NetEvent::ConnectionRequested(gate) => handler.on_connection_request(gate),
        NetEvent::Connected(peer) => handler.on_connected(peer),
        NetEvent::Disconnected {
            peer,
            reason,
            message,
        } => handler.on_disconnected(peer, *reason, message.as_mut()),
        NetEvent::PacketReceived {
            peer,
            transport,
            buffer,
        } => handler.on_packet(peer, *transport, buffer),
        NetEvent::NetworkError(error) => handler.on_error(error),
    })
}

/// Route events to a [`ClientHandler`].
pub(crate) fn client_sink<H: ClientHandler + Send + 'static>(mut handler: H) -> Sink {
    Box::new(move |event| match event {
        NetEvent::ConnectionRequested(_) => {}
        NetEvent::Connected(peer) => handler.on_connected(peer.id),
        NetEvent::Disconnected {
            reason, message, ..
        } => handler.on_disconnected(*reason, message.as_mut()),
        NetEvent::PacketReceived {
            transport, buffer, ..
        } => handler.on_packet(*transport, buffer),
        NetEvent::NetworkError(error) => handler.on_error(error),
    })
}

/// Producer side, cloned into every background task.
#[derive(Clone)]
pub(crate) struct EventQueue {
    tx: mpsc::UnboundedSender<NetEvent>,
}

impl EventQueue {
    pub(crate) fn push(&self, event: NetEvent) {
        // The pump only goes away with its engine.
        let _ = self.tx.send(event);
    }
}

/// Consumer side, owned by the engine and drained by `poll`.
pub(crate) struct EventPump {
    rx: Mutex<mpsc::UnboundedReceiver<NetEvent>>,
    dispatcher: Mutex<Dispatcher>,
    incoming: Mutex<Vec<Sink>>,
}

impl EventPump {
    pub(crate) fn new() -> (EventQueue, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pump = Self {
            rx: Mutex::new(rx),
            dispatcher: Mutex::new(Dispatcher::default()),
            incoming: Mutex::new(Vec::new()),
        };
        (EventQueue { tx }, pump)
    }

    /// Register a sink. Takes effect from the next `poll`, so a handler may
    /// subscribe another one from inside a callback.
    pub(crate) fn subscribe(&self, sink: Sink) {
        self.incoming
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sink);
    }

    /// Dispatch every event queued when the call began. Returns how many
    /// were dispatched.
    ///
    /// A call made from inside a handler returns 0 without dispatching.
    pub(crate) fn poll(&self) -> usize {
        let mut rx = match self.rx.try_lock() {
            Ok(rx) => rx,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return 0,
        };
        let mut dispatcher = self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner);

        let budget = rx.len();
        let mut dispatched = 0;
        while dispatched < budget {
            for sink in self
                .incoming
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain(..)
            {
                dispatcher.add(sink);
            }
            let Ok(mut event) = rx.try_recv() else {
                break;
            };
            dispatcher.dispatch(&mut event);
            dispatched += 1;
        }
        dispatched
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        let pending = self.incoming.lock().unwrap_or_else(PoisonError::into_inner).len();
        let active = self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner).len();
        pending + active
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::buffer::BufferPool;

    fn info(id: u32) -> PeerInfo {
        PeerInfo {
            id: PeerId(id),
            stream_addr: "127.0.0.1:7000".parse().unwrap(),
            datagram_addr: None,
        }
    }

    #[derive(Default)]
    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ServerHandler for Recorder {
        fn on_connected(&mut self, peer: &PeerInfo) {
            self.log.lock().unwrap().push(format!("connected {}", peer.id));
        }

        fn on_packet(&mut self, peer: &PeerInfo, _: Transport, buffer: &mut FrameBuffer) {
            let text = buffer.read::<String>().unwrap();
            self.log.lock().unwrap().push(format!("{} says {text}", peer.id));
        }

        fn on_disconnected(&mut self, peer: &PeerInfo, reason: DisconnectReason, _: Option<&mut FrameBuffer>) {
            self.log.lock().unwrap().push(format!("{} left: {reason}", peer.id));
        }
    }

    #[test]
    fn test_poll_dispatches_in_order() {
        let (queue, pump) = EventPump::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        pump.subscribe(server_sink(Recorder { log: Arc::clone(&log) }));

        queue.push(NetEvent::Connected(info(1)));
        queue.push(NetEvent::Disconnected {
            peer: info(1),
            reason: DisconnectReason::Lost,
            message: None,
        });

        assert_eq!(pump.poll(), 2);
        assert_eq!(pump.poll(), 0);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["connected #1".to_string(), "#1 left: connection lost".to_string()]
        );
    }

    #[test]
    fn test_every_subscriber_reads_from_start() {
        let (queue, pump) = EventPump::new();
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));
        pump.subscribe(server_sink(Recorder { log: Arc::clone(&first) }));
        pump.subscribe(server_sink(Recorder { log: Arc::clone(&second) }));
        assert_eq!(pump.subscriber_count(), 2);

        let pool = BufferPool::new(Transport::Stream, 64);
        let mut buffer = pool.rent();
        buffer.write("hi").unwrap();
        buffer.stamp_length().unwrap();
        queue.push(NetEvent::PacketReceived {
            peer: info(4),
            transport: Transport::Stream,
            buffer,
        });

        assert_eq!(pump.poll(), 1);
        assert_eq!(*first.lock().unwrap(), vec!["#4 says hi".to_string()]);
        assert_eq!(*second.lock().unwrap(), vec!["#4 says hi".to_string()]);
        assert_eq!(pool.stats().outstanding(), 0, "buffer returned after dispatch");
    }

    #[test]
    fn test_events_queue_until_polled() {
        let (queue, pump) = EventPump::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        queue.push(NetEvent::Connected(info(2)));
        pump.subscribe(server_sink(Recorder { log: Arc::clone(&log) }));
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(pump.poll(), 1);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_client_sink_routes_by_kind() {
        #[derive(Default)]
        struct Client {
            connected: Option<PeerId>,
            errors: usize,
        }
        let state = Arc::new(Mutex::new(Client::default()));

        struct Handler(Arc<Mutex<Client>>);
        impl ClientHandler for Handler {
            fn on_connected(&mut self, id: PeerId) {
                self.0.lock().unwrap().connected = Some(id);
            }
            fn on_error(&mut self, _: &NetError) {
                self.0.lock().unwrap().errors += 1;
            }
        }

        let (queue, pump) = EventPump::new();
        pump.subscribe(client_sink(Handler(Arc::clone(&state))));
        queue.push(NetEvent::Connected(info(9)));
        queue.push(NetEvent::NetworkError(NetError::IdsExhausted));
        pump.poll();

        let state = state.lock().unwrap();
        assert_eq!(state.connected, Some(PeerId(9)));
        assert_eq!(state.errors, 1);
    }
}

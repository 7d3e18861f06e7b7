//! Byte and message counters per transport.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::status::Transport;

/// Live counters for one transport, bumped by the I/O tasks without locking.
#[derive(Debug, Default)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

impl Counters {
    fn snapshot(&self, take: impl Fn(&AtomicU64) -> u64) -> TransportStats {
        TransportStats {
            bytes_sent: take(&self.bytes_sent),
            bytes_received: take(&self.bytes_received),
            messages_sent: take(&self.messages_sent),
            messages_received: take(&self.messages_received),
        }
    }
}

/// Counters for both transports of one engine. Heartbeats and control
/// frames count as messages too.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    stream: Counters,
    datagram: Counters,
}

impl TrafficCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, transport: Transport) -> &Counters {
        match transport {
            Transport::Stream => &self.stream,
            Transport::Datagram => &self.datagram,
        }
    }

    /// Record an outgoing frame of `wire_bytes`, prefix included.
    pub fn record_send(&self, transport: Transport, wire_bytes: usize) {
        let counters = self.get(transport);
        counters.bytes_sent.fetch_add(wire_bytes as u64, Ordering::Relaxed);
        counters.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an incoming frame of `wire_bytes`, prefix included.
    pub fn record_receive(&self, transport: Transport, wire_bytes: usize) {
        let counters = self.get(transport);
        counters.bytes_received.fetch_add(wire_bytes as u64, Ordering::Relaxed);
        counters.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Totals since creation or the last reset.
    pub fn snapshot(&self) -> TrafficSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        TrafficSnapshot {
            stream: self.stream.snapshot(load),
            datagram: self.datagram.snapshot(load),
        }
    }

    /// Snapshot and reset all counters (swap with 0).
    pub fn snapshot_and_reset(&self) -> TrafficSnapshot {
        let take = |c: &AtomicU64| c.swap(0, Ordering::Relaxed);
        TrafficSnapshot {
            stream: self.stream.snapshot(take),
            datagram: self.datagram.snapshot(take),
        }
    }
}

/// Point-in-time counters for one transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

/// Point-in-time counters for both transports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub stream: TransportStats,
    pub datagram: TransportStats,
}

impl TrafficSnapshot {
    /// Stats for `transport`.
    pub fn transport(&self, transport: Transport) -> &TransportStats {
        match transport {
            Transport::Stream => &self.stream,
            Transport::Datagram => &self.datagram,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_per_transport() {
        let counters = TrafficCounters::new();
        counters.record_send(Transport::Stream, 100);
        counters.record_send(Transport::Stream, 50);
        counters.record_receive(Transport::Datagram, 12);

        let snap = counters.snapshot();
        assert_eq!(snap.stream.bytes_sent, 150);
        assert_eq!(snap.stream.messages_sent, 2);
        assert_eq!(snap.transport(Transport::Datagram).bytes_received, 12);
        assert_eq!(snap.datagram.bytes_sent, 0);
    }

    #[test]
    fn test_snapshot_and_reset_zeroes() {
        let counters = TrafficCounters::new();
        counters.record_receive(Transport::Stream, 8);
        let first = counters.snapshot_and_reset();
        assert_eq!(first.stream.messages_received, 1);
        assert_eq!(counters.snapshot(), TrafficSnapshot::default());
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;

        let counters = Arc::new(TrafficCounters::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let c = Arc::clone(&counters);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        c.record_send(Transport::Datagram, 4);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snap = counters.snapshot();
        assert_eq!(snap.datagram.messages_sent, 4000);
        assert_eq!(snap.datagram.bytes_sent, 16_000);
    }
}

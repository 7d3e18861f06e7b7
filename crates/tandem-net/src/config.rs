//! Engine and per-transport tunables.

use std::time::Duration;

use crate::buffer::PREFIX_LEN;
use crate::platform::SocketConfig;
use crate::status::Transport;

/// Largest payload a stream frame can declare.
pub const MAX_STREAM_PAYLOAD: usize = i32::MAX as usize;

/// Largest UDP payload over IPv4 minus the length prefix.
pub const MAX_DATAGRAM_PAYLOAD: usize = 65_507 - PREFIX_LEN;

/// Shortest interval a sweeper is allowed to tick at.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Settings for one transport.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// Idle time after which a heartbeat is sent. Default: 1 s.
    pub heartbeat_interval: Duration,
    /// Silence after which the peer is considered lost. Default: 10 s.
    pub timeout: Duration,
    /// `SO_RCVBUF` in bytes, 0 keeps the platform default.
    pub receive_buffer_size: usize,
    /// `SO_SNDBUF` in bytes, 0 keeps the platform default.
    pub send_buffer_size: usize,
    /// Largest payload accepted or sent, clamped to `[1, platform max]`.
    pub max_payload_size: usize,
}

impl TransportConfig {
    /// Defaults for the stream transport. 1 MB payloads.
    pub fn stream() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(10),
            receive_buffer_size: 0,
            send_buffer_size: 0,
            max_payload_size: 1_048_576,
        }
    }

    /// Defaults for the datagram transport. Payloads sized to fit one
    /// Ethernet MTU.
    pub fn datagram() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(10),
            receive_buffer_size: 0,
            send_buffer_size: 0,
            max_payload_size: 1_400,
        }
    }

    /// Interval the heartbeat sweeper ticks at: a fifth of the heartbeat.
    pub fn sweep_interval(&self) -> Duration {
        (self.heartbeat_interval / 5).max(MIN_SWEEP_INTERVAL)
    }

    /// Clamp the tunables into their legal ranges for `transport`.
    pub fn validated(mut self, transport: Transport) -> Self {
        let platform_max = match transport {
            Transport::Stream => MAX_STREAM_PAYLOAD,
            Transport::Datagram => MAX_DATAGRAM_PAYLOAD,
        };
        self.max_payload_size = self.max_payload_size.clamp(1, platform_max);
        self.heartbeat_interval = self.heartbeat_interval.max(MIN_SWEEP_INTERVAL);
        self.timeout = self.timeout.max(self.heartbeat_interval);
        self
    }
}

/// Complete configuration for one server or client engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Stream transport settings.
    pub stream: TransportConfig,
    /// Datagram transport settings.
    pub datagram: TransportConfig,
    /// Limit for each handshake step, including the host's gate decision.
    /// Default: 5 s.
    pub handshake_timeout: Duration,
    /// Maximum concurrent stream connections (server only). Default: 256.
    pub max_connections: usize,
    /// Socket options applied to every TCP and UDP socket.
    pub socket: SocketConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stream: TransportConfig::stream(),
            datagram: TransportConfig::datagram(),
            handshake_timeout: Duration::from_secs(5),
            max_connections: 256,
            socket: SocketConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Settings for `transport`.
    pub fn transport(&self, transport: Transport) -> &TransportConfig {
        match transport {
            Transport::Stream => &self.stream,
            Transport::Datagram => &self.datagram,
        }
    }

    /// Clamp every tunable into its legal range.
    pub fn validated(mut self) -> Self {
        self.stream = self.stream.validated(Transport::Stream);
        self.datagram = self.datagram.validated(Transport::Datagram);
        self.handshake_timeout = self.handshake_timeout.max(MIN_SWEEP_INTERVAL);
        self.max_connections = self.max_connections.max(1);
        self
    }

    /// Set the maximum payload size on both transports.
    pub fn with_max_payload(mut self, max_payload_size: usize) -> Self {
        self.stream.max_payload_size = max_payload_size;
        self.datagram.max_payload_size = max_payload_size;
        self
    }

    /// Set heartbeat interval and timeout on both transports.
    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        for transport in [&mut self.stream, &mut self.datagram] {
            transport.heartbeat_interval = interval;
            transport.timeout = timeout;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_interval_is_fifth_of_heartbeat() {
        let config = TransportConfig::stream();
        assert_eq!(config.sweep_interval(), Duration::from_millis(200));
    }

    #[test]
    fn test_max_payload_clamped_to_platform_range() {
        let mut config = TransportConfig::datagram();
        config.max_payload_size = 0;
        assert_eq!(config.clone().validated(Transport::Datagram).max_payload_size, 1);

        config.max_payload_size = 1_000_000;
        assert_eq!(
            config.clone().validated(Transport::Datagram).max_payload_size,
            MAX_DATAGRAM_PAYLOAD
        );
        assert_eq!(
            config.validated(Transport::Stream).max_payload_size,
            1_000_000
        );
    }

    #[test]
    fn test_timeout_never_below_heartbeat() {
        let mut config = TransportConfig::stream();
        config.heartbeat_interval = Duration::from_secs(3);
        config.timeout = Duration::from_secs(1);
        let config = config.validated(Transport::Stream);
        assert_eq!(config.timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_builders_touch_both_transports() {
        let config = EngineConfig::default()
            .with_max_payload(1024)
            .with_heartbeat(Duration::from_millis(50), Duration::from_millis(400));
        for transport in [Transport::Stream, Transport::Datagram] {
            let t = config.transport(transport);
            assert_eq!(t.max_payload_size, 1024);
            assert_eq!(t.heartbeat_interval, Duration::from_millis(50));
            assert_eq!(t.timeout, Duration::from_millis(400));
        }
    }
}

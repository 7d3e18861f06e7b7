//! Cross-platform socket setup.
//!
//! [`SocketConfig`] holds the options shared by every socket (TCP_NODELAY,
//! keepalive, SO_REUSEADDR, dual-stack IPv6). The per-transport buffer sizes
//! come from [`TransportConfig`] and are applied alongside them.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::config::TransportConfig;

/// Options applied to every socket the engine opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm for lower latency. Default: true.
    pub tcp_nodelay: bool,
    /// Enable TCP keepalive. Default: true.
    pub keepalive_enabled: bool,
    /// Keepalive idle time before the first probe. Default: 60s.
    pub keepalive_idle: Duration,
    /// Keepalive probe interval. Default: 10s.
    pub keepalive_interval: Duration,
    /// Probes before the OS declares the connection dead. Default: 3.
    pub keepalive_retries: u32,
    /// `SO_REUSEADDR` on server sockets. Default: true except on Windows.
    pub reuse_addr: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            keepalive_enabled: true,
            keepalive_idle: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(10),
            keepalive_retries: 3,
            reuse_addr: !cfg!(target_os = "windows"),
        }
    }
}

/// Apply socket options and stream buffer sizes to a connected [`TcpStream`].
pub fn configure_stream(
    stream: &TcpStream,
    config: &SocketConfig,
    transport: &TransportConfig,
) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;
    let sock_ref = SockRef::from(stream);

    if config.keepalive_enabled {
        let keepalive = TcpKeepalive::new()
            .with_time(config.keepalive_idle)
            .with_interval(config.keepalive_interval);

        // Retries are supported on Linux and Windows but not macOS.
        #[cfg(any(target_os = "linux", target_os = "windows"))]
        let keepalive = keepalive.with_retries(config.keepalive_retries);

        sock_ref.set_tcp_keepalive(&keepalive)?;
    }

    apply_buffer_sizes(&sock_ref, transport)
}

/// Create the server's [`TcpListener`].
///
/// Sets `SO_REUSEADDR` and dual-stack IPv6 (when binding to an IPv6
/// address) before binding.
pub async fn create_listener(addr: SocketAddr, config: &SocketConfig) -> std::io::Result<TcpListener> {
    let socket = Socket::new(domain_for(&addr), Type::STREAM, Some(Protocol::TCP))?;

    if config.reuse_addr {
        socket.set_reuse_address(true)?;
    }
    // Accept both IPv4 and IPv6 on one socket.
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

/// Create a [`UdpSocket`] bound to `addr` with the datagram buffer sizes.
pub fn create_datagram_socket(
    addr: SocketAddr,
    config: &SocketConfig,
    transport: &TransportConfig,
) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(domain_for(&addr), Type::DGRAM, Some(Protocol::UDP))?;

    if config.reuse_addr {
        socket.set_reuse_address(true)?;
    }
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    apply_buffer_sizes(&SockRef::from(&socket), transport)?;

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

/// Wildcard address of the same family as `remote`, on an ephemeral port.
pub fn local_wildcard_for(remote: &SocketAddr) -> SocketAddr {
    match remote {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

/// Dual-stack bind address (`[::]`) for `port`.
pub fn default_bind_address(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port)
}

/// IPv4-only bind address (`0.0.0.0`) for `port`.
pub fn ipv4_bind_address(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
}

fn domain_for(addr: &SocketAddr) -> Domain {
    if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 }
}

fn apply_buffer_sizes(sock_ref: &SockRef<'_>, transport: &TransportConfig) -> std::io::Result<()> {
    if transport.receive_buffer_size > 0 {
        sock_ref.set_recv_buffer_size(transport.receive_buffer_size)?;
    }
    if transport.send_buffer_size > 0 {
        sock_ref.set_send_buffer_size(transport.send_buffer_size)?;
    }
    Ok(())
}

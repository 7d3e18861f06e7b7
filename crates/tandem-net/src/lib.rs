//! Dual-channel game transport: a reliable TCP stream and an unreliable UDP
//! channel bound into one connection by a key check and a token rendezvous.

pub mod buffer;
pub mod client;
pub mod codec;
pub mod config;
mod engine;
pub mod error;
pub mod events;
pub mod framing;
pub mod gate;
pub mod ids;
pub mod peer;
pub mod platform;
pub mod server;
pub mod state;
pub mod status;
pub mod tables;
pub mod traffic;

pub use buffer::{BufferError, BufferPool, FrameBuffer, PREFIX_LEN, PoolStats};
pub use client::Client;
pub use codec::{Decode, Encode};
pub use config::{EngineConfig, MAX_DATAGRAM_PAYLOAD, MAX_STREAM_PAYLOAD, TransportConfig};
pub use error::{NetError, SendError};
pub use events::{ClientHandler, NetEvent, ServerHandler};
pub use framing::FrameError;
pub use gate::{ConnectionGate, GateError};
pub use peer::{PeerId, PeerInfo};
pub use platform::SocketConfig;
pub use server::Server;
pub use state::{ConnectionState, ConnectionStateWatch};
pub use status::{DisconnectReason, StatusCode, Transport};
pub use traffic::{TrafficSnapshot, TransportStats};

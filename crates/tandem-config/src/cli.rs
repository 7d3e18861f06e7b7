//! Command-line arguments for `tandem-node`.

use std::path::PathBuf;

use clap::Parser;

use crate::{Config, Mode};

/// Tandem node command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "tandem", about = "Dual-channel game transport node")]
pub struct CliArgs {
    /// Run as a server or a client.
    #[arg(long, value_enum)]
    pub mode: Option<Mode>,

    /// Address to bind or dial.
    #[arg(long)]
    pub address: Option<String>,

    /// Port to bind or dial.
    #[arg(long)]
    pub port: Option<u16>,

    /// Handshake key.
    #[arg(long)]
    pub key: Option<String>,

    /// Largest payload on both transports, in bytes.
    #[arg(long)]
    pub max_payload: Option<usize>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(mode) = args.mode {
            self.network.mode = mode;
        }
        if let Some(ref address) = args.address {
            self.network.address = address.clone();
        }
        if let Some(port) = args.port {
            self.network.port = port;
        }
        if let Some(ref key) = args.key {
            self.network.key = key.clone();
        }
        if let Some(max) = args.max_payload {
            self.network.stream.max_payload_size = max;
            self.network.datagram.max_payload_size = max;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

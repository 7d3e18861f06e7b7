//! Configuration for tandem nodes.
//!
//! Settings persist to disk as `config.ron` and can be overridden from the
//! command line. [`NetworkConfig::to_engine_config`] turns the plain-unit
//! values into a validated [`tandem_net::EngineConfig`].

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{Config, DebugConfig, Mode, NetworkConfig, TransportSettings};
pub use error::ConfigError;

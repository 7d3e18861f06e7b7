//! Runs a tandem server or client from `config.ron` and CLI flags.
//!
//! `tandem --mode listen` echoes every stream packet back to its sender.
//! `tandem --mode connect --address 10.0.0.2` sends a greeting once connected
//! and logs whatever comes back. Both run until Ctrl-C.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use clap::Parser;
use tandem_config::{CliArgs, Config, Mode, NetworkConfig};
use tandem_net::{
    Client, ClientHandler, ConnectionGate, DisconnectReason, FrameBuffer, NetError, PeerId,
    PeerInfo, Server, ServerHandler, Transport,
};
use tracing::{error, info, warn};

const TICK: Duration = Duration::from_millis(16);

type Outbox = Arc<Mutex<Vec<(PeerId, Vec<u8>)>>>;

/// Admits candidates holding the configured key and queues echoes.
struct Echo {
    key: String,
    outbox: Outbox,
}

impl ServerHandler for Echo {
    fn on_connection_request(&mut self, gate: &ConnectionGate) {
        if let Err(e) = gate.accept_if_key(self.key.clone()) {
            warn!("{e}");
        }
    }

    fn on_connected(&mut self, peer: &PeerInfo) {
        info!("{} joined from {}", peer.id, peer.stream_addr);
    }

    fn on_disconnected(&mut self, peer: &PeerInfo, reason: DisconnectReason, _message: Option<&mut FrameBuffer>) {
        info!("{} left: {reason}", peer.id);
    }

    fn on_packet(&mut self, peer: &PeerInfo, transport: Transport, buffer: &mut FrameBuffer) {
        if transport != Transport::Stream {
            return;
        }
        match buffer.payload() {
            Ok(bytes) => self
                .outbox
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((peer.id, bytes.to_vec())),
            Err(e) => warn!("unreadable packet from {}: {e}", peer.id),
        }
    }

    fn on_error(&mut self, error: &NetError) {
        warn!("{error}");
    }
}

#[derive(Default)]
struct Session {
    connected: bool,
    greeted: bool,
    closed: bool,
}

struct Greeter {
    session: Arc<Mutex<Session>>,
}

impl Greeter {
    fn session(&self) -> std::sync::MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ClientHandler for Greeter {
    fn on_connected(&mut self, id: PeerId) {
        info!("connected as {id}");
        self.session().connected = true;
    }

    fn on_disconnected(&mut self, reason: DisconnectReason, message: Option<&mut FrameBuffer>) {
        match message.map(|m| m.read::<String>()) {
            Some(Ok(text)) => info!("disconnected: {reason} ({text})"),
            _ => info!("disconnected: {reason}"),
        }
        self.session().closed = true;
    }

    fn on_packet(&mut self, transport: Transport, buffer: &mut FrameBuffer) {
        match buffer.read::<String>() {
            Ok(text) => info!("{transport}: {text}"),
            Err(_) => info!("{transport}: {} bytes", buffer.len()),
        }
    }

    fn on_error(&mut self, error: &NetError) {
        error!("{error}");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    let config_dir = match args.config.clone() {
        Some(dir) => dir,
        None => Config::default_dir()?,
    };
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    tandem_log::init_logging(Some(&config_dir.join("logs")), cfg!(debug_assertions), Some(&config));

    match config.network.mode {
        Mode::Listen => run_server(&config.network).await?,
        Mode::Connect => run_client(&config.network).await?,
    }
    Ok(())
}

async fn run_server(network: &NetworkConfig) -> Result<(), Box<dyn std::error::Error>> {
    let ip: IpAddr = network.address.parse()?;
    let server = Server::listen_on(network.to_engine_config(), SocketAddr::new(ip, network.port)).await?;
    info!("listening on {}", server.local_addr());

    let outbox = Outbox::default();
    server.subscribe(Echo {
        key: network.key.clone(),
        outbox: outbox.clone(),
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut tick = tokio::time::interval(TICK);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = &mut ctrl_c => break,
        }
        server.poll();

        let echoes = std::mem::take(&mut *outbox.lock().unwrap_or_else(PoisonError::into_inner));
        for (id, bytes) in echoes {
            let mut buffer = server.create_buffer(Transport::Stream);
            if let Err(e) = buffer.write_bytes(&bytes) {
                warn!("cannot echo to {id}: {e}");
                continue;
            }
            if let Err(e) = server.send(id, buffer, Transport::Stream).await {
                warn!("echo to {id} failed: {e}");
            }
        }
    }

    info!("shutting down");
    server.close_all().await;
    Ok(())
}

async fn run_client(network: &NetworkConfig) -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::connect(
        network.to_engine_config(),
        &network.address,
        network.port,
        &network.key,
    )
    .await?;
    info!("connecting to {}", client.server_addr());

    let session = Arc::new(Mutex::new(Session::default()));
    client.subscribe(Greeter {
        session: session.clone(),
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut tick = tokio::time::interval(TICK);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = &mut ctrl_c => break,
        }
        client.poll();

        let greet = {
            let mut session = session.lock().unwrap_or_else(PoisonError::into_inner);
            if session.closed {
                return Ok(());
            }
            let greet = session.connected && !session.greeted;
            session.greeted |= greet;
            greet
        };
        if greet {
            let mut buffer = client.create_buffer(Transport::Stream);
            buffer.write("hello from tandem")?;
            client.send(buffer, Transport::Stream).await?;
        }
    }

    client.disconnect(None).await;
    Ok(())
}

//! `lanchat` console client.
//!
//! A thin orchestrator over the library: it hosts or joins a single chat,
//! printing lifecycle notifications and relaying stdin lines as messages.
//!
//! # Usage
//!
//! ```text
//! lanchat host --passcode hunter2 [--name Alice]
//! lanchat join --passcode hunter2 [--peer Alice | --address 192.168.1.20:50123]
//! lanchat config [--write]
//! ```
//!
//! The passcode may also come from `LANCHAT_PASSCODE`.  Inside a chat, type
//! `/quit` (or close stdin) to leave.
//!
//! # Flow
//!
//! ```text
//! host:  PeerListener::bind ─► ServiceAdvertiser::advertise ─► accept ─► Connection::inbound
//! join:  PeerBrowser (mDNS) ─► pick peer ─► Connection::outbound (TCP)
//!                                   both ─► chat loop
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use lanchat_core::protocol::MessageKind;
use lanchat_peer::application::browser::{BrowserObserver, PeerBrowser};
use lanchat_peer::application::connection::{Connection, ConnectionError, ConnectionObserver};
use lanchat_peer::infrastructure::discovery::mdns::{MdnsDiscovery, ServiceAdvertiser};
use lanchat_peer::infrastructure::discovery::{DiscoveryError, DiscoveryService, PeerSet};
use lanchat_peer::infrastructure::listener::PeerListener;
use lanchat_peer::infrastructure::storage::config::{self, ChatConfig};
use lanchat_peer::infrastructure::transport::{
    tcp::TcpConnector, PeerEndpoint, TransportParameters,
};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Peer-to-peer chat on the local network.
#[derive(Debug, Parser)]
#[command(name = "lanchat", version, about)]
struct Cli {
    /// Config file to use instead of the platform default.
    #[arg(long, global = true, env = "LANCHAT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Advertise on the local network and wait for a peer to join.
    Host {
        /// Name shown to browsing peers.  Defaults to the configured name,
        /// then the host name.
        #[arg(long)]
        name: Option<String>,

        /// Passcode both peers must share.
        #[arg(long, env = "LANCHAT_PASSCODE")]
        passcode: String,
    },

    /// Find a hosting peer and connect to it.
    Join {
        /// Passcode both peers must share.
        #[arg(long, env = "LANCHAT_PASSCODE")]
        passcode: String,

        /// Display name or instance name of the peer to join.  The first
        /// peer found is used when omitted.
        #[arg(long, conflicts_with = "address")]
        peer: Option<String>,

        /// Connect to this address directly, skipping discovery.
        #[arg(long)]
        address: Option<SocketAddr>,
    },

    /// Print the effective configuration as TOML.
    Config {
        /// Also write it to the config file.
        #[arg(long)]
        write: bool,
    },
}

// ── Observers ─────────────────────────────────────────────────────────────────

/// Connection notifications forwarded to the chat loop.
#[derive(Debug)]
enum ChatEvent {
    Preparing,
    Ready,
    Failed(ConnectionError),
    Cancelled,
    Received(Option<String>, MessageKind),
}

struct ConsoleObserver {
    tx: mpsc::UnboundedSender<ChatEvent>,
}

impl ConsoleObserver {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ChatEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn forward(&self, event: ChatEvent) {
        let _ = self.tx.send(event);
    }
}

impl ConnectionObserver for ConsoleObserver {
    fn connection_preparing(&self) {
        self.forward(ChatEvent::Preparing);
    }
    fn connection_ready(&self) {
        self.forward(ChatEvent::Ready);
    }
    fn connection_failed(&self, error: &ConnectionError) {
        self.forward(ChatEvent::Failed(error.clone()));
    }
    fn connection_canceled(&self) {
        self.forward(ChatEvent::Cancelled);
    }
    fn received(&self, payload: Option<String>, kind: MessageKind) {
        self.forward(ChatEvent::Received(payload, kind));
    }
}

enum BrowseUpdate {
    Peers(PeerSet),
    Error(DiscoveryError),
}

struct BrowseReporter {
    tx: mpsc::UnboundedSender<BrowseUpdate>,
}

impl BrowserObserver for BrowseReporter {
    fn refresh_results(&self, peers: PeerSet) {
        let _ = self.tx.send(BrowseUpdate::Peers(peers));
    }
    fn display_browse_error(&self, error: &DiscoveryError) {
        let _ = self.tx.send(BrowseUpdate::Error(error.clone()));
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => config::load_config_from(path),
        None => config::load_config(),
    }
    .context("loading configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.profile.log_level)),
        )
        .init();

    match cli.command {
        Command::Host { name, passcode } => host(&config, name, &passcode).await,
        Command::Join {
            passcode,
            peer,
            address,
        } => join(&config, &passcode, peer.as_deref(), address).await,
        Command::Config { write } => show_config(&config, cli.config.as_deref(), write),
    }
}

fn show_config(
    config: &ChatConfig,
    path: Option<&std::path::Path>,
    write: bool,
) -> anyhow::Result<()> {
    print!("{}", toml::to_string_pretty(config)?);
    if write {
        match path {
            Some(path) => config::save_config_to(config, path)?,
            None => config::save_config(config)?,
        }
        info!("configuration written");
    }
    Ok(())
}

fn default_display_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "lanchat".to_string())
}

// ── Host ──────────────────────────────────────────────────────────────────────

async fn host(config: &ChatConfig, name: Option<String>, passcode: &str) -> anyhow::Result<()> {
    let display_name = name
        .or_else(|| config.profile.display_name.clone())
        .unwrap_or_else(default_display_name);

    let listener = PeerListener::bind(&config.network, passcode)
        .await
        .context("binding chat listener")?;
    let port = listener.local_addr()?.port();

    let mut advertiser = ServiceAdvertiser::new()?;
    advertiser.advertise(&config.discovery.service_type, &display_name, port)?;
    println!("Hosting as \"{display_name}\" on port {port}. Waiting for a peer...");

    let incoming = tokio::select! {
        incoming = listener.accept() => incoming?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            return Ok(());
        }
    };
    // One chat per session: stop advertising once a peer is in.
    advertiser.stop()?;

    let (observer, events) = ConsoleObserver::new();
    let connection = Connection::inbound(
        incoming,
        Arc::downgrade(&observer) as Weak<dyn ConnectionObserver>,
    );
    chat(connection, events).await
}

// ── Join ──────────────────────────────────────────────────────────────────────

async fn join(
    config: &ChatConfig,
    passcode: &str,
    peer: Option<&str>,
    address: Option<SocketAddr>,
) -> anyhow::Result<()> {
    let endpoint = match address {
        Some(addr) => PeerEndpoint::Address(addr),
        None => find_peer(config, peer).await?,
    };
    println!("Joining {endpoint}...");

    let parameters = TransportParameters::from_config(&config.network, passcode);
    let (observer, events) = ConsoleObserver::new();
    let connection = Connection::outbound(
        endpoint,
        parameters,
        Arc::new(TcpConnector),
        Arc::downgrade(&observer) as Weak<dyn ConnectionObserver>,
    );
    chat(connection, events).await
}

/// Browses until a peer matching `wanted` (or any peer) shows up.
async fn find_peer(config: &ChatConfig, wanted: Option<&str>) -> anyhow::Result<PeerEndpoint> {
    let service_type = &config.discovery.service_type;
    let discovery: Arc<dyn DiscoveryService> = Arc::new(MdnsDiscovery::new()?);
    let (tx, mut updates) = mpsc::unbounded_channel();
    let reporter: Arc<dyn BrowserObserver> = Arc::new(BrowseReporter { tx });

    let browser = PeerBrowser::new(
        discovery,
        service_type.as_str(),
        Arc::downgrade(&reporter),
        Duration::from_millis(config.discovery.restart_delay_ms),
    );
    browser.start();
    println!("Browsing for peers on {service_type}...");

    loop {
        let update = tokio::select! {
            update = updates.recv() => update,
            _ = tokio::signal::ctrl_c() => bail!("interrupted while browsing"),
        };
        match update {
            Some(BrowseUpdate::Peers(peers)) => {
                for record in &peers {
                    println!("  found \"{}\" ({})", record.display_name, record.id);
                }
                let matching = peers.iter().find(|record| {
                    !record.interfaces.is_empty()
                        && wanted.map_or(true, |w| {
                            record.display_name == w || record.id.as_str().starts_with(w)
                        })
                });
                if let Some(record) = matching {
                    browser.cancel();
                    return Ok(PeerEndpoint::from_record(record, service_type));
                }
            }
            Some(BrowseUpdate::Error(e)) => {
                error!("peer browsing failed: {e}");
                return Err(e).context("browsing for peers");
            }
            None => bail!("browsing ended without finding a peer"),
        }
    }
}

// ── Chat loop ─────────────────────────────────────────────────────────────────

async fn chat(
    connection: Connection,
    mut events: mpsc::UnboundedReceiver<ChatEvent>,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ChatEvent::Preparing) => println!("Connecting..."),
                Some(ChatEvent::Ready) => {
                    println!("Connected. Type a message and press Enter; /quit to leave.");
                    connection.send_control(MessageKind::Join)?;
                }
                Some(ChatEvent::Failed(e)) => {
                    connection.cancel();
                    return Err(e).context("connection failed");
                }
                Some(ChatEvent::Received(payload, kind)) => match kind {
                    MessageKind::Message => println!("peer> {}", payload.unwrap_or_default()),
                    MessageKind::Join => println!("* peer joined"),
                    MessageKind::Leave => println!("* peer left"),
                    MessageKind::Cancel => {
                        println!("* peer ended the chat");
                        connection.cancel();
                    }
                },
                Some(ChatEvent::Cancelled) | None => break,
            },
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) if line.trim() == "/quit" => leave(&connection),
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    if let Err(e) = connection.send(&line) {
                        warn!("message not sent: {e}");
                    }
                }
                None => {
                    stdin_open = false;
                    leave(&connection);
                }
            },
            _ = tokio::signal::ctrl_c() => leave(&connection),
        }
    }

    // Let the goodbye frames go out before the runtime shuts down.
    connection.wait_closed().await;
    println!("Chat closed.");
    Ok(())
}

/// Tells the peer we are going, then tears the connection down.  Both
/// signals are written before the stream closes.
fn leave(connection: &Connection) {
    let _ = connection.send_control(MessageKind::Leave);
    let _ = connection.send_control(MessageKind::Cancel);
    connection.cancel();
}

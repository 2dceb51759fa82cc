//! Duotris - Two-player falling blocks over the LAN
//!
//! Pairs two players on a local network and plays a shared-board match between them.

mod config;
mod discovery;
mod game;
mod network;
mod protocol;
mod session;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::Config;
use discovery::{local_subnets, DiscoveredPeer, Scanner};
use game::{Control, Phase, Snapshot};
use network::{Dialer, Listener, Peer, PeerResult, PeerSocket};
use protocol::{Message, MessageKind};
use session::{ChatLine, Lobby, Match};

/// How often interactive loops poll connection and scan state
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Duotris - Two-player falling blocks over the LAN
#[derive(Parser)]
#[command(name = "duotris")]
#[command(author = "Duotris Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Find a partner on the local network and play together", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Name to introduce yourself with
    #[arg(short, long, global = true)]
    name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait for a partner and print their chat
    Listen {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Connect to a partner and chat from stdin
    Connect {
        /// Partner address, with or without port
        address: String,

        /// Partner port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Scan the local subnets for listening players
    Scan {
        /// Port to probe
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Lobby with chat, scanning and a bot-played match once both sides are ready
    Lobby,

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Write the generated (or, without --generate, the current) config here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show system information
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };
    if let Some(name) = cli.name {
        config.general.name = name;
    }

    // Initialize logging
    let level = if cli.verbose || config.general.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Listen { port } => {
            let port = port.unwrap_or(config.network.port);
            run_listen(&config, port).await?;
        }
        Commands::Connect { address, port } => {
            let target = parse_target(&address, port.unwrap_or(config.network.port))?;
            run_connect(&config, target).await?;
        }
        Commands::Scan { port } => {
            let port = port.unwrap_or(config.network.port);
            run_scan(&config, port).await?;
        }
        Commands::Lobby => {
            run_lobby(&config).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else if let Some(path) = output {
                config.save(&path)?;
                println!("Configuration saved to: {}", path.display());
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_system_info(&config);
        }
    }

    Ok(())
}

/// `host` or `host:port`
fn parse_target(address: &str, default_port: u16) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let ip: IpAddr = address
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid address: {}", address))?;
    Ok(SocketAddr::new(ip, default_port))
}

/// Print chat arriving at `peer` and acknowledge it
fn print_incoming_chat(peer: &Peer) -> PeerResult<()> {
    let weak = peer.downgrade();
    peer.enroll(MessageKind::Chat, move |message: Message| {
        let from = weak
            .upgrade()
            .and_then(|peer| peer.peer_name())
            .unwrap_or_else(|| "?".to_string());
        match message.body_as::<String>() {
            Ok(text) => println!("{}: {}", from, text),
            Err(e) => tracing::warn!("Unreadable chat from {}: {}", from, e),
        }
        std::future::ready(Message::empty(MessageKind::ChatReply))
    })
}

/// Run a bare listener that prints whatever the partner says
async fn run_listen(config: &Config, port: u16) -> anyhow::Result<()> {
    let peer = Peer::new(config.general.name.clone());
    print_incoming_chat(&peer)?;
    peer.on_disconnected(|| println!("- Partner disconnected"));

    let listener = Listener::new(peer);
    listener.start(config.network.bind_address, port);

    println!("\n========================================");
    println!("  Duotris Listening");
    println!("========================================");
    println!("  Name: {}", config.general.name);
    println!("  Port: {}", port);
    println!("========================================");
    println!("\nWaiting for a partner...");
    println!("Press Ctrl+C to stop.\n");

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let mut partner: Option<String> = None;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let current = listener.peer_name();
                if current != partner {
                    if let Some(name) = &current {
                        let from = listener.peer().remote_addr().map(|addr| addr.to_string()).unwrap_or_default();
                        println!("+ Partner connected: {} ({})", name, from);
                    }
                    partner = current;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    listener.kill();
    Ok(())
}

/// Dial a partner and send each stdin line as chat
async fn run_connect(config: &Config, target: SocketAddr) -> anyhow::Result<()> {
    let peer = Peer::new(config.general.name.clone());
    print_incoming_chat(&peer)?;

    let dialer = Dialer::new(peer, config.network_settings().connect_timeout());
    println!("Connecting to {}...", target);
    dialer.start(target.ip(), target.port());

    let partner = loop {
        tokio::time::sleep(POLL_INTERVAL / 10).await;
        if let Some(name) = dialer.peer_name() {
            break name;
        }
        if !dialer.is_connecting() && !dialer.is_connected() {
            anyhow::bail!("Could not connect to {}", target);
        }
    };

    println!("\n========================================");
    println!("  Duotris Connected");
    println!("========================================");
    println!("  Local: {}", config.general.name);
    println!("  Partner: {} ({})", partner, target);
    println!("========================================");
    println!("\nType to chat. Press Ctrl+D or Ctrl+C to disconnect.\n");

    let deadline = config.network_settings().request_timeout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let message = Message::with_body(MessageKind::Chat, &line)?;
                let sent = match deadline {
                    Some(deadline) => dialer.peer().request_timeout(message, MessageKind::ChatReply, deadline).await,
                    None => dialer.peer().request(message, MessageKind::ChatReply).await,
                };
                if let Err(e) = sent {
                    println!("Disconnected: {}", e);
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                break;
            }
        }
    }

    dialer.kill();
    Ok(())
}

/// Sweep the local subnets once and list who answered
async fn run_scan(config: &Config, port: u16) -> anyhow::Result<()> {
    let scanner = Scanner::new(config.general.name.clone(), config.scan_settings());
    println!("Scanning local subnets on port {}...\n", port);
    scanner.scan(port);

    let found = loop {
        tokio::time::sleep(POLL_INTERVAL).await;
        if let Some(found) = scanner.results() {
            break found;
        }
    };

    print_peers(&found);
    Ok(())
}

fn print_peers(peers: &[DiscoveredPeer]) {
    if peers.is_empty() {
        println!("No players found.");
        return;
    }
    println!("Found {} player(s):", peers.len());
    for peer in peers {
        println!("  {:<20} {}", peer.name, peer.socket_addr());
    }
}

/// Chat lines in `new` that were not already in `old`.
///
/// The log is bounded, so old lines may have scrolled out of `new`.
fn fresh_lines<'a>(old: &[ChatLine], new: &'a [ChatLine]) -> &'a [ChatLine] {
    let max_overlap = old.len().min(new.len());
    let overlap = (0..=max_overlap)
        .rev()
        .find(|&k| old[old.len() - k..] == new[..k])
        .unwrap_or(0);
    &new[overlap..]
}

async fn run_lobby(config: &Config) -> anyhow::Result<()> {
    let mut lobby = Lobby::new(config.general.name.clone(), config.session_settings());
    lobby.start();

    println!("\n========================================");
    println!("  Duotris Lobby");
    println!("========================================");
    println!("  Name: {}", lobby.name());
    println!("  Port: {}", config.network.port);
    println!("========================================");
    println!("\nCommands: /scan, /connect <address>, /ready, anything else is chat.");
    println!("Press Ctrl+C to leave.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let mut shown_chat: Vec<ChatLine> = Vec::new();
    let mut partner: Option<String> = None;
    let mut scanning = false;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { return Ok(()) };
                lobby_command(&mut lobby, config, line.trim(), &mut scanning).await;
            }
            _ = ticker.tick() => {
                lobby.check_connection();

                let current = lobby.peer_name();
                if current != partner {
                    match &current {
                        Some(name) => println!("+ Paired with {}", name),
                        None => println!("- Partner gone"),
                    }
                    partner = current;
                }

                let chat = lobby.chat_log();
                for line in fresh_lines(&shown_chat, &chat) {
                    if !line.own {
                        println!("{}: {}", line.from, line.text);
                    }
                }
                shown_chat = chat;

                if scanning && !lobby.is_scanning() {
                    scanning = false;
                    print_peers(&lobby.servers().unwrap_or_default());
                }

                if lobby.both_ready() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nLeaving lobby...");
                return Ok(());
            }
        }
    }

    println!("Both players ready, starting the match.");
    let game = lobby.into_match()?;
    play_match(game, config.game.frame_interval()).await
}

async fn lobby_command(lobby: &mut Lobby, config: &Config, line: &str, scanning: &mut bool) {
    if line.is_empty() {
        return;
    }

    if line == "/scan" {
        println!("Scanning...");
        lobby.scan();
        *scanning = true;
    } else if let Some(address) = line.strip_prefix("/connect ") {
        match parse_target(address.trim(), config.network.port) {
            Ok(target) => {
                println!("Connecting to {}...", target);
                lobby.connect(target);
            }
            Err(e) => println!("{}", e),
        }
    } else if line == "/ready" {
        match lobby.toggle_ready(None).await {
            Ok(true) => println!("You are ready."),
            Ok(false) => println!("You are no longer ready."),
            Err(e) => println!("Cannot change readiness: {}", e),
        }
    } else if let Err(e) = lobby.send_chat(line).await {
        println!("Chat not delivered: {}", e);
    }
}

/// Pick a bot move: mostly nothing, sometimes a nudge or a rotation
fn bot_move(rng: &mut StdRng) -> Option<Control> {
    match rng.random_range(0..33) {
        30 => Some(Control::Rotate),
        31 => Some(Control::MoveLeft),
        32 => Some(Control::MoveRight),
        _ => None,
    }
}

/// Play a match headless, letting a bot steer the local piece
async fn play_match(mut game: Match, frame: Duration) -> anyhow::Result<()> {
    println!(
        "Playing as {} ({}) against {}",
        game.local_name(),
        if game.is_host() { "host" } else { "guest" },
        game.opponent()
    );

    game.start().await?;
    let mut rng = StdRng::from_rng(&mut rand::rng());
    let mut ticker = tokio::time::interval(frame);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !game.is_connected() {
                    println!("Partner disconnected.");
                    break;
                }
                game.update().await?;
                if game.phase() == Phase::Ended {
                    break;
                }
                if let Some(control) = bot_move(&mut rng) {
                    game.control(control).await?;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nLeaving match...");
                break;
            }
        }
    }

    let snapshot = game.snapshot();
    println!("{}", render_board(&snapshot));
    println!("Game over. Score: {}", snapshot.score);
    Ok(())
}

/// Text rendering of a snapshot's board
fn render_board(snapshot: &Snapshot) -> String {
    let mut out = String::new();
    for row in &snapshot.map {
        out.push('|');
        for &cell in row {
            out.push(if cell == 0 { ' ' } else { char::from(b'0' + cell) });
        }
        out.push_str("|\n");
    }
    let width = snapshot.map.first().map_or(0, Vec::len);
    out.push('+');
    out.push_str(&"-".repeat(width));
    out.push('+');
    out
}

/// Print system information
fn print_system_info(config: &Config) {
    println!("Duotris System Information");
    println!("==========================\n");

    println!("Name: {}", config.general.name);
    println!("Protocol Version: {}", protocol::PROTOCOL_VERSION);
    println!("Default Port: {}", protocol::DEFAULT_PORT);

    let subnets = local_subnets();
    if subnets.is_empty() {
        println!("\nNo scannable subnets found.");
    } else {
        println!("\nScannable subnets:");
        for subnet in subnets {
            println!(
                "  {}/{} ({} hosts)",
                subnet.network(),
                subnet.prefix_len(),
                subnet.host_count()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(from: &str, text: &str) -> ChatLine {
        ChatLine {
            from: from.to_string(),
            text: text.to_string(),
            own: false,
        }
    }

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["duotris", "info"]);
        assert!(cli.is_ok());

        let cli = Cli::try_parse_from(["duotris", "--name", "kim", "connect", "10.0.0.2"]).unwrap();
        assert_eq!(cli.name.as_deref(), Some("kim"));
        assert!(matches!(cli.command, Commands::Connect { port: None, .. }));
    }

    #[test]
    fn test_parse_target() {
        assert_eq!(
            parse_target("10.0.0.2", 4321).unwrap(),
            "10.0.0.2:4321".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_target("10.0.0.2:9000", 4321).unwrap(),
            "10.0.0.2:9000".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_target("not-an-address", 4321).is_err());
    }

    #[test]
    fn test_fresh_lines() {
        let old = vec![line("a", "1"), line("b", "2")];
        let grown = vec![line("a", "1"), line("b", "2"), line("a", "3")];
        assert_eq!(fresh_lines(&old, &grown), &grown[2..]);

        // The oldest line scrolled out of a full log.
        let scrolled = vec![line("b", "2"), line("a", "3")];
        assert_eq!(fresh_lines(&old, &scrolled), &scrolled[1..]);

        assert!(fresh_lines(&grown, &grown).is_empty());
        assert_eq!(fresh_lines(&[], &old), &old[..]);
    }

    #[test]
    fn test_render_board() {
        let snapshot = Snapshot {
            map: vec![vec![0, 3], vec![7, 0]],
            ..Default::default()
        };
        assert_eq!(render_board(&snapshot), "| 3|\n|7 |\n+--+");
    }
}

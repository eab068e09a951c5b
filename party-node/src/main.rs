// party: join a LAN namespace and chat, send files and watch peers from the terminal.

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use party_node::identity_store::default_display_name;
use party_node::{config, Event, IdentityStore, Node, PeerIdentity, ResourceKind, TransferResult};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "party", version, about = "Peer-to-peer LAN sessions")]
struct Cli {
    /// Config file (default: platform config dir, then PARTY_* env overrides)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// More logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print this device's persistent identity
    Identity,
    /// Join the namespace and chat with whoever is there
    Run {
        /// Name shown to other peers
        #[arg(short, long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let cfg = config::load(cli.config.as_deref()).context("loading config")?;
    match cli.command {
        Command::Identity => {
            let store = IdentityStore::from_config(cfg.storage.identity_dir.as_deref())?;
            let local = store.get_or_create_identity(&default_display_name())?;
            println!("{}", local.peer_id());
            println!("name: {}", local.display_name());
            println!("stored at {}", store.path().display());
        }
        Command::Run { name } => run(cfg, name).await?,
    }
    Ok(())
}

async fn run(cfg: party_node::Config, name: Option<String>) -> anyhow::Result<()> {
    let node: Node<String> = Node::new(cfg)?;
    let name = name.unwrap_or_else(|| node.local_identity().display_name);
    let events = node.subscribe();
    let printer = tokio::spawn(print_events(events));

    node.connect_as(&name).await;
    println!(
        "joined {:?} as {} ({}); /peers, /send <peer> <path> [image], /quit",
        node.config().namespace,
        name,
        node.local_identity().id.short()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if let Err(e) = handle_line(&node, line.trim()) {
                    eprintln!("{:#}", e);
                }
                if line.trim() == "/quit" {
                    break;
                }
            }
            res = shutdown_signal() => {
                res?;
                break;
            }
        }
    }

    node.disconnect().await;
    printer.abort();
    Ok(())
}

fn handle_line(node: &Node<String>, line: &str) -> anyhow::Result<()> {
    let mut words = line.split_whitespace();
    match words.next() {
        None | Some("/quit") => {}
        Some("/peers") => {
            let connected = node.connected_peers();
            for found in node.discovered_peers() {
                let mark = if connected.contains(&found.identity) { "*" } else { " " };
                println!("{} {} at {}", mark, found.identity, found.addr);
            }
        }
        Some("/send") => {
            let prefix = words
                .next()
                .ok_or_else(|| anyhow!("usage: /send <peer> <path> [image]"))?;
            let path = PathBuf::from(words.next().ok_or_else(|| anyhow!("missing path"))?);
            let kind = match words.next() {
                Some("image") => ResourceKind::Image,
                None => ResourceKind::Binary,
                Some(other) => bail!("unknown kind {:?}", other),
            };
            let peer = find_peer(node, prefix)?;
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("resource")
                .to_string();
            let id = node.send_resource(&peer.id, &path, &file_name, kind)?;
            println!("sending {} to {} as {}", path.display(), peer, id);
        }
        Some(cmd) if cmd.starts_with('/') => bail!("unknown command {}", cmd),
        Some(_) => {
            let results = node.send_to_all(&line.to_string());
            if results.is_empty() {
                println!("(nobody connected)");
            }
            for (peer, result) in results {
                if let Err(e) = result {
                    eprintln!("not sent to {}: {}", peer, e);
                }
            }
        }
    }
    Ok(())
}

fn find_peer(node: &Node<String>, prefix: &str) -> anyhow::Result<PeerIdentity> {
    let matches: Vec<PeerIdentity> = node
        .connected_peers()
        .into_iter()
        .filter(|p| p.id.to_string().starts_with(prefix) || p.display_name == prefix)
        .collect();
    match matches.len() {
        1 => Ok(matches[0].clone()),
        0 => bail!("no connected peer matches {:?}", prefix),
        n => bail!("{} peers match {:?}", n, prefix),
    }
}

async fn print_events(mut events: broadcast::Receiver<Event<String>>) {
    loop {
        let event = match events.recv().await {
            Ok(e) => e,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                eprintln!("(missed {} events)", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        match event {
            Event::PeerFound { peer, name } => {
                println!("found {} {}", peer, name.unwrap_or_default())
            }
            Event::PeerLost { peer } => println!("lost {}", peer),
            Event::PeerConnected { peer } => println!("connected {}", peer),
            Event::PeerDisconnected { peer } => println!("disconnected {}", peer),
            Event::PeerConnectionFailed { peer, error } => {
                println!("could not connect {}: {}", peer, error)
            }
            Event::MessageReceived { peer, message, .. } => {
                println!("<{}> {}", peer.display_name, message)
            }
            Event::TransferStarted {
                peer,
                name,
                direction,
                total_bytes,
                ..
            } => println!("{:?} {} ({} bytes) with {}", direction, name, total_bytes, peer),
            Event::TransferProgress { .. } => {}
            Event::TransferCompleted { peer, result, .. } => match result {
                TransferResult::Sent { name, len } => {
                    println!("sent {} ({} bytes) to {}", name, len, peer)
                }
                TransferResult::Received(r) => {
                    let dims = r
                        .image
                        .map(|i| format!(" {}x{}", i.width, i.height))
                        .unwrap_or_default();
                    println!(
                        "received {}{} from {} -> {}",
                        r.name,
                        dims,
                        peer,
                        r.path.display()
                    )
                }
            },
            Event::TransferFailed {
                peer,
                transfer_id,
                error,
            } => {
                println!("transfer {} with {} failed: {}", transfer_id, peer, error)
            }
            Event::StreamReceived { peer, name, stream } => {
                println!("stream {:?} from {}", name, peer);
                tokio::spawn(async move {
                    let bytes = stream.read_to_end().await;
                    println!("stream {:?} ended after {} bytes", name, bytes.len());
                });
            }
            other => println!("{}: {:?}", other.kind(), other),
        }
    }
}

/// Resolves on Ctrl+C, or SIGTERM on Unix.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

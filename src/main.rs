use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use nostr::nips::nip19::ToBech32;
use peerdrop::config::get_config_path;
use peerdrop::webrtc::generate_name;
use peerdrop::{
    ensure_keys_at, get_nsec_path, AcceptAll, Config, FileMetadata, NostrRelay, OutgoingFile,
    Peer, PresenceDirectory, PresenceObserver, ReceivePrompt, RelaySettings, RtcConnector,
    TransferEvent, TransferOrchestrator, TransferSettings,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Parser)]
#[command(name = "peerdrop")]
#[command(about = "Drop files directly onto peers that are online", long_about = None)]
struct Cli {
    /// Config file (default: ~/.peerdrop/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Name announced to other peers
    #[arg(long, global = true)]
    name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Go online and receive files
    Online {
        /// Accept every incoming file without asking
        #[arg(long, short)]
        yes: bool,
        /// Save received files here
        #[arg(long)]
        download_dir: Option<PathBuf>,
    },
    /// List peers that are online
    Peers {
        /// Seconds to collect presence before printing
        #[arg(long, default_value = "3")]
        wait: u64,
    },
    /// Send files to an online peer
    Send {
        /// Name of the receiving peer
        peer: String,
        /// Files to send
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Seconds to wait for the peer to appear
        #[arg(long, default_value = "15")]
        wait: u64,
    },
    /// Write the default config file
    InitConfig,
}

/// Prints membership changes as they happen
struct ConsoleObserver;

impl PresenceObserver for ConsoleObserver {
    fn on_join(&self, joined: &[Peer]) {
        for peer in joined {
            println!("+ {} is online", peer.name);
        }
    }

    fn on_leave(&self, left: &[Peer]) {
        for peer in left {
            println!("- {} went offline", peer.name);
        }
    }
}

/// Asks on the terminal before keeping a file
struct ConsolePrompt {
    lines: Mutex<Lines<BufReader<Stdin>>>,
}

impl ConsolePrompt {
    fn new() -> Self {
        Self {
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }
}

#[async_trait]
impl ReceivePrompt for ConsolePrompt {
    async fn confirm(&self, from: Option<&Peer>, metadata: &FileMetadata) -> bool {
        let mut lines = self.lines.lock().await;
        let sender = from.map(|p| p.name.as_str()).unwrap_or("unknown peer");
        let question = format!(
            "{} wants to send {} ({} bytes, {}). Accept? [y/N] ",
            sender,
            metadata.name,
            metadata.size,
            metadata.content_type()
        );
        let mut stdout = tokio::io::stdout();
        if stdout.write_all(question.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
            return false;
        }
        match lines.next_line().await {
            Ok(Some(answer)) => matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"),
            _ => false,
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = Config::load_from(path)?;
            config.apply_env(|key| std::env::var(key).ok());
            config
        }
        None => Config::load()?,
    };
    if let Some(name) = &cli.name {
        config.identity.name = Some(name.clone());
    }
    Ok(config)
}

fn build(
    config: &Config,
    prompt: Arc<dyn ReceivePrompt>,
    observer: Option<Arc<dyn PresenceObserver>>,
) -> Result<TransferOrchestrator> {
    let (keys, was_generated) = ensure_keys_at(&get_nsec_path())?;
    if was_generated {
        let npub = keys
            .public_key()
            .to_bech32()
            .context("Failed to encode npub")?;
        println!("Generated relay identity {}", npub);
    }

    let name = config.identity.name.clone().unwrap_or_else(generate_name);
    let local = Peer::new(name);

    let relay = Arc::new(NostrRelay::new(keys, RelaySettings::from_config(config)));
    let mut presence =
        PresenceDirectory::new(&config.signaling.scope, relay.clone(), config.retry.clone());
    if let Some(observer) = observer {
        presence = presence.with_observer(observer);
    }
    let connector = Arc::new(RtcConnector::new(config.webrtc.stun_servers.clone()));

    Ok(TransferOrchestrator::new(
        local,
        presence,
        relay,
        connector,
        TransferSettings::from_config(config),
        prompt,
    ))
}

async fn wait_for_peer(
    orchestrator: &TransferOrchestrator,
    name: &str,
    wait: Duration,
) -> Option<Peer> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if let Some(peer) = orchestrator.find_peer(name).await {
            return Some(peer);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("peerdrop=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::InitConfig => {
            let path = cli.config.clone().unwrap_or_else(get_config_path);
            if path.exists() {
                bail!("Config already exists at {}", path.display());
            }
            Config::default().save_to(&path)?;
            println!("Wrote {}", path.display());
        }
        Commands::Online { yes, download_dir } => {
            let mut config = load_config(&cli)?;
            if let Some(dir) = download_dir {
                config.transfer.download_dir = dir.to_string_lossy().to_string();
            }
            let prompt: Arc<dyn ReceivePrompt> = if *yes || config.transfer.auto_accept {
                Arc::new(AcceptAll)
            } else {
                Arc::new(ConsolePrompt::new())
            };

            let orchestrator = build(&config, prompt, Some(Arc::new(ConsoleObserver)))?;
            let mut events = orchestrator.subscribe();
            orchestrator.connect().await?;

            println!("Online as {}", orchestrator.local().name);
            println!("Saving files to {}", config.download_dir().display());
            println!("Press Ctrl+C to go offline");

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(TransferEvent::Received { metadata, path, .. }) => {
                            println!("Received {} -> {}", metadata.name, path.display());
                        }
                        Ok(TransferEvent::Declined { metadata, .. }) => {
                            println!("Declined {}", metadata.name);
                        }
                        Ok(TransferEvent::Rejected { reason, .. }) => {
                            println!("Rejected incoming file: {}", reason);
                        }
                        Ok(TransferEvent::SessionFailed { peer, error }) => {
                            let who = peer.map(|p| p.name).unwrap_or_else(|| "peer".to_string());
                            println!("Connection with {} failed: {}", who, error);
                        }
                        Err(e) => debug!("Transfer events: {}", e),
                    },
                }
            }

            orchestrator.disconnect().await;
        }
        Commands::Peers { wait } => {
            let config = load_config(&cli)?;
            let orchestrator = build(&config, Arc::new(AcceptAll), None)?;
            orchestrator.connect().await?;
            tokio::time::sleep(Duration::from_secs(*wait)).await;

            let peers = orchestrator.peers().await;
            if peers.is_empty() {
                println!("No peers online");
            }
            for peer in peers {
                println!("{}  (online since {})", peer.name, peer.online_since);
            }
            orchestrator.disconnect().await;
        }
        Commands::Send { peer, files, wait } => {
            let config = load_config(&cli)?;
            let orchestrator = build(&config, Arc::new(AcceptAll), None)?;
            orchestrator.connect().await?;

            let Some(target) = wait_for_peer(&orchestrator, peer, Duration::from_secs(*wait)).await
            else {
                orchestrator.disconnect().await;
                bail!("{} is not online", peer);
            };

            let outgoing: Vec<OutgoingFile> =
                files.iter().map(|f| OutgoingFile::from_path(f.clone())).collect();
            let result = orchestrator.send_files(&target, &outgoing).await;
            orchestrator.disconnect().await;

            let report = result?;
            for name in &report.sent {
                println!("Sent {}", name);
            }
            for (name, error) in &report.failed {
                println!("Failed {}: {}", name, error);
            }
            if !report.is_complete() {
                bail!("{} of {} file(s) failed", report.failed.len(), outgoing.len());
            }
        }
    }

    Ok(())
}

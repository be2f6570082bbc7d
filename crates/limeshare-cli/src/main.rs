use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use limeshare_swarm::{SwarmConfig, TransferEvent, TransferOrchestrator, TransferStage, WsTransport};
use limeshare_types::ShareLink;

#[derive(Parser)]
#[command(name = "limeshare")]
#[command(about = "Share files through a relay room and a swarm of peers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Seed a file and print its share link
    Share {
        /// File to share
        path: PathBuf,
    },
    /// Download the file behind a share link
    Receive {
        /// zkv:// share link
        link: String,
        /// Where to write the file (defaults to the name in the link)
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "limeshare=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    // Config
    let config = SwarmConfig::from_env().context("reading LIMESHARE_* settings")?;
    info!(relay = %config.relay_url, keystream = %config.keystream_url, "limeshare starting");

    let mut orchestrator = TransferOrchestrator::new(WsTransport::new(config.clone()), config);
    let result = match cli.command {
        Command::Share { path } => share(&mut orchestrator, &path).await,
        Command::Receive { link, out } => receive(&mut orchestrator, &link, out).await,
    };
    orchestrator.close_all().await;
    result
}

async fn share(orchestrator: &mut TransferOrchestrator, path: &Path) -> anyhow::Result<()> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("file path has no usable name")?
        .to_string();

    let mut session = orchestrator
        .share(name, Bytes::from(data))
        .await
        .context("starting share")?;
    println!("{}", session.link);
    info!(session = %session.id, "seeding, press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("stopping");
                return Ok(());
            }
            event = session.events.recv() => match event {
                Some(TransferEvent::Failed(e)) => return Err(e).context("share failed"),
                Some(event) => log_event(&event),
                None => return Ok(()),
            }
        }
    }
}

async fn receive(orchestrator: &mut TransferOrchestrator, link: &str, out: Option<PathBuf>) -> anyhow::Result<()> {
    let parsed: ShareLink = link.parse().context("parsing share link")?;
    let out = match out {
        Some(path) => path,
        // Never let a link name escape the working directory.
        None => Path::new(&parsed.file_name)
            .file_name()
            .map(PathBuf::from)
            .context("share link has no usable file name")?,
    };

    let mut session = orchestrator.receive(link).await.context("joining swarm")?;
    let done = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => bail!("interrupted"),
            event = session.events.recv() => match event {
                Some(TransferEvent::Completed(done)) => break done,
                Some(TransferEvent::Failed(e)) => return Err(e).context("receive failed"),
                Some(event) => log_event(&event),
                None => bail!("session ended before the file arrived"),
            }
        }
    };

    tokio::fs::write(&out, &done.data)
        .await
        .with_context(|| format!("writing {}", out.display()))?;
    info!(
        path = %out.display(),
        bytes = done.data.len(),
        relay_chunks = done.sources.relay,
        peer_chunks = done.sources.peer,
        "file saved"
    );
    Ok(())
}

fn log_event(event: &TransferEvent) {
    match event {
        TransferEvent::Progress(p) if p.stage == TransferStage::Transferring => {
            info!(percent = p.percent, relay = p.sources.relay, peer = p.sources.peer, "transferring");
        }
        TransferEvent::Progress(p) => info!(stage = ?p.stage, "progress"),
        TransferEvent::PeerConnected(peer) => info!(%peer, "peer connected"),
        TransferEvent::PeerDisconnected(peer) => info!(%peer, "peer disconnected"),
        TransferEvent::Swarm { seeders, leechers } => info!(seeders, leechers, "swarm"),
        TransferEvent::SenderOffline => warn!("nobody is sharing this file yet, waiting"),
        TransferEvent::Completed(done) => info!(name = %done.name, "complete"),
        TransferEvent::Failed(e) => warn!("{}", e),
    }
}

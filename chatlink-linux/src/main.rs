// Chatlink Linux daemon: CLI, logging, config, then the console loop until quit or signal.

use std::path::PathBuf;

use chatlink_core::Framing;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chatlink_linux::session::{SessionController, SessionSettings};
use chatlink_linux::store::FileStore;
use chatlink_linux::transport::TcpTransport;
use chatlink_linux::{config, console};

/// Peer-to-peer chat and file relay.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Config file (default: ~/.config/chatlink/config.toml, then /etc/chatlink/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listener TCP port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Display name announced to peers.
    #[arg(long)]
    name: Option<String>,

    /// Directory for received files.
    #[arg(long)]
    download_dir: Option<PathBuf>,

    /// legacy | length-prefixed
    #[arg(long)]
    framing: Option<Framing>,

    /// Peer to dial on startup (host:port). Repeatable.
    #[arg(long)]
    connect: Vec<String>,

    /// Do not listen for inbound peers.
    #[arg(long)]
    client: bool,

    /// Verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut cfg = config::load(args.config.as_deref());
    if let Some(p) = args.port {
        cfg.listen_port = p;
    }
    if let Some(n) = args.name {
        cfg.display_name = n;
    }
    if let Some(d) = args.download_dir {
        cfg.download_dir = d;
    }
    if let Some(f) = args.framing {
        cfg.framing = f;
    }
    if args.client {
        cfg.server = false;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
        let store = FileStore::new(cfg.download_dir.clone());
        info!(
            name = %cfg.display_name,
            bind = %cfg.bind_addr(),
            framing = ?cfg.framing,
            downloads = %store.dir().display(),
            "chatlink starting"
        );
        let controller = SessionController::new(
            TcpTransport::new(cfg.bind_addr(), cfg.display_name.clone()),
            store,
            SessionSettings {
                display_name: cfg.display_name.clone(),
                worker: cfg.worker_settings(),
            },
            events_tx,
        );

        tokio::spawn(console::print_events(events_rx));
        if cfg.server {
            controller.start().await;
        } else {
            controller.set_server(false).await;
        }
        for target in &args.connect {
            controller.connect_to(target).await;
        }

        tokio::select! {
            r = console::run(controller.clone()) => r?,
            r = shutdown_signal() => r?,
        }
        controller.stop().await;
        anyhow::Ok(())
    })?;
    Ok(())
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn,chatlink_linux=info,chatlink_core=info",
        1 => "info,chatlink_linux=debug,chatlink_core=debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

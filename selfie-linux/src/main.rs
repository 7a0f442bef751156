// SelfieShare for Linux: LAN discovery, encrypted peer links, console front end.

mod config;
mod console;
mod discovery;
mod link;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use selfie_core::{
    LocalIdentity, PeerSessionManager, Payload, ReceivedPayload, SessionEvent, SessionEvents,
    SessionHandle,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use crate::console::{ConsoleCommand, ImageSink};
use crate::transport::LanTransport;

#[derive(Parser, Debug)]
#[command(name = "selfie-linux", version)]
#[command(about = "Share selfies and messages with nearby peers")]
struct Args {
    /// Start advertising right away
    #[arg(long)]
    host: bool,

    /// Start browsing right away
    #[arg(long)]
    join: bool,

    /// Accept every invitation without asking
    #[arg(long)]
    auto_accept: bool,

    /// Display name (overrides config and SELFIE_DISPLAY_NAME)
    #[arg(long)]
    name: Option<String>,

    /// Directory received images are written to
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "debug,selfie_linux=debug,selfie_core=debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = config::load()?;
    if let Some(name) = args.name.clone() {
        cfg.session.display_name = name;
    }
    let local = Arc::new(LocalIdentity::generate(&cfg.session.display_name));
    info!(identity = %local.peer(), "starting selfie-linux");

    let (transport, transport_events) = LanTransport::bind(local.clone(), &cfg).await?;
    let (handle, events) = PeerSessionManager::spawn(
        local,
        cfg.session.clone(),
        Arc::new(transport),
        transport_events,
    )?;

    if args.host {
        handle.start_hosting()?;
    }
    if args.join {
        handle.join_session()?;
    }

    let sink = ImageSink::new(args.out_dir.clone());
    let event_task = tokio::spawn(render_events(events, handle.clone(), sink, args.auto_accept));

    tokio::select! {
        r = read_commands(handle.clone()) => r?,
        r = shutdown_signal() => r?,
    }
    info!("shutting down");
    if let Err(e) = handle.shutdown().await {
        debug!(error = %e, "session manager already stopped");
    }
    event_task.abort();
    Ok(())
}

async fn read_commands(handle: SessionHandle) -> Result<()> {
    println!("{}", console::HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match console::parse_line(&line) {
            Ok(None) => {}
            Ok(Some(ConsoleCommand::Quit)) => break,
            Ok(Some(cmd)) => {
                if let Err(e) = run_command(&handle, cmd).await {
                    println!("{e}");
                }
            }
            Err(e) => println!("{e}"),
        }
    }
    Ok(())
}

async fn run_command(handle: &SessionHandle, cmd: ConsoleCommand) -> Result<()> {
    match cmd {
        ConsoleCommand::Peers => {
            let peers = handle.discovered_peers().await?;
            if peers.is_empty() {
                println!("no peers discovered (join first?)");
            }
            for p in peers {
                println!("  {p}");
            }
        }
        ConsoleCommand::List => {
            println!("you are {}", handle.local_identity());
            for p in handle.roster().await? {
                println!("  {} {}", p.identity, console::state_label(p.state));
            }
        }
        ConsoleCommand::Invite { peer, message } => {
            handle.invite(peer, message.map(String::into_bytes))?;
        }
        ConsoleCommand::Accept(id) => decide(handle, &id, true).await?,
        ConsoleCommand::Decline(id) => decide(handle, &id, false).await?,
        ConsoleCommand::Send(path) => {
            let bytes = tokio::fs::read(&path).await?;
            let payload = console::payload_from_file(bytes).map_err(anyhow::Error::msg)?;
            handle.broadcast_data(payload)?;
        }
        ConsoleCommand::Say(text) => handle.broadcast_data(Payload::text(text))?,
        ConsoleCommand::Forget(peer) => handle.forget_peer(peer)?,
        ConsoleCommand::Host => handle.start_hosting()?,
        ConsoleCommand::Join => handle.join_session()?,
        ConsoleCommand::Leave => handle.leave_session()?,
        ConsoleCommand::Help => println!("{}", console::HELP),
        ConsoleCommand::Quit => {}
    }
    Ok(())
}

async fn decide(handle: &SessionHandle, prefix: &str, accept: bool) -> Result<()> {
    match handle.find_invitation(prefix).await? {
        Some(id) => handle.decide(id, accept)?,
        None => println!("no single pending invitation matches {prefix:?}"),
    }
    Ok(())
}

async fn render_events(
    mut events: SessionEvents,
    handle: SessionHandle,
    mut sink: ImageSink,
    auto_accept: bool,
) {
    while let Some(event) = events.recv().await {
        if let Some(line) = console::render(&event) {
            println!("{line}");
        }
        match event {
            SessionEvent::InvitationReceived(req) if auto_accept => {
                info!(from = %req.from, "auto-accepting invitation");
                if handle.decide(req.id, true).is_err() {
                    break;
                }
            }
            SessionEvent::DataReceived {
                from,
                payload: ReceivedPayload::Image { format, bytes },
            } => {
                let path = sink.next_path(format.extension());
                match tokio::fs::write(&path, &bytes).await {
                    Ok(()) => println!("image from {from} saved to {}", path.display()),
                    Err(e) => error!(dir = %sink.dir().display(), error = %e, "saving image failed"),
                }
            }
            _ => {}
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

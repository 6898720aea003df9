//! roomcall CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use roomcall::call_engine::{
    format_bytes, CallEvent, CallOutcome, CallRequest, CallState, CallSupervisor, CpalBackend,
    OpusCodec,
};
use roomcall::database::{NewRecentRoom, RecentRoomsDatabase};
use roomcall::{init_logging, AppContext};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "roomcall", version, about = "P2P voice calls via a rendezvous server")]
struct Cli {
    /// Debug-Logging für roomcall
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Betritt einen Raum und telefoniert, bis Ctrl-C gedrückt wird
    Call {
        /// Signaling-Server (Hostname oder IPv4)
        host: String,
        /// TCP-Port des Signaling-Servers
        port: u16,
        /// Raumname, den beide Seiten kennen
        room: String,
        /// Audio über den Server weiterleiten statt direkt
        #[arg(long)]
        relay: bool,
        /// Pfad zu einer JSON-Konfiguration
        #[arg(long)]
        config: Option<PathBuf>,
        /// Raum nicht in der Historie speichern
        #[arg(long)]
        no_history: bool,
    },
    /// Zeigt die zuletzt benutzten Räume
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Löscht die komplette Historie
        #[arg(long)]
        clear: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Call {
            host,
            port,
            room,
            relay,
            config,
            no_history,
        } => {
            let request = CallRequest {
                host,
                port,
                room,
                relay,
            };
            call(request, config, !no_history).await
        }
        Command::History { limit, clear } => history(limit, clear),
    }
}

async fn call(request: CallRequest, config: Option<PathBuf>, with_history: bool) -> Result<()> {
    let context =
        AppContext::init(config.as_deref(), with_history).context("Failed to initialize")?;

    if let Some(history) = &context.history {
        // Historie ist Komfort; ein Fehler verhindert den Anruf nicht
        if let Err(e) = history.record(NewRecentRoom {
            room: request.room.clone(),
            host: request.host.clone(),
            port: request.port,
            relay: request.relay,
        }) {
            tracing::warn!("Failed to record room: {}", e);
        }
    }

    let media = &context.config.media;
    let supervisor = CallSupervisor::new(
        context.config.clone(),
        Arc::new(CpalBackend::new(
            media.capture_buffer_frames,
            media.playback_buffer_frames,
        )),
        Arc::new(OpusCodec::new(media.bitrate)),
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Hanging up");
                cancel.cancel();
            }
        });
    }

    let mut events = supervisor.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                CallEvent::StateChanged(CallState::WaitingForPartner) => {
                    println!("Waiting for someone to join the room...");
                }
                CallEvent::StateChanged(CallState::Connected { peer, relay }) => {
                    let mode = if relay { "via relay" } else { "direct" };
                    println!("Connected to {} ({}). Press Ctrl-C to hang up.", peer, mode);
                }
                CallEvent::StateChanged(state) => tracing::debug!("Call state: {:?}", state),
                CallEvent::Stats(_) | CallEvent::Error(_) => {}
            }
        }
    });

    match supervisor.run(request, cancel).await? {
        CallOutcome::Cancelled => println!("Call cancelled."),
        CallOutcome::Ended {
            peer,
            stats,
            duration,
            ..
        } => {
            println!(
                "Call with {} ended after {}s: sent {}, received {}, {:.1}% concealed",
                peer,
                duration.as_secs(),
                format_bytes(stats.bytes_sent),
                format_bytes(stats.bytes_received),
                stats.concealment_ratio() * 100.0
            );
        }
    }

    Ok(())
}

fn history(limit: usize, clear: bool) -> Result<()> {
    let database = RecentRoomsDatabase::open().context("Failed to open history")?;

    if clear {
        let removed = database.clear()?;
        println!("Removed {} rooms from history.", removed);
        return Ok(());
    }

    let rooms = database.recent(limit)?;
    if rooms.is_empty() {
        println!("No rooms yet.");
        return Ok(());
    }

    for room in rooms {
        println!(
            "{:<24} {}:{}{}  ({}x, last {})",
            room.room,
            room.host,
            room.port,
            if room.relay { " relay" } else { "" },
            room.use_count,
            room.last_used_at
        );
    }

    Ok(())
}

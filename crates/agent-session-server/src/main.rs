//! `agent-session-server`: the axum HTTP/WebSocket edge for the Cloud Agent
//! Session Core. Exposes `/stream` and `/ingest` (§6), drains the in-process
//! dispatch worker, and offers a `migrate` subcommand for running storage
//! migrations against a data directory without starting the listener
//! (§10 "Supplemental operator surface").

mod config;
mod dispatch;
mod routes;
mod session_manager;
mod ticket;

use std::path::PathBuf;
use std::sync::Arc;

use agent_session_storage::SessionStore;
use clap::{Parser, Subcommand};

use config::ServerConfig;
use routes::AppState;
use session_manager::SessionManager;
use ticket::TicketSigner;

#[derive(Parser)]
#[command(name = "agent-session-server", version, about = "Cloud Agent Session Core server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP/WebSocket edge and the dispatch worker (default).
    Serve,
    /// Run storage migrations against every session file under a data
    /// directory, then exit without starting the listener.
    Migrate {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve().await,
        Command::Migrate { data_dir } => migrate(data_dir).await,
    }
}

async fn serve() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    let bind_addr = config.bind_addr;
    let ticket_signer = Arc::new(TicketSigner::new(config.ticket_signing_key.clone()));
    let manager = Arc::new(SessionManager::new(config));

    tokio::spawn(dispatch::run_dispatch_worker(manager.clone()));

    let app = routes::router(AppState {
        manager,
        ticket_signer,
    });

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(component = "server", event = "server.listening", addr = %bind_addr, "agent-session-server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn migrate(data_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let data_dir = data_dir.unwrap_or_else(|| ServerConfig::from_env().data_dir);
    if !data_dir.exists() {
        tracing::info!(component = "server", event = "migrate.no_data_dir", dir = %data_dir.display(), "data directory does not exist yet, nothing to migrate");
        return Ok(());
    }

    let mut migrated = 0u32;
    for entry in std::fs::read_dir(&data_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("sqlite3") {
            continue;
        }
        // `SessionStore::open` runs every pending migration under its own
        // concurrency barrier (§4.1) — opening is the migration.
        SessionStore::open(&path)?;
        tracing::info!(component = "server", event = "migrate.applied", file = %path.display(), "ran migrations");
        migrated += 1;
    }
    tracing::info!(component = "server", event = "migrate.complete", count = migrated, "migration pass complete");
    Ok(())
}

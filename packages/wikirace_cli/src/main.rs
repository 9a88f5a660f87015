use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::prelude::*;

mod commands;
mod config;

use crate::config::ClientConfig;

#[derive(Parser)]
#[command(name = "wikirace")]
#[command(about = "Command-line client for the wiki race game server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.wikirace)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Server WebSocket URL (overrides config.toml)
    #[arg(long, global = true)]
    url: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the lobby list as the server pushes updates
    Lobbies,

    /// Create a lobby
    Start(StartArgs),

    /// Join a lobby
    Join(JoinArgs),

    /// Show a lobby's settings
    Settings(SettingsArgs),

    /// Show the server's game clock
    Time,

    /// Fetch a wiki page through the server
    Page(PageArgs),

    /// Show the client id the server assigns
    Whoami,
}

#[derive(Parser)]
struct StartArgs {
    /// Lobby id to create (server picks one if omitted)
    lobby: Option<String>,

    /// Game mode: 0 = time trial, 1 = least clicks
    #[arg(long, default_value = "0")]
    mode: u8,

    #[arg(long, default_value = "1")]
    difficulty: u8,
}

#[derive(Parser)]
struct JoinArgs {
    lobby: String,

    /// Set this username after joining
    #[arg(short, long)]
    username: Option<String>,
}

#[derive(Parser)]
struct SettingsArgs {
    /// Lobby id (defaults to the current lobby)
    lobby: Option<String>,

    /// Game state to query: 0 = waiting, 1 = started, 2 = ended
    #[arg(long, default_value = "0")]
    state: u8,
}

#[derive(Parser)]
struct PageArgs {
    name: String,
}

fn init_logging(debug: bool) {
    let default_directive = if debug {
        "wikirace=debug,wikirace_conn=debug,info"
    } else {
        "wikirace=info,wikirace_conn=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let config = ClientConfig::new(cli.data_dir, cli.url)?;

    let session = wikirace_conn::connect(
        &config.server_url,
        config.conn.clone(),
        config.identity_cache(),
    )
    .await
    .with_context(|| format!("Failed to connect to {}", config.server_url))?;
    info!("Connected to {}", config.server_url);

    let conn = session.conn().clone();
    let result = match cli.command {
        Commands::Lobbies => commands::lobbies(&conn).await,
        Commands::Start(args) => {
            commands::start(&conn, &config, args.lobby, args.mode, args.difficulty).await
        }
        Commands::Join(args) => {
            commands::join(&conn, &config, &args.lobby, args.username.as_deref()).await
        }
        Commands::Settings(args) => {
            commands::settings(&conn, &config, args.lobby.as_deref(), args.state).await
        }
        Commands::Time => commands::time(&conn, &config).await,
        Commands::Page(args) => commands::page(&conn, &config, &args.name).await,
        Commands::Whoami => commands::whoami(&conn, &config).await,
    };

    session.close().await;
    result
}

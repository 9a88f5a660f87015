use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::{info, warn};

use wikirace_conn::{ClientId, GameMode, GameState, ServerConn};

use crate::config::ClientConfig;

/// Wait for the server's identity handshake, bounded by the request timeout.
async fn wait_ready(conn: &ServerConn, config: &ClientConfig) -> Result<ClientId> {
    let id = tokio::time::timeout(config.conn.request_timeout, conn.ready_to_send())
        .await
        .context("Server did not assign a client id in time")?
        .context("Connection closed before a client id was assigned")?;
    info!("Client id: {id}");
    Ok(id)
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn lobbies(conn: &ServerConn) -> Result<()> {
    let mut lobbies = conn.register_all_lobbies();
    conn.when_ready_to_receive(|| info!("Watching lobby list (Ctrl-C to stop)"));

    loop {
        tokio::select! {
            event = lobbies.recv() => match event {
                Some(Ok(list)) => print_json(&list)?,
                Some(Err(e)) => warn!("{e}"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

pub async fn start(
    conn: &ServerConn,
    config: &ClientConfig,
    lobby: Option<String>,
    mode: u8,
    difficulty: u8,
) -> Result<()> {
    let mode = GameMode::try_from(mode).map_err(anyhow::Error::msg)?;
    wait_ready(conn, config).await?;

    let arguments = json!({ "gameMode": mode, "difficulty": difficulty });
    let reply = conn.start_lobby(lobby.as_deref(), arguments).await?;
    print_json(reply.payload())
}

pub async fn join(
    conn: &ServerConn,
    config: &ClientConfig,
    lobby: &str,
    username: Option<&str>,
) -> Result<()> {
    wait_ready(conn, config).await?;

    let reply = conn.join_lobby(lobby).await?;
    print_json(reply.payload())?;

    if let Some(username) = username {
        let reply = conn
            .set_username(username)
            .await
            .with_context(|| format!("Joined {lobby} but failed to set username"))?;
        print_json(&reply)?;
    }
    Ok(())
}

pub async fn settings(
    conn: &ServerConn,
    config: &ClientConfig,
    lobby: Option<&str>,
    state: u8,
) -> Result<()> {
    let state = GameState::try_from(state).map_err(anyhow::Error::msg)?;
    wait_ready(conn, config).await?;

    let settings = conn.get_settings(lobby.unwrap_or_default(), state).await?;
    print_json(&settings)
}

pub async fn time(conn: &ServerConn, config: &ClientConfig) -> Result<()> {
    wait_ready(conn, config).await?;
    print_json(&conn.get_time().await?)
}

pub async fn page(conn: &ServerConn, config: &ClientConfig, name: &str) -> Result<()> {
    wait_ready(conn, config).await?;
    print_json(&conn.get_page(name).await?)
}

pub async fn whoami(conn: &ServerConn, config: &ClientConfig) -> Result<()> {
    if let Some(cache) = config.identity_cache() {
        match cache.load() {
            Ok(Some(cached)) => info!(
                "Cached id {} (expires {})",
                cached.id, cached.expires_at
            ),
            Ok(None) => {}
            Err(e) => warn!("Ignoring identity cache: {e}"),
        }
    }

    let id = wait_ready(conn, config).await?;
    println!("{id}");
    Ok(())
}

//! wikirace_conn - client-side protocol layer for the wiki race game server
//!
//! Every frame on the wire is a JSON envelope `{command, payload,
//! error_message}`. This crate turns that single stream into typed requests
//! that resolve exactly once (reply, server error, timeout or close), plus
//! streams of server pushes such as lobby and player list updates.
//!
//! # Example
//!
//! ```no_run
//! use wikirace_conn::{ConnConfig, GameState, connect};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let session = connect("ws://localhost:4567/websocket", ConnConfig::default(), None).await?;
//!     let conn = session.conn();
//!
//!     let mut lobbies = conn.register_all_lobbies();
//!     let id = conn.ready_to_send().await?;
//!     println!("connected as {id}");
//!
//!     let settings = conn.get_settings("lobbyA", GameState::Started).await?;
//!     println!("{settings}");
//!
//!     if let Some(Ok(list)) = lobbies.recv().await {
//!         println!("lobbies: {list}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod command;
pub mod config;
mod envelope;
mod error;
pub mod identity;
mod manager;
mod readiness;
pub mod transport;

pub use channel::OutboundChannel;
pub use command::{
    Command, CommandDescriptor, CommandRegistry, Direction, GameMode, GameState, Request,
    TimeoutClass,
};
pub use config::{ConnConfig, FileConfig, load_config};
pub use envelope::Envelope;
pub use error::{
    ChannelError, IdentityError, RegistrationError, RegistryError, RequestError, ServerError,
};
pub use identity::{CachedIdentity, ClientId, IdentityCache};
pub use manager::{PendingReply, PushEvent, PushReceiver, Reply, ServerConn};
pub use transport::{ConnectError, Connection, connect};

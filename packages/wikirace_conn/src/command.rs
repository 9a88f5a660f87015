//! Command registry: the static table of every command the client knows.
//!
//! Direction is named from the server's point of view, as the game server
//! names it: `Incoming` commands are client requests that expect a reply,
//! `Outgoing` commands are unsolicited server pushes, and `Server` commands
//! are the session-lifecycle subset of requests whose replies are handed to
//! callers as full envelopes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::RegistryError;

/// Name of the identity-assignment command the server sends on connect.
pub const NOTIFY_ID: &str = "notify_id";
/// Generic error push.
pub const ERROR: &str = "error";
/// Push sent when the server could not parse a request.
pub const COMMAND_ERROR: &str = "command_error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Incoming,
    Outgoing,
    Server,
}

/// How long a request may wait for its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutClass {
    Standard,
    /// Session creation can take several times longer than a query.
    Extended,
}

/// Every command in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    StartLobby,
    LeaveLobby,
    JoinLobby,
    NotifyId,
    CommandError,
    GetPlayers,
    GetTime,
    GetSettings,
    ForceBeginGame,
    GetPage,
    SetUsername,
    SetPlayerState,
    GotoPage,
    GoBackPage,
    GetPath,
    Error,
    AllLobbies,
    AllPlayers,
    BeginGame,
    EndGame,
}

impl Command {
    pub fn descriptor(self) -> &'static CommandDescriptor {
        &DESCRIPTORS[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.descriptor().name
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Immutable metadata for one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandDescriptor {
    pub command: Command,
    pub name: &'static str,
    pub response_name: Option<&'static str>,
    pub direction: Direction,
    pub timeout: TimeoutClass,
    /// Another request whose reply this one deliberately reuses.
    pub shares_reply_with: Option<Command>,
}

impl CommandDescriptor {
    const fn request(
        command: Command,
        name: &'static str,
        response_name: &'static str,
        direction: Direction,
    ) -> Self {
        Self {
            command,
            name,
            response_name: Some(response_name),
            direction,
            timeout: TimeoutClass::Standard,
            shares_reply_with: None,
        }
    }

    const fn push(command: Command, name: &'static str) -> Self {
        Self {
            command,
            name,
            response_name: None,
            direction: Direction::Outgoing,
            timeout: TimeoutClass::Standard,
            shares_reply_with: None,
        }
    }

    const fn extended(mut self) -> Self {
        self.timeout = TimeoutClass::Extended;
        self
    }

    const fn sharing_reply_with(mut self, other: Command) -> Self {
        self.shares_reply_with = Some(other);
        self
    }

    /// Whether this command may be sent with [`crate::ServerConn::request`].
    pub fn is_requestable(&self) -> bool {
        matches!(self.direction, Direction::Incoming | Direction::Server)
            && self.response_name.is_some()
    }

    /// The name the server uses when it sends something this registration
    /// should receive: the reply name for requests, the command itself for
    /// pushes.
    pub fn registration_key(&self) -> &'static str {
        self.response_name.unwrap_or(self.name)
    }
}

/// Indexed by `Command as usize`.
pub static DESCRIPTORS: [CommandDescriptor; 20] = [
    CommandDescriptor::request(
        Command::StartLobby,
        "start_lobby",
        "start_lobby_response",
        Direction::Server,
    )
    .extended(),
    CommandDescriptor::request(
        Command::LeaveLobby,
        "leave_lobby",
        "leave_lobby_response",
        Direction::Server,
    ),
    CommandDescriptor::request(
        Command::JoinLobby,
        "join_lobby",
        "join_lobby_response",
        Direction::Server,
    ),
    CommandDescriptor {
        command: Command::NotifyId,
        name: NOTIFY_ID,
        response_name: None,
        direction: Direction::Server,
        timeout: TimeoutClass::Standard,
        shares_reply_with: None,
    },
    CommandDescriptor::push(Command::CommandError, COMMAND_ERROR),
    CommandDescriptor::request(
        Command::GetPlayers,
        "get_players",
        "all_players",
        Direction::Incoming,
    ),
    CommandDescriptor::request(Command::GetTime, "get_time", "return_time", Direction::Incoming),
    CommandDescriptor::request(
        Command::GetSettings,
        "get_settings",
        "return_settings",
        Direction::Incoming,
    ),
    CommandDescriptor::request(
        Command::ForceBeginGame,
        "force_begin_game",
        "begin_game",
        Direction::Incoming,
    ),
    CommandDescriptor::request(
        Command::GetPage,
        "get_page",
        "return_get_page",
        Direction::Incoming,
    ),
    CommandDescriptor::request(
        Command::SetUsername,
        "set_username",
        "return_set_username",
        Direction::Incoming,
    ),
    CommandDescriptor::request(
        Command::SetPlayerState,
        "set_player_state",
        "return_set_player_state",
        Direction::Incoming,
    ),
    CommandDescriptor::request(
        Command::GotoPage,
        "goto_page",
        "return_goto_page",
        Direction::Incoming,
    ),
    CommandDescriptor::request(
        Command::GoBackPage,
        "go_back_page",
        "return_goto_page",
        Direction::Incoming,
    )
    .sharing_reply_with(Command::GotoPage),
    CommandDescriptor::request(Command::GetPath, "get_path", "return_path", Direction::Incoming),
    CommandDescriptor::push(Command::Error, ERROR),
    CommandDescriptor::push(Command::AllLobbies, "all_lobbies"),
    CommandDescriptor::push(Command::AllPlayers, "all_players"),
    CommandDescriptor::push(Command::BeginGame, "begin_game"),
    CommandDescriptor::push(Command::EndGame, "end_game"),
];

/// Lobby lifecycle state as the server numbers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum GameState {
    Waiting = 0,
    Started = 1,
    Ended = 2,
}

impl From<GameState> for u8 {
    fn from(state: GameState) -> Self {
        state as u8
    }
}

impl TryFrom<u8> for GameState {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Waiting),
            1 => Ok(Self::Started),
            2 => Ok(Self::Ended),
            other => Err(format!("unknown game state {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum GameMode {
    TimeTrial = 0,
    LeastClicks = 1,
}

impl From<GameMode> for u8 {
    fn from(mode: GameMode) -> Self {
        mode as u8
    }
}

impl TryFrom<u8> for GameMode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::TimeTrial),
            1 => Ok(Self::LeastClicks),
            other => Err(format!("unknown game mode {other}")),
        }
    }
}

/// A request with its typed arguments. `payload()` is the payload builder.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// `lobby_id: None` asks the server to generate one.
    StartLobby {
        lobby_id: Option<String>,
        arguments: Value,
    },
    LeaveLobby,
    JoinLobby {
        lobby_id: String,
    },
    /// An empty `lobby_id` means the caller's current lobby.
    GetPlayers {
        lobby_id: String,
    },
    GetTime,
    GetSettings {
        lobby_id: String,
        state: GameState,
    },
    ForceBeginGame,
    GetPage {
        page_name: String,
    },
    SetUsername {
        username: String,
    },
    SetPlayerState {
        state: i64,
    },
    GotoPage {
        page_name: String,
        initial: bool,
    },
    GoBackPage,
    GetPath {
        player_id: String,
    },
}

impl Request {
    pub fn command(&self) -> Command {
        match self {
            Self::StartLobby { .. } => Command::StartLobby,
            Self::LeaveLobby => Command::LeaveLobby,
            Self::JoinLobby { .. } => Command::JoinLobby,
            Self::GetPlayers { .. } => Command::GetPlayers,
            Self::GetTime => Command::GetTime,
            Self::GetSettings { .. } => Command::GetSettings,
            Self::ForceBeginGame => Command::ForceBeginGame,
            Self::GetPage { .. } => Command::GetPage,
            Self::SetUsername { .. } => Command::SetUsername,
            Self::SetPlayerState { .. } => Command::SetPlayerState,
            Self::GotoPage { .. } => Command::GotoPage,
            Self::GoBackPage => Command::GoBackPage,
            Self::GetPath { .. } => Command::GetPath,
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Self::StartLobby {
                lobby_id,
                arguments,
            } => json!({ "lobby_id": lobby_id, "arguments": arguments }),
            Self::JoinLobby { lobby_id } | Self::GetPlayers { lobby_id } => {
                json!({ "lobby_id": lobby_id })
            }
            Self::GetSettings { lobby_id, state } => {
                json!({ "lobby_id": lobby_id, "state": state })
            }
            Self::GetPage { page_name } => json!({ "page_name": page_name }),
            Self::SetUsername { username } => json!({ "username": username }),
            Self::SetPlayerState { state } => json!({ "state": state }),
            Self::GotoPage { page_name, initial } => {
                json!({ "page_name": page_name, "initial": initial })
            }
            Self::GetPath { player_id } => json!({ "player_id": player_id }),
            Self::LeaveLobby | Self::GetTime | Self::ForceBeginGame | Self::GoBackPage => {
                json!({})
            }
        }
    }
}

/// Validated lookup table over a descriptor set.
#[derive(Debug, Clone)]
pub struct CommandRegistry {
    descriptors: &'static [CommandDescriptor],
    by_name: HashMap<&'static str, &'static CommandDescriptor>,
    response_names: HashMap<&'static str, &'static CommandDescriptor>,
}

impl CommandRegistry {
    /// Registry over the built-in protocol table.
    pub fn new() -> Result<Self, RegistryError> {
        Self::from_descriptors(&DESCRIPTORS)
    }

    /// Build and validate a registry. Two requests may only share a reply
    /// name when one declares it reuses the other's reply, or when the reply
    /// is itself a server push (the request asks the server to re-send it).
    pub fn from_descriptors(
        descriptors: &'static [CommandDescriptor],
    ) -> Result<Self, RegistryError> {
        let mut by_name = HashMap::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if by_name.insert(descriptor.name, descriptor).is_some() {
                return Err(RegistryError::DuplicateName(descriptor.name));
            }
        }

        let mut response_names: HashMap<&'static str, &'static CommandDescriptor> =
            HashMap::new();
        for descriptor in descriptors {
            let Some(response) = descriptor.response_name else {
                continue;
            };
            let is_push_reply = by_name
                .get(response)
                .is_some_and(|d| d.direction == Direction::Outgoing);
            match response_names.get(response) {
                Some(first)
                    if !is_push_reply
                        && descriptor.shares_reply_with != Some(first.command)
                        && first.shares_reply_with != Some(descriptor.command) =>
                {
                    return Err(RegistryError::DuplicateResponse {
                        response,
                        first: first.name,
                        second: descriptor.name,
                    });
                }
                Some(_) => {}
                None => {
                    response_names.insert(response, descriptor);
                }
            }
        }

        Ok(Self {
            descriptors,
            by_name,
            response_names,
        })
    }

    /// Look up a command by its wire name.
    pub fn lookup(&self, name: &str) -> Result<&'static CommandDescriptor, RegistryError> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| RegistryError::UnknownCommand(name.to_string()))
    }

    /// This table's entry for `command`, if it has one.
    pub fn get(&self, command: Command) -> Option<&'static CommandDescriptor> {
        self.descriptors.iter().find(|d| d.command == command)
    }

    /// True if `name` is a command or a reply name in this table.
    pub fn knows(&self, name: &str) -> bool {
        self.by_name.contains_key(name) || self.response_names.contains_key(name)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &'static CommandDescriptor> {
        self.descriptors.iter()
    }
}

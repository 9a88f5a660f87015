//! Error types for the connection layer.

use crate::envelope::Envelope;

/// Failures building or querying the command table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("duplicate command name: {0}")]
    DuplicateName(&'static str),

    #[error("response {response} is claimed by both {first} and {second}")]
    DuplicateResponse {
        response: &'static str,
        first: &'static str,
        second: &'static str,
    },
}

/// An application-level failure reported by the server via `error_message`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{command}: {message}")]
pub struct ServerError {
    pub command: String,
    pub message: String,
    /// The full envelope, so callers can read any fields the server attached.
    pub envelope: Envelope,
}

impl ServerError {
    pub fn from_envelope(envelope: Envelope) -> Self {
        Self {
            command: envelope.command.clone(),
            message: envelope.error_text().unwrap_or_default().to_string(),
            envelope,
        }
    }
}

/// Failures writing to the outbound channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,

    #[error("failed to encode envelope: {0}")]
    Encode(String),

    #[error("send failed: {0}")]
    Send(String),
}

/// Outcome of a request that did not produce a reply.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RequestError {
    #[error("request for {command} timed out")]
    Timeout { command: &'static str },

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request for {command} was superseded by a newer request")]
    Superseded { command: &'static str },

    #[error("{command} cannot be sent as a request")]
    NotRequestable { command: &'static str },

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl RequestError {
    /// Stable machine-readable code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Server(_) => "server_error",
            Self::ConnectionClosed => "connection_closed",
            Self::Superseded { .. } => "superseded",
            Self::NotRequestable { .. } => "not_requestable",
            Self::Channel(_) => "channel_error",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// The server's error text, for application errors.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            Self::Server(err) => Some(&err.message),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("{command} is not a server push")]
    NotPush { command: &'static str },
}

/// Failures reading or writing the cached client identity.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity cache io: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed identity cookie: {0}")]
    Malformed(String),
}

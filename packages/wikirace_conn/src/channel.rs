//! The outbound half of the message channel the manager writes to.
//!
//! The manager only needs to hand off one text frame at a time; the inbound
//! half is pushed in by whoever owns the socket via
//! [`crate::ServerConn::handle_message`] and [`crate::ServerConn::handle_close`].

use tokio::sync::mpsc;

use crate::error::ChannelError;

pub trait OutboundChannel: Send + Sync {
    /// Queue one text frame for delivery. Must not block.
    fn send(&self, text: String) -> Result<(), ChannelError>;
}

impl std::fmt::Debug for dyn OutboundChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{OutboundChannel}}")
    }
}

/// A writer task draining the receiver owns the socket.
impl OutboundChannel for mpsc::UnboundedSender<String> {
    fn send(&self, text: String) -> Result<(), ChannelError> {
        mpsc::UnboundedSender::send(self, text).map_err(|_| ChannelError::Closed)
    }
}

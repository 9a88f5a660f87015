//! WebSocket transport: owns the socket and feeds a [`ServerConn`].
//!
//! The manager never touches the socket. A writer task drains the outbound
//! queue into the sink; a reader task hands every text frame to
//! [`ServerConn::handle_message`] and reports the end of the stream with
//! [`ServerConn::handle_close`]. Once the manager closes, the writer flushes
//! whatever is still queued and sends a close frame.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{
    self, Message,
    client::IntoClientRequest,
    handshake::client::Request as ClientRequest,
    http::{HeaderValue, header::COOKIE},
};
use tracing::{debug, info, warn};

use crate::config::ConnConfig;
use crate::error::RegistryError;
use crate::identity::IdentityCache;
use crate::manager::ServerConn;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// Nothing is listening, or the connection was dropped mid-handshake.
    #[error("server unavailable")]
    Unavailable,

    #[error("invalid server url: {0}")]
    InvalidUrl(String),

    #[error("websocket handshake failed: {0}")]
    Handshake(tungstenite::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ConnectError {
    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        let is_connect = match &err {
            tungstenite::Error::Io(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        };
        if is_connect {
            Self::Unavailable
        } else {
            Self::Handshake(err)
        }
    }
}

/// Build the handshake request, presenting a cached identity (if any, and
/// still fresh) as the `client_id` cookie so the server can restore the
/// session.
pub fn client_request(
    url: &str,
    cache: Option<&IdentityCache>,
) -> Result<ClientRequest, ConnectError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| ConnectError::InvalidUrl(e.to_string()))?;

    let Some(cache) = cache else {
        return Ok(request);
    };
    match cache.load() {
        Ok(Some(cached)) => match HeaderValue::from_str(&cached.cookie_header()) {
            Ok(value) => {
                debug!(client_id = %cached.id, "presenting cached client id");
                request.headers_mut().insert(COOKIE, value);
            }
            Err(e) => warn!(error = %e, "cached client id is not a valid header value"),
        },
        Ok(None) => {}
        Err(e) => warn!(error = %e, "ignoring unreadable identity cache"),
    }
    Ok(request)
}

/// How long `Connection::close` waits for queued frames and the close
/// frame to reach the socket.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// A live WebSocket session driving a [`ServerConn`].
#[derive(Debug)]
pub struct Connection {
    conn: ServerConn,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    pub fn conn(&self) -> &ServerConn {
        &self.conn
    }

    /// Tear the session down locally. Outstanding requests fail with
    /// `ConnectionClosed`; frames already queued are still written, followed
    /// by a close frame.
    pub async fn close(self) {
        self.reader.abort();
        self.conn.handle_close();
        let mut writer = self.writer;
        if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut writer)
            .await
            .is_err()
        {
            warn!("websocket writer did not finish; abandoning it");
            writer.abort();
        }
    }
}

/// Open a WebSocket to `url` and start the reader and writer tasks.
pub async fn connect(
    url: &str,
    config: ConnConfig,
    cache: Option<IdentityCache>,
) -> Result<Connection, ConnectError> {
    let request = client_request(url, cache.as_ref())?;
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let conn = ServerConn::from_parts(Box::new(out_tx), config, cache)?;

    let (ws_stream, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(ConnectError::from_tungstenite)?;
    info!(url, "connected");
    let (mut ws_write, mut ws_read) = ws_stream.split();

    let writer = {
        let conn = conn.clone();
        tokio::spawn(async move {
            loop {
                let text = tokio::select! {
                    biased;
                    text = out_rx.recv() => text,
                    // Closed with nothing left queued, bar a racing send.
                    () = conn.closed() => out_rx.try_recv().ok(),
                };
                let Some(text) = text else {
                    break;
                };
                if let Err(e) = ws_write.send(Message::Text(text.into())).await {
                    warn!(error = %e, "websocket write failed");
                    return;
                }
            }
            if let Err(e) = ws_write.close().await {
                debug!(error = %e, "websocket close failed");
            }
        })
    };

    let reader = {
        let conn = conn.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                match frame {
                    Ok(Message::Text(text)) => conn.handle_message(text.as_str()),
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "server closed the websocket");
                        break;
                    }
                    Ok(Message::Binary(data)) => {
                        debug!(len = data.len(), "ignoring binary frame");
                    }
                    // Pings are answered by tungstenite itself.
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "websocket read failed");
                        break;
                    }
                }
            }
            conn.handle_close();
        })
    };

    Ok(Connection {
        conn,
        reader,
        writer,
    })
}

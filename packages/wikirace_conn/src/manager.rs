//! ServerConn: correlates requests with replies and routes server pushes.
//!
//! One table, keyed by the command name the *server* uses when it answers,
//! holds both per-request entries and standing push handlers. A single
//! dispatch routine therefore resolves request/reply pairs and unsolicited
//! pushes alike, without a per-command switch.
//!
//! All table mutation happens under one short-lived lock. Replies and pushes
//! are handed to their channels while it is held, so every handler observes
//! messages in arrival order no matter which thread dispatches them.
//! Readiness callbacks run after it is released, so they may issue new
//! requests re-entrantly.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::OutboundChannel;
use crate::command::{
    self, Command, CommandDescriptor, CommandRegistry, Direction, GameState, Request,
};
use crate::config::ConnConfig;
use crate::envelope::Envelope;
use crate::error::{ChannelError, RegistrationError, RegistryError, RequestError, ServerError};
use crate::identity::{ClientId, IdentityCache};
use crate::readiness::Readiness;

/// A successful reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Ordinary requests only ever see the payload.
    Payload(Value),
    /// Session-lifecycle requests see the whole envelope.
    Session(Envelope),
}

impl Reply {
    fn for_descriptor(descriptor: &CommandDescriptor, envelope: Envelope) -> Self {
        if descriptor.direction == Direction::Server {
            Self::Session(envelope)
        } else {
            Self::Payload(envelope.payload)
        }
    }

    pub fn payload(&self) -> &Value {
        match self {
            Self::Payload(payload) => payload,
            Self::Session(envelope) => &envelope.payload,
        }
    }

    pub fn into_payload(self) -> Value {
        match self {
            Self::Payload(payload) => payload,
            Self::Session(envelope) => envelope.payload,
        }
    }

    pub fn envelope(&self) -> Option<&Envelope> {
        match self {
            Self::Payload(_) => None,
            Self::Session(envelope) => Some(envelope),
        }
    }

    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload().clone())
    }
}

/// One server push: the payload, or the full envelope if the server flagged
/// it as an error.
pub type PushEvent = Result<Value, ServerError>;

type PushSender = mpsc::UnboundedSender<PushEvent>;
type ReplySender = oneshot::Sender<Result<Reply, RequestError>>;

/// Stream of pushes for one command. Ends when a newer handler replaces this
/// one or the connection closes.
#[derive(Debug)]
pub struct PushReceiver {
    command: Command,
    rx: mpsc::UnboundedReceiver<PushEvent>,
}

impl PushReceiver {
    pub fn command(&self) -> Command {
        self.command
    }

    pub async fn recv(&mut self) -> Option<PushEvent> {
        self.rx.recv().await
    }

    /// Next already-delivered push, without waiting.
    pub fn try_recv(&mut self) -> Option<PushEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for PushReceiver {
    type Item = PushEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// The eventual outcome of one request.
#[derive(Debug)]
pub struct PendingReply {
    command: &'static str,
    rx: oneshot::Receiver<Result<Reply, RequestError>>,
}

impl PendingReply {
    pub fn command(&self) -> &'static str {
        self.command
    }
}

impl Future for PendingReply {
    type Output = Result<Reply, RequestError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the manager itself went away.
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(Err(RequestError::ConnectionClosed)))
    }
}

struct Registration {
    id: u64,
    descriptor: &'static CommandDescriptor,
    kind: RegistrationKind,
}

enum RegistrationKind {
    /// The standing `notify_id` handshake handler.
    Identity,
    /// Standing handler for a server push.
    Push { tx: PushSender },
    /// Awaiting exactly one reply.
    OneShot {
        reply: ReplySender,
        timer: Option<JoinHandle<()>>,
        /// Standing handler that owned this key before the request and takes
        /// it back once the request resolves.
        displaced: Option<Box<Registration>>,
    },
}

struct TakenOneShot {
    descriptor: &'static CommandDescriptor,
    reply: ReplySender,
    timer: Option<JoinHandle<()>>,
}

struct ConnState {
    registrations: HashMap<&'static str, Registration>,
    readiness: Readiness,
    next_id: u64,
    closed: bool,
}

impl ConnState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Hand buffered envelopes to standing handlers that have not seen them
    /// yet, oldest first. With `only`, just the ones bound for that handler.
    /// Returns how many were handed over.
    fn replay_buffered(&mut self, only: Option<u64>) -> usize {
        let Self {
            registrations,
            readiness,
            ..
        } = self;
        let mut replayed = 0;
        for buffered in readiness.buffered_mut() {
            let Some((id, tx)) = standing_target(registrations, &buffered.envelope) else {
                continue;
            };
            if buffered.seen_by == Some(id) || only.is_some_and(|only| only != id) {
                continue;
            }
            buffered.seen_by = Some(id);
            if tx.send(push_event(&buffered.envelope)).is_ok() {
                replayed += 1;
            }
        }
        replayed
    }

    /// Remove the one-shot entry at `key` (only if it is the one with
    /// `expected` id, when given), restoring any handler it displaced.
    fn take_one_shot(&mut self, key: &str, expected: Option<u64>) -> Option<TakenOneShot> {
        let is_target = self.registrations.get(key).is_some_and(|r| {
            matches!(r.kind, RegistrationKind::OneShot { .. })
                && expected.is_none_or(|id| id == r.id)
        });
        if !is_target {
            return None;
        }
        let (key, registration) = self.registrations.remove_entry(key)?;
        let RegistrationKind::OneShot {
            reply,
            timer,
            displaced,
        } = registration.kind
        else {
            return None;
        };
        if let Some(displaced) = displaced {
            self.registrations.insert(key, *displaced);
        }
        Some(TakenOneShot {
            descriptor: registration.descriptor,
            reply,
            timer,
        })
    }
}

/// Where a standing delivery for `envelope` should go: the push handler for
/// its command, or for unmatched errors, the generic error handler.
fn standing_target(
    registrations: &HashMap<&'static str, Registration>,
    envelope: &Envelope,
) -> Option<(u64, PushSender)> {
    match registrations.get(envelope.command.as_str()) {
        Some(Registration {
            id,
            kind: RegistrationKind::Push { tx },
            ..
        }) if !tx.is_closed() => Some((*id, tx.clone())),
        Some(Registration {
            kind: RegistrationKind::OneShot { .. } | RegistrationKind::Identity,
            ..
        }) => None,
        _ if envelope.is_error() => error_handler(registrations),
        _ => None,
    }
}

fn error_handler(
    registrations: &HashMap<&'static str, Registration>,
) -> Option<(u64, PushSender)> {
    [command::ERROR, command::COMMAND_ERROR]
        .into_iter()
        .find_map(|key| match registrations.get(key) {
            Some(Registration {
                id,
                kind: RegistrationKind::Push { tx },
                ..
            }) if !tx.is_closed() => Some((*id, tx.clone())),
            _ => None,
        })
}

fn push_event(envelope: &Envelope) -> PushEvent {
    if envelope.is_error() {
        Err(ServerError::from_envelope(envelope.clone()))
    } else {
        Ok(envelope.payload.clone())
    }
}

/// An identity was just assigned. `drain` is set when the dispatching
/// thread owns the queued ready-to-send callbacks.
struct Assigned {
    id: ClientId,
    drain: bool,
}

enum Routed {
    OneShot,
    Identity(Option<Assigned>),
    Standing(u64),
    Unhandled,
}

struct Inner {
    registry: CommandRegistry,
    config: ConnConfig,
    outbound: Box<dyn OutboundChannel>,
    identity_cache: Option<IdentityCache>,
    state: Mutex<ConnState>,
    closed: CancellationToken,
}

/// Client-side protocol engine over one message channel. Cheap to clone;
/// all clones share the same tables.
#[derive(Clone)]
pub struct ServerConn {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ServerConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConn")
            .field("client_id", &self.client_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ServerConn {
    /// Create a manager over the built-in command table.
    pub fn new(
        outbound: impl OutboundChannel + 'static,
        config: ConnConfig,
    ) -> Result<Self, RegistryError> {
        Self::from_parts(Box::new(outbound), config, None)
    }

    /// Create a manager that also writes the assigned identity to `cache`.
    pub fn with_identity_cache(
        outbound: impl OutboundChannel + 'static,
        config: ConnConfig,
        cache: IdentityCache,
    ) -> Result<Self, RegistryError> {
        Self::from_parts(Box::new(outbound), config, Some(cache))
    }

    /// Fails only if the built-in command table is inconsistent.
    pub fn from_parts(
        outbound: Box<dyn OutboundChannel>,
        config: ConnConfig,
        identity_cache: Option<IdentityCache>,
    ) -> Result<Self, RegistryError> {
        let registry = CommandRegistry::new()?;
        let mut state = ConnState {
            registrations: HashMap::new(),
            readiness: Readiness::new(config.replay_capacity),
            next_id: 0,
            closed: false,
        };
        let id = state.next_id();
        state.registrations.insert(
            command::NOTIFY_ID,
            Registration {
                id,
                descriptor: Command::NotifyId.descriptor(),
                kind: RegistrationKind::Identity,
            },
        );

        Ok(Self {
            inner: Arc::new(Inner {
                registry,
                config,
                outbound,
                identity_cache,
                state: Mutex::new(state),
                closed: CancellationToken::new(),
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, ConnState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &ConnConfig {
        &self.inner.config
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.state().readiness.client_id().cloned()
    }

    pub fn is_ready_to_send(&self) -> bool {
        self.state().readiness.is_ready_to_send()
    }

    /// Number of requests still awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.state()
            .registrations
            .values()
            .filter(|r| matches!(r.kind, RegistrationKind::OneShot { .. }))
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the channel has closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Send `request` and wait for its reply.
    pub async fn request(&self, request: Request) -> Result<Reply, RequestError> {
        self.submit(request).await
    }

    /// Send `request` now; await the returned handle for the reply.
    ///
    /// Must be called from within a Tokio runtime (the reply timeout is a
    /// spawned timer).
    pub fn submit(&self, request: Request) -> PendingReply {
        self.submit_raw(request.command(), request.payload())
    }

    /// Send an arbitrary command with a prebuilt payload.
    ///
    /// Pushes cannot be requested: the call is logged and resolves to
    /// [`RequestError::NotRequestable`] without sending anything. A newer
    /// request for the same reply name supersedes this one, which then
    /// resolves to [`RequestError::Superseded`].
    pub fn submit_raw(&self, command: Command, payload: Value) -> PendingReply {
        let descriptor = command.descriptor();
        let (reply, rx) = oneshot::channel();
        let pending = PendingReply {
            command: descriptor.name,
            rx,
        };

        let response = match descriptor.response_name {
            Some(response) if descriptor.is_requestable() => response,
            _ => {
                error!(
                    command = descriptor.name,
                    "refusing to send a command that is not a request"
                );
                let _ = reply.send(Err(RequestError::NotRequestable {
                    command: descriptor.name,
                }));
                return pending;
            }
        };

        let text = match Envelope::request(descriptor.name, payload).encode() {
            Ok(text) => text,
            Err(e) => {
                let _ = reply.send(Err(ChannelError::Encode(e.to_string()).into()));
                return pending;
            }
        };

        let timeout = self.inner.config.timeout_for(descriptor);
        let id = {
            let mut state = self.state();
            if state.closed {
                let _ = reply.send(Err(RequestError::ConnectionClosed));
                return pending;
            }
            let id = state.next_id();

            let displaced = match state.registrations.remove(response) {
                Some(Registration {
                    descriptor: previous,
                    kind:
                        RegistrationKind::OneShot {
                            reply: previous_reply,
                            timer,
                            displaced,
                        },
                    ..
                }) => {
                    if let Some(timer) = timer {
                        timer.abort();
                    }
                    debug!(
                        command = previous.name,
                        by = descriptor.name,
                        "pending request superseded"
                    );
                    let _ = previous_reply.send(Err(RequestError::Superseded {
                        command: previous.name,
                    }));
                    displaced
                }
                Some(standing) => Some(Box::new(standing)),
                None => None,
            };

            let timer = self.spawn_timeout(response, id, timeout);
            state.registrations.insert(
                response,
                Registration {
                    id,
                    descriptor,
                    kind: RegistrationKind::OneShot {
                        reply,
                        timer: Some(timer),
                        displaced,
                    },
                },
            );
            id
        };

        debug!(command = descriptor.name, "sending");
        if let Err(err) = self.inner.outbound.send(text) {
            warn!(command = descriptor.name, error = %err, "send failed");
            let mut state = self.state();
            if let Some(taken) = state.take_one_shot(response, Some(id)) {
                if let Some(timer) = taken.timer {
                    timer.abort();
                }
                let _ = taken.reply.send(Err(err.into()));
            }
        }

        pending
    }

    fn spawn_timeout(&self, key: &'static str, id: u64, after: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(conn) = Self::upgrade(&weak) {
                conn.expire(key, id);
            }
        })
    }

    fn expire(&self, key: &'static str, id: u64) {
        // The timer running this is finishing on its own; don't abort it.
        let taken = self.state().take_one_shot(key, Some(id));
        if let Some(taken) = taken {
            let command = taken.descriptor.name;
            warn!(command, "request timed out");
            let _ = taken.reply.send(Err(RequestError::Timeout { command }));
        }
    }

    // ── session lifecycle (replies carry the full envelope) ──

    /// `lobby_id: None` lets the server pick one.
    pub async fn start_lobby(
        &self,
        lobby_id: Option<&str>,
        arguments: Value,
    ) -> Result<Reply, RequestError> {
        self.request(Request::StartLobby {
            lobby_id: lobby_id.map(str::to_string),
            arguments,
        })
        .await
    }

    pub async fn leave_lobby(&self) -> Result<Reply, RequestError> {
        self.request(Request::LeaveLobby).await
    }

    pub async fn join_lobby(&self, lobby_id: &str) -> Result<Reply, RequestError> {
        self.request(Request::JoinLobby {
            lobby_id: lobby_id.to_string(),
        })
        .await
    }

    // ── queries (replies carry the payload) ──

    async fn query(&self, request: Request) -> Result<Value, RequestError> {
        self.request(request).await.map(Reply::into_payload)
    }

    /// An empty `lobby_id` means the current lobby.
    pub async fn get_players(&self, lobby_id: &str) -> Result<Value, RequestError> {
        self.query(Request::GetPlayers {
            lobby_id: lobby_id.to_string(),
        })
        .await
    }

    pub async fn get_time(&self) -> Result<Value, RequestError> {
        self.query(Request::GetTime).await
    }

    pub async fn get_settings(
        &self,
        lobby_id: &str,
        state: GameState,
    ) -> Result<Value, RequestError> {
        self.query(Request::GetSettings {
            lobby_id: lobby_id.to_string(),
            state,
        })
        .await
    }

    pub async fn force_begin_game(&self) -> Result<Value, RequestError> {
        self.query(Request::ForceBeginGame).await
    }

    pub async fn get_page(&self, page_name: &str) -> Result<Value, RequestError> {
        self.query(Request::GetPage {
            page_name: page_name.to_string(),
        })
        .await
    }

    pub async fn set_username(&self, username: &str) -> Result<Value, RequestError> {
        self.query(Request::SetUsername {
            username: username.to_string(),
        })
        .await
    }

    pub async fn set_player_state(&self, state: i64) -> Result<Value, RequestError> {
        self.query(Request::SetPlayerState { state }).await
    }

    pub async fn goto_page(&self, page_name: &str) -> Result<Value, RequestError> {
        self.query(Request::GotoPage {
            page_name: page_name.to_string(),
            initial: false,
        })
        .await
    }

    pub async fn go_to_initial_page(&self) -> Result<Value, RequestError> {
        self.query(Request::GotoPage {
            page_name: String::new(),
            initial: true,
        })
        .await
    }

    pub async fn go_back_page(&self) -> Result<Value, RequestError> {
        self.query(Request::GoBackPage).await
    }

    pub async fn get_path(&self, player_id: &str) -> Result<Value, RequestError> {
        self.query(Request::GetPath {
            player_id: player_id.to_string(),
        })
        .await
    }

    // =========================================================================
    // Pushes
    // =========================================================================

    /// Install the handler for a server push, replacing any previous one.
    pub fn register_push(&self, command: Command) -> Result<PushReceiver, RegistrationError> {
        let descriptor = command.descriptor();
        if descriptor.direction != Direction::Outgoing {
            error!(command = descriptor.name, "not a server push");
            return Err(RegistrationError::NotPush {
                command: descriptor.name,
            });
        }
        Ok(self.install_push(descriptor))
    }

    fn install_push(&self, descriptor: &'static CommandDescriptor) -> PushReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let receiver = PushReceiver {
            command: descriptor.command,
            rx,
        };

        let mut state = self.state();
        if state.closed {
            return receiver;
        }
        let id = state.next_id();
        let key = descriptor.registration_key();
        let registration = Registration {
            id,
            descriptor,
            kind: RegistrationKind::Push { tx },
        };
        match state.registrations.get_mut(key) {
            Some(Registration {
                kind: RegistrationKind::OneShot { displaced, .. },
                ..
            }) => {
                debug!(
                    command = key,
                    "request in flight; push handler takes over when it resolves"
                );
                *displaced = Some(Box::new(registration));
            }
            _ => {
                if state.registrations.insert(key, registration).is_some() {
                    debug!(command = key, "replaced push handler");
                }
            }
        }
        receiver
    }

    pub fn register_all_lobbies(&self) -> PushReceiver {
        self.install_push(Command::AllLobbies.descriptor())
    }

    pub fn register_all_players(&self) -> PushReceiver {
        self.install_push(Command::AllPlayers.descriptor())
    }

    pub fn register_begin_game(&self) -> PushReceiver {
        self.install_push(Command::BeginGame.descriptor())
    }

    pub fn register_end_game(&self) -> PushReceiver {
        self.install_push(Command::EndGame.descriptor())
    }

    /// Generic error handler; also receives error envelopes that match no
    /// other registration.
    pub fn register_error(&self) -> PushReceiver {
        self.install_push(Command::Error.descriptor())
    }

    pub fn register_command_error(&self) -> PushReceiver {
        self.install_push(Command::CommandError.descriptor())
    }

    // =========================================================================
    // Readiness
    // =========================================================================

    /// Run `callback` once the server has assigned this client an identity.
    ///
    /// Callbacks run exactly once, in registration order, even when they are
    /// registered from other threads while earlier ones are still running.
    /// If the channel closes first they are dropped without running.
    pub fn when_ready_to_send<F>(&self, callback: F)
    where
        F: FnOnce(&ClientId) + Send + 'static,
    {
        let drain = {
            let mut state = self.state();
            if state.closed {
                debug!("connection closed; dropping ready-to-send callback");
                return;
            }
            state.readiness.enqueue(Box::new(callback));
            state.readiness.begin_drain()
        };
        if drain {
            self.drain_send_queue();
            self.replay();
        }
    }

    /// Run queued ready-to-send callbacks until the queue is empty. Only the
    /// caller that won `begin_drain` (or `assign`) may call this.
    fn drain_send_queue(&self) {
        loop {
            let next = self.state().readiness.next_callback();
            let Some((callback, id)) = next else {
                break;
            };
            callback(&id);
        }
    }

    /// Wait until the identity is assigned.
    pub async fn ready_to_send(&self) -> Result<ClientId, RequestError> {
        let (tx, rx) = oneshot::channel();
        self.when_ready_to_send(move |id| {
            let _ = tx.send(id.clone());
        });
        rx.await.map_err(|_| RequestError::ConnectionClosed)
    }

    /// Run `callback` now (typically to register push handlers), then replay
    /// buffered messages to those handlers.
    ///
    /// Each call restarts the replay window; once it lapses with no newer
    /// call, buffering stops. Must be called from within a Tokio runtime.
    pub fn when_ready_to_receive<F: FnOnce()>(&self, callback: F) {
        callback();
        self.replay();
        self.arm_stop_buffering();
    }

    fn arm_stop_buffering(&self) {
        let mut state = self.state();
        if state.closed || !state.readiness.is_buffering() {
            return;
        }
        let generation = state.readiness.rearm();
        let window = self.inner.config.replay_window;
        let weak = Arc::downgrade(&self.inner);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(conn) = Self::upgrade(&weak)
                && conn.state().readiness.stop(generation)
            {
                debug!("replay window elapsed; buffering stopped");
            }
        });
        state.readiness.set_stop_timer(timer);
    }

    /// Re-deliver buffered envelopes to standing handlers that have not seen
    /// them yet. Buffered replies never resolve requests.
    fn replay(&self) {
        let mut state = self.state();
        if state.closed {
            return;
        }
        let replayed = state.replay_buffered(None);
        if replayed > 0 {
            debug!(
                count = replayed,
                buffered = state.readiness.buffered_len(),
                "replayed buffered messages"
            );
        }
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Handle one inbound text frame. Never panics and never closes the
    /// connection: malformed frames are logged and dropped, unknown commands
    /// are logged and then routed like any other.
    pub fn handle_message(&self, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "dropping malformed envelope");
                return;
            }
        };
        debug!(
            command = %envelope.command,
            error = envelope.error_text(),
            "received"
        );
        if !self.inner.registry.knows(&envelope.command) {
            warn!(command = %envelope.command, "received unknown command");
        }
        self.dispatch(envelope);
    }

    fn dispatch(&self, envelope: Envelope) {
        let assigned = {
            let mut state = self.state();
            if state.closed {
                debug!(command = %envelope.command, "connection closed; ignoring message");
                return;
            }
            let routed = Self::route(&mut state, &envelope);
            match routed {
                // A reply is consumed by its request and never replayed, even
                // when its name doubles as a push; the handshake never is either.
                Routed::OneShot => None,
                Routed::Identity(assigned) => assigned,
                Routed::Standing(id) => {
                    state.readiness.record(envelope, Some(id));
                    None
                }
                Routed::Unhandled => {
                    state.readiness.record(envelope, None);
                    None
                }
            }
        };
        if let Some(assigned) = assigned {
            self.finish_assignment(assigned);
        }
    }

    fn route(state: &mut ConnState, envelope: &Envelope) -> Routed {
        let key = envelope.command.as_str();

        if let Some(taken) = state.take_one_shot(key, None) {
            if let Some(timer) = taken.timer {
                timer.abort();
            }
            let outcome = if envelope.is_error() {
                Err(ServerError::from_envelope(envelope.clone()).into())
            } else {
                Ok(Reply::for_descriptor(taken.descriptor, envelope.clone()))
            };
            if taken.reply.send(outcome).is_err() {
                debug!(command = key, "requester went away before its reply");
            }
            return Routed::OneShot;
        }

        if matches!(
            state.registrations.get(key),
            Some(Registration {
                kind: RegistrationKind::Identity,
                ..
            })
        ) {
            return Routed::Identity(Self::assign_identity(state, envelope));
        }

        match standing_target(&state.registrations, envelope) {
            Some((id, tx)) => {
                // Older buffered messages for this handler go first.
                state.replay_buffered(Some(id));
                if tx.send(push_event(envelope)).is_err() {
                    debug!(command = key, "push handler went away");
                }
                Routed::Standing(id)
            }
            None => {
                if let Some(message) = envelope.error_text() {
                    warn!(command = key, error = message, "unhandled server error");
                } else {
                    debug!(command = key, "no handler registered");
                }
                Routed::Unhandled
            }
        }
    }

    fn assign_identity(state: &mut ConnState, envelope: &Envelope) -> Option<Assigned> {
        if let Some(message) = envelope.error_text() {
            warn!(error = message, "server refused to assign a client id");
            return None;
        }
        let Some(id) = envelope.client_id() else {
            warn!("identity assignment without a client id");
            return None;
        };
        let id = ClientId::new(id);
        info!(client_id = %id, "client id assigned");
        let drain = state.readiness.assign(id.clone());
        Some(Assigned { id, drain })
    }

    /// Outside the lock: cache the identity, run the callbacks queued before
    /// it, then replay to any handlers they registered.
    fn finish_assignment(&self, assigned: Assigned) {
        if let Some(cache) = &self.inner.identity_cache
            && let Err(e) = cache.store(&assigned.id)
        {
            warn!(error = %e, "failed to cache client id");
        }
        if assigned.drain {
            self.drain_send_queue();
        }
        self.replay();
    }

    /// Feed every frame from `inbound` through [`Self::handle_message`], then
    /// close once the stream ends.
    pub async fn pump<S>(&self, mut inbound: S)
    where
        S: Stream<Item = String> + Unpin,
    {
        while let Some(text) = inbound.next().await {
            self.handle_message(&text);
        }
        self.handle_close();
    }

    /// [`Self::pump`] on a background task.
    pub fn spawn_reader<S>(&self, inbound: S) -> JoinHandle<()>
    where
        S: Stream<Item = String> + Send + Unpin + 'static,
    {
        let conn = self.clone();
        tokio::spawn(async move { conn.pump(inbound).await })
    }

    /// The channel closed: fail every outstanding request, end every push
    /// stream, drop queued readiness callbacks, and wake `closed()` waiters.
    pub fn handle_close(&self) {
        let mut failed = Vec::new();
        {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            for (_, registration) in state.registrations.drain() {
                if let RegistrationKind::OneShot { reply, timer, .. } = registration.kind {
                    if let Some(timer) = timer {
                        timer.abort();
                    }
                    failed.push(reply);
                }
            }
            state.readiness.shutdown();
        }

        info!(pending = failed.len(), "connection closed");
        for reply in failed {
            let _ = reply.send(Err(RequestError::ConnectionClosed));
        }
        self.inner.closed.cancel();
    }
}

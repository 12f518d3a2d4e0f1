//! Live channel lifecycle for the conversation currently on screen.
//!
//! [`ConnectionManager`] owns at most one live channel. Every channel gets a
//! generation number when it is opened; transport events are applied only
//! while their generation is the current one, so a retired channel can never
//! leak messages or state changes into its successor. All transitions happen
//! under the manager's state lock.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use shared::{
    domain::{ConversationId, UserId},
    protocol::{
        CloseDisposition, ConnectionAck, FatalClose, InboundEnvelope, Message, OutboundEnvelope,
        CLOSE_NORMAL,
    },
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    auth::CredentialSource,
    transport::{TransportCommand, TransportConnector, TransportEvent, CLOSE_ABNORMAL},
};

const CLIENT_DISCONNECT_REASON: &str = "Client disconnecting";
const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_millis(2000);
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("No authentication token available")]
    MissingCredential,
    #[error("Failed to create WebSocket connection: {0}")]
    Setup(String),
    #[error("WebSocket connection error")]
    Transport,
    #[error("Authentication error. Please login again.")]
    AuthenticationFailed,
    #[error("Not authorized to access this conversation.")]
    NotAuthorized,
    #[error("Conversation not found.")]
    ConversationNotFound,
    #[error("WebSocket is not connected")]
    NotConnected,
    #[error("Failed to send message")]
    SendFailed,
    #[error("Connection lost; gave up after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("{0}")]
    Server(String),
}

impl From<FatalClose> for ConnectionError {
    fn from(value: FatalClose) -> Self {
        match value {
            FatalClose::InvalidCredential => Self::AuthenticationFailed,
            FatalClose::NotAuthorized => Self::NotAuthorized,
            FatalClose::ConversationNotFound => Self::ConversationNotFound,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connection(ConnectionAck),
    Message(Message),
    UserLeft {
        user_id: UserId,
        username: String,
    },
    Error(ConnectionError),
    ReconnectScheduled {
        conversation_id: ConversationId,
        attempt: u32,
        delay: Duration,
    },
}

/// Exponential backoff without jitter: attempt `n` waits `base * 2^(n-1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_RECONNECT_BASE_DELAY,
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

/// Builds `{ws|wss}://<host>/conversations/{id}/ws?token=...` from the REST
/// base URL, keeping any path prefix the REST API is mounted under.
pub fn live_channel_url(
    api_url: &str,
    conversation_id: ConversationId,
    token: &str,
) -> Result<Url> {
    let base = api_url.trim().trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        bail!("api url must start with http:// or https://: {api_url}");
    };
    let mut url = Url::parse(&format!(
        "{ws_base}/conversations/{}/ws",
        conversation_id.0
    ))
    .with_context(|| format!("invalid live channel url for api url {api_url}"))?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url)
}

struct LiveChannel {
    generation: u64,
    conversation_id: ConversationId,
    commands: mpsc::UnboundedSender<TransportCommand>,
    open: bool,
    reader: JoinHandle<()>,
}

struct PendingRetry {
    generation: u64,
    task: JoinHandle<()>,
}

struct ManagerState {
    status: ConnectionStatus,
    channel: Option<LiveChannel>,
    target: Option<ConversationId>,
    reconnect_attempts: u32,
    retry: Option<PendingRetry>,
    next_generation: u64,
}

pub struct ConnectionManager {
    api_url: String,
    policy: ReconnectPolicy,
    connector: Arc<dyn TransportConnector>,
    credentials: Arc<dyn CredentialSource>,
    inner: Mutex<ManagerState>,
    status: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(
        api_url: impl Into<String>,
        policy: ReconnectPolicy,
        connector: Arc<dyn TransportConnector>,
        credentials: Arc<dyn CredentialSource>,
        event_buffer: usize,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Arc::new(Self {
            api_url: api_url.into(),
            policy,
            connector,
            credentials,
            inner: Mutex::new(ManagerState {
                status: ConnectionStatus::Disconnected,
                channel: None,
                target: None,
                reconnect_attempts: 0,
                retry: None,
                next_generation: 0,
            }),
            status,
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    pub async fn reconnect_attempts(&self) -> u32 {
        self.inner.lock().await.reconnect_attempts
    }

    /// Conversation the manager is trying to keep a channel open for.
    pub async fn target(&self) -> Option<ConversationId> {
        self.inner.lock().await.target
    }

    pub async fn is_connected(&self) -> bool {
        let state = self.inner.lock().await;
        state.status == ConnectionStatus::Connected
            && state.channel.as_ref().is_some_and(|channel| channel.open)
    }

    /// Opens a live channel for `conversation_id`, retiring any existing one
    /// first. Failures are reported on the event stream.
    pub async fn connect(self: &Arc<Self>, conversation_id: ConversationId) {
        let mut state = self.inner.lock().await;
        cancel_retry(&mut state);
        self.retire_channel(&mut state);
        state.reconnect_attempts = 0;
        self.open_locked(&mut state, conversation_id);
    }

    /// Closes the live channel with a normal close and forgets the target.
    /// Safe to call when nothing is connected.
    pub async fn disconnect(&self) {
        let mut state = self.inner.lock().await;
        cancel_retry(&mut state);
        if let Some(channel) = &state.channel {
            info!(
                conversation_id = channel.conversation_id.0,
                generation = channel.generation,
                "closing live channel"
            );
        }
        self.retire_channel(&mut state);
        state.target = None;
        state.reconnect_attempts = 0;
        self.set_status(&mut state, ConnectionStatus::Disconnected);
    }

    pub async fn send_message(&self, content: &str) {
        let state = self.inner.lock().await;
        let channel = match state.channel.as_ref() {
            Some(channel) if channel.open && state.status == ConnectionStatus::Connected => channel,
            _ => {
                self.emit(ConnectionEvent::Error(ConnectionError::NotConnected));
                return;
            }
        };
        let payload = match serde_json::to_string(&OutboundEnvelope {
            content: content.to_string(),
        }) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "failed to encode outbound frame");
                self.emit(ConnectionEvent::Error(ConnectionError::SendFailed));
                return;
            }
        };
        if channel.commands.send(TransportCommand::Send(payload)).is_err() {
            warn!(
                conversation_id = channel.conversation_id.0,
                "live channel writer is gone"
            );
            self.emit(ConnectionEvent::Error(ConnectionError::SendFailed));
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn set_status(&self, state: &mut ManagerState, status: ConnectionStatus) {
        state.status = status;
        self.status.send_replace(status);
    }

    fn retire_channel(&self, state: &mut ManagerState) {
        if let Some(channel) = state.channel.take() {
            let _ = channel.commands.send(TransportCommand::Close {
                code: CLOSE_NORMAL,
                reason: CLIENT_DISCONNECT_REASON.to_string(),
            });
            channel.reader.abort();
        }
    }

    fn open_locked(self: &Arc<Self>, state: &mut ManagerState, conversation_id: ConversationId) {
        let Some(token) = self.credentials.token() else {
            warn!(
                conversation_id = conversation_id.0,
                "cannot open live channel without a credential"
            );
            state.target = None;
            self.set_status(state, ConnectionStatus::Error);
            self.emit(ConnectionEvent::Error(ConnectionError::MissingCredential));
            return;
        };

        state.target = Some(conversation_id);
        self.set_status(state, ConnectionStatus::Connecting);

        let handle = live_channel_url(&self.api_url, conversation_id, &token)
            .and_then(|url| self.connector.open(&url));
        let handle = match handle {
            Ok(handle) => handle,
            Err(err) => {
                warn!(conversation_id = conversation_id.0, error = %err, "failed to create live channel");
                self.set_status(state, ConnectionStatus::Error);
                self.emit(ConnectionEvent::Error(ConnectionError::Setup(
                    err.to_string(),
                )));
                return;
            }
        };

        state.next_generation += 1;
        let generation = state.next_generation;
        let reader = spawn_reader(Arc::downgrade(self), generation, handle.events);
        state.channel = Some(LiveChannel {
            generation,
            conversation_id,
            commands: handle.commands,
            open: false,
            reader,
        });
        info!(
            conversation_id = conversation_id.0,
            generation, "opening live channel"
        );
    }

    /// Applies one transport event. Returns `false` once the channel is done,
    /// either because it closed or because it has been superseded.
    async fn handle_transport_event(self: &Arc<Self>, generation: u64, event: TransportEvent) -> bool {
        let mut state = self.inner.lock().await;
        let conversation_id = match state.channel.as_ref() {
            Some(channel) if channel.generation == generation => channel.conversation_id,
            _ => {
                debug!(generation, "dropping event from retired live channel");
                return false;
            }
        };

        match event {
            TransportEvent::Opened => {
                if let Some(channel) = state.channel.as_mut() {
                    channel.open = true;
                }
                state.reconnect_attempts = 0;
                self.set_status(&mut state, ConnectionStatus::Connected);
                info!(
                    conversation_id = conversation_id.0,
                    generation, "live channel connected"
                );
                true
            }
            TransportEvent::Text(raw) => {
                self.dispatch_frame(conversation_id, &raw);
                true
            }
            TransportEvent::SendFailed(detail) => {
                warn!(conversation_id = conversation_id.0, error = %detail, "outbound frame not delivered");
                self.emit(ConnectionEvent::Error(ConnectionError::SendFailed));
                true
            }
            TransportEvent::Error(detail) => {
                warn!(conversation_id = conversation_id.0, error = %detail, "live channel error");
                self.set_status(&mut state, ConnectionStatus::Error);
                self.emit(ConnectionEvent::Error(ConnectionError::Transport));
                true
            }
            TransportEvent::Closed { code, reason } => {
                state.channel = None;
                self.set_status(&mut state, ConnectionStatus::Disconnected);
                info!(
                    conversation_id = conversation_id.0,
                    code,
                    reason = %reason,
                    "live channel closed"
                );
                self.handle_close(&mut state, code);
                false
            }
        }
    }

    fn handle_close(self: &Arc<Self>, state: &mut ManagerState, code: u16) {
        match CloseDisposition::from_code(code) {
            CloseDisposition::Normal => {}
            CloseDisposition::Fatal(kind) => {
                warn!(code, "live channel closed with a fatal code; not reconnecting");
                self.emit(ConnectionEvent::Error(kind.into()));
            }
            CloseDisposition::Retryable => self.schedule_reconnect(state, code),
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, state: &mut ManagerState, code: u16) {
        let Some(conversation_id) = state.target else {
            return;
        };
        if state.reconnect_attempts >= self.policy.max_attempts {
            warn!(
                conversation_id = conversation_id.0,
                attempts = state.reconnect_attempts,
                "reconnect attempts exhausted"
            );
            self.emit(ConnectionEvent::Error(ConnectionError::ReconnectExhausted {
                attempts: state.reconnect_attempts,
            }));
            return;
        }

        state.reconnect_attempts += 1;
        let attempt = state.reconnect_attempts;
        let delay = self.policy.delay_for(attempt);
        state.next_generation += 1;
        let generation = state.next_generation;
        info!(
            conversation_id = conversation_id.0,
            attempt,
            max_attempts = self.policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            code,
            "scheduling live channel reconnect"
        );

        let manager = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = manager.upgrade() {
                manager.fire_reconnect(generation, conversation_id).await;
            }
        });
        state.retry = Some(PendingRetry { generation, task });
        self.emit(ConnectionEvent::ReconnectScheduled {
            conversation_id,
            attempt,
            delay,
        });
    }

    async fn fire_reconnect(self: &Arc<Self>, generation: u64, conversation_id: ConversationId) {
        let mut state = self.inner.lock().await;
        if !state
            .retry
            .as_ref()
            .is_some_and(|retry| retry.generation == generation)
        {
            return;
        }
        state.retry = None;
        if state.target != Some(conversation_id) || state.channel.is_some() {
            debug!(conversation_id = conversation_id.0, "reconnect no longer wanted");
            return;
        }
        info!(
            conversation_id = conversation_id.0,
            attempt = state.reconnect_attempts,
            "reconnecting live channel"
        );
        self.open_locked(&mut state, conversation_id);
    }

    fn dispatch_frame(&self, conversation_id: ConversationId, raw: &str) {
        let envelope = match serde_json::from_str::<InboundEnvelope>(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(error = %err, "dropping unparseable live frame");
                return;
            }
        };

        match envelope {
            InboundEnvelope::Connection(ack) => {
                debug!(conversation_id = conversation_id.0, status = ?ack.status, "live channel acknowledged");
                self.emit(ConnectionEvent::Connection(ack));
            }
            InboundEnvelope::Message(frame) => match frame.into_message(conversation_id) {
                Some(message) => self.emit(ConnectionEvent::Message(message)),
                None => debug!(conversation_id = conversation_id.0, "dropping malformed message frame"),
            },
            InboundEnvelope::UserLeft(frame) => match (frame.user_id, frame.username) {
                (Some(user_id), Some(username)) if !username.is_empty() => {
                    self.emit(ConnectionEvent::UserLeft { user_id, username });
                }
                _ => debug!("dropping malformed user_left frame"),
            },
            InboundEnvelope::Error(frame) => {
                let message = frame
                    .message
                    .filter(|message| !message.is_empty())
                    .unwrap_or_else(|| "Unknown error".to_string());
                self.emit(ConnectionEvent::Error(ConnectionError::Server(message)));
            }
            InboundEnvelope::Unknown => {
                warn!(conversation_id = conversation_id.0, "ignoring live frame of unknown type");
            }
        }
    }
}

fn cancel_retry(state: &mut ManagerState) {
    if let Some(retry) = state.retry.take() {
        retry.task.abort();
    }
}

fn spawn_reader(
    manager: Weak<ConnectionManager>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = events.recv().await.unwrap_or(TransportEvent::Closed {
                code: CLOSE_ABNORMAL,
                reason: "transport dropped".to_string(),
            });
            let Some(manager) = manager.upgrade() else {
                break;
            };
            if !manager.handle_transport_event(generation, event).await {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<_> = (1..=5).map(|attempt| policy.delay_for(attempt)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(2000),
                Duration::from_millis(4000),
                Duration::from_millis(8000),
                Duration::from_millis(16000),
                Duration::from_millis(32000),
            ]
        );
    }

    #[test]
    fn live_channel_url_mirrors_rest_scheme() {
        let url = live_channel_url("http://localhost:8000/", ConversationId(5), "abc")
            .expect("ws url");
        assert_eq!(url.as_str(), "ws://localhost:8000/conversations/5/ws?token=abc");

        let url = live_channel_url("https://api.example.com/v1", ConversationId(7), "a b+c")
            .expect("wss url");
        assert_eq!(
            url.as_str(),
            "wss://api.example.com/v1/conversations/7/ws?token=a+b%2Bc"
        );
    }

    #[test]
    fn live_channel_url_rejects_other_schemes() {
        assert!(live_channel_url("ftp://example.com", ConversationId(1), "t").is_err());
    }
}

//! Conversation view state: known conversations, the selected conversation's
//! messages and the compose buffer, kept consistent with the live channel.

use std::sync::{Arc, PoisonError, Weak};

use futures::{future::join_all, StreamExt};
use shared::{
    domain::{counterpart, ConversationId, UserId, UserSummary},
    protocol::{Conversation, Message},
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, info, warn};

use crate::{
    api::{ConversationApi, FriendDirectory},
    auth::CredentialSource,
    connection::{ConnectionEvent, ConnectionManager, ConnectionStatus},
};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConversationsLoaded { count: usize },
    ConversationAdded(ConversationId),
    ConversationUpdated(ConversationId),
    ConversationSelected(ConversationId),
    HistoryLoaded {
        conversation_id: ConversationId,
        count: usize,
    },
    MessageAppended(Message),
    UserLeft {
        user_id: UserId,
        username: String,
    },
    Error(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("message content must not be empty")]
    EmptyMessage,
    #[error("no conversation selected")]
    NoConversationSelected,
    #[error("not logged in")]
    NotLoggedIn,
    #[error("{context}: {source}")]
    Api {
        context: &'static str,
        source: anyhow::Error,
    },
}

#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub conversations: Vec<Conversation>,
    pub selected: Option<ConversationId>,
    pub messages: Vec<Message>,
    pub draft: String,
    pub loading: bool,
}

#[derive(Default)]
struct SessionState {
    conversations: Vec<Conversation>,
    selected: Option<ConversationId>,
    messages: Vec<Message>,
    draft: String,
    loading: bool,
}

pub struct ConversationSession {
    api: Arc<dyn ConversationApi>,
    friends: Arc<dyn FriendDirectory>,
    credentials: Arc<dyn CredentialSource>,
    connection: Arc<ConnectionManager>,
    inner: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    pump: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConversationSession {
    /// Must be called inside a tokio runtime: starts the task that merges
    /// live channel events into the session.
    pub fn new(
        api: Arc<dyn ConversationApi>,
        friends: Arc<dyn FriendDirectory>,
        credentials: Arc<dyn CredentialSource>,
        connection: Arc<ConnectionManager>,
        event_buffer: usize,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        let live_events = connection.subscribe();
        let session = Arc::new(Self {
            api,
            friends,
            credentials,
            connection,
            inner: Mutex::new(SessionState::default()),
            events,
            pump: std::sync::Mutex::new(None),
        });
        let pump = tokio::spawn(run_event_pump(Arc::downgrade(&session), live_events));
        *session.pump.lock().unwrap_or_else(PoisonError::into_inner) = Some(pump);
        session
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn connection_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.subscribe_status()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.inner.lock().await;
        SessionSnapshot {
            conversations: state.conversations.clone(),
            selected: state.selected,
            messages: state.messages.clone(),
            draft: state.draft.clone(),
            loading: state.loading,
        }
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.inner.lock().await.conversations.clone()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.inner.lock().await.messages.clone()
    }

    pub async fn selected(&self) -> Option<Conversation> {
        let state = self.inner.lock().await;
        let selected = state.selected?;
        state
            .conversations
            .iter()
            .find(|conversation| conversation.id == selected)
            .cloned()
    }

    pub async fn draft(&self) -> String {
        self.inner.lock().await.draft.clone()
    }

    pub async fn set_draft(&self, text: impl Into<String>) {
        self.inner.lock().await.draft = text.into();
    }

    /// Fetches the conversation list and starts resolving each entry's
    /// counterpart name in the background.
    pub async fn load_conversations(self: &Arc<Self>) -> Result<(), SessionError> {
        self.inner.lock().await.loading = true;
        let result = self.api.list_conversations().await;
        let mut state = self.inner.lock().await;
        state.loading = false;
        let conversations = match result {
            Ok(conversations) => conversations,
            Err(err) => {
                drop(state);
                return Err(self.report("failed to load conversations", err));
            }
        };

        let ids: Vec<_> = conversations.iter().map(|conversation| conversation.id).collect();
        state.conversations = conversations;
        drop(state);

        info!(count = ids.len(), "loaded conversations");
        self.emit(SessionEvent::ConversationsLoaded { count: ids.len() });
        for conversation_id in ids {
            self.spawn_enrichment(conversation_id);
        }
        Ok(())
    }

    pub async fn load_friends(&self) -> Result<Vec<UserSummary>, SessionError> {
        self.friends
            .friends()
            .await
            .map_err(|err| self.report("failed to load friends", err))
    }

    /// Switches the view to `conversation`: the old live channel is closed,
    /// history is loaded, and only then a channel for the new conversation is
    /// opened.
    pub async fn select_conversation(&self, conversation: &Conversation) -> Result<(), SessionError> {
        let conversation_id = conversation.id;
        {
            let mut state = self.inner.lock().await;
            state.selected = Some(conversation_id);
            state.messages.clear();
            self.connection.disconnect().await;
        }
        info!(conversation_id = conversation_id.0, "conversation selected");
        self.emit(SessionEvent::ConversationSelected(conversation_id));

        let history = self.api.messages(conversation_id).await;
        let mut state = self.inner.lock().await;
        if state.selected != Some(conversation_id) {
            debug!(
                conversation_id = conversation_id.0,
                "selection changed while history was loading"
            );
            return Ok(());
        }

        let outcome = match history {
            Ok(messages) => {
                let count = messages.len();
                state.messages = messages;
                self.emit(SessionEvent::HistoryLoaded {
                    conversation_id,
                    count,
                });
                Ok(())
            }
            Err(err) => Err(self.report("failed to load messages", err)),
        };

        // Held across connect so a concurrent selection cannot slip in between
        // the check above and the channel opening.
        self.connection.connect(conversation_id).await;
        drop(state);
        outcome
    }

    /// Opens the direct conversation with `user_id`, creating it only when no
    /// two-person conversation with that user is known.
    pub async fn select_counterpart(self: &Arc<Self>, user_id: UserId) -> Result<(), SessionError> {
        let current_user = self
            .credentials
            .current_user_id()
            .ok_or(SessionError::NotLoggedIn)?;

        self.resolve_missing_participants().await;
        let existing = {
            let state = self.inner.lock().await;
            state
                .conversations
                .iter()
                .find(|conversation| conversation.is_direct_between(current_user, user_id))
                .cloned()
        };
        if let Some(conversation) = existing {
            debug!(
                conversation_id = conversation.id.0,
                user_id = user_id.0,
                "reusing direct conversation"
            );
            return self.select_conversation(&conversation).await;
        }

        let created = self
            .api
            .create_conversation(user_id)
            .await
            .map_err(|err| self.report("failed to start conversation", err))?;
        info!(
            conversation_id = created.id.0,
            user_id = user_id.0,
            "started conversation"
        );
        {
            let mut state = self.inner.lock().await;
            if !state
                .conversations
                .iter()
                .any(|conversation| conversation.id == created.id)
            {
                state.conversations.insert(0, created.clone());
            }
        }
        self.emit(SessionEvent::ConversationAdded(created.id));
        self.spawn_enrichment(created.id);
        self.select_conversation(&created).await
    }

    /// Sends over the live channel when it is up, otherwise through the REST
    /// fallback. Only the fallback appends locally; live sends come back as an
    /// echo on the channel.
    pub async fn send_message(&self, content: &str) -> Result<(), SessionError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        let conversation_id = self
            .inner
            .lock()
            .await
            .selected
            .ok_or(SessionError::NoConversationSelected)?;

        if self.connection.is_connected().await {
            self.connection.send_message(content).await;
            self.inner.lock().await.draft.clear();
            return Ok(());
        }

        debug!(
            conversation_id = conversation_id.0,
            "live channel down; using fallback send"
        );
        let message = self
            .api
            .send_message(conversation_id, content)
            .await
            .map_err(|err| self.report("failed to send message", err))?;
        self.append_message(message).await;
        self.inner.lock().await.draft.clear();
        Ok(())
    }

    pub async fn send_draft(&self) -> Result<(), SessionError> {
        let draft = self.draft().await;
        self.send_message(&draft).await
    }

    /// Closes the live channel. Call when the conversation view goes away.
    pub async fn dispose(&self) {
        self.connection.disconnect().await;
        if let Some(pump) = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pump.abort();
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn report(&self, context: &'static str, err: anyhow::Error) -> SessionError {
        warn!(error = %err, "{context}");
        self.emit(SessionEvent::Error(format!("{context}: {err}")));
        SessionError::Api {
            context,
            source: err,
        }
    }

    /// Appends `message` if it belongs to the selected conversation and is not
    /// already in the list.
    async fn append_message(&self, message: Message) -> bool {
        let mut state = self.inner.lock().await;
        if state.selected != Some(message.conversation_id) {
            debug!(
                conversation_id = message.conversation_id.0,
                message_id = message.id.0,
                "ignoring message for a conversation that is not selected"
            );
            return false;
        }
        if state.messages.iter().any(|existing| existing.id == message.id) {
            debug!(message_id = message.id.0, "ignoring duplicate message");
            return false;
        }
        state.messages.push(message.clone());
        drop(state);
        self.emit(SessionEvent::MessageAppended(message));
        true
    }

    fn spawn_enrichment(self: &Arc<Self>, conversation_id: ConversationId) -> JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.enrich(conversation_id).await;
        })
    }

    /// Fetches participants for every known conversation that has none cached
    /// yet, including ones whose background enrichment is still in flight.
    async fn resolve_missing_participants(&self) {
        let pending: Vec<_> = self
            .inner
            .lock()
            .await
            .conversations
            .iter()
            .filter(|conversation| conversation.participants.is_none())
            .map(|conversation| conversation.id)
            .collect();
        if pending.is_empty() {
            return;
        }
        debug!(count = pending.len(), "resolving participants before counterpart lookup");
        join_all(pending.into_iter().map(|conversation_id| self.enrich(conversation_id))).await;
    }

    /// Reloads the selected conversation's history and merges in anything the
    /// list already holds that the server did not return.
    pub(crate) async fn resync_selected(&self) {
        let Some(conversation_id) = self.inner.lock().await.selected else {
            return;
        };
        let history = match self.api.messages(conversation_id).await {
            Ok(history) => history,
            Err(err) => {
                self.report("failed to reload messages", err);
                return;
            }
        };

        let mut state = self.inner.lock().await;
        if state.selected != Some(conversation_id) {
            return;
        }
        let mut merged = history;
        let local: Vec<_> = state
            .messages
            .drain(..)
            .filter(|message| !merged.iter().any(|fetched| fetched.id == message.id))
            .collect();
        merged.extend(local);
        let count = merged.len();
        state.messages = merged;
        drop(state);

        info!(conversation_id = conversation_id.0, count, "reloaded messages after falling behind");
        self.emit(SessionEvent::HistoryLoaded {
            conversation_id,
            count,
        });
    }

    async fn enrich(&self, conversation_id: ConversationId) {
        let participants = match self.api.participants(conversation_id).await {
            Ok(participants) => participants,
            Err(err) => {
                warn!(
                    conversation_id = conversation_id.0,
                    error = %err,
                    "failed to resolve conversation participants"
                );
                return;
            }
        };
        let current_user = self.credentials.current_user_id();
        {
            let mut state = self.inner.lock().await;
            let Some(conversation) = state
                .conversations
                .iter_mut()
                .find(|conversation| conversation.id == conversation_id)
            else {
                return;
            };
            let display_name = counterpart(&participants, current_user)
                .map(UserSummary::display_name)
                .unwrap_or_else(|| conversation.title.clone());
            conversation.display_name = Some(display_name);
            conversation.participants = Some(participants);
        }
        self.emit(SessionEvent::ConversationUpdated(conversation_id));
    }

    async fn handle_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Message(message) => {
                self.append_message(message).await;
            }
            ConnectionEvent::UserLeft { user_id, username } => {
                self.emit(SessionEvent::UserLeft { user_id, username });
            }
            ConnectionEvent::Error(err) => self.emit(SessionEvent::Error(err.to_string())),
            ConnectionEvent::Connection(_) | ConnectionEvent::ReconnectScheduled { .. } => {}
        }
    }
}

impl Drop for ConversationSession {
    fn drop(&mut self) {
        if let Some(pump) = self
            .pump
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pump.abort();
        }
    }
}

async fn run_event_pump(
    session: Weak<ConversationSession>,
    events: broadcast::Receiver<ConnectionEvent>,
) {
    let mut stream = BroadcastStream::new(events);
    while let Some(item) = stream.next().await {
        let Some(session) = session.upgrade() else {
            break;
        };
        match item {
            Ok(event) => session.handle_connection_event(event).await,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "session fell behind the live channel");
                session.resync_selected().await;
            }
        }
    }
}

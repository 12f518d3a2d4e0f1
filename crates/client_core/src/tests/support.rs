//! In-memory transport and credentials shared by the unit tests.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{TimeZone, Utc};
use serde_json::json;
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::Message,
};
use tokio::sync::{broadcast, mpsc};
use url::Url;

use crate::{
    auth::CredentialSource,
    connection::{ConnectionEvent, ConnectionManager, ReconnectPolicy},
    transport::{TransportCommand, TransportConnector, TransportEvent, TransportHandle},
};

pub const TEST_API_URL: &str = "http://chat.test";
pub const TEST_TOKEN: &str = "secret-token";

/// The test's end of a channel opened through [`MockConnector`]. Dropping
/// `events` looks like a dead socket to the manager, so keep it alive.
pub struct MockChannel {
    pub url: Url,
    pub events: mpsc::UnboundedSender<TransportEvent>,
    pub commands: mpsc::UnboundedReceiver<TransportCommand>,
}

impl MockChannel {
    pub fn push(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.push(TransportEvent::Text(text.into()));
    }

    pub fn close(&self, code: u16) {
        self.push(TransportEvent::Closed {
            code,
            reason: String::new(),
        });
    }
}

pub struct MockConnector {
    opened: mpsc::UnboundedSender<MockChannel>,
    fail_with: Option<String>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockChannel>) {
        let (opened, opened_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                opened,
                fail_with: None,
            }),
            opened_rx,
        )
    }

    pub fn failing(err: impl Into<String>) -> Arc<Self> {
        let (opened, _) = mpsc::unbounded_channel();
        Arc::new(Self {
            opened,
            fail_with: Some(err.into()),
        })
    }
}

impl TransportConnector for MockConnector {
    fn open(&self, url: &Url) -> Result<TransportHandle> {
        if let Some(err) = &self.fail_with {
            return Err(anyhow!(err.clone()));
        }
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        self.opened
            .send(MockChannel {
                url: url.clone(),
                events: event_tx,
                commands: command_rx,
            })
            .map_err(|_| anyhow!("test dropped the channel receiver"))?;
        Ok(TransportHandle {
            commands: command_tx,
            events: event_rx,
        })
    }
}

pub struct StaticCredentials {
    token: Option<String>,
    user_id: Option<UserId>,
}

impl StaticCredentials {
    pub fn logged_in(user_id: i64) -> Arc<Self> {
        Self::with_token(TEST_TOKEN, user_id)
    }

    pub fn with_token(token: &str, user_id: i64) -> Arc<Self> {
        Arc::new(Self {
            token: Some(token.to_string()),
            user_id: Some(UserId(user_id)),
        })
    }

    pub fn anonymous() -> Arc<Self> {
        Arc::new(Self {
            token: None,
            user_id: None,
        })
    }
}

impl CredentialSource for StaticCredentials {
    fn token(&self) -> Option<String> {
        self.token.clone()
    }

    fn current_user_id(&self) -> Option<UserId> {
        self.user_id
    }
}

pub fn test_policy() -> ReconnectPolicy {
    ReconnectPolicy::default()
}

pub fn manager_with(
    connector: Arc<dyn TransportConnector>,
    credentials: Arc<dyn CredentialSource>,
) -> Arc<ConnectionManager> {
    ConnectionManager::new(TEST_API_URL, test_policy(), connector, credentials, 64)
}

pub fn message(id: i64, conversation_id: i64, content: &str) -> Message {
    Message {
        id: MessageId(id),
        content: content.to_string(),
        sender_id: UserId(2),
        sender_name: "Bob Builder".to_string(),
        conversation_id: ConversationId(conversation_id),
        created_at: Utc
            .with_ymd_and_hms(2024, 5, 1, 10, 0, 0)
            .single()
            .expect("timestamp"),
    }
}

pub fn message_frame(id: i64, conversation_id: i64, content: &str) -> String {
    json!({
        "type": "message",
        "id": id,
        "content": content,
        "sender_id": 2,
        "sender_name": "Bob Builder",
        "conversation_id": conversation_id,
        "created_at": "2024-05-01T10:00:00"
    })
    .to_string()
}

pub async fn next_event(events: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
    events.recv().await.expect("connection event")
}

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::domain::{ConversationId, MessageId, UserId, UserSummary};

/// Close code sent by a client that hangs up on purpose.
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_INVALID_TOKEN: u16 = 4000;
pub const CLOSE_UNAUTHENTICATED: u16 = 4001;
pub const CLOSE_FORBIDDEN: u16 = 4003;
pub const CLOSE_NOT_FOUND: u16 = 4004;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalClose {
    InvalidCredential,
    NotAuthorized,
    ConversationNotFound,
}

/// How the client must react to a live channel close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    Normal,
    Fatal(FatalClose),
    Retryable,
}

impl CloseDisposition {
    pub fn from_code(code: u16) -> Self {
        match code {
            CLOSE_NORMAL => Self::Normal,
            CLOSE_INVALID_TOKEN | CLOSE_UNAUTHENTICATED => Self::Fatal(FatalClose::InvalidCredential),
            CLOSE_FORBIDDEN => Self::Fatal(FatalClose::NotAuthorized),
            CLOSE_NOT_FOUND => Self::Fatal(FatalClose::ConversationNotFound),
            _ => Self::Retryable,
        }
    }
}

/// Parses backend timestamps. Values without an offset are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub title: String,
    #[serde(deserialize_with = "lenient_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participants: Option<Vec<UserSummary>>,
    /// Counterpart name resolved on the client after participants load.
    #[serde(skip)]
    pub display_name: Option<String>,
}

impl Conversation {
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.title)
    }

    /// True when the cached participant list is exactly `{a, b}`.
    pub fn is_direct_between(&self, a: UserId, b: UserId) -> bool {
        let Some(participants) = &self.participants else {
            return false;
        };
        participants.len() == 2
            && participants.iter().any(|p| p.id == a)
            && participants.iter().any(|p| p.id == b)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub content: String,
    pub sender_id: UserId,
    pub sender_name: String,
    pub conversation_id: ConversationId,
    #[serde(deserialize_with = "lenient_timestamp")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateConversationRequest {
    pub participant_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub user: UserSummary,
}

/// Frame pushed by the server over a conversation's live channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEnvelope {
    Connection(ConnectionAck),
    Message(MessageFrame),
    UserLeft(UserLeftFrame),
    Error(ErrorFrame),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionAck {
    pub status: Option<String>,
    pub conversation_id: Option<ConversationId>,
    pub user_id: Option<UserId>,
    pub message: Option<String>,
}

/// Message frame as sent on the wire. Every field is optional so a partial
/// frame can be recognised and dropped instead of failing the whole parse.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageFrame {
    pub id: Option<MessageId>,
    pub content: Option<String>,
    pub sender_id: Option<UserId>,
    pub sender_name: Option<String>,
    pub conversation_id: Option<ConversationId>,
    pub created_at: Option<String>,
}

impl MessageFrame {
    /// Returns `None` when a required field is missing, blank or unparseable.
    /// Frames without a conversation id are attributed to `channel_scope`.
    pub fn into_message(self, channel_scope: ConversationId) -> Option<Message> {
        let content = self.content.filter(|c| !c.is_empty())?;
        let sender_name = self.sender_name.filter(|n| !n.is_empty())?;
        let created_at = parse_timestamp(self.created_at.as_deref()?)?;
        Some(Message {
            id: self.id?,
            content,
            sender_id: self.sender_id?,
            sender_name,
            conversation_id: self.conversation_id.unwrap_or(channel_scope),
            created_at,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserLeftFrame {
    pub user_id: Option<UserId>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub message: Option<String>,
}

/// Frame the client writes to the live channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    pub content: String,
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    #[test]
    fn classifies_close_codes() {
        assert_eq!(CloseDisposition::from_code(1000), CloseDisposition::Normal);
        assert_eq!(
            CloseDisposition::from_code(4000),
            CloseDisposition::Fatal(FatalClose::InvalidCredential)
        );
        assert_eq!(
            CloseDisposition::from_code(4001),
            CloseDisposition::Fatal(FatalClose::InvalidCredential)
        );
        assert_eq!(
            CloseDisposition::from_code(4003),
            CloseDisposition::Fatal(FatalClose::NotAuthorized)
        );
        assert_eq!(
            CloseDisposition::from_code(4004),
            CloseDisposition::Fatal(FatalClose::ConversationNotFound)
        );
        for code in [1001, 1005, 1006, 1011, 4002, 4500] {
            assert_eq!(CloseDisposition::from_code(code), CloseDisposition::Retryable);
        }
    }

    #[test]
    fn parses_naive_and_offset_timestamps() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).single().expect("ts");
        assert_eq!(parse_timestamp("2024-05-01T10:00:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01T10:00:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01T12:00:00+02:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01 10:00:00"), Some(expected));
        assert!(parse_timestamp("2024-05-01T10:00:00.123456").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn decodes_message_envelope() {
        let raw = json!({
            "type": "message",
            "id": 9,
            "content": "hi",
            "sender_id": 2,
            "sender_name": "Bob",
            "conversation_id": 4,
            "created_at": "2024-05-01T10:00:00"
        });
        let envelope: InboundEnvelope = serde_json::from_value(raw).expect("envelope");
        let InboundEnvelope::Message(frame) = envelope else {
            panic!("expected message frame");
        };
        let message = frame.into_message(ConversationId(99)).expect("valid message");
        assert_eq!(message.id, MessageId(9));
        assert_eq!(message.conversation_id, ConversationId(4));
    }

    #[test]
    fn message_frame_requires_all_fields() {
        let frame = MessageFrame {
            id: Some(MessageId(1)),
            content: Some("hi".into()),
            sender_id: Some(UserId(2)),
            sender_name: None,
            conversation_id: Some(ConversationId(4)),
            created_at: Some("2024-05-01T10:00:00".into()),
        };
        assert!(frame.into_message(ConversationId(4)).is_none());

        let blank = MessageFrame {
            id: Some(MessageId(1)),
            content: Some(String::new()),
            sender_id: Some(UserId(2)),
            sender_name: Some("Bob".into()),
            conversation_id: None,
            created_at: Some("2024-05-01T10:00:00".into()),
        };
        assert!(blank.into_message(ConversationId(4)).is_none());
    }

    #[test]
    fn message_frame_without_conversation_uses_channel_scope() {
        let frame = MessageFrame {
            id: Some(MessageId(1)),
            content: Some("hi".into()),
            sender_id: Some(UserId(2)),
            sender_name: Some("Bob".into()),
            conversation_id: None,
            created_at: Some("2024-05-01T10:00:00Z".into()),
        };
        let message = frame.into_message(ConversationId(12)).expect("message");
        assert_eq!(message.conversation_id, ConversationId(12));
    }

    #[test]
    fn unknown_envelope_type_is_recognised() {
        let envelope: InboundEnvelope =
            serde_json::from_str(r#"{"type":"typing","user_id":3}"#).expect("envelope");
        assert!(matches!(envelope, InboundEnvelope::Unknown));
    }

    #[test]
    fn conversation_reads_backend_shape() {
        let raw = json!({
            "id": 3,
            "title": "Chat",
            "created_at": "2024-05-01T10:00:00",
            "participants": [
                {"id": 1, "username": "me", "first_name": "Me", "last_name": "Myself", "email": "me@x"},
                {"id": 2, "username": "bob", "first_name": "Bob", "last_name": "Builder"}
            ]
        });
        let conversation: Conversation = serde_json::from_value(raw).expect("conversation");
        assert!(conversation.is_direct_between(UserId(1), UserId(2)));
        assert!(!conversation.is_direct_between(UserId(1), UserId(3)));
        assert_eq!(conversation.label(), "Chat");
    }
}

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);
id_newtype!(MessageId);

/// Public profile of a platform user as returned by participant and friend
/// listings. Extra fields sent by the backend (email, role, ...) are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

impl UserSummary {
    /// "First Last", falling back to the username when both name parts are
    /// blank.
    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.first_name.trim(), self.last_name.trim());
        let full = full.trim();
        if full.is_empty() {
            self.username.clone()
        } else {
            full.to_string()
        }
    }
}

/// First participant that is not `current_user`.
pub fn counterpart(participants: &[UserSummary], current_user: Option<UserId>) -> Option<&UserSummary> {
    participants
        .iter()
        .find(|participant| Some(participant.id) != current_user)
}

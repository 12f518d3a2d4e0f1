//! Client core for the conversation view: the live channel lifecycle, the REST
//! collaborators it falls back to, and the session state that ties them
//! together.

pub mod api;
pub mod auth;
pub mod config;
pub mod connection;
pub mod session;
pub mod transport;

pub use api::{ConversationApi, FriendDirectory, HttpConversationApi, MissingFriendDirectory};
pub use auth::{AuthSession, Credential, CredentialSource};
pub use config::{load_settings, Settings};
pub use connection::{
    live_channel_url, ConnectionError, ConnectionEvent, ConnectionManager, ConnectionStatus,
    ReconnectPolicy,
};
pub use session::{ConversationSession, SessionError, SessionEvent, SessionSnapshot};
pub use transport::{
    TransportCommand, TransportConnector, TransportEvent, TransportHandle, TungsteniteConnector,
};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod connection_tests;

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod session_tests;

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod transport_tests;

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod api_tests;

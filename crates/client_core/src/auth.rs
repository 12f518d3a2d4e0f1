use std::sync::{PoisonError, RwLock, RwLockReadGuard};

use anyhow::Result;
use reqwest::Client;
use shared::{
    domain::{UserId, UserSummary},
    protocol::TokenResponse,
};
use tracing::info;

use crate::api::decode_response;

/// Source of the bearer credential and the identity it belongs to.
pub trait CredentialSource: Send + Sync {
    fn token(&self) -> Option<String>;
    fn current_user_id(&self) -> Option<UserId>;

    fn has_credential(&self) -> bool {
        self.token().is_some()
    }
}

#[derive(Debug, Clone)]
pub struct Credential {
    pub access_token: String,
    pub user: UserSummary,
}

/// In-memory login state shared by the REST client and the live channel.
#[derive(Debug, Default)]
pub struct AuthSession {
    credential: RwLock<Option<Credential>>,
}

impl AuthSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: Credential) -> Self {
        Self {
            credential: RwLock::new(Some(credential)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<Credential>> {
        self.credential.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, credential: Credential) {
        *self.credential.write().unwrap_or_else(PoisonError::into_inner) = Some(credential);
    }

    pub fn clear(&self) {
        *self.credential.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn current_user(&self) -> Option<UserSummary> {
        self.read().as_ref().map(|credential| credential.user.clone())
    }

    /// Exchanges username/password for a bearer token and stores it.
    pub async fn login(
        &self,
        http: &Client,
        api_url: &str,
        username: &str,
        password: &str,
    ) -> Result<UserSummary> {
        let response = http
            .post(format!("{}/auth/token", api_url.trim_end_matches('/')))
            .form(&[("username", username), ("password", password)])
            .send()
            .await?;
        let body: TokenResponse = decode_response(response).await?;
        info!(user_id = body.user.id.0, "logged in");
        let user = body.user.clone();
        self.set(Credential {
            access_token: body.access_token,
            user: body.user,
        });
        Ok(user)
    }
}

impl CredentialSource for AuthSession {
    fn token(&self) -> Option<String> {
        self.read()
            .as_ref()
            .map(|credential| credential.access_token.clone())
    }

    fn current_user_id(&self) -> Option<UserId> {
        self.read().as_ref().map(|credential| credential.user.id)
    }
}

use secrecy::{ExposeSecret, SecretString};
use std::sync::RwLock;
use tracing::{debug, warn};

use crate::model::UserId;

/// Who is signed in right now. `None` means anonymous.
pub trait IdentityProvider: Send + Sync {
    fn current_user(&self) -> Option<UserId>;
}

/// Runtime-only credentials. Never serialized; the shell keeps the token in
/// its keystore and hands it over on sign-in.
#[derive(Debug)]
pub struct Session {
    pub user_id: UserId,
    pub token: SecretString,
}

impl Session {
    pub fn new(user_id: UserId, token: impl Into<String>) -> Self {
        Self {
            user_id,
            token: SecretString::new(token.into()),
        }
    }
}

/// In-memory session holder shared between the network glue and the core.
#[derive(Debug, Default)]
pub struct SessionIdentity {
    session: RwLock<Option<Session>>,
}

impl SessionIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed_in(user_id: UserId, token: impl Into<String>) -> Self {
        Self {
            session: RwLock::new(Some(Session::new(user_id, token))),
        }
    }

    pub fn sign_in(&self, user_id: UserId, token: impl Into<String>) {
        match self.session.write() {
            Ok(mut guard) => {
                debug!(user_id = %user_id, "session started");
                *guard = Some(Session::new(user_id, token));
            }
            Err(_) => warn!("session lock poisoned; sign-in ignored"),
        }
    }

    /// Returns the user that was signed in, if any.
    pub fn sign_out(&self) -> Option<UserId> {
        match self.session.write() {
            Ok(mut guard) => guard.take().map(|s| s.user_id),
            Err(_) => {
                warn!("session lock poisoned; sign-out ignored");
                None
            }
        }
    }

    /// `Authorization` header value for authenticated requests.
    pub fn bearer_header(&self) -> Option<String> {
        let guard = self.session.read().ok()?;
        guard
            .as_ref()
            .map(|s| format!("Bearer {}", s.token.expose_secret()))
    }
}

impl IdentityProvider for SessionIdentity {
    fn current_user(&self) -> Option<UserId> {
        self.session
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|s| s.user_id.clone()))
    }
}

//! Identity pass-through.
//!
//! The identity provider is an opaque collaborator. [`AuthSession`] tracks who is signed
//! in and reduces provider failures to a logged "login failed" / "logout failed".

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info};

use crate::message::Author;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// The user dismissed the sign-in.
    #[error("Sign-in cancelled")]
    Cancelled,

    #[error("Identity provider error: {0}")]
    Provider(String),
}

/// External sign-in provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Returns `None` when the user cancels.
    async fn sign_in(&self) -> Result<Option<Author>, IdentityError>;

    async fn sign_out(&self) -> Result<(), IdentityError>;
}

/// The signed-in user, if any.
pub struct AuthSession {
    provider: Arc<dyn IdentityProvider>,
    user: RwLock<Option<Author>>,
}

impl AuthSession {
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        Self {
            provider,
            user: RwLock::new(None),
        }
    }

    /// Sign in. Failures are logged and leave the current user unchanged.
    pub async fn login(&self) -> Option<Author> {
        match self.provider.sign_in().await {
            Ok(Some(author)) => {
                info!(uid = %author.uid, "Signed in");
                self.set_user(Some(author.clone()));
                Some(author)
            }
            Ok(None) | Err(IdentityError::Cancelled) => None,
            Err(e) => {
                error!(error = %e, "Login failed");
                None
            }
        }
    }

    pub async fn logout(&self) {
        match self.provider.sign_out().await {
            Ok(()) => {
                info!("Signed out");
                self.set_user(None);
            }
            Err(e) => error!(error = %e, "Logout failed"),
        }
    }

    pub fn current_user(&self) -> Option<Author> {
        self.user.read().ok().and_then(|user| user.clone())
    }

    fn set_user(&self, author: Option<Author>) {
        if let Ok(mut user) = self.user.write() {
            *user = author;
        }
    }
}

impl std::fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSession")
            .field("user", &self.current_user())
            .finish_non_exhaustive()
    }
}

/// Provider that always resolves to a fixed outcome.
#[derive(Debug, Clone)]
pub struct StaticIdentityProvider {
    sign_in: Result<Option<Author>, IdentityError>,
    sign_out: Result<(), IdentityError>,
}

impl StaticIdentityProvider {
    /// Signs in as `author`.
    pub fn signed_in(author: Author) -> Self {
        Self {
            sign_in: Ok(Some(author)),
            sign_out: Ok(()),
        }
    }

    /// The user cancels every sign-in.
    pub fn cancelling() -> Self {
        Self {
            sign_in: Ok(None),
            sign_out: Ok(()),
        }
    }

    /// Every call fails with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        let e = IdentityError::Provider(message.into());
        Self {
            sign_in: Err(e.clone()),
            sign_out: Err(e),
        }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn sign_in(&self) -> Result<Option<Author>, IdentityError> {
        self.sign_in.clone()
    }

    async fn sign_out(&self) -> Result<(), IdentityError> {
        self.sign_out.clone()
    }
}

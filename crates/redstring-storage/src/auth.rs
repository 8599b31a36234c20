// auth.rs — Credential lifecycle for the remote tier.
//
// An `AuthContext` is the token the provider sends plus how it was obtained
// and when it expires. App-installation tokens are short-lived and carry an
// expiry; OAuth tokens usually do not. A `CredentialSource` hands out the
// current context and can be asked to refresh it after a 401.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{to_chrono, SharedClock, SystemClock};
use crate::error::StorageError;

/// How the credential was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    AppInstallation,
    Oauth,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::AppInstallation => write!(f, "app-installation"),
            AuthMethod::Oauth => write!(f, "oauth"),
        }
    }
}

/// A credential for the remote tier.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthContext {
    pub token: String,
    pub method: AuthMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthContext {
    pub fn oauth(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            method: AuthMethod::Oauth,
            expires_at: None,
        }
    }

    pub fn app_installation(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            method: AuthMethod::AppInstallation,
            expires_at: Some(expires_at),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    /// True if the token expires within `skew` of `now` (or already has).
    pub fn expires_within(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        self.expires_at
            .is_some_and(|exp| exp <= now + to_chrono(skew))
    }
}

// Tokens never appear in logs.
impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthContext")
            .field("token", &"<redacted>")
            .field("method", &self.method)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Supplies credentials to the remote provider.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// The credential to use right now.
    async fn current(&self) -> Result<AuthContext, StorageError>;

    /// Obtain a fresh credential after the current one was rejected or is
    /// about to expire.
    async fn refresh(&self) -> Result<AuthContext, StorageError>;
}

/// A fixed credential, optionally replaced later via [`StaticCredentials::set`].
///
/// `refresh` cannot mint new tokens: it returns the stored context unless it
/// has expired, in which case the caller must re-authenticate. Expiry is
/// judged against the source's clock; give it the provider's clock with
/// [`StaticCredentials::with_clock`] so both agree.
pub struct StaticCredentials {
    context: Mutex<Option<AuthContext>>,
    clock: SharedClock,
}

impl StaticCredentials {
    pub fn new(context: AuthContext) -> Self {
        Self {
            context: Mutex::new(Some(context)),
            clock: SystemClock::shared(),
        }
    }

    /// A source with no credential; every request fails with `Auth`.
    pub fn empty() -> Self {
        Self {
            context: Mutex::new(None),
            clock: SystemClock::shared(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn set(&self, context: AuthContext) {
        if let Ok(mut guard) = self.context.lock() {
            *guard = Some(context);
        }
    }

    fn get(&self) -> Option<AuthContext> {
        self.context.lock().ok().and_then(|c| c.clone())
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn current(&self) -> Result<AuthContext, StorageError> {
        self.get()
            .ok_or_else(|| StorageError::Auth("no credential configured".to_string()))
    }

    async fn refresh(&self) -> Result<AuthContext, StorageError> {
        match self.get() {
            Some(ctx) if !ctx.is_expired(self.clock.now()) => Ok(ctx),
            Some(ctx) => Err(StorageError::Auth(format!(
                "{} token expired; re-authentication required",
                ctx.method
            ))),
            None => Err(StorageError::Auth("no credential configured".to_string())),
        }
    }
}

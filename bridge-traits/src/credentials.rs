//! Credential Source Abstraction
//!
//! The engine never issues credentials itself. Hosts plug in whatever
//! produces a bearer token (personal access token, OAuth session, ...).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

/// A bearer credential attached to every remote request.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    /// When the token stops being accepted, if known
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Check whether the credential expires within `buffer_seconds`.
    ///
    /// Credentials without an expiry never expire.
    pub fn is_expired_with_buffer(&self, buffer_seconds: i64) -> bool {
        match self.expires_at {
            Some(expires_at) => Utc::now() >= expires_at - chrono::Duration::seconds(buffer_seconds),
            None => false,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Supplies and refreshes the bearer credential.
///
/// # Example
///
/// ```ignore
/// struct SessionCredentials { session: Session }
///
/// #[async_trait]
/// impl CredentialSource for SessionCredentials {
///     async fn current(&self) -> Result<Credential> {
///         Ok(Credential::new(self.session.access_token()))
///     }
///
///     async fn refresh(&self) -> Result<Credential> {
///         let token = self.session.refresh().await?;
///         Ok(Credential::new(token))
///     }
/// }
/// ```
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Return the credential currently considered valid.
    async fn current(&self) -> Result<Credential>;

    /// Obtain a fresh credential, e.g. after the remote API rejected the
    /// current one with 401.
    async fn refresh(&self) -> Result<Credential>;
}

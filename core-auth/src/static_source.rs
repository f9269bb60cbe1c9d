//! Fixed-token credential source.

use async_trait::async_trait;
use bridge_traits::error::Result;
use bridge_traits::{Credential, CredentialSource};

/// Serves one long-lived token, such as a personal access token.
///
/// Refreshing returns the same token, so a rejected token surfaces as an
/// authentication error after the single retry.
#[derive(Clone)]
pub struct StaticCredentialSource {
    credential: Credential,
}

impl StaticCredentialSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            credential: Credential::new(token),
        }
    }
}

impl std::fmt::Debug for StaticCredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentialSource")
            .field("credential", &self.credential)
            .finish()
    }
}

#[async_trait]
impl CredentialSource for StaticCredentialSource {
    async fn current(&self) -> Result<Credential> {
        Ok(self.credential.clone())
    }

    async fn refresh(&self) -> Result<Credential> {
        Ok(self.credential.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_refresh_returns_same_token() {
        let source = StaticCredentialSource::new("pat_123");
        assert_eq!(source.current().await.unwrap().token, "pat_123");
        assert_eq!(source.refresh().await.unwrap().token, "pat_123");
    }

    #[test]
    fn test_debug_hides_token() {
        let source = StaticCredentialSource::new("pat_secret");
        assert!(!format!("{:?}", source).contains("pat_secret"));
    }
}

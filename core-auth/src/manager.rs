//! # Credential Manager
//!
//! Caches the bearer credential and coordinates refreshes.
//!
//! ## Overview
//!
//! Every transport request asks the `CredentialManager` for a token. The
//! first call loads the credential from the host's source. Credentials that
//! expire within [`TOKEN_REFRESH_BUFFER`] are refreshed before use, and a 401
//! response calls [`CredentialManager::force_refresh`] with the rejected
//! token. Refreshes are serialized: callers that queued behind a refresh
//! reuse its result instead of refreshing again.
//!
//! ## Usage
//!
//! ```no_run
//! use core_auth::{CredentialManager, StaticCredentialSource};
//! use core_runtime::events::EventBus;
//! use std::sync::Arc;
//!
//! # async fn demo() -> core_auth::Result<()> {
//! let manager = CredentialManager::new(
//!     Arc::new(StaticCredentialSource::new("pat_123")),
//!     EventBus::default(),
//! );
//! let token = manager.access_token().await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{AuthError, Result};
use bridge_traits::{Credential, CredentialSource};
use core_runtime::events::{AuthEvent, CoreEvent, EventBus};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, instrument};

/// Credentials expiring within this window are refreshed before use (60 s)
pub const TOKEN_REFRESH_BUFFER: Duration = Duration::from_secs(60);

/// Upper bound on one call into the credential source (2 minutes)
const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(120);

/// Caching, single-flight wrapper around a [`CredentialSource`].
#[derive(Clone)]
pub struct CredentialManager {
    source: Arc<dyn CredentialSource>,
    event_bus: EventBus,
    cached: Arc<RwLock<Option<Credential>>>,
    /// Serializes loads and refreshes
    refresh_lock: Arc<Mutex<()>>,
}

impl CredentialManager {
    pub fn new(source: Arc<dyn CredentialSource>, event_bus: EventBus) -> Self {
        Self {
            source,
            event_bus,
            cached: Arc::new(RwLock::new(None)),
            refresh_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Returns a usable bearer token, loading or refreshing as needed.
    #[instrument(skip(self))]
    pub async fn access_token(&self) -> Result<String> {
        if let Some(credential) = self.cached.read().await.as_ref() {
            if !Self::needs_refresh(credential) {
                return Ok(credential.token.clone());
            }
        }

        let _guard = self.refresh_lock.lock().await;

        // Another caller may have loaded or refreshed while we waited
        let cached = self.cached.read().await.clone();
        match cached {
            Some(credential) if !Self::needs_refresh(&credential) => Ok(credential.token),
            Some(_) => {
                info!("Credential expired or expiring soon, refreshing");
                self.refresh_locked().await
            }
            None => {
                debug!("Loading credential from source");
                let credential = timeout(DEFAULT_AUTH_TIMEOUT, self.source.current())
                    .await
                    .map_err(|_| AuthError::OperationTimeout {
                        operation: "credential load".to_string(),
                    })?
                    .map_err(|e| AuthError::from_bridge(e, false))?;

                if Self::needs_refresh(&credential) {
                    *self.cached.write().await = Some(credential);
                    return self.refresh_locked().await;
                }

                let token = credential.token.clone();
                *self.cached.write().await = Some(credential);
                Ok(token)
            }
        }
    }

    /// Refresh after the remote API rejected `rejected_token`.
    ///
    /// When another caller already replaced the rejected token, the current
    /// token is returned without a second refresh.
    #[instrument(skip(self, rejected_token))]
    pub async fn force_refresh(&self, rejected_token: &str) -> Result<String> {
        let _guard = self.refresh_lock.lock().await;

        if let Some(credential) = self.cached.read().await.as_ref() {
            if credential.token != rejected_token {
                debug!("Credential already refreshed by a concurrent request");
                return Ok(credential.token.clone());
            }
        }

        self.refresh_locked().await
    }

    /// Drop the cached credential; the next request reloads it.
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }

    fn needs_refresh(credential: &Credential) -> bool {
        credential.is_expired_with_buffer(TOKEN_REFRESH_BUFFER.as_secs() as i64)
    }

    // Caller must hold `refresh_lock`.
    async fn refresh_locked(&self) -> Result<String> {
        let _ = self
            .event_bus
            .emit(CoreEvent::Auth(AuthEvent::TokenRefreshing));

        let refreshed = match timeout(DEFAULT_AUTH_TIMEOUT, self.source.refresh()).await {
            Ok(Ok(credential)) => credential,
            Ok(Err(e)) => {
                error!("Token refresh failed: {}", e);
                let _ = self
                    .event_bus
                    .emit(CoreEvent::Auth(AuthEvent::RefreshFailed {
                        message: e.to_string(),
                    }));
                return Err(AuthError::from_bridge(e, true));
            }
            Err(_) => {
                error!("Token refresh timed out");
                let _ = self
                    .event_bus
                    .emit(CoreEvent::Auth(AuthEvent::RefreshFailed {
                        message: "Token refresh timeout".to_string(),
                    }));
                return Err(AuthError::OperationTimeout {
                    operation: "token refresh".to_string(),
                });
            }
        };

        let expires_at = refreshed.expires_at.map(|at| at.timestamp());
        let token = refreshed.token.clone();
        *self.cached.write().await = Some(refreshed);

        let _ = self
            .event_bus
            .emit(CoreEvent::Auth(AuthEvent::TokenRefreshed { expires_at }));

        info!("Token refreshed successfully");
        Ok(token)
    }
}

impl std::fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::{BridgeError, Result as BridgeResult};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    mockall::mock! {
        Source {}

        #[async_trait]
        impl CredentialSource for Source {
            async fn current(&self) -> BridgeResult<Credential>;
            async fn refresh(&self) -> BridgeResult<Credential>;
        }
    }

    struct CountingSource {
        refreshes: AtomicUsize,
    }

    #[async_trait]
    impl CredentialSource for CountingSource {
        async fn current(&self) -> BridgeResult<Credential> {
            Ok(Credential::new("token-0"))
        }

        async fn refresh(&self) -> BridgeResult<Credential> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Credential::new(format!("token-{}", n)))
        }
    }

    #[tokio::test]
    async fn test_loads_once_and_caches() {
        let mut source = MockSource::new();
        source
            .expect_current()
            .times(1)
            .returning(|| Ok(Credential::new("abc")));
        source.expect_refresh().never();

        let manager = CredentialManager::new(Arc::new(source), EventBus::default());
        assert_eq!(manager.access_token().await.unwrap(), "abc");
        assert_eq!(manager.access_token().await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_expiring_credential_is_refreshed() {
        let mut source = MockSource::new();
        source.expect_current().times(1).returning(|| {
            Ok(Credential::new("old").with_expiry(Utc::now() + chrono::Duration::seconds(5)))
        });
        source.expect_refresh().times(1).returning(|| {
            Ok(Credential::new("new").with_expiry(Utc::now() + chrono::Duration::hours(1)))
        });

        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let manager = CredentialManager::new(Arc::new(source), bus);

        assert_eq!(manager.access_token().await.unwrap(), "new");
        assert!(matches!(
            events.recv().await.unwrap(),
            CoreEvent::Auth(AuthEvent::TokenRefreshing)
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            CoreEvent::Auth(AuthEvent::TokenRefreshed { expires_at: Some(_) })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_force_refresh_is_single_flight() {
        let source = Arc::new(CountingSource {
            refreshes: AtomicUsize::new(0),
        });
        let manager = CredentialManager::new(source.clone(), EventBus::default());
        let rejected = manager.access_token().await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let rejected = rejected.clone();
            handles.push(tokio::spawn(async move {
                manager.force_refresh(&rejected).await.unwrap()
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), "token-1");
        }
        assert_eq!(source.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_emits_event() {
        let mut source = MockSource::new();
        source
            .expect_current()
            .returning(|| Ok(Credential::new("abc")));
        source
            .expect_refresh()
            .returning(|| Err(BridgeError::OperationFailed("revoked".to_string())));

        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let manager = CredentialManager::new(Arc::new(source), bus);
        manager.access_token().await.unwrap();

        let result = manager.force_refresh("abc").await;
        assert!(matches!(result, Err(AuthError::TokenRefreshFailed(_))));

        let _refreshing = events.recv().await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            CoreEvent::Auth(AuthEvent::RefreshFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_source_failure_is_credential_unavailable() {
        let mut source = MockSource::new();
        source
            .expect_current()
            .returning(|| Err(BridgeError::NotAvailable("keychain locked".to_string())));

        let manager = CredentialManager::new(Arc::new(source), EventBus::default());
        assert!(matches!(
            manager.access_token().await,
            Err(AuthError::CredentialUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_invalidate_reloads() {
        let mut source = MockSource::new();
        source
            .expect_current()
            .times(2)
            .returning(|| Ok(Credential::new("abc")));

        let manager = CredentialManager::new(Arc::new(source), EventBus::default());
        manager.access_token().await.unwrap();
        manager.invalidate().await;
        manager.access_token().await.unwrap();
    }
}

//! Authentication recovery: refresh credentials once and replay.

mod cookies;

pub use cookies::{CookieFile, CookieRecord};

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{OperationError, Result};

/// External collaborator that can mint fresh credentials for a domain,
/// typically by re-exporting cookies from a browser profile.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    /// Produce a fresh cookie file for `domain`.
    ///
    /// `Ok(None)` means no credentials exist for this domain (for example,
    /// the user never logged in there); errors mean the refresh itself broke.
    async fn refresh(&self, domain: &str) -> Result<Option<PathBuf>>;
}

/// Wraps one logical operation with bounded authentication recovery.
///
/// On the first authentication failure the coordinator refreshes credentials
/// for the target domain and replays the operation exactly once. A second
/// authentication failure, or a refresh that yields nothing, surfaces the
/// error unmodified: structurally invalid credentials (an account block, a
/// revoked login) must not loop.
pub struct AuthRecoveryCoordinator {
    refresher: Arc<dyn CredentialRefresher>,
}

impl AuthRecoveryCoordinator {
    pub fn new(refresher: Arc<dyn CredentialRefresher>) -> Self {
        Self { refresher }
    }

    /// Run `operation`, rebuilding it with fresh credentials after the first
    /// authentication failure.
    ///
    /// `operation` receives the cookie-file path to use and is invoked at
    /// most twice.
    pub async fn run<T, F, Fut>(
        &self,
        domain: &str,
        initial_cookies: Option<PathBuf>,
        operation: F,
    ) -> Result<T>
    where
        F: Fn(Option<PathBuf>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let reason = match operation(initial_cookies).await {
            Err(OperationError::Authentication(reason)) => reason,
            other => return other,
        };

        warn!(domain, %reason, "authentication failed, refreshing credentials");
        match self.refresher.refresh(domain).await {
            Ok(Some(cookies)) => {
                info!(domain, "replaying once with refreshed credentials");
                operation(Some(cookies)).await
            }
            Ok(None) => {
                warn!(domain, "no credentials available for domain");
                Err(OperationError::Authentication(reason))
            }
            Err(refresh_err) => {
                warn!(domain, error = %refresh_err, "credential refresh failed");
                Err(OperationError::Authentication(reason))
            }
        }
    }
}

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::send_api;
use crate::error::AuthError;

#[derive(Serialize)]
struct TokenRequest<'a> {
    app_id: &'a str,
    app_secret: &'a str,
}

/// Holds the current tenant access token.
///
/// The token has no locally known expiry; it is replaced only when the
/// reply path sees it rejected, or at startup.
pub struct TokenStore {
    client: reqwest::Client,
    url: String,
    app_id: String,
    app_secret: String,
    token: RwLock<Option<String>>,
    /// Serializes identity calls so concurrent expiries fetch once.
    refresh_lock: Mutex<()>,
}

impl TokenStore {
    pub fn new(client: reqwest::Client, base_url: &str, app_id: &str, app_secret: &str) -> Self {
        Self {
            client,
            url: format!(
                "{}/auth/v3/tenant_access_token/internal/",
                base_url.trim_end_matches('/')
            ),
            app_id: app_id.to_string(),
            app_secret: app_secret.to_string(),
            token: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    /// The currently held token, if any fetch has ever succeeded.
    pub async fn acquire(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    /// Fetch a fresh token and replace the held one.
    /// On failure the previous token is kept; the error is for logging only.
    pub async fn refresh(&self) -> Result<(), AuthError> {
        let _guard = self.refresh_lock.lock().await;
        self.fetch_and_store().await
    }

    /// Refresh only if the held token is still `rejected`, i.e. no other
    /// task replaced it while we were waiting for the lock.
    pub async fn refresh_if_stale(&self, rejected: Option<&str>) -> Result<(), AuthError> {
        let _guard = self.refresh_lock.lock().await;
        if self.token.read().await.as_deref() != rejected {
            debug!("Tenant access token already refreshed by another task");
            return Ok(());
        }
        self.fetch_and_store().await
    }

    async fn fetch_and_store(&self) -> Result<(), AuthError> {
        let request = TokenRequest {
            app_id: &self.app_id,
            app_secret: &self.app_secret,
        };

        let result = match send_api(&self.client, &self.url, &request, None).await {
            Ok(envelope) => envelope
                .get("tenant_access_token")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .ok_or(AuthError::MissingToken),
            Err(e) => Err(AuthError::from(e)),
        };

        match result {
            Ok(token) => {
                *self.token.write().await = Some(token);
                info!("Tenant access token refreshed");
                Ok(())
            }
            Err(e) => {
                warn!("Failed to refresh tenant access token: {}", e);
                Err(e)
            }
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use super::token::TokenStore;
use super::{send_api, INVALID_TOKEN_CODE};
use crate::config::ReplyConfig;
use crate::error::{PlatformError, ReplyError};

/// Posts a text reply to the conversation a message came from.
#[async_trait]
pub trait Replier: Send + Sync {
    async fn reply(&self, message_id: &str, text: &str) -> Result<(), ReplyError>;
}

#[derive(Debug, Serialize)]
struct ReplyRequest {
    /// JSON-encoded `{"text": ...}`; the platform wants a string here.
    content: String,
    msg_type: &'static str,
}

impl ReplyRequest {
    fn text(text: &str) -> Self {
        Self {
            content: json!({ "text": text }).to_string(),
            msg_type: "text",
        }
    }
}

pub struct ReplySender {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenStore>,
    max_token_refreshes: u32,
    retry_backoff: Duration,
}

impl ReplySender {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        tokens: Arc<TokenStore>,
        config: &ReplyConfig,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
            max_token_refreshes: config.max_token_refreshes,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    /// Delay before the `attempt`-th refresh (1-based): none for the first,
    /// then `retry_backoff`, doubling each time.
    fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        self.retry_backoff
            .saturating_mul(2u32.saturating_pow(attempt - 2))
    }
}

#[async_trait]
impl Replier for ReplySender {
    async fn reply(&self, message_id: &str, text: &str) -> Result<(), ReplyError> {
        let url = format!("{}/im/v1/messages/{}/reply", self.base_url, message_id);
        let body = ReplyRequest::text(text);
        let mut refreshes = 0u32;

        loop {
            let token = self.tokens.acquire().await;
            match send_api(&self.client, &url, &body, token.as_deref()).await {
                Ok(_) => {
                    info!("Replied to message {} ({} chars)", message_id, text.len());
                    return Ok(());
                }
                Err(PlatformError::Api { code, .. }) if code == INVALID_TOKEN_CODE => {
                    if refreshes >= self.max_token_refreshes {
                        return Err(ReplyError::TokenRefreshExhausted {
                            attempts: refreshes,
                        });
                    }
                    refreshes += 1;
                    warn!(
                        "Tenant access token rejected replying to {} (refresh {}/{})",
                        message_id, refreshes, self.max_token_refreshes
                    );

                    let delay = self.backoff_for(refreshes);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    // Failure is logged by the store; the retry will surface it.
                    let _ = self.tokens.refresh_if_stale(token.as_deref()).await;
                }
                Err(PlatformError::Api { code, msg }) => {
                    return Err(ReplyError::Platform { code, msg });
                }
                Err(PlatformError::Transport(e)) => {
                    return Err(ReplyError::Transport(e));
                }
            }
        }
    }
}

use thiserror::Error;

/// Failure of a single call through `feishu::send_api`.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("platform error {code}: {msg}")]
    Api { code: i64, msg: String },
}

impl From<reqwest::Error> for PlatformError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token request failed: {0}")]
    Transport(String),

    #[error("token request rejected ({code}): {msg}")]
    Platform { code: i64, msg: String },

    #[error("token response did not contain tenant_access_token")]
    MissingToken,
}

impl From<PlatformError> for AuthError {
    fn from(e: PlatformError) -> Self {
        match e {
            PlatformError::Transport(msg) => Self::Transport(msg),
            PlatformError::Api { code, msg } => Self::Platform { code, msg },
        }
    }
}

#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("reply transport error: {0}")]
    Transport(String),

    #[error("reply rejected ({code}): {msg}")]
    Platform { code: i64, msg: String },

    #[error("token still rejected after {attempts} refresh attempt(s)")]
    TokenRefreshExhausted { attempts: u32 },
}

/// Inbound webhook payload that could not be turned into an event.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("body is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("message content is not a JSON object: {0}")]
    InvalidContent(String),
}

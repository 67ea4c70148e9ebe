//! Feishu/Lark open platform client.
//!
//! Every open-apis call answers with an envelope `{"code": 0, "msg": "...", ...}`;
//! a non-zero `code` is an application error even when the HTTP status is 200,
//! and error bodies come back with 4xx statuses carrying the same envelope.

pub mod reply;
pub mod token;

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::PlatformError;

/// `code` returned when the bearer tenant access token is invalid or expired.
pub const INVALID_TOKEN_CODE: i64 = 99991661;

/// Build the shared HTTP client used for token and reply calls.
pub fn build_http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(timeout)
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// POST `body` as JSON to `url` and decode the response envelope.
/// Returns the whole envelope when `code == 0`.
pub async fn send_api<B: Serialize + ?Sized>(
    client: &reqwest::Client,
    url: &str,
    body: &B,
    bearer: Option<&str>,
) -> Result<Value, PlatformError> {
    let mut request = client.post(url).json(body);
    if let Some(token) = bearer {
        request = request.header("Authorization", format!("Bearer {}", token));
    }

    debug!("POST {}", url);
    let response = request.send().await?;
    let status = response.status();

    let envelope: Value = response.json().await.map_err(|e| {
        PlatformError::Transport(format!("malformed response (HTTP {}): {}", status, e))
    })?;

    let code = envelope
        .get("code")
        .and_then(Value::as_i64)
        .ok_or_else(|| {
            PlatformError::Transport(format!("response without code (HTTP {})", status))
        })?;

    if code != 0 {
        let msg = envelope
            .get("msg")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Err(PlatformError::Api { code, msg });
    }

    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::spawn_test_server;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use serde_json::json;

    async fn fake_platform() -> String {
        let app = Router::new()
            .route("/ok", post(|| async { Json(json!({"code": 0, "data": {"x": 1}})) }))
            .route(
                "/rejected",
                post(|| async {
                    (
                        StatusCode::BAD_REQUEST,
                        Json(json!({"code": 230002, "msg": "bot not in chat"})),
                    )
                }),
            )
            .route("/html", post(|| async { "<html>gateway</html>" }))
            .route("/nocode", post(|| async { Json(json!({"msg": "?"})) }));
        spawn_test_server(app).await
    }

    #[tokio::test]
    async fn test_send_api_success_returns_envelope() {
        let base = fake_platform().await;
        let client = build_http_client(Duration::from_secs(5));
        let envelope = send_api(&client, &format!("{}/ok", base), &json!({}), Some("t"))
            .await
            .unwrap();
        assert_eq!(envelope["data"]["x"], 1);
    }

    #[tokio::test]
    async fn test_send_api_nonzero_code_is_api_error() {
        let base = fake_platform().await;
        let client = build_http_client(Duration::from_secs(5));
        let err = send_api(&client, &format!("{}/rejected", base), &json!({}), None)
            .await
            .unwrap_err();
        match err {
            PlatformError::Api { code, msg } => {
                assert_eq!(code, 230002);
                assert_eq!(msg, "bot not in chat");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_api_malformed_body_is_transport_error() {
        let base = fake_platform().await;
        let client = build_http_client(Duration::from_secs(5));
        for path in ["html", "nocode"] {
            let err = send_api(&client, &format!("{}/{}", base, path), &json!({}), None)
                .await
                .unwrap_err();
            assert!(matches!(err, PlatformError::Transport(_)), "{}: {:?}", path, err);
        }
    }

    #[tokio::test]
    async fn test_send_api_connection_refused_is_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = build_http_client(Duration::from_secs(2));
        let err = send_api(&client, &format!("http://{}/x", addr), &json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Transport(_)));
    }
}

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::{AnswerConfig, AnswerProvider};

/// Final answer from the QA backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnswerResult {
    pub text: String,
    /// Source references as returned by the backend; not interpreted here.
    pub sources: Vec<Value>,
}

/// External question-answering service.
#[async_trait]
pub trait AnswerBridge: Send + Sync {
    async fn answer(&self, query: &str, history: &[(String, String)]) -> Result<AnswerResult>;
}

/// Build the bridge selected by `[answer] provider`.
pub fn from_config(config: &AnswerConfig) -> Arc<dyn AnswerBridge> {
    match config.provider {
        AnswerProvider::Http => Arc::new(HttpAnswerBridge::new(config.clone())),
        AnswerProvider::Echo => Arc::new(EchoBridge),
    }
}

#[derive(Debug, Serialize)]
struct AnswerRequest<'a> {
    knowledge_base_id: &'a str,
    question: &'a str,
    history: &'a [(String, String)],
    streaming: bool,
}

#[derive(Debug, Deserialize)]
struct AnswerResponse {
    #[serde(alias = "response")]
    answer: String,
    #[serde(default)]
    source_documents: Vec<Value>,
}

impl From<AnswerResponse> for AnswerResult {
    fn from(r: AnswerResponse) -> Self {
        Self {
            text: r.answer,
            sources: r.source_documents,
        }
    }
}

pub struct HttpAnswerBridge {
    client: reqwest::Client,
    config: AnswerConfig,
}

impl HttpAnswerBridge {
    pub fn new(config: AnswerConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, config }
    }
}

#[async_trait]
impl AnswerBridge for HttpAnswerBridge {
    async fn answer(&self, query: &str, history: &[(String, String)]) -> Result<AnswerResult> {
        let request = AnswerRequest {
            knowledge_base_id: &self.config.knowledge_base_id,
            question: query,
            history,
            streaming: self.config.streaming,
        };

        let url = self.config.endpoint();
        debug!("Sending question to answer backend: {}", url);

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Failed to send request to answer backend")?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!("Answer backend error ({}): {}", status, error_body);
        }

        let result = if self.config.streaming {
            last_streamed_answer(response).await?
        } else {
            response
                .json::<AnswerResponse>()
                .await
                .context("Failed to parse answer backend response")?
                .into()
        };

        info!(
            "Answer backend returned {} chars, {} source(s)",
            result.text.len(),
            result.sources.len()
        );
        Ok(result)
    }
}

/// Read a newline-delimited JSON stream where every line holds the
/// cumulative answer so far, and keep the last one.
async fn last_streamed_answer(response: reqwest::Response) -> Result<AnswerResult> {
    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut last: Option<AnswerResponse> = None;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Answer stream interrupted")?;
        buffer.extend_from_slice(&chunk);

        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            if let Some(partial) = parse_stream_line(&line)? {
                last = Some(partial);
            }
        }
    }

    if let Some(partial) = parse_stream_line(&buffer)? {
        last = Some(partial);
    }

    last.map(AnswerResult::from)
        .context("Answer backend stream ended without a result")
}

fn parse_stream_line(line: &[u8]) -> Result<Option<AnswerResponse>> {
    let text = std::str::from_utf8(line).context("Answer stream is not UTF-8")?;
    let text = text.trim();
    // Tolerate SSE framing as well as bare NDJSON.
    let text = text.strip_prefix("data:").map(str::trim).unwrap_or(text);
    if text.is_empty() {
        return Ok(None);
    }
    let partial = serde_json::from_str(text)
        .with_context(|| format!("Malformed answer stream line: {}", text))?;
    Ok(Some(partial))
}

/// Answers every query with the query itself.
pub struct EchoBridge;

#[async_trait]
impl AnswerBridge for EchoBridge {
    async fn answer(&self, query: &str, _history: &[(String, String)]) -> Result<AnswerResult> {
        Ok(AnswerResult {
            text: query.to_string(),
            sources: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::spawn_test_server;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use serde_json::json;

    fn config(base_url: String, streaming: bool) -> AnswerConfig {
        AnswerConfig {
            base_url,
            path: "/chat".to_string(),
            streaming,
            timeout_secs: 5,
            ..AnswerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_echo_bridge_returns_query() {
        let result = EchoBridge.answer("what is rust?", &[]).await.unwrap();
        assert_eq!(result.text, "what is rust?");
        assert!(result.sources.is_empty());
    }

    #[tokio::test]
    async fn test_http_bridge_single_response() {
        let app = Router::new().route(
            "/chat",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["question"], "hello");
                assert_eq!(body["knowledge_base_id"], "test");
                assert_eq!(body["history"], json!([]));
                assert_eq!(body["streaming"], false);
                Json(json!({
                    "question": "hello",
                    "response": "hi there",
                    "history": [],
                    "source_documents": [{"title": "doc.md"}]
                }))
            }),
        );
        let base = spawn_test_server(app).await;
        let bridge = HttpAnswerBridge::new(config(base, false));

        let result = bridge.answer("hello", &[]).await.unwrap();
        assert_eq!(result.text, "hi there");
        assert_eq!(result.sources, vec![json!({"title": "doc.md"})]);
    }

    #[tokio::test]
    async fn test_http_bridge_sends_history_pairs() {
        let app = Router::new().route(
            "/chat",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["history"], json!([["q1", "a1"]]));
                Json(json!({"answer": "ok"}))
            }),
        );
        let base = spawn_test_server(app).await;
        let bridge = HttpAnswerBridge::new(config(base, false));

        let history = vec![("q1".to_string(), "a1".to_string())];
        let result = bridge.answer("q2", &history).await.unwrap();
        assert_eq!(result.text, "ok");
    }

    #[tokio::test]
    async fn test_http_bridge_keeps_last_streamed_result() {
        let app = Router::new().route(
            "/chat",
            post(|| async {
                concat!(
                    "{\"answer\": \"Ru\"}\n",
                    "\n",
                    "data: {\"answer\": \"Rust is\"}\n",
                    "{\"answer\": \"Rust is a language\", \"source_documents\": [\"a.md\"]}"
                )
            }),
        );
        let base = spawn_test_server(app).await;
        let bridge = HttpAnswerBridge::new(config(base, true));

        let result = bridge.answer("rust?", &[]).await.unwrap();
        assert_eq!(result.text, "Rust is a language");
        assert_eq!(result.sources, vec![json!("a.md")]);
    }

    #[tokio::test]
    async fn test_http_bridge_empty_stream_is_error() {
        let app = Router::new().route("/chat", post(|| async { "\n\n" }));
        let base = spawn_test_server(app).await;
        let bridge = HttpAnswerBridge::new(config(base, true));
        assert!(bridge.answer("rust?", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_http_bridge_error_status() {
        let app = Router::new().route(
            "/chat",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "model not loaded") }),
        );
        let base = spawn_test_server(app).await;
        let bridge = HttpAnswerBridge::new(config(base, false));

        let err = bridge.answer("q", &[]).await.unwrap_err();
        assert!(err.to_string().contains("model not loaded"));
    }
}

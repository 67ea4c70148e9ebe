use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::answer::{self, AnswerBridge};
use crate::config::Config;
use crate::dedup::DedupCache;
use crate::feishu::{build_http_client, reply::Replier, reply::ReplySender, token::TokenStore};
use crate::webhook;

/// Shared application state, built once and handed to every handler.
pub struct AppState {
    pub dedup: Arc<DedupCache>,
    pub answer: Arc<dyn AnswerBridge>,
    pub replier: Arc<dyn Replier>,
    pub verification_token: Option<String>,
    /// In-flight event tasks; drained on shutdown.
    pub tasks: TaskTracker,
}

impl AppState {
    /// Wire up the platform client and fetch the first tenant access token.
    /// A failed first fetch is logged; the reply path retries it.
    pub async fn from_config(config: &Config) -> Self {
        let client = build_http_client(config.feishu.request_timeout());
        let tokens = Arc::new(TokenStore::new(
            client.clone(),
            &config.feishu.base_url,
            &config.feishu.app_id,
            &config.feishu.app_secret,
        ));
        if tokens.refresh().await.is_err() {
            warn!("Starting without a tenant access token");
        }

        let replier = ReplySender::new(client, &config.feishu.base_url, tokens, &config.reply);

        Self {
            dedup: Arc::new(DedupCache::new(config.dedup.ttl())),
            answer: answer::from_config(&config.answer),
            replier: Arc::new(replier),
            verification_token: config.feishu.verification_token.clone(),
            tasks: TaskTracker::new(),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", post(webhook::handle_callback))
        .route("/health", get(|| async { Json(json!({ "status": "ok" })) }))
        .with_state(state)
}

/// Serve until ctrl-c/SIGTERM, then stop the janitor and drain in-flight events.
pub async fn run(state: Arc<AppState>, bind: &str, sweep_interval: std::time::Duration) -> Result<()> {
    let shutdown = CancellationToken::new();
    let janitor = state
        .dedup
        .clone()
        .spawn_janitor(sweep_interval, shutdown.child_token());

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind to {}", bind))?;
    info!("Listening for callbacks on {}", bind);

    let serve_shutdown = shutdown.clone();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
        .await
        .context("Server error")?;

    shutdown.cancel();
    if let Err(e) = janitor.await {
        error!("Dedup janitor panicked: {}", e);
    }

    state.tasks.close();
    info!("Waiting for {} in-flight event(s)", state.tasks.len());
    state.tasks.wait().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to await ctrl-c: {}", e);
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received ctrl-c, shutting down"),
            _ = terminate.recv() => info!("Received SIGTERM, shutting down"),
            _ = shutdown.cancelled() => return,
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    error!("Failed to await ctrl-c: {}", e);
                }
            }
            _ = shutdown.cancelled() => return,
        }
    }
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::spawn_test_server;
    use axum::{body::Body, http::Request, http::StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    fn config_for(base_url: &str) -> Config {
        let mut config = Config::parse(
            r#"
[feishu]
app_id = "cli_test"
app_secret = "secret"

[answer]
provider = "echo"
"#,
        )
        .unwrap();
        config.feishu.base_url = base_url.to_string();
        config.feishu.request_timeout_secs = 2;
        config
    }

    #[tokio::test]
    async fn test_from_config_fetches_initial_token() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let app = Router::new().route(
            "/auth/v3/tenant_access_token/internal/",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Json(json!({"code": 0, "tenant_access_token": "t-1"}))
                }
            }),
        );
        let base = spawn_test_server(app).await;

        let state = AppState::from_config(&config_for(&base)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(state.verification_token.is_none());
    }

    #[tokio::test]
    async fn test_from_config_survives_unreachable_platform() {
        let state = AppState::from_config(&config_for("http://127.0.0.1:1")).await;
        assert_eq!(state.dedup.len().await, 0);
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let state = Arc::new(AppState::from_config(&config_for("http://127.0.0.1:1")).await);
        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

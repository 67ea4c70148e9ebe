use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AnswerProvider {
    #[default]
    Http,
    Echo,
}

impl std::fmt::Display for AnswerProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnswerProvider::Http => write!(f, "http"),
            AnswerProvider::Echo => write!(f, "echo"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_server_config")]
    pub server: ServerConfig,
    pub feishu: FeishuConfig,
    #[serde(default = "default_reply_config")]
    pub reply: ReplyConfig,
    #[serde(default = "default_dedup_config")]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub answer: AnswerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeishuConfig {
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_secret: String,
    #[serde(default = "default_feishu_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Compared against the `token` carried by every callback when set.
    #[serde(default)]
    pub verification_token: Option<String>,
}

impl FeishuConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReplyConfig {
    #[serde(default = "default_max_token_refreshes")]
    pub max_token_refreshes: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DedupConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl DedupConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnswerConfig {
    #[serde(default)]
    pub provider: AnswerProvider,
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_answer_path")]
    pub path: String,
    #[serde(default = "default_knowledge_base_id")]
    pub knowledge_base_id: String,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default = "default_answer_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AnswerConfig {
    fn default() -> Self {
        Self {
            provider: AnswerProvider::default(),
            base_url: String::new(),
            path: default_answer_path(),
            knowledge_base_id: default_knowledge_base_id(),
            streaming: false,
            timeout_secs: default_answer_timeout_secs(),
        }
    }
}

impl AnswerConfig {
    pub fn endpoint(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.path)
    }
}

fn default_bind() -> String {
    "0.0.0.0:7777".to_string()
}

fn default_feishu_base_url() -> String {
    "https://open.feishu.cn/open-apis".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_max_token_refreshes() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_ttl_secs() -> u64 {
    600
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_answer_path() -> String {
    "/local_doc_qa/local_doc_chat".to_string()
}

fn default_knowledge_base_id() -> String {
    "test".to_string()
}

fn default_answer_timeout_secs() -> u64 {
    120
}

fn default_server_config() -> ServerConfig {
    ServerConfig {
        bind: default_bind(),
    }
}

fn default_reply_config() -> ReplyConfig {
    ReplyConfig {
        max_token_refreshes: default_max_token_refreshes(),
        retry_backoff_ms: default_retry_backoff_ms(),
    }
}

fn default_dedup_config() -> DedupConfig {
    DedupConfig {
        ttl_secs: default_ttl_secs(),
        sweep_interval_secs: default_sweep_interval_secs(),
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config = Self::parse(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// App credentials may come from the environment instead of the file.
    fn apply_env_overrides(&mut self) {
        if let Ok(app_id) = std::env::var("FEISHU_APP_ID") {
            self.feishu.app_id = app_id;
        }
        if let Ok(app_secret) = std::env::var("FEISHU_APP_SECRET") {
            self.feishu.app_secret = app_secret;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.feishu.app_id.is_empty() || self.feishu.app_secret.is_empty() {
            anyhow::bail!("[feishu] app_id and app_secret must be set");
        }
        if self.dedup.ttl_secs == 0 || self.dedup.sweep_interval_secs == 0 {
            anyhow::bail!("[dedup] ttl_secs and sweep_interval_secs must be positive");
        }
        if self.answer.provider == AnswerProvider::Http && self.answer.base_url.is_empty() {
            anyhow::bail!("[answer] base_url is required for the http provider");
        }
        Ok(())
    }
}

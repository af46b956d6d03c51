use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;

pub const SESSION_KEY_PREFIX: &str = "mcp:session:";
pub const UPSTASH_URL_ENV: &str = "UPSTASH_REDIS_REST_URL";
pub const UPSTASH_TOKEN_ENV: &str = "UPSTASH_REDIS_REST_TOKEN";

pub fn session_key(session_id: &str) -> String {
    format!("{SESSION_KEY_PREFIX}{session_id}")
}

#[derive(Debug, Error)]
pub enum DurableStoreError {
    #[error("durable store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("durable store returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("durable store rejected command: {0}")]
    Command(String),
}

/// External key-value store holding harvested session id -> upstream URL.
///
/// Plain `set`/`get`; writes are last-writer-wins.
#[async_trait]
pub trait DurableStore: Send + Sync + fmt::Debug {
    async fn set(&self, key: &str, value: &str) -> Result<(), DurableStoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, DurableStoreError>;
}

#[derive(Debug, Clone)]
pub struct UpstashConfig {
    pub url: String,
    pub token: String,
}

impl UpstashConfig {
    /// Both variables must be present; anything less disables durable
    /// persistence.
    pub fn from_env() -> Option<Self> {
        let url = env_non_empty(UPSTASH_URL_ENV)?;
        let token = env_non_empty(UPSTASH_TOKEN_ENV)?;
        Some(Self { url, token })
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Redis over the Upstash REST command API.
#[derive(Clone)]
pub struct UpstashStore {
    client: reqwest::Client,
    url: String,
    token: String,
    ttl: Option<Duration>,
}

impl fmt::Debug for UpstashStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstashStore")
            .field("url", &self.url)
            .field("token", &"<redacted>")
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct UpstashReply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

impl UpstashStore {
    pub fn new(client: reqwest::Client, config: UpstashConfig, ttl: Option<Duration>) -> Self {
        Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            token: config.token,
            ttl,
        }
    }

    async fn command(&self, command: Value) -> Result<Option<Value>, DurableStoreError> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&command)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        let reply: UpstashReply = match serde_json::from_str(&body) {
            Ok(reply) => reply,
            Err(_) if !status.is_success() => {
                return Err(DurableStoreError::Status {
                    status: status.as_u16(),
                    body,
                })
            }
            Err(err) => return Err(DurableStoreError::Command(err.to_string())),
        };
        if let Some(error) = reply.error {
            return Err(DurableStoreError::Command(error));
        }
        if !status.is_success() {
            return Err(DurableStoreError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(reply.result)
    }
}

fn set_command(key: &str, value: &str, ttl: Option<Duration>) -> Value {
    match ttl {
        Some(ttl) => json!(["SET", key, value, "EX", ttl.as_secs().max(1).to_string()]),
        None => json!(["SET", key, value]),
    }
}

#[async_trait]
impl DurableStore for UpstashStore {
    async fn set(&self, key: &str, value: &str) -> Result<(), DurableStoreError> {
        self.command(set_command(key, value, self.ttl)).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, DurableStoreError> {
        let result = self.command(json!(["GET", key])).await?;
        Ok(match result {
            Some(Value::String(value)) => Some(value),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        })
    }
}

/// In-process store for local runs without Upstash credentials.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn set(&self, key: &str, value: &str) -> Result<(), DurableStoreError> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, DurableStoreError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }
}

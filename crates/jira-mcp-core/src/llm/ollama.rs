//! Ollama `/api/generate` client with a bounded response cache

use lru::LruCache;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{CompletionClient, CompletionRequest};
use crate::config::OllamaSettings;
use crate::error::{Error, Result};

const SERVICE: &str = "ollama";

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_ctx: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    message: Option<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Clone)]
struct CachedReply {
    text: String,
    inserted_at: Instant,
}

pub struct OllamaClient {
    http: Client,
    settings: OllamaSettings,
    /// `None` when caching is disabled (`OLLAMA_CACHE_SIZE=0`)
    cache: Option<Mutex<LruCache<String, CachedReply>>>,
}

impl OllamaClient {
    pub fn new(settings: OllamaSettings) -> Result<Self> {
        let http = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build Ollama HTTP client: {e}")))?;
        let cache = NonZeroUsize::new(settings.cache_size).map(|n| Mutex::new(LruCache::new(n)));

        Ok(Self {
            http,
            settings,
            cache,
        })
    }

    fn cache_key(&self, request: &CompletionRequest) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.settings.model.as_bytes());
        hasher.update([0u8]);
        hasher.update(request.system.as_deref().unwrap_or("").as_bytes());
        hasher.update([0u8]);
        hasher.update(request.prompt.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    async fn cached(&self, key: &str) -> Option<String> {
        let mut cache = self.cache.as_ref()?.lock().await;
        let fresh = match cache.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.settings.cache_ttl => {
                Some(entry.text.clone())
            }
            Some(_) => None,
            None => return None,
        };
        if fresh.is_none() {
            cache.pop(key);
        }
        fresh
    }

    async fn remember(&self, key: String, text: &str) {
        if let Some(cache) = &self.cache {
            cache.lock().await.put(
                key,
                CachedReply {
                    text: text.to_string(),
                    inserted_at: Instant::now(),
                },
            );
        }
    }

    fn transport_error(&self, error: reqwest::Error) -> Error {
        if error.is_timeout() {
            return Error::timeout("Ollama generation", self.settings.timeout);
        }
        Error::backend(
            SERVICE,
            format!("{} unreachable: {}", self.settings.base_url, error),
            error.is_connect() || error.is_request(),
        )
    }
}

#[async_trait::async_trait]
impl CompletionClient for OllamaClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let key = self.cache_key(&request);
        if let Some(text) = self.cached(&key).await {
            debug!(prompt_chars = request.prompt.len(), "Serving Ollama reply from cache");
            return Ok(text);
        }

        let body = GenerateRequest {
            model: &self.settings.model,
            prompt: &request.prompt,
            system: request.system.as_deref().unwrap_or(""),
            stream: false,
            options: GenerateOptions {
                temperature: self.settings.temperature,
                num_ctx: request.context_length,
            },
        };

        info!(
            model = %self.settings.model,
            prompt_chars = request.prompt.len(),
            "Sending prompt to Ollama"
        );
        let started = Instant::now();
        let response = self
            .http
            .post(format!("{}/api/generate", self.settings.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        let raw = response.text().await.map_err(|e| self.transport_error(e))?;
        if !status.is_success() {
            let snippet: String = raw.chars().take(300).collect();
            return Err(Error::backend(
                SERVICE,
                format!("generate failed with status {status}: {snippet}"),
                status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS,
            ));
        }

        let parsed: GenerateResponse = serde_json::from_str(&raw).map_err(|e| {
            Error::backend(SERVICE, format!("malformed generate response: {e}"), false)
        })?;
        let text = parsed
            .response
            .or_else(|| parsed.message.map(|m| m.content))
            .ok_or_else(|| Error::backend(SERVICE, "generate response has no text", false))?;

        debug!(elapsed = ?started.elapsed(), reply_chars = text.len(), "Received Ollama reply");
        self.remember(key, &text).await;
        Ok(text)
    }

    fn context_length(&self) -> u32 {
        self.settings.context_length
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/api/version", self.settings.base_url);
        match self.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(status = %response.status(), "Ollama version probe failed");
                false
            }
            Err(e) => {
                warn!(error = %e, "Ollama is not reachable");
                false
            }
        }
    }
}

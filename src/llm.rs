//! The LLM chat client.
//!
//! The orchestrator talks to the model through the [`ChatBackend`] trait so
//! tests can script replies; [`LlmClient`] is the production implementation,
//! a non-streaming `POST {base_url}/chat/completions` with bearer
//! authentication and bounded exponential-backoff retries for transient
//! failures.

use async_trait::async_trait;
use std::time::Duration;

use crate::retry::{RetryConfig, retry_with_backoff};
use crate::types::{ChatRequest, ChatResponse};
use crate::{Error, Result};

/// Anything that can answer one chat request.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Issues one chat-completion call and returns the parsed response.
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;
}

/// The production chat-completions client.
pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    retry: RetryConfig,
}

impl LlmClient {
    /// Builds a client for `base_url` with a per-request timeout.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let base_url = base_url.into();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(Error::config(
                "base_url must start with http:// or https://",
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(Error::Http)?;
        Ok(Self {
            http,
            base_url,
            api_key: api_key.into(),
            retry: RetryConfig::default(),
        })
    }

    /// Overrides the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn chat_once(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout
                } else {
                    Error::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            if status.as_u16() == 401 {
                return Err(Error::http_status(
                    401,
                    format!("{} (check that the API key is set and valid)", body),
                ));
            }
            return Err(Error::http_status(status.as_u16(), body));
        }

        Ok(response.json::<ChatResponse>().await?)
    }
}

#[async_trait]
impl ChatBackend for LlmClient {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        retry_with_backoff(self.retry.clone(), || self.chat_once(request)).await
    }
}

impl std::fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmClient")
            .field("base_url", &self.base_url)
            // Mask the key so debug output is safe to log.
            .field("api_key", &"***")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_rejects_bad_base_url() {
        assert!(LlmClient::new("localhost:1234", "key", Duration::from_secs(5)).is_err());
        assert!(LlmClient::new("http://localhost:1234/v1", "key", Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_debug_masks_api_key() {
        let client =
            LlmClient::new("http://localhost:1234/v1", "sk-secret", Duration::from_secs(5))
                .unwrap();
        let debug = format!("{:?}", client);
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("***"));
    }
}

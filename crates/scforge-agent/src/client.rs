//! Anthropic Messages API adapter
//!
//! Every call is a single fresh message: the prompt carries the
//! specification, and for repairs the failed source and its errors.

use crate::auth;
use crate::circuit_breaker::CircuitBreaker;
use crate::extract::extract_source;
use crate::generation::GenerationClient;
use crate::prompt::{generation_prompt, repair_prompt, SYSTEM_PROMPT};
use crate::types::{AnthropicMessage, AnthropicRequest, AnthropicResponse, Model};
use async_trait::async_trait;
use scforge_core::{ContractSpecification, Diagnostic, ForgeError, GenerationConfig, Result};
use std::time::Duration;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Backoff for rate-limited and 5xx responses
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(300),
        }
    }
}

/// [`GenerationClient`] backed by the Anthropic Messages API
#[derive(Debug)]
pub struct AnthropicGenerator {
    http: reqwest::Client,
    endpoint: String,
    model: Model,
    max_tokens: usize,
    temperature: f32,
    api_key_env: String,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
}

impl AnthropicGenerator {
    pub fn from_config(config: &GenerationConfig) -> Result<Self> {
        let model: Model = config.model.parse().map_err(ForgeError::Config)?;
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| ForgeError::Api(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            endpoint: ANTHROPIC_API_URL.to_string(),
            model,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            api_key_env: config.api_key_env.clone(),
            retry: RetryPolicy::default(),
            breaker: CircuitBreaker::default(),
        })
    }

    /// Send requests somewhere other than the public API
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn model(&self) -> Model {
        self.model
    }

    /// Send one prompt and return the source it produced
    async fn complete(&self, prompt: String) -> Result<String> {
        if !self.breaker.can_execute() {
            return Err(ForgeError::ApiLimit(format!(
                "Circuit breaker is OPEN after {} consecutive failures. Wait {} seconds before retry.",
                self.breaker.failure_count(),
                self.breaker.time_until_retry().as_secs()
            )));
        }

        let api_key = auth::api_key_from_env(&self.api_key_env)?;

        let request = AnthropicRequest {
            model: self.model.api_name().to_string(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            system: Some(SYSTEM_PROMPT.to_string()),
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: prompt,
            }],
        };

        let mut retries = 0;
        let mut backoff = self.retry.initial_backoff;

        loop {
            tracing::debug!(
                "Sending request to {} with model {} (attempt {})",
                self.endpoint,
                self.model,
                retries + 1
            );

            let response = match self
                .http
                .post(&self.endpoint)
                .header("x-api-key", &api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .json(&request)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    self.breaker.record_failure();
                    return Err(ForgeError::Api(format!("Failed to send request: {}", e)));
                }
            };

            let status = response.status();

            if status.as_u16() == 429 || status.is_server_error() {
                retries += 1;

                if retries > self.retry.max_retries {
                    self.breaker.record_failure();
                    let error_text = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "Unknown".to_string());
                    return Err(ForgeError::ApiLimit(format!(
                        "{} after {} retries. Last error: {}",
                        status, self.retry.max_retries, error_text
                    )));
                }

                // retry-after only accompanies 429s, but honour it either way
                let wait = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .map(Duration::from_secs)
                    .unwrap_or(backoff);

                tracing::warn!(
                    "Anthropic API returned {}. Waiting {:?} before retry {}/{}",
                    status,
                    wait,
                    retries,
                    self.retry.max_retries
                );

                tokio::time::sleep(wait).await;
                backoff = (backoff * 2).min(self.retry.max_backoff);
                continue;
            }

            if !status.is_success() {
                let error_text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown".to_string());

                self.breaker.record_failure();
                tracing::error!(
                    "Circuit breaker: recorded failure (count: {})",
                    self.breaker.failure_count()
                );

                return Err(match status.as_u16() {
                    401 | 403 => ForgeError::Auth(format!("Anthropic API rejected the key: {}", error_text)),
                    _ => ForgeError::Api(format!("Anthropic API error {}: {}", status, error_text)),
                });
            }

            let body: AnthropicResponse = response
                .json()
                .await
                .map_err(|e| ForgeError::Api(format!("Failed to parse response: {}", e)))?;

            self.breaker.record_success();

            if let Some(usage) = &body.usage {
                tracing::info!(
                    "Generation complete ({} input tokens, {} output tokens)",
                    usage.input_tokens,
                    usage.output_tokens
                );
            }

            return extract_source(&body.text()).ok_or_else(|| {
                ForgeError::Generation("Response contained no program source".to_string())
            });
        }
    }
}

#[async_trait]
impl GenerationClient for AnthropicGenerator {
    async fn generate(&self, spec: &ContractSpecification) -> Result<String> {
        tracing::info!("Generating {} program {:?}", spec.kind, spec.name);
        self.complete(generation_prompt(spec)).await
    }

    async fn repair(
        &self,
        spec: &ContractSpecification,
        prior_source: &str,
        diagnostics: &[Diagnostic],
    ) -> Result<String> {
        tracing::info!(
            "Repairing {} program {:?} ({} errors)",
            spec.kind,
            spec.name,
            diagnostics.len()
        );
        self.complete(repair_prompt(spec, prior_source, diagnostics))
            .await
    }
}

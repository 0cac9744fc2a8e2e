use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use crate::types::*;
use crate::{LlmClient, ProviderError};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Chat-completions client for any OpenAI-compatible endpoint.
pub struct OpenAiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    standard_model: String,
    deep_model: String,
}

impl OpenAiClient {
    pub fn new(
        api_key: String,
        base_url: Option<String>,
        standard_model: String,
        deep_model: String,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
            standard_model,
            deep_model,
        }
    }

    fn model_for(&self, tier: LlmTier) -> &str {
        match tier {
            LlmTier::Standard => &self.standard_model,
            LlmTier::Deep => &self.deep_model,
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn name(&self) -> &str {
        "openai"
    }

    fn model_name(&self, tier: LlmTier) -> String {
        self.model_for(tier).to_string()
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let model = self.model_for(request.tier);
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| {
                json!({
                    "role": match m.role {
                        Role::System => "system",
                        Role::User => "user",
                        Role::Assistant => "assistant",
                    },
                    "content": m.content,
                })
            })
            .collect();

        let mut body = json!({
            "model": model,
            "messages": messages,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }

        let url = format!("{}/chat/completions", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    anyhow::Error::new(ProviderError::Timeout(REQUEST_TIMEOUT_SECS))
                } else {
                    anyhow::Error::new(e)
                }
            })?;

        let status = resp.status();
        if status.as_u16() == 429 {
            let retry_after_ms = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|s| s * 1000)
                .unwrap_or(2000);
            return Err(ProviderError::RateLimited { retry_after_ms }.into());
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::HttpError {
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::DeserializationError(e.to_string()))?;

        let content = value["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let usage = Usage {
            input_tokens: value["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: value["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
        };

        tracing::debug!(
            model = %model,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "LLM chat completion"
        );

        Ok(ChatResponse {
            content,
            model: model.to_string(),
            usage,
        })
    }
}

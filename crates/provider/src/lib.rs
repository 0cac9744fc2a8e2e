pub mod types;

pub mod openai;

mod error;

pub use error::ProviderError;
pub use types::*;

use anyhow::Result;
use async_trait::async_trait;

/// The LLM surface the orchestration core consumes. Providers resolve the
/// abstract tier to a concrete model; callers never name models directly.
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn name(&self) -> &str;

    fn model_name(&self, tier: LlmTier) -> String;

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;
}

pub fn create_client(config: &triad_config::Config) -> Result<Box<dyn LlmClient>> {
    let llm = &config.llm;
    let api_key = llm
        .api_key
        .clone()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .unwrap_or_default();

    match llm.provider.as_str() {
        // Every supported backend speaks the chat-completions dialect; the
        // provider name only selects the base URL convention.
        "openai" | "openrouter" | "groq" | "ollama" | "copilot" => {
            Ok(Box::new(openai::OpenAiClient::new(
                api_key,
                llm.base_url.clone(),
                llm.standard_model.clone(),
                llm.deep_model.clone(),
            )))
        }
        other => anyhow::bail!("Unsupported LLM provider '{other}'"),
    }
}

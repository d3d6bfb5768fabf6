//! LLM clients for flowrun's `llm` nodes.

pub mod providers;
pub mod retry;
pub mod streaming;

use std::sync::Arc;

use flowrun_core::config::{AppConfig, ModelConfig};
use flowrun_core::traits::LlmClient;

pub use providers::openai::OpenAiClient;
pub use retry::RetryingClient;

/// Create an LLM client for the model's provider.
///
/// Every supported provider speaks the OpenAI chat-completions protocol;
/// the provider name only selects the default endpoint.
pub fn create_client(_config: &ModelConfig) -> Box<dyn LlmClient> {
    Box::new(OpenAiClient::new())
}

/// Build the client used by `llm` nodes: the primary model's client wrapped
/// with retries and the configured fallback models.
pub fn client_from_config(config: &AppConfig) -> Option<(Arc<dyn LlmClient>, ModelConfig)> {
    let model = config.model.clone()?;
    if model.retry.is_none() && config.fallback_models.is_empty() {
        return Some((Arc::from(create_client(&model)), model));
    }

    let fallbacks = config
        .fallback_models
        .iter()
        .map(|fb| (fb.clone(), create_client(fb)))
        .collect();
    let client = RetryingClient::new(
        create_client(&model),
        fallbacks,
        model.retry.clone().unwrap_or_default(),
    );
    Some((Arc::new(client), model))
}

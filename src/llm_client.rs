//! Client for OpenAI-compatible APIs (OpenAI itself, LiteLLM or Ollama).

use async_openai::{Client, config::OpenAIConfig};

use crate::prelude::*;

/// Create an OpenAI-compatible client from `OPENAI_API_KEY` and
/// `OPENAI_API_BASE`.
///
/// Returns `None` when no API key is set, in which case callers should fall
/// back to an offline narrative.
pub fn create_llm_client() -> Option<Client<OpenAIConfig>> {
    let api_key = std::env::var("OPENAI_API_KEY")
        .ok()
        .filter(|key| !key.trim().is_empty());
    let Some(api_key) = api_key else {
        debug!("OPENAI_API_KEY is not set");
        return None;
    };
    let mut client_config = OpenAIConfig::new().with_api_key(api_key);
    if let Ok(api_base) = std::env::var("OPENAI_API_BASE") {
        client_config = client_config.with_api_base(api_base);
    }
    Some(Client::with_config(client_config))
}

//! Our OpenAI driver, which we also use for LiteLLM, Ollama and other
//! compatible gateways.

use std::time::Duration;

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{CreateChatCompletionResponse, FinishReason},
};
use futures::{FutureExt as _, TryFutureExt as _};
use tokio::time;

use crate::{
    drivers::{LlmError, TokenUsage},
    prelude::*,
    retry::{
        retry_result_fatal, retry_result_ok, try_fatal, try_potentially_transient,
        try_transient,
    },
};

use super::{ChatCompletionResponse, Driver, LlmOpts, LlmRetryResult};

/// Our OpenAI driver, which we also use for LiteLLM, Ollama and other
/// compatible gateways.
#[derive(Debug)]
pub struct OpenAiDriver {
    /// The OpenAI client.
    pub client: Client<OpenAIConfig>,
}

impl OpenAiDriver {
    /// Create a new OpenAI driver.
    pub fn new(client: Client<OpenAIConfig>) -> Self {
        Self { client }
    }
}

/// Build the raw request body. We use "bring your own types" so we can pass
/// our JSON Schema through untouched.
fn build_request(messages: &Value, schema: &Value, llm_opts: &LlmOpts) -> Value {
    let name = schema
        .get("title")
        .and_then(|v| v.as_str())
        .unwrap_or("ResponseFormat");
    let mut req = json!({
        "model": llm_opts.model,
        "messages": messages,
        "response_format": {
            "type": "json_schema",
            "json_schema": {
                "name": name,
                "schema": schema,
                "strict": true,
            },
        },
        // Don't let the API keep copies of our reports.
        "store": false,
    });
    if let Some(max_completion_tokens) = llm_opts.max_completion_tokens {
        req["max_completion_tokens"] = json!(max_completion_tokens);
    }
    if let Some(temperature) = llm_opts.temperature {
        req["temperature"] = json!(temperature);
    }
    if let Some(top_p) = llm_opts.top_p {
        req["top_p"] = json!(top_p);
    }
    req
}

#[async_trait]
impl Driver for OpenAiDriver {
    #[instrument(level = "debug", skip_all, fields(model = %llm_opts.model))]
    async fn chat_completion(
        &self,
        messages: &Value,
        schema: &Value,
        llm_opts: &LlmOpts,
    ) -> LlmRetryResult<ChatCompletionResponse> {
        let req = build_request(messages, schema, llm_opts);
        trace!(%req, "Request");

        // Call OpenAI.
        let chat = self.client.chat();
        let mut chat_future = chat
            .create_byot::<_, Value>(req)
            .map_err(LlmError::Native)
            .boxed();
        if let Some(timeout) = llm_opts.llm_request_timeout {
            // Merge the errors from `Result<Result<_, LlmError>, Elapsed>`
            // into a single level.
            chat_future = time::timeout(Duration::from_secs(timeout), chat_future)
                .map(|result| match result {
                    Ok(inner) => inner,
                    Err(_) => Err(LlmError::Timeout),
                })
                .boxed();
        }
        let chat_result = try_potentially_transient!(chat_future.await);
        debug!(%chat_result, "OpenAI response");
        let response = try_fatal!(
            serde_json::from_value::<CreateChatCompletionResponse>(chat_result)
                .context("Error parsing OpenAI response")
        );

        // How many tokens did we use?
        let token_usage = response.usage.map(|usage| TokenUsage {
            prompt_tokens: u64::from(usage.prompt_tokens),
            completion_tokens: u64::from(usage.completion_tokens),
        });

        // Get the content from our response & parse as JSON.
        let Some(choice) = response.choices.first() else {
            return retry_result_fatal(anyhow!("No choices in OpenAI response"));
        };
        if choice.finish_reason == Some(FinishReason::ContentFilter) {
            return retry_result_fatal(anyhow!("Content filter triggered"));
        }
        let content = choice.message.content.as_deref().unwrap_or_default();
        // If we didn't get JSON here, it's because the model didn't generate
        // JSON. So give it another chance.
        let response = try_transient!(
            serde_json::from_str::<Value>(content).with_context(|| format!(
                "Error parsing OpenAI response content: {:?}",
                content
            ))
        );
        retry_result_ok(ChatCompletionResponse {
            response,
            token_usage,
        })
    }
}

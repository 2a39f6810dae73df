//! LLM drivers.
//!
//! We talk to OpenAI-compatible gateways only. The [`Driver`] trait is kept
//! so tests and other backends can stand in for the real API.

use std::{error, fmt, ops::AddAssign};

use clap::Args;
use keen_retry::RetryResult;
use schemars::JsonSchema;

use crate::{prelude::*, retry::IsKnownTransient};

pub mod openai;

/// Our chat-related options.
#[derive(Args, Clone, Debug)]
pub struct LlmOpts {
    /// The model used for report narratives.
    #[clap(long, env = "ADMATE_AI_MODEL", default_value = "gpt-4o-mini")]
    pub model: String,

    /// An upper limit on the number of completion tokens to generate. This may
    /// help prevent runaway responses, but it may also cause incomplete
    /// results.
    #[clap(long)]
    pub max_completion_tokens: Option<u32>,

    /// The temperature to use for sampling, between 0.0 and 2.0. Higher values
    /// may the output more random, while lower values may make it more
    /// deterministic. Defaults to the model's default.
    #[clap(long)]
    pub temperature: Option<f32>,

    /// The top-p sampling value to use, between 0.0 and 1.0. This is an
    /// alternative to temperature sampling. Defaults to the model's default.
    #[clap(long)]
    pub top_p: Option<f32>,

    /// Timeout for a single LLM request, in seconds. Timed-out requests are
    /// retried. The whole narrative is still bounded by
    /// `--narrative-timeout`.
    #[clap(long)]
    pub llm_request_timeout: Option<u64>,
}

/// A [`RetryResult`] for LLM requests. This allows [`Driver`] instances to
/// distinguish between errors that may be transient, and errors that are
/// definitely fatal.
pub type LlmRetryResult<T> = RetryResult<(), (), T, anyhow::Error>;

/// Interface trait for LLM drivers.
#[async_trait]
pub trait Driver: fmt::Debug + Send + Sync + 'static {
    /// Run a "chat completion" request with a JSON Schema response format.
    ///
    /// `messages` is an array of OpenAI-style `{role, content}` objects.
    async fn chat_completion(
        &self,
        messages: &Value,
        schema: &Value,
        llm_opts: &LlmOpts,
    ) -> LlmRetryResult<ChatCompletionResponse>;
}

/// A chat completion response.
#[derive(Debug)]
pub struct ChatCompletionResponse {
    /// Structured response from the LLM. This will not have been
    /// validated yet.
    pub response: Value,

    /// Token usage.
    pub token_usage: Option<TokenUsage>,
}

/// Token usage.
#[derive(Clone, Debug, Default, JsonSchema, Serialize)]
pub struct TokenUsage {
    /// How many tokens were used in the prompt?
    pub prompt_tokens: u64,

    /// How many tokens were used in the response?
    pub completion_tokens: u64,
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// An error which occurred while calling an LLM.
#[derive(Debug)]
pub enum LlmError<E> {
    /// A native error.
    Native(E),

    /// A timeout error.
    Timeout,
}

impl<E> IsKnownTransient for LlmError<E>
where
    E: IsKnownTransient,
{
    /// Is this a known transient error?
    fn is_known_transient(&self) -> bool {
        match self {
            LlmError::Native(err) => err.is_known_transient(),
            // Some kinds of network timeouts can be retried with hope of a
            // better result.
            LlmError::Timeout => true,
        }
    }
}

impl<E> fmt::Display for LlmError<E>
where
    E: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::Native(err) => write!(f, "LLM error: {err}"),
            LlmError::Timeout => write!(f, "LLM request timed out"),
        }
    }
}

impl<E> error::Error for LlmError<E>
where
    E: error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            LlmError::Native(err) => Some(err),
            LlmError::Timeout => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_usage_adds() {
        let mut usage = TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 2,
        };
        usage += TokenUsage {
            prompt_tokens: 5,
            completion_tokens: 1,
        };
        assert_eq!((usage.prompt_tokens, usage.completion_tokens), (15, 3));
    }

    #[test]
    fn test_timeouts_are_transient() {
        assert!(LlmError::<reqwest::StatusCode>::Timeout.is_known_transient());
        assert!(
            !LlmError::Native(reqwest::StatusCode::BAD_REQUEST).is_known_transient()
        );
    }
}

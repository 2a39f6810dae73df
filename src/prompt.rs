//! Our prompt data type.
//!
//! Prompts are TOML (or JSON) files with an optional `developer` message and
//! a list of `messages`, all of which are Handlebars templates.

use handlebars::Handlebars;
use serde_json::Map;

use crate::{
    io::{JsonObject, read_json_or_toml},
    prelude::*,
};

/// The prompt we use for report narratives unless the user supplies one.
const DEFAULT_NARRATIVE_PROMPT: &str = r#"
developer = """
당신은 지하철 옥외광고 효과를 분석하는 미디어 플래너입니다. 주어진 역 유동인구
데이터와 노출 추정치만 근거로, 광고주에게 보내는 게첨 보고서용 성과 분석을
한국어로 작성하세요. 데이터에 없는 수치를 지어내지 마세요.
"""

[[messages]]
user = """
광고주: {{advertiser_name}}
역: {{station}} ({{line}})
게첨일: {{date_str}}
일평균 유동인구: {{daily_total}}명 (출처: {{flow_source}}, 기준일 {{data_date}})
게첨 기간: {{display_days}}일
예상 총 노출: {{total_exposure}}회
시간대별 유동인구: {{#each time_bands}}{{band}}시 {{flow}}명{{#unless @last}}, {{/unless}}{{/each}}

analysisText에는 3~4문단의 분석을, metrics에는 핵심 수치를, chartData에는
시간대별 상대 유동인구를 넣어 주세요. score는 0에서 100 사이의 정수입니다.
"""
"#;

/// Render a prompt as a JSON object, filling in template values for any string
/// fields.
pub trait RenderTemplate {
    type Output;

    /// Render the template.
    fn render_template(
        &self,
        handlebars: &Handlebars,
        bindings: &JsonObject,
    ) -> Result<Self::Output>;
}

/// A chat completion prompt.
#[derive(Debug, Deserialize)]
pub struct ChatPrompt {
    /// The developer (aka "system") message, if any.
    pub developer: Option<String>,

    /// Messages.
    pub messages: Vec<Message>,
}

impl ChatPrompt {
    /// Our built-in narrative prompt.
    pub fn default_narrative() -> Result<Self> {
        toml::from_str(DEFAULT_NARRATIVE_PROMPT).context("Failed to parse built-in prompt")
    }

    /// Load a prompt file, or use the built-in narrative prompt.
    pub async fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => read_json_or_toml(path).await,
            None => Self::default_narrative(),
        }
    }

    /// Render the prompt as a JSON array of chat messages.
    pub fn render_prompt(&self, bindings: &JsonObject) -> Result<Value> {
        let mut handlebars = Handlebars::new();
        // These are chat messages, not HTML.
        handlebars.register_escape_fn(handlebars::no_escape);
        self.render_template(&handlebars, bindings)
    }
}

impl RenderTemplate for ChatPrompt {
    type Output = Value;

    fn render_template(
        &self,
        handlebars: &Handlebars,
        bindings: &JsonObject,
    ) -> Result<Self::Output> {
        let mut messages = Vec::new();
        if let Some(developer) = &self.developer {
            messages.push(json!({
                "role": "system",
                "content": handlebars.render_template(developer, bindings)?,
            }));
        }
        for message in &self.messages {
            messages.extend(message.render_template(handlebars, bindings)?);
        }
        Ok(Value::Array(messages))
    }
}

/// A message, and optionally an example response (represented as a JSON
/// object).
#[derive(Debug, Deserialize)]
pub struct Message {
    /// The user message.
    pub user: String,

    /// The assistant response (optional). This is always a JSON object.
    pub assistant: Option<JsonObject>,
}

impl RenderTemplate for Message {
    type Output = Vec<Value>;

    fn render_template(
        &self,
        handlebars: &Handlebars,
        bindings: &JsonObject,
    ) -> Result<Self::Output> {
        let user = handlebars.render_template(&self.user, bindings)?;
        let mut messages = vec![json!({ "role": "user", "content": user })];
        if let Some(assistant) = &self.assistant {
            let assistant = assistant.render_template(handlebars, bindings)?;
            messages
                .push(json!({ "role": "assistant", "content": assistant.to_string() }));
        }
        Ok(messages)
    }
}

impl RenderTemplate for Value {
    type Output = Value;

    fn render_template(
        &self,
        handlebars: &Handlebars,
        bindings: &JsonObject,
    ) -> Result<Self::Output> {
        match self {
            Value::String(s) => {
                let rendered = handlebars.render_template(s, bindings)?;
                Ok(Value::String(rendered))
            }
            Value::Object(obj) => obj.render_template(handlebars, bindings),
            Value::Array(arr) => arr
                .iter()
                .map(|value| value.render_template(handlebars, bindings))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            _ => Ok(self.clone()),
        }
    }
}

impl RenderTemplate for JsonObject {
    type Output = Value;

    fn render_template(
        &self,
        handlebars: &Handlebars,
        bindings: &JsonObject,
    ) -> Result<Self::Output> {
        let mut output = Map::new();
        for (key, value) in self {
            output.insert(key.clone(), value.render_template(handlebars, bindings)?);
        }
        Ok(Value::Object(output))
    }
}

use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ChatDialect, ProviderRequest};
use crate::http::ApiKey;

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// Anthropic messages API.
pub(crate) struct AnthropicMessages;

impl AnthropicMessages {
    pub(crate) const DEFAULT_MODEL: &'static str = "claude-3-5-haiku-latest";
}

impl ChatDialect for AnthropicMessages {
    const NAME: &'static str = "Anthropic";

    fn endpoint(&self) -> &str {
        MESSAGES_URL
    }

    fn api_key<'a>(&self, key: &'a str) -> ApiKey<'a> {
        ApiKey::Header("x-api-key", key)
    }

    fn extra_headers(&self) -> &'static [(&'static str, &'static str)] {
        &[("anthropic-version", API_VERSION)]
    }

    fn body(&self, model: &str, request: &ProviderRequest) -> Value {
        let mut body = json!({
            "model": model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": [{
                "role": "user",
                "content": [{ "type": "text", "text": request.prompt }],
            }],
        });
        if !request.system.is_empty() {
            body["system"] = json!(request.system);
        }
        body
    }

    /// Text blocks joined by newlines; tool and thinking blocks are skipped.
    fn answer_text(&self, reply: Value) -> Result<String> {
        let reply: Messages = serde_json::from_value(reply)?;
        Ok(reply
            .content
            .into_iter()
            .filter_map(|block| match block {
                Block::Text { text } => Some(text),
                Block::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

#[derive(Deserialize)]
struct Messages {
    content: Vec<Block>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Block {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ChatDialect, ProviderRequest};
use crate::http::ApiKey;

/// OpenAI-compatible `/chat/completions`, also served by most self-hosted gateways.
pub(crate) struct OpenAiChat {
    endpoint: String,
}

impl OpenAiChat {
    pub(crate) const DEFAULT_MODEL: &'static str = "gpt-4o-mini";

    pub(crate) fn new(base_url: &str) -> Self {
        Self {
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
        }
    }
}

impl ChatDialect for OpenAiChat {
    const NAME: &'static str = "OpenAI";

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn api_key<'a>(&self, key: &'a str) -> ApiKey<'a> {
        ApiKey::Bearer(key)
    }

    fn body(&self, model: &str, request: &ProviderRequest) -> Value {
        json!({
            "model": model,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.prompt },
            ],
        })
    }

    fn answer_text(&self, reply: Value) -> Result<String> {
        let reply: Completion = serde_json::from_value(reply)?;
        Ok(reply
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .unwrap_or_default())
    }
}

#[derive(Deserialize)]
struct Completion {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    #[serde(default)]
    content: Option<String>,
}

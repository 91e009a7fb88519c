//! Completion providers shared by the enricher, the ranking oracle and the gap planner.
//!
//! Providers are blocking `reqwest` clients. Async callers go through
//! [`complete`], which moves the call onto the blocking pool. Each HTTP API is
//! a [`ChatDialect`]: its endpoint, key placement, request body and answer
//! extraction. [`ChatProvider`] does the rest for all of them.

mod anthropic;
mod openai;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, ValueEnum};
use reqwest::blocking::Client;
use serde_json::Value;

use self::anthropic::AnthropicMessages;
use self::openai::OpenAiChat;
use crate::http::{json_client, post_json, ApiKey};

/// Trait implemented by concrete LLM providers.
pub trait LlmProvider: Send + Sync {
    /// Sends one system + user exchange and returns the assistant text.
    fn answer(&self, request: &ProviderRequest) -> Result<String>;
}

/// Request envelope shared by the various providers.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRequest {
    /// Instructions.
    pub system: String,
    /// User turn.
    pub prompt: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Completion token cap.
    pub max_tokens: usize,
}

impl ProviderRequest {
    /// Request with deterministic-leaning defaults.
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            temperature: 0.0,
            max_tokens: 800,
        }
    }

    /// Overrides the token cap.
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Overrides the temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Wire format of one completion API.
pub(crate) trait ChatDialect: Send + Sync {
    /// Service name for error messages.
    const NAME: &'static str;

    /// Full request URL.
    fn endpoint(&self) -> &str;

    /// How the API key is sent.
    fn api_key<'a>(&self, key: &'a str) -> ApiKey<'a>;

    /// Fixed headers besides the key.
    fn extra_headers(&self) -> &'static [(&'static str, &'static str)] {
        &[]
    }

    /// JSON body for one system + user exchange.
    fn body(&self, model: &str, request: &ProviderRequest) -> Value;

    /// Assistant text from a decoded reply; empty when the model said nothing.
    fn answer_text(&self, reply: Value) -> Result<String>;
}

/// [`LlmProvider`] speaking `D` over a blocking JSON client.
///
/// One attempt per call: callers own retry and fallback.
pub(crate) struct ChatProvider<D> {
    dialect: D,
    model: String,
    client: Client,
}

impl<D: ChatDialect> ChatProvider<D> {
    pub(crate) fn new(dialect: D, api_key: &str, model: String, timeout: Duration) -> Result<Self> {
        let client = json_client(
            D::NAME,
            dialect.api_key(api_key),
            dialect.extra_headers(),
            timeout,
        )?;
        Ok(Self {
            dialect,
            model,
            client,
        })
    }
}

impl<D: ChatDialect> LlmProvider for ChatProvider<D> {
    fn answer(&self, request: &ProviderRequest) -> Result<String> {
        let body = self.dialect.body(&self.model, request);
        let reply: Value = post_json(&self.client, self.dialect.endpoint(), &body, 1, D::NAME)?;
        self.dialect
            .answer_text(reply)
            .with_context(|| format!("unexpected {} reply", D::NAME))
    }
}

/// Runs `provider` on the blocking pool.
///
/// Callers bound this with `tokio::time::timeout`; a dropped future abandons
/// the blocking call, which finishes in the background with its result discarded.
pub async fn complete(provider: Arc<dyn LlmProvider>, request: ProviderRequest) -> Result<String> {
    tokio::task::spawn_blocking(move || provider.answer(&request))
        .await
        .map_err(|err| anyhow!("llm task join error: {err}"))?
}

/// Which completion API to use.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum ProviderKind {
    /// OpenAI-compatible chat completions.
    #[value(name = "openai")]
    OpenAi,
    /// Anthropic messages API.
    Anthropic,
}

/// Provider flags shared by binaries.
#[derive(Args, Debug, Clone)]
pub struct LlmArgs {
    /// Completion provider used for enrichment, ranking and planning.
    #[arg(long, env = "CASCADE_LLM_PROVIDER", value_enum, default_value = "openai")]
    pub llm_provider: ProviderKind,

    /// Model identifier; defaults depend on the provider.
    #[arg(long, env = "CASCADE_LLM_MODEL")]
    pub llm_model: Option<String>,

    /// Base URL for OpenAI-compatible chat endpoints.
    #[arg(
        long,
        env = "CASCADE_LLM_BASE",
        default_value = "https://api.openai.com/v1"
    )]
    pub llm_base_url: String,

    /// HTTP timeout applied by the provider client itself.
    #[arg(long, env = "CASCADE_LLM_HTTP_TIMEOUT_SECS", default_value_t = 60)]
    pub llm_http_timeout_secs: u64,

    /// OpenAI API key.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    /// Anthropic API key.
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    pub anthropic_api_key: Option<String>,
}

impl LlmArgs {
    /// Builds the selected provider.
    pub fn build_provider(&self) -> Result<Arc<dyn LlmProvider>> {
        let timeout = Duration::from_secs(self.llm_http_timeout_secs.max(1));
        let provider: Arc<dyn LlmProvider> = match self.llm_provider {
            ProviderKind::OpenAi => Arc::new(ChatProvider::new(
                OpenAiChat::new(&self.llm_base_url),
                self.openai_api_key
                    .as_deref()
                    .context("OPENAI_API_KEY is required for --llm-provider openai")?,
                self.model_or(OpenAiChat::DEFAULT_MODEL),
                timeout,
            )?),
            ProviderKind::Anthropic => Arc::new(ChatProvider::new(
                AnthropicMessages,
                self.anthropic_api_key
                    .as_deref()
                    .context("ANTHROPIC_API_KEY is required for --llm-provider anthropic")?,
                self.model_or(AnthropicMessages::DEFAULT_MODEL),
                timeout,
            )?),
        };
        Ok(provider)
    }

    fn model_or(&self, default: &str) -> String {
        self.llm_model
            .as_deref()
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .unwrap_or(default)
            .to_string()
    }
}

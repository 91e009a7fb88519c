//! Best-effort expansion of sparse profile text before encoding.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::llm::{complete, LlmProvider, ProviderRequest};

const ENRICH_SYSTEM_PROMPT: &str = "Rewrite the candidate profile below as a keyword-dense search query \
for a job catalog. Keep every fact it states. Add implied job titles, synonyms, tools, \
standards and domain terms a recruiter would search for. Answer with the rewritten text only.";

/// Expands query text to improve recall.
///
/// Failures and empty output are not fatal: the pipeline falls back to the raw text.
#[async_trait]
pub trait QueryEnricher: Send + Sync {
    /// Returns an expanded version of `text`.
    async fn enrich(&self, text: &str) -> Result<String>;
}

/// Enricher that asks an LLM to rewrite the profile.
pub struct LlmEnricher {
    provider: Arc<dyn LlmProvider>,
}

impl LlmEnricher {
    /// Uses `provider` for rewrites.
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl QueryEnricher for LlmEnricher {
    async fn enrich(&self, text: &str) -> Result<String> {
        let request = ProviderRequest::new(ENRICH_SYSTEM_PROMPT, text).with_max_tokens(600);
        let answer = complete(self.provider.clone(), request).await?;
        Ok(answer.trim().to_string())
    }
}

//! Target-state profile synthesis for gap-closing matches.
//!
//! Given where someone is, where they want to be and what they will have
//! learned, the planner writes the profile they would have after closing the
//! gap. That text then goes through the ordinary matching pipeline.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::llm::{complete, LlmProvider, ProviderRequest};

fn future_profile_prompt(current: &str, target: &str, skills: &str) -> String {
    format!(
        "Write a short professional profile, in the first person, of someone who currently \
works as {current} and has since acquired these skills: {skills}. They are now applying for \
{target} roles. Describe their experience, tools and strengths as a recruiter search query \
would need them. Answer with the profile text only."
    )
}

/// Inputs describing the gap to close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapRequest {
    /// Present role.
    pub current_position: String,
    /// Desired role.
    pub target_position: String,
    /// Skills gained along the way.
    #[serde(default)]
    pub acquired_skills: String,
}

impl GapRequest {
    /// Deterministic profile used when no planner answer is available.
    pub fn template_profile(&self) -> String {
        let skills = if self.acquired_skills.trim().is_empty() {
            format!("skills required for {}", self.target_position.trim())
        } else {
            self.acquired_skills.trim().to_string()
        };
        format!(
            "Specialist with experience as {}, developing towards {}. Skills: {}",
            self.current_position.trim(),
            self.target_position.trim(),
            skills
        )
    }
}

/// Writes target-state profiles, optionally with an LLM.
#[derive(Clone)]
pub struct GapPlanner {
    provider: Option<Arc<dyn LlmProvider>>,
    timeout: Duration,
}

impl GapPlanner {
    /// Planner backed by `provider`, giving up after `timeout`.
    pub fn new(provider: Arc<dyn LlmProvider>, timeout: Duration) -> Self {
        Self {
            provider: Some(provider),
            timeout,
        }
    }

    /// Planner that always uses the template.
    pub fn template_only() -> Self {
        Self {
            provider: None,
            timeout: Duration::ZERO,
        }
    }

    /// Profile text for the target state. Never fails: falls back to the template.
    pub async fn future_profile(&self, request: &GapRequest) -> String {
        let Some(provider) = &self.provider else {
            return request.template_profile();
        };
        let system = future_profile_prompt(
            request.current_position.trim(),
            request.target_position.trim(),
            request.acquired_skills.trim(),
        );
        let call = complete(
            provider.clone(),
            ProviderRequest::new(system, request.target_position.trim())
                .with_max_tokens(500)
                .with_temperature(0.3),
        );
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(text)) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(Ok(_)) => {
                warn!("gap planner returned empty profile, using template");
                request.template_profile()
            }
            Ok(Err(err)) => {
                warn!(error = %format!("{err:#}"), "gap planner failed, using template");
                request.template_profile()
            }
            Err(_) => {
                warn!(timeout = ?self.timeout, "gap planner timed out, using template");
                request.template_profile()
            }
        }
    }
}

//! The ranking oracle: an external judge that picks the best `k` of a candidate list.
//!
//! The cascade only sees [`RankingOracle::select_top_k`]. It validates every
//! answer itself, so adapters return whatever the service said, including
//! identifiers that were never offered.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::catalog::{CatalogItem, Idx};
use crate::llm::{complete, LlmProvider, ProviderRequest};

const STAGE1_SEPARATOR: &str = "\n---\n";
const STAGE2_SEPARATOR: &str = "\n------\n";

/// Cascade stage being judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Coarse pass over titles.
    Titles,
    /// Fine pass over full descriptions.
    Details,
}

impl Stage {
    /// Short label used in logs.
    pub fn label(self) -> &'static str {
        match self {
            Stage::Titles => "stage1",
            Stage::Details => "stage2",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Oracle failures, split by how the cascade reacts.
#[derive(Debug, Error)]
pub enum OracleError {
    /// Transport, quota or timeout failure. Retried with backoff.
    #[error("oracle unavailable: {0:#}")]
    Unavailable(anyhow::Error),
    /// The oracle answered, but not in the expected shape. Not retried.
    #[error("oracle answer malformed: {0}")]
    Malformed(String),
}

/// Picks up to `k` candidates, best first.
#[async_trait]
pub trait RankingOracle: Send + Sync {
    /// Returns selected identifiers in preference order. May contain junk.
    async fn select_top_k(
        &self,
        stage: Stage,
        profile: &str,
        candidates: &[CatalogItem],
        k: usize,
    ) -> Result<Vec<Idx>, OracleError>;
}

fn stage_instructions(stage: Stage, k: usize) -> String {
    match stage {
        Stage::Titles => format!(
            "You screen job listings for a candidate. You get the candidate profile and a list \
of listings as `idx: title`. Judging by title alone, select the {k} listings most relevant \
to the candidate. Answer with JSON only: {{\"selected\": [idx, ...]}}, at most {k} integers, \
best first, using only idx values from the list."
        ),
        Stage::Details => format!(
            "You match job listings to a candidate. You get the candidate profile and detailed \
listings. Considering title, description, skills, location, compensation and experience, \
select the {k} listings that fit the candidate best. Answer with JSON only: \
{{\"selected\": [idx, ...]}}, at most {k} integers, best first, using only idx values shown."
        ),
    }
}

/// One-line `idx: title` summary used by the coarse pass.
pub fn title_line(item: &CatalogItem) -> String {
    format!("{}: {}", item.idx, item.title)
}

/// Multi-line block used by the fine pass. Empty fields are omitted.
pub fn detail_block(item: &CatalogItem) -> String {
    let mut parts = vec![format!("idx: {}", item.idx)];
    for (label, value) in [
        ("Title", &item.title),
        ("Description", &item.description),
        ("Skills", &item.skills),
        ("Company", &item.company),
        ("Location", &item.location),
        ("Compensation", &item.compensation),
        ("Experience", &item.experience),
    ] {
        if !value.trim().is_empty() {
            parts.push(format!("{label}: {value}"));
        }
    }
    parts.join("\n")
}

/// User turn for a stage: the profile followed by the candidate summaries.
pub fn build_prompt(stage: Stage, profile: &str, candidates: &[CatalogItem]) -> String {
    match stage {
        Stage::Titles => {
            let list = candidates
                .iter()
                .map(title_line)
                .collect::<Vec<_>>()
                .join(STAGE1_SEPARATOR);
            format!("Candidate profile:\n{profile}\n\nListings (idx: title):\n{list}")
        }
        Stage::Details => {
            let blocks = candidates
                .iter()
                .map(detail_block)
                .collect::<Vec<_>>()
                .join(STAGE2_SEPARATOR);
            format!("Candidate profile:\n{profile}\n\nListings (detailed):\n{blocks}")
        }
    }
}

/// Extracts the `selected` array from an oracle answer.
///
/// Code fences and prose around the JSON object are tolerated. Entries that
/// are not non-negative integers are skipped.
pub fn parse_selection(raw: &str) -> Result<Vec<Idx>, OracleError> {
    let start = raw
        .find('{')
        .ok_or_else(|| OracleError::Malformed("no JSON object in answer".into()))?;
    let end = raw
        .rfind('}')
        .filter(|end| *end > start)
        .ok_or_else(|| OracleError::Malformed("unterminated JSON object".into()))?;
    let value: Value = serde_json::from_str(&raw[start..=end])
        .map_err(|err| OracleError::Malformed(format!("invalid JSON: {err}")))?;
    let selected = value
        .get("selected")
        .and_then(Value::as_array)
        .ok_or_else(|| OracleError::Malformed("missing `selected` array".into()))?;
    Ok(selected.iter().filter_map(Value::as_u64).collect())
}

/// Oracle backed by an LLM completion provider.
pub struct LlmRankingOracle {
    provider: Arc<dyn LlmProvider>,
}

impl LlmRankingOracle {
    /// Uses `provider` for both stages.
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl RankingOracle for LlmRankingOracle {
    async fn select_top_k(
        &self,
        stage: Stage,
        profile: &str,
        candidates: &[CatalogItem],
        k: usize,
    ) -> Result<Vec<Idx>, OracleError> {
        let request = ProviderRequest::new(
            stage_instructions(stage, k),
            build_prompt(stage, profile, candidates),
        )
        .with_max_tokens(800);
        let raw = complete(self.provider.clone(), request)
            .await
            .map_err(OracleError::Unavailable)?;
        if raw.trim().is_empty() {
            return Err(OracleError::Malformed("empty answer".into()));
        }
        parse_selection(&raw)
    }
}

/// Canned oracle behaviour for stubs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Answer with these identifiers.
    Select(Vec<Idx>),
    /// Answer with unparseable output.
    Malformed,
    /// Fail at the transport level.
    Unavailable,
}

impl Reply {
    fn into_result(self) -> Result<Vec<Idx>, OracleError> {
        match self {
            Reply::Select(ids) => Ok(ids),
            Reply::Malformed => Err(OracleError::Malformed("stubbed malformed answer".into())),
            Reply::Unavailable => Err(OracleError::Unavailable(anyhow!("stubbed outage"))),
        }
    }
}

/// One recorded oracle invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleCall {
    /// Stage asked.
    pub stage: Stage,
    /// Identifiers offered, in order.
    pub offered: Vec<Idx>,
    /// Requested count.
    pub k: usize,
}

/// Oracle that always gives the same reply per stage and records calls.
#[derive(Debug)]
pub struct StaticOracle {
    titles: Reply,
    details: Reply,
    calls: Mutex<Vec<OracleCall>>,
}

impl StaticOracle {
    /// Replies `titles` to stage 1 and `details` to stage 2.
    pub fn new(titles: Reply, details: Reply) -> Self {
        Self {
            titles,
            details,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Calls received so far.
    pub fn calls(&self) -> Vec<OracleCall> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl RankingOracle for StaticOracle {
    async fn select_top_k(
        &self,
        stage: Stage,
        _profile: &str,
        candidates: &[CatalogItem],
        k: usize,
    ) -> Result<Vec<Idx>, OracleError> {
        record(&self.calls, stage, candidates, k);
        match stage {
            Stage::Titles => self.titles.clone().into_result(),
            Stage::Details => self.details.clone().into_result(),
        }
    }
}

/// Oracle that pops replies from a queue in call order; an empty queue is an outage.
#[derive(Debug, Default)]
pub struct ScriptedOracle {
    replies: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<OracleCall>>,
}

impl ScriptedOracle {
    /// Queues `replies`.
    pub fn new(replies: impl IntoIterator<Item = Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Calls received so far.
    pub fn calls(&self) -> Vec<OracleCall> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl RankingOracle for ScriptedOracle {
    async fn select_top_k(
        &self,
        stage: Stage,
        _profile: &str,
        candidates: &[CatalogItem],
        k: usize,
    ) -> Result<Vec<Idx>, OracleError> {
        record(&self.calls, stage, candidates, k);
        let next = self
            .replies
            .lock()
            .ok()
            .and_then(|mut replies| replies.pop_front());
        next.unwrap_or(Reply::Unavailable).into_result()
    }
}

fn record(calls: &Mutex<Vec<OracleCall>>, stage: Stage, candidates: &[CatalogItem], k: usize) {
    if let Ok(mut calls) = calls.lock() {
        calls.push(OracleCall {
            stage,
            offered: candidates.iter().map(|item| item.idx).collect(),
            k,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_plain_and_fenced_answers() {
        assert_eq!(parse_selection(r#"{"selected": [3, 1]}"#).unwrap(), vec![3, 1]);
        let fenced = "Here you go:\n```json\n{\"selected\": [7, \"x\", 2.5, -1, 9]}\n```\n";
        assert_eq!(parse_selection(fenced).unwrap(), vec![7, 9]);
    }

    #[test]
    fn rejects_answers_without_selection() {
        for raw in ["no json here", r#"{"picked": [1]}"#, r#"{"selected": 4}"#, "{broken"] {
            assert!(
                matches!(parse_selection(raw), Err(OracleError::Malformed(_))),
                "{raw}"
            );
        }
    }

    #[test]
    fn stage_one_prompt_lists_titles() {
        let items = vec![CatalogItem::new(4, "Accountant"), CatalogItem::new(9, "Auditor")];
        let prompt = build_prompt(Stage::Titles, "ten years in audit", &items);
        assert!(prompt.starts_with("Candidate profile:\nten years in audit"));
        assert!(prompt.ends_with("4: Accountant\n---\n9: Auditor"));
    }

    #[test]
    fn detail_block_skips_empty_fields() {
        let mut item = CatalogItem::new(2, "Controller");
        item.location = "Remote".into();
        assert_eq!(detail_block(&item), "idx: 2\nTitle: Controller\nLocation: Remote");
        let prompt = build_prompt(Stage::Details, "p", &[item.clone(), item]);
        assert!(prompt.contains("Location: Remote\n------\nidx: 2"));
    }

    #[tokio::test]
    async fn scripted_oracle_replays_then_fails() {
        let oracle = ScriptedOracle::new([Reply::Select(vec![1]), Reply::Malformed]);
        let items = vec![CatalogItem::new(1, "a")];
        assert_eq!(
            oracle.select_top_k(Stage::Titles, "p", &items, 1).await.unwrap(),
            vec![1]
        );
        assert!(matches!(
            oracle.select_top_k(Stage::Details, "p", &items, 1).await,
            Err(OracleError::Malformed(_))
        ));
        assert!(matches!(
            oracle.select_top_k(Stage::Details, "p", &items, 1).await,
            Err(OracleError::Unavailable(_))
        ));
        assert_eq!(oracle.calls().len(), 3);
        assert_eq!(oracle.calls()[0].offered, vec![1]);
    }

    struct Canned(&'static str);

    impl LlmProvider for Canned {
        fn answer(&self, request: &ProviderRequest) -> anyhow::Result<String> {
            assert!(request.system.contains("select the 2"));
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn llm_oracle_parses_provider_answer() {
        let oracle = LlmRankingOracle::new(Arc::new(Canned("```{\"selected\":[5,6]}```")));
        let items = vec![CatalogItem::new(5, "a"), CatalogItem::new(6, "b")];
        assert_eq!(
            oracle.select_top_k(Stage::Details, "p", &items, 2).await.unwrap(),
            vec![5, 6]
        );
    }

    #[tokio::test]
    async fn llm_oracle_treats_blank_answer_as_malformed() {
        let oracle = LlmRankingOracle::new(Arc::new(Canned("  ")));
        let items = vec![CatalogItem::new(5, "a")];
        assert!(matches!(
            oracle.select_top_k(Stage::Titles, "p", &items, 2).await,
            Err(OracleError::Malformed(_))
        ));
    }
}

//! Two-stage coarse-to-fine reduction of ANN candidates with a fallible oracle.
//!
//! Stage 1 shows the oracle titles only and keeps `k1` candidates; stage 2
//! shows full details of the survivors and keeps `k2`, ranked. Every stage
//! output is a subset of its input. Oracle answers are never trusted blindly:
//!
//! * identifiers that were not offered, and repeats, are discarded;
//! * an empty or malformed answer falls back to the input truncated in
//!   similarity order;
//! * a transport failure is retried with backoff, then falls back the same way;
//! * a short answer either falls back or is topped up, per [`ShortfallPolicy`].
//!
//! Stage 1 survivors keep similarity order, so a stage 2 fallback truncates in
//! similarity order too. Stage 2 output follows the oracle's ranking.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::catalog::{CatalogItem, Idx};
use crate::controls::{Budgets, CallTimeouts, RetryPolicy, ShortfallPolicy};
use crate::oracle::{OracleError, RankingOracle, Stage};

/// A catalog record with its retrieval similarity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    /// Catalog record.
    pub item: CatalogItem,
    /// Cosine similarity to the query.
    pub similarity: f32,
}

impl Candidate {
    /// Identifier shortcut.
    pub fn idx(&self) -> Idx {
        self.item.idx
    }
}

/// A final result with its rank-derived score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedCandidate {
    /// Surviving candidate.
    pub candidate: Candidate,
    /// 0-based final position.
    pub rank: usize,
    /// `(n - rank) / n`, so the top pick scores 1.0.
    pub match_score: f32,
}

/// Why a stage ignored the oracle's answer, fully or partly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum Fallback {
    /// Every attempt failed at the transport level.
    Unavailable {
        /// Attempts made.
        attempts: usize,
    },
    /// The answer could not be parsed.
    Malformed,
    /// No offered identifier survived validation.
    Empty,
    /// Too few valid picks; input truncated instead.
    Shortfall {
        /// Valid picks.
        picked: usize,
        /// Requested count.
        wanted: usize,
    },
    /// Too few valid picks; topped up from the input.
    Backfilled {
        /// Valid picks.
        picked: usize,
        /// Requested count.
        wanted: usize,
    },
}

/// Validated selection for one stage, as identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    /// Stage output, a subset of the input of length `<= wanted`.
    pub ids: Vec<Idx>,
    /// Oracle entries dropped as unknown or repeated.
    pub discarded: usize,
    /// Set when the oracle answer was not used as-is.
    pub fallback: Option<Fallback>,
}

/// Reconciles oracle `picks` against the stage `input` (in similarity order).
///
/// `picks = Err(reason)` means the oracle produced no usable answer. With
/// `keep_input_order` the surviving picks are re-emitted in input order,
/// otherwise in pick order.
pub fn reconcile(
    input: &[Idx],
    picks: Result<&[Idx], Fallback>,
    wanted: usize,
    keep_input_order: bool,
    policy: ShortfallPolicy,
) -> Reconciled {
    let wanted = wanted.min(input.len());
    let truncated = || input.iter().copied().take(wanted).collect::<Vec<_>>();
    let picks = match picks {
        Ok(picks) => picks,
        Err(reason) => {
            return Reconciled {
                ids: truncated(),
                discarded: 0,
                fallback: Some(reason),
            }
        }
    };

    let offered: HashSet<Idx> = input.iter().copied().collect();
    let mut seen = HashSet::with_capacity(wanted);
    let mut valid = Vec::with_capacity(wanted);
    let mut discarded = 0usize;
    for idx in picks {
        if offered.contains(idx) && seen.insert(*idx) {
            if valid.len() < wanted {
                valid.push(*idx);
            }
        } else {
            discarded += 1;
        }
    }

    if valid.is_empty() && wanted > 0 {
        return Reconciled {
            ids: truncated(),
            discarded,
            fallback: Some(Fallback::Empty),
        };
    }

    let picked = valid.len();
    let mut fallback = None;
    if picked < wanted {
        match policy {
            ShortfallPolicy::Fallback => {
                return Reconciled {
                    ids: truncated(),
                    discarded,
                    fallback: Some(Fallback::Shortfall { picked, wanted }),
                };
            }
            ShortfallPolicy::Backfill => {
                let chosen: HashSet<Idx> = valid.iter().copied().collect();
                valid.extend(
                    input
                        .iter()
                        .copied()
                        .filter(|idx| !chosen.contains(idx))
                        .take(wanted - picked),
                );
                fallback = Some(Fallback::Backfilled { picked, wanted });
            }
        }
    }

    if keep_input_order {
        let chosen: HashSet<Idx> = valid.iter().copied().collect();
        valid = input
            .iter()
            .copied()
            .filter(|idx| chosen.contains(idx))
            .collect();
    }

    Reconciled {
        ids: valid,
        discarded,
        fallback,
    }
}

/// What happened in one stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    /// Stage label.
    pub stage: Stage,
    /// Candidates shown to the oracle.
    pub offered: usize,
    /// Requested survivors.
    pub requested: usize,
    /// Oracle calls made (0 when the input was empty).
    pub attempts: usize,
    /// Oracle entries dropped as unknown or repeated.
    pub discarded: usize,
    /// Stage output identifiers, in output order.
    pub selected: Vec<Idx>,
    /// Set when the oracle answer was not used as-is.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<Fallback>,
}

/// Output of a full cascade run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CascadeOutcome {
    /// Final ranked results, at most `k2`.
    pub ranked: Vec<RankedCandidate>,
    /// Coarse pass report.
    pub stage1: StageReport,
    /// Fine pass report.
    pub stage2: StageReport,
}

/// Runs the two oracle stages over ANN candidates.
#[derive(Clone)]
pub struct CascadeRanker {
    oracle: Arc<dyn RankingOracle>,
    retry: RetryPolicy,
    oracle_timeout: Duration,
    shortfall: ShortfallPolicy,
}

impl CascadeRanker {
    /// Ranker with default retry, the default oracle deadline and the fallback
    /// shortfall policy.
    pub fn new(oracle: Arc<dyn RankingOracle>) -> Self {
        Self {
            oracle,
            retry: RetryPolicy::default(),
            oracle_timeout: CallTimeouts::default().oracle,
            shortfall: ShortfallPolicy::default(),
        }
    }

    /// Overrides the retry policy for transport failures.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Overrides the per-attempt oracle deadline.
    pub fn with_oracle_timeout(mut self, timeout: Duration) -> Self {
        self.oracle_timeout = timeout;
        self
    }

    /// Overrides the shortfall policy.
    pub fn with_shortfall(mut self, shortfall: ShortfallPolicy) -> Self {
        self.shortfall = shortfall;
        self
    }

    /// Reduces `candidates` (in similarity order, at most `k0`) to at most `k2` ranked results.
    #[instrument(
        skip_all,
        fields(candidates = candidates.len(), k1 = budgets.k1(), k2 = budgets.k2())
    )]
    pub async fn rank(
        &self,
        profile: &str,
        mut candidates: Vec<Candidate>,
        budgets: &Budgets,
    ) -> CascadeOutcome {
        candidates.truncate(budgets.k0());
        let (survivors, stage1) = self
            .run_stage(Stage::Titles, profile, candidates, budgets.k1())
            .await;
        let (finalists, stage2) = self
            .run_stage(Stage::Details, profile, survivors, budgets.k2())
            .await;
        let total = finalists.len();
        let ranked = finalists
            .into_iter()
            .enumerate()
            .map(|(rank, candidate)| RankedCandidate {
                candidate,
                rank,
                match_score: rank_score(rank, total),
            })
            .collect();
        CascadeOutcome {
            ranked,
            stage1,
            stage2,
        }
    }

    /// Runs one stage: consult the oracle, validate, and fall back as needed.
    pub async fn run_stage(
        &self,
        stage: Stage,
        profile: &str,
        input: Vec<Candidate>,
        k: usize,
    ) -> (Vec<Candidate>, StageReport) {
        let wanted = k.min(input.len());
        let ids: Vec<Idx> = input.iter().map(Candidate::idx).collect();
        let (answer, attempts) = if wanted == 0 {
            (Ok(Vec::new()), 0)
        } else {
            self.consult(stage, profile, &input, wanted).await
        };

        let reconciled = match &answer {
            Ok(picks) => reconcile(
                &ids,
                Ok(picks.as_slice()),
                wanted,
                stage == Stage::Titles,
                self.shortfall,
            ),
            Err(OracleError::Malformed(reason)) => {
                warn!(
                    %stage,
                    reason = %reason,
                    "oracle answer malformed, keeping similarity order"
                );
                reconcile(&ids, Err(Fallback::Malformed), wanted, true, self.shortfall)
            }
            Err(OracleError::Unavailable(err)) => {
                warn!(
                    %stage,
                    attempts,
                    error = %format!("{err:#}"),
                    "oracle unavailable, keeping similarity order"
                );
                reconcile(
                    &ids,
                    Err(Fallback::Unavailable { attempts }),
                    wanted,
                    true,
                    self.shortfall,
                )
            }
        };
        if reconciled.discarded > 0 {
            warn!(
                %stage,
                discarded = reconciled.discarded,
                "dropped unknown or repeated oracle picks"
            );
        }
        if answer.is_ok() {
            if let Some(fallback) = reconciled.fallback {
                warn!(%stage, ?fallback, "oracle answer incomplete");
            }
        }

        let mut pool: Vec<Option<Candidate>> = input.into_iter().map(Some).collect();
        let selected: Vec<Candidate> = reconciled
            .ids
            .iter()
            .filter_map(|idx| {
                let pos = ids.iter().position(|id| id == idx)?;
                pool.get_mut(pos)?.take()
            })
            .collect();
        debug!(%stage, offered = ids.len(), kept = selected.len(), "stage complete");
        let report = StageReport {
            stage,
            offered: ids.len(),
            requested: wanted,
            attempts,
            discarded: reconciled.discarded,
            selected: reconciled.ids,
            fallback: reconciled.fallback,
        };
        (selected, report)
    }

    async fn consult(
        &self,
        stage: Stage,
        profile: &str,
        input: &[Candidate],
        k: usize,
    ) -> (Result<Vec<Idx>, OracleError>, usize) {
        let items: Vec<CatalogItem> = input.iter().map(|c| c.item.clone()).collect();
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let call = self.oracle.select_top_k(stage, profile, &items, k);
            let result = match tokio::time::timeout(self.oracle_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(OracleError::Unavailable(anyhow::anyhow!(
                    "oracle call timed out after {:?}",
                    self.oracle_timeout
                ))),
            };
            match result {
                Err(OracleError::Unavailable(err)) if attempt <= self.retry.max_retries() => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        %stage,
                        attempt,
                        ?delay,
                        error = %format!("{err:#}"),
                        "oracle call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return (other, attempt),
            }
        }
    }
}

/// Linear rank score in `(0, 1]`: `(total - rank) / total`.
pub fn rank_score(rank: usize, total: usize) -> f32 {
    if total == 0 {
        return 0.0;
    }
    (total.saturating_sub(rank)) as f32 / total as f32
}

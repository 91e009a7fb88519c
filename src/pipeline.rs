//! End-to-end matching: enrich, encode, search, load, cascade, assemble.
//!
//! The pipeline holds no per-request state. Every collaborator call carries
//! its own deadline, budgets are validated before the first external call,
//! and only encoding, index readiness and catalog failures fail a request.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::cascade::{Candidate, CascadeRanker, StageReport};
use crate::catalog::{arrange_in_order, CatalogItem, CatalogStore, Idx};
use crate::controls::{BudgetCeilings, Budgets, CallTimeouts};
use crate::embedder::QueryEncoder;
use crate::enricher::QueryEnricher;
use crate::error::RetrievalError;
use crate::gap::{GapPlanner, GapRequest};
use crate::index::{EmbeddingIndex, IndexCell, IndexError};
use crate::seniority::{seniority_level, SeniorityLevel};
use crate::vector::UnitVector;

/// Direct match request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRequest {
    /// Free-text profile.
    pub profile: String,
    /// ANN candidates override.
    #[serde(default)]
    pub k0: Option<usize>,
    /// Stage-1 survivors override.
    #[serde(default)]
    pub k1: Option<usize>,
    /// Final results override.
    #[serde(default)]
    pub k2: Option<usize>,
}

/// Gap-closing match request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapMatchRequest {
    /// The gap to close.
    #[serde(flatten)]
    pub gap: GapRequest,
    /// ANN candidates override.
    #[serde(default)]
    pub k0: Option<usize>,
    /// Stage-1 survivors override.
    #[serde(default)]
    pub k1: Option<usize>,
    /// Final results override.
    #[serde(default)]
    pub k2: Option<usize>,
}

/// One final match with display fields copied from the catalog.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Catalog identifier.
    pub idx: Idx,
    /// Display title.
    pub title: String,
    /// Employer.
    pub company: String,
    /// Location.
    pub location: String,
    /// Compensation range.
    pub compensation: String,
    /// Required experience.
    pub experience: String,
    /// Employment type.
    pub job_type: String,
    /// Long description.
    pub description: String,
    /// Skill list.
    pub skills: String,
    /// Listing URL, from the record or the configured template.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    /// Keyword-derived level.
    pub seniority_level: SeniorityLevel,
    /// Rank-derived relevance in `(0, 1]`.
    pub match_score: f32,
    /// Retrieval cosine similarity, for diagnostics.
    pub similarity: f32,
}

/// How the enrichment step went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Enrichment {
    /// No enricher configured.
    Disabled,
    /// Enriched text was used.
    Applied,
    /// Enricher failed, timed out or returned nothing; raw text was used.
    FellBack,
}

/// Diagnostics for one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchTrace {
    /// Budgets in effect.
    pub budgets: Budgets,
    /// Enrichment status.
    pub enrichment: Enrichment,
    /// ANN hits with no catalog record.
    pub catalog_missing: usize,
    /// Coarse pass report, absent when nothing was retrieved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage1: Option<StageReport>,
    /// Fine pass report, absent when nothing was retrieved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage2: Option<StageReport>,
}

/// Result of a match request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResponse {
    /// ANN identifiers in similarity order.
    pub retrieved: Vec<Idx>,
    /// Stage-1 survivors.
    pub stage1: Vec<Idx>,
    /// Final ranked matches, at most `k2`.
    pub results: Vec<MatchResult>,
    /// Diagnostics.
    pub trace: MatchTrace,
}

/// Result of a gap-closing request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GapMatchResponse {
    /// Synthesised target-state profile that was matched.
    pub future_profile: String,
    /// Matches for that profile.
    #[serde(flatten)]
    pub matches: MatchResponse,
}

/// Composes the index, encoder, enricher, catalog and cascade.
#[derive(Clone)]
pub struct MatchPipeline {
    index: IndexCell,
    encoder: Arc<dyn QueryEncoder>,
    enricher: Option<Arc<dyn QueryEnricher>>,
    catalog: Arc<dyn CatalogStore>,
    ranker: CascadeRanker,
    planner: GapPlanner,
    timeouts: CallTimeouts,
    defaults: Budgets,
    ceilings: BudgetCeilings,
    source_url_template: Option<String>,
}

impl MatchPipeline {
    /// Pipeline without enrichment, with default budgets, ceilings and timeouts.
    pub fn new(
        index: IndexCell,
        encoder: Arc<dyn QueryEncoder>,
        catalog: Arc<dyn CatalogStore>,
        ranker: CascadeRanker,
    ) -> Self {
        Self {
            index,
            encoder,
            enricher: None,
            catalog,
            ranker,
            planner: GapPlanner::template_only(),
            timeouts: CallTimeouts::default(),
            defaults: Budgets::default(),
            ceilings: BudgetCeilings::default(),
            source_url_template: None,
        }
    }

    /// Enables query enrichment.
    pub fn with_enricher(mut self, enricher: Arc<dyn QueryEnricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    /// Sets the target-state profile writer for [`MatchPipeline::match_gap`].
    pub fn with_planner(mut self, planner: GapPlanner) -> Self {
        self.planner = planner;
        self
    }

    /// Sets collaborator deadlines, including the per-attempt oracle deadline
    /// of the cascade.
    pub fn with_timeouts(mut self, timeouts: CallTimeouts) -> Self {
        self.ranker = self.ranker.with_oracle_timeout(timeouts.oracle);
        self.timeouts = timeouts;
        self
    }

    /// Sets budgets used when a direct request does not override them.
    pub fn with_default_budgets(mut self, budgets: Budgets) -> Self {
        self.defaults = budgets;
        self
    }

    /// Sets per-request budget ceilings.
    pub fn with_ceilings(mut self, ceilings: BudgetCeilings) -> Self {
        self.ceilings = ceilings;
        self
    }

    /// Sets a URL template with an `{idx}` placeholder for records without a source URL.
    pub fn with_source_url_template(mut self, template: impl Into<String>) -> Self {
        self.source_url_template = Some(template.into());
        self
    }

    /// Readiness handle shared with health reporting.
    pub fn index(&self) -> &IndexCell {
        &self.index
    }

    /// Matches a free-text profile against the catalog.
    #[instrument(skip_all, fields(k0 = ?request.k0, k1 = ?request.k1, k2 = ?request.k2))]
    pub async fn match_profile(
        &self,
        request: &MatchRequest,
    ) -> Result<MatchResponse, RetrievalError> {
        let budgets = self
            .defaults
            .with_overrides(request.k0, request.k1, request.k2)?
            .within(&self.ceilings)?;
        self.run(&request.profile, budgets).await
    }

    /// Synthesises a target-state profile and matches it.
    ///
    /// Budgets default to 100/30/15 regardless of the direct-match defaults.
    #[instrument(skip_all, fields(target = %request.gap.target_position))]
    pub async fn match_gap(
        &self,
        request: &GapMatchRequest,
    ) -> Result<GapMatchResponse, RetrievalError> {
        let budgets = Budgets::default()
            .with_overrides(request.k0, request.k1, request.k2)?
            .within(&self.ceilings)?;
        if request.gap.target_position.trim().is_empty() {
            return Err(RetrievalError::EmptyProfile);
        }
        self.ready_index()?;
        let future_profile = self.planner.future_profile(&request.gap).await;
        let matches = self.run(&future_profile, budgets).await?;
        Ok(GapMatchResponse {
            future_profile,
            matches,
        })
    }

    fn ready_index(&self) -> Result<&EmbeddingIndex, RetrievalError> {
        self.index.get().ok_or(RetrievalError::IndexUnready)
    }

    async fn run(&self, profile: &str, budgets: Budgets) -> Result<MatchResponse, RetrievalError> {
        if profile.trim().is_empty() {
            return Err(RetrievalError::EmptyProfile);
        }
        let index = self.ready_index()?;

        let (query_text, enrichment) = self.enrich(profile).await;
        let query = self.encode(&query_text, index.dimension()).await?;

        let hits = match index.search(&query, budgets.k0()) {
            Ok(hits) => hits,
            Err(err @ IndexError::QueryDimension { .. }) => {
                return Err(RetrievalError::Encoding(err.into()))
            }
            Err(err) => return Err(err.into()),
        };
        let retrieved: Vec<Idx> = hits.iter().map(|hit| hit.idx).collect();
        info!(retrieved = retrieved.len(), "ann search complete");
        let mut trace = MatchTrace {
            budgets,
            enrichment,
            catalog_missing: 0,
            stage1: None,
            stage2: None,
        };
        if retrieved.is_empty() {
            return Ok(MatchResponse {
                retrieved,
                stage1: Vec::new(),
                results: Vec::new(),
                trace,
            });
        }

        let items = self.load_catalog(&retrieved).await?;
        let ordered = arrange_in_order(&retrieved, items);
        trace.catalog_missing = retrieved.len() - ordered.len();
        if trace.catalog_missing > 0 {
            warn!(
                missing = trace.catalog_missing,
                "retrieved identifiers without catalog records"
            );
        }
        let similarity: HashMap<Idx, f32> = hits.iter().map(|hit| (hit.idx, hit.score)).collect();
        let candidates: Vec<Candidate> = ordered
            .into_iter()
            .map(|item| Candidate {
                similarity: similarity.get(&item.idx).copied().unwrap_or_default(),
                item,
            })
            .collect();

        let outcome = self.ranker.rank(profile, candidates, &budgets).await;
        let results = outcome
            .ranked
            .into_iter()
            .map(|ranked| self.assemble(ranked.candidate, ranked.match_score))
            .collect::<Vec<_>>();
        debug!(results = results.len(), "match assembled");
        let stage1 = outcome.stage1.selected.clone();
        trace.stage1 = Some(outcome.stage1);
        trace.stage2 = Some(outcome.stage2);
        Ok(MatchResponse {
            retrieved,
            stage1,
            results,
            trace,
        })
    }

    async fn enrich(&self, profile: &str) -> (String, Enrichment) {
        let Some(enricher) = &self.enricher else {
            return (profile.to_string(), Enrichment::Disabled);
        };
        match tokio::time::timeout(self.timeouts.enricher, enricher.enrich(profile)).await {
            Ok(Ok(text)) if !text.trim().is_empty() => (text, Enrichment::Applied),
            Ok(Ok(_)) => {
                warn!("enricher returned empty text, using raw profile");
                (profile.to_string(), Enrichment::FellBack)
            }
            Ok(Err(err)) => {
                warn!(error = %format!("{err:#}"), "enrichment failed, using raw profile");
                (profile.to_string(), Enrichment::FellBack)
            }
            Err(_) => {
                warn!(timeout = ?self.timeouts.enricher, "enrichment timed out, using raw profile");
                (profile.to_string(), Enrichment::FellBack)
            }
        }
    }

    async fn encode(&self, text: &str, dimension: usize) -> Result<UnitVector, RetrievalError> {
        let raw = tokio::time::timeout(self.timeouts.encoder, self.encoder.encode(text))
            .await
            .map_err(|_| {
                RetrievalError::Encoding(anyhow::anyhow!(
                    "query encoder timed out after {:?}",
                    self.timeouts.encoder
                ))
            })?
            .map_err(RetrievalError::Encoding)?;
        let query = UnitVector::normalize(raw)
            .map_err(|err| RetrievalError::Encoding(anyhow::Error::new(err)))?;
        if dimension != 0 && query.dimension() != dimension {
            return Err(RetrievalError::Encoding(anyhow::anyhow!(
                "query vector has dimension {}, index has {dimension}",
                query.dimension()
            )));
        }
        Ok(query)
    }

    async fn load_catalog(&self, ids: &[Idx]) -> Result<Vec<CatalogItem>, RetrievalError> {
        tokio::time::timeout(self.timeouts.catalog, self.catalog.load_by_ids(ids))
            .await
            .map_err(|_| {
                RetrievalError::Catalog(anyhow::anyhow!(
                    "catalog lookup timed out after {:?}",
                    self.timeouts.catalog
                ))
            })?
            .map_err(RetrievalError::Catalog)
    }

    fn assemble(&self, candidate: Candidate, match_score: f32) -> MatchResult {
        let Candidate { item, similarity } = candidate;
        let seniority_level = seniority_level(&item);
        let source_url = item.source_url.clone().or_else(|| {
            self.source_url_template
                .as_ref()
                .map(|template| template.replace("{idx}", &item.idx.to_string()))
        });
        MatchResult {
            idx: item.idx,
            title: item.title,
            company: item.company,
            location: item.location,
            compensation: item.compensation,
            experience: item.experience,
            job_type: item.job_type,
            description: item.description,
            skills: item.skills,
            source_url,
            seniority_level,
            match_score,
            similarity,
        }
    }
}

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cascade_match::catalog::{CatalogItem, MemoryCatalog};
use cascade_match::embedder::QueryEncoder;
use cascade_match::index::{EmbeddingIndex, EmbeddingRecord, HnswConfig, IndexCell};
use cascade_match::oracle::{Reply, StaticOracle};
use cascade_match::pipeline::{MatchPipeline, MatchRequest};
use cascade_match::{CascadeRanker, Fallback, RetrievalError, UnitVector};
use pretty_assertions::assert_eq;

const A: u64 = 10;
const B: u64 = 20;
const C: u64 = 30;

/// Returns a fixed vector and counts calls.
struct FixedEncoder {
    vector: Vec<f32>,
    calls: AtomicUsize,
}

impl FixedEncoder {
    fn new(vector: Vec<f32>) -> Arc<Self> {
        Arc::new(Self {
            vector,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueryEncoder for FixedEncoder {
    async fn encode(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.vector.clone())
    }
}

fn record(idx: u64, raw: Vec<f32>) -> EmbeddingRecord {
    EmbeddingRecord {
        idx,
        vector: UnitVector::normalize(raw).unwrap(),
    }
}

fn abc_index() -> IndexCell {
    let index = EmbeddingIndex::build(
        vec![
            record(C, vec![0.0, 1.0]),
            record(A, vec![1.0, 0.0]),
            record(B, vec![0.9, 0.1]),
        ],
        HnswConfig::default(),
    )
    .unwrap();
    IndexCell::ready(index)
}

fn abc_catalog() -> Arc<MemoryCatalog> {
    Arc::new(MemoryCatalog::from_items(vec![
        CatalogItem::new(A, "Auditor"),
        CatalogItem::new(B, "Audit assistant"),
        CatalogItem::new(C, "Barista"),
    ]))
}

fn pipeline(
    index: IndexCell,
    encoder: Arc<FixedEncoder>,
    oracle: Arc<StaticOracle>,
) -> MatchPipeline {
    MatchPipeline::new(index, encoder, abc_catalog(), CascadeRanker::new(oracle))
}

fn request(k0: usize, k1: usize, k2: usize) -> MatchRequest {
    MatchRequest {
        profile: "Chartered accountant with audit experience".into(),
        k0: Some(k0),
        k1: Some(k1),
        k2: Some(k2),
    }
}

#[tokio::test]
async fn narrows_three_items_to_the_best_one() {
    let oracle = Arc::new(StaticOracle::new(
        Reply::Select(vec![A, B]),
        Reply::Select(vec![A]),
    ));
    let encoder = FixedEncoder::new(vec![1.0, 0.01]);
    let response = pipeline(abc_index(), encoder.clone(), oracle.clone())
        .match_profile(&request(3, 2, 1))
        .await
        .unwrap();

    assert_eq!(response.retrieved, vec![A, B, C]);
    assert_eq!(response.stage1, vec![A, B]);
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].idx, A);
    assert_eq!(response.results[0].title, "Auditor");
    assert_eq!(response.results[0].match_score, 1.0);

    let calls = oracle.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].offered, vec![A, B, C]);
    assert_eq!(calls[0].k, 2);
    assert_eq!(calls[1].offered, vec![A, B]);
    assert_eq!(calls[1].k, 1);
    assert_eq!(encoder.calls(), 1);
}

#[tokio::test]
async fn repeated_runs_are_identical() {
    let oracle = Arc::new(StaticOracle::new(
        Reply::Select(vec![B, A]),
        Reply::Select(vec![B, A]),
    ));
    let pipeline = pipeline(abc_index(), FixedEncoder::new(vec![1.0, 0.2]), oracle);
    let first = pipeline.match_profile(&request(3, 2, 2)).await.unwrap();
    let second = pipeline.match_profile(&request(3, 2, 2)).await.unwrap();
    assert_eq!(first, second);
    let ids: Vec<u64> = first.results.iter().map(|row| row.idx).collect();
    assert_eq!(ids, vec![B, A]);
}

#[tokio::test]
async fn inverted_budgets_are_rejected_before_any_call() {
    let oracle = Arc::new(StaticOracle::new(
        Reply::Select(vec![A]),
        Reply::Select(vec![A]),
    ));
    let encoder = FixedEncoder::new(vec![1.0, 0.0]);
    let result = pipeline(abc_index(), encoder.clone(), oracle.clone())
        .match_profile(&request(2, 3, 1))
        .await;
    assert!(matches!(result, Err(RetrievalError::InvalidBudget(_))));
    assert_eq!(encoder.calls(), 0);
    assert!(oracle.calls().is_empty());
}

#[tokio::test]
async fn empty_index_gives_empty_result() {
    let empty = IndexCell::ready(EmbeddingIndex::build(Vec::new(), HnswConfig::default()).unwrap());
    let oracle = Arc::new(StaticOracle::new(
        Reply::Select(vec![A]),
        Reply::Select(vec![A]),
    ));
    let response = pipeline(empty, FixedEncoder::new(vec![1.0, 0.0]), oracle.clone())
        .match_profile(&request(3, 2, 1))
        .await
        .unwrap();
    assert!(response.retrieved.is_empty());
    assert!(response.results.is_empty());
    assert!(oracle.calls().is_empty());
}

#[tokio::test]
async fn invented_identifiers_never_reach_the_output() {
    let oracle = Arc::new(StaticOracle::new(
        Reply::Select(vec![999, A, B]),
        Reply::Select(vec![C, 12345, B]),
    ));
    let response = pipeline(abc_index(), FixedEncoder::new(vec![1.0, 0.0]), oracle)
        .match_profile(&request(3, 2, 2))
        .await
        .unwrap();
    assert_eq!(response.stage1, vec![A, B]);
    let ids: Vec<u64> = response.results.iter().map(|row| row.idx).collect();
    assert!(!ids.contains(&999));
    assert!(!ids.contains(&12345));
    assert!(!ids.contains(&C));
    assert!(ids.iter().all(|idx| response.stage1.contains(idx)));
    let stage2 = response.trace.stage2.unwrap();
    assert_eq!(stage2.discarded, 2);
}

#[tokio::test]
async fn malformed_detail_answer_keeps_similarity_order() {
    let oracle = Arc::new(StaticOracle::new(
        Reply::Select(vec![C, B, A]),
        Reply::Malformed,
    ));
    let response = pipeline(abc_index(), FixedEncoder::new(vec![1.0, 0.0]), oracle)
        .match_profile(&request(3, 3, 2))
        .await
        .unwrap();
    assert_eq!(response.stage1, vec![A, B, C]);
    let ids: Vec<u64> = response.results.iter().map(|row| row.idx).collect();
    assert_eq!(ids, vec![A, B]);
    assert_eq!(
        response.trace.stage2.and_then(|report| report.fallback),
        Some(Fallback::Malformed)
    );
}

#[tokio::test]
async fn unreachable_oracle_degrades_instead_of_failing() {
    let oracle = Arc::new(StaticOracle::new(Reply::Unavailable, Reply::Unavailable));
    let ranker = CascadeRanker::new(oracle.clone())
        .with_retry(cascade_match::RetryPolicy::none());
    let response = MatchPipeline::new(
        abc_index(),
        FixedEncoder::new(vec![1.0, 0.0]),
        abc_catalog(),
        ranker,
    )
    .match_profile(&request(3, 2, 1))
    .await
    .unwrap();
    assert_eq!(response.stage1, vec![A, B]);
    assert_eq!(response.results[0].idx, A);
    assert_eq!(oracle.calls().len(), 2);
}

#[tokio::test]
async fn missing_catalog_records_are_skipped() {
    let catalog = Arc::new(MemoryCatalog::from_items(vec![
        CatalogItem::new(A, "Auditor"),
        CatalogItem::new(C, "Barista"),
    ]));
    let oracle = Arc::new(StaticOracle::new(
        Reply::Select(vec![A, C]),
        Reply::Select(vec![C, A]),
    ));
    let response = MatchPipeline::new(
        abc_index(),
        FixedEncoder::new(vec![1.0, 0.0]),
        catalog,
        CascadeRanker::new(oracle),
    )
    .match_profile(&request(3, 2, 2))
    .await
    .unwrap();
    assert_eq!(response.retrieved, vec![A, B, C]);
    assert_eq!(response.trace.catalog_missing, 1);
    let ids: Vec<u64> = response.results.iter().map(|row| row.idx).collect();
    assert_eq!(ids, vec![C, A]);
}

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use cascade_match::catalog::postgres::{PgCatalog, TableName};
use cascade_match::catalog::{CatalogStore, MemoryCatalog};
use cascade_match::controls::{BudgetArgs, BudgetCeilings, CallArgs};
use cascade_match::embedder::{BlockingEncoder, CachedEncoder, EmbedderArgs};
use cascade_match::enricher::LlmEnricher;
use cascade_match::gap::GapPlanner;
use cascade_match::index::{EmbeddingIndex, HnswConfig, IndexCell, IndexStats};
use cascade_match::llm::LlmArgs;
use cascade_match::oracle::LlmRankingOracle;
use cascade_match::pipeline::{
    GapMatchRequest, GapMatchResponse, MatchPipeline, MatchRequest, MatchResponse,
};
use cascade_match::telemetry::init_tracing;
use cascade_match::{CascadeRanker, RetrievalError};
use clap::Parser;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "match-api",
    about = "HTTP API that matches free-text profiles against an embedded catalog"
)]
struct ApiCli {
    /// Address to bind the HTTP server to (host:port).
    #[arg(long, env = "CASCADE_BIND", default_value = "127.0.0.1:8080")]
    bind: String,

    /// Directory holding embeddings_batch_<n>.npy / indices_batch_<n>.npy shard pairs.
    #[arg(long, env = "CASCADE_EMBEDDINGS_DIR")]
    embeddings_dir: PathBuf,

    /// Catalog JSONL file loaded into memory (alternative to --database-url).
    #[arg(long, env = "CASCADE_CATALOG_JSONL", conflicts_with = "database_url")]
    catalog_jsonl: Option<PathBuf>,

    /// Postgres connection string for the catalog table (postgres://...).
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Schema of the catalog table.
    #[arg(long, env = "CASCADE_CATALOG_SCHEMA", default_value = "public")]
    catalog_schema: String,

    /// Catalog table name.
    #[arg(long, env = "CASCADE_CATALOG_TABLE", default_value = "vacancies")]
    catalog_table: String,

    /// HNSW graph degree.
    #[arg(long, default_value_t = 32)]
    hnsw_max_connections: usize,

    /// HNSW candidate list size while building.
    #[arg(long, default_value_t = 200)]
    hnsw_ef_construction: usize,

    /// Minimum HNSW candidate list size while searching.
    #[arg(long, default_value_t = 128)]
    hnsw_ef_search: usize,

    /// Max cached query embeddings kept in-memory (0 disables caching).
    #[arg(long, default_value_t = 1024)]
    embedding_cache_size: usize,

    /// Max requests per minute allowed (0 disables rate limiting).
    #[arg(long, default_value_t = 120)]
    max_requests_per_minute: u32,

    /// Rate-limit burst size (tokens available instantly).
    #[arg(long, default_value_t = 12)]
    rate_limit_burst: u32,

    /// URL template for records without a source URL; `{idx}` is substituted.
    #[arg(long, env = "CASCADE_SOURCE_URL_TEMPLATE")]
    source_url_template: Option<String>,

    /// Encode the raw profile instead of an LLM-enriched rewrite.
    #[arg(long)]
    no_enrich: bool,

    /// Emit logs as JSON lines.
    #[arg(long, env = "CASCADE_LOG_JSON")]
    log_json: bool,

    #[command(flatten)]
    budgets: BudgetArgs,

    #[command(flatten)]
    calls: CallArgs,

    #[command(flatten)]
    llm: LlmArgs,

    #[command(flatten)]
    embedder: EmbedderArgs,
}

#[derive(Clone)]
struct AppState {
    pipeline: MatchPipeline,
    rate_limiter: Option<RateLimiter>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = ApiCli::parse();
    init_tracing(cli.log_json);

    let defaults = cli.budgets.build_budgets()?;
    let timeouts = cli.calls.build_timeouts();
    let catalog = open_catalog(&cli).await?;
    let provider = cli.llm.build_provider()?;
    let encoder = CachedEncoder::maybe_wrap(
        Arc::new(BlockingEncoder::new(cli.embedder.build()?)),
        cli.embedding_cache_size,
    );
    let ranker = CascadeRanker::new(Arc::new(LlmRankingOracle::new(provider.clone())))
        .with_retry(cli.calls.build_retry())
        .with_shortfall(cli.calls.shortfall);

    let cell = IndexCell::new();
    let mut pipeline = MatchPipeline::new(cell.clone(), encoder, catalog, ranker)
        .with_planner(GapPlanner::new(provider.clone(), timeouts.enricher))
        .with_timeouts(timeouts)
        .with_default_budgets(defaults)
        .with_ceilings(BudgetCeilings::default());
    if !cli.no_enrich {
        pipeline = pipeline.with_enricher(Arc::new(LlmEnricher::new(provider)));
    }
    if let Some(template) = &cli.source_url_template {
        pipeline = pipeline.with_source_url_template(template.clone());
    }

    let state = AppState {
        pipeline,
        rate_limiter: RateLimiter::new(cli.max_requests_per_minute, cli.rate_limit_burst),
    };
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/match", post(match_handler))
        .route("/v1/match/gap", post(gap_handler))
        .with_state(state);

    let addr: SocketAddr = cli
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", cli.bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "match-api listening");

    let config = HnswConfig {
        max_connections: cli.hnsw_max_connections.max(2),
        ef_construction: cli.hnsw_ef_construction.max(1),
        ef_search: cli.hnsw_ef_search.max(1),
    };
    // health checks answer 503 while the index builds
    let server = tokio::spawn(async move { axum::serve(listener, app).await });
    build_index(cli.embeddings_dir.clone(), config, cell).await?;
    server
        .await
        .context("server task panicked")?
        .context("server shutdown")?;
    Ok(())
}

async fn open_catalog(cli: &ApiCli) -> Result<Arc<dyn CatalogStore>> {
    match (&cli.catalog_jsonl, &cli.database_url) {
        (Some(path), _) => {
            let catalog = MemoryCatalog::from_jsonl(path)?;
            info!(items = catalog.len(), path = %path.display(), "loaded catalog");
            Ok(Arc::new(catalog))
        }
        (None, Some(url)) => {
            let table = TableName::new(cli.catalog_schema.clone(), cli.catalog_table.clone())?;
            Ok(Arc::new(PgCatalog::connect(url, &table).await?))
        }
        (None, None) => bail!("either --catalog-jsonl or --database-url is required"),
    }
}

async fn build_index(dir: PathBuf, config: HnswConfig, cell: IndexCell) -> Result<()> {
    let start = Instant::now();
    let label = dir.display().to_string();
    let index = tokio::task::spawn_blocking(move || EmbeddingIndex::build_from_dir(&dir, config))
        .await
        .context("index build task join error")?
        .with_context(|| format!("failed to build index from {label}"))?;
    info!(
        items = index.len(),
        dimension = index.dimension(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "embedding index ready"
    );
    cell.fill(index)?;
    Ok(())
}

async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<IndexStats>) {
    let stats = state.pipeline.index().stats();
    let status = if stats.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(stats))
}

async fn match_handler(
    State(state): State<AppState>,
    Json(request): Json<MatchRequest>,
) -> Result<Json<MatchResponse>, ApiError> {
    throttle(&state).await?;
    let start = Instant::now();
    let response = state
        .pipeline
        .match_profile(&request)
        .await
        .map_err(retrieval_error)?;
    info!(
        results = response.results.len(),
        latency_ms = start.elapsed().as_secs_f64() * 1000.0,
        "match served"
    );
    Ok(Json(response))
}

async fn gap_handler(
    State(state): State<AppState>,
    Json(request): Json<GapMatchRequest>,
) -> Result<Json<GapMatchResponse>, ApiError> {
    throttle(&state).await?;
    let start = Instant::now();
    let response = state
        .pipeline
        .match_gap(&request)
        .await
        .map_err(retrieval_error)?;
    info!(
        results = response.matches.results.len(),
        latency_ms = start.elapsed().as_secs_f64() * 1000.0,
        "gap match served"
    );
    Ok(Json(response))
}

async fn throttle(state: &AppState) -> Result<(), ApiError> {
    if let Some(limiter) = &state.rate_limiter {
        if !limiter.acquire().await {
            return Err(error_body(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded"));
        }
    }
    Ok(())
}

fn status_for(err: &RetrievalError) -> StatusCode {
    match err {
        RetrievalError::InvalidBudget(_) | RetrievalError::EmptyProfile => StatusCode::BAD_REQUEST,
        RetrievalError::IndexUnready => StatusCode::SERVICE_UNAVAILABLE,
        RetrievalError::Encoding(_) => StatusCode::BAD_GATEWAY,
        RetrievalError::Index(_) | RetrievalError::Catalog(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn retrieval_error(err: RetrievalError) -> ApiError {
    let status = status_for(&err);
    if err.is_client_error() {
        warn!(error = %err, "rejected match request");
    } else {
        error!(error = %err, status = status.as_u16(), "match request failed");
    }
    error_body(status, err.to_string())
}

fn error_body(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
}

#[derive(Clone)]
struct RateLimiter {
    state: Arc<Mutex<RateState>>,
    capacity: f64,
    refill_per_sec: f64,
}

struct RateState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    fn new(max_per_minute: u32, burst: u32) -> Option<Self> {
        if max_per_minute == 0 || burst == 0 {
            return None;
        }
        let capacity = burst as f64;
        let refill_per_sec = max_per_minute as f64 / 60.0;
        Some(Self {
            state: Arc::new(Mutex::new(RateState {
                tokens: capacity,
                last_refill: Instant::now(),
            })),
            capacity,
            refill_per_sec,
        })
    }

    async fn acquire(&self) -> bool {
        let mut guard = self.state.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(guard.last_refill).as_secs_f64();
        guard.last_refill = now;
        guard.tokens = (guard.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if guard.tokens >= 1.0 {
            guard.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

//! Query encoding: HTTP embedding clients and the async encoder seam used by the pipeline.

pub mod openai;

use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use clap::Args;
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::debug;

use self::openai::OpenAiEmbedder;

/// Blocking client that embeds a batch of texts in one request.
pub trait BatchEmbedder: Send + Sync {
    /// Embeds `inputs`, returning one vector per input in order.
    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// Largest batch accepted by [`BatchEmbedder::embed_batch`].
    fn batch_size(&self) -> usize;
}

/// Turns query text into a raw (not yet normalised) embedding.
#[async_trait]
pub trait QueryEncoder: Send + Sync {
    /// Encodes one query.
    async fn encode(&self, text: &str) -> Result<Vec<f32>>;
}

/// Adapts a blocking [`BatchEmbedder`] to [`QueryEncoder`] via the blocking pool.
pub struct BlockingEncoder {
    inner: Arc<dyn BatchEmbedder>,
}

impl BlockingEncoder {
    /// Wraps `inner`.
    pub fn new(inner: Arc<dyn BatchEmbedder>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl QueryEncoder for BlockingEncoder {
    async fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let embedder = self.inner.clone();
        let query = text.to_string();
        tokio::task::spawn_blocking(move || {
            let mut embeddings = embedder.embed_batch(&[query.as_str()])?;
            embeddings
                .pop()
                .ok_or_else(|| anyhow!("embedding service returned no vector"))
        })
        .await
        .map_err(|err| anyhow!("embedding task join error: {err}"))?
    }
}

/// LRU cache of encoder output keyed by the exact query text.
pub struct CachedEncoder {
    inner: Arc<dyn QueryEncoder>,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl CachedEncoder {
    /// Wraps `inner` with a cache of `capacity` entries.
    pub fn new(inner: Arc<dyn QueryEncoder>, capacity: NonZeroUsize) -> Self {
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Wraps `inner` only when `capacity` is non-zero.
    pub fn maybe_wrap(inner: Arc<dyn QueryEncoder>, capacity: usize) -> Arc<dyn QueryEncoder> {
        match NonZeroUsize::new(capacity) {
            Some(capacity) => Arc::new(Self::new(inner, capacity)),
            None => inner,
        }
    }
}

#[async_trait]
impl QueryEncoder for CachedEncoder {
    async fn encode(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(hit) = {
            let mut guard = self.cache.lock().await;
            guard.get(text).cloned()
        } {
            debug!("query embedding cache hit");
            return Ok(hit);
        }
        let embedding = self.inner.encode(text).await?;
        let mut guard = self.cache.lock().await;
        guard.put(text.to_string(), embedding.clone());
        Ok(embedding)
    }
}

/// Embedding client flags shared by the server and the offline shard job.
#[derive(Args, Debug, Clone)]
pub struct EmbedderArgs {
    /// Embedding model identifier.
    #[arg(
        long,
        env = "CASCADE_EMBED_MODEL",
        default_value = "text-embedding-3-small"
    )]
    pub embed_model: String,

    /// Optional embedding dimension override.
    #[arg(long, env = "CASCADE_EMBED_DIMENSIONS")]
    pub embed_dimensions: Option<usize>,

    /// Base URL for OpenAI-compatible endpoints.
    #[arg(
        long,
        env = "CASCADE_OPENAI_BASE",
        default_value = "https://api.openai.com/v1"
    )]
    pub openai_base_url: String,

    /// OpenAI API key used for embeddings.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub embed_openai_api_key: Option<String>,

    /// Max inputs per embedding request.
    #[arg(long, env = "CASCADE_EMBED_BATCH", default_value_t = 32)]
    pub embed_batch_size: usize,

    /// HTTP timeout applied by the embedding client itself.
    #[arg(long, env = "CASCADE_EMBED_HTTP_TIMEOUT_SECS", default_value_t = 30)]
    pub embed_http_timeout_secs: u64,

    /// Attempts for transient embedding errors.
    #[arg(long, env = "CASCADE_EMBED_MAX_RETRIES", default_value_t = 3)]
    pub embed_max_retries: usize,
}

impl EmbedderArgs {
    /// Builds the blocking embedder.
    pub fn build(&self) -> Result<Arc<dyn BatchEmbedder>> {
        Ok(Arc::new(OpenAiEmbedder::from_args(self)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl QueryEncoder for Counting {
        async fn encode(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![text.len() as f32, 1.0])
        }
    }

    struct FixedBatch;

    impl BatchEmbedder for FixedBatch {
        fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
            Ok(inputs.iter().map(|_| vec![0.0, 2.0]).collect())
        }

        fn batch_size(&self) -> usize {
            8
        }
    }

    #[tokio::test]
    async fn cache_serves_repeated_queries() {
        let inner = Arc::new(Counting {
            calls: AtomicUsize::new(0),
        });
        let cached = CachedEncoder::new(inner.clone(), NonZeroUsize::new(4).unwrap());
        let first = cached.encode("controller").await.unwrap();
        let second = cached.encode("controller").await.unwrap();
        cached.encode("analyst").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_capacity_disables_cache() {
        let inner = Arc::new(Counting {
            calls: AtomicUsize::new(0),
        });
        let encoder = CachedEncoder::maybe_wrap(inner.clone(), 0);
        encoder.encode("x").await.unwrap();
        encoder.encode("x").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn blocking_encoder_returns_single_vector() {
        let encoder = BlockingEncoder::new(Arc::new(FixedBatch));
        assert_eq!(encoder.encode("q").await.unwrap(), vec![0.0, 2.0]);
    }

    #[test]
    fn embedding_key_is_required() {
        let args = EmbedderArgs {
            embed_model: "text-embedding-3-small".into(),
            embed_dimensions: None,
            openai_base_url: "https://api.openai.com/v1".into(),
            embed_openai_api_key: None,
            embed_batch_size: 16,
            embed_http_timeout_secs: 5,
            embed_max_retries: 2,
        };
        let err = args.build().err().unwrap();
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }
}

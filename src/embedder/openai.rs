//! OpenAI-compatible `/embeddings` client used for catalog shards and queries.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::json;

use super::{BatchEmbedder, EmbedderArgs};
use crate::http::{json_client, post_json, ApiKey};

const SERVICE: &str = "OpenAI embeddings";

/// Blocking batch embedder for `{base_url}/embeddings`.
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimensions: Option<usize>,
    max_attempts: usize,
    batch_size: usize,
}

impl OpenAiEmbedder {
    /// Client configured from the shared embedder flags.
    pub fn from_args(args: &EmbedderArgs) -> Result<Self> {
        let api_key = args
            .embed_openai_api_key
            .as_deref()
            .context("OPENAI_API_KEY is required for embeddings")?;
        anyhow::ensure!(!args.embed_model.trim().is_empty(), "missing embedding model name");
        let client = json_client(
            SERVICE,
            ApiKey::Bearer(api_key),
            &[],
            Duration::from_secs(args.embed_http_timeout_secs.max(1)),
        )?;
        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", args.openai_base_url.trim_end_matches('/')),
            model: args.embed_model.trim().to_string(),
            dimensions: args.embed_dimensions,
            max_attempts: args.embed_max_retries.max(1),
            batch_size: args.embed_batch_size.max(1),
        })
    }
}

impl BatchEmbedder for OpenAiEmbedder {
    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        anyhow::ensure!(
            inputs.len() <= self.batch_size,
            "batch of {} exceeds configured max {}",
            inputs.len(),
            self.batch_size
        );
        let mut body = json!({ "model": self.model, "input": inputs });
        if let Some(dimensions) = self.dimensions {
            body["dimensions"] = json!(dimensions);
        }
        let reply: EmbeddingReply =
            post_json(&self.client, &self.endpoint, &body, self.max_attempts, SERVICE)?;
        reply.into_vectors(inputs.len(), self.dimensions)
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingReply {
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
    index: usize,
}

impl EmbeddingReply {
    /// Places each row at its `index`. Every input must get exactly one vector
    /// and all vectors must share one width.
    fn into_vectors(self, inputs: usize, dimensions: Option<usize>) -> Result<Vec<Vec<f32>>> {
        let mut slots: Vec<Option<Vec<f32>>> = vec![None; inputs];
        for row in self.data {
            let slot = slots
                .get_mut(row.index)
                .with_context(|| format!("embedding index {} out of range", row.index))?;
            anyhow::ensure!(slot.is_none(), "embedding index {} repeated", row.index);
            *slot = Some(row.embedding);
        }
        let vectors = slots
            .into_iter()
            .enumerate()
            .map(|(pos, slot)| slot.with_context(|| format!("no embedding for input {pos}")))
            .collect::<Result<Vec<_>>>()?;
        let width = dimensions.unwrap_or_else(|| vectors.first().map_or(0, Vec::len));
        if let Some(pos) = vectors.iter().position(|v| v.len() != width) {
            anyhow::bail!(
                "embedding {pos} has width {}, expected {width}",
                vectors[pos].len()
            );
        }
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn reply(raw: serde_json::Value) -> EmbeddingReply {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn rows_are_placed_by_index() {
        let parsed = reply(json!({"data": [
            {"embedding": [0.0, 1.0], "index": 1},
            {"embedding": [1.0, 0.0], "index": 0}
        ]}));
        assert_eq!(
            parsed.into_vectors(2, None).unwrap(),
            vec![vec![1.0, 0.0], vec![0.0, 1.0]]
        );
    }

    #[test]
    fn missing_or_repeated_rows_are_errors() {
        let short = reply(json!({"data": [{"embedding": [1.0], "index": 0}]}));
        assert!(short.into_vectors(2, None).is_err());

        let repeated = reply(json!({"data": [
            {"embedding": [1.0], "index": 0},
            {"embedding": [2.0], "index": 0}
        ]}));
        let err = repeated.into_vectors(2, None).unwrap_err();
        assert!(err.to_string().contains("repeated"));
    }

    #[test]
    fn widths_must_agree() {
        let mixed = reply(json!({"data": [
            {"embedding": [1.0, 0.0], "index": 0},
            {"embedding": [1.0], "index": 1}
        ]}));
        assert!(mixed.into_vectors(2, None).is_err());

        let narrow = reply(json!({"data": [{"embedding": [1.0, 0.0], "index": 0}]}));
        assert!(narrow.into_vectors(1, Some(3)).is_err());
    }
}

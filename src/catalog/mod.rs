//! Catalog records and the loader that resolves index identifiers to them.

pub mod postgres;

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Stable catalog identifier shared by the index shards and the catalog store.
pub type Idx = u64;

/// Immutable catalog record. Field aliases accept the scraped vacancy export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    /// Stable identifier.
    pub idx: Idx,
    /// Display title.
    #[serde(default)]
    pub title: String,
    /// Long description.
    #[serde(default)]
    pub description: String,
    /// Free-text skill list.
    #[serde(default, alias = "key_skills")]
    pub skills: String,
    /// Employer or provider.
    #[serde(default)]
    pub company: String,
    /// Location.
    #[serde(default)]
    pub location: String,
    /// Compensation range as published.
    #[serde(default, alias = "salary")]
    pub compensation: String,
    /// Required experience as published.
    #[serde(default)]
    pub experience: String,
    /// Employment type.
    #[serde(default)]
    pub job_type: String,
    /// Link to the original listing, when known.
    #[serde(default, alias = "hh_url", skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

impl CatalogItem {
    /// Minimal record with only an identifier and a title.
    pub fn new(idx: Idx, title: impl Into<String>) -> Self {
        Self {
            idx,
            title: title.into(),
            description: String::new(),
            skills: String::new(),
            company: String::new(),
            location: String::new(),
            compensation: String::new(),
            experience: String::new(),
            job_type: String::new(),
            source_url: None,
        }
    }

    /// Text submitted to the embedding model when building shards.
    pub fn embedding_text(&self) -> String {
        [&self.title, &self.description, &self.skills]
            .iter()
            .map(|part| part.trim())
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Fetches catalog records by identifier.
///
/// Implementations may return a strict subset of the requested identifiers
/// (missing records are dropped), must collapse duplicates, and make no
/// promise about output order. Use [`arrange_in_order`] to restore the
/// caller's priority order.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Loads the records for `ids`.
    async fn load_by_ids(&self, ids: &[Idx]) -> Result<Vec<CatalogItem>>;
}

/// Reorders `items` to follow `order`, dropping records not requested and
/// identifiers with no record. Duplicates in either input collapse to the
/// first occurrence.
pub fn arrange_in_order(order: &[Idx], items: Vec<CatalogItem>) -> Vec<CatalogItem> {
    let mut by_idx: HashMap<Idx, CatalogItem> = HashMap::with_capacity(items.len());
    for item in items {
        by_idx.entry(item.idx).or_insert(item);
    }
    order
        .iter()
        .filter_map(|idx| by_idx.remove(idx))
        .collect()
}

/// Distinct identifiers in first-seen order.
pub fn dedup_ids(ids: &[Idx]) -> Vec<Idx> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter().copied().filter(|idx| seen.insert(*idx)).collect()
}

/// In-process catalog, loaded from JSONL or built from records.
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    items: HashMap<Idx, CatalogItem>,
}

impl MemoryCatalog {
    /// Builds a catalog; later records with a repeated `idx` replace earlier ones.
    pub fn from_items(items: impl IntoIterator<Item = CatalogItem>) -> Self {
        let items = items.into_iter().map(|item| (item.idx, item)).collect();
        Self { items }
    }

    /// Reads one JSON [`CatalogItem`] per line. Blank lines are skipped.
    pub fn from_jsonl(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open catalog {}", path.display()))?;
        let items = read_jsonl(BufReader::new(file))?;
        info!(path = %path.display(), items = items.len(), "catalog loaded");
        Ok(Self::from_items(items))
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Parses catalog JSONL from any reader.
pub fn read_jsonl<R: BufRead>(reader: R) -> Result<Vec<CatalogItem>> {
    let mut items = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read catalog line {}", line_no + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let item: CatalogItem = serde_json::from_str(&line)
            .with_context(|| format!("invalid catalog record at line {}", line_no + 1))?;
        items.push(item);
    }
    Ok(items)
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn load_by_ids(&self, ids: &[Idx]) -> Result<Vec<CatalogItem>> {
        let found: Vec<CatalogItem> = dedup_ids(ids)
            .into_iter()
            .filter_map(|idx| self.items.get(&idx).cloned())
            .collect();
        debug!(requested = ids.len(), found = found.len(), "memory catalog lookup");
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn idxs(items: &[CatalogItem]) -> Vec<Idx> {
        items.iter().map(|item| item.idx).collect()
    }

    #[tokio::test]
    async fn memory_catalog_drops_missing_and_collapses_duplicates() {
        let catalog = MemoryCatalog::from_items(vec![
            CatalogItem::new(1, "Analyst"),
            CatalogItem::new(2, "Controller"),
            CatalogItem::new(3, "Auditor"),
        ]);
        let loaded = catalog.load_by_ids(&[3, 9, 1, 3]).await.unwrap();
        assert_eq!(idxs(&loaded), vec![3, 1]);
    }

    #[test]
    fn arrange_follows_caller_order() {
        let stored = vec![
            CatalogItem::new(1, "a"),
            CatalogItem::new(2, "b"),
            CatalogItem::new(3, "c"),
        ];
        let arranged = arrange_in_order(&[3, 7, 1, 3, 2], stored);
        assert_eq!(idxs(&arranged), vec![3, 1, 2]);
    }

    #[test]
    fn jsonl_accepts_export_field_names() {
        let input = concat!(
            r#"{"idx": 4, "title": "Treasury analyst", "key_skills": "Excel, SQL", "salary": "100-150k", "hh_url": "https://example.com/4"}"#,
            "\n\n",
            r#"{"idx": 5}"#,
            "\n"
        );
        let items = read_jsonl(input.as_bytes()).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].skills, "Excel, SQL");
        assert_eq!(items[0].compensation, "100-150k");
        assert_eq!(items[0].source_url.as_deref(), Some("https://example.com/4"));
        assert_eq!(items[1], CatalogItem::new(5, ""));
    }

    #[test]
    fn jsonl_errors_name_the_line() {
        let err = read_jsonl("{\"idx\": 1}\nnot json\n".as_bytes()).unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));
    }

    #[test]
    fn embedding_text_skips_empty_parts() {
        let mut item = CatalogItem::new(1, "Risk manager");
        item.skills = "VaR, Basel".into();
        assert_eq!(item.embedding_text(), "Risk manager\nVaR, Basel");
    }
}

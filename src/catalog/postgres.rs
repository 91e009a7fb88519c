//! Postgres-backed catalog store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error};

use super::{dedup_ids, CatalogItem, CatalogStore, Idx};

/// Fully-qualified Postgres table name (schema + table).
#[derive(Debug, Clone)]
pub struct TableName {
    schema: String,
    table: String,
}

impl TableName {
    /// Builds a new table identifier.
    pub fn new<S, T>(schema: S, table: T) -> Result<Self>
    where
        S: Into<String>,
        T: Into<String>,
    {
        let schema = schema.into();
        let table = table.into();
        anyhow::ensure!(!schema.trim().is_empty(), "schema name is required");
        anyhow::ensure!(!table.trim().is_empty(), "table name is required");
        Ok(Self { schema, table })
    }

    /// Fully-qualified table reference with quoted identifiers.
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }
}

/// Quotes Postgres identifiers, escaping embedded quotes.
pub fn quote_ident(input: &str) -> String {
    let escaped = input.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

/// Catalog rows read from a Postgres table keyed by a `BIGINT idx` column.
///
/// Text columns may be NULL; they are read as empty strings (or `None` for
/// `source_url`).
pub struct PgCatalog {
    client: Client,
    select_sql: String,
}

impl PgCatalog {
    /// Connects and spawns the connection driver on the current runtime.
    pub async fn connect(database_url: &str, table: &TableName) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .with_context(|| format!("failed to connect to Postgres at {database_url}"))?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!(error = %err, "postgres connection error");
            }
        });
        Ok(Self {
            client,
            select_sql: select_sql(table),
        })
    }
}

#[async_trait]
impl CatalogStore for PgCatalog {
    async fn load_by_ids(&self, ids: &[Idx]) -> Result<Vec<CatalogItem>> {
        let ids = dedup_ids(ids);
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys = ids
            .iter()
            .map(|idx| {
                i64::try_from(*idx).with_context(|| format!("idx {idx} exceeds BIGINT range"))
            })
            .collect::<Result<Vec<i64>>>()?;
        let rows = self
            .client
            .query(self.select_sql.as_str(), &[&keys])
            .await
            .context("catalog query failed")?;
        let items = rows.iter().map(item_from_row).collect::<Result<Vec<_>>>()?;
        debug!(requested = ids.len(), found = items.len(), "postgres catalog lookup");
        Ok(items)
    }
}

fn item_from_row(row: &Row) -> Result<CatalogItem> {
    let raw_idx: i64 = row.try_get("idx").context("catalog row missing idx")?;
    let idx = Idx::try_from(raw_idx).with_context(|| format!("negative idx {raw_idx}"))?;
    let text = |column: &str| -> Result<String> {
        let value: Option<String> = row
            .try_get(column)
            .with_context(|| format!("catalog column {column} unreadable"))?;
        Ok(value.unwrap_or_default())
    };
    let source_url: Option<String> = row
        .try_get("source_url")
        .context("catalog column source_url unreadable")?;
    Ok(CatalogItem {
        idx,
        title: text("title")?,
        description: text("description")?,
        skills: text("skills")?,
        company: text("company")?,
        location: text("location")?,
        compensation: text("compensation")?,
        experience: text("experience")?,
        job_type: text("job_type")?,
        source_url: source_url.filter(|url| !url.trim().is_empty()),
    })
}

fn select_sql(table: &TableName) -> String {
    format!(
        "SELECT \
            idx, \
            title, \
            description, \
            skills, \
            company, \
            location, \
            compensation, \
            experience, \
            job_type, \
            source_url \
        FROM {} \
        WHERE idx = ANY($1)",
        table.qualified()
    )
}

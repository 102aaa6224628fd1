//! Upsert-by-primary-key sinks for canonical listings.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use dealflow_core::CanonicalListing;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tracing::debug;

pub const LISTINGS_TABLE: &str = "listings";
pub const LISTINGS_CONFLICT_KEY: &str = "id";

/// Column order shared by the INSERT list and the bound values below.
const LISTING_COLUMNS: &[&str] = &[
    "id",
    "vertical_slug",
    "title",
    "slug",
    "description",
    "city",
    "state",
    "country",
    "zip_code",
    "asking_price",
    "revenue",
    "sde",
    "ebitda",
    "cash_flow",
    "category",
    "status",
    "source",
    "external_id",
    "external_url",
    "images",
    "documents",
    "meta_title",
    "meta_description",
    "custom_fields",
    "created_at",
    "updated_at",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub affected: usize,
    pub inserted: usize,
    pub updated: usize,
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("`{0}` is not a plain SQL identifier")]
    InvalidIdentifier(String),
    #[error("conflict key `{0}` is not a listings column")]
    UnknownConflictKey(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("sink rejected batch: {0}")]
    Rejected(String),
}

/// Accepts canonical rows in batches and replaces any stored row that shares
/// the conflict key.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn upsert(
        &self,
        table: &str,
        batch: &[CanonicalListing],
        conflict_key: &str,
    ) -> Result<UpsertOutcome, PersistenceError>;
}

fn checked_identifier(name: &str) -> Result<&str, PersistenceError> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(PersistenceError::InvalidIdentifier(name.to_string()))
    }
}

fn checked_conflict_key(key: &str) -> Result<&str, PersistenceError> {
    let key = checked_identifier(key)?;
    if LISTING_COLUMNS.contains(&key) {
        Ok(key)
    } else {
        Err(PersistenceError::UnknownConflictKey(key.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct PgListingSink {
    pool: PgPool,
}

impl PgListingSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(pool).await
    }

    fn build_upsert<'a>(
        table: &str,
        conflict_key: &str,
        batch: &'a [CanonicalListing],
    ) -> QueryBuilder<'a, Postgres> {
        let mut qb: QueryBuilder<'a, Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {table} ({}) ",
            LISTING_COLUMNS.join(", ")
        ));

        qb.push_values(batch, |mut b, listing| {
            b.push_bind(&listing.id)
                .push_bind(&listing.vertical_slug)
                .push_bind(&listing.title)
                .push_bind(&listing.slug)
                .push_bind(&listing.description)
                .push_bind(&listing.city)
                .push_bind(&listing.state)
                .push_bind(&listing.country)
                .push_bind(&listing.zip_code)
                .push_bind(listing.asking_price)
                .push_bind(listing.revenue)
                .push_bind(listing.sde)
                .push_bind(listing.ebitda)
                .push_bind(listing.cash_flow)
                .push_bind(&listing.category)
                .push_bind(listing.status.as_str())
                .push_bind(&listing.source)
                .push_bind(&listing.external_id)
                .push_bind(&listing.external_url)
                .push_bind(&listing.images)
                .push_bind(&listing.documents)
                .push_bind(&listing.meta_title)
                .push_bind(&listing.meta_description)
                .push_bind(&listing.custom_fields)
                .push_bind(listing.created_at)
                .push_bind(listing.updated_at);
        });

        // Whole-row replacement: every non-key column takes the incoming value.
        let assignments = LISTING_COLUMNS
            .iter()
            .filter(|column| **column != conflict_key)
            .map(|column| format!("{column} = EXCLUDED.{column}"))
            .collect::<Vec<_>>()
            .join(", ");
        qb.push(format!(
            " ON CONFLICT ({conflict_key}) DO UPDATE SET {assignments} RETURNING (xmax = 0) AS inserted"
        ));
        qb
    }
}

#[async_trait]
impl PersistenceSink for PgListingSink {
    async fn upsert(
        &self,
        table: &str,
        batch: &[CanonicalListing],
        conflict_key: &str,
    ) -> Result<UpsertOutcome, PersistenceError> {
        let table = checked_identifier(table)?;
        let conflict_key = checked_conflict_key(conflict_key)?;
        if batch.is_empty() {
            return Ok(UpsertOutcome::default());
        }

        let mut qb = Self::build_upsert(table, conflict_key, batch);
        let rows = qb.build().fetch_all(&self.pool).await?;

        let mut outcome = UpsertOutcome {
            affected: rows.len(),
            ..UpsertOutcome::default()
        };
        for row in &rows {
            if row.try_get::<bool, _>("inserted")? {
                outcome.inserted += 1;
            } else {
                outcome.updated += 1;
            }
        }
        debug!(table, affected = outcome.affected, inserted = outcome.inserted, "upserted batch");
        Ok(outcome)
    }
}

/// In-process sink keyed like the Postgres table. Backs `--dry-run` and tests.
#[derive(Debug, Default)]
pub struct MemoryListingSink {
    tables: Mutex<BTreeMap<String, BTreeMap<String, CanonicalListing>>>,
}

impl MemoryListingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self, table: &str) -> Vec<CanonicalListing> {
        let tables = self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, table: &str) -> usize {
        let tables = self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        tables.get(table).map(BTreeMap::len).unwrap_or(0)
    }
}

#[async_trait]
impl PersistenceSink for MemoryListingSink {
    async fn upsert(
        &self,
        table: &str,
        batch: &[CanonicalListing],
        conflict_key: &str,
    ) -> Result<UpsertOutcome, PersistenceError> {
        let table = checked_identifier(table)?;
        if checked_conflict_key(conflict_key)? != LISTINGS_CONFLICT_KEY {
            return Err(PersistenceError::Rejected(format!(
                "memory sink only keys on `{LISTINGS_CONFLICT_KEY}`"
            )));
        }

        let mut tables = self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let rows = tables.entry(table.to_string()).or_default();
        let mut outcome = UpsertOutcome::default();
        for listing in batch {
            match rows.insert(listing.id.clone(), listing.clone()) {
                None => outcome.inserted += 1,
                Some(_) => outcome.updated += 1,
            }
            outcome.affected += 1;
        }
        Ok(outcome)
    }
}

//! Append-only snapshot log: the store contract plus memory and Postgres backends.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sitewatch_core::{Change, FormSignature, Snapshot};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tokio::sync::RwLock;

/// Persistence contract for the per-domain observation log.
///
/// Rows are only ever appended. `get_latest` orders by `snapshot_date`.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn insert(&self, snapshot: &Snapshot) -> Result<()>;

    async fn get_latest(&self, domain: &str) -> Result<Option<Snapshot>>;

    /// Newest snapshot whose fetch succeeded; degraded rows are skipped.
    async fn get_latest_successful(&self, domain: &str) -> Result<Option<Snapshot>>;

    /// Newest-first history for a domain, at most `limit` rows.
    async fn history(&self, domain: &str, limit: usize) -> Result<Vec<Snapshot>>;
}

#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    rows: RwLock<HashMap<String, Vec<Snapshot>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn insert(&self, snapshot: &Snapshot) -> Result<()> {
        let mut rows = self.rows.write().await;
        let log = rows.entry(snapshot.domain.clone()).or_default();
        if log.iter().any(|s| s.snapshot_date == snapshot.snapshot_date) {
            bail!(
                "snapshot for {} at {} already stored",
                snapshot.domain,
                snapshot.snapshot_date.to_rfc3339()
            );
        }
        log.push(snapshot.clone());
        Ok(())
    }

    async fn get_latest(&self, domain: &str) -> Result<Option<Snapshot>> {
        let rows = self.rows.read().await;
        Ok(rows
            .get(domain)
            .and_then(|log| log.iter().max_by_key(|s| s.snapshot_date))
            .cloned())
    }

    async fn get_latest_successful(&self, domain: &str) -> Result<Option<Snapshot>> {
        let rows = self.rows.read().await;
        Ok(rows
            .get(domain)
            .and_then(|log| {
                log.iter()
                    .filter(|s| !s.is_degraded())
                    .max_by_key(|s| s.snapshot_date)
            })
            .cloned())
    }

    async fn history(&self, domain: &str, limit: usize) -> Result<Vec<Snapshot>> {
        let rows = self.rows.read().await;
        let mut out = rows.get(domain).cloned().unwrap_or_default();
        out.sort_by(|a, b| b.snapshot_date.cmp(&a.snapshot_date));
        out.truncate(limit);
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct PgSnapshotStore {
    pool: PgPool,
}

const SNAPSHOT_COLUMNS: &str = "id, domain, snapshot_date, load_time, cta_buttons, testimonials_count, \
     form_fields, title, meta_description, price_points, content_hash, fetch_error, failed_fields, changes_detected";

impl PgSnapshotStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to snapshot database")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running snapshot migrations")?;
        Ok(())
    }
}

fn snapshot_from_row(row: &PgRow) -> Result<Snapshot> {
    let testimonials: i32 = row.try_get("testimonials_count")?;
    let cta_buttons: Json<Vec<String>> = row.try_get("cta_buttons")?;
    let form_fields: Json<Vec<FormSignature>> = row.try_get("form_fields")?;
    let price_points: Json<Vec<String>> = row.try_get("price_points")?;
    let failed_fields: Json<Vec<String>> = row.try_get("failed_fields")?;
    let changes: Option<Json<Vec<Change>>> = row.try_get("changes_detected")?;

    Ok(Snapshot {
        id: row.try_get("id")?,
        domain: row.try_get("domain")?,
        snapshot_date: row.try_get("snapshot_date")?,
        load_time: row.try_get("load_time")?,
        cta_buttons: cta_buttons.0,
        testimonials_count: u32::try_from(testimonials)
            .with_context(|| format!("negative testimonials_count {testimonials}"))?,
        form_fields: form_fields.0,
        title: row.try_get("title")?,
        meta_description: row.try_get("meta_description")?,
        price_points: price_points.0,
        content_hash: row.try_get("content_hash")?,
        fetch_error: row.try_get("fetch_error")?,
        failed_fields: failed_fields.0,
        changes_detected: changes.map(|c| c.0),
    })
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn insert(&self, snapshot: &Snapshot) -> Result<()> {
        let testimonials = i32::try_from(snapshot.testimonials_count)
            .context("testimonials_count exceeds column range")?;
        sqlx::query(
            r#"
            INSERT INTO site_snapshots (
                id, domain, snapshot_date, load_time, cta_buttons, testimonials_count,
                form_fields, title, meta_description, price_points, content_hash,
                fetch_error, failed_fields, changes_detected
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(snapshot.id)
        .bind(&snapshot.domain)
        .bind(snapshot.snapshot_date)
        .bind(snapshot.load_time)
        .bind(Json(&snapshot.cta_buttons))
        .bind(testimonials)
        .bind(Json(&snapshot.form_fields))
        .bind(&snapshot.title)
        .bind(&snapshot.meta_description)
        .bind(Json(&snapshot.price_points))
        .bind(&snapshot.content_hash)
        .bind(&snapshot.fetch_error)
        .bind(Json(&snapshot.failed_fields))
        .bind(snapshot.changes_detected.as_ref().map(Json))
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting snapshot for {}", snapshot.domain))?;
        Ok(())
    }

    async fn get_latest(&self, domain: &str) -> Result<Option<Snapshot>> {
        let row = sqlx::query(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM site_snapshots WHERE domain = $1 \
             ORDER BY snapshot_date DESC LIMIT 1"
        ))
        .bind(domain)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("loading latest snapshot for {domain}"))?;
        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn get_latest_successful(&self, domain: &str) -> Result<Option<Snapshot>> {
        let row = sqlx::query(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM site_snapshots \
             WHERE domain = $1 AND fetch_error IS NULL \
             ORDER BY snapshot_date DESC LIMIT 1"
        ))
        .bind(domain)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("loading latest successful snapshot for {domain}"))?;
        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn history(&self, domain: &str, limit: usize) -> Result<Vec<Snapshot>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM site_snapshots WHERE domain = $1 \
             ORDER BY snapshot_date DESC LIMIT $2"
        ))
        .bind(domain)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("loading snapshot history for {domain}"))?;
        rows.iter().map(snapshot_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn snapshot_at(domain: &str, minute: u32, title: &str) -> Snapshot {
        let at = Utc
            .with_ymd_and_hms(2026, 3, 1, 9, minute, 0)
            .single()
            .unwrap();
        let mut s = Snapshot::empty(domain, at);
        s.title = Some(title.to_string());
        s
    }

    #[tokio::test]
    async fn latest_is_ordered_by_snapshot_date_not_insertion() {
        let store = MemorySnapshotStore::new();
        store.insert(&snapshot_at("acme.io", 10, "newer")).await.unwrap();
        store.insert(&snapshot_at("acme.io", 5, "older")).await.unwrap();
        store.insert(&snapshot_at("rival.io", 30, "other")).await.unwrap();

        let latest = store.get_latest("acme.io").await.unwrap().unwrap();
        assert_eq!(latest.title.as_deref(), Some("newer"));
        assert!(store.get_latest("unknown.io").await.unwrap().is_none());
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn history_is_newest_first_and_limited() {
        let store = MemorySnapshotStore::new();
        for minute in [1, 3, 2] {
            store
                .insert(&snapshot_at("acme.io", minute, &format!("t{minute}")))
                .await
                .unwrap();
        }
        let history = store.history("acme.io", 2).await.unwrap();
        let titles: Vec<_> = history.iter().filter_map(|s| s.title.clone()).collect();
        assert_eq!(titles, vec!["t3".to_string(), "t2".to_string()]);
    }

    #[tokio::test]
    async fn latest_successful_skips_newer_degraded_rows() {
        let store = MemorySnapshotStore::new();
        store.insert(&snapshot_at("acme.io", 1, "good")).await.unwrap();
        let mut outage = snapshot_at("acme.io", 2, "");
        outage.fetch_error = Some("connection refused".into());
        store.insert(&outage).await.unwrap();

        let latest = store.get_latest("acme.io").await.unwrap().unwrap();
        assert!(latest.is_degraded());
        let baseline = store.get_latest_successful("acme.io").await.unwrap().unwrap();
        assert_eq!(baseline.title.as_deref(), Some("good"));

        let mut only_outage = snapshot_at("rival.io", 1, "");
        only_outage.fetch_error = Some("timeout".into());
        store.insert(&only_outage).await.unwrap();
        assert!(store.get_latest_successful("rival.io").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_domain_timestamp_is_rejected() {
        let store = MemorySnapshotStore::new();
        let first = snapshot_at("acme.io", 1, "a");
        let mut second = snapshot_at("acme.io", 1, "b");
        store.insert(&first).await.unwrap();
        assert!(store.insert(&second).await.is_err());

        second.snapshot_date = second.snapshot_date + Duration::microseconds(1);
        store.insert(&second).await.unwrap();
    }
}

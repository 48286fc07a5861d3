//! Capture -> extract -> diff -> append, one domain at a time or fanned out.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use sitewatch_core::Snapshot;
use sitewatch_extract::FeatureExtractor;
use sitewatch_storage::{ArtifactStore, PageSource, SnapshotStore};
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};

use crate::diff::{diff, DiffConfig};

#[derive(Clone)]
pub struct SnapshotLifecycle {
    source: Arc<dyn PageSource>,
    store: Arc<dyn SnapshotStore>,
    extractor: Arc<FeatureExtractor>,
    diff_config: DiffConfig,
    archive: Option<ArtifactStore>,
}

impl SnapshotLifecycle {
    pub fn new(
        source: Arc<dyn PageSource>,
        store: Arc<dyn SnapshotStore>,
        extractor: FeatureExtractor,
        diff_config: DiffConfig,
    ) -> Self {
        Self {
            source,
            store,
            extractor: Arc::new(extractor),
            diff_config,
            archive: None,
        }
    }

    /// Keep raw page bodies in a content-addressed archive as well.
    pub fn with_archive(mut self, archive: ArtifactStore) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    /// Observe `domain` once and append the result to the store.
    ///
    /// Fetch failures produce a degraded snapshot rather than an error; only
    /// store failures propagate. Changes are measured against the newest
    /// non-degraded snapshot, so nothing is lost across an outage.
    pub async fn capture_and_diff(&self, domain: &str) -> Result<Snapshot> {
        let span = info_span!("capture", domain);
        self.capture(domain).instrument(span).await
    }

    async fn capture(&self, domain: &str) -> Result<Snapshot> {
        let fetch = self.source.fetch_page(domain).await;
        let mut snapshot = self.extractor.extract(&fetch);
        snapshot.domain = domain.to_string();

        if let (Some(archive), Some(body)) = (&self.archive, fetch.body.as_deref()) {
            if fetch.is_success() {
                if let Err(err) = archive
                    .store_bytes(fetch.fetched_at, domain, "html", body.as_bytes())
                    .await
                {
                    warn!(error = %format!("{err:#}"), "archiving raw page failed");
                }
            }
        }

        let latest = self.store.get_latest(domain).await?;
        snapshot.snapshot_date = next_snapshot_date(Utc::now(), latest.as_ref());

        // An outage row never serves as the baseline; diff against the last good capture.
        snapshot.changes_detected = if snapshot.is_degraded() {
            None
        } else {
            match self.store.get_latest_successful(domain).await? {
                Some(baseline) => Some(diff(&baseline, &snapshot, &self.diff_config)?),
                None => None,
            }
        };

        self.store.insert(&snapshot).await?;

        match (&snapshot.fetch_error, &snapshot.changes_detected) {
            (Some(error), _) => warn!(error = %error, "stored degraded snapshot"),
            (None, None) => info!("stored first snapshot"),
            (None, Some(changes)) => info!(changes = changes.len(), "stored snapshot"),
        }
        Ok(snapshot)
    }

    /// Capture several domains concurrently. Results follow input order; one
    /// domain failing does not stop the others.
    pub async fn capture_many(&self, domains: &[String]) -> Vec<(String, Result<Snapshot>)> {
        let mut tasks = JoinSet::new();
        for (idx, domain) in domains.iter().enumerate() {
            let this = self.clone();
            let domain = domain.clone();
            tasks.spawn(async move {
                let result = this.capture_and_diff(&domain).await;
                (idx, result)
            });
        }

        let mut slots: Vec<Option<Result<Snapshot>>> = domains.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, result)) => slots[idx] = Some(result),
                Err(err) => warn!(error = %err, "capture task did not complete"),
            }
        }

        domains
            .iter()
            .cloned()
            .zip(slots)
            .map(|(domain, slot)| {
                let result = slot.unwrap_or_else(|| Err(anyhow!("capture task for {domain} aborted")));
                (domain, result)
            })
            .collect()
    }
}

/// Microsecond-precision creation time, strictly after the previous snapshot.
fn next_snapshot_date(now: DateTime<Utc>, previous: Option<&Snapshot>) -> DateTime<Utc> {
    let now = now.trunc_subsecs(6);
    match previous {
        Some(prev) if prev.snapshot_date >= now => prev.snapshot_date + Duration::microseconds(1),
        _ => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn snapshot_dates_strictly_increase() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap();
        assert_eq!(next_snapshot_date(now, None), now);

        let prev = Snapshot::empty("acme.io", now);
        assert_eq!(
            next_snapshot_date(now, Some(&prev)),
            now + Duration::microseconds(1)
        );

        let later = now + Duration::seconds(5);
        assert_eq!(next_snapshot_date(later, Some(&prev)), later);
    }
}

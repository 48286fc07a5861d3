//! Registry-driven monitoring runs: capture every enabled site, compare,
//! score, and write the run's reports and parquet snapshot.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sitewatch_core::Snapshot;
use sitewatch_extract::{ExtractionRules, FeatureExtractor, FixturePageSource};
use sitewatch_storage::{
    ArtifactStore, HttpFetcher, MemorySnapshotStore, PageSource, PgSnapshotStore,
    SnapshotStore,
};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::compare::{compare, ComparisonReport, Direction};
use crate::export::export_parquet_snapshots;
use crate::lifecycle::SnapshotLifecycle;
use crate::scoring::{NoopScoringPolicy, ScoringPolicy, YamlScoringPolicy};
use crate::{MonitorConfig, SiteRegistry};

#[derive(Debug, Clone, Serialize)]
pub struct CaptureFailure {
    pub domain: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SiteScore {
    pub domain: String,
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub enabled_sites: usize,
    pub captured: usize,
    pub degraded: usize,
    pub changes: usize,
    pub failures: Vec<CaptureFailure>,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

/// Everything a run observed; serialized as `run.json` and rendered as the brief.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scoring_version: String,
    pub snapshots: Vec<Snapshot>,
    pub scores: Vec<SiteScore>,
    pub comparison: ComparisonReport,
    pub failures: Vec<CaptureFailure>,
}

pub struct MonitorPipeline {
    config: MonitorConfig,
    lifecycle: SnapshotLifecycle,
    scoring: Arc<dyn ScoringPolicy>,
}

impl MonitorPipeline {
    pub fn new(config: MonitorConfig, lifecycle: SnapshotLifecycle) -> Self {
        Self {
            config,
            lifecycle,
            scoring: Arc::new(NoopScoringPolicy),
        }
    }

    pub fn with_scoring(mut self, scoring: Arc<dyn ScoringPolicy>) -> Self {
        self.scoring = scoring;
        self
    }

    /// Wire store, page source, extraction rules, archive and scoring from config.
    pub async fn from_config(config: MonitorConfig) -> Result<Self> {
        let store = open_snapshot_store(config.database_url.as_deref()).await?;
        let source: Arc<dyn PageSource> = match &config.fixtures_dir {
            Some(dir) => {
                info!(fixtures = %dir.display(), "serving pages from fixtures");
                Arc::new(FixturePageSource::new(dir.clone()))
            }
            None => Arc::new(HttpFetcher::new(config.http_client_config())?),
        };
        let rules = ExtractionRules::from_workspace_root(&config.workspace_root)?;
        let lifecycle = SnapshotLifecycle::new(
            source,
            store,
            FeatureExtractor::new(rules),
            config.diff_config(),
        )
        .with_archive(ArtifactStore::new(config.artifacts_dir.clone()));

        let scoring_path = config.workspace_root.join("rules").join("scoring.yaml");
        let scoring: Arc<dyn ScoringPolicy> = if scoring_path.exists() {
            Arc::new(YamlScoringPolicy::from_yaml_file(&scoring_path)?)
        } else {
            Arc::new(NoopScoringPolicy)
        };

        Ok(Self::new(config, lifecycle).with_scoring(scoring))
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &SnapshotLifecycle {
        &self.lifecycle
    }

    pub async fn run_once(&self) -> Result<MonitorRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let registry = self.load_site_registry().await?;
        let domains = registry.enabled_domains();
        info!(%run_id, sites = domains.len(), "monitor run started");

        let mut snapshots = Vec::new();
        let mut failures = Vec::new();
        for (domain, result) in self.lifecycle.capture_many(&domains).await {
            match result {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(err) => {
                    warn!(%domain, error = %format!("{err:#}"), "capture failed");
                    failures.push(CaptureFailure {
                        domain,
                        error: format!("{err:#}"),
                    });
                }
            }
        }

        let comparison = compare(&snapshots);
        let scores = snapshots
            .iter()
            .map(|s| SiteScore {
                domain: s.domain.clone(),
                score: self.scoring.score(s),
            })
            .collect();

        let record = RunRecord {
            run_id,
            started_at,
            finished_at: Utc::now(),
            scoring_version: self.scoring.version(),
            snapshots,
            scores,
            comparison,
            failures,
        };
        let reports_dir = self.write_reports(&record).await?;
        let manifest_path = {
            let dir = reports_dir.clone();
            let snapshots = record.snapshots.clone();
            tokio::task::spawn_blocking(move || export_parquet_snapshots(&dir, &snapshots))
                .await
                .context("joining parquet export")??
        };

        let summary = MonitorRunSummary {
            run_id,
            started_at,
            finished_at: record.finished_at,
            enabled_sites: domains.len(),
            captured: record.snapshots.len(),
            degraded: record.snapshots.iter().filter(|s| s.is_degraded()).count(),
            changes: record
                .snapshots
                .iter()
                .filter_map(|s| s.changes_detected.as_ref())
                .map(Vec::len)
                .sum(),
            failures: record.failures,
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: manifest_path.display().to_string(),
        };
        info!(
            %run_id,
            captured = summary.captured,
            degraded = summary.degraded,
            changes = summary.changes,
            "monitor run finished"
        );
        Ok(summary)
    }

    /// Cron job calling `run_once`, or `None` when scheduling is disabled.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let cron = self.config.cron.as_str();
        let job = Job::new_async(cron, move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(run_id = %summary.run_id, "scheduled run complete"),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }

    pub async fn load_site_registry(&self) -> Result<SiteRegistry> {
        let path = self.config.workspace_root.join("sites.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    async fn write_reports(&self, record: &RunRecord) -> Result<PathBuf> {
        let reports_dir = self
            .config
            .workspace_root
            .join("reports")
            .join(record.run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        fs::write(reports_dir.join("change_brief.md"), render_change_brief(record))
            .await
            .context("writing change_brief.md")?;

        let run_json = serde_json::to_vec_pretty(record).context("serializing run record")?;
        fs::write(reports_dir.join("run.json"), run_json)
            .await
            .context("writing run.json")?;

        Ok(reports_dir)
    }
}

/// Postgres (migrated) when a URL is given, otherwise a fresh in-memory log.
pub async fn open_snapshot_store(database_url: Option<&str>) -> Result<Arc<dyn SnapshotStore>> {
    match database_url {
        Some(url) => {
            let store = PgSnapshotStore::connect(url).await?;
            store.migrate().await?;
            info!("using postgres snapshot store");
            Ok(Arc::new(store))
        }
        None => {
            info!("DATABASE_URL not set; snapshots are kept in memory");
            Ok(Arc::new(MemorySnapshotStore::new()))
        }
    }
}

pub async fn run_once_from_env() -> Result<MonitorRunSummary> {
    let pipeline = MonitorPipeline::from_config(MonitorConfig::from_env()).await?;
    pipeline.run_once().await
}

pub fn render_change_brief(record: &RunRecord) -> String {
    let degraded = record.snapshots.iter().filter(|s| s.is_degraded()).count();
    let mut out = format!(
        "# SiteWatch Change Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Sites captured: {} (degraded: {}, failed: {})\n- Scoring: {}\n",
        record.run_id,
        record.started_at,
        record.finished_at,
        record.snapshots.len(),
        degraded,
        record.failures.len(),
        record.scoring_version,
    );

    out.push_str("\n## Changes\n");
    for snapshot in &record.snapshots {
        out.push_str(&format!("\n### {}\n", snapshot.domain));
        match (&snapshot.fetch_error, &snapshot.changes_detected) {
            (Some(error), _) => out.push_str(&format!("- capture degraded: {error}\n")),
            (None, None) => out.push_str("- first observation, baseline recorded\n"),
            (None, Some(changes)) if changes.is_empty() => out.push_str("- no changes\n"),
            (None, Some(changes)) => {
                for change in changes {
                    out.push_str(&format!(
                        "- [{}] {}\n",
                        change.impact.as_str(),
                        change.describe()
                    ));
                }
            }
        }
        if !snapshot.failed_fields.is_empty() {
            out.push_str(&format!(
                "- not extracted, skipped in diff: {}\n",
                snapshot.failed_fields.join(", ")
            ));
        }
    }

    out.push_str("\n## Rankings\n");
    for ranking in &record.comparison.rankings {
        let direction = match ranking.direction {
            Direction::LowerIsBetter => "lower is better",
            Direction::HigherIsBetter => "higher is better",
        };
        let winner = match (&ranking.winner, ranking.ranked.first()) {
            (Some(domain), Some(entry)) => format!("{domain} ({:.2})", entry.value),
            _ => "n/a".to_string(),
        };
        out.push_str(&format!(
            "- {} ({direction}): {winner}",
            ranking.metric.as_str()
        ));
        if !ranking.excluded.is_empty() {
            out.push_str(&format!("; excluded: {}", ranking.excluded.join(", ")));
        }
        out.push('\n');
    }

    if record.scores.iter().any(|s| s.score.is_some()) {
        out.push_str("\n## Scores\n");
        for score in &record.scores {
            match score.score {
                Some(value) => out.push_str(&format!("- {}: {value:.1}\n", score.domain)),
                None => out.push_str(&format!("- {}: n/a\n", score.domain)),
            }
        }
    }

    if !record.failures.is_empty() {
        out.push_str("\n## Failures\n");
        for failure in &record.failures {
            out.push_str(&format!("- {}: {}\n", failure.domain, failure.error));
        }
    }
    out
}

/// Read back the brief of the most recent run under `workspace_root/reports`.
pub fn latest_change_brief(workspace_root: &Path) -> Result<Option<String>> {
    let reports_root = workspace_root.join("reports");
    if !reports_root.exists() {
        return Ok(None);
    }
    let mut dirs = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter(|entry| entry.path().join("change_brief.md").exists())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());

    match dirs.last() {
        Some(entry) => {
            let path = entry.path().join("change_brief.md");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            Ok(Some(text))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitewatch_core::{Change, ChangeKind};
    use tempfile::tempdir;

    fn repo_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .unwrap()
    }

    /// Temp workspace with the repo's registry, rules and fixtures.
    fn seeded_workspace(dir: &Path) {
        let root = repo_root();
        std::fs::copy(root.join("sites.yaml"), dir.join("sites.yaml")).unwrap();
        std::fs::create_dir_all(dir.join("rules")).unwrap();
        for rules in ["extraction.yaml", "scoring.yaml"] {
            std::fs::copy(root.join("rules").join(rules), dir.join("rules").join(rules)).unwrap();
        }
        for site in ["acme-analytics.test", "rival-metrics.test"] {
            let from = root.join("fixtures").join(site);
            let to = dir.join("fixtures").join(site);
            std::fs::create_dir_all(&to).unwrap();
            for file in ["fixture.json", "page.html"] {
                std::fs::copy(from.join(file), to.join(file)).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn offline_run_writes_reports_and_second_run_diffs() {
        let dir = tempdir().unwrap();
        seeded_workspace(dir.path());
        let pipeline = MonitorPipeline::from_config(MonitorConfig::offline(dir.path()))
            .await
            .unwrap();

        let first = pipeline.run_once().await.unwrap();
        assert_eq!(first.enabled_sites, 2);
        assert_eq!(first.captured, 2);
        assert_eq!(first.degraded, 0);
        assert_eq!(first.changes, 0);
        assert!(first.failures.is_empty());

        let reports = PathBuf::from(&first.reports_dir);
        let brief = std::fs::read_to_string(reports.join("change_brief.md")).unwrap();
        assert!(brief.contains("### acme-analytics.test"));
        assert!(brief.contains("first observation"));
        assert!(brief.contains("- load_time (lower is better): acme-analytics.test (1.90)"));
        assert!(brief.contains("## Scores"));
        assert!(reports.join("run.json").exists());
        assert!(PathBuf::from(&first.parquet_manifest).exists());

        let second = pipeline.run_once().await.unwrap();
        assert_eq!(second.changes, 0);
        let latest = pipeline
            .lifecycle()
            .store()
            .history("acme-analytics.test", 10)
            .await
            .unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].changes_detected, Some(vec![]));

        let brief = latest_change_brief(dir.path()).unwrap().unwrap();
        assert!(brief.contains("- no changes"));
    }

    #[tokio::test]
    async fn scheduler_is_absent_when_disabled() {
        let dir = tempdir().unwrap();
        seeded_workspace(dir.path());
        let pipeline = Arc::new(
            MonitorPipeline::from_config(MonitorConfig::offline(dir.path()))
                .await
                .unwrap(),
        );
        assert!(pipeline.maybe_build_scheduler().await.unwrap().is_none());
    }

    #[test]
    fn brief_lists_changes_with_impact_and_failures() {
        let at = Utc::now();
        let mut snapshot = Snapshot::empty("acme.io", at);
        snapshot.load_time = Some(1.5);
        snapshot.failed_fields = vec!["price_points".into()];
        snapshot.changes_detected = Some(vec![Change::new(ChangeKind::CtaButtons {
            added: vec!["Start Free Trial".into()],
            removed: vec![],
        })]);
        let snapshots = vec![snapshot];
        let record = RunRecord {
            run_id: Uuid::new_v4(),
            started_at: at,
            finished_at: at,
            scoring_version: "none".into(),
            comparison: compare(&snapshots),
            scores: vec![SiteScore {
                domain: "acme.io".into(),
                score: None,
            }],
            snapshots,
            failures: vec![CaptureFailure {
                domain: "rival.io".into(),
                error: "store unavailable".into(),
            }],
        };

        let brief = render_change_brief(&record);
        assert!(brief.contains("- [high] CTA buttons added: Start Free Trial"));
        assert!(brief.contains("- not extracted, skipped in diff: price_points"));
        assert!(brief.contains("## Failures\n- rival.io: store unavailable"));
        assert!(!brief.contains("## Scores"));
    }
}

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use sitewatch_core::{ChangeKind, Impact, PageFetch, Snapshot};
use sitewatch_extract::{ExtractionRules, FeatureExtractor};
use sitewatch_monitor::{DiffConfig, SnapshotLifecycle};
use sitewatch_storage::{MemorySnapshotStore, PageSource, SnapshotStore};

/// Hands out queued pages per domain; an empty queue is a connection error.
#[derive(Default)]
struct ScriptedSource {
    pages: Mutex<HashMap<String, VecDeque<PageFetch>>>,
}

impl ScriptedSource {
    fn page(self, domain: &str, html: &str, load_secs: f64) -> Self {
        let fetch = PageFetch::succeeded(
            domain,
            format!("https://{domain}"),
            200,
            html,
            Duration::from_secs_f64(load_secs),
            Utc::now(),
        );
        self.push(domain, fetch)
    }

    fn push(self, domain: &str, fetch: PageFetch) -> Self {
        self.pages
            .lock()
            .unwrap()
            .entry(domain.to_string())
            .or_default()
            .push_back(fetch);
        self
    }
}

#[async_trait]
impl PageSource for ScriptedSource {
    async fn fetch_page(&self, domain: &str) -> PageFetch {
        let next = self
            .pages
            .lock()
            .unwrap()
            .get_mut(domain)
            .and_then(VecDeque::pop_front);
        next.unwrap_or_else(|| {
            PageFetch::failed(domain, format!("https://{domain}"), "connection refused", Utc::now())
        })
    }
}

/// Store that refuses writes for one domain.
struct FlakyStore {
    inner: MemorySnapshotStore,
    broken_domain: String,
}

#[async_trait]
impl SnapshotStore for FlakyStore {
    async fn insert(&self, snapshot: &Snapshot) -> Result<()> {
        if snapshot.domain == self.broken_domain {
            bail!("disk full");
        }
        self.inner.insert(snapshot).await
    }

    async fn get_latest(&self, domain: &str) -> Result<Option<Snapshot>> {
        self.inner.get_latest(domain).await
    }

    async fn get_latest_successful(&self, domain: &str) -> Result<Option<Snapshot>> {
        self.inner.get_latest_successful(domain).await
    }

    async fn history(&self, domain: &str, limit: usize) -> Result<Vec<Snapshot>> {
        self.inner.history(domain, limit).await
    }
}

const LANDING: &str = r#"<html><head><title>Acme</title></head><body>
<a class="btn" href="/more">Learn More</a>
</body></html>"#;

const LANDING_WITH_TRIAL: &str = r#"<html><head><title>Acme</title></head><body>
<a class="btn" href="/more">Learn More</a>
<button>Start Free Trial</button>
</body></html>"#;

fn lifecycle(source: ScriptedSource, store: Arc<dyn SnapshotStore>) -> SnapshotLifecycle {
    SnapshotLifecycle::new(
        Arc::new(source),
        store,
        FeatureExtractor::new(ExtractionRules::default()),
        DiffConfig::default(),
    )
}

#[tokio::test]
async fn first_capture_has_no_baseline() {
    let store = Arc::new(MemorySnapshotStore::new());
    let lifecycle = lifecycle(ScriptedSource::default().page("acme.io", LANDING, 1.0), store.clone());

    let snapshot = lifecycle.capture_and_diff("acme.io").await.unwrap();
    assert_eq!(snapshot.changes_detected, None);
    assert_eq!(snapshot.cta_buttons, vec!["Learn More".to_string()]);
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn new_cta_is_reported_against_previous_capture() {
    let store = Arc::new(MemorySnapshotStore::new());
    let source = ScriptedSource::default()
        .page("acme.io", LANDING, 1.0)
        .page("acme.io", LANDING_WITH_TRIAL, 1.02);
    let lifecycle = lifecycle(source, store.clone());

    let first = lifecycle.capture_and_diff("acme.io").await.unwrap();
    let second = lifecycle.capture_and_diff("acme.io").await.unwrap();
    assert!(second.snapshot_date > first.snapshot_date);

    let changes = second.changes_detected.clone().unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].impact, Impact::High);
    assert_eq!(
        changes[0].kind,
        ChangeKind::CtaButtons {
            added: vec!["Start Free Trial".into()],
            removed: vec![],
        }
    );

    let latest = store.get_latest("acme.io").await.unwrap().unwrap();
    assert_eq!(latest.id, second.id);
    assert_eq!(store.history("acme.io", 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn failed_fetch_is_stored_as_degraded_without_error() {
    let store = Arc::new(MemorySnapshotStore::new());
    let lifecycle = lifecycle(ScriptedSource::default().page("acme.io", LANDING, 1.0), store.clone());

    lifecycle.capture_and_diff("acme.io").await.unwrap();
    let degraded = lifecycle.capture_and_diff("acme.io").await.unwrap();

    assert!(degraded.is_degraded());
    assert_eq!(degraded.fetch_error.as_deref(), Some("connection refused"));
    assert_eq!(degraded.load_time, None);
    assert_eq!(degraded.changes_detected, None);
    assert_eq!(store.len().await, 2);
}

#[tokio::test]
async fn change_made_during_an_outage_is_reported_after_recovery() {
    let store = Arc::new(MemorySnapshotStore::new());
    let outage = PageFetch::failed("acme.io", "https://acme.io", "http status 503", Utc::now());
    let source = ScriptedSource::default()
        .page("acme.io", LANDING, 1.0)
        .push("acme.io", outage)
        .page("acme.io", LANDING_WITH_TRIAL, 1.0);
    let lifecycle = lifecycle(source, store.clone());

    let before = lifecycle.capture_and_diff("acme.io").await.unwrap();
    let down = lifecycle.capture_and_diff("acme.io").await.unwrap();
    let after = lifecycle.capture_and_diff("acme.io").await.unwrap();

    assert!(down.is_degraded());
    assert!(after.snapshot_date > down.snapshot_date);
    assert!(down.snapshot_date > before.snapshot_date);
    let kinds = after
        .changes_detected
        .clone()
        .unwrap()
        .into_iter()
        .map(|c| c.kind)
        .collect::<Vec<_>>();
    assert_eq!(
        kinds,
        vec![ChangeKind::CtaButtons {
            added: vec!["Start Free Trial".into()],
            removed: vec![],
        }]
    );
    assert_eq!(store.history("acme.io", 10).await.unwrap().len(), 3);
}

#[tokio::test]
async fn capture_many_keeps_input_order_and_isolates_store_failures() {
    let store: Arc<dyn SnapshotStore> = Arc::new(FlakyStore {
        inner: MemorySnapshotStore::new(),
        broken_domain: "broken.io".into(),
    });
    let source = ScriptedSource::default()
        .page("a.io", LANDING, 1.0)
        .page("broken.io", LANDING, 1.0)
        .page("c.io", LANDING, 1.0);
    let lifecycle = lifecycle(source, store.clone());

    let domains = vec!["c.io".to_string(), "broken.io".to_string(), "a.io".to_string()];
    let results = lifecycle.capture_many(&domains).await;

    let order = results.iter().map(|(d, _)| d.as_str()).collect::<Vec<_>>();
    assert_eq!(order, vec!["c.io", "broken.io", "a.io"]);
    assert!(results[0].1.is_ok());
    assert!(results[1].1.is_err());
    assert!(results[2].1.is_ok());
    assert!(store.get_latest("broken.io").await.unwrap().is_none());
    assert!(store.get_latest("a.io").await.unwrap().is_some());
}

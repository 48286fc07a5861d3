//! Change monitoring: diffing, comparison, the capture lifecycle and the
//! scheduled pipeline that ties them together.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sitewatch_storage::{HttpClientConfig, RateLimit};

pub mod compare;
pub mod diff;
pub mod export;
pub mod lifecycle;
pub mod pipeline;
pub mod scoring;

pub use compare::{compare, ComparisonReport, Direction, Metric, MetricRanking, RankedEntry};
pub use diff::{diff, DiffConfig, DiffError};
pub use lifecycle::SnapshotLifecycle;
pub use pipeline::{
    latest_change_brief, open_snapshot_store, render_change_brief, run_once_from_env,
    CaptureFailure, MonitorPipeline, MonitorRunSummary, RunRecord, SiteScore,
};
pub use scoring::{NoopScoringPolicy, ScoringPolicy, YamlScoringPolicy};

pub const CRATE_NAME: &str = "sitewatch-monitor";

#[derive(Debug, Clone, Deserialize)]
pub struct SiteRegistry {
    pub sites: Vec<SiteConfig>,
}

impl SiteRegistry {
    pub fn enabled_domains(&self) -> Vec<String> {
        self.sites
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.domain.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteRole {
    Target,
    #[default]
    Competitor,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    pub domain: String,
    pub display_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub role: SiteRole,
    #[serde(default)]
    pub notes: Option<String>,
}

pub const DEFAULT_REQUESTS_PER_MINUTE: u32 = 60;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Postgres when set; otherwise snapshots live in memory for the process.
    pub database_url: Option<String>,
    pub artifacts_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Outbound page requests per minute across all sites; 0 disables the cap.
    pub requests_per_minute: u32,
    pub load_time_threshold: f64,
    pub workspace_root: PathBuf,
    /// Serve pages from recorded fixtures instead of the network.
    pub fixtures_dir: Option<PathBuf>,
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            artifacts_dir: std::env::var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./artifacts")),
            scheduler_enabled: std::env::var("SITEWATCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            cron: std::env::var("SITEWATCH_CRON").unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            user_agent: std::env::var("SITEWATCH_USER_AGENT")
                .unwrap_or_else(|_| "sitewatch-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("SITEWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            requests_per_minute: std::env::var("SITEWATCH_REQUESTS_PER_MINUTE")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(DEFAULT_REQUESTS_PER_MINUTE),
            load_time_threshold: std::env::var("SITEWATCH_LOAD_TIME_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(|| DiffConfig::default().load_time_threshold),
            workspace_root: std::env::var("SITEWATCH_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            fixtures_dir: std::env::var("SITEWATCH_FIXTURES_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        }
    }

    /// Offline configuration rooted at `workspace_root`, reading pages from
    /// its `fixtures/` directory and keeping snapshots in memory.
    pub fn offline(workspace_root: impl Into<PathBuf>) -> Self {
        let workspace_root = workspace_root.into();
        Self {
            database_url: None,
            artifacts_dir: workspace_root.join("artifacts"),
            scheduler_enabled: false,
            cron: "0 0 6 * * *".to_string(),
            user_agent: "sitewatch-bot/0.1".to_string(),
            http_timeout_secs: 20,
            requests_per_minute: 0,
            load_time_threshold: DiffConfig::default().load_time_threshold,
            fixtures_dir: Some(workspace_root.join("fixtures")),
            workspace_root,
        }
    }

    pub fn diff_config(&self) -> DiffConfig {
        DiffConfig {
            load_time_threshold: self.load_time_threshold,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            rate_limit: RateLimit::per_minute(self.requests_per_minute),
            ..HttpClientConfig::default()
        }
    }
}

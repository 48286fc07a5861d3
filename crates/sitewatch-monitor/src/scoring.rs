//! Injectable, versioned growth-score policies.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sitewatch_core::Snapshot;

use crate::compare::Metric;

pub trait ScoringPolicy: Send + Sync {
    fn version(&self) -> String;

    fn score(&self, snapshot: &Snapshot) -> Option<f64>;
}

#[derive(Debug, Default)]
pub struct NoopScoringPolicy;

impl ScoringPolicy for NoopScoringPolicy {
    fn version(&self) -> String {
        "none".to_string()
    }

    fn score(&self, _snapshot: &Snapshot) -> Option<f64> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOp {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
}

impl ComparisonOp {
    fn holds(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            ComparisonOp::Lt => lhs < rhs,
            ComparisonOp::Lte => lhs <= rhs,
            ComparisonOp::Gt => lhs > rhs,
            ComparisonOp::Gte => lhs >= rhs,
            ComparisonOp::Eq => (lhs - rhs).abs() < f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRule {
    pub metric: Metric,
    pub op: ComparisonOp,
    pub value: f64,
    pub bonus: f64,
}

/// `base + Σ bonus` over matching rules, clamped to `[0, max]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YamlScoringPolicy {
    pub version: u32,
    pub base: f64,
    #[serde(default = "default_max")]
    pub max: f64,
    #[serde(default)]
    pub rules: Vec<ScoreRule>,
}

fn default_max() -> f64 {
    100.0
}

impl YamlScoringPolicy {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        Self::from_yaml_file(root.join("rules").join("scoring.yaml"))
    }
}

impl ScoringPolicy for YamlScoringPolicy {
    fn version(&self) -> String {
        format!("yaml-v{}", self.version)
    }

    fn score(&self, snapshot: &Snapshot) -> Option<f64> {
        if snapshot.is_degraded() {
            return None;
        }
        let bonus: f64 = self
            .rules
            .iter()
            .filter(|rule| {
                rule.metric
                    .value(snapshot)
                    .is_some_and(|value| rule.op.holds(value, rule.value))
            })
            .map(|rule| rule.bonus)
            .sum();
        Some((self.base + bonus).clamp(0.0, self.max))
    }
}

//! Cross-sectional ranking of domains by their latest snapshots.

use std::cmp::Ordering;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sitewatch_core::{fields, Snapshot};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    LoadTime,
    TestimonialsCount,
    CtaCount,
    AvgFormFields,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    LowerIsBetter,
    HigherIsBetter,
}

impl Metric {
    pub const ALL: [Metric; 4] = [
        Metric::LoadTime,
        Metric::TestimonialsCount,
        Metric::CtaCount,
        Metric::AvgFormFields,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::LoadTime => "load_time",
            Metric::TestimonialsCount => "testimonials_count",
            Metric::CtaCount => "cta_count",
            Metric::AvgFormFields => "avg_form_fields",
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Metric::LoadTime => Direction::LowerIsBetter,
            Metric::TestimonialsCount | Metric::CtaCount | Metric::AvgFormFields => {
                Direction::HigherIsBetter
            }
        }
    }

    /// Metric value for a snapshot; `None` excludes the domain from this ranking.
    pub fn value(&self, snapshot: &Snapshot) -> Option<f64> {
        if snapshot.is_degraded() {
            return None;
        }
        match self {
            Metric::LoadTime => snapshot.load_time,
            Metric::TestimonialsCount => snapshot
                .extracted(fields::TESTIMONIALS_COUNT)
                .then(|| f64::from(snapshot.testimonials_count)),
            Metric::CtaCount => snapshot
                .extracted(fields::CTA_BUTTONS)
                .then(|| snapshot.cta_count() as f64),
            Metric::AvgFormFields => snapshot
                .extracted(fields::FORM_FIELDS)
                .then(|| snapshot.avg_form_fields())
                .flatten(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedEntry {
    pub domain: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRanking {
    pub metric: Metric,
    pub direction: Direction,
    pub winner: Option<String>,
    pub ranked: Vec<RankedEntry>,
    pub excluded: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub domains: Vec<String>,
    pub rankings: Vec<MetricRanking>,
}

impl ComparisonReport {
    pub fn ranking(&self, metric: Metric) -> Option<&MetricRanking> {
        self.rankings.iter().find(|r| r.metric == metric)
    }

    pub fn winner(&self, metric: Metric) -> Option<&str> {
        self.ranking(metric).and_then(|r| r.winner.as_deref())
    }
}

/// Rank domains on every metric. Ties keep input order, so the first
/// encountered domain wins. Repeated domains after the first are ignored.
pub fn compare(snapshots: &[Snapshot]) -> ComparisonReport {
    let mut seen = HashSet::new();
    let unique = snapshots
        .iter()
        .filter(|s| {
            let fresh = seen.insert(s.domain.as_str());
            if !fresh {
                warn!(domain = %s.domain, "duplicate domain in comparison input; keeping the first");
            }
            fresh
        })
        .collect::<Vec<_>>();

    let rankings = Metric::ALL
        .iter()
        .map(|metric| rank(*metric, &unique))
        .collect();

    ComparisonReport {
        domains: unique.iter().map(|s| s.domain.clone()).collect(),
        rankings,
    }
}

fn rank(metric: Metric, snapshots: &[&Snapshot]) -> MetricRanking {
    let mut ranked = Vec::new();
    let mut excluded = Vec::new();
    for snapshot in snapshots {
        match metric.value(snapshot) {
            Some(value) => ranked.push(RankedEntry {
                domain: snapshot.domain.clone(),
                value,
            }),
            None => excluded.push(snapshot.domain.clone()),
        }
    }

    let direction = metric.direction();
    ranked.sort_by(|a, b| {
        let ord = a.value.partial_cmp(&b.value).unwrap_or(Ordering::Equal);
        match direction {
            Direction::LowerIsBetter => ord,
            Direction::HigherIsBetter => ord.reverse(),
        }
    });

    MetricRanking {
        metric,
        direction,
        winner: ranked.first().map(|e| e.domain.clone()),
        ranked,
        excluded,
    }
}

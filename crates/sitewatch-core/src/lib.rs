//! Core snapshot + change model for SiteWatch.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "sitewatch-core";

/// Names of the extracted snapshot fields, as recorded in `failed_fields`.
pub mod fields {
    pub const CTA_BUTTONS: &str = "cta_buttons";
    pub const TESTIMONIALS_COUNT: &str = "testimonials_count";
    pub const FORM_FIELDS: &str = "form_fields";
    pub const TITLE: &str = "title";
    pub const META_DESCRIPTION: &str = "meta_description";
    pub const PRICE_POINTS: &str = "price_points";
}

/// Field types found inside one `<form>`, distinct and in first-seen order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct FormSignature {
    pub field_types: Vec<String>,
}

impl FormSignature {
    pub fn new<I, S>(field_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            field_types: field_types.into_iter().map(Into::into).collect(),
        }
    }
}

/// One best-effort observation of a domain's marketing surface.
///
/// Snapshots form an append-only log per domain. `changes_detected` is filled
/// once, right after creation, by diffing against the previous observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub domain: String,
    pub snapshot_date: DateTime<Utc>,
    pub load_time: Option<f64>,
    pub cta_buttons: Vec<String>,
    pub testimonials_count: u32,
    pub form_fields: Vec<FormSignature>,
    pub title: Option<String>,
    pub meta_description: Option<String>,
    pub price_points: Vec<String>,
    pub content_hash: Option<String>,
    pub fetch_error: Option<String>,
    /// Fields whose extraction failed; their values are placeholders.
    #[serde(default)]
    pub failed_fields: Vec<String>,
    pub changes_detected: Option<Vec<Change>>,
}

impl Snapshot {
    /// Empty snapshot with every field at its default.
    pub fn empty(domain: impl Into<String>, snapshot_date: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            domain: domain.into(),
            snapshot_date,
            load_time: None,
            cta_buttons: Vec::new(),
            testimonials_count: 0,
            form_fields: Vec::new(),
            title: None,
            meta_description: None,
            price_points: Vec::new(),
            content_hash: None,
            fetch_error: None,
            failed_fields: Vec::new(),
            changes_detected: None,
        }
    }

    /// A snapshot whose fetch failed carries no observable features.
    pub fn is_degraded(&self) -> bool {
        self.fetch_error.is_some()
    }

    /// Whether `field` (one of [`fields`]) holds an observed value.
    pub fn extracted(&self, field: &str) -> bool {
        !self.is_degraded() && !self.failed_fields.iter().any(|f| f == field)
    }

    pub fn cta_count(&self) -> usize {
        self.cta_buttons.len()
    }

    /// Mean number of field types per form, `None` when the page has no forms.
    pub fn avg_form_fields(&self) -> Option<f64> {
        if self.form_fields.is_empty() {
            return None;
        }
        let total: usize = self.form_fields.iter().map(|f| f.field_types.len()).sum();
        Some(total as f64 / self.form_fields.len() as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Impact {
    High,
    Medium,
    Low,
}

impl Impact {
    pub fn as_str(&self) -> &'static str {
        match self {
            Impact::High => "high",
            Impact::Medium => "medium",
            Impact::Low => "low",
        }
    }
}

/// Typed payload of a detected delta, tagged by the snapshot field it concerns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeKind {
    CtaButtons {
        added: Vec<String>,
        removed: Vec<String>,
    },
    Pricing {
        added: Vec<String>,
        removed: Vec<String>,
    },
    Performance {
        old: f64,
        new: f64,
        improvement: bool,
    },
    Title {
        old: String,
        new: String,
    },
    MetaDescription {
        old: String,
        new: String,
    },
    SocialProof {
        old_count: u32,
        new_count: u32,
    },
    FormFields {
        old_forms: usize,
        new_forms: usize,
        added: Vec<FormSignature>,
        removed: Vec<FormSignature>,
    },
}

impl ChangeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ChangeKind::CtaButtons { .. } => "cta_buttons",
            ChangeKind::Pricing { .. } => "pricing",
            ChangeKind::Performance { .. } => "performance",
            ChangeKind::Title { .. } => "title",
            ChangeKind::MetaDescription { .. } => "meta_description",
            ChangeKind::SocialProof { .. } => "social_proof",
            ChangeKind::FormFields { .. } => "form_fields",
        }
    }

    /// Fixed impact policy per change type.
    pub fn impact(&self) -> Impact {
        match self {
            ChangeKind::CtaButtons { .. } | ChangeKind::Pricing { .. } => Impact::High,
            ChangeKind::Performance { .. }
            | ChangeKind::Title { .. }
            | ChangeKind::SocialProof { .. }
            | ChangeKind::FormFields { .. } => Impact::Medium,
            ChangeKind::MetaDescription { .. } => Impact::Low,
        }
    }
}

/// One field-level delta between two consecutive snapshots of a domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    #[serde(flatten)]
    pub kind: ChangeKind,
    pub impact: Impact,
}

impl Change {
    pub fn new(kind: ChangeKind) -> Self {
        let impact = kind.impact();
        Self { kind, impact }
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    /// Short human-readable descriptor for briefs and logs.
    pub fn describe(&self) -> String {
        match &self.kind {
            ChangeKind::CtaButtons { added, removed } => {
                format!("CTA buttons{}", describe_set_delta(added, removed))
            }
            ChangeKind::Pricing { added, removed } => {
                format!("Pricing{}", describe_set_delta(added, removed))
            }
            ChangeKind::Performance {
                old,
                new,
                improvement,
            } => format!(
                "Load time {} from {old:.2}s to {new:.2}s",
                if *improvement { "improved" } else { "regressed" }
            ),
            ChangeKind::Title { old, new } => format!("Title changed from \"{old}\" to \"{new}\""),
            ChangeKind::MetaDescription { old, new } => {
                format!("Meta description changed from \"{old}\" to \"{new}\"")
            }
            ChangeKind::SocialProof {
                old_count,
                new_count,
            } => format!("Testimonials went from {old_count} to {new_count}"),
            ChangeKind::FormFields {
                old_forms,
                new_forms,
                ..
            } => format!("Forms changed ({old_forms} -> {new_forms} forms)"),
        }
    }
}

fn describe_set_delta(added: &[String], removed: &[String]) -> String {
    let mut out = String::new();
    if !added.is_empty() {
        out.push_str(&format!(" added: {}", added.join(", ")));
    }
    if !removed.is_empty() {
        if !out.is_empty() {
            out.push(';');
        }
        out.push_str(&format!(" removed: {}", removed.join(", ")));
    }
    out
}

/// Fetcher -> extractor handoff: the page body plus fetch metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageFetch {
    pub domain: String,
    pub url: String,
    pub status: Option<u16>,
    pub body: Option<String>,
    pub elapsed: Option<Duration>,
    pub fetched_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl PageFetch {
    pub fn succeeded(
        domain: impl Into<String>,
        url: impl Into<String>,
        status: u16,
        body: impl Into<String>,
        elapsed: Duration,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            domain: domain.into(),
            url: url.into(),
            status: Some(status),
            body: Some(body.into()),
            elapsed: Some(elapsed),
            fetched_at,
            error: None,
        }
    }

    pub fn failed(
        domain: impl Into<String>,
        url: impl Into<String>,
        error: impl Into<String>,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            domain: domain.into(),
            url: url.into(),
            status: None,
            body: None,
            elapsed: None,
            fetched_at,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.body.is_some() && self.error.is_none()
    }
}

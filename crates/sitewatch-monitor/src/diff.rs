//! Field-level diff between consecutive snapshots of one domain.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sitewatch_core::{fields, Change, ChangeKind, FormSignature, Snapshot};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiffConfig {
    /// Minimum load-time delta, in seconds, worth reporting.
    pub load_time_threshold: f64,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            load_time_threshold: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiffError {
    #[error("cannot diff snapshots of different domains: {previous} vs {current}")]
    DomainMismatch { previous: String, current: String },
}

/// Changes from `previous` to `current`, in a fixed field order.
///
/// Absent optional fields skip their comparison, as do fields whose
/// extraction failed on either side. A degraded snapshot lacks every field,
/// so any diff involving one is empty.
pub fn diff(
    previous: &Snapshot,
    current: &Snapshot,
    config: &DiffConfig,
) -> Result<Vec<Change>, DiffError> {
    if previous.domain != current.domain {
        return Err(DiffError::DomainMismatch {
            previous: previous.domain.clone(),
            current: current.domain.clone(),
        });
    }

    let mut changes = Vec::new();
    if previous.is_degraded() || current.is_degraded() {
        return Ok(changes);
    }

    let both = |field: &str| previous.extracted(field) && current.extracted(field);

    if both(fields::CTA_BUTTONS) {
        if let Some((added, removed)) = set_delta(&previous.cta_buttons, &current.cta_buttons) {
            changes.push(Change::new(ChangeKind::CtaButtons { added, removed }));
        }
    }

    if both(fields::PRICE_POINTS) {
        if let Some((added, removed)) = set_delta(&previous.price_points, &current.price_points) {
            changes.push(Change::new(ChangeKind::Pricing { added, removed }));
        }
    }

    if let (Some(old), Some(new)) = (previous.load_time, current.load_time) {
        if (new - old).abs() > config.load_time_threshold {
            changes.push(Change::new(ChangeKind::Performance {
                old,
                new,
                improvement: new < old,
            }));
        }
    }

    if let (true, Some(old), Some(new)) = (both(fields::TITLE), &previous.title, &current.title) {
        if old != new {
            changes.push(Change::new(ChangeKind::Title {
                old: old.clone(),
                new: new.clone(),
            }));
        }
    }

    if let (true, Some(old), Some(new)) = (
        both(fields::META_DESCRIPTION),
        &previous.meta_description,
        &current.meta_description,
    ) {
        if old != new {
            changes.push(Change::new(ChangeKind::MetaDescription {
                old: old.clone(),
                new: new.clone(),
            }));
        }
    }

    if both(fields::TESTIMONIALS_COUNT) && previous.testimonials_count != current.testimonials_count
    {
        changes.push(Change::new(ChangeKind::SocialProof {
            old_count: previous.testimonials_count,
            new_count: current.testimonials_count,
        }));
    }

    let (added, removed) = if both(fields::FORM_FIELDS) {
        multiset_delta(&previous.form_fields, &current.form_fields)
    } else {
        (Vec::new(), Vec::new())
    };
    if !added.is_empty() || !removed.is_empty() {
        changes.push(Change::new(ChangeKind::FormFields {
            old_forms: previous.form_fields.len(),
            new_forms: current.form_fields.len(),
            added,
            removed,
        }));
    }

    Ok(changes)
}

/// Set difference both ways, sorted; `None` when the sets are equal.
fn set_delta(old: &[String], new: &[String]) -> Option<(Vec<String>, Vec<String>)> {
    let old = old.iter().collect::<BTreeSet<_>>();
    let new = new.iter().collect::<BTreeSet<_>>();
    let added = new.difference(&old).map(|s| (*s).clone()).collect::<Vec<_>>();
    let removed = old.difference(&new).map(|s| (*s).clone()).collect::<Vec<_>>();
    if added.is_empty() && removed.is_empty() {
        None
    } else {
        Some((added, removed))
    }
}

fn multiset_delta(
    old: &[FormSignature],
    new: &[FormSignature],
) -> (Vec<FormSignature>, Vec<FormSignature>) {
    let mut counts: BTreeMap<&FormSignature, i64> = BTreeMap::new();
    for sig in new {
        *counts.entry(sig).or_default() += 1;
    }
    for sig in old {
        *counts.entry(sig).or_default() -= 1;
    }

    let mut added = Vec::new();
    let mut removed = Vec::new();
    for (sig, count) in counts {
        let target = if count > 0 { &mut added } else { &mut removed };
        for _ in 0..count.unsigned_abs() {
            target.push(sig.clone());
        }
    }
    (added, removed)
}

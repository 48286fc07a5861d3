//! Parquet export of a run's snapshots and changes, with a hashed manifest.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sitewatch_core::Snapshot;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes `snapshots/{snapshots,changes}.parquet` and `snapshots/manifest.json`
/// under `reports_dir`; returns the manifest path.
pub fn export_parquet_snapshots(reports_dir: &Path, snapshots: &[Snapshot]) -> Result<std::path::PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    std::fs::create_dir_all(&snapshot_dir)
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let snapshots_path = snapshot_dir.join("snapshots.parquet");
    let changes_path = snapshot_dir.join("changes.parquet");
    write_snapshots_parquet(&snapshots_path, snapshots)?;
    write_changes_parquet(&changes_path, snapshots)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("snapshots", reports_dir, &snapshots_path)?,
            manifest_entry("changes", reports_dir, &changes_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_snapshots_parquet(path: &Path, snapshots: &[Snapshot]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("snapshot_id", DataType::Utf8, false),
        ArrowField::new("domain", DataType::Utf8, false),
        ArrowField::new("snapshot_date", DataType::Utf8, false),
        ArrowField::new("load_time", DataType::Float64, true),
        ArrowField::new("cta_count", DataType::UInt32, false),
        ArrowField::new("testimonials_count", DataType::UInt32, false),
        ArrowField::new("form_count", DataType::UInt32, false),
        ArrowField::new("title", DataType::Utf8, true),
        ArrowField::new("degraded", DataType::Boolean, false),
        ArrowField::new("change_count", DataType::UInt32, true),
    ]));

    let ids = StringArray::from(
        snapshots
            .iter()
            .map(|s| Some(s.id.to_string()))
            .collect::<Vec<_>>(),
    );
    let domains = StringArray::from(
        snapshots
            .iter()
            .map(|s| Some(s.domain.as_str()))
            .collect::<Vec<_>>(),
    );
    let dates = StringArray::from(
        snapshots
            .iter()
            .map(|s| Some(s.snapshot_date.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let load_times = Float64Array::from(snapshots.iter().map(|s| s.load_time).collect::<Vec<_>>());
    let cta_counts = UInt32Array::from(
        snapshots
            .iter()
            .map(|s| s.cta_buttons.len() as u32)
            .collect::<Vec<_>>(),
    );
    let testimonials = UInt32Array::from(
        snapshots
            .iter()
            .map(|s| s.testimonials_count)
            .collect::<Vec<_>>(),
    );
    let form_counts = UInt32Array::from(
        snapshots
            .iter()
            .map(|s| s.form_fields.len() as u32)
            .collect::<Vec<_>>(),
    );
    let titles = StringArray::from(
        snapshots
            .iter()
            .map(|s| s.title.as_deref())
            .collect::<Vec<_>>(),
    );
    let degraded = BooleanArray::from(snapshots.iter().map(Snapshot::is_degraded).collect::<Vec<_>>());
    let change_counts = UInt32Array::from(
        snapshots
            .iter()
            .map(|s| s.changes_detected.as_ref().map(|c| c.len() as u32))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(domains),
            Arc::new(dates),
            Arc::new(load_times),
            Arc::new(cta_counts),
            Arc::new(testimonials),
            Arc::new(form_counts),
            Arc::new(titles),
            Arc::new(degraded),
            Arc::new(change_counts),
        ],
    )
    .context("building snapshots record batch")?;
    write_parquet(path, batch)
}

fn write_changes_parquet(path: &Path, snapshots: &[Snapshot]) -> Result<()> {
    let rows = snapshots
        .iter()
        .flat_map(|s| {
            s.changes_detected
                .iter()
                .flatten()
                .map(move |change| (s, change))
        })
        .collect::<Vec<_>>();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("snapshot_id", DataType::Utf8, false),
        ArrowField::new("domain", DataType::Utf8, false),
        ArrowField::new("change_type", DataType::Utf8, false),
        ArrowField::new("impact", DataType::Utf8, false),
        ArrowField::new("description", DataType::Utf8, false),
    ]));
    let ids = StringArray::from(
        rows.iter()
            .map(|(s, _)| Some(s.id.to_string()))
            .collect::<Vec<_>>(),
    );
    let domains = StringArray::from(
        rows.iter()
            .map(|(s, _)| Some(s.domain.as_str()))
            .collect::<Vec<_>>(),
    );
    let types = StringArray::from(
        rows.iter()
            .map(|(_, c)| Some(c.type_name()))
            .collect::<Vec<_>>(),
    );
    let impacts = StringArray::from(
        rows.iter()
            .map(|(_, c)| Some(c.impact.as_str()))
            .collect::<Vec<_>>(),
    );
    let descriptions = StringArray::from(
        rows.iter()
            .map(|(_, c)| Some(c.describe()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(domains),
            Arc::new(types),
            Arc::new(impacts),
            Arc::new(descriptions),
        ],
    )
    .context("building changes record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sitewatch_core::{Change, ChangeKind};
    use tempfile::tempdir;

    #[test]
    fn export_writes_both_files_and_a_manifest() {
        let dir = tempdir().unwrap();
        let mut with_changes = Snapshot::empty("acme.io", Utc::now());
        with_changes.load_time = Some(1.2);
        with_changes.changes_detected = Some(vec![Change::new(ChangeKind::SocialProof {
            old_count: 1,
            new_count: 2,
        })]);
        let mut first = Snapshot::empty("rival.io", Utc::now());
        first.fetch_error = Some("timeout".into());

        let manifest_path = export_parquet_snapshots(dir.path(), &[with_changes, first]).unwrap();
        let manifest: ParquetManifest =
            serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();

        assert_eq!(manifest.files.len(), 2);
        for file in &manifest.files {
            assert!(dir.path().join(&file.path).exists());
            assert_eq!(file.sha256.len(), 64);
            assert!(file.bytes > 0);
        }
    }
}

//! Parquet snapshot of the alert table plus a digest manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Int32Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use rasff_core::AlertRecord;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

pub const SNAPSHOT_FILE: &str = "rasff_data.parquet";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub row_count: usize,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes `rasff_data.parquet` and `manifest.json` into `out_dir`.
pub async fn export_snapshot(out_dir: &Path, records: &[AlertRecord]) -> Result<PathBuf> {
    fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("creating {}", out_dir.display()))?;

    let snapshot_path = out_dir.join(SNAPSHOT_FILE);
    write_alerts_parquet(&snapshot_path, records)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        generated_at: Utc::now(),
        row_count: records.len(),
        files: vec![manifest_entry("rasff_data", out_dir, &snapshot_path)?],
    };
    let manifest_path = out_dir.join(MANIFEST_FILE);
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
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

fn text_column<'a>(records: &'a [AlertRecord], get: impl Fn(&'a AlertRecord) -> Option<&'a str>) -> StringArray {
    StringArray::from(records.iter().map(get).collect::<Vec<_>>())
}

fn write_alerts_parquet(path: &Path, records: &[AlertRecord]) -> Result<()> {
    let mut fields = AlertRecord::COLUMNS[..12]
        .iter()
        .map(|name| ArrowField::new(*name, DataType::Utf8, true))
        .collect::<Vec<_>>();
    fields.push(ArrowField::new("year", DataType::Int32, true));
    fields.push(ArrowField::new("week", DataType::UInt32, true));
    let schema = Arc::new(Schema::new(fields));

    let dates = StringArray::from(
        records
            .iter()
            .map(|r| r.date_of_case.map(|d| d.format("%Y-%m-%d").to_string()))
            .collect::<Vec<_>>(),
    );
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(dates),
            Arc::new(text_column(records, |r| r.reference.as_deref())),
            Arc::new(text_column(records, |r| r.notification_from.as_deref())),
            Arc::new(text_column(records, |r| r.country_origin.as_deref())),
            Arc::new(text_column(records, |r| r.product.as_deref())),
            Arc::new(text_column(records, |r| r.product_category.as_deref())),
            Arc::new(text_column(records, |r| r.hazard_substance.as_deref())),
            Arc::new(text_column(records, |r| r.hazard_category.as_deref())),
            Arc::new(text_column(records, |r| Some(r.prodcat.as_str()))),
            Arc::new(text_column(records, |r| Some(r.groupprod.as_str()))),
            Arc::new(text_column(records, |r| Some(r.hazcat.as_str()))),
            Arc::new(text_column(records, |r| Some(r.grouphaz.as_str()))),
            Arc::new(Int32Array::from(records.iter().map(|r| r.year).collect::<Vec<_>>())),
            Arc::new(UInt32Array::from(records.iter().map(|r| r.week).collect::<Vec<_>>())),
        ],
    )
    .context("building rasff_data record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, base_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(base_dir)
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

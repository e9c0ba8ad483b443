//! Local filesystem collector.
//!
//! Walks a directory tree, normalizes matching files into [`FileRecord`]s,
//! and feeds them through the same check-status / batch / ingest path the
//! SCM engine uses. There is no commit history here, so every pass is a
//! full inventory reconciled by content hash.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{error, info};

use crate::config::FsCollectorConfig;
use crate::ingester::{IngestApi, IngestDocument};
use crate::models::{guess_content_type, FileRecord, IngestionError, InventoryReport};

/// Always skipped regardless of configured excludes.
const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/target/**", "**/node_modules/**"];

/// Walk the configured root and produce normalized records, sorted by URI.
pub fn scan(config: &FsCollectorConfig) -> Result<Vec<FileRecord>> {
    let root = &config.root;
    if !root.exists() {
        bail!("filesystem root does not exist: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;
    let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&excludes)?;

    let mut records = Vec::new();
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        let content = std::fs::read(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let modified: Option<DateTime<Utc>> = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::from);

        let mut record = FileRecord::new(rel_str.clone(), content);
        record.content_type = guess_content_type(&rel_str);
        record.last_updated = modified.map(|m| m.to_rfc3339());
        record
            .metadata
            .insert("size".to_string(), Value::from(record.content.len()));
        records.push(record);
    }

    records.sort_by(|a, b| a.uri.cmp(&b.uri));
    info!(root = %root.display(), count = records.len(), "scanned filesystem");
    Ok(records)
}

/// Manifest describing the scanned tree: path, hash, size, and type per
/// file. Written out by the CLI for inspection before a run.
pub fn build_manifest(config: &FsCollectorConfig) -> Result<Vec<Value>> {
    let records = scan(config)?;
    Ok(records
        .iter()
        .map(|r| {
            serde_json::json!({
                "path": r.uri,
                "sha256": r.sha256,
                "metadata": {
                    "size": r.content.len(),
                    "content-type": r.content_type.clone()
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                },
            })
        })
        .collect())
}

/// Which files the Ingester considers new or mismatched.
pub async fn check_status(
    config: &FsCollectorConfig,
    ingester: &dyn IngestApi,
    source: &str,
) -> Result<Vec<String>> {
    let records = scan(config)?;
    let hashes: BTreeMap<String, String> = records
        .iter()
        .map(|r| (r.uri.clone(), r.sha256.clone()))
        .collect();
    ingester.check_status(source, &hashes).await
}

/// Full filesystem inventory pass: scan, diff hashes, ingest the subset
/// that needs processing.
pub async fn run_inventory(
    config: &FsCollectorConfig,
    ingester: &dyn IngestApi,
    source: &str,
) -> Result<InventoryReport> {
    let records = scan(config)?;

    let hashes: BTreeMap<String, String> = records
        .iter()
        .map(|r| (r.uri.clone(), r.sha256.clone()))
        .collect();
    let to_process: BTreeSet<String> = ingester
        .check_status(source, &hashes)
        .await?
        .into_iter()
        .collect();

    let mut report = InventoryReport {
        inventory: records.iter().map(|r| r.uri.clone()).collect(),
        to_process: records
            .iter()
            .filter(|r| to_process.contains(&r.uri))
            .map(|r| r.uri.clone())
            .collect(),
        ..Default::default()
    };
    info!(count = report.to_process.len(), "files to process");

    if report.to_process.is_empty() {
        return Ok(report);
    }

    let batch_id = match ingester.find_batch_for_source(source).await? {
        Some(id) => id,
        None => ingester.create_batch(source, source).await?,
    };

    for record in records.into_iter().filter(|r| to_process.contains(&r.uri)) {
        let mime_type = record
            .content_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let doc = IngestDocument {
            uri: record.uri.clone(),
            content: record.content,
            mime_type,
            metadata: serde_json::Map::new(),
        };
        match ingester.ingest_document(source, batch_id, &doc).await {
            Ok(()) => report.ingested.push(record.uri),
            Err(err) => {
                error!(uri = %record.uri, %err, "ingest failed");
                report.errors.push(IngestionError {
                    uri: record.uri,
                    source: source.to_string(),
                    batch_id: Some(batch_id),
                    error: err.to_string(),
                });
            }
        }
    }

    Ok(report)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn config_for(root: &std::path::Path) -> FsCollectorConfig {
        FsCollectorConfig {
            root: root.to_path_buf(),
            include_globs: vec!["**/*".to_string()],
            exclude_globs: Vec::new(),
        }
    }

    #[test]
    fn scan_is_sorted_and_hashed() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.md"), "bee").unwrap();
        fs::write(dir.path().join("a.md"), "hello").unwrap();

        let records = scan(&config_for(dir.path())).unwrap();
        let uris: Vec<&str> = records.iter().map(|r| r.uri.as_str()).collect();
        assert_eq!(uris, vec!["a.md", "sub/b.md"]);
        assert_eq!(
            records[0].sha256,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(records[0].content_type.as_deref(), Some("text/markdown"));
    }

    #[test]
    fn scan_respects_globs_and_default_excludes() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/HEAD"), "ref").unwrap();
        fs::write(dir.path().join("keep.md"), "x").unwrap();
        fs::write(dir.path().join("skip.log"), "y").unwrap();

        let mut config = config_for(dir.path());
        config.include_globs = vec!["**/*.md".to_string()];

        let records = scan(&config).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].uri, "keep.md");
    }

    #[test]
    fn scan_missing_root_fails() {
        let config = config_for(std::path::Path::new("/nonexistent/ingest-agent-test"));
        assert!(scan(&config).is_err());
    }

    #[test]
    fn manifest_carries_size_and_type() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("doc.md"), "body").unwrap();

        let manifest = build_manifest(&config_for(dir.path())).unwrap();
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest[0]["path"], "doc.md");
        assert_eq!(manifest[0]["metadata"]["size"], 4);
        assert_eq!(manifest[0]["metadata"]["content-type"], "text/markdown");
    }
}

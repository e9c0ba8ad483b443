//! Core data models used throughout the ingestion agent.
//!
//! These types represent the files, commits, and sync results that flow
//! through the inventory and incremental-sync pipelines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Which kinds of content a sync pass covers.
///
/// The filter value participates in the source identity, so "files only"
/// and "issues only" syncs of the same repository track separate cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentFilter {
    #[default]
    All,
    Files,
    Issues,
}

impl ContentFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentFilter::All => "all",
            ContentFilter::Files => "files",
            ContentFilter::Issues => "issues",
        }
    }

    pub fn includes_files(&self) -> bool {
        matches!(self, ContentFilter::All | ContentFilter::Files)
    }

    pub fn includes_issues(&self) -> bool {
        matches!(self, ContentFilter::All | ContentFilter::Issues)
    }
}

/// Per-source sync cursor persisted by the remote Ingester.
///
/// `last_commit_sha == None` means the source has never been synced and the
/// next sync takes the full-inventory path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub source_id: String,
    #[serde(default)]
    pub last_commit_sha: Option<String>,
    #[serde(default)]
    pub last_sync_date: Option<DateTime<Utc>>,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

fn default_branch() -> String {
    "main".to_string()
}

impl SyncState {
    /// The default-empty state the store returns for an unknown source.
    pub fn empty(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            last_commit_sha: None,
            last_sync_date: None,
            branch: default_branch(),
            metadata: None,
        }
    }
}

/// One commit from history traversal, newest-first in API order.
/// Ephemeral: consumed within a single sync call.
#[derive(Debug, Clone, Deserialize)]
pub struct CommitRecord {
    pub sha: String,
    #[serde(default)]
    pub message: String,
}

/// Change status of a file within one commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeStatus {
    Added,
    Modified,
    Removed,
}

impl ChangeStatus {
    /// Providers report "removed" (GitHub) or "deleted" (Gitea); anything
    /// else is treated as an add/modify.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "removed" | "deleted" => ChangeStatus::Removed,
            "added" => ChangeStatus::Added,
            _ => ChangeStatus::Modified,
        }
    }
}

/// One file touched by a commit.
#[derive(Debug, Clone)]
pub struct CommitFileChange {
    pub filename: String,
    pub status: ChangeStatus,
}

/// Detail for a single commit: the files it touched.
#[derive(Debug, Clone)]
pub struct CommitDetail {
    pub sha: String,
    pub files: Vec<CommitFileChange>,
}

/// Normalized file record: the unit the engine reconciles and ingests.
///
/// Produced uniformly from a full listing, a single-file fetch, an issue
/// rendering, or the filesystem collector.
#[derive(Debug, Clone)]
pub struct FileRecord {
    /// Source-relative URI (repo path, or `/{owner}/{repo}/issues/{n}`).
    pub uri: String,
    /// Hex SHA-256 over `content`.
    pub sha256: String,
    pub content: Vec<u8>,
    pub content_type: Option<String>,
    /// Last-modified timestamp when the backend exposes one (Gitea does,
    /// GitHub's contents API does not).
    pub last_updated: Option<String>,
    /// Head commit sha for the listing that produced this record, if known.
    pub last_commit_sha: Option<String>,
    /// Free-form metadata forwarded to the Ingester (housekeeping keys are
    /// stripped before upload).
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl FileRecord {
    pub fn new(uri: impl Into<String>, content: Vec<u8>) -> Self {
        let sha256 = hash_bytes(&content);
        Self {
            uri: uri.into(),
            sha256,
            content,
            content_type: None,
            last_updated: None,
            last_commit_sha: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// Extension without the leading dot, lowercased. Empty when absent.
    pub fn extension(&self) -> String {
        extension_of(&self.uri)
    }
}

/// Hex SHA-256 of a byte slice.
pub fn hash_bytes(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Extension of a path-like string, without the dot, lowercased.
pub fn extension_of(path: &str) -> String {
    std::path::Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Map a file extension to a MIME type. Deliberately a small fixed table,
/// not a sniffing heuristic; unknown extensions get no type and the
/// Ingester receives `application/octet-stream`.
pub fn guess_content_type(path: &str) -> Option<String> {
    let mime = match extension_of(path).as_str() {
        "md" => "text/markdown",
        "txt" => "text/plain",
        "json" => "application/json",
        "yaml" | "yml" => "text/yaml",
        "rst" => "text/x-rst",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => {
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        }
        _ => return None,
    };
    Some(mime.to_string())
}

/// A per-file ingestion failure. Collected, never raised.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionError {
    pub uri: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<i64>,
    pub error: String,
}

/// Result of a full-inventory run (also the fallback path of incremental
/// sync when no cursor exists).
#[derive(Debug, Clone, Serialize, Default)]
pub struct InventoryReport {
    /// URIs of every file enumerated at the source.
    pub inventory: Vec<String>,
    /// Subset whose hash the Ingester reported as new or mismatched.
    pub to_process: Vec<String>,
    pub ingested: Vec<String>,
    pub errors: Vec<IngestionError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_result: Option<serde_json::Value>,
}

/// Result of an incremental sync pass over a commit window.
#[derive(Debug, Clone, Serialize, Default)]
pub struct SyncReport {
    pub status: String,
    pub commits_processed: usize,
    pub files_changed: usize,
    pub files_removed: usize,
    pub ingested: Vec<String>,
    pub errors: Vec<IngestionError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_commit_sha: Option<String>,
}

impl SyncReport {
    pub fn up_to_date() -> Self {
        Self {
            status: "up-to-date".to_string(),
            ..Default::default()
        }
    }
}

/// Outcome of a sync invocation: the full-inventory fallback keeps its own
/// shape (`inventory` / `to_process`), incremental passes report commits.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SyncOutcome {
    FullSync(InventoryReport),
    Incremental(SyncReport),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_hex_sha256() {
        // sha256("hello")
        assert_eq!(
            hash_bytes(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn file_record_extension() {
        let rec = FileRecord::new("docs/README.MD", b"x".to_vec());
        assert_eq!(rec.extension(), "md");
        let rec = FileRecord::new("Makefile", b"x".to_vec());
        assert_eq!(rec.extension(), "");
    }

    #[test]
    fn change_status_parses_both_removal_spellings() {
        assert_eq!(ChangeStatus::parse("removed"), ChangeStatus::Removed);
        assert_eq!(ChangeStatus::parse("deleted"), ChangeStatus::Removed);
        assert_eq!(ChangeStatus::parse("added"), ChangeStatus::Added);
        assert_eq!(ChangeStatus::parse("changed"), ChangeStatus::Modified);
    }

    #[test]
    fn content_filter_identity() {
        assert_eq!(ContentFilter::All.as_str(), "all");
        assert!(ContentFilter::Files.includes_files());
        assert!(!ContentFilter::Files.includes_issues());
    }

    #[test]
    fn full_sync_report_has_inventory_key() {
        let out = SyncOutcome::FullSync(InventoryReport::default());
        let json = serde_json::to_value(&out).unwrap();
        assert!(json.get("inventory").is_some());
        assert!(json.get("commits_processed").is_none());
    }
}

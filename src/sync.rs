//! Incremental-sync and full-inventory engine.
//!
//! The engine reconciles a repository against the Ingester's view of it.
//! Two passes exist:
//!
//! - **Full inventory**: enumerate everything at the source, ask the
//!   Ingester which hashes are new or mismatched, and ingest that subset.
//! - **Incremental sync**: walk the commits since the stored cursor, fetch
//!   only the files those commits touched, and ingest the changes. Falls
//!   back to the full pass when no cursor exists.
//!
//! Error discipline is two-channel: listing-level failures (commit walk,
//! file enumeration, sync-state reads) abort the pass, while per-document
//! failures (one fetch, one upload) are recorded in the report and the pass
//! continues. The cursor only advances when the per-document error list is
//! empty, so a partially failed window is re-examined on the next run.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, warn};

use crate::ingester::{IngestApi, IngestDocument};
use crate::models::{
    extension_of, hash_bytes, ChangeStatus, ContentFilter, FileRecord, IngestionError,
    InventoryReport, SyncOutcome, SyncReport,
};
use crate::scm::{Scm, SourceApi};

/// Metadata keys the Ingester manages itself; stripped before upload.
const HOUSEKEEPING_KEYS: &[&str] = &["path", "sha256", "size", "source", "batch_id", "source_uri"];

const DEFAULT_MIME: &str = "application/octet-stream";

/// Parameters for one sync or inventory pass.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub repo: String,
    pub owner: String,
    pub branch: String,
    pub content_filter: ContentFilter,
    pub priority: u32,
    pub start_workflows: bool,
    pub workflow_definition_id: Option<String>,
    pub param_set_id: Option<String>,
}

impl SyncOptions {
    pub fn new(repo: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            owner: owner.into(),
            branch: "main".to_string(),
            content_filter: ContentFilter::All,
            priority: 0,
            start_workflows: false,
            workflow_definition_id: None,
            param_set_id: None,
        }
    }
}

/// Stable identity of one (backend, owner, repo, filter) combination. The
/// Ingester keys batches and cursors on this string.
pub fn source_id(scm: &str, owner: &str, repo: &str, filter: ContentFilter) -> String {
    format!("{scm}:{owner}:{repo}:{}", filter.as_str())
}

/// Workflow parameters are all-or-nothing: requesting workflows without
/// both identifiers fails before any network traffic.
pub fn validate_workflow_params(
    start_workflows: bool,
    workflow_definition_id: Option<&str>,
    param_set_id: Option<&str>,
) -> Result<()> {
    if !start_workflows {
        return Ok(());
    }
    if workflow_definition_id.map_or(true, str::is_empty) {
        bail!("start_workflows requires workflow_definition_id");
    }
    if param_set_id.map_or(true, str::is_empty) {
        bail!("start_workflows requires param_set_id");
    }
    Ok(())
}

pub struct SyncEngine<'a> {
    source: &'a dyn SourceApi,
    ingester: &'a dyn IngestApi,
    scm: Scm,
    extensions: Vec<String>,
}

impl<'a> SyncEngine<'a> {
    pub fn new(
        source: &'a dyn SourceApi,
        ingester: &'a dyn IngestApi,
        scm: Scm,
        extensions: Vec<String>,
    ) -> Self {
        Self {
            source,
            ingester,
            scm,
            extensions,
        }
    }

    fn source_id(&self, opts: &SyncOptions) -> String {
        source_id(
            self.scm.as_str(),
            &opts.owner,
            &opts.repo,
            opts.content_filter,
        )
    }

    /// Enumerate everything the content filter covers: repository files
    /// (newest first when timestamps exist) and issues rendered as markdown.
    async fn collect_inventory(&self, opts: &SyncOptions) -> Result<Vec<FileRecord>> {
        let mut records = Vec::new();

        if opts.content_filter.includes_files() {
            let mut files = self
                .source
                .list_repo_files(
                    &opts.repo,
                    Some(&opts.owner),
                    Some(&self.extensions),
                    &opts.branch,
                )
                .await?;
            // Untimestamped records sort first, same as "modified just now".
            files.sort_by(|a, b| match (&a.last_updated, &b.last_updated) {
                (None, None) => std::cmp::Ordering::Equal,
                (None, Some(_)) => std::cmp::Ordering::Less,
                (Some(_), None) => std::cmp::Ordering::Greater,
                (Some(x), Some(y)) => y.cmp(x),
            });
            records.extend(files);
        }

        if opts.content_filter.includes_issues() {
            records.extend(self.collect_issues(opts, None).await?);
        }

        Ok(records)
    }

    /// Issues as synthetic markdown documents.
    async fn collect_issues(
        &self,
        opts: &SyncOptions,
        since: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Vec<FileRecord>> {
        let issues = self
            .source
            .list_issues(&opts.repo, Some(&opts.owner), true, since)
            .await?;

        let mut records = Vec::with_capacity(issues.len());
        for issue in &issues {
            records.push(issue_record(issue, &opts.owner, &opts.repo));
        }
        Ok(records)
    }

    async fn find_or_create_batch(&self, source: &str) -> Result<i64> {
        if let Some(batch_id) = self.ingester.find_batch_for_source(source).await? {
            info!(source, batch_id, "using existing batch");
            return Ok(batch_id);
        }
        let batch_id = self.ingester.create_batch(source, source).await?;
        info!(source, batch_id, "created batch");
        Ok(batch_id)
    }

    /// Upload a set of records into a batch, recording per-document
    /// failures instead of aborting.
    async fn ingest_records(
        &self,
        records: &[FileRecord],
        source: &str,
        batch_id: i64,
        ingested: &mut Vec<String>,
        errors: &mut Vec<IngestionError>,
    ) {
        for record in records {
            let doc = to_document(record);
            info!(uri = %doc.uri, "starting ingest");
            match self.ingester.ingest_document(source, batch_id, &doc).await {
                Ok(()) => {
                    ingested.push(doc.uri);
                }
                Err(err) => {
                    error!(uri = %doc.uri, %err, "ingest failed");
                    errors.push(IngestionError {
                        uri: doc.uri,
                        source: source.to_string(),
                        batch_id: Some(batch_id),
                        error: err.to_string(),
                    });
                }
            }
        }
    }

    async fn maybe_start_workflows(
        &self,
        opts: &SyncOptions,
        batch_id: i64,
        errors: &[IngestionError],
        ingested: &[String],
    ) -> Result<Option<Value>> {
        if !opts.start_workflows || !errors.is_empty() || ingested.is_empty() {
            return Ok(None);
        }
        let definition = opts
            .workflow_definition_id
            .as_deref()
            .context("workflow_definition_id missing")?;
        let params = opts.param_set_id.as_deref().context("param_set_id missing")?;
        info!(batch_id, "starting workflows");
        let result = self
            .ingester
            .start_workflows(batch_id, definition, params, opts.priority)
            .await?;
        Ok(Some(result))
    }

    /// Full-inventory pass: enumerate, diff hashes against the Ingester,
    /// ingest the new-or-mismatched subset.
    pub async fn load_inventory(&self, opts: &SyncOptions) -> Result<InventoryReport> {
        validate_workflow_params(
            opts.start_workflows,
            opts.workflow_definition_id.as_deref(),
            opts.param_set_id.as_deref(),
        )?;

        let source = self.source_id(opts);
        let records = self.collect_inventory(opts).await?;

        let hashes: BTreeMap<String, String> = records
            .iter()
            .map(|r| (r.uri.clone(), r.sha256.clone()))
            .collect();
        let to_process_uris: BTreeSet<String> = self
            .ingester
            .check_status(&source, &hashes)
            .await?
            .into_iter()
            .collect();

        let mut report = InventoryReport {
            inventory: records.iter().map(|r| r.uri.clone()).collect(),
            to_process: records
                .iter()
                .filter(|r| to_process_uris.contains(&r.uri))
                .map(|r| r.uri.clone())
                .collect(),
            ..Default::default()
        };
        info!(count = report.to_process.len(), "files to process");

        if report.to_process.is_empty() {
            info!("nothing to process");
            return Ok(report);
        }

        let batch_id = self.find_or_create_batch(&source).await?;

        let to_ingest: Vec<FileRecord> = records
            .into_iter()
            .filter(|r| to_process_uris.contains(&r.uri))
            .collect();

        let mut ingested = Vec::new();
        let mut errors = Vec::new();
        self.ingest_records(&to_ingest, &source, batch_id, &mut ingested, &mut errors)
            .await;

        report.workflow_result = self
            .maybe_start_workflows(opts, batch_id, &errors, &ingested)
            .await?;
        report.ingested = ingested;
        report.errors = errors;
        Ok(report)
    }

    /// Incremental pass driven by commit history. Falls back to the full
    /// inventory when the source has no cursor yet.
    pub async fn incremental_sync(&self, opts: &SyncOptions) -> Result<SyncOutcome> {
        validate_workflow_params(
            opts.start_workflows,
            opts.workflow_definition_id.as_deref(),
            opts.param_set_id.as_deref(),
        )?;

        let source = self.source_id(opts);
        info!(source, "starting incremental sync");

        let state = self.ingester.get_sync_state(&source).await?;

        let Some(last_commit_sha) = state.last_commit_sha.clone() else {
            info!(source, "no previous sync state, performing full sync");
            return self.full_sync_fallback(opts, &source).await;
        };
        info!(last_commit_sha, "last synced commit");

        // Issues changed since the last pass.
        let issues = if opts.content_filter.includes_issues() {
            let issues = self.collect_issues(opts, state.last_sync_date).await?;
            info!(count = issues.len(), "issues to ingest");
            issues
        } else {
            Vec::new()
        };

        let mut errors: Vec<IngestionError> = Vec::new();
        let mut commits_processed = 0usize;
        let mut changed_files: BTreeSet<String> = BTreeSet::new();
        let mut removed_files: BTreeSet<String> = BTreeSet::new();
        let mut file_data: Vec<FileRecord> = Vec::new();
        let mut newest_commit_sha: Option<String> = None;

        if opts.content_filter.includes_files() {
            let new_commits = self
                .source
                .list_commits_since(
                    &opts.repo,
                    Some(&opts.owner),
                    Some(&last_commit_sha),
                    &opts.branch,
                    100,
                )
                .await?;

            if new_commits.is_empty() && issues.is_empty() {
                info!("no new commits, repository is up to date");
                return Ok(SyncOutcome::Incremental(SyncReport::up_to_date()));
            }

            commits_processed = new_commits.len();
            newest_commit_sha = new_commits.first().map(|c| c.sha.clone());
            info!(count = commits_processed, "new commits to process");

            // Union of per-commit file changes, newest commit first. A
            // removal discards any earlier add of the same path.
            for commit in &new_commits {
                match self
                    .source
                    .get_commit_details(&opts.repo, Some(&opts.owner), &commit.sha)
                    .await
                {
                    Ok(detail) => {
                        for change in detail.files {
                            if change.status == ChangeStatus::Removed {
                                removed_files.insert(change.filename.clone());
                                changed_files.remove(&change.filename);
                            } else {
                                changed_files.insert(change.filename);
                            }
                        }
                    }
                    Err(err) => {
                        // The commit's changes are unknown; record it so the
                        // cursor stays put and the window is retried.
                        error!(sha = %commit.sha, %err, "failed to fetch commit details");
                        errors.push(IngestionError {
                            uri: format!("commit:{}", commit.sha),
                            source: source.clone(),
                            batch_id: None,
                            error: err.to_string(),
                        });
                    }
                }
            }
            info!(
                changed = changed_files.len(),
                removed = removed_files.len(),
                "file changes across commit window"
            );

            for file_path in &changed_files {
                let ext = extension_of(file_path);
                if !self.extensions.contains(&ext) {
                    debug!(file_path, ext, "skipping, extension not allowed");
                    continue;
                }
                match self
                    .source
                    .get_single_file(&opts.repo, Some(&opts.owner), file_path, &opts.branch)
                    .await
                {
                    Ok(record) => file_data.push(record),
                    Err(err) => {
                        error!(file_path, %err, "failed to fetch changed file");
                        errors.push(IngestionError {
                            uri: file_path.clone(),
                            source: source.clone(),
                            batch_id: None,
                            error: err.to_string(),
                        });
                    }
                }
            }
            info!(count = file_data.len(), "fetched changed files");
        } else if issues.is_empty() {
            info!("no new issues, repository is up to date");
            return Ok(SyncOutcome::Incremental(SyncReport::up_to_date()));
        }

        file_data.extend(issues);

        let mut ingested = Vec::new();
        let mut workflow_result = None;

        if !file_data.is_empty() {
            let batch_id = self.find_or_create_batch(&source).await?;
            self.ingest_records(&file_data, &source, batch_id, &mut ingested, &mut errors)
                .await;
            workflow_result = self
                .maybe_start_workflows(opts, batch_id, &errors, &ingested)
                .await?;
        }

        // The cursor moves only on a clean pass; any recorded error leaves
        // it at the previous commit so the whole window is retried.
        let mut report = SyncReport {
            status: "synced".to_string(),
            commits_processed,
            files_changed: changed_files.len(),
            files_removed: removed_files.len(),
            ingested,
            errors,
            workflow_result,
            new_commit_sha: None,
        };

        if report.errors.is_empty() {
            let latest = newest_commit_sha.unwrap_or(last_commit_sha);
            let metadata = serde_json::json!({
                "commits_processed": report.commits_processed,
                "files_changed": report.files_changed,
                "files_removed": report.files_removed,
                "files_ingested": report.ingested.len(),
            });
            self.ingester
                .update_sync_state(&source, &latest, &opts.branch, Some(&metadata))
                .await
                .context("updating sync state")?;
            info!(new_commit_sha = %latest, "sync state advanced");
            report.new_commit_sha = Some(latest);
        } else {
            warn!(
                errors = report.errors.len(),
                "errors during sync, cursor not advanced"
            );
        }

        Ok(SyncOutcome::Incremental(report))
    }

    /// Full inventory for a source with no cursor; on a clean run the
    /// cursor is seeded from the listing's head commit so the next pass can
    /// go incremental.
    async fn full_sync_fallback(
        &self,
        opts: &SyncOptions,
        source: &str,
    ) -> Result<SyncOutcome> {
        let report = self.load_inventory(opts).await?;

        if report.errors.is_empty() {
            if let Some(sha) = self.head_commit_hint(opts).await {
                self.ingester
                    .update_sync_state(source, &sha, &opts.branch, Some(&serde_json::json!({})))
                    .await
                    .context("seeding sync state")?;
                info!(new_commit_sha = %sha, "seeded sync cursor after full sync");
            }
        } else {
            warn!(
                errors = report.errors.len(),
                "errors during full sync, cursor not seeded"
            );
        }

        Ok(SyncOutcome::FullSync(report))
    }

    /// Head commit of the branch, for seeding the cursor. `None` when the
    /// history is empty or unreadable; seeding is best-effort.
    async fn head_commit_hint(&self, opts: &SyncOptions) -> Option<String> {
        match self
            .source
            .list_commits_since(&opts.repo, Some(&opts.owner), None, &opts.branch, 1)
            .await
        {
            Ok(commits) => commits.first().map(|c| c.sha.clone()),
            Err(err) => {
                warn!(%err, "could not read head commit for cursor seed");
                None
            }
        }
    }
}

/// Convert a normalized record into the upload shape: forwarded metadata
/// minus housekeeping keys, plus timestamp and commit provenance.
fn to_document(record: &FileRecord) -> IngestDocument {
    let mut metadata = record.metadata.clone();
    for key in HOUSEKEEPING_KEYS {
        metadata.remove(*key);
    }
    if let Some(last_updated) = &record.last_updated {
        metadata.insert(
            "last_modified_date".to_string(),
            Value::String(last_updated.clone()),
        );
    }
    if let Some(sha) = &record.last_commit_sha {
        metadata.insert("last_commit_sha".to_string(), Value::String(sha.clone()));
    }

    let mime_type = record
        .content_type
        .clone()
        .unwrap_or_else(|| DEFAULT_MIME.to_string());
    metadata.insert("content-type".to_string(), Value::String(mime_type.clone()));

    IngestDocument {
        uri: record.uri.clone(),
        content: record.content.clone(),
        mime_type,
        metadata,
    }
}

/// Render an issue (with comments) as a markdown document.
pub fn render_issue(issue: &Value, owner: &str, repo: &str) -> String {
    let number = issue.get("number").and_then(Value::as_i64).unwrap_or(0);
    let title = issue.get("title").and_then(Value::as_str).unwrap_or("");
    let state = issue.get("state").and_then(Value::as_str).unwrap_or("unknown");
    let created = issue.get("created_at").and_then(Value::as_str).unwrap_or("");
    let author = issue
        .get("user")
        .and_then(|u| u.get("login"))
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let body = issue.get("body").and_then(Value::as_str).unwrap_or("");

    let mut out = format!("# Issue #{number}: {title}\n\n");
    out.push_str(&format!("- Repository: {owner}/{repo}\n"));
    out.push_str(&format!("- State: {state}\n"));
    out.push_str(&format!("- Author: {author}\n"));
    if !created.is_empty() {
        out.push_str(&format!("- Created: {created}\n"));
    }
    if let Some(assignee) = issue
        .get("assignee")
        .and_then(|a| a.get("login"))
        .and_then(Value::as_str)
    {
        out.push_str(&format!("- Assignee: {assignee}\n"));
    }
    out.push('\n');
    out.push_str(body);
    out.push('\n');

    if let Some(comments) = issue.get("comments").and_then(Value::as_array) {
        if !comments.is_empty() {
            out.push_str(&format!("\n## Comments ({})\n", comments.len()));
            for comment in comments {
                let text = match comment {
                    Value::String(s) => s.as_str(),
                    other => other.get("body").and_then(Value::as_str).unwrap_or(""),
                };
                out.push_str(&format!("\n---\n\n{text}\n"));
            }
        }
    }

    out
}

/// Build the ingestable record for one issue.
fn issue_record(issue: &Value, owner: &str, repo: &str) -> FileRecord {
    let number = issue.get("number").and_then(Value::as_i64).unwrap_or(0);
    let rendered = render_issue(issue, owner, repo);
    let content = rendered.into_bytes();

    let mut metadata = serde_json::Map::new();
    if let Some(created) = issue.get("created_at").and_then(Value::as_str) {
        metadata.insert("date".to_string(), Value::String(created.to_string()));
    }
    if let Some(state) = issue.get("state").and_then(Value::as_str) {
        metadata.insert("state".to_string(), Value::String(state.to_string()));
    }
    if let Some(title) = issue.get("title").and_then(Value::as_str) {
        metadata.insert("title".to_string(), Value::String(title.to_string()));
    }
    if let Some(assignee) = issue
        .get("assignee")
        .and_then(|a| a.get("login"))
        .and_then(Value::as_str)
    {
        metadata.insert("assignee".to_string(), Value::String(assignee.to_string()));
    }
    if let Some(count) = issue.get("comment_count").and_then(Value::as_i64) {
        metadata.insert("comments".to_string(), Value::from(count));
    }

    FileRecord {
        uri: format!("/{owner}/{repo}/issues/{number}"),
        sha256: hash_bytes(&content),
        content,
        content_type: Some("text/markdown".to_string()),
        last_updated: issue
            .get("updated_at")
            .and_then(Value::as_str)
            .map(str::to_string),
        last_commit_sha: None,
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn source_id_includes_filter() {
        assert_eq!(
            source_id("gitea", "admin", "docs", ContentFilter::All),
            "gitea:admin:docs:all"
        );
        assert_eq!(
            source_id("github", "acme", "handbook", ContentFilter::Issues),
            "github:acme:handbook:issues"
        );
    }

    #[test]
    fn workflow_params_all_or_nothing() {
        assert!(validate_workflow_params(false, None, None).is_ok());
        assert!(validate_workflow_params(true, Some("wf"), Some("ps")).is_ok());
        assert!(validate_workflow_params(true, Some("wf"), None).is_err());
        assert!(validate_workflow_params(true, None, Some("ps")).is_err());
        assert!(validate_workflow_params(true, Some(""), Some("ps")).is_err());
    }

    #[test]
    fn housekeeping_metadata_is_stripped() {
        let mut record = FileRecord::new("docs/a.md", b"body".to_vec());
        record.content_type = Some("text/markdown".to_string());
        record.last_commit_sha = Some("abc".to_string());
        record
            .metadata
            .insert("sha256".to_string(), json!("deadbeef"));
        record.metadata.insert("batch_id".to_string(), json!(7));
        record.metadata.insert("name".to_string(), json!("a.md"));

        let doc = to_document(&record);
        assert!(doc.metadata.get("sha256").is_none());
        assert!(doc.metadata.get("batch_id").is_none());
        assert_eq!(doc.metadata.get("name"), Some(&json!("a.md")));
        assert_eq!(doc.metadata.get("last_commit_sha"), Some(&json!("abc")));
        assert_eq!(doc.mime_type, "text/markdown");
    }

    #[test]
    fn issue_renders_as_markdown_document() {
        let issue = json!({
            "number": 12,
            "title": "Broken link in handbook",
            "state": "open",
            "created_at": "2026-01-05T09:00:00Z",
            "user": {"login": "alice"},
            "assignee": {"login": "bob"},
            "body": "The onboarding page 404s.",
            "comment_count": 1,
            "comments": ["Fixed in the next release."],
        });

        let record = issue_record(&issue, "acme", "handbook");
        assert_eq!(record.uri, "/acme/handbook/issues/12");
        assert_eq!(record.content_type.as_deref(), Some("text/markdown"));
        assert_eq!(record.sha256, hash_bytes(&record.content));

        let text = String::from_utf8(record.content.clone()).unwrap();
        assert!(text.starts_with("# Issue #12: Broken link in handbook"));
        assert!(text.contains("- State: open"));
        assert!(text.contains("- Assignee: bob"));
        assert!(text.contains("The onboarding page 404s."));
        assert!(text.contains("Fixed in the next release."));
        assert_eq!(record.metadata.get("comments"), Some(&json!(1)));
    }

    #[test]
    fn unknown_mime_defaults_to_octet_stream() {
        let record = FileRecord::new("data/blob.bin", b"x".to_vec());
        let doc = to_document(&record);
        assert_eq!(doc.mime_type, "application/octet-stream");
    }
}

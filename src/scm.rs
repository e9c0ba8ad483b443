//! SCM provider capability set.
//!
//! One [`ScmProvider`] handles both supported backends; the differences
//! (base-URL resolution, last-modified extraction, response validation) live
//! behind the [`ScmFlavor`] trait with a GitHub-style and a Gitea-style
//! implementation selected by the [`Scm`] tag at construction time.
//!
//! Every request goes through the [`RetryClient`], which in turn is bounded
//! by a shared semaphore so one listing cannot flood the host API.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::config::ScmConfig;
use crate::error::ScmError;
use crate::models::{
    extension_of, guess_content_type, hash_bytes, ChangeStatus, CommitDetail, CommitFileChange,
    CommitRecord, FileRecord,
};
use crate::retry::RetryClient;
use crate::transport::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};

/// Hard ceiling on commit pages fetched when no cursor marker exists.
/// Bounds an unbounded-history first sync; reaching it truncates, not errors.
const MAX_COMMIT_PAGES: u32 = 10;

/// Supported SCM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scm {
    Github,
    Gitea,
}

impl Scm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scm::Github => "github",
            Scm::Gitea => "gitea",
        }
    }
}

impl std::fmt::Display for Scm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend-specific behavior. One level of trait + implementations; no
/// deeper hierarchy is needed.
pub trait ScmFlavor: Send + Sync {
    /// Resolve the API base URL from configuration.
    fn base_url(&self, config: &ScmConfig) -> Result<String, ScmError>;

    /// Extract a last-modified timestamp from a contents-API file record.
    fn last_updated(&self, rec: &Value) -> Option<String>;

    /// Validate a read-path response, mapping error bodies to [`ScmError`].
    fn validate(&self, status: u16, body: &Value) -> Result<(), ScmError>;
}

/// GitHub-style backend.
pub struct GithubFlavor;

impl ScmFlavor for GithubFlavor {
    fn base_url(&self, config: &ScmConfig) -> Result<String, ScmError> {
        Ok(config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.github.com".to_string()))
    }

    /// GitHub's contents API does not expose a timestamp.
    fn last_updated(&self, _rec: &Value) -> Option<String> {
        None
    }

    fn validate(&self, status: u16, body: &Value) -> Result<(), ScmError> {
        if status == 404 {
            let msg = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("not found");
            return Err(ScmError::NotFound(msg.to_string()));
        }
        if status != 200 {
            if let Some(msg) = body.get("message").and_then(Value::as_str) {
                return Err(ScmError::Api(msg.to_string()));
            }
            return Err(ScmError::Fetch { status });
        }
        if body.get("errors").is_some() {
            return Err(ScmError::Api(body.to_string()));
        }
        Ok(())
    }
}

/// Gitea-style backend.
pub struct GiteaFlavor;

impl ScmFlavor for GiteaFlavor {
    fn base_url(&self, config: &ScmConfig) -> Result<String, ScmError> {
        config
            .base_url
            .clone()
            .ok_or_else(|| ScmError::Config("scm.base_url is not configured".to_string()))
    }

    fn last_updated(&self, rec: &Value) -> Option<String> {
        rec.get("last_committer_date")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    fn validate(&self, status: u16, body: &Value) -> Result<(), ScmError> {
        if body.get("errors").is_some() {
            return Err(ScmError::Api(body.to_string()));
        }
        if status == 404 {
            let msg = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("not found");
            return Err(ScmError::NotFound(msg.to_string()));
        }
        if status != 200 {
            return Err(ScmError::Fetch { status });
        }
        Ok(())
    }
}

/// The read operations the sync engine depends on. Split out as a trait so
/// the engine can be exercised against scripted fakes.
#[async_trait]
pub trait SourceApi: Send + Sync {
    async fn list_repo_files(
        &self,
        repo: &str,
        owner: Option<&str>,
        allowed_extensions: Option<&[String]>,
        branch: &str,
    ) -> Result<Vec<FileRecord>, ScmError>;

    async fn list_issues(
        &self,
        repo: &str,
        owner: Option<&str>,
        add_comments: bool,
        since: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Vec<Value>, ScmError>;

    async fn list_commits_since(
        &self,
        repo: &str,
        owner: Option<&str>,
        since_commit_sha: Option<&str>,
        branch: &str,
        limit: usize,
    ) -> Result<Vec<CommitRecord>, ScmError>;

    async fn get_commit_details(
        &self,
        repo: &str,
        owner: Option<&str>,
        commit_sha: &str,
    ) -> Result<CommitDetail, ScmError>;

    async fn get_single_file(
        &self,
        repo: &str,
        owner: Option<&str>,
        file_path: &str,
        branch: &str,
    ) -> Result<FileRecord, ScmError>;
}

/// Provider over one SCM backend.
#[derive(Clone)]
pub struct ScmProvider {
    kind: Scm,
    flavor: Arc<dyn ScmFlavor>,
    retry: RetryClient,
    config: Arc<ScmConfig>,
    auth_headers: Vec<(String, String)>,
}

impl std::fmt::Debug for ScmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScmProvider")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl ScmProvider {
    /// Build a provider over an explicit transport. Fails fast when no
    /// usable credentials are configured.
    pub fn new(
        kind: Scm,
        config: &ScmConfig,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self, ScmError> {
        let auth_headers = auth_headers(config)?;
        let limiter = Arc::new(Semaphore::new(config.max_concurrent_requests));
        let retry = RetryClient::new(transport, config).with_limiter(limiter);
        let flavor: Arc<dyn ScmFlavor> = match kind {
            Scm::Github => Arc::new(GithubFlavor),
            Scm::Gitea => Arc::new(GiteaFlavor),
        };
        Ok(Self {
            kind,
            flavor,
            retry,
            config: Arc::new(config.clone()),
            auth_headers,
        })
    }

    /// Build a provider with the real reqwest transport.
    pub fn from_config(kind: Scm, config: &ScmConfig) -> Result<Self, ScmError> {
        let transport = ReqwestTransport::new(Duration::from_secs(config.timeout_secs))?;
        Self::new(kind, config, Arc::new(transport))
    }

    pub fn kind(&self) -> Scm {
        self.kind
    }

    fn owner_or<'a>(&'a self, owner: Option<&'a str>) -> Result<&'a str, ScmError> {
        owner
            .or(self.config.owner.as_deref())
            .ok_or_else(|| ScmError::Config("repository owner is not configured".to_string()))
    }

    fn build_url(&self, path: &str) -> Result<String, ScmError> {
        let base = self.flavor.base_url(&self.config)?;
        Ok(format!(
            "{}/{}",
            base.trim_end_matches('/'),
            path.trim_start_matches('/')
        ))
    }

    async fn get(&self, url: &str) -> Result<HttpResponse, ScmError> {
        let mut req = HttpRequest::get(url);
        req.headers.extend(self.auth_headers.clone());
        self.retry.request(req).await
    }

    async fn send_json(
        &self,
        method: HttpMethod,
        url: &str,
        body: &Value,
    ) -> Result<HttpResponse, ScmError> {
        let mut req = HttpRequest::with_json(method, url, body);
        req.headers.extend(self.auth_headers.clone());
        self.retry.request(req).await
    }

    /// Walk a paginated list endpoint to completion.
    ///
    /// `url_template` carries a literal `{page}` placeholder. The first page
    /// is always fetched; the walk stops on the first page that yields zero
    /// items after the optional `process` extraction. A 404 is a hard
    /// not-found failure; an `errors` body is a hard API failure.
    pub async fn paginate(
        &self,
        url_template: &str,
        owner: &str,
        repo: &str,
        process: Option<fn(Value) -> Value>,
    ) -> Result<Vec<Value>, ScmError> {
        let mut out = Vec::new();
        let mut page: u32 = 1;

        loop {
            let url = url_template.replace("{page}", &page.to_string());
            info!(owner, repo, page, "fetching page");

            let resp = self.get(&url).await?;
            let body = resp.json();

            if resp.status == 404 {
                return Err(ScmError::NotFound(format!("repo {owner}/{repo} not found")));
            }
            if let Some(errors) = body.get("errors") {
                return Err(ScmError::Api(errors.to_string()));
            }
            if resp.status != 200 {
                return Err(ScmError::Fetch {
                    status: resp.status,
                });
            }

            let extracted = match process {
                Some(f) => f(body),
                None => body,
            };
            let items = extracted.as_array().cloned().unwrap_or_default();
            info!(page, count = items.len(), "page fetched");

            if items.is_empty() {
                break;
            }
            out.extend(items);
            page += 1;
        }

        Ok(out)
    }

    /// Normalize a contents-API record into a [`FileRecord`].
    fn parse_file_rec(&self, rec: &Value) -> Result<FileRecord, ScmError> {
        let path = rec
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| ScmError::Api(format!("file record without path: {rec}")))?;
        let name = rec.get("name").and_then(Value::as_str).unwrap_or(path);

        let content = decode_inline_content(rec.get("content"));
        let sha256 = hash_bytes(&content);

        let mut metadata = serde_json::Map::new();
        metadata.insert("name".to_string(), Value::String(name.to_string()));
        if let Some(url) = rec.get("url").and_then(Value::as_str) {
            metadata.insert("url".to_string(), Value::String(url.to_string()));
        }

        Ok(FileRecord {
            uri: path.to_string(),
            sha256,
            content,
            content_type: guess_content_type(name),
            last_updated: self.flavor.last_updated(rec),
            last_commit_sha: rec
                .get("last_commit_sha")
                .and_then(Value::as_str)
                .map(str::to_string),
            metadata,
        })
    }

    /// GitHub omits inline content for large files; fall back to the blob
    /// endpoint keyed by the record's git sha.
    async fn fill_content(
        &self,
        mut rec: Value,
        owner: &str,
        repo: &str,
    ) -> Result<Value, ScmError> {
        let empty = rec
            .get("content")
            .and_then(Value::as_str)
            .map(str::is_empty)
            .unwrap_or(true);
        if !empty || self.kind != Scm::Github {
            return Ok(rec);
        }

        let Some(sha) = rec.get("sha").and_then(Value::as_str).map(str::to_string) else {
            return Ok(rec);
        };

        let url = self.build_url(&format!("/repos/{owner}/{repo}/git/blobs/{sha}"))?;
        debug!(%url, "fetching blob");
        let resp = self.get(&url).await?;
        let body = resp.json();
        self.flavor.validate(resp.status, &body)?;

        if let Some(content) = body.get("content").cloned() {
            rec["content"] = content;
        }
        Ok(rec)
    }

    /// Recursively fetch a contents URL: an object is a file, an array is a
    /// directory whose children are fetched concurrently (bounded by the
    /// shared request limiter).
    fn fetch_tree(
        &self,
        url: String,
        owner: String,
        repo: String,
        allowed: Option<Arc<Vec<String>>>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<FileRecord>, ScmError>> + Send + 'static>> {
        let this = self.clone();
        Box::pin(async move {
            debug!(%url, "fetch_tree");
            let resp = this.get(&url).await?;
            let body = resp.json();
            this.flavor.validate(resp.status, &body)?;

            if body.is_object() {
                let filled = this.fill_content(body, &owner, &repo).await?;
                return Ok(vec![this.parse_file_rec(&filled)?]);
            }

            let entries = body.as_array().cloned().unwrap_or_default();
            let mut tasks: JoinSet<Result<Vec<FileRecord>, ScmError>> = JoinSet::new();

            for entry in entries {
                let name = entry.get("name").and_then(Value::as_str).unwrap_or("");
                let entry_type = entry.get("type").and_then(Value::as_str).unwrap_or("");
                let Some(child_url) = entry.get("url").and_then(Value::as_str) else {
                    continue;
                };

                if entry_type == "file" {
                    if let Some(allowed) = &allowed {
                        if !allowed.contains(&extension_of(name)) {
                            debug!(name, "skipping file, extension not allowed");
                            continue;
                        }
                    }
                    tasks.spawn(this.fetch_tree(
                        child_url.to_string(),
                        owner.clone(),
                        repo.clone(),
                        None,
                    ));
                } else {
                    tasks.spawn(this.fetch_tree(
                        child_url.to_string(),
                        owner.clone(),
                        repo.clone(),
                        allowed.clone(),
                    ));
                }
            }

            let mut files = Vec::new();
            while let Some(joined) = tasks.join_next().await {
                let batch =
                    joined.map_err(|e| ScmError::Transport(format!("task join error: {e}")))?;
                files.extend(batch?);
            }
            Ok(files)
        })
    }

    async fn fetch_commit_page(
        &self,
        url: &str,
    ) -> Result<Vec<Value>, ScmError> {
        let resp = self.get(url).await?;
        let body = resp.json();
        self.flavor.validate(resp.status, &body)?;
        Ok(body.as_array().cloned().unwrap_or_default())
    }

    /// Bulk issue comments for a repository.
    pub async fn list_repo_comments(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<Vec<Value>, ScmError> {
        let template =
            self.build_url(&format!("/repos/{owner}/{repo}/issues/comments?page={{page}}"))?;
        self.paginate(&template, owner, repo, None).await
    }

    /// Comments for one issue.
    pub async fn list_issue_comments(
        &self,
        owner: &str,
        repo: &str,
        issue_number: i64,
    ) -> Result<Vec<Value>, ScmError> {
        let url =
            self.build_url(&format!("/repos/{owner}/{repo}/issues/{issue_number}/comments"))?;
        let resp = self.get(&url).await?;
        let body = resp.json();
        self.flavor.validate(resp.status, &body)?;
        Ok(body.as_array().cloned().unwrap_or_default())
    }

    // ----- administrative operations -----

    /// Create a repository under the authenticated user or an organization.
    pub async fn create_repository(
        &self,
        name: &str,
        description: &str,
        private: bool,
        organization: Option<&str>,
    ) -> Result<Value, ScmError> {
        let url = match organization {
            Some(org) => self.build_url(&format!("/orgs/{org}/repos"))?,
            None => self.build_url("/user/repos")?,
        };
        let payload = serde_json::json!({
            "name": name,
            "description": description,
            "private": private,
        });

        let resp = self.send_json(HttpMethod::Post, &url, &payload).await?;
        let body = resp.json();
        match resp.status {
            201 => {
                info!(name, "created repository");
                Ok(body)
            }
            409 | 422 => Err(ScmError::Api(format!("repository '{name}' already exists"))),
            404 => Err(ScmError::NotFound(format!(
                "organization or user for '{name}' not found"
            ))),
            403 => Err(ScmError::Api(format!(
                "permission denied to create repository '{name}'"
            ))),
            status => Err(body_message_error(&body, status, "create repository")),
        }
    }

    pub async fn delete_repository(&self, repo: &str, owner: Option<&str>) -> Result<(), ScmError> {
        let owner = self.owner_or(owner)?;
        let url = self.build_url(&format!("/repos/{owner}/{repo}"))?;

        let mut req = HttpRequest {
            method: HttpMethod::Delete,
            url,
            headers: self.auth_headers.clone(),
            body: Vec::new(),
        };
        req.headers
            .push(("Accept".to_string(), "application/json".to_string()));
        let resp = self.retry.request(req).await?;

        match resp.status {
            204 | 200 => {
                info!(owner, repo, "deleted repository");
                Ok(())
            }
            404 => Err(ScmError::NotFound(format!(
                "repository '{owner}/{repo}' not found"
            ))),
            403 => Err(ScmError::Api(format!(
                "permission denied to delete repository '{owner}/{repo}'"
            ))),
            status => Err(body_message_error(&resp.json(), status, "delete repository")),
        }
    }

    pub async fn create_issue(
        &self,
        repo: &str,
        title: &str,
        body_text: &str,
        owner: Option<&str>,
    ) -> Result<Value, ScmError> {
        let owner = self.owner_or(owner)?;
        let url = self.build_url(&format!("/repos/{owner}/{repo}/issues"))?;
        let payload = serde_json::json!({"title": title, "body": body_text});

        let resp = self.send_json(HttpMethod::Post, &url, &payload).await?;
        let body = resp.json();
        match resp.status {
            201 => {
                info!(owner, repo, title, "created issue");
                Ok(body)
            }
            404 => Err(ScmError::NotFound(format!(
                "repository '{owner}/{repo}' not found"
            ))),
            403 => Err(ScmError::Api(format!(
                "permission denied to create issue in '{owner}/{repo}'"
            ))),
            status => Err(body_message_error(&body, status, "create issue")),
        }
    }

    /// Create or update a file through the contents API.
    pub async fn create_file(
        &self,
        repo: &str,
        file_path: &str,
        content: &[u8],
        message: &str,
        branch: &str,
        owner: Option<&str>,
    ) -> Result<Value, ScmError> {
        let owner = self.owner_or(owner)?;
        let url = self.build_url(&format!("/repos/{owner}/{repo}/contents/{file_path}"))?;
        let payload = serde_json::json!({
            "content": BASE64.encode(content),
            "message": message,
            "branch": branch,
        });

        let resp = self.send_json(HttpMethod::Post, &url, &payload).await?;
        let body = resp.json();
        match resp.status {
            200 | 201 => {
                info!(owner, repo, file_path, "created file");
                Ok(body)
            }
            404 => Err(ScmError::NotFound(format!(
                "repository '{owner}/{repo}' not found"
            ))),
            403 => Err(ScmError::Api(format!(
                "permission denied to create file in '{owner}/{repo}'"
            ))),
            409 | 422 => Err(ScmError::Api(format!(
                "file '{file_path}' already exists or request invalid"
            ))),
            status => Err(body_message_error(&body, status, "create file")),
        }
    }
}

#[async_trait]
impl SourceApi for ScmProvider {
    async fn list_repo_files(
        &self,
        repo: &str,
        owner: Option<&str>,
        allowed_extensions: Option<&[String]>,
        branch: &str,
    ) -> Result<Vec<FileRecord>, ScmError> {
        let owner = self.owner_or(owner)?;
        let allowed: Arc<Vec<String>> = Arc::new(
            allowed_extensions
                .map(|e| e.to_vec())
                .unwrap_or_else(|| self.config.extensions.clone()),
        );
        let url = self.build_url(&format!("/repos/{owner}/{repo}/contents?ref={branch}"))?;
        debug!(%url, "listing repository files");

        let resp = self.get(&url).await?;
        let body = resp.json();

        // Gitea answers 404 with "object does not exist" for a branch with
        // no commits yet; that is an empty repository, not a missing one.
        if resp.status == 404 && is_empty_repo_body(&body) {
            info!(owner, repo, branch, "repository has no commits, empty file list");
            return Ok(Vec::new());
        }
        self.flavor.validate(resp.status, &body)?;

        let entries = body.as_array().cloned().unwrap_or_default();
        let mut tasks: JoinSet<Result<Vec<FileRecord>, ScmError>> = JoinSet::new();

        for entry in &entries {
            let name = entry.get("name").and_then(Value::as_str).unwrap_or("");
            let entry_type = entry.get("type").and_then(Value::as_str).unwrap_or("");
            let Some(child_url) = entry.get("url").and_then(Value::as_str) else {
                continue;
            };

            if entry_type == "file" {
                if !allowed.contains(&extension_of(name)) {
                    continue;
                }
                tasks.spawn(self.fetch_tree(
                    child_url.to_string(),
                    owner.to_string(),
                    repo.to_string(),
                    None,
                ));
            } else if entry_type == "dir" {
                tasks.spawn(self.fetch_tree(
                    child_url.to_string(),
                    owner.to_string(),
                    repo.to_string(),
                    Some(allowed.clone()),
                ));
            }
        }

        // Deterministic union regardless of fetch completion order.
        let mut by_uri: BTreeMap<String, FileRecord> = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            let batch = joined.map_err(|e| ScmError::Transport(format!("task join error: {e}")))?;
            for rec in batch? {
                by_uri.insert(rec.uri.clone(), rec);
            }
        }

        let files: Vec<FileRecord> = by_uri.into_values().collect();
        info!(owner, repo, count = files.len(), "listed repository files");
        Ok(files)
    }

    async fn list_issues(
        &self,
        repo: &str,
        owner: Option<&str>,
        add_comments: bool,
        since: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Vec<Value>, ScmError> {
        let owner = self.owner_or(owner)?;
        let mut template =
            self.build_url(&format!("/repos/{owner}/{repo}/issues?page={{page}}&status=all"))?;
        if let Some(since) = since {
            template.push_str(&format!("&since={}Z", since.format("%Y-%m-%dT%H:%M:%S")));
        }

        let mut issues = self.paginate(&template, owner, repo, None).await?;

        if add_comments {
            if since.is_none() {
                let comments = self.list_repo_comments(owner, repo).await?;
                for issue in issues.iter_mut() {
                    let issue_url = issue.get("url").and_then(Value::as_str).unwrap_or("");
                    let bodies: Vec<Value> = comments
                        .iter()
                        .filter(|c| {
                            c.get("issue_url").and_then(Value::as_str) == Some(issue_url)
                        })
                        .filter_map(|c| c.get("body").cloned())
                        .collect();
                    issue["comment_count"] = Value::from(bodies.len());
                    issue["comments"] = Value::Array(bodies);
                }
            } else {
                for issue in issues.iter_mut() {
                    let number = issue.get("number").and_then(Value::as_i64).unwrap_or(0);
                    let comments = self.list_issue_comments(owner, repo, number).await?;
                    issue["comment_count"] = Value::from(comments.len());
                    issue["comments"] = Value::Array(comments);
                }
            }
        }

        Ok(issues)
    }

    /// Commits strictly newer than `since_commit_sha`, newest-first.
    ///
    /// Pages are scanned in API order; the marker commit itself stops the
    /// scan and is excluded. Without a marker, collection stops at the last
    /// page or the [`MAX_COMMIT_PAGES`] ceiling.
    async fn list_commits_since(
        &self,
        repo: &str,
        owner: Option<&str>,
        since_commit_sha: Option<&str>,
        branch: &str,
        limit: usize,
    ) -> Result<Vec<CommitRecord>, ScmError> {
        let owner = self.owner_or(owner)?;
        let base =
            self.build_url(&format!("/repos/{owner}/{repo}/commits?sha={branch}&limit={limit}"))?;

        let mut commits = Vec::new();
        let mut found_marker = false;
        let mut page: u32 = 1;

        while page <= MAX_COMMIT_PAGES && !found_marker {
            let url = format!("{base}&page={page}");
            let page_commits = self.fetch_commit_page(&url).await?;

            if page_commits.is_empty() {
                break;
            }

            for commit in &page_commits {
                let sha = commit.get("sha").and_then(Value::as_str).unwrap_or("");
                if since_commit_sha == Some(sha) {
                    found_marker = true;
                    break;
                }
                commits.push(CommitRecord {
                    sha: sha.to_string(),
                    message: commit
                        .get("commit")
                        .and_then(|c| c.get("message"))
                        .or_else(|| commit.get("message"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                });
            }

            if page_commits.len() < limit {
                break;
            }
            page += 1;
        }

        info!(
            owner,
            repo,
            count = commits.len(),
            since = since_commit_sha.unwrap_or("beginning"),
            "found new commits"
        );
        Ok(commits)
    }

    async fn get_commit_details(
        &self,
        repo: &str,
        owner: Option<&str>,
        commit_sha: &str,
    ) -> Result<CommitDetail, ScmError> {
        let owner = self.owner_or(owner)?;
        let url = self.build_url(&format!("/repos/{owner}/{repo}/git/commits/{commit_sha}"))?;

        let resp = self.get(&url).await?;
        let body = resp.json();
        self.flavor.validate(resp.status, &body)?;

        let files = body
            .get("files")
            .and_then(Value::as_array)
            .map(|files| {
                files
                    .iter()
                    .filter_map(|f| {
                        let filename = f
                            .get("filename")
                            .or_else(|| f.get("path"))
                            .or_else(|| f.get("name"))
                            .and_then(Value::as_str)?;
                        let status = f.get("status").and_then(Value::as_str).unwrap_or("");
                        Some(CommitFileChange {
                            filename: filename.to_string(),
                            status: ChangeStatus::parse(status),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(CommitDetail {
            sha: commit_sha.to_string(),
            files,
        })
    }

    async fn get_single_file(
        &self,
        repo: &str,
        owner: Option<&str>,
        file_path: &str,
        branch: &str,
    ) -> Result<FileRecord, ScmError> {
        let owner = self.owner_or(owner)?;
        let encoded = urlencoding::encode(file_path);
        let url = self.build_url(&format!("/repos/{owner}/{repo}/contents/{encoded}?ref={branch}"))?;

        let resp = self.get(&url).await?;
        let body = resp.json();
        self.flavor.validate(resp.status, &body)?;

        let filled = self.fill_content(body, owner, repo).await?;
        self.parse_file_rec(&filled)
    }
}

/// Token auth wins over basic auth; neither configured is a fail-fast error.
fn auth_headers(config: &ScmConfig) -> Result<Vec<(String, String)>, ScmError> {
    if let Some(token) = &config.auth_token {
        return Ok(vec![(
            "Authorization".to_string(),
            format!("token {token}"),
        )]);
    }
    if let (Some(user), Some(pass)) = (&config.auth_username, &config.auth_password) {
        let encoded = BASE64.encode(format!("{user}:{pass}"));
        return Ok(vec![(
            "Authorization".to_string(),
            format!("Basic {encoded}"),
        )]);
    }
    Err(ScmError::Auth)
}

/// Base64-decode inline content, tolerating the line breaks git APIs insert.
fn decode_inline_content(content: Option<&Value>) -> Vec<u8> {
    match content {
        Some(Value::String(s)) => {
            let cleaned: String = s.chars().filter(|c| !c.is_whitespace()).collect();
            BASE64
                .decode(cleaned.as_bytes())
                .unwrap_or_else(|_| s.as_bytes().to_vec())
        }
        _ => Vec::new(),
    }
}

fn is_empty_repo_body(body: &Value) -> bool {
    body.get("errors")
        .and_then(Value::as_array)
        .map(|errors| {
            errors
                .iter()
                .any(|e| e.to_string().contains("object does not exist"))
        })
        .unwrap_or(false)
}

fn body_message_error(body: &Value, status: u16, action: &str) -> ScmError {
    match body.get("message").and_then(Value::as_str) {
        Some(msg) => ScmError::Api(msg.to_string()),
        None => ScmError::Api(format!("failed to {action}: status {status}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use serde_json::json;

    const BASE: &str = "http://scm/api/v1";

    fn config() -> ScmConfig {
        ScmConfig {
            base_url: Some(BASE.to_string()),
            auth_token: Some("t0ken".to_string()),
            owner: Some("admin".to_string()),
            retry_attempts: 1,
            retry_backoff_base: 0.001,
            retry_backoff_max: 0.005,
            ..ScmConfig::default()
        }
    }

    fn provider(kind: Scm, transport: &MockTransport) -> ScmProvider {
        ScmProvider::new(kind, &config(), Arc::new(transport.clone())).unwrap()
    }

    fn b64(content: &str) -> String {
        BASE64.encode(content.as_bytes())
    }

    #[test]
    fn auth_requires_credentials() {
        let cfg = ScmConfig {
            base_url: Some(BASE.to_string()),
            ..ScmConfig::default()
        };
        let err = ScmProvider::new(Scm::Gitea, &cfg, Arc::new(MockTransport::new())).unwrap_err();
        assert!(matches!(err, ScmError::Auth));
    }

    #[test]
    fn basic_auth_fallback() {
        let cfg = ScmConfig {
            base_url: Some(BASE.to_string()),
            auth_username: Some("u".to_string()),
            auth_password: Some("p".to_string()),
            ..ScmConfig::default()
        };
        let headers = auth_headers(&cfg).unwrap();
        assert_eq!(headers[0].1, format!("Basic {}", BASE64.encode("u:p")));
    }

    #[test]
    fn gitea_requires_base_url() {
        let cfg = ScmConfig {
            auth_token: Some("t".to_string()),
            ..ScmConfig::default()
        };
        let provider =
            ScmProvider::new(Scm::Gitea, &cfg, Arc::new(MockTransport::new())).unwrap();
        assert!(matches!(
            provider.build_url("/x").unwrap_err(),
            ScmError::Config(_)
        ));
    }

    #[test]
    fn github_defaults_to_public_api() {
        let cfg = ScmConfig {
            auth_token: Some("t".to_string()),
            ..ScmConfig::default()
        };
        let provider =
            ScmProvider::new(Scm::Github, &cfg, Arc::new(MockTransport::new())).unwrap();
        assert_eq!(
            provider.build_url("/repos/a/b").unwrap(),
            "https://api.github.com/repos/a/b"
        );
    }

    #[tokio::test]
    async fn pagination_terminates_on_empty_page() {
        let transport = MockTransport::new();
        let template = format!("{BASE}/repos/admin/docs/issues?page={{page}}&status=all");
        transport.push_json(
            HttpMethod::Get,
            template.replace("{page}", "1"),
            200,
            json!([{"number": 1, "title": "only"}]),
        );
        transport.push_json(HttpMethod::Get, template.replace("{page}", "2"), 200, json!([]));

        let items = provider(Scm::Gitea, &transport)
            .paginate(&template, "admin", "docs", None)
            .await
            .unwrap();

        assert_eq!(items.len(), 1);
        assert_eq!(transport.total_requests(), 2);
    }

    #[tokio::test]
    async fn pagination_404_is_not_found() {
        let transport = MockTransport::new();
        let template = format!("{BASE}/repos/admin/gone/issues?page={{page}}&status=all");
        transport.push_json(HttpMethod::Get, template.replace("{page}", "1"), 404, json!({}));

        let err = provider(Scm::Gitea, &transport)
            .paginate(&template, "admin", "gone", None)
            .await
            .unwrap_err();

        assert!(matches!(err, ScmError::NotFound(_)));
        assert_eq!(transport.total_requests(), 1);
    }

    #[tokio::test]
    async fn pagination_errors_body_is_hard_failure() {
        let transport = MockTransport::new();
        let template = format!("{BASE}/repos/admin/bad/issues?page={{page}}&status=all");
        transport.push_json(
            HttpMethod::Get,
            template.replace("{page}", "1"),
            200,
            json!({"errors": ["boom"]}),
        );

        let err = provider(Scm::Gitea, &transport)
            .paginate(&template, "admin", "bad", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ScmError::Api(_)));
    }

    #[tokio::test]
    async fn commits_since_excludes_marker() {
        let transport = MockTransport::new();
        let url = format!("{BASE}/repos/admin/docs/commits?sha=main&limit=100&page=1");
        transport.push_json(
            HttpMethod::Get,
            url,
            200,
            json!([
                {"sha": "commit3", "commit": {"message": "three"}},
                {"sha": "commit2", "commit": {"message": "two"}},
                {"sha": "commit1", "commit": {"message": "one"}},
            ]),
        );

        let commits = provider(Scm::Gitea, &transport)
            .list_commits_since("docs", Some("admin"), Some("commit1"), "main", 100)
            .await
            .unwrap();

        let shas: Vec<&str> = commits.iter().map(|c| c.sha.as_str()).collect();
        assert_eq!(shas, vec!["commit3", "commit2"]);
    }

    #[tokio::test]
    async fn commits_since_without_marker_stops_on_short_page() {
        let transport = MockTransport::new();
        let url = format!("{BASE}/repos/admin/docs/commits?sha=main&limit=100&page=1");
        transport.push_json(
            HttpMethod::Get,
            url,
            200,
            json!([{"sha": "a"}, {"sha": "b"}]),
        );

        let commits = provider(Scm::Gitea, &transport)
            .list_commits_since("docs", Some("admin"), None, "main", 100)
            .await
            .unwrap();

        assert_eq!(commits.len(), 2);
        assert_eq!(transport.total_requests(), 1);
    }

    #[tokio::test]
    async fn commits_since_spanning_pages() {
        let transport = MockTransport::new();
        let page1 = format!("{BASE}/repos/admin/docs/commits?sha=main&limit=2&page=1");
        let page2 = format!("{BASE}/repos/admin/docs/commits?sha=main&limit=2&page=2");
        transport.push_json(HttpMethod::Get, page1, 200, json!([{"sha": "e"}, {"sha": "d"}]));
        transport.push_json(HttpMethod::Get, page2, 200, json!([{"sha": "c"}, {"sha": "b"}]));

        let commits = provider(Scm::Gitea, &transport)
            .list_commits_since("docs", Some("admin"), Some("c"), "main", 2)
            .await
            .unwrap();

        let shas: Vec<&str> = commits.iter().map(|c| c.sha.as_str()).collect();
        assert_eq!(shas, vec!["e", "d"]);
    }

    #[tokio::test]
    async fn get_single_file_decodes_base64_with_newlines() {
        let transport = MockTransport::new();
        let url = format!("{BASE}/repos/admin/docs/contents/docs%2Fguide.md?ref=main");
        let mut content = b64("# Guide\n");
        content.insert(4, '\n'); // git APIs wrap base64 lines
        transport.push_json(
            HttpMethod::Get,
            url,
            200,
            json!({
                "name": "guide.md",
                "path": "docs/guide.md",
                "content": content,
                "url": format!("{BASE}/repos/admin/docs/contents/docs/guide.md"),
                "last_committer_date": "2026-02-01T10:00:00Z",
                "last_commit_sha": "abc123",
            }),
        );

        let rec = provider(Scm::Gitea, &transport)
            .get_single_file("docs", Some("admin"), "docs/guide.md", "main")
            .await
            .unwrap();

        assert_eq!(rec.uri, "docs/guide.md");
        assert_eq!(rec.content, b"# Guide\n");
        assert_eq!(rec.sha256, hash_bytes(b"# Guide\n"));
        assert_eq!(rec.content_type.as_deref(), Some("text/markdown"));
        assert_eq!(rec.last_updated.as_deref(), Some("2026-02-01T10:00:00Z"));
        assert_eq!(rec.last_commit_sha.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn github_file_record_has_no_timestamp_and_uses_blob_fallback() {
        let transport = MockTransport::new();
        let file_url = format!("{BASE}/repos/admin/docs/contents/big.md?ref=main");
        transport.push_json(
            HttpMethod::Get,
            file_url,
            200,
            json!({
                "name": "big.md",
                "path": "big.md",
                "content": "",
                "sha": "blobsha",
            }),
        );
        transport.push_json(
            HttpMethod::Get,
            format!("{BASE}/repos/admin/docs/git/blobs/blobsha"),
            200,
            json!({"content": b64("big body"), "encoding": "base64"}),
        );

        let rec = provider(Scm::Github, &transport)
            .get_single_file("docs", Some("admin"), "big.md", "main")
            .await
            .unwrap();

        assert_eq!(rec.content, b"big body");
        assert!(rec.last_updated.is_none());
    }

    #[tokio::test]
    async fn list_repo_files_recurses_filters_and_orders() {
        let transport = MockTransport::new();
        let root = format!("{BASE}/repos/admin/docs/contents?ref=main");
        transport.push_json(
            HttpMethod::Get,
            root,
            200,
            json!([
                {"name": "readme.md", "type": "file", "url": format!("{BASE}/c/readme")},
                {"name": "logo.png", "type": "file", "url": format!("{BASE}/c/logo")},
                {"name": "guides", "type": "dir", "url": format!("{BASE}/c/guides")},
            ]),
        );
        transport.push_json(
            HttpMethod::Get,
            format!("{BASE}/c/readme"),
            200,
            json!({"name": "readme.md", "path": "readme.md", "content": b64("root")}),
        );
        transport.push_json(
            HttpMethod::Get,
            format!("{BASE}/c/guides"),
            200,
            json!([
                {"name": "intro.md", "type": "file", "url": format!("{BASE}/c/guides/intro")},
                {"name": "notes.txt", "type": "file", "url": format!("{BASE}/c/guides/notes")},
            ]),
        );
        transport.push_json(
            HttpMethod::Get,
            format!("{BASE}/c/guides/intro"),
            200,
            json!({"name": "intro.md", "path": "guides/intro.md", "content": b64("intro")}),
        );

        let allowed = vec!["md".to_string()];
        let files = provider(Scm::Gitea, &transport)
            .list_repo_files("docs", Some("admin"), Some(&allowed), "main")
            .await
            .unwrap();

        let uris: Vec<&str> = files.iter().map(|f| f.uri.as_str()).collect();
        assert_eq!(uris, vec!["guides/intro.md", "readme.md"]);
    }

    #[tokio::test]
    async fn empty_repository_yields_empty_listing() {
        let transport = MockTransport::new();
        let root = format!("{BASE}/repos/admin/fresh/contents?ref=main");
        transport.push_json(
            HttpMethod::Get,
            root,
            404,
            json!({"errors": ["object does not exist [id: refs/heads/main]"]}),
        );

        let files = provider(Scm::Gitea, &transport)
            .list_repo_files("fresh", Some("admin"), None, "main")
            .await
            .unwrap();
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn commit_details_parses_change_statuses() {
        let transport = MockTransport::new();
        transport.push_json(
            HttpMethod::Get,
            format!("{BASE}/repos/admin/docs/git/commits/abc"),
            200,
            json!({
                "sha": "abc",
                "files": [
                    {"filename": "a.md", "status": "modified"},
                    {"filename": "b.md", "status": "removed"},
                    {"path": "c.md", "status": "added"},
                ],
            }),
        );

        let detail = provider(Scm::Gitea, &transport)
            .get_commit_details("docs", Some("admin"), "abc")
            .await
            .unwrap();

        assert_eq!(detail.files.len(), 3);
        assert_eq!(detail.files[1].status, ChangeStatus::Removed);
        assert_eq!(detail.files[2].filename, "c.md");
    }

    #[tokio::test]
    async fn create_repository_conflict_maps_to_already_exists() {
        let transport = MockTransport::new();
        transport.push_json(
            HttpMethod::Post,
            format!("{BASE}/user/repos"),
            409,
            json!({}),
        );

        let err = provider(Scm::Gitea, &transport)
            .create_repository("docs", "", false, None)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn create_file_permission_denied() {
        let transport = MockTransport::new();
        transport.push_json(
            HttpMethod::Post,
            format!("{BASE}/repos/admin/docs/contents/x.md"),
            403,
            json!({}),
        );

        let err = provider(Scm::Gitea, &transport)
            .create_file("docs", "x.md", b"hi", "Add file", "main", Some("admin"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("permission denied"));
    }
}

//! Client for the remote Ingester API.
//!
//! The Ingester owns batches, per-document hash status, and the per-source
//! sync cursor. The engine talks to it through the [`IngestApi`] trait so
//! sync logic can be tested against an in-memory fake.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::IngesterConfig;
use crate::models::SyncState;

pub const STATUS_NEW: &str = "new";
pub const STATUS_MISMATCH: &str = "mismatch";

const USER_AGENT: &str = concat!("ingest-agent/", env!("CARGO_PKG_VERSION"));

/// A document handed to the Ingester: content plus the form metadata the
/// upload endpoint expects.
#[derive(Debug, Clone)]
pub struct IngestDocument {
    pub uri: String,
    pub content: Vec<u8>,
    pub mime_type: String,
    pub metadata: serde_json::Map<String, Value>,
}

/// Operations the sync engine needs from the Ingester.
#[async_trait]
pub trait IngestApi: Send + Sync {
    /// Existing batch id for a source, if one exists.
    async fn find_batch_for_source(&self, source: &str) -> Result<Option<i64>>;

    async fn create_batch(&self, source: &str, name: &str) -> Result<i64>;

    /// Submit `uri -> sha256` hashes; returns the URIs whose status came
    /// back `new` or `mismatch`, i.e. the subset that needs processing.
    async fn check_status(
        &self,
        source: &str,
        hashes: &BTreeMap<String, String>,
    ) -> Result<Vec<String>>;

    /// Upload one document into a batch. An `Err` here is a per-document
    /// failure; callers record it and continue.
    async fn ingest_document(
        &self,
        source: &str,
        batch_id: i64,
        doc: &IngestDocument,
    ) -> Result<()>;

    async fn start_workflows(
        &self,
        batch_id: i64,
        workflow_definition_id: &str,
        param_id: &str,
        priority: u32,
    ) -> Result<Value>;

    /// Cursor for a source. An unknown source yields the default empty
    /// state, not an error.
    async fn get_sync_state(&self, source: &str) -> Result<SyncState>;

    async fn update_sync_state(
        &self,
        source: &str,
        commit_sha: &str,
        branch: &str,
        metadata: Option<&Value>,
    ) -> Result<Value>;

    /// Delete the cursor so the next sync takes the full-inventory path.
    async fn reset_sync_state(&self, source: &str) -> Result<Value>;
}

/// HTTP client for the Ingester API.
pub struct IngesterClient {
    http: reqwest::Client,
    endpoint_url: String,
    api_key: Option<String>,
}

impl IngesterClient {
    pub fn new(config: &IngesterConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(120))
            .build()
            .context("building ingester HTTP client")?;
        Ok(Self {
            http,
            endpoint_url: config.endpoint_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint_url, path)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// POST a form and decode the JSON body, mapping `error` bodies and
    /// unexpected statuses to failures.
    async fn post_form(&self, path: &str, form: Form, expected_status: u16) -> Result<Value> {
        let url = self.url(path);
        let resp = self
            .authed(self.http.post(&url))
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;

        let status = resp.status().as_u16();
        debug!(path, status, "ingester response");
        let body: Value = resp.json().await.unwrap_or(Value::Null);

        if let Some(error) = body.get("error").and_then(Value::as_str) {
            bail!("ingester error: {error}");
        }
        if status != expected_status {
            bail!("unexpected status {status} from {path}: {body}");
        }
        Ok(body)
    }
}

#[async_trait]
impl IngestApi for IngesterClient {
    async fn find_batch_for_source(&self, source: &str) -> Result<Option<i64>> {
        let url = self.url("/batch/");
        let resp = self
            .authed(self.http.get(&url))
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .context("listing batches")?;

        let batches: Vec<Value> = resp.json().await.context("decoding batch list")?;
        let found: Vec<&Value> = batches
            .iter()
            .filter(|b| b.get("source").and_then(Value::as_str) == Some(source))
            .collect();

        if found.len() > 1 {
            warn!(
                source,
                count = found.len(),
                "multiple batches for source, using first"
            );
        }
        Ok(found.first().and_then(|b| b.get("id")).and_then(Value::as_i64))
    }

    async fn create_batch(&self, source: &str, name: &str) -> Result<i64> {
        let form = Form::new()
            .text("source", source.to_string())
            .text("name", name.to_string());
        let body = self.post_form("/batch/", form, 201).await?;
        body.get("batch_id")
            .and_then(Value::as_i64)
            .context("batch creation response missing batch_id")
    }

    async fn check_status(
        &self,
        source: &str,
        hashes: &BTreeMap<String, String>,
    ) -> Result<Vec<String>> {
        let url = self.url("/source-status");
        let form = Form::new()
            .text("source", source.to_string())
            .text("hashes", serde_json::to_string(hashes)?);

        let resp = self
            .authed(self.http.post(&url))
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?
            .error_for_status()
            .context("checking source status")?;

        let body: Value = resp.json().await.context("decoding source status")?;
        let rows = body
            .as_object()
            .context("source status response is not an object")?;

        let mut to_process = Vec::new();
        for (uri, row) in rows {
            let status = row.get("status").and_then(Value::as_str).unwrap_or("");
            if status == STATUS_NEW || status == STATUS_MISMATCH {
                debug!(uri, status, "needs processing");
                to_process.push(uri.clone());
            } else {
                debug!(uri, status, "up to date");
            }
        }
        Ok(to_process)
    }

    async fn ingest_document(
        &self,
        source: &str,
        batch_id: i64,
        doc: &IngestDocument,
    ) -> Result<()> {
        let filename = doc
            .uri
            .trim_start_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or("document")
            .to_string();

        let part = Part::bytes(doc.content.clone())
            .file_name(filename)
            .mime_str("binary/octet-stream")
            .context("building file part")?;

        let form = Form::new()
            .text("source", source.to_string())
            .text("source_uri", doc.uri.clone())
            .text("batch_id", batch_id.to_string())
            .text("doc_meta", serde_json::to_string(&doc.metadata)?)
            .text("mime_type", doc.mime_type.clone())
            .part("file", part);

        self.post_form("/document/ingest-document", form, 201)
            .await
            .with_context(|| format!("ingesting {}", doc.uri))?;
        Ok(())
    }

    async fn start_workflows(
        &self,
        batch_id: i64,
        workflow_definition_id: &str,
        param_id: &str,
        priority: u32,
    ) -> Result<Value> {
        let form = Form::new()
            .text("batch_id", batch_id.to_string())
            .text("priority", priority.to_string())
            .text("workflow_definition_id", workflow_definition_id.to_string())
            .text("param_id", param_id.to_string());

        self.post_form("/batch/start-workflows", form, 201).await
    }

    async fn get_sync_state(&self, source: &str) -> Result<SyncState> {
        let url = self.url(&format!("/sync-state/{source}"));
        let resp = self
            .authed(self.http.get(&url))
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        if resp.status().as_u16() == 404 {
            // Never synced. Not an error.
            return Ok(SyncState::empty(source));
        }

        let resp = resp.error_for_status().context("fetching sync state")?;
        resp.json::<SyncState>()
            .await
            .context("decoding sync state")
    }

    async fn update_sync_state(
        &self,
        source: &str,
        commit_sha: &str,
        branch: &str,
        metadata: Option<&Value>,
    ) -> Result<Value> {
        let url = self.url(&format!("/sync-state/{source}"));
        let mut form = Form::new()
            .text("commit_sha", commit_sha.to_string())
            .text("branch", branch.to_string());
        if let Some(metadata) = metadata {
            form = form.text("metadata", serde_json::to_string(metadata)?);
        }

        let resp = self
            .authed(self.http.put(&url))
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("PUT {url}"))?
            .error_for_status()
            .context("updating sync state")?;

        resp.json().await.context("decoding sync state update")
    }

    async fn reset_sync_state(&self, source: &str) -> Result<Value> {
        let url = self.url(&format!("/sync-state/{source}"));
        let resp = self
            .authed(self.http.delete(&url))
            .send()
            .await
            .with_context(|| format!("DELETE {url}"))?;

        if resp.status().as_u16() == 404 {
            return Ok(serde_json::json!({
                "message": format!("No sync state found for {source}")
            }));
        }

        let resp = resp.error_for_status().context("resetting sync state")?;
        resp.json().await.context("decoding sync state reset")
    }
}

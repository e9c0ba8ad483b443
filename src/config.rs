use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub scm: ScmConfig,
    #[serde(default)]
    pub ingester: IngesterConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub fs: Option<FsCollectorConfig>,
}

/// Settings for talking to the SCM host API (GitHub-style or Gitea-style).
#[derive(Debug, Deserialize, Clone)]
pub struct ScmConfig {
    /// Base API URL. Required for Gitea; GitHub falls back to the public API.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub auth_username: Option<String>,
    #[serde(default)]
    pub auth_password: Option<String>,
    /// Default repository owner when a command does not pass one.
    #[serde(default)]
    pub owner: Option<String>,
    /// File extensions eligible for ingestion (no leading dot).
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Cap on simultaneous in-flight requests against one SCM host.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
    /// Total attempts per request (first try included).
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Exponential backoff base, seconds.
    #[serde(default = "default_backoff_base")]
    pub retry_backoff_base: f64,
    /// Backoff ceiling, seconds.
    #[serde(default = "default_backoff_max")]
    pub retry_backoff_max: f64,
    /// Per-request timeout, seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ScmConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            auth_token: None,
            auth_username: None,
            auth_password: None,
            owner: None,
            extensions: default_extensions(),
            max_concurrent_requests: default_max_concurrent(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_base: default_backoff_base(),
            retry_backoff_max: default_backoff_max(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_extensions() -> Vec<String> {
    ["md", "pdf", "doc", "docx"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_max_concurrent() -> usize {
    3
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_backoff_base() -> f64 {
    1.0
}
fn default_backoff_max() -> f64 {
    30.0
}
fn default_timeout_secs() -> u64 {
    120
}

/// Settings for the remote Ingester API.
#[derive(Debug, Deserialize, Clone)]
pub struct IngesterConfig {
    #[serde(default = "default_endpoint_url")]
    pub endpoint_url: String,
    /// Bearer key sent on outgoing Ingester requests.
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for IngesterConfig {
    fn default() -> Self {
        Self {
            endpoint_url: default_endpoint_url(),
            api_key: None,
        }
    }
}

fn default_endpoint_url() -> String {
    "http://localhost:8000/api/v1".to_string()
}

/// Settings for this agent's own HTTP façade.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Static bearer key required on incoming requests when enabled.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_enabled: bool,
    /// Accept identity from `X-Auth-Request-User` / `X-Forwarded-User`
    /// headers set by an OAuth2 proxy in front of the agent.
    #[serde(default)]
    pub trust_proxy_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            api_key: None,
            api_key_enabled: false,
            trust_proxy_headers: false,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8001".to_string()
}

/// Settings for the local filesystem collector.
#[derive(Debug, Deserialize, Clone)]
pub struct FsCollectorConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}

impl Config {
    /// Minimal config for commands that only need defaults.
    pub fn minimal() -> Self {
        Config::default()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.scm.retry_attempts == 0 {
        anyhow::bail!("scm.retry_attempts must be >= 1");
    }
    if config.scm.max_concurrent_requests == 0 {
        anyhow::bail!("scm.max_concurrent_requests must be >= 1");
    }
    if config.scm.retry_backoff_base <= 0.0 {
        anyhow::bail!("scm.retry_backoff_base must be > 0");
    }
    if config.scm.retry_backoff_max < config.scm.retry_backoff_base {
        anyhow::bail!("scm.retry_backoff_max must be >= scm.retry_backoff_base");
    }
    if config.ingester.endpoint_url.is_empty() {
        anyhow::bail!("ingester.endpoint_url must not be empty");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn empty_config_uses_defaults() {
        let f = write_config("");
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.scm.retry_attempts, 3);
        assert_eq!(cfg.scm.max_concurrent_requests, 3);
        assert_eq!(cfg.ingester.endpoint_url, "http://localhost:8000/api/v1");
        assert_eq!(cfg.server.bind, "127.0.0.1:8001");
        assert!(cfg.scm.extensions.contains(&"md".to_string()));
    }

    #[test]
    fn parses_scm_section() {
        let f = write_config(
            r#"
[scm]
base_url = "https://git.example.com/api/v1"
auth_token = "t0ken"
owner = "admin"
extensions = ["md", "rst"]
retry_attempts = 5
"#,
        );
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(
            cfg.scm.base_url.as_deref(),
            Some("https://git.example.com/api/v1")
        );
        assert_eq!(cfg.scm.retry_attempts, 5);
        assert_eq!(cfg.scm.extensions, vec!["md", "rst"]);
    }

    #[test]
    fn rejects_zero_retry_attempts() {
        let f = write_config("[scm]\nretry_attempts = 0\n");
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn rejects_backoff_ceiling_below_base() {
        let f = write_config("[scm]\nretry_backoff_base = 5.0\nretry_backoff_max = 1.0\n");
        assert!(load_config(f.path()).is_err());
    }
}

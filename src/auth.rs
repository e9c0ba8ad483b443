//! Authentication for the agent's own HTTP API.
//!
//! Two methods, mirroring a deployment behind an OAuth2 proxy:
//!
//! 1. Static API key via `Authorization: Bearer` (programmatic access).
//! 2. Identity headers (`X-Auth-Request-*` / `X-Forwarded-*`) set by a
//!    trusted proxy (UI access).
//!
//! With both methods disabled every request is allowed anonymously.

use axum::http::HeaderMap;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::ServerConfig;

/// An authenticated caller: a proxy-forwarded user or an API client.
#[derive(Debug, Clone, Serialize)]
pub struct AuthenticatedUser {
    pub identity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<String>>,
    /// "api-key", "proxy", or "none".
    pub method: String,
}

impl AuthenticatedUser {
    fn anonymous() -> Self {
        Self {
            identity: "anonymous".to_string(),
            email: None,
            groups: None,
            method: "none".to_string(),
        }
    }

    fn api_client() -> Self {
        Self {
            identity: "api-client".to_string(),
            email: None,
            groups: None,
            method: "api-key".to_string(),
        }
    }
}

/// Compare two secrets without leaking the mismatch position. Hashing both
/// sides first makes the byte comparison length-independent.
fn secrets_match(a: &str, b: &str) -> bool {
    let da = Sha256::digest(a.as_bytes());
    let db = Sha256::digest(b.as_bytes());
    let mut diff = 0u8;
    for (x, y) in da.iter().zip(db.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn bearer_token<'a>(headers: &'a HeaderMap) -> Option<&'a str> {
    header(headers, "authorization")?.strip_prefix("Bearer ")
}

/// Identity forwarded by an OAuth2 proxy, if present.
fn user_from_proxy_headers(headers: &HeaderMap) -> Option<AuthenticatedUser> {
    let user = header(headers, "x-auth-request-user")
        .or_else(|| header(headers, "x-forwarded-user"))?;
    let email = header(headers, "x-auth-request-email")
        .or_else(|| header(headers, "x-forwarded-email"))
        .map(str::to_string);
    let groups = header(headers, "x-auth-request-groups")
        .or_else(|| header(headers, "x-forwarded-groups"))
        .map(|g| g.split(',').map(str::to_string).collect());

    Some(AuthenticatedUser {
        identity: user.to_string(),
        email,
        groups,
        method: "proxy".to_string(),
    })
}

/// Resolve the caller for one request.
///
/// A provided-but-wrong bearer token is rejected outright, even when proxy
/// headers would otherwise pass.
pub fn authenticate(
    config: &ServerConfig,
    headers: &HeaderMap,
) -> Result<AuthenticatedUser, String> {
    let auth_enabled = config.api_key_enabled || config.trust_proxy_headers;
    if !auth_enabled {
        return Ok(AuthenticatedUser::anonymous());
    }

    if config.api_key_enabled {
        if let Some(token) = bearer_token(headers) {
            return match &config.api_key {
                Some(key) if secrets_match(token, key) => Ok(AuthenticatedUser::api_client()),
                _ => Err("invalid token".to_string()),
            };
        }
    }

    if config.trust_proxy_headers {
        if let Some(user) = user_from_proxy_headers(headers) {
            return Ok(user);
        }
    }

    Err("authentication required".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    fn config(api_key: Option<&str>, enabled: bool, proxy: bool) -> ServerConfig {
        ServerConfig {
            bind: "127.0.0.1:0".to_string(),
            api_key: api_key.map(str::to_string),
            api_key_enabled: enabled,
            trust_proxy_headers: proxy,
        }
    }

    #[test]
    fn disabled_auth_allows_everyone() {
        let user = authenticate(&config(None, false, false), &HeaderMap::new()).unwrap();
        assert_eq!(user.identity, "anonymous");
        assert_eq!(user.method, "none");
    }

    #[test]
    fn valid_bearer_token_is_api_client() {
        let user = authenticate(
            &config(Some("sekret"), true, false),
            &headers(&[("authorization", "Bearer sekret")]),
        )
        .unwrap();
        assert_eq!(user.identity, "api-client");
        assert_eq!(user.method, "api-key");
    }

    #[test]
    fn wrong_bearer_token_is_rejected() {
        let res = authenticate(
            &config(Some("sekret"), true, false),
            &headers(&[("authorization", "Bearer nope")]),
        );
        assert!(res.is_err());
    }

    #[test]
    fn missing_credentials_rejected_when_enabled() {
        assert!(authenticate(&config(Some("sekret"), true, false), &HeaderMap::new()).is_err());
    }

    #[test]
    fn proxy_headers_carry_identity() {
        let user = authenticate(
            &config(None, false, true),
            &headers(&[
                ("x-auth-request-user", "alice"),
                ("x-auth-request-email", "alice@example.com"),
                ("x-auth-request-groups", "docs,eng"),
            ]),
        )
        .unwrap();
        assert_eq!(user.identity, "alice");
        assert_eq!(user.email.as_deref(), Some("alice@example.com"));
        assert_eq!(user.groups.as_ref().unwrap().len(), 2);
        assert_eq!(user.method, "proxy");
    }

    #[test]
    fn forwarded_headers_are_a_fallback() {
        let user = authenticate(
            &config(None, false, true),
            &headers(&[("x-forwarded-user", "bob")]),
        )
        .unwrap();
        assert_eq!(user.identity, "bob");
    }

    #[test]
    fn wrong_token_rejected_even_with_proxy_headers() {
        let res = authenticate(
            &config(Some("sekret"), true, true),
            &headers(&[
                ("authorization", "Bearer nope"),
                ("x-auth-request-user", "alice"),
            ]),
        );
        assert!(res.is_err());
    }
}

//! Retry client for the SCM host API.
//!
//! Wraps an [`HttpTransport`] with bounded retry, exponential backoff, and
//! rate-limit-aware delay. Policy:
//!
//! - **429**: retryable; on the final attempt a [`ScmError::RateLimited`]
//!   carrying the parsed `Retry-After` seconds is raised instead (the caller
//!   decides whether to wait and resubmit).
//! - **5xx**: retryable; the final attempt surfaces the raw response so the
//!   caller interprets the persistent failure.
//! - **2xx / other 4xx**: returned immediately, never retried.
//! - **Transport errors**: retried up to the attempt budget, then re-raised.
//!
//! Backoff is `base * 2^attempt` capped at the configured ceiling; a small
//! random jitter precedes every attempt so many repositories syncing
//! concurrently do not align their requests.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::ScmConfig;
use crate::error::ScmError;
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};

const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

#[derive(Clone)]
pub struct RetryClient {
    transport: Arc<dyn HttpTransport>,
    attempts: u32,
    backoff_base: f64,
    backoff_max: f64,
    /// Caps in-flight requests against one SCM host. Acquired around every
    /// attempt of a retried call, not just the first.
    limiter: Option<Arc<Semaphore>>,
}

impl RetryClient {
    pub fn new(transport: Arc<dyn HttpTransport>, config: &ScmConfig) -> Self {
        Self {
            transport,
            attempts: config.retry_attempts.max(1),
            backoff_base: config.retry_backoff_base,
            backoff_max: config.retry_backoff_max,
            limiter: None,
        }
    }

    pub fn with_limiter(mut self, limiter: Arc<Semaphore>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Issue a request with the full retry policy applied.
    pub async fn request(&self, request: HttpRequest) -> Result<HttpResponse, ScmError> {
        let mut last_transport_err: Option<ScmError> = None;

        for attempt in 0..self.attempts {
            let is_final = attempt + 1 == self.attempts;

            // Small jitter ahead of every attempt to avoid thundering herd.
            let jitter_ms = rand::thread_rng().gen_range(10..50);
            tokio::time::sleep(Duration::from_millis(jitter_ms)).await;

            let sent = {
                let _permit = match &self.limiter {
                    Some(sem) => Some(
                        sem.clone()
                            .acquire_owned()
                            .await
                            .map_err(|e| ScmError::Transport(e.to_string()))?,
                    ),
                    None => None,
                };
                self.transport.send(request.clone()).await
            };

            match sent {
                Ok(response) => {
                    if response.status == 429 {
                        let retry_after = response
                            .header("Retry-After")
                            .and_then(|v| v.parse::<u64>().ok())
                            .unwrap_or(DEFAULT_RETRY_AFTER_SECS);

                        if is_final {
                            return Err(ScmError::RateLimited { retry_after });
                        }

                        warn!(
                            url = %request.url,
                            retry_after,
                            attempt = attempt + 1,
                            "rate limited, waiting before retry"
                        );
                        let wait = (retry_after as f64).min(self.backoff_max);
                        tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                        continue;
                    }

                    if response.status >= 500 {
                        if is_final {
                            // Persistent server failure: the caller decides.
                            return Ok(response);
                        }
                        let backoff = self.backoff_delay(attempt);
                        warn!(
                            url = %request.url,
                            status = response.status,
                            attempt = attempt + 1,
                            "server error, retrying in {:.1}s",
                            backoff.as_secs_f64()
                        );
                        tokio::time::sleep(backoff).await;
                        continue;
                    }

                    debug!(url = %request.url, status = response.status, "request complete");
                    return Ok(response);
                }
                Err(err) => {
                    if is_final {
                        return Err(err);
                    }
                    let backoff = self.backoff_delay(attempt);
                    warn!(
                        url = %request.url,
                        error = %err,
                        attempt = attempt + 1,
                        "request failed, retrying in {:.1}s",
                        backoff.as_secs_f64()
                    );
                    last_transport_err = Some(err);
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        // Unreachable with attempts >= 1; kept for completeness.
        Err(last_transport_err
            .unwrap_or_else(|| ScmError::Transport("retry budget exhausted".to_string())))
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let secs = (self.backoff_base * 2f64.powi(attempt as i32)).min(self.backoff_max);
        Duration::from_secs_f64(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{HttpMethod, MockTransport};

    fn fast_config(attempts: u32) -> ScmConfig {
        ScmConfig {
            retry_attempts: attempts,
            retry_backoff_base: 0.001,
            retry_backoff_max: 0.005,
            ..ScmConfig::default()
        }
    }

    fn client(transport: &MockTransport, attempts: u32) -> RetryClient {
        RetryClient::new(Arc::new(transport.clone()), &fast_config(attempts))
    }

    fn response(status: u16, headers: Vec<(String, String)>, body: &str) -> HttpResponse {
        HttpResponse {
            status,
            headers,
            body: body.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn rate_limit_on_final_attempt_carries_retry_after() {
        let transport = MockTransport::new();
        transport.push_response(
            HttpMethod::Get,
            "http://scm/x",
            response(429, vec![("Retry-After".into(), "60".into())], ""),
        );

        let err = client(&transport, 1)
            .request(HttpRequest::get("http://scm/x"))
            .await
            .unwrap_err();

        match err {
            ScmError::RateLimited { retry_after } => assert_eq!(retry_after, 60),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rate_limit_retries_before_final_attempt() {
        let transport = MockTransport::new();
        transport.push_response(
            HttpMethod::Get,
            "http://scm/x",
            response(429, vec![("Retry-After".into(), "0".into())], ""),
        );
        transport.push_json(HttpMethod::Get, "http://scm/x", 200, serde_json::json!({}));

        let resp = client(&transport, 3)
            .request(HttpRequest::get("http://scm/x"))
            .await
            .unwrap();

        assert_eq!(resp.status, 200);
        assert_eq!(transport.request_count("http://scm/x"), 2);
    }

    #[tokio::test]
    async fn server_error_then_success_invokes_transport_twice() {
        let transport = MockTransport::new();
        transport.push_json(
            HttpMethod::Get,
            "http://scm/f",
            503,
            serde_json::json!({"message": "unavailable"}),
        );
        transport.push_json(
            HttpMethod::Get,
            "http://scm/f",
            200,
            serde_json::json!({"content": "aGVsbG8="}),
        );

        let resp = client(&transport, 3)
            .request(HttpRequest::get("http://scm/f"))
            .await
            .unwrap();

        assert_eq!(resp.status, 200);
        assert_eq!(resp.json()["content"], "aGVsbG8=");
        assert_eq!(transport.request_count("http://scm/f"), 2);
    }

    #[tokio::test]
    async fn persistent_server_error_surfaces_raw_response() {
        let transport = MockTransport::new();
        for _ in 0..2 {
            transport.push_json(HttpMethod::Get, "http://scm/y", 503, serde_json::json!({}));
        }

        let resp = client(&transport, 2)
            .request(HttpRequest::get("http://scm/y"))
            .await
            .unwrap();

        assert_eq!(resp.status, 503);
        assert_eq!(transport.request_count("http://scm/y"), 2);
    }

    #[tokio::test]
    async fn client_error_is_not_retried() {
        let transport = MockTransport::new();
        transport.push_json(HttpMethod::Get, "http://scm/z", 404, serde_json::json!({}));

        let resp = client(&transport, 3)
            .request(HttpRequest::get("http://scm/z"))
            .await
            .unwrap();

        assert_eq!(resp.status, 404);
        assert_eq!(transport.request_count("http://scm/z"), 1);
    }

    #[tokio::test]
    async fn transport_errors_exhaust_budget_then_raise() {
        let transport = MockTransport::new();
        for _ in 0..3 {
            transport.push_transport_error(HttpMethod::Get, "http://scm/t", "connection reset");
        }

        let err = client(&transport, 3)
            .request(HttpRequest::get("http://scm/t"))
            .await
            .unwrap_err();

        assert!(matches!(err, ScmError::Transport(_)));
        assert_eq!(transport.request_count("http://scm/t"), 3);
    }

    #[tokio::test]
    async fn limiter_is_respected_across_attempts() {
        let transport = MockTransport::new();
        transport.push_json(HttpMethod::Get, "http://scm/s", 503, serde_json::json!({}));
        transport.push_json(HttpMethod::Get, "http://scm/s", 200, serde_json::json!({}));

        let limiter = Arc::new(Semaphore::new(1));
        let resp = client(&transport, 2)
            .with_limiter(limiter.clone())
            .request(HttpRequest::get("http://scm/s"))
            .await
            .unwrap();

        assert_eq!(resp.status, 200);
        // Both attempts released their permit.
        assert_eq!(limiter.available_permits(), 1);
    }
}

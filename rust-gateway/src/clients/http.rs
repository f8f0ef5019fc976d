//! Shared JSON-over-HTTP plumbing for the upstream clients.

use std::time::Duration;

use reqwest::{header, Client, Method, StatusCode};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

use super::ClientError;

/// Longest we ever wait between two rate-limited attempts.
const MAX_RATE_LIMIT_DELAY: Duration = Duration::from_secs(30);

/// Base delay when a 429 response carries no `Retry-After` hint.
const DEFAULT_RATE_LIMIT_DELAY: Duration = Duration::from_secs(1);

/// Thin JSON API client bound to one provider.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    service: &'static str,
    base_url: String,
    authorization: Option<String>,
    timeout: Duration,
    max_attempts: u32,
}

impl ApiClient {
    /// Create a client for `service` rooted at `base_url`.
    ///
    /// `authorization` is the full `Authorization` header value. Without it
    /// every call fails with [`ClientError::NotConfigured`].
    pub fn new(
        service: &'static str,
        base_url: &str,
        authorization: Option<String>,
        timeout: Duration,
        max_attempts: u32,
    ) -> Result<Self, ClientError> {
        Url::parse(base_url).map_err(|e| ClientError::Decode(format!("invalid base url: {e}")))?;

        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(20)
            .build()
            .map_err(ClientError::Transport)?;

        Ok(Self {
            client,
            service,
            base_url: base_url.trim_end_matches('/').to_string(),
            authorization,
            timeout,
            max_attempts: max_attempts.max(1),
        })
    }

    pub fn service(&self) -> &'static str {
        self.service
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Value, ClientError> {
        self.send_json(Method::GET, path, query, None).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Value, ClientError> {
        self.send_json(Method::POST, path, &[], Some(body)).await
    }

    pub async fn patch(&self, path: &str, body: &Value) -> Result<Value, ClientError> {
        self.send_json(Method::PATCH, path, &[], Some(body)).await
    }

    /// Send one JSON request, retrying only when the provider rate limits us.
    ///
    /// Each attempt carries the configured timeout. A 429 is retried after the
    /// `Retry-After` hint (or an exponential delay) until `max_attempts` is
    /// reached; every other failure is returned immediately.
    pub async fn send_json(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Value, ClientError> {
        let Some(authorization) = self.authorization.as_deref() else {
            return Err(ClientError::NotConfigured(self.service));
        };

        let url = self.url(path);
        let mut attempt = 0;

        loop {
            attempt += 1;

            debug!(
                service = self.service,
                method = %method,
                url = %url,
                attempt = attempt,
                "upstream_request_starting"
            );

            let mut request = self
                .client
                .request(method.clone(), &url)
                .header(header::AUTHORIZATION, authorization)
                .header(header::ACCEPT, "application/json");

            if !query.is_empty() {
                request = request.query(query);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = match request.send().await {
                Ok(resp) => resp,
                Err(e) if e.is_timeout() => {
                    warn!(
                        service = self.service,
                        url = %url,
                        timeout_seconds = self.timeout.as_secs_f64(),
                        "upstream_request_timeout"
                    );
                    return Err(ClientError::Timeout(self.timeout));
                }
                Err(e) => {
                    warn!(service = self.service, url = %url, error = %e, "upstream_request_error");
                    return Err(ClientError::Transport(e));
                }
            };

            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = parse_retry_after(response.headers());
                warn!(
                    service = self.service,
                    url = %url,
                    attempt = attempt,
                    max_attempts = self.max_attempts,
                    retry_after_seconds = retry_after.map(|d| d.as_secs_f64()),
                    "upstream_rate_limited"
                );

                if attempt >= self.max_attempts {
                    return Err(ClientError::RateLimited { retry_after });
                }

                sleep(rate_limit_delay(retry_after, attempt)).await;
                continue;
            }

            let text = response.text().await.map_err(ClientError::Transport)?;

            if !status.is_success() {
                warn!(
                    service = self.service,
                    url = %url,
                    status_code = status.as_u16(),
                    "upstream_request_failed"
                );
                return Err(ClientError::Status {
                    status: status.as_u16(),
                    body: truncate(&text, 500),
                });
            }

            debug!(
                service = self.service,
                url = %url,
                status_code = status.as_u16(),
                "upstream_request_complete"
            );

            if text.trim().is_empty() {
                return Ok(Value::Null);
            }

            return serde_json::from_str(&text).map_err(|e| ClientError::Decode(e.to_string()));
        }
    }
}

/// Delay before retrying a rate-limited call.
fn rate_limit_delay(retry_after: Option<Duration>, attempt: u32) -> Duration {
    let delay = retry_after.unwrap_or_else(|| {
        DEFAULT_RATE_LIMIT_DELAY * 2u32.saturating_pow(attempt.saturating_sub(1))
    });
    delay.min(MAX_RATE_LIMIT_DELAY)
}

/// Read a `Retry-After` header given in seconds.
fn parse_retry_after(headers: &header::HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

//! Resilient outbound fetches.
//!
//! [`FetchClient::fetch`] paces every attempt through the [`DomainThrottle`],
//! turns 429 and 401/403 into recorded blocks, runs the block detector over
//! every other response whatever its status, and retries a 5xx or a
//! connection failure exactly once. Everything beyond that (404 and friends)
//! is returned to the caller as a [`FetchResult`].

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use time::format_description;
use time::PrimitiveDateTime;
use tracing::{debug, warn};

use crate::alerts::{AlertDispatcher, AlertEvent};
use crate::block_detector::{self, BlockReason};
use crate::domain::UtcDateTime;
use crate::error::StoreError;
use crate::http_client::{HttpClient, HttpErrorKind, HttpRequest, HttpResponse};
use crate::throttle::DomainThrottle;
use crate::url_policy::{host_of, sanitize_url, AllowedDomainPolicy};

const MAX_ATTEMPTS: u32 = 2;

/// Cooldown after the Nth consecutive block; the last entry repeats.
pub const BLOCK_COOLDOWN_SECONDS: [u64; 4] = [300, 900, 3_600, 21_600];

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);
const HTTP_DATE_FORMAT: &str =
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT";

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14.4; rv:125.0) Gecko/20100101 Firefox/125.0",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub timeout: Duration,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A completed exchange. `url` and `final_url` are sanitized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    pub body: Vec<u8>,
    pub content_type: String,
    pub status: u16,
    pub url: String,
    pub final_url: String,
    pub retrieved_at: UtcDateTime,
    pub headers: BTreeMap<String, String>,
}

impl FetchResult {
    fn from_response(requested_url: &str, response: HttpResponse) -> Self {
        let url = sanitize_url(requested_url);
        let final_url = response
            .final_url
            .as_deref()
            .map_or_else(|| url.clone(), sanitize_url);
        let content_type = response
            .header("content-type")
            .unwrap_or("text/html")
            .to_owned();
        Self {
            body: response.body,
            content_type,
            status: response.status,
            url,
            final_url,
            retrieved_at: UtcDateTime::now(),
            headers: response.headers,
        }
    }

    /// Body as text, with invalid UTF-8 replaced.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn is_html(&self) -> bool {
        self.content_type.contains("text/html")
    }

    pub fn is_json(&self) -> bool {
        self.content_type.contains("json")
    }

    pub fn was_redirected(&self) -> bool {
        self.url != self.final_url
    }

    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("domain {domain} is rate limited until {retry_at}")]
    RateLimited {
        domain: String,
        retry_at: UtcDateTime,
    },

    #[error("blocked by {domain} ({reason}) at {url}")]
    Blocked {
        domain: String,
        url: String,
        reason: BlockReason,
        retry_at: Option<UtcDateTime>,
    },

    #[error("request to {url} failed: {message}")]
    Network {
        url: String,
        message: String,
        timed_out: bool,
    },

    #[error("upstream {url} answered {status} after retry")]
    Upstream { url: String, status: u16 },

    #[error("url {url} is not allowed: {reason}")]
    DisallowedUrl { url: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Fetch client shared by every adapter chain of a run.
pub struct FetchClient {
    http: Arc<dyn HttpClient>,
    throttle: DomainThrottle,
    policy: AllowedDomainPolicy,
    alerts: Arc<AlertDispatcher>,
    attempts: AtomicU64,
}

impl FetchClient {
    pub fn new(
        http: Arc<dyn HttpClient>,
        throttle: DomainThrottle,
        policy: AllowedDomainPolicy,
        alerts: Arc<AlertDispatcher>,
    ) -> Self {
        Self {
            http,
            throttle,
            policy,
            alerts,
            attempts: AtomicU64::new(0),
        }
    }

    pub fn throttle(&self) -> &DomainThrottle {
        &self.throttle
    }

    /// Total network attempts made through this client, retries included.
    pub fn attempt_count(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResult, FetchError> {
        let safe_url = sanitize_url(&request.url);
        let domain = host_of(&request.url).ok_or_else(|| FetchError::Network {
            url: safe_url.clone(),
            message: "url has no host".to_owned(),
            timed_out: false,
        })?;
        self.policy
            .check(&request.url)
            .map_err(|reason| FetchError::DisallowedUrl {
                url: safe_url.clone(),
                reason,
            })?;

        if let Some(retry_at) = self.throttle.retry_time(&domain)? {
            debug!(domain = %domain, retry_at = %retry_at, "skipping request to rate limited domain");
            return Err(FetchError::RateLimited { domain, retry_at });
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.throttle.wait(&domain).await?;
            self.throttle.record_attempt(&domain)?;
            self.attempts.fetch_add(1, Ordering::Relaxed);
            debug!(domain = %domain, url = %safe_url, attempt, "fetching");

            let response = match self.http.execute(self.http_request(&request)).await {
                Ok(response) => response,
                Err(error) if attempt < MAX_ATTEMPTS && error.retryable() => {
                    warn!(url = %safe_url, error = %error, "request failed, retrying once");
                    continue;
                }
                Err(error) => {
                    return Err(FetchError::Network {
                        url: safe_url,
                        message: error.message().to_owned(),
                        timed_out: error.kind() == HttpErrorKind::Timeout,
                    });
                }
            };

            let status = response.status;
            if status == 429 {
                let retry_at = response
                    .header("retry-after")
                    .and_then(parse_retry_after)
                    .unwrap_or_else(|| UtcDateTime::now().plus(DEFAULT_RETRY_AFTER));
                self.throttle.block(&domain, retry_at)?;
                warn!(domain = %domain, retry_at = %retry_at, "rate limited by upstream");
                return Err(FetchError::RateLimited { domain, retry_at });
            }

            if matches!(status, 401 | 403) {
                let url = response
                    .final_url
                    .as_deref()
                    .map_or_else(|| safe_url.clone(), sanitize_url);
                return Err(self
                    .escalate(&domain, &url, status, BlockReason::AccessDenied)
                    .await?);
            }

            let result = FetchResult::from_response(&request.url, response);
            self.policy
                .check(&result.final_url)
                .map_err(|reason| FetchError::DisallowedUrl {
                    url: result.final_url.clone(),
                    reason,
                })?;

            let reason = block_detector::detect(&result);
            if reason != BlockReason::None {
                warn!(
                    domain = %domain,
                    status,
                    reason = %reason,
                    recoverable = reason.is_recoverable(),
                    "soft block detected"
                );
                if reason.escalates() {
                    return Err(self
                        .escalate(&domain, &result.final_url, status, reason)
                        .await?);
                }
                if !reason.is_recoverable() {
                    self.alerts
                        .dispatch(&AlertEvent::source_blocked(&domain, &result.final_url, None))
                        .await;
                    return Err(FetchError::Blocked {
                        domain,
                        url: result.final_url,
                        reason,
                        retry_at: None,
                    });
                }
            }

            if (500..=599).contains(&status) {
                if attempt < MAX_ATTEMPTS {
                    warn!(url = %safe_url, status, "upstream error, retrying once");
                    continue;
                }
                return Err(FetchError::Upstream {
                    url: safe_url,
                    status,
                });
            }

            self.throttle.record_success(&domain)?;
            return Ok(result);
        }
    }

    /// Record an escalating block and alert on it. The returned error is the
    /// one the caller should raise.
    async fn escalate(
        &self,
        domain: &str,
        url: &str,
        status: u16,
        reason: BlockReason,
    ) -> Result<FetchError, StoreError> {
        let count = self.throttle.consecutive_block_count(domain)?;
        let index = (count as usize).min(BLOCK_COOLDOWN_SECONDS.len() - 1);
        let cooldown = Duration::from_secs(BLOCK_COOLDOWN_SECONDS[index]);
        let retry_at = UtcDateTime::now().plus(cooldown);

        self.throttle
            .record_block(domain, retry_at, Some(status), Some(reason.as_str()))?;
        warn!(
            domain,
            url,
            status,
            consecutive = count + 1,
            cooldown_secs = cooldown.as_secs(),
            "source blocked"
        );
        self.alerts
            .dispatch(&AlertEvent::source_blocked(domain, url, Some(retry_at)))
            .await;

        Ok(FetchError::Blocked {
            domain: domain.to_owned(),
            url: url.to_owned(),
            reason,
            retry_at: Some(retry_at),
        })
    }

    fn http_request(&self, request: &FetchRequest) -> HttpRequest {
        let user_agent = USER_AGENTS[fastrand::usize(..USER_AGENTS.len())];
        let mut http = HttpRequest::get(request.url.clone())
            .with_header("user-agent", user_agent)
            .with_header(
                "accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,application/json;q=0.8,*/*;q=0.7",
            )
            .with_header("accept-language", "en-US,en;q=0.9")
            .with_timeout_ms(u64::try_from(request.timeout.as_millis()).unwrap_or(u64::MAX));
        for (name, value) in &request.headers {
            http = http.with_header(name.clone(), value.clone());
        }
        http
    }
}

/// Parse `Retry-After` as delta seconds or an IMF-fixdate.
pub fn parse_retry_after(value: &str) -> Option<UtcDateTime> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if value.bytes().all(|b| b.is_ascii_digit()) {
        let seconds = value.parse::<u64>().ok()?;
        return Some(UtcDateTime::now().plus(Duration::from_secs(seconds)));
    }

    let format = format_description::parse(HTTP_DATE_FORMAT).ok()?;
    let parsed = PrimitiveDateTime::parse(value, &format).ok()?;
    Some(UtcDateTime::from(parsed.assume_utc()))
}

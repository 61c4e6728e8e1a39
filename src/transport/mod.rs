//! Retrying HTTP transport
//!
//! This module performs every network hop in the crate, including:
//! - Building a blocking HTTP client with a proper user agent string
//! - Single GET requests with query parameters or byte-range headers
//! - Retry with exponential backoff and jitter for transient failures
//! - Failure classification (fatal / rate-limited / transient / terminal)
//! - Cooperative cancellation
//!
//! Remote index services are flaky, rate-limited, and occasionally behind
//! broken DNS. The classification rules are:
//!
//! | Condition | Action |
//! |-----------|--------|
//! | DNS failure, never-seen host | Fatal, no retry (likely a mistyped URL) |
//! | DNS failure, known-good host | Transient |
//! | HTTP 429 / 509 | Backoff, unlimited attempts, capped elapsed time |
//! | HTTP 5xx (other than 509) | Backoff, at most 10 attempts |
//! | Timeout / connection error | Backoff, at most 10 attempts |
//! | Other 4xx, malformed response | Terminal, surfaced immediately |

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use reqwest::blocking::Client;
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use url::Url;

use crate::{CdxError, Result};

const USER_AGENT: &str = concat!("cdxfetch/", env!("CARGO_PKG_VERSION"));

/// Hosts we expect to exist; a DNS failure for anything else is fatal
/// because the caller most likely mistyped an override URL.
const KNOWN_HOSTS: &[&str] = &[
    "index.commoncrawl.org",
    "data.commoncrawl.org",
    "commoncrawl.s3.amazonaws.com",
    "web.archive.org",
];

/// Shared flag a caller can trip to abort in-flight waits.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Retry/backoff policy knobs
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempt ceiling for transient failures (timeouts, 5xx)
    pub max_transient_attempts: u32,
    /// Elapsed-time ceiling for rate-limited retries, which have no
    /// attempt ceiling of their own
    pub max_elapsed: Duration,
    /// First backoff delay; doubles per attempt
    pub base_delay: Duration,
    /// Backoff delay ceiling
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> RetryPolicy {
        RetryPolicy {
            max_transient_attempts: 10,
            max_elapsed: Duration::from_secs(300),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with jitter: base * 2^attempt, capped, then
    /// scaled by a factor in [0.5, 1.0) so synchronized clients spread out.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX))
            .min(self.max_delay);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let factor = 0.5 + (nanos % 1000) as f64 / 2000.0;
        exp.mul_f64(factor)
    }
}

/// How status codes outside 2xx should be interpreted for this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Anything outside 2xx is an error
    Strict,
    /// 400 and 404 come back as normal responses; CDX servers use them to
    /// say "no captures" and "past the last page"
    Cdx,
}

/// One HTTP response body plus the status the caller may need to interpret.
#[derive(Debug)]
pub struct FetchResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Issues single GET requests with the retry policy above.
///
/// The only mutable state is the set of hostnames that have answered at
/// least once, which feeds the fatal-DNS decision.
pub struct Transport {
    client: Client,
    policy: RetryPolicy,
    cancel: CancelToken,
    seen_hosts: Mutex<HashSet<String>>,
}

impl Transport {
    pub fn new() -> Result<Transport> {
        Transport::with_policy(RetryPolicy::default(), CancelToken::new())
    }

    pub fn with_policy(policy: RetryPolicy, cancel: CancelToken) -> Result<Transport> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .redirect(Policy::none())
            .gzip(true)
            .brotli(true)
            .build()?;
        let seen_hosts = KNOWN_HOSTS.iter().map(|h| h.to_string()).collect();
        Ok(Transport {
            client,
            policy,
            cancel,
            seen_hosts: Mutex::new(seen_hosts),
        })
    }

    /// Fetches `url` with the given query parameters.
    pub fn fetch(&self, url: &str, params: &[(String, String)], mode: FetchMode) -> Result<FetchResponse> {
        self.request(url, params, None, mode)
    }

    /// Fetches bytes `[offset, offset + length)` of `url`.
    pub fn fetch_range(&self, url: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let range = format!("bytes={}-{}", offset, offset + length.saturating_sub(1));
        let resp = self.request(url, &[], Some(&range), FetchMode::Strict)?;
        Ok(resp.body)
    }

    fn request(
        &self,
        url: &str,
        params: &[(String, String)],
        range: Option<&str>,
        mode: FetchMode,
    ) -> Result<FetchResponse> {
        let started = Instant::now();
        let mut transient_attempts: u32 = 0;
        let mut total_attempts: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(CdxError::Cancelled { url: url.to_string() });
            }
            total_attempts += 1;

            let mut req = self.client.get(url);
            if !params.is_empty() {
                req = req.query(params);
            }
            if let Some(range) = range {
                req = req.header(reqwest::header::RANGE, range);
            }

            tracing::debug!(url, attempt = total_attempts, "sending GET");
            match req.send() {
                Ok(resp) => {
                    let status = resp.status();
                    match self.classify_status(status, mode) {
                        StatusClass::Ok => {
                            self.mark_host_seen(url);
                            let body = resp.bytes()?.to_vec();
                            return Ok(FetchResponse {
                                status: status.as_u16(),
                                body,
                            });
                        }
                        StatusClass::RateLimited => {
                            if started.elapsed() > self.policy.max_elapsed {
                                return Err(CdxError::FetchFailure {
                                    url: url.to_string(),
                                    attempts: total_attempts,
                                    message: format!(
                                        "rate limited ({}) past the elapsed-time ceiling",
                                        status.as_u16()
                                    ),
                                });
                            }
                            let delay = self.policy.backoff_delay(transient_attempts);
                            tracing::warn!(
                                url,
                                status = status.as_u16(),
                                attempt = total_attempts,
                                delay_ms = delay.as_millis() as u64,
                                "rate limited, backing off"
                            );
                            self.sleep_cancellable(delay, url)?;
                            transient_attempts += 1;
                        }
                        StatusClass::Transient => {
                            transient_attempts += 1;
                            if transient_attempts >= self.policy.max_transient_attempts {
                                return Err(CdxError::FetchFailure {
                                    url: url.to_string(),
                                    attempts: total_attempts,
                                    message: format!("giving up after HTTP {}", status.as_u16()),
                                });
                            }
                            let delay = self.policy.backoff_delay(transient_attempts);
                            tracing::info!(
                                url,
                                status = status.as_u16(),
                                attempt = total_attempts,
                                delay_ms = delay.as_millis() as u64,
                                "transient server error, retrying"
                            );
                            self.sleep_cancellable(delay, url)?;
                        }
                        StatusClass::Terminal => {
                            return Err(CdxError::Status {
                                url: url.to_string(),
                                status: status.as_u16(),
                            });
                        }
                    }
                }
                Err(e) => {
                    if is_dns_error(&e) && !self.host_seen(url) {
                        tracing::error!(url, "name resolution failed for unknown host, not retrying");
                        return Err(CdxError::FatalNetwork { url: url.to_string() });
                    }
                    if e.is_timeout() || e.is_connect() || e.is_request() {
                        transient_attempts += 1;
                        if transient_attempts >= self.policy.max_transient_attempts {
                            return Err(CdxError::FetchFailure {
                                url: url.to_string(),
                                attempts: total_attempts,
                                message: format!("giving up after {}", e),
                            });
                        }
                        let delay = self.policy.backoff_delay(transient_attempts);
                        tracing::info!(
                            url,
                            attempt = total_attempts,
                            error = %e,
                            delay_ms = delay.as_millis() as u64,
                            "connection problem, retrying"
                        );
                        self.sleep_cancellable(delay, url)?;
                    } else {
                        return Err(CdxError::Reqwest(e));
                    }
                }
            }
        }
    }

    fn classify_status(&self, status: StatusCode, mode: FetchMode) -> StatusClass {
        let code = status.as_u16();
        match code {
            200..=299 => StatusClass::Ok,
            400 | 404 if mode == FetchMode::Cdx => StatusClass::Ok,
            429 | 509 => StatusClass::RateLimited,
            500..=599 => StatusClass::Transient,
            _ => StatusClass::Terminal,
        }
    }

    /// Sleeps in short slices so cancellation is noticed promptly.
    fn sleep_cancellable(&self, total: Duration, url: &str) -> Result<()> {
        let slice = Duration::from_millis(50);
        let deadline = Instant::now() + total;
        while Instant::now() < deadline {
            if self.cancel.is_cancelled() {
                return Err(CdxError::Cancelled { url: url.to_string() });
            }
            std::thread::sleep(slice.min(deadline.saturating_duration_since(Instant::now())));
        }
        Ok(())
    }

    fn host_seen(&self, url: &str) -> bool {
        match hostname_of(url) {
            Some(host) => self.seen_hosts.lock().unwrap_or_else(|e| e.into_inner()).contains(&host),
            None => false,
        }
    }

    fn mark_host_seen(&self, url: &str) {
        if let Some(host) = hostname_of(url) {
            self.seen_hosts
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(host);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusClass {
    Ok,
    RateLimited,
    Transient,
    Terminal,
}

fn hostname_of(url: &str) -> Option<String> {
    Url::parse(url).ok()?.host_str().map(|h| h.to_string())
}

/// Walks the error source chain looking for a name-resolution failure.
fn is_dns_error(e: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(e);
    while let Some(s) = source {
        let msg = s.to_string();
        if msg.contains("dns error")
            || msg.contains("failed to lookup address")
            || msg.contains("Name or service not known")
        {
            return true;
        }
        source = s.source();
    }
    false
}

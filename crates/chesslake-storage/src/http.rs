//! Rate-limited HTTP client for the chess.com and lichess public APIs.
//!
//! Every request passes three gates before it reaches the network: a global
//! concurrency cap, a per-platform cap (lichess asks for one request at a
//! time), and an optional pacer shared by all platforms. Throttled responses
//! honour `Retry-After`.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chesslake_core::Platform;
use reqwest::header::{HeaderMap, ACCEPT, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

use crate::{parse_ndjson, ApiRequest, FetchError, JsonSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per request, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Pause after a 429 when the server does not say how long to wait.
    pub throttle_pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            throttle_pause: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Exponential delay before attempt `failed + 1`, capped at `max_delay`.
    pub fn backoff(&self, failed: u32) -> Duration {
        let exp = failed.saturating_sub(1);
        let factor = 1u32.checked_shl(exp).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn throttled(&self, retry_after: Option<Duration>) -> Duration {
        retry_after
            .unwrap_or(self.throttle_pause)
            .min(self.throttle_pause)
    }
}

/// Seconds form of `Retry-After`; the HTTP-date form is ignored.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub burst: u32,
    pub interval: Duration,
}

impl RateLimit {
    /// `rps` requests per second, with up to one second's worth in a burst.
    pub fn per_second(rps: u32) -> Self {
        let rps = rps.max(1);
        Self {
            burst: rps,
            interval: Duration::from_secs(1) / rps,
        }
    }
}

/// Spaces requests `interval` apart once the burst is spent.
///
/// Each caller reserves the next free slot under the lock and sleeps outside
/// it, so waiters never poll and the schedule has nanosecond resolution.
#[derive(Debug)]
pub struct RequestPacer {
    interval: Duration,
    window: Duration,
    next_slot: Mutex<Instant>,
}

impl RequestPacer {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            interval: limit.interval,
            window: limit.interval.saturating_mul(limit.burst.max(1)),
            next_slot: Mutex::new(Instant::now()),
        }
    }

    pub async fn acquire(&self) {
        let wait_until = {
            let mut slot = self.next_slot.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            let start = (*slot).max(now);
            *slot = start + self.interval;
            (*slot).checked_sub(self.window).filter(|at| *at > now)
        };
        if let Some(at) = wait_until {
            tokio::time::sleep_until(at).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub platform_concurrency: HashMap<Platform, usize>,
    pub retry: RetryPolicy,
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 8,
            platform_concurrency: HashMap::from([(Platform::ChessCom, 4), (Platform::Lichess, 1)]),
            retry: RetryPolicy::default(),
            rate_limit: None,
        }
    }
}

impl HttpClientConfig {
    pub fn with_platform_limit(mut self, platform: Platform, limit: usize) -> Self {
        self.platform_concurrency.insert(platform, limit);
        self
    }

    pub fn platform_limit(&self, platform: Platform) -> usize {
        self.platform_concurrency
            .get(&platform)
            .copied()
            .unwrap_or(1)
            .max(1)
    }
}

#[derive(Debug)]
struct PlatformGates {
    chesscom: Semaphore,
    lichess: Semaphore,
}

impl PlatformGates {
    fn new(config: &HttpClientConfig) -> Self {
        Self {
            chesscom: Semaphore::new(config.platform_limit(Platform::ChessCom)),
            lichess: Semaphore::new(config.platform_limit(Platform::Lichess)),
        }
    }

    fn gate(&self, platform: Platform) -> &Semaphore {
        match platform {
            Platform::ChessCom => &self.chesscom,
            Platform::Lichess => &self.lichess,
        }
    }
}

struct Fetched {
    url: String,
    body: Vec<u8>,
}

enum Attempt {
    Done(Fetched),
    Retry { pause: Duration, cause: FetchError },
    Fail(FetchError),
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global: Semaphore,
    platforms: PlatformGates,
    pacer: Option<RequestPacer>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            global: Semaphore::new(config.global_concurrency.max(1)),
            platforms: PlatformGates::new(&config),
            pacer: config.rate_limit.map(RequestPacer::new),
            retry: config.retry,
        })
    }

    async fn fetch(&self, request: &ApiRequest) -> Result<Fetched, FetchError> {
        let _global = self.global.acquire().await.map_err(|_| FetchError::Closed)?;
        let _platform = self
            .platforms
            .gate(request.platform)
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", platform = %request.platform, url = %request.url);
        async {
            let mut attempt = 1;
            loop {
                match self.attempt(request, attempt).await {
                    Attempt::Done(fetched) => return Ok(fetched),
                    Attempt::Fail(err) => return Err(err),
                    Attempt::Retry { pause, cause } if attempt < self.retry.max_attempts => {
                        warn!(error = %cause, attempt, ?pause, "upstream request failed, retrying");
                        tokio::time::sleep(pause).await;
                        attempt += 1;
                    }
                    Attempt::Retry { cause, .. } => return Err(cause),
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn attempt(&self, request: &ApiRequest, attempt: u32) -> Attempt {
        if let Some(pacer) = &self.pacer {
            pacer.acquire().await;
        }

        let mut builder = self
            .client
            .get(&request.url)
            .header(ACCEPT, request.accept.mime());
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) if err.is_timeout() || err.is_connect() => {
                return Attempt::Retry {
                    pause: self.retry.backoff(attempt),
                    cause: FetchError::Request(err),
                }
            }
            Err(err) => return Attempt::Fail(FetchError::Request(err)),
        };

        let status = response.status();
        let url = response.url().to_string();
        debug!(%status, attempt, "upstream responded");
        if status.is_success() {
            return match response.bytes().await {
                Ok(body) => Attempt::Done(Fetched {
                    url,
                    body: body.to_vec(),
                }),
                Err(err) => Attempt::Retry {
                    pause: self.retry.backoff(attempt),
                    cause: FetchError::Request(err),
                },
            };
        }

        let pause = if status == StatusCode::TOO_MANY_REQUESTS {
            Some(self.retry.throttled(retry_after(response.headers())))
        } else if status.is_server_error() {
            Some(self.retry.backoff(attempt))
        } else {
            None
        };
        let cause = FetchError::HttpStatus {
            status: status.as_u16(),
            url,
        };
        match pause {
            Some(pause) => Attempt::Retry { pause, cause },
            None => Attempt::Fail(cause),
        }
    }
}

#[async_trait]
impl JsonSource for HttpFetcher {
    async fn get_json(&self, request: &ApiRequest) -> Result<JsonValue, FetchError> {
        let fetched = self.fetch(request).await?;
        serde_json::from_slice(&fetched.body).map_err(|source| FetchError::Decode {
            url: fetched.url,
            source,
        })
    }

    async fn get_ndjson(&self, request: &ApiRequest) -> Result<Vec<JsonValue>, FetchError> {
        let fetched = self.fetch(request).await?;
        parse_ndjson(&fetched.url, &fetched.body)
    }
}

// Single chokepoint for every upstream call.
// Throttle and cooldown are global to the gateway, never per caller.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::credentials::{CredentialError, CredentialProvider};
use crate::transport::{HttpMethod, HttpTransport, TransportError, TransportResponse, UpstreamRequest};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum UpstreamError {
    #[error("Upstream rejected request: {status} - {message}")]
    Rejected { status: u16, message: String },

    #[error("Rate limited by upstream (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Transient upstream failure: {0}")]
    Transient(String),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("Failed to decode upstream payload: {0}")]
    Decode(String),
}

impl UpstreamError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UpstreamError::RateLimited { .. } | UpstreamError::Transient(_)
        )
    }
}

impl From<TransportError> for UpstreamError {
    fn from(error: TransportError) -> Self {
        UpstreamError::Transient(error.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub base_url: String,
    // Minimum gap between two request starts
    pub min_spacing_ms: u64,
    // Requests allowed per refill interval
    pub burst_size: u32,
    pub refill_interval_ms: u64,
    // Cooldown after a 429 that carries no Retry-After hint
    pub cooldown_fallback_seconds: u64,
    // Upper bound applied to Retry-After hints
    pub max_cooldown_seconds: u64,
    pub timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            min_spacing_ms: 100,
            burst_size: 5,
            refill_interval_ms: 1000,
            cooldown_fallback_seconds: 60,
            max_cooldown_seconds: 600,
            timeout_ms: 15_000,
        }
    }
}

impl GatewayConfig {
    pub fn min_spacing(&self) -> Duration {
        Duration::from_millis(self.min_spacing_ms)
    }

    pub fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.refill_interval_ms)
    }

    pub fn cooldown_fallback(&self) -> Duration {
        Duration::from_secs(self.cooldown_fallback_seconds)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_secs(self.max_cooldown_seconds)
    }
}

struct ThrottleState {
    tokens: u32,
    last_refill: Instant,
    last_start: Option<Instant>,
}

// Minimum spacing plus a burst reservoir refilled to full on a fixed interval
pub struct Throttle {
    min_spacing: Duration,
    burst_size: u32,
    refill_interval: Duration,
    state: Mutex<ThrottleState>,
}

impl Throttle {
    pub fn new(min_spacing: Duration, burst_size: u32, refill_interval: Duration) -> Self {
        let burst_size = burst_size.max(1);
        Self {
            min_spacing,
            burst_size,
            refill_interval,
            state: Mutex::new(ThrottleState {
                tokens: burst_size,
                last_refill: Instant::now(),
                last_start: None,
            }),
        }
    }

    // Returns true when the caller had to wait
    pub async fn acquire(&self) -> bool {
        let mut waited = false;
        loop {
            let wait = {
                let mut state = self.state.lock();
                let now = Instant::now();

                if now.duration_since(state.last_refill) >= self.refill_interval {
                    state.tokens = self.burst_size;
                    state.last_refill = now;
                }

                let spacing_wait = state
                    .last_start
                    .map(|last| (last + self.min_spacing).saturating_duration_since(now))
                    .unwrap_or_default();
                let token_wait = if state.tokens == 0 {
                    (state.last_refill + self.refill_interval).saturating_duration_since(now)
                } else {
                    Duration::ZERO
                };

                let wait = spacing_wait.max(token_wait);
                if wait.is_zero() {
                    state.tokens -= 1;
                    state.last_start = Some(now);
                    return waited;
                }
                wait
            };

            waited = true;
            sleep(wait).await;
        }
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.tokens = self.burst_size;
        state.last_refill = Instant::now();
        state.last_start = None;
    }
}

// Hard ceiling for a single cooldown, whatever the caller asks for
const MAX_COOLDOWN: Duration = Duration::from_secs(24 * 60 * 60);

// Resume instant after a 429, shared by every caller of the gateway
#[derive(Default)]
pub struct Cooldown {
    resume_at: Mutex<Option<Instant>>,
}

impl Cooldown {
    pub fn remaining(&self) -> Option<Duration> {
        let resume_at = (*self.resume_at.lock())?;
        let remaining = resume_at.saturating_duration_since(Instant::now());
        (!remaining.is_zero()).then_some(remaining)
    }

    // A later 429 can only push the resume time further out
    pub fn trip(&self, duration: Duration) -> Instant {
        let candidate = Instant::now() + duration.min(MAX_COOLDOWN);
        let mut resume_at = self.resume_at.lock();
        let resume = match *resume_at {
            Some(existing) if existing > candidate => existing,
            _ => candidate,
        };
        *resume_at = Some(resume);
        resume
    }

    pub async fn wait(&self) -> bool {
        let mut waited = false;
        while let Some(remaining) = self.remaining() {
            waited = true;
            sleep(remaining).await;
        }
        waited
    }

    pub fn reset(&self) {
        *self.resume_at.lock() = None;
    }
}

// Shared throttle/cooldown state; inject one instance per upstream account
pub struct GatewayState {
    pub throttle: Throttle,
    pub cooldown: Cooldown,
}

impl GatewayState {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            throttle: Throttle::new(
                config.min_spacing(),
                config.burst_size,
                config.refill_interval(),
            ),
            cooldown: Cooldown::default(),
        }
    }

    pub fn reset(&self) {
        self.throttle.reset();
        self.cooldown.reset();
    }
}

#[derive(Debug, Default)]
struct GatewayCounters {
    requests_sent: AtomicUsize,
    requests_succeeded: AtomicUsize,
    requests_failed: AtomicUsize,
    requests_throttled: AtomicUsize,
    cooldown_waits: AtomicUsize,
    rate_limited_responses: AtomicUsize,
    auth_refreshes: AtomicUsize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayStats {
    pub requests_sent: usize,
    pub requests_succeeded: usize,
    pub requests_failed: usize,
    pub requests_throttled: usize,
    pub cooldown_waits: usize,
    pub rate_limited_responses: usize,
    pub auth_refreshes: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayRequest {
    pub method: HttpMethod,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl GatewayRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: HttpMethod::Post,
            path: path.into(),
            query: Vec::new(),
            body: Some(body),
        }
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: u16,
    pub body: bytes::Bytes,
}

impl GatewayResponse {
    pub fn json(&self) -> Result<serde_json::Value, UpstreamError> {
        serde_json::from_slice(&self.body).map_err(|e| UpstreamError::Decode(e.to_string()))
    }
}

pub struct RateLimitedGateway {
    transport: Arc<dyn HttpTransport>,
    credentials: Arc<CredentialProvider>,
    state: Arc<GatewayState>,
    cooldown_fallback: Duration,
    max_cooldown: Duration,
    counters: GatewayCounters,
}

impl RateLimitedGateway {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        credentials: Arc<CredentialProvider>,
        state: Arc<GatewayState>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            transport,
            credentials,
            state,
            cooldown_fallback: config.cooldown_fallback(),
            max_cooldown: config.max_cooldown(),
            counters: GatewayCounters::default(),
        }
    }

    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    // Non-429 4xx are surfaced as-is. Retrying 429/5xx/network failures is the
    // caller's job.
    pub async fn issue(&self, request: GatewayRequest) -> Result<GatewayResponse, UpstreamError> {
        let token = self.credentials.get_token().await?;
        let response = self.send_once(&request, token).await?;
        if response.status != 401 {
            return self.classify(&request, response);
        }

        self.counters.auth_refreshes.fetch_add(1, Ordering::SeqCst);
        debug!("Authorization rejected for {}, refreshing credential", request.path);
        let token = self.credentials.force_refresh().await?;
        let response = self.send_once(&request, token).await?;
        if response.status == 401 {
            self.counters.requests_failed.fetch_add(1, Ordering::SeqCst);
            warn!("Authorization still rejected for {} after refresh", request.path);
            return Err(UpstreamError::Transient(
                "authorization rejected after credential refresh".to_string(),
            ));
        }
        self.classify(&request, response)
    }

    async fn send_once(
        &self,
        request: &GatewayRequest,
        bearer_token: String,
    ) -> Result<TransportResponse, UpstreamError> {
        loop {
            if self.state.cooldown.wait().await {
                self.counters.cooldown_waits.fetch_add(1, Ordering::SeqCst);
            }
            if self.state.throttle.acquire().await {
                self.counters.requests_throttled.fetch_add(1, Ordering::SeqCst);
            }
            // A 429 may have landed while this call sat in the throttle
            if self.state.cooldown.remaining().is_none() {
                break;
            }
        }

        self.counters.requests_sent.fetch_add(1, Ordering::SeqCst);
        debug!("Issuing {:?} {}", request.method, request.path);

        let upstream_request = UpstreamRequest {
            method: request.method,
            path: request.path.clone(),
            query: request.query.clone(),
            body: request.body.clone(),
            bearer_token,
        };
        self.transport.send(upstream_request).await.map_err(|e| {
            self.counters.requests_failed.fetch_add(1, Ordering::SeqCst);
            warn!("Transport failure for {}: {}", request.path, e);
            UpstreamError::from(e)
        })
    }

    fn classify(
        &self,
        request: &GatewayRequest,
        response: TransportResponse,
    ) -> Result<GatewayResponse, UpstreamError> {
        let status = response.status;

        if (200..300).contains(&status) {
            self.counters.requests_succeeded.fetch_add(1, Ordering::SeqCst);
            return Ok(GatewayResponse {
                status,
                body: response.body,
            });
        }

        self.counters.requests_failed.fetch_add(1, Ordering::SeqCst);

        if status == 429 {
            self.counters
                .rate_limited_responses
                .fetch_add(1, Ordering::SeqCst);
            let cooldown = response
                .retry_after
                .unwrap_or(self.cooldown_fallback)
                .min(self.max_cooldown);
            self.state.cooldown.trip(cooldown);
            info!(
                "Upstream rate limit on {}, pausing all upstream calls for {:?}",
                request.path, cooldown
            );
            return Err(UpstreamError::RateLimited {
                retry_after: response.retry_after,
            });
        }

        let message = String::from_utf8_lossy(&response.body)
            .chars()
            .take(200)
            .collect::<String>();

        if (400..500).contains(&status) {
            warn!("Upstream rejected {} with {}: {}", request.path, status, message);
            return Err(UpstreamError::Rejected { status, message });
        }

        Err(UpstreamError::Transient(format!("HTTP {} - {}", status, message)))
    }

    pub fn stats(&self) -> GatewayStats {
        let c = &self.counters;
        GatewayStats {
            requests_sent: c.requests_sent.load(Ordering::SeqCst),
            requests_succeeded: c.requests_succeeded.load(Ordering::SeqCst),
            requests_failed: c.requests_failed.load(Ordering::SeqCst),
            requests_throttled: c.requests_throttled.load(Ordering::SeqCst),
            cooldown_waits: c.cooldown_waits.load(Ordering::SeqCst),
            rate_limited_responses: c.rate_limited_responses.load(Ordering::SeqCst),
            auth_refreshes: c.auth_refreshes.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::credentials::{CredentialConfig, StaticTokenStore, TokenStore};

    pub fn relaxed_config() -> GatewayConfig {
        GatewayConfig {
            min_spacing_ms: 0,
            burst_size: 1000,
            refill_interval_ms: 1000,
            ..GatewayConfig::default()
        }
    }

    pub fn gateway_with_store(
        transport: Arc<dyn HttpTransport>,
        store: Arc<dyn TokenStore>,
        config: &GatewayConfig,
    ) -> RateLimitedGateway {
        let credentials = Arc::new(CredentialProvider::new(store, CredentialConfig::default()));
        RateLimitedGateway::new(
            transport,
            credentials,
            Arc::new(GatewayState::new(config)),
            config,
        )
    }

    pub fn gateway(transport: Arc<dyn HttpTransport>, config: &GatewayConfig) -> RateLimitedGateway {
        gateway_with_store(
            transport,
            Arc::new(StaticTokenStore::new(Some("token-1".to_string()))),
            config,
        )
    }
}

// Availability answers for search (loose, cached per batch) and for booking
// (strict, per-listing detail calendar). Identical concurrent batch requests
// share one upstream computation.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::{CacheStatsReport, TtlCache};
use crate::calendar::{
    evaluate_range, summarize_listing, AvailabilityError, CalendarDay, EvaluationMode,
    ListingAvailabilityResult, StayWindow,
};
use crate::credentials::{CredentialConfig, CredentialProvider, TokenStore};
use crate::fetcher::{BatchFetcher, FetcherConfig};
use crate::gateway::{GatewayConfig, GatewayState, GatewayStats, RateLimitedGateway};
use crate::transport::ReqwestTransport;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub batch_ttl_seconds: u64,
    // Lifetime of a batch where some chunk failed
    pub degraded_ttl_seconds: u64,
    pub detail_ttl_seconds: u64,
    pub max_nights: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_ttl_seconds: 300,
            degraded_ttl_seconds: 30,
            detail_ttl_seconds: 60,
            max_nights: 365,
        }
    }
}

impl EngineConfig {
    pub fn batch_ttl(&self) -> Duration {
        Duration::from_secs(self.batch_ttl_seconds)
    }

    pub fn degraded_ttl(&self) -> Duration {
        Duration::from_secs(self.degraded_ttl_seconds)
    }

    pub fn detail_ttl(&self) -> Duration {
        Duration::from_secs(self.detail_ttl_seconds)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AvailabilityConfig {
    pub credentials: CredentialConfig,
    pub gateway: GatewayConfig,
    pub fetcher: FetcherConfig,
    pub engine: EngineConfig,
}

// Sorted, de-duplicated ids plus the stay window
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub listing_ids: Vec<String>,
    pub window: StayWindow,
}

impl BatchKey {
    pub fn contains(&self, listing_id: &str) -> bool {
        self.listing_ids
            .binary_search_by(|id| id.as_str().cmp(listing_id))
            .is_ok()
    }
}

type BatchResults = Arc<Vec<ListingAvailabilityResult>>;
type PendingBatch = Shared<BoxFuture<'static, BatchResults>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub batch_cache: CacheStatsReport,
    pub detail_cache: CacheStatsReport,
    pub inflight_batches: usize,
    pub batches_started: usize,
    pub gateway: GatewayStats,
}

struct EngineInner {
    fetcher: BatchFetcher,
    config: EngineConfig,
    batch_cache: TtlCache<BatchKey, Vec<ListingAvailabilityResult>>,
    detail_cache: TtlCache<(String, StayWindow), Vec<CalendarDay>>,
    // Also guards the batch-cache check that precedes registration
    inflight: Mutex<HashMap<BatchKey, PendingBatch>>,
    batches_started: AtomicUsize,
}

#[derive(Clone)]
pub struct AvailabilityEngine {
    inner: Arc<EngineInner>,
}

impl AvailabilityEngine {
    pub fn new(fetcher: BatchFetcher, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                fetcher,
                batch_cache: TtlCache::new(config.batch_ttl()),
                detail_cache: TtlCache::new(config.detail_ttl()),
                config,
                inflight: Mutex::new(HashMap::new()),
                batches_started: AtomicUsize::new(0),
            }),
        }
    }

    // Wires the HTTP-backed stack around the given credential source
    pub fn connect(
        config: AvailabilityConfig,
        store: Arc<dyn TokenStore>,
    ) -> Result<Self, AvailabilityError> {
        let transport = ReqwestTransport::new(&config.gateway.base_url, config.gateway.timeout_ms)
            .map_err(|e| AvailabilityError::Configuration(e.to_string()))?;
        let credentials = Arc::new(CredentialProvider::new(store, config.credentials));
        let gateway = RateLimitedGateway::new(
            Arc::new(transport),
            credentials,
            Arc::new(GatewayState::new(&config.gateway)),
            &config.gateway,
        );
        let fetcher = BatchFetcher::new(Arc::new(gateway), config.fetcher);

        info!("Availability engine connected to {}", config.gateway.base_url);
        Ok(Self::new(fetcher, config.engine))
    }

    // Loose availability for a set of listings, ordered by listing id
    pub async fn get_availability_for<S: AsRef<str>>(
        &self,
        listing_ids: &[S],
        window: StayWindow,
    ) -> Result<Vec<ListingAvailabilityResult>, AvailabilityError> {
        self.validate_window(&window)?;
        let listing_ids = clean_listing_ids(listing_ids)?;
        if listing_ids.is_empty() {
            return Err(AvailabilityError::InvalidInput(
                "at least one listing id is required".to_string(),
            ));
        }
        let key = BatchKey {
            listing_ids,
            window,
        };

        let pending = {
            let mut inflight = self.inner.inflight.lock();
            if let Some(cached) = self.inner.batch_cache.get(&key) {
                debug!("Batch cache hit for {} listings", key.listing_ids.len());
                return Ok(cached.as_ref().clone());
            }
            match inflight.get(&key) {
                Some(pending) => {
                    debug!("Joining in-flight batch for {} listings", key.listing_ids.len());
                    pending.clone()
                }
                None => {
                    let pending = self.start_batch(key.clone());
                    inflight.insert(key, pending.clone());
                    pending
                }
            }
        };

        Ok(pending.await.as_ref().clone())
    }

    // Runs on a spawned task so a caller dropping out does not cancel work
    // other callers are waiting on
    fn start_batch(&self, key: BatchKey) -> PendingBatch {
        self.inner.batches_started.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();

        let handle = tokio::spawn(async move {
            let guard = InflightGuard::new(Arc::clone(&inner), task_key.clone());
            let outcome = inner
                .fetcher
                .fetch_calendars(&task_key.listing_ids, &task_key.window)
                .await;

            let results: Vec<ListingAvailabilityResult> = task_key
                .listing_ids
                .iter()
                .map(|id| {
                    let days = outcome.calendars.get(id).map(Vec::as_slice).unwrap_or(&[]);
                    summarize_listing(id, days, &task_key.window)
                })
                .collect();
            let available = results
                .iter()
                .filter(|result| result.available == Some(true))
                .count();
            info!(
                "Availability batch done: {} listings, {} available, {} chunks failed",
                results.len(),
                available,
                outcome.failed_chunks
            );

            // A batch with failed chunks lives only for the degraded TTL
            guard.complete(|inner| {
                if outcome.is_complete() {
                    inner.batch_cache.insert(task_key.clone(), results)
                } else {
                    inner.batch_cache.insert_with_ttl(
                        task_key.clone(),
                        results,
                        inner.config.degraded_ttl(),
                    )
                }
            })
        });

        let listing_ids = key.listing_ids;
        async move {
            match handle.await {
                Ok(results) => results,
                Err(e) => {
                    warn!("Availability batch task failed: {}", e);
                    Arc::new(
                        listing_ids
                            .iter()
                            .map(|id| ListingAvailabilityResult::unknown(id.as_str()))
                            .collect(),
                    )
                }
            }
        }
        .boxed()
        .shared()
    }

    // Strict check right before a booking commitment. Upstream failure answers
    // false and is not cached.
    pub async fn check_strict_availability(
        &self,
        listing_id: &str,
        window: StayWindow,
    ) -> Result<bool, AvailabilityError> {
        self.validate_window(&window)?;
        let listing_id = listing_id.trim();
        if listing_id.is_empty() {
            return Err(AvailabilityError::InvalidInput(
                "listing id must not be empty".to_string(),
            ));
        }

        let key = (listing_id.to_string(), window);
        let days = match self.inner.detail_cache.get(&key) {
            Some(days) => days,
            None => match self
                .inner
                .fetcher
                .fetch_listing_calendar(listing_id, &window)
                .await
            {
                Ok(days) => self.inner.detail_cache.insert(key, days),
                Err(e) => {
                    warn!("Strict check for {} failed closed: {}", listing_id, e);
                    return Ok(false);
                }
            },
        };

        Ok(evaluate_range(&days, &window, EvaluationMode::Strict))
    }

    // In-flight computations keep running and may repopulate the cache
    pub fn clear_cache(&self) {
        self.inner.batch_cache.clear();
        self.inner.detail_cache.clear();
        info!("Availability caches cleared");
    }

    // Drops every cached batch containing the listing and its detail calendars
    pub fn invalidate_listing(&self, listing_id: &str) -> usize {
        let listing_id = listing_id.trim();
        let batches = self
            .inner
            .batch_cache
            .invalidate(|key| key.contains(listing_id));
        let details = self
            .inner
            .detail_cache
            .invalidate(|(id, _)| id == listing_id);
        debug!(
            "Invalidated {} batch and {} detail entries for {}",
            batches, details, listing_id
        );
        batches + details
    }

    pub fn cache_stats(&self) -> EngineStats {
        EngineStats {
            batch_cache: self.inner.batch_cache.stats(),
            detail_cache: self.inner.detail_cache.stats(),
            inflight_batches: self.inner.inflight.lock().len(),
            batches_started: self.inner.batches_started.load(Ordering::SeqCst),
            gateway: self.inner.fetcher.gateway().stats(),
        }
    }

    fn validate_window(&self, window: &StayWindow) -> Result<(), AvailabilityError> {
        if window.night_count() > self.inner.config.max_nights {
            return Err(AvailabilityError::InvalidInput(format!(
                "stay of {} nights exceeds the maximum of {}",
                window.night_count(),
                self.inner.config.max_nights
            )));
        }
        Ok(())
    }
}

fn clean_listing_ids<S: AsRef<str>>(listing_ids: &[S]) -> Result<Vec<String>, AvailabilityError> {
    let mut cleaned: Vec<String> = Vec::with_capacity(listing_ids.len());
    for id in listing_ids {
        let id = id.as_ref().trim();
        if id.is_empty() {
            continue;
        }
        // Upstream takes the batch as one comma-separated list
        if id.contains(',') {
            return Err(AvailabilityError::InvalidInput(format!(
                "listing id {:?} must not contain a comma",
                id
            )));
        }
        cleaned.push(id.to_string());
    }
    cleaned.sort();
    cleaned.dedup();
    Ok(cleaned)
}

// Removes the in-flight entry if the batch task unwinds before completing
struct InflightGuard {
    inner: Arc<EngineInner>,
    key: Option<BatchKey>,
}

impl InflightGuard {
    fn new(inner: Arc<EngineInner>, key: BatchKey) -> Self {
        Self {
            inner,
            key: Some(key),
        }
    }

    // Publishes and unregisters under one lock so no caller can miss both
    fn complete<T>(mut self, publish: impl FnOnce(&EngineInner) -> T) -> T {
        let mut inflight = self.inner.inflight.lock();
        let published = publish(&self.inner);
        if let Some(key) = self.key.take() {
            inflight.remove(&key);
        }
        published
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            warn!("Availability batch aborted, releasing in-flight entry");
            self.inner.inflight.lock().remove(&key);
        }
    }
}

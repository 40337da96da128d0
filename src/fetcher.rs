// Splits listing ids into chunks and pulls their calendars through the gateway.
// A failed chunk degrades to "no data" for its listings; siblings carry on.

use futures::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::calendar::{CalendarDay, StayWindow};
use crate::gateway::{GatewayRequest, RateLimitedGateway, UpstreamError};
use crate::normalizer::normalize_payload;
use crate::retry::{RetryConfig, RetryPolicy};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    pub chunk_size: usize,
    pub max_concurrency: usize,
    pub calendar_path: String,
    pub retry: RetryConfig,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            chunk_size: 20,
            max_concurrency: 3,
            calendar_path: "/listings/calendar".to_string(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct FetchOutcome {
    pub calendars: HashMap<String, Vec<CalendarDay>>,
    pub chunk_count: usize,
    pub failed_chunks: usize,
}

impl FetchOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed_chunks == 0
    }
}

pub struct BatchFetcher {
    gateway: Arc<RateLimitedGateway>,
    config: FetcherConfig,
    retry: RetryPolicy,
}

impl BatchFetcher {
    pub fn new(gateway: Arc<RateLimitedGateway>, config: FetcherConfig) -> Self {
        let retry = RetryPolicy::new(config.retry.clone());
        Self {
            gateway,
            config,
            retry,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn gateway(&self) -> &Arc<RateLimitedGateway> {
        &self.gateway
    }

    pub async fn fetch_calendars(&self, ids: &[String], window: &StayWindow) -> FetchOutcome {
        let mut outcome = FetchOutcome::default();
        if ids.is_empty() {
            return outcome;
        }

        // Owned chunks: this stream runs inside the engine's spawned batch task
        let chunks: Vec<Vec<String>> = ids
            .chunks(self.config.chunk_size.max(1))
            .map(<[String]>::to_vec)
            .collect();
        outcome.chunk_count = chunks.len();
        debug!(
            "Fetching {} listings in {} chunks for {}..{}",
            ids.len(),
            chunks.len(),
            window.check_in(),
            window.check_out()
        );

        let results: Vec<Result<HashMap<String, Vec<CalendarDay>>, UpstreamError>> =
            stream::iter(chunks)
                .map(|chunk| async move { self.fetch_chunk(&chunk, window).await })
                .buffer_unordered(self.config.max_concurrency.max(1))
                .collect()
                .await;

        for result in results {
            match result {
                Ok(calendars) => {
                    for (listing_id, days) in calendars {
                        outcome.calendars.entry(listing_id).or_default().extend(days);
                    }
                }
                Err(e) => {
                    outcome.failed_chunks += 1;
                    warn!("Calendar chunk degraded to empty: {}", e);
                }
            }
        }

        info!(
            "Fetched calendars for {}/{} listings ({} of {} chunks failed)",
            outcome.calendars.len(),
            ids.len(),
            outcome.failed_chunks,
            outcome.chunk_count
        );
        outcome
    }

    async fn fetch_chunk(
        &self,
        chunk: &[String],
        window: &StayWindow,
    ) -> Result<HashMap<String, Vec<CalendarDay>>, UpstreamError> {
        let request = GatewayRequest::get(self.config.calendar_path.as_str())
            .query("listingIds", chunk.join(","))
            .query("startDate", window.check_in().to_string())
            .query("endDate", window.last_night().to_string());
        let label = format!("calendar chunk of {} listings", chunk.len());

        let payload = self.fetch_json(&label, request).await?;
        // A one-listing chunk owns every unnamed day in the answer
        let fallback_id = match chunk {
            [only] => Some(only.as_str()),
            _ => None,
        };
        Ok(normalize_payload(&payload, fallback_id))
    }

    // Detail calendar for one listing, used right before a booking decision
    pub async fn fetch_listing_calendar(
        &self,
        listing_id: &str,
        window: &StayWindow,
    ) -> Result<Vec<CalendarDay>, UpstreamError> {
        let path = format!(
            "{}/{}",
            self.config.calendar_path.trim_end_matches('/'),
            listing_id
        );
        let request = GatewayRequest::get(path)
            .query("startDate", window.check_in().to_string())
            .query("endDate", window.last_night().to_string());
        let label = format!("calendar for listing {}", listing_id);

        let payload = self.fetch_json(&label, request).await?;
        let mut calendars = normalize_payload(&payload, Some(listing_id));
        Ok(calendars.remove(listing_id).unwrap_or_default())
    }

    async fn fetch_json(&self, label: &str, request: GatewayRequest) -> Result<Value, UpstreamError> {
        let gateway = &self.gateway;
        self.retry
            .run(label, || {
                let request = request.clone();
                async move { gateway.issue(request).await?.json() }
            })
            .await
    }
}

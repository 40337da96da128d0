// Villa availability aggregation and caching engine

pub mod cache;
pub mod calendar;
pub mod credentials;
pub mod engine;
pub mod fetcher;
pub mod gateway;
pub mod normalizer;
pub mod retry;
pub mod transport;

// Re-export key types for convenience
pub use cache::{CacheStats, CacheStatsReport, TtlCache};
pub use calendar::{
    evaluate_range, AvailabilityError, AvailabilityReason, CalendarDay, DayStatus,
    EvaluationMode, ListingAvailabilityResult, StayWindow,
};
pub use credentials::{
    CredentialConfig, CredentialError, CredentialProvider, FileTokenStore, StaticTokenStore,
    TokenStore,
};
pub use engine::{AvailabilityConfig, AvailabilityEngine, EngineConfig, EngineStats};
pub use fetcher::{BatchFetcher, FetchOutcome, FetcherConfig};
pub use gateway::{GatewayConfig, GatewayState, GatewayStats, RateLimitedGateway, UpstreamError};
pub use normalizer::{detect_shape, normalize_day, normalize_payload, ResponseShape};
pub use retry::{RetryConfig, RetryPolicy};
pub use transport::{HttpTransport, ReqwestTransport, TransportError, TransportResponse};

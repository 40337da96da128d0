use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{thread_rng, Rng};
use serde_json::{json, Value};
use std::sync::Arc;
use villa_availability::calendar::{evaluate_range, EvaluationMode, StayWindow};
use villa_availability::credentials::{CredentialConfig, CredentialProvider, StaticTokenStore};
use villa_availability::engine::{AvailabilityEngine, EngineConfig};
use villa_availability::fetcher::{BatchFetcher, FetcherConfig};
use villa_availability::gateway::{GatewayConfig, GatewayState, RateLimitedGateway};
use villa_availability::normalizer::normalize_payload;
use villa_availability::transport::{
    HttpTransport, TransportError, TransportResponse, UpstreamRequest,
};

// Listing-array payload covering `nights` days for each listing
fn calendar_payload(listings: usize, nights: usize) -> Value {
    let mut rng = thread_rng();
    let listings: Vec<Value> = (0..listings)
        .map(|listing| {
            let days: Vec<Value> = (0..nights)
                .map(|night| {
                    json!({
                        "date": format!("2026-{:02}-{:02}", 1 + night / 28, 1 + night % 28),
                        "price": { "amount": rng.gen_range(80.0..400.0) },
                        "availableUnits": rng.gen_range(0..3),
                        "cta": rng.gen_bool(0.1),
                        "minNights": rng.gen_range(1..4),
                    })
                })
                .collect();
            json!({ "listingId": format!("villa{}", listing), "days": days })
        })
        .collect();
    Value::Array(listings)
}

struct FixedCalendar {
    body: String,
}

#[async_trait]
impl HttpTransport for FixedCalendar {
    async fn send(&self, _request: UpstreamRequest) -> Result<TransportResponse, TransportError> {
        Ok(TransportResponse::new(200, self.body.clone()))
    }
}

pub fn normalizer_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("calendar_normalization");

    for listings in [1, 20, 100].iter() {
        let payload = calendar_payload(*listings, 28);
        group.bench_with_input(BenchmarkId::from_parameter(listings), &payload, |b, payload| {
            b.iter(|| black_box(normalize_payload(payload, None)))
        });
    }

    group.finish();
}

pub fn range_evaluation_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("range_evaluation");
    let calendars = normalize_payload(&calendar_payload(1, 84), None);
    let days = calendars.get("villa0").cloned().unwrap_or_default();

    for nights in [3, 14, 60].iter() {
        let check_in = NaiveDate::from_ymd_opt(2026, 1, 2).unwrap();
        let window = StayWindow::new(check_in, check_in + Duration::days(*nights)).unwrap();
        group.bench_with_input(BenchmarkId::new("strict", nights), &window, |b, window| {
            b.iter(|| black_box(evaluate_range(&days, window, EvaluationMode::Strict)))
        });
        group.bench_with_input(BenchmarkId::new("loose", nights), &window, |b, window| {
            b.iter(|| black_box(evaluate_range(&days, window, EvaluationMode::Loose)))
        });
    }

    group.finish();
}

pub fn engine_cache_hit_benchmark(c: &mut Criterion) {
    let gateway_config = GatewayConfig {
        min_spacing_ms: 0,
        burst_size: 1000,
        ..GatewayConfig::default()
    };
    let transport = Arc::new(FixedCalendar {
        body: calendar_payload(20, 28).to_string(),
    });
    let credentials = Arc::new(CredentialProvider::new(
        Arc::new(StaticTokenStore::new(Some("bench".to_string()))),
        CredentialConfig::default(),
    ));
    let gateway = RateLimitedGateway::new(
        transport,
        credentials,
        Arc::new(GatewayState::new(&gateway_config)),
        &gateway_config,
    );
    let engine = AvailabilityEngine::new(
        BatchFetcher::new(Arc::new(gateway), FetcherConfig::default()),
        EngineConfig::default(),
    );
    let listing_ids: Vec<String> = (0..20).map(|n| format!("villa{}", n)).collect();
    let window = StayWindow::parse("2026-01-05", "2026-01-12").unwrap();

    // Warm the batch cache once
    tokio_test::block_on(engine.get_availability_for(&listing_ids, window)).unwrap();

    c.bench_function("engine_batch_cache_hit", |b| {
        b.iter(|| {
            black_box(tokio_test::block_on(
                engine.get_availability_for(&listing_ids, window),
            ))
        })
    });
}

criterion_group!(
    benches,
    normalizer_benchmark,
    range_evaluation_benchmark,
    engine_cache_hit_benchmark
);
criterion_main!(benches);

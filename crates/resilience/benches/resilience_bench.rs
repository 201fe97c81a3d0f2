//! Resilience pipeline benchmarks
//!
//! Covers the hot paths every guarded call goes through: breaker admission,
//! token bucket consumption, backoff calculation and a full manager
//! execution with all stages enabled.
//!
//! Run with: `cargo bench --bench resilience_bench -p connector-resilience`

#![allow(clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use connector_resilience::testing::{FixedJitter, MockClock, TestFailure};
use connector_resilience::{
    BackpressureStrategy, CircuitBreaker, CircuitBreakerPolicy, PolicySetting, RateLimitPolicy,
    ResilienceManager, RetryExecutor, RetryPolicy, TokenBucket,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio::runtime::Builder as RuntimeBuilder;

// ============================================================================
// Circuit Breaker Benchmarks
// ============================================================================

fn bench_circuit_breaker_admission(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker_admission");

    group.bench_function("closed_success", |b| {
        let breaker = CircuitBreaker::new("bench", CircuitBreakerPolicy::default())
            .expect("default breaker policy is valid");
        b.iter(|| {
            black_box(breaker.may_proceed());
            breaker.on_success();
        });
    });

    group.bench_function("open_short_circuit", |b| {
        let policy = CircuitBreakerPolicy::builder()
            .failure_threshold(1)
            .recovery_timeout(Duration::from_secs(3600))
            .build()
            .expect("valid breaker policy for benchmarks");
        let breaker = CircuitBreaker::new("bench", policy).expect("breaker should build");
        breaker.on_failure(TestFailure::timeout().kind());

        b.iter(|| black_box(breaker.may_proceed()));
    });

    group.bench_function("open_half_open_close", |b| {
        let policy = CircuitBreakerPolicy::builder()
            .failure_threshold(3)
            .success_threshold(2)
            .recovery_timeout(Duration::from_millis(10))
            .build()
            .expect("valid breaker policy for benchmarks");
        b.iter(|| {
            let clock = MockClock::new();
            let breaker =
                CircuitBreaker::with_clock("bench", policy.clone(), Arc::new(clock.clone()))
                    .expect("breaker should build with mock clock");

            for _ in 0..3 {
                breaker.on_failure(TestFailure::connectivity().kind());
            }
            clock.advance(Duration::from_millis(10));
            for _ in 0..2 {
                black_box(breaker.may_proceed());
                breaker.on_success();
            }
            black_box(breaker.state());
        });
    });

    group.finish();
}

// ============================================================================
// Token Bucket Benchmarks
// ============================================================================

fn bench_token_bucket(c: &mut Criterion) {
    let mut group = c.benchmark_group("token_bucket");

    for capacity in [1u32, 100, 10_000] {
        group.bench_with_input(
            BenchmarkId::new("try_consume", capacity),
            &capacity,
            |b, &capacity| {
                let clock = MockClock::new();
                let bucket = TokenBucket::with_clock(capacity, 1000.0, Arc::new(clock.clone()))
                    .expect("valid bucket for benchmarks");
                b.iter(|| {
                    if !bucket.try_consume(1) {
                        clock.advance(Duration::from_millis(1));
                    }
                });
            },
        );
    }

    group.bench_function("time_until", |b| {
        let bucket = TokenBucket::with_clock(10, 2.5, Arc::new(MockClock::new()))
            .expect("valid bucket for benchmarks");
        bucket.try_consume(10);
        b.iter(|| black_box(bucket.time_until(black_box(3))));
    });

    group.finish();
}

// ============================================================================
// Retry Benchmarks
// ============================================================================

fn bench_retry_backoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry_backoff");
    let attempts = [0u32, 1, 5, 10, 64];

    for (name, jitter) in [("no_jitter", false), ("jitter", true)] {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(10))
            .max_delay(Duration::from_secs(30))
            .jitter(jitter)
            .build()
            .expect("valid retry policy for benchmarks");
        let executor = RetryExecutor::new(policy).expect("retry executor should build");

        group.bench_function(BenchmarkId::new("compute_delay", name), |b| {
            b.iter(|| {
                for attempt in attempts {
                    black_box(executor.compute_delay(attempt));
                }
            });
        });
    }

    group.finish();
}

// ============================================================================
// Manager Benchmarks
// ============================================================================

fn build_runtime() -> tokio::runtime::Runtime {
    RuntimeBuilder::new_current_thread()
        .enable_all()
        .build()
        .expect("tokio runtime should build for benchmarks")
}

fn bench_manager_execute(c: &mut Criterion) {
    let mut group = c.benchmark_group("manager_execute");
    let runtime = build_runtime();

    let manager = ResilienceManager::builder("bench")
        .retry(
            RetryPolicy::builder()
                .max_attempts(4)
                .initial_delay(Duration::ZERO)
                .max_delay(Duration::ZERO)
                .build()
                .expect("valid retry policy for benchmarks"),
        )
        .rate_limit(
            RateLimitPolicy::builder()
                .max_per_period(u32::MAX)
                .burst_size(u32::MAX)
                .per_key(true)
                .strategy(BackpressureStrategy::Drop)
                .build()
                .expect("valid rate limit policy for benchmarks"),
        )
        .recovery(PolicySetting::Disabled)
        .jitter(FixedJitter::new(0.0))
        .build()
        .expect("manager should build for benchmarks");

    group.bench_function("immediate_success", |b| {
        b.to_async(&runtime).iter(|| async {
            let result = manager
                .execute(|| async { Ok::<_, TestFailure>(1u32) }, "read", Some("tenant"))
                .await;
            if let Err(err) = result {
                panic!("manager success path failed: {err}");
            }
        });
    });

    group.bench_function("validation_failure", |b| {
        b.to_async(&runtime).iter(|| async {
            let result = manager
                .execute(|| async { Err::<u32, _>(TestFailure::validation()) }, "write", None)
                .await;
            let _result = black_box(result);
        });
    });

    group.finish();
}

criterion_group!(
    resilience,
    bench_circuit_breaker_admission,
    bench_token_bucket,
    bench_retry_backoff,
    bench_manager_execute
);
criterion_main!(resilience);

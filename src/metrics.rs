//! # Outbox health metrics
//!
//! Two gauges describe outbox health: how many stored notifications are
//! waiting, and how old the oldest one is. Both are exported as
//! OpenTelemetry observable gauges backed by atomics that a background
//! sampler task refreshes, so metric collection never runs queries on the
//! exporter's schedule.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::global;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::Result;
use crate::outbox;

/// Number of notifications currently waiting in the outbox
pub async fn outbox_depth(pool: &PgPool) -> Result<i64> {
    outbox::depth(pool).await
}

/// Age of the oldest waiting notification in milliseconds
pub async fn outbox_lag_ms(pool: &PgPool) -> Result<i64> {
    outbox::oldest_age_ms(pool).await
}

fn queue_len_metric(prefix: &str) -> String {
    format!("{prefix}.notifications-queue.len")
}

fn processing_lag_metric(prefix: &str) -> String {
    format!("{prefix}.notifications-queue.processing-lag")
}

/// Observable outbox gauges plus the sampler feeding them
pub struct OutboxMetrics {
    depth: Arc<AtomicU64>,
    lag_ms: Arc<AtomicU64>,
}

impl OutboxMetrics {
    /// Register the gauges under the given metric name prefix
    pub fn new(prefix: &str) -> Self {
        let meter = global::meter("pgbus");
        let depth = Arc::new(AtomicU64::new(0));
        let lag_ms = Arc::new(AtomicU64::new(0));

        let observed_depth = depth.clone();
        meter
            .u64_observable_gauge(queue_len_metric(prefix))
            .with_description("Stored notifications waiting in the outbox")
            .with_unit("items")
            .with_callback(move |observer| {
                observer.observe(observed_depth.load(Ordering::Relaxed), &[]);
            })
            .build();

        let observed_lag = lag_ms.clone();
        meter
            .u64_observable_gauge(processing_lag_metric(prefix))
            .with_description("Age of the oldest waiting notification")
            .with_unit("ms")
            .with_callback(move |observer| {
                observer.observe(observed_lag.load(Ordering::Relaxed), &[]);
            })
            .build();

        Self { depth, lag_ms }
    }

    /// Record a fresh sample
    pub fn record(&self, depth: u64, lag_ms: u64) {
        self.depth.store(depth, Ordering::Relaxed);
        self.lag_ms.store(lag_ms, Ordering::Relaxed);
    }

    /// Last sampled outbox depth
    pub fn depth(&self) -> u64 {
        self.depth.load(Ordering::Relaxed)
    }

    /// Last sampled processing lag in milliseconds
    pub fn lag_ms(&self) -> u64 {
        self.lag_ms.load(Ordering::Relaxed)
    }

    /// Spawn a task sampling the outbox on a fixed interval. Query
    /// failures are logged and the previous sample stands.
    pub fn spawn_sampler(self: Arc<Self>, pool: PgPool, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match sample(&pool).await {
                    Ok((depth, lag_ms)) => self.record(depth, lag_ms),
                    Err(err) => warn!(error = %err, "outbox metrics sample failed"),
                }
            }
        })
    }
}

async fn sample(pool: &PgPool) -> Result<(u64, u64)> {
    let depth = outbox::depth(pool).await?.max(0) as u64;
    let lag_ms = outbox::oldest_age_ms(pool).await?.max(0) as u64;
    Ok((depth, lag_ms))
}

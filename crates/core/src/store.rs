//! Boundary to the external event/session store.
//!
//! The engine only reads through [`EventStore`]; lifecycle tracking writes
//! through [`TrackingSink`]. [`StoreClient`] wraps a store so every call carries
//! a timeout and bounded retry, surfacing failures as retryable
//! [`FunnelError::DataUnavailable`].

use crate::config::StoreConfig;
use crate::error::{FunnelError, FunnelResult};
use crate::types::{Event, Order, Period, QueryFilters, Session, Submission};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Read capability over persisted events, sessions, orders and submissions.
/// Every call returns the complete result for the requested period.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Events created inside `period` whose session passes `filters`.
    async fn fetch_events(
        &self,
        period: &Period,
        filters: &QueryFilters,
    ) -> anyhow::Result<Vec<Event>>;

    /// Sessions created inside `period` that pass `filters`.
    async fn fetch_sessions(
        &self,
        period: &Period,
        filters: &QueryFilters,
    ) -> anyhow::Result<Vec<Session>>;

    async fn fetch_orders(&self, period: &Period) -> anyhow::Result<Vec<Order>>;

    async fn fetch_submissions(&self, ids: &[String]) -> anyhow::Result<Vec<Submission>>;
}

/// Write capability used by the session tracker.
#[async_trait]
pub trait TrackingSink: Send + Sync {
    async fn append_event(&self, event: Event) -> anyhow::Result<()>;

    async fn upsert_session(&self, session: Session) -> anyhow::Result<()>;

    async fn get_session(&self, session_id: &str) -> anyhow::Result<Option<Session>>;
}

/// Timeout- and retry-aware handle over an [`EventStore`].
#[derive(Clone)]
pub struct StoreClient {
    inner: Arc<dyn EventStore>,
    timeout: Duration,
    max_attempts: u32,
    backoff: Duration,
}

impl std::fmt::Debug for StoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreClient")
            .field("timeout", &self.timeout)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl StoreClient {
    pub fn new(inner: Arc<dyn EventStore>, config: &StoreConfig) -> Self {
        Self {
            inner,
            timeout: Duration::from_millis(config.query_timeout_ms),
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    pub async fn events(&self, period: &Period, filters: &QueryFilters) -> FunnelResult<Vec<Event>> {
        self.call("fetch_events", || self.inner.fetch_events(period, filters))
            .await
    }

    pub async fn sessions(
        &self,
        period: &Period,
        filters: &QueryFilters,
    ) -> FunnelResult<Vec<Session>> {
        self.call("fetch_sessions", || self.inner.fetch_sessions(period, filters))
            .await
    }

    pub async fn orders(&self, period: &Period) -> FunnelResult<Vec<Order>> {
        self.call("fetch_orders", || self.inner.fetch_orders(period))
            .await
    }

    pub async fn submissions(&self, ids: &[String]) -> FunnelResult<Vec<Submission>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.call("fetch_submissions", || self.inner.fetch_submissions(ids))
            .await
    }

    async fn call<T, F, Fut>(&self, op: &'static str, mut f: F) -> FunnelResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut delay = self.backoff;
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            match tokio::time::timeout(self.timeout, f()).await {
                Ok(Ok(rows)) => {
                    debug!(op, attempt, "Store call succeeded");
                    return Ok(rows);
                }
                Ok(Err(e)) => {
                    metrics::counter!("store.errors", "op" => op).increment(1);
                    warn!(op, attempt, error = %e, "Store call failed");
                    last_error = e.to_string();
                }
                Err(_) => {
                    metrics::counter!("store.timeouts", "op" => op).increment(1);
                    warn!(op, attempt, timeout_ms = self.timeout.as_millis() as u64, "Store call timed out");
                    last_error = format!("{op} timed out after {}ms", self.timeout.as_millis());
                }
            }

            if attempt < self.max_attempts {
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }

        Err(FunnelError::DataUnavailable(last_error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Store that fails a fixed number of times, then sleeps or answers.
    struct FlakyStore {
        failures_left: AtomicU32,
        calls: AtomicU32,
        latency: Duration,
    }

    impl FlakyStore {
        fn new(failures: u32, latency: Duration) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
                latency,
            }
        }
    }

    #[async_trait]
    impl EventStore for FlakyStore {
        async fn fetch_events(&self, _: &Period, _: &QueryFilters) -> anyhow::Result<Vec<Event>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("connection reset");
            }
            tokio::time::sleep(self.latency).await;
            Ok(Vec::new())
        }

        async fn fetch_sessions(
            &self,
            _: &Period,
            _: &QueryFilters,
        ) -> anyhow::Result<Vec<Session>> {
            Ok(Vec::new())
        }

        async fn fetch_orders(&self, _: &Period) -> anyhow::Result<Vec<Order>> {
            Ok(Vec::new())
        }

        async fn fetch_submissions(&self, _: &[String]) -> anyhow::Result<Vec<Submission>> {
            Ok(Vec::new())
        }
    }

    fn config(timeout_ms: u64, attempts: u32) -> StoreConfig {
        StoreConfig {
            query_timeout_ms: timeout_ms,
            max_attempts: attempts,
            retry_backoff_ms: 1,
        }
    }

    fn period() -> Period {
        let end = chrono::Utc::now();
        Period {
            start: end - chrono::Duration::days(1),
            end,
        }
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let store = Arc::new(FlakyStore::new(2, Duration::ZERO));
        let client = StoreClient::new(store.clone(), &config(1000, 3));
        let rows = client.events(&period(), &QueryFilters::default()).await;
        assert!(rows.is_ok());
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeout_surfaces_as_data_unavailable() {
        let store = Arc::new(FlakyStore::new(0, Duration::from_millis(200)));
        let client = StoreClient::new(store, &config(10, 2));
        let err = client
            .events(&period(), &QueryFilters::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FunnelError::DataUnavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_empty_submission_lookup_skips_store() {
        let store = Arc::new(FlakyStore::new(0, Duration::ZERO));
        let client = StoreClient::new(store, &config(1000, 1));
        assert!(client.submissions(&[]).await.unwrap().is_empty());
    }
}

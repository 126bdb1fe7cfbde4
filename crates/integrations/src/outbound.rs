//! Outbound notifications: lifecycle milestones delivered to an external
//! endpoint through a bounded queue and a background worker.
//!
//! Enqueueing never blocks: when the queue is full the notification is
//! dropped and counted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use funnel_core::config::NotificationConfig;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    QuizCompleted,
    EmailCaptured,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::QuizCompleted => "quiz_completed",
            NotificationKind::EmailCaptured => "email_captured",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub kind: NotificationKind,
    pub session_id: String,
    pub email: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(kind: NotificationKind, session_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            session_id: session_id.into(),
            email: None,
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn with_email(mut self, email: Option<String>) -> Self {
        self.email = email;
        self
    }
}

/// Exponential backoff between delivery attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &NotificationConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_multiplier: config.backoff_multiplier.max(1.0),
        }
    }

    /// Delay before retry number `retry` (0-based), capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(retry.min(i32::MAX as u32) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let max = self.max_delay.as_millis() as f64;
        if !millis.is_finite() || millis >= max {
            self.max_delay
        } else {
            Duration::from_millis(millis as u64)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&NotificationConfig::default())
    }
}

#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// POSTs each notification as JSON to a fixed endpoint.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("funnel-insights/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl NotificationTransport for HttpTransport {
    async fn deliver(&self, notification: &Notification) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("X-Notification-Kind", notification.kind.as_str())
            .json(notification)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("endpoint responded with {}", status.as_u16());
        }
        Ok(())
    }
}

/// Used when no endpoint is configured: records the milestone in the log.
pub struct LogTransport;

#[async_trait]
impl NotificationTransport for LogTransport {
    async fn deliver(&self, notification: &Notification) -> anyhow::Result<()> {
        info!(
            id = %notification.id,
            kind = notification.kind.as_str(),
            session_id = %notification.session_id,
            "Notification recorded"
        );
        Ok(())
    }
}

/// Build the transport the configuration asks for.
pub fn transport_from_config(config: &NotificationConfig) -> anyhow::Result<Arc<dyn NotificationTransport>> {
    match config.endpoint.as_deref().filter(|e| !e.trim().is_empty()) {
        Some(endpoint) => Ok(Arc::new(HttpTransport::new(
            endpoint,
            Duration::from_millis(config.delivery_timeout_ms),
        )?)),
        None => Ok(Arc::new(LogTransport)),
    }
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    retries: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> OutboundStats {
        OutboundStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundStats {
    pub enqueued: u64,
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
    pub retries: u64,
}

#[derive(Clone)]
pub struct OutboundQueue {
    sender: mpsc::Sender<Notification>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for OutboundQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundQueue")
            .field("stats", &self.stats())
            .finish()
    }
}

impl OutboundQueue {
    /// Create the queue and spawn its delivery worker. The worker exits once
    /// every clone of the queue has been dropped and the backlog is drained.
    pub fn start(
        transport: Arc<dyn NotificationTransport>,
        capacity: usize,
        policy: RetryPolicy,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let counters = Arc::new(Counters::default());

        let worker = DeliveryWorker {
            transport,
            policy,
            counters: counters.clone(),
        };
        let handle = tokio::spawn(worker.run(receiver));

        info!(capacity, "Outbound notification queue started");
        (Self { sender, counters }, handle)
    }

    pub fn from_config(config: &NotificationConfig) -> anyhow::Result<(Self, JoinHandle<()>)> {
        let transport = transport_from_config(config)?;
        Ok(Self::start(
            transport,
            config.queue_capacity,
            RetryPolicy::from_config(config),
        ))
    }

    /// Hand a notification to the worker. Returns `false` if it was dropped.
    pub fn enqueue(&self, notification: Notification) -> bool {
        match self.sender.try_send(notification) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("outbound.enqueued").increment(1);
                true
            }
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("outbound.dropped").increment(1);
                warn!("Outbound notification dropped: {}", e);
                false
            }
        }
    }

    pub fn stats(&self) -> OutboundStats {
        self.counters.snapshot()
    }
}

struct DeliveryWorker {
    transport: Arc<dyn NotificationTransport>,
    policy: RetryPolicy,
    counters: Arc<Counters>,
}

impl DeliveryWorker {
    async fn run(self, mut receiver: mpsc::Receiver<Notification>) {
        while let Some(notification) = receiver.recv().await {
            self.deliver(&notification).await;
        }
        debug!("Outbound queue closed, worker exiting");
    }

    async fn deliver(&self, notification: &Notification) {
        let mut retry = 0;
        loop {
            match self.transport.deliver(notification).await {
                Ok(()) => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("outbound.delivered").increment(1);
                    debug!(id = %notification.id, attempts = retry + 1, "Notification delivered");
                    return;
                }
                Err(e) if retry < self.policy.max_retries => {
                    let delay = self.policy.delay_for(retry);
                    warn!(
                        id = %notification.id,
                        attempt = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Notification delivery failed, retrying"
                    );
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(e) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("outbound.failed").increment(1);
                    error!(
                        id = %notification.id,
                        kind = notification.kind.as_str(),
                        attempts = retry + 1,
                        error = %e,
                        "Notification delivery gave up"
                    );
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Semaphore;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    fn note(session: &str) -> Notification {
        Notification::new(
            NotificationKind::QuizCompleted,
            session,
            serde_json::json!({"score": 9}),
        )
    }

    /// Close the queue, wait for the backlog to drain and return the counters.
    async fn drain(queue: OutboundQueue, worker: JoinHandle<()>) -> OutboundStats {
        let counters = queue.counters.clone();
        drop(queue);
        worker.await.unwrap();
        counters.snapshot()
    }

    /// Fails the first `failures` calls, then succeeds.
    struct Flaky {
        failures: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl NotificationTransport for Flaky {
        async fn deliver(&self, _: &Notification) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("503 from endpoint");
            }
            Ok(())
        }
    }

    /// Blocks every delivery until a permit is released.
    struct Gated(Arc<Semaphore>);

    #[async_trait]
    impl NotificationTransport for Gated {
        async fn deliver(&self, _: &Notification) -> anyhow::Result<()> {
            let permit = self.0.acquire().await?;
            permit.forget();
            Ok(())
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(3000),
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(3000));
        assert_eq!(policy.delay_for(60), Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn test_retries_until_delivered() {
        let transport = Arc::new(Flaky {
            failures: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        });
        let (queue, worker) = OutboundQueue::start(transport.clone(), 16, fast_policy(5));

        assert!(queue.enqueue(note("s1")));
        let stats = drain(queue, worker).await;

        assert_eq!(stats.enqueued, 1);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.failed, 0);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let transport = Arc::new(Flaky {
            failures: AtomicU32::new(u32::MAX),
            calls: AtomicU32::new(0),
        });
        let (queue, worker) = OutboundQueue::start(transport.clone(), 16, fast_policy(3));
        queue.enqueue(note("s1"));
        let stats = drain(queue, worker).await;

        assert_eq!(stats.failed, 1);
        assert_eq!(stats.delivered, 0);
        assert_eq!(stats.retries, 3);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let gate = Arc::new(Semaphore::new(0));
        let (queue, _worker) = OutboundQueue::start(Arc::new(Gated(gate.clone())), 1, fast_policy(0));

        // First is taken by the worker and parks on the gate, second fills
        // the single slot, the rest are dropped.
        queue.enqueue(note("s1"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let accepted = (2..6).filter(|i| queue.enqueue(note(&format!("s{i}")))).count();

        assert_eq!(accepted, 1);
        let stats = queue.stats();
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.dropped, 3);

        gate.add_permits(2);
    }

    #[test]
    fn test_transport_selection() {
        let mut config = NotificationConfig::default();
        assert!(transport_from_config(&config).is_ok());
        config.endpoint = Some("http://127.0.0.1:9/hooks".into());
        assert!(transport_from_config(&config).is_ok());
    }
}

//! Stale-window cancellation.
//!
//! A [`WindowScope`] belongs to one consumer (a dashboard view, an API client).
//! Each new period request takes a [`WindowTicket`]; once a newer ticket has
//! been issued, results still in flight under the older one are discarded
//! with [`FunnelError::Cancelled`].

use funnel_core::{FunnelError, FunnelResult};
use std::future::Future;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug)]
pub struct WindowScope {
    generation: watch::Sender<u64>,
}

impl WindowScope {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self { generation }
    }

    /// Start a new window, superseding every ticket issued before it.
    pub fn begin(&self) -> WindowTicket {
        let mut current = 0;
        self.generation.send_modify(|g| {
            *g += 1;
            current = *g;
        });
        WindowTicket {
            generation: current,
            watcher: self.generation.subscribe(),
        }
    }

    /// Convenience for `begin().run(fut)`.
    pub async fn run<T, F>(&self, fut: F) -> FunnelResult<T>
    where
        F: Future<Output = FunnelResult<T>>,
    {
        self.begin().run(fut).await
    }
}

impl Default for WindowScope {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct WindowTicket {
    generation: u64,
    watcher: watch::Receiver<u64>,
}

impl WindowTicket {
    pub fn is_current(&self) -> bool {
        *self.watcher.borrow() == self.generation
    }

    /// Drive `fut` to completion unless the window is superseded first. A
    /// result that lands after supersession is dropped as well.
    pub async fn run<T, F>(mut self, fut: F) -> FunnelResult<T>
    where
        F: Future<Output = FunnelResult<T>>,
    {
        let generation = self.generation;
        let outcome = tokio::select! {
            result = fut => Some(result),
            _ = superseded(&mut self.watcher, generation) => None,
        };

        match outcome {
            Some(result) if self.is_current() => result,
            _ => {
                debug!(generation, "Discarding result for superseded window");
                metrics::counter!("funnel.windows_cancelled").increment(1);
                Err(FunnelError::Cancelled)
            }
        }
    }
}

async fn superseded(watcher: &mut watch::Receiver<u64>, generation: u64) {
    loop {
        if *watcher.borrow_and_update() != generation {
            return;
        }
        if watcher.changed().await.is_err() {
            // Scope dropped; nothing can supersede this ticket any more.
            std::future::pending::<()>().await;
        }
    }
}

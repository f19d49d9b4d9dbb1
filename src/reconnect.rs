//! Debounced reconnection.
//!
//! A [`ReconnectScheduler`] runs at most one delayed reconnect action at a
//! time. Requests arriving while one is pending are dropped, so a burst of
//! link-loss notifications produces a single reconnect attempt.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::Mutex, task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// The single scheduled-but-not-yet-started reconnect
#[derive(Debug)]
struct PendingReconnect {
    id: u64,
    handle: JoinHandle<()>,
}

/// Schedules reconnect actions after a fixed delay, one at a time
#[derive(Debug)]
pub struct ReconnectScheduler {
    delay: Duration,
    pending: Arc<Mutex<Option<PendingReconnect>>>,
    shutdown: CancellationToken,
    next_id: AtomicU64,
}

impl ReconnectScheduler {
    /// Create a scheduler that waits `delay` before each action
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self::with_shutdown(delay, CancellationToken::new())
    }

    /// Create a scheduler bound to an existing shutdown token
    #[must_use]
    pub fn with_shutdown(delay: Duration, shutdown: CancellationToken) -> Self {
        Self {
            delay,
            pending: Arc::new(Mutex::new(None)),
            shutdown,
            next_id: AtomicU64::new(0),
        }
    }

    /// Delay applied before each action
    #[must_use]
    pub const fn delay(&self) -> Duration {
        self.delay
    }

    /// Token that stops pending and future actions
    #[must_use]
    pub const fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Run `action` after the delay unless one is already pending
    ///
    /// Returns `false` when the request was dropped, either because an action
    /// is pending or because the scheduler was shut down. The pending slot is
    /// cleared right before the action starts, so a link loss observed while
    /// the action runs can schedule the next attempt.
    pub async fn schedule<F, Fut>(&self, action: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            debug!("Shutting down, reconnect not scheduled");
            return false;
        }

        let mut pending = self.pending.lock().await;
        if pending.is_some() {
            debug!("Reconnect already pending, skipping");
            return false;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::clone(&self.pending);
        let shutdown = self.shutdown.clone();
        let delay = self.delay;

        let handle = tokio::spawn(async move {
            let cancelled = tokio::select! {
                () = shutdown.cancelled() => true,
                () = sleep(delay) => false,
            };

            {
                let mut pending = slot.lock().await;
                if pending.as_ref().is_some_and(|p| p.id == id) {
                    *pending = None;
                }
            }

            if cancelled || shutdown.is_cancelled() {
                debug!("Shutting down, reconnect abandoned");
                return;
            }

            info!("Reconnecting after {:?}", delay);
            action().await;
        });

        debug!("Reconnect scheduled in {:?}", self.delay);
        *pending = Some(PendingReconnect { id, handle });
        true
    }

    /// Drop the pending action, if any
    pub async fn cancel(&self) -> bool {
        match self.pending.lock().await.take() {
            Some(pending) => {
                pending.handle.abort();
                debug!("Pending reconnect cancelled");
                true
            }
            None => false,
        }
    }

    /// Whether an action is waiting for its delay to elapse
    pub async fn is_pending(&self) -> bool {
        self.pending.lock().await.is_some()
    }

    /// Cancel the pending action and refuse any later one
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.cancel().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn bump(count: &Arc<AtomicU32>) -> impl FnOnce() -> std::future::Ready<()> + Send + 'static {
        let count = Arc::clone(count);
        move || {
            count.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_action_runs_after_delay() {
        let scheduler = ReconnectScheduler::new(Duration::from_secs(5));
        let count = Arc::new(AtomicU32::new(0));

        assert!(scheduler.schedule(bump(&count)).await);
        assert!(scheduler.is_pending().await);

        sleep(Duration::from_millis(4_900)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_pending().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_are_debounced() {
        let scheduler = ReconnectScheduler::new(Duration::from_secs(5));
        let count = Arc::new(AtomicU32::new(0));

        assert!(scheduler.schedule(bump(&count)).await);
        sleep(Duration::from_millis(200)).await;
        assert!(!scheduler.schedule(bump(&count)).await);

        sleep(Duration::from_secs(6)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Slot is free again once the action started
        assert!(scheduler.schedule(bump(&count)).await);
        sleep(Duration::from_secs(6)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_pending_action() {
        let scheduler = ReconnectScheduler::new(Duration::from_secs(5));
        let count = Arc::new(AtomicU32::new(0));

        assert!(!scheduler.cancel().await);
        assert!(scheduler.schedule(bump(&count)).await);
        assert!(scheduler.cancel().await);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!scheduler.is_pending().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_refuses_new_actions() {
        let token = CancellationToken::new();
        let scheduler = ReconnectScheduler::with_shutdown(Duration::from_secs(5), token.clone());
        let count = Arc::new(AtomicU32::new(0));

        assert!(scheduler.schedule(bump(&count)).await);
        scheduler.shutdown().await;
        assert!(token.is_cancelled());
        assert!(!scheduler.schedule(bump(&count)).await);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_token_stops_waiting_action() {
        let scheduler = ReconnectScheduler::new(Duration::from_secs(5));
        let count = Arc::new(AtomicU32::new(0));

        assert!(scheduler.schedule(bump(&count)).await);
        scheduler.shutdown_token().cancel();

        sleep(Duration::from_millis(10)).await;
        assert!(!scheduler.is_pending().await);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}

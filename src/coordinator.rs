//! Snapshot cache and refresh loop.
//!
//! [`DataCoordinator`] owns the single authoritative [`TelemetrySnapshot`] and
//! the connected flag. Pushed telemetry replaces the snapshot as soon as it
//! arrives; a fixed-interval poll only tries to restore a lost link and
//! otherwise keeps serving the last snapshot.

use async_trait::async_trait;
use futures::future::{BoxFuture, Fuse, FusedFuture, FutureExt};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::watch,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    client::{ClientEvent, EventReceiver, TelemetryClient},
    connection::{ConnectOutcome, ConnectionManager},
    types::{ConnectionParams, ConnectionState, TelemetrySnapshot},
};

/// Receives link events observed by the coordinator loop
#[async_trait]
pub trait LinkObserver: Send + Sync {
    /// The client reported that the link dropped
    async fn on_link_lost(&self, need_connect: bool);

    /// A poll or pushed telemetry brought the link back
    async fn on_link_restored(&self);
}

/// Keeps the latest snapshot and connected flag for one device
pub struct DataCoordinator<C> {
    manager: Arc<ConnectionManager<C>>,
    snapshot_tx: watch::Sender<Arc<TelemetrySnapshot>>,
    connected_tx: watch::Sender<bool>,
    poll_interval: Duration,
    connect_timeout: Duration,
}

impl<C: TelemetryClient> DataCoordinator<C> {
    /// Create a coordinator serving an empty snapshot
    #[must_use]
    pub fn new(manager: Arc<ConnectionManager<C>>, params: &ConnectionParams) -> Self {
        let connected = manager.state() == ConnectionState::Connected;
        let (snapshot_tx, _) = watch::channel(Arc::new(TelemetrySnapshot::default()));
        let (connected_tx, _) = watch::channel(connected);
        Self {
            manager,
            snapshot_tx,
            connected_tx,
            poll_interval: params.poll_interval(),
            connect_timeout: params.connect_timeout(),
        }
    }

    /// The connection manager polled for reconnects
    #[must_use]
    pub const fn manager(&self) -> &Arc<ConnectionManager<C>> {
        &self.manager
    }

    /// Interval between polls
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Replace the snapshot with freshly pushed telemetry
    ///
    /// Returns `true` when the telemetry flipped the connected flag back on.
    pub fn publish(&self, snapshot: TelemetrySnapshot) -> bool {
        debug!(
            "Received {} values from {}",
            snapshot.len(),
            self.manager.address()
        );
        let restored = self.mark_connected();
        self.snapshot_tx.send_replace(Arc::new(snapshot));
        restored
    }

    /// Poll once: reconnect if the link is down
    ///
    /// Returns `true` when this call re-established the link. A failed
    /// reconnect is logged and the last snapshot keeps being served. A link
    /// that was closed on purpose is left down.
    pub async fn refresh(&self) -> bool {
        if self.manager.state() == ConnectionState::Connected {
            self.mark_connected();
            return false;
        }
        if self.manager.is_released() {
            debug!("{} was disconnected on purpose, not polling", self.manager.address());
            return false;
        }

        match self.manager.connect(self.connect_timeout).await {
            Ok(ConnectOutcome::AlreadyConnected) => {
                self.mark_connected();
                false
            }
            Ok(_) => {
                info!("Link to {} restored", self.manager.address());
                self.mark_connected();
                true
            }
            Err(e) => {
                warn!(
                    "Could not reconnect to {}, serving last known data: {}",
                    self.manager.address(),
                    e
                );
                false
            }
        }
    }

    /// Flip the connected flag off; returns whether it changed
    pub fn connection_lost(&self) -> bool {
        self.set_connected(false)
    }

    /// Flip the connected flag on; returns whether it changed
    pub fn mark_connected(&self) -> bool {
        self.set_connected(true)
    }

    fn set_connected(&self, connected: bool) -> bool {
        self.connected_tx.send_if_modified(|current| {
            let changed = *current != connected;
            *current = connected;
            changed
        })
    }

    /// Current connected flag
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.connected_tx.borrow()
    }

    /// Latest snapshot; empty until the first telemetry arrives
    #[must_use]
    pub fn snapshot(&self) -> Arc<TelemetrySnapshot> {
        Arc::clone(&self.snapshot_tx.borrow())
    }

    /// Receive every published snapshot
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<TelemetrySnapshot>> {
        self.snapshot_tx.subscribe()
    }

    /// Receive connected flag changes
    #[must_use]
    pub fn subscribe_connection(&self) -> watch::Receiver<bool> {
        self.connected_tx.subscribe()
    }

    /// Drive the coordinator until `shutdown` is cancelled
    ///
    /// This is the only consumer of the client's events. The first poll runs
    /// one interval after start. A poll's reconnect attempt runs alongside
    /// event handling, and ticks are skipped while it is in flight. If the
    /// event channel closes, polling goes on.
    pub async fn run<O>(&self, mut events: EventReceiver, observer: &O, shutdown: CancellationToken)
    where
        O: LinkObserver + ?Sized,
    {
        let mut ticker = interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;

        let mut poll: Fuse<BoxFuture<'_, bool>> = Fuse::terminated();

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break,

                event = events.recv(), if events_open => match event {
                    Some(ClientEvent::Telemetry(snapshot)) => {
                        if self.publish(snapshot) {
                            observer.on_link_restored().await;
                        }
                    }
                    Some(ClientEvent::Disconnected { need_connect }) => {
                        observer.on_link_lost(need_connect).await;
                    }
                    None => {
                        debug!("Event channel for {} closed", self.manager.address());
                        events_open = false;
                    }
                },

                restored = &mut poll, if !poll.is_terminated() => {
                    if restored {
                        observer.on_link_restored().await;
                    }
                }

                _ = ticker.tick() => {
                    if poll.is_terminated() {
                        poll = self.refresh().boxed().fuse();
                    } else {
                        debug!("Previous poll of {} still running", self.manager.address());
                    }
                }
            }
        }

        debug!("Coordinator for {} stopped", self.manager.address());
    }
}

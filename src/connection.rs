use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::{
    client::TelemetryClient,
    error::{FtmsError, Result},
    types::{ConnectionState, DeviceConnection},
};

/// Result of a successful [`ConnectionManager::connect`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Session opened with every characteristic present
    Connected,
    /// Session opened, but some optional capability is missing
    Degraded {
        /// What the device lacks
        reason: String,
    },
    /// A session was already open; nothing was done
    AlreadyConnected,
}

/// Classification of a link-loss notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLoss {
    /// The link dropped because it was asked to
    Intentional,
    /// The link dropped on its own
    Unexpected,
}

/// Owns the connect/disconnect lifecycle of one telemetry client
///
/// Connect and disconnect attempts are serialized. Link-loss notifications
/// are applied immediately, even while a connect is in flight: whichever
/// transition is observed last wins.
pub struct ConnectionManager<C> {
    client: Arc<C>,
    connection: RwLock<DeviceConnection>,
    transition: Mutex<()>,
    state_tx: watch::Sender<ConnectionState>,
    /// Set when the link was closed on purpose, cleared by the next connect
    released: AtomicBool,
}

impl<C: TelemetryClient> ConnectionManager<C> {
    /// Create a manager in the `Disconnected` state
    #[must_use]
    pub fn new(client: Arc<C>) -> Self {
        let connection = DeviceConnection::new(client.address());
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            client,
            connection: RwLock::new(connection),
            transition: Mutex::new(()),
            state_tx,
            released: AtomicBool::new(false),
        }
    }

    /// The managed client
    #[must_use]
    pub const fn client(&self) -> &Arc<C> {
        &self.client
    }

    /// Device address
    #[must_use]
    pub fn address(&self) -> &str {
        self.client.address()
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Whether the link was closed on purpose and should stay down
    ///
    /// Background recovery must not reopen a released link; only an explicit
    /// [`connect`](Self::connect) does.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Snapshot of the connection record
    pub async fn connection(&self) -> DeviceConnection {
        self.connection.read().await.clone()
    }

    /// Receive every state change
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    async fn set_state(&self, state: ConnectionState) {
        let mut connection = self.connection.write().await;
        connection.state = state;
        self.state_tx.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    async fn settle(&self, state: ConnectionState, last_error: Option<String>) {
        self.connection.write().await.last_error = last_error;
        self.set_state(state).await;
    }

    /// Open a session, giving up after `timeout`
    ///
    /// A missing optional characteristic still counts as connected and is
    /// reported as [`ConnectOutcome::Degraded`]. The manager never retries on
    /// its own.
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::ConnectTimeout`] when the budget is exceeded,
    /// [`FtmsError::ProtocolMismatch`] when the peer is not a fitness machine,
    /// and [`FtmsError::ConnectFailed`] for any other failure. The state is
    /// `Disconnected` afterwards and any half-open session is released.
    pub async fn connect(&self, timeout: Duration) -> Result<ConnectOutcome> {
        let _transition = self.transition.lock().await;
        self.released.store(false, Ordering::SeqCst);

        if self.state() == ConnectionState::Connected {
            debug!("{} is already connected", self.address());
            return Ok(ConnectOutcome::AlreadyConnected);
        }

        self.set_state(ConnectionState::Connecting).await;
        debug!("Connecting to {} (timeout {:?})", self.address(), timeout);

        let failure = match tokio::time::timeout(timeout, self.client.connect()).await {
            Ok(Ok(())) => {
                self.settle(ConnectionState::Connected, None).await;
                info!("Connected to {}", self.address());
                return Ok(ConnectOutcome::Connected);
            }
            Ok(Err(e)) if e.is_soft() => {
                warn!(
                    "Device {} does not support some characteristics, continuing anyway: {}",
                    self.address(),
                    e
                );
                let reason = e.to_string();
                self.settle(ConnectionState::Connected, Some(reason.clone()))
                    .await;
                return Ok(ConnectOutcome::Degraded { reason });
            }
            Ok(Err(e)) => self.classify(e),
            Err(_) => FtmsError::ConnectTimeout {
                address: self.address().to_string(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            },
        };

        error!("Connection error: {}", failure);
        if let Err(e) = self.client.disconnect().await {
            debug!("Releasing failed session to {}: {}", self.address(), e);
        }
        self.settle(ConnectionState::Disconnected, Some(failure.to_string()))
            .await;
        Err(failure)
    }

    fn classify(&self, error: FtmsError) -> FtmsError {
        match error {
            FtmsError::ProtocolMismatch { .. }
            | FtmsError::ConnectFailed { .. }
            | FtmsError::ConnectTimeout { .. } => error,
            other => FtmsError::ConnectFailed {
                address: self.address().to_string(),
                reason: other.to_string(),
            },
        }
    }

    /// Close the session; safe to call in any state, any number of times
    ///
    /// # Errors
    ///
    /// Returns the client's error if it failed to release the session. The
    /// state is `Disconnected` either way.
    pub async fn disconnect(&self) -> Result<()> {
        let _transition = self.transition.lock().await;
        self.released.store(true, Ordering::SeqCst);

        let result = self.client.disconnect().await;
        if let Err(e) = &result {
            warn!("Error while disconnecting from {}: {}", self.address(), e);
        }
        self.set_state(ConnectionState::Disconnected).await;
        debug!("Disconnected from {}", self.address());
        result
    }

    /// Record a link-loss notification from the client
    ///
    /// `need_connect` is the client's flag at the time the link dropped. Only
    /// an unexpected loss moves the state to `Reconnecting`.
    pub async fn link_lost(&self, need_connect: bool) -> LinkLoss {
        if need_connect {
            warn!("Device {} disconnected unexpectedly", self.address());
            let reason = FtmsError::TransientDisconnect {
                address: self.address().to_string(),
            };
            self.settle(ConnectionState::Reconnecting, Some(reason.to_string()))
                .await;
            LinkLoss::Unexpected
        } else {
            debug!("Device {} disconnected", self.address());
            // A late notice from a failed connect is not a request to stay down
            if matches!(
                self.state(),
                ConnectionState::Connected | ConnectionState::Reconnecting
            ) {
                self.released.store(true, Ordering::SeqCst);
            }
            self.set_state(ConnectionState::Disconnected).await;
            LinkLoss::Intentional
        }
    }

    /// Record that the device is delivering telemetry again
    ///
    /// Moves an idle `Reconnecting` or `Disconnected` link to `Connected`.
    /// Returns `false` when the link was already up or a connect attempt is
    /// in flight; that attempt settles the state itself.
    pub async fn link_restored(&self) -> bool {
        if !matches!(
            self.state(),
            ConnectionState::Reconnecting | ConnectionState::Disconnected
        ) {
            return false;
        }
        info!("Device {} is sending telemetry again", self.address());
        self.released.store(false, Ordering::SeqCst);
        self.settle(ConnectionState::Connected, None).await;
        true
    }
}

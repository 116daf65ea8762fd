//! Connection lifecycle.
//!
//! The [`ConnectionManager`] owns at most one [`Session`]. Everything that
//! talks to the device goes through [`ConnectionManager::lock`], which
//! hands out a [`SessionGuard`]: the remote shell is one ordered stream,
//! so the guard is held for the whole command sequence of an operation.
//!
//! ```text
//! Disconnected ──connect──► Connecting ──ok──► Connected{epoch}
//!      ▲                        │                  │
//!      │                        └──err──► Failed   │ disconnect / transport loss
//!      └───────────────────────────────────────────┘
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::{Mutex, MutexGuard, watch};

use crate::error::{Error, FailureCause, Result};
use crate::transport::{Connector, SshConfig, Transport};

/// Lifecycle state of a connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session. Initial state.
    Disconnected,

    /// A connect request is in progress.
    Connecting,

    /// A session is open.
    Connected { epoch: u64 },

    /// The last connect attempt or session failed. Connect may be retried.
    Failed(FailureCause),
}

impl ConnectionState {
    /// Whether a session of the given epoch is the open one.
    pub fn is_connected_at(&self, epoch: u64) -> bool {
        matches!(self, ConnectionState::Connected { epoch: e } if *e == epoch)
    }

    /// Whether any session is open.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected { epoch } => write!(f, "connected (epoch {epoch})"),
            ConnectionState::Failed(cause) => write!(f, "failed: {cause}"),
        }
    }
}

/// Returned by a successful connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResult {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub epoch: u64,
}

/// An open, authenticated session. Borrowed by executors, never owned.
pub struct Session<T> {
    transport: T,
    host: String,
    port: u16,
    username: String,
    epoch: u64,
    connected_at: DateTime<Utc>,
    state: watch::Receiver<ConnectionState>,
}

impl<T: Transport> Session<T> {
    /// The transport of this session.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Target host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Target port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Authenticated principal.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Epoch of this session.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// When the session was established.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// A receiver observing the manager's state; used to abort in-flight
    /// commands when the session is closed underneath them.
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

struct Slot<T> {
    session: Option<Session<T>>,
    epoch: u64,
}

/// Owns the lifecycle of one device session.
pub struct ConnectionManager<C: Connector> {
    connector: C,
    slot: Mutex<Slot<C::Transport>>,
    state: watch::Sender<ConnectionState>,
}

impl<C: Connector> ConnectionManager<C> {
    /// Create a manager in the `Disconnected` state.
    pub fn new(connector: C) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            slot: Mutex::new(Slot {
                session: None,
                epoch: 0,
            }),
            state,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Open a session. Fails with `AlreadyConnected` if one is open.
    pub async fn connect(&self, config: &SshConfig) -> Result<ConnectResult> {
        let mut slot = self.slot.lock().await;

        if let Some(session) = &slot.session {
            return Err(Error::AlreadyConnected {
                host: session.host.clone(),
                port: session.port,
            });
        }

        self.state.send_replace(ConnectionState::Connecting);
        info!(
            "connecting to {} as '{}'",
            config.socket_addr(),
            config.username
        );

        let transport = match tokio::time::timeout(config.timeout, self.connector.connect(config))
            .await
            .unwrap_or(Err(Error::Timeout(config.timeout)))
        {
            Ok(transport) => transport,
            Err(e) => {
                let cause = e.failure_cause().unwrap_or(FailureCause::ProtocolError);
                warn!("connect to {} failed: {}", config.socket_addr(), e);
                self.state.send_replace(ConnectionState::Failed(cause));
                return Err(e);
            }
        };

        slot.epoch += 1;
        let epoch = slot.epoch;
        slot.session = Some(Session {
            transport,
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            epoch,
            connected_at: Utc::now(),
            state: self.state.subscribe(),
        });
        self.state.send_replace(ConnectionState::Connected { epoch });
        info!("connected to {} (epoch {})", config.socket_addr(), epoch);

        Ok(ConnectResult {
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            epoch,
        })
    }

    /// Close the session. In-flight commands fail with `SessionClosed`.
    ///
    /// Disconnecting without a session is a no-op.
    pub async fn disconnect(&self) -> Result<()> {
        // Signal first so a command holding the lock gives it up
        if self.state().is_connected() {
            self.state.send_replace(ConnectionState::Disconnected);
        }

        let mut slot = self.slot.lock().await;
        let Some(session) = slot.session.take() else {
            return Ok(());
        };
        self.state.send_replace(ConnectionState::Disconnected);
        info!(
            "disconnecting from {}:{} (epoch {})",
            session.host, session.port, session.epoch
        );
        session.transport.close().await
    }

    /// Verify the transport is still up; tears the session down if not.
    pub async fn health_check(&self) -> Result<()> {
        let guard = self.lock().await?;
        let alive = guard.session()?.transport.is_alive();
        if alive {
            return Ok(());
        }
        guard
            .settle(Err(Error::transport("connection lost")))
            .await
    }

    /// Acquire exclusive use of the session.
    pub async fn lock(&self) -> Result<SessionGuard<'_, C::Transport>> {
        let slot = self.slot.lock().await;
        if slot.session.is_none() {
            return Err(Error::NotConnected);
        }
        Ok(SessionGuard {
            slot,
            state: &self.state,
        })
    }
}

/// Exclusive access to the open session for one operation.
pub struct SessionGuard<'a, T: Transport> {
    slot: MutexGuard<'a, Slot<T>>,
    state: &'a watch::Sender<ConnectionState>,
}

impl<T: Transport> SessionGuard<'_, T> {
    /// The session.
    pub fn session(&self) -> Result<&Session<T>> {
        self.slot.session.as_ref().ok_or(Error::NotConnected)
    }

    /// Finish the operation. Errors that leave the session unusable tear
    /// it down; there is no automatic reconnect.
    pub async fn settle<R>(mut self, result: Result<R>) -> Result<R> {
        if let Err(e) = &result {
            if e.requires_reconnect() {
                let next = match e {
                    Error::Timeout(_) => ConnectionState::Failed(FailureCause::Timeout),
                    _ => ConnectionState::Disconnected,
                };
                self.teardown(next).await;
            }
        }
        result
    }

    async fn teardown(&mut self, next: ConnectionState) {
        let Some(session) = self.slot.session.take() else {
            return;
        };
        warn!(
            "dropping session to {}:{} (epoch {}): now {}",
            session.host, session.port, session.epoch, next
        );
        self.state.send_replace(next);
        if let Err(e) = session.transport.close().await {
            debug!("close after failure: {e}");
        }
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Client
//!
//! The client owns the single broker connection together with its named channels,
//! the reconnection counter and the closure marker, all behind one lock. Every
//! publish or consume goes through [`RabbitMQClient::open_channel`], which checks the
//! closure marker and the connected flag and reconnects with exponential backoff
//! before handing out a fresh channel.

use crate::{
    channel::{amqp_uri, redacted_uri, ChannelRegistry, EAGER_CHANNELS},
    configs::Configs,
    errors::AmqpError,
};
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Bounded exponential backoff for reconnection.
///
/// Attempt `n` (1-indexed) waits `2^(n-1)` seconds; once `max_retries` attempts
/// were made without a successful connect, further attempts fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    max_retries: u32,
    attempts: u32,
}

impl ReconnectPolicy {
    /// Creates a policy with no attempts made yet.
    ///
    /// # Parameters
    /// * `max_retries` - Dial attempts allowed between two successful connects
    pub fn new(max_retries: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_retries,
            attempts: 0,
        }
    }

    /// Attempts made since the last successful connect.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Consumes one attempt and returns how long to wait before dialing.
    pub fn next_delay(&mut self) -> Result<Duration, AmqpError> {
        if self.attempts >= self.max_retries {
            return Err(AmqpError::MaxRetriesExceeded(self.max_retries));
        }

        let delay = Duration::from_secs(1u64 << self.attempts.min(32));
        self.attempts += 1;
        Ok(delay)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

struct ClientState {
    connection: Option<Connection>,
    channels: ChannelRegistry,
    reconnect: ReconnectPolicy,
    closed: mpsc::Receiver<AmqpError>,
}

/// Liveness of the current connection, shared with the error callbacks of every
/// connection the client dialed.
///
/// Each dial starts a new generation; callbacks of older generations are ignored.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionWatch {
    connected: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
    closed_tx: mpsc::Sender<AmqpError>,
}

/// Error callback state of one connection.
#[derive(Debug)]
pub(crate) struct ConnectionGuard {
    generation: u64,
    watch: ConnectionWatch,
}

impl ConnectionWatch {
    /// Creates a disconnected watch and the receiver of its closure markers.
    pub(crate) fn new() -> (ConnectionWatch, mpsc::Receiver<AmqpError>) {
        let (closed_tx, closed) = mpsc::channel(1);

        let watch = ConnectionWatch {
            connected: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            closed_tx,
        };

        (watch, closed)
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Starts a new generation for a freshly dialed connection.
    ///
    /// Markers left in `closed` by previous connections are discarded.
    pub(crate) fn arm(&self, closed: &mut mpsc::Receiver<AmqpError>) -> ConnectionGuard {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        while closed.try_recv().is_ok() {}

        ConnectionGuard {
            generation,
            watch: self.clone(),
        }
    }

    /// Silences the guards of every connection dialed so far.
    pub(crate) fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.set_connected(false);
    }
}

impl ConnectionGuard {
    /// Records the loss of the guarded connection.
    ///
    /// # Returns
    /// `false` when the connection was already replaced and nothing was recorded
    pub(crate) fn lost(&self, reason: &str) -> bool {
        if self.watch.generation.load(Ordering::SeqCst) != self.generation {
            debug!(reason, "ignoring error of a replaced connection");
            return false;
        }

        warn!(error = reason, "amqp connection lost");
        self.watch.set_connected(false);
        let _ = self.watch.closed_tx.try_send(AmqpError::ConnectionClosed);
        true
    }
}

/// Whether the connection must be dialed again before it is used.
///
/// A pending closure marker is consumed; without one, the connected flag decides.
pub(crate) fn needs_reconnect(closed: &mut mpsc::Receiver<AmqpError>, connected: bool) -> bool {
    match closed.try_recv() {
        Ok(err) => {
            warn!(error = err.to_string(), "pending connection error, reconnecting");
            true
        }
        Err(_) => !connected,
    }
}

/// Connection supervisor and channel registry.
///
/// Built once at startup and shared through an `Arc`.
pub struct RabbitMQClient {
    configs: Configs,
    state: Mutex<ClientState>,
    watch: ConnectionWatch,
}

impl RabbitMQClient {
    /// Dials the broker and opens the eager "publisher" and "consumer" channels.
    ///
    /// # Parameters
    /// * `configs` - Service configuration; the `rabbitmq` section selects the broker
    ///
    /// # Returns
    /// The shared client, or `ConnectionError`/`ChannelError` when the first dial fails
    pub async fn connect(configs: &Configs) -> Result<Arc<RabbitMQClient>, AmqpError> {
        let (watch, closed) = ConnectionWatch::new();

        let client = RabbitMQClient {
            configs: configs.clone(),
            state: Mutex::new(ClientState {
                connection: None,
                channels: ChannelRegistry::default(),
                reconnect: ReconnectPolicy::new(configs.rabbitmq.max_retries),
                closed,
            }),
            watch,
        };

        {
            let mut state = client.state.lock().await;
            client.connect_locked(&mut state).await?;
        }

        Ok(Arc::new(client))
    }

    pub fn configs(&self) -> &Configs {
        &self.configs
    }

    /// Reports whether the current connection is believed to be alive.
    pub fn is_connected(&self) -> bool {
        self.watch.is_connected()
    }

    /// Waits the next backoff step and dials again.
    ///
    /// # Returns
    /// `MaxRetriesExceeded` once the configured attempts are used up
    pub async fn reconnect(&self) -> Result<(), AmqpError> {
        let mut state = self.state.lock().await;
        self.reconnect_locked(&mut state).await
    }

    /// Opens a channel on the current connection and registers it under `name`.
    ///
    /// # Parameters
    /// * `name` - Registry key; an existing channel under it is replaced
    ///
    /// # Returns
    /// A shared handle to the registered channel
    pub async fn add_channel(&self, name: &str) -> Result<Arc<Channel>, AmqpError> {
        let mut state = self.state.lock().await;

        let conn = state.connection.as_ref().ok_or(AmqpError::ChannelError)?;
        let channel = create_channel(conn).await?;

        state.channels.insert(name, channel);
        state.channels.get(name).ok_or(AmqpError::InternalError)
    }

    /// Returns the channel registered under `name` for the current connection.
    pub async fn channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.state.lock().await.channels.get(name)
    }

    /// Opens a fresh channel, reconnecting first if the connection was lost.
    ///
    /// After a successful reconnect the caller's operation proceeds on the new
    /// connection.
    ///
    /// # Returns
    /// The new channel, or the reconnection error (`MaxRetriesExceeded` once the
    /// backoff budget is exhausted)
    pub async fn open_channel(&self) -> Result<Channel, AmqpError> {
        let mut state = self.state.lock().await;

        if needs_reconnect(&mut state.closed, self.is_connected()) {
            self.reconnect_locked(&mut state).await?;
        }

        let conn = state.connection.as_ref().ok_or(AmqpError::ConnectionError)?;
        create_channel(conn).await
    }

    /// Closes the connection and drops every registered channel.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.state.lock().await;

        self.watch.invalidate();
        state.channels.clear();

        if let Some(conn) = state.connection.take() {
            if let Err(err) = conn.close(200, "client shutdown").await {
                error!(error = err.to_string(), "failure to close the connection");
                return Err(AmqpError::ConnectionError);
            }
        }

        info!("amqp connection closed");
        Ok(())
    }

    async fn reconnect_locked(&self, state: &mut ClientState) -> Result<(), AmqpError> {
        let delay = state.reconnect.next_delay().map_err(|err| {
            error!(error = err.to_string(), "giving up reconnecting to rabbitmq");
            err
        })?;

        warn!(
            delay_secs = delay.as_secs(),
            attempt = state.reconnect.attempts(),
            max_retries = state.reconnect.max_retries(),
            "attempting to reconnect to rabbitmq"
        );

        tokio::time::sleep(delay).await;
        self.connect_locked(state).await
    }

    async fn connect_locked(&self, state: &mut ClientState) -> Result<(), AmqpError> {
        debug!(
            uri = redacted_uri(&self.configs.rabbitmq),
            "creating amqp connection..."
        );

        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.configs.app.name.clone()));

        let conn = match Connection::connect(&amqp_uri(&self.configs.rabbitmq), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError)
            }
        }?;

        let guard = self.watch.arm(&mut state.closed);
        conn.on_error(move |err| {
            guard.lost(&err.to_string());
        });

        let opened = {
            let conn = &conn;
            open_eager_channels(move || create_channel(conn)).await
        };
        let channels = match opened {
            Ok(channels) => channels,
            Err(err) => {
                self.watch.set_connected(false);
                close_connection(conn, "channel setup failed").await;
                return Err(err);
            }
        };

        if let Some(previous) = state.connection.replace(conn) {
            close_connection(previous, "connection replaced").await;
        }
        state.channels = channels;

        state.reconnect.reset();
        self.watch.set_connected(true);
        info!("amqp connected");

        Ok(())
    }
}

/// Opens every eager channel; the registry is only returned when all of them opened.
async fn open_eager_channels<C, F, Fut>(mut open: F) -> Result<ChannelRegistry<C>, AmqpError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<C, AmqpError>>,
{
    let mut channels = ChannelRegistry::default();
    for name in EAGER_CHANNELS {
        channels.insert(name, open().await?);
    }

    Ok(channels)
}

async fn create_channel(conn: &Connection) -> Result<Channel, AmqpError> {
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok(c)
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError)
        }
    }
}

async fn close_connection(conn: Connection, reason: &str) {
    if let Err(err) = conn.close(200, reason).await {
        debug!(error = err.to_string(), reason, "connection already closed");
    }
}

/*
[INPUT]:  Venue bindings, lifecycle calls from adapters and background monitors
[OUTPUT]: Connection state machine, shared queues, live connections
[POS]:    Manager layer - connection manager facade
[UPDATE]: When lifecycle transitions or shared state change
*/

use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::config::{
    DEFAULT_CONNECTION_MONITOR_DELAY, DEFAULT_JOB_BUFFER, DEFAULT_TRAFFIC_TIMEOUT,
};
use crate::error::{ConfigError, Result, StreamError};
use crate::manager::setup::{VenueBindings, check_proxy_address, check_websocket_url, resolve_url};
use crate::manager::subscriptions::SubscriptionManager;
use crate::manager::venue::OrderbookBuffer;
use crate::types::{DataSink, StreamEvent, StreamState};
use crate::ws::{
    Connection, ConnectionLinks, ConnectionSetup, ReadError, RequestMatcher, WebsocketConnection,
};

/// Broadcast shutdown signal that can be re-armed after each session
#[derive(Debug, Clone, Default)]
pub(crate) struct ShutdownSignal(Arc<Mutex<CancellationToken>>);

impl ShutdownSignal {
    /// Token for tasks started now
    pub fn current(&self) -> CancellationToken {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn renew(&self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = CancellationToken::new();
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct StatusFlags {
    pub state: StreamState,
    /// Connected at least once since the last disconnection
    pub initialized: bool,
    pub can_use_auth: bool,
    pub connection_monitor_running: bool,
    pub traffic_monitor_running: bool,
    pub data_relay_running: bool,
}

impl Default for StatusFlags {
    fn default() -> Self {
        Self {
            state: StreamState::Disabled,
            initialized: false,
            can_use_auth: false,
            connection_monitor_running: false,
            traffic_monitor_running: false,
            data_relay_running: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Endpoints {
    pub default_url: String,
    pub default_auth_url: String,
    pub running_url: String,
    pub running_auth_url: String,
    pub proxy: String,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Timing {
    pub traffic_timeout: Duration,
    pub connection_monitor_delay: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            traffic_timeout: DEFAULT_TRAFFIC_TIMEOUT,
            connection_monitor_delay: DEFAULT_CONNECTION_MONITOR_DELAY,
        }
    }
}

/// Channel halves owned by the manager; receivers are lent to the task using them
pub(crate) struct Queues {
    pub inbound_tx: DataSink,
    pub inbound_rx: Mutex<Option<mpsc::Receiver<StreamEvent>>>,
    pub outbound_tx: DataSink,
    pub outbound_rx: Mutex<Option<mpsc::Receiver<StreamEvent>>>,
    pub traffic_tx: mpsc::Sender<()>,
    pub traffic_rx: Mutex<Option<mpsc::Receiver<()>>>,
    pub read_errors_tx: mpsc::Sender<ReadError>,
    pub read_errors_rx: Mutex<Option<mpsc::Receiver<ReadError>>>,
}

impl Queues {
    fn new(buffer: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(buffer);
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer);
        let (traffic_tx, traffic_rx) = mpsc::channel(1);
        let (read_errors_tx, read_errors_rx) = mpsc::channel(1);
        Self {
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            traffic_tx,
            traffic_rx: Mutex::new(Some(traffic_rx)),
            read_errors_tx,
            read_errors_rx: Mutex::new(Some(read_errors_rx)),
        }
    }
}

pub(crate) fn take_slot<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

pub(crate) fn restore_slot<T>(slot: &Mutex<Option<T>>, value: T) {
    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
}

pub(crate) struct Inner {
    pub bindings: OnceLock<VenueBindings>,
    pub status: RwLock<StatusFlags>,
    pub endpoints: RwLock<Endpoints>,
    pub timing: RwLock<Timing>,
    pub subscriptions: SubscriptionManager,
    /// Serializes connect and shutdown
    pub lifecycle: tokio::sync::Mutex<()>,
    pub shutdown: ShutdownSignal,
    /// Per-session tasks; waited on by shutdown
    pub tracker: TaskTracker,
    pub matcher: Arc<RequestMatcher>,
    pub queues: Queues,
    pub connection: RwLock<Option<Arc<dyn Connection>>>,
    pub auth_connection: RwLock<Option<Arc<dyn Connection>>>,
}

/// Connection lifecycle manager for one venue's streaming feed.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct ConnectionManager {
    pub(crate) inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("exchange", &self.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Flushes the order book buffer when dropped
struct FlushOnDrop<'a>(Option<&'a dyn OrderbookBuffer>);

impl Drop for FlushOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(buffer) = self.0 {
            buffer.flush_buffer();
        }
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_JOB_BUFFER)
    }

    /// Manager whose inbound and outbound queues hold `buffer` events
    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                bindings: OnceLock::new(),
                status: RwLock::new(StatusFlags::default()),
                endpoints: RwLock::new(Endpoints::default()),
                timing: RwLock::new(Timing::default()),
                subscriptions: SubscriptionManager::default(),
                lifecycle: tokio::sync::Mutex::new(()),
                shutdown: ShutdownSignal::default(),
                tracker: TaskTracker::new(),
                matcher: Arc::new(RequestMatcher::new()),
                queues: Queues::new(buffer.max(1)),
                connection: RwLock::new(None),
                auth_connection: RwLock::new(None),
            }),
        }
    }

    pub(crate) fn bindings(&self) -> Result<&VenueBindings> {
        self.inner.bindings.get().ok_or(StreamError::NotInitialised)
    }

    pub(crate) fn status(&self) -> StatusFlags {
        *self.inner.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn update_status<R>(&self, apply: impl FnOnce(&mut StatusFlags) -> R) -> R {
        let mut status = self.inner.status.write().unwrap_or_else(PoisonError::into_inner);
        apply(&mut status)
    }

    fn endpoints(&self) -> Endpoints {
        self.inner
            .endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn endpoints_mut(&self) -> RwLockWriteGuard<'_, Endpoints> {
        self.inner.endpoints.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn timing(&self) -> Timing {
        *self.inner.timing.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn timing_mut(&self) -> RwLockWriteGuard<'_, Timing> {
        self.inner.timing.write().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn override_timing(&self, traffic_timeout: Duration, monitor_delay: Duration) {
        *self.timing_mut() = Timing {
            traffic_timeout,
            connection_monitor_delay: monitor_delay,
        };
    }

    /// Exchange name, empty before setup
    pub fn name(&self) -> String {
        self.inner
            .bindings
            .get()
            .map(|bindings| bindings.name.clone())
            .unwrap_or_default()
    }

    pub fn state(&self) -> StreamState {
        self.status().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == StreamState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.state() == StreamState::Connecting
    }

    pub fn is_enabled(&self) -> bool {
        self.state().is_enabled()
    }

    pub fn is_initialised(&self) -> bool {
        self.status().initialized
    }

    pub fn is_connection_monitor_running(&self) -> bool {
        self.status().connection_monitor_running
    }

    pub fn is_traffic_monitor_running(&self) -> bool {
        self.status().traffic_monitor_running
    }

    pub fn is_data_relay_running(&self) -> bool {
        self.status().data_relay_running
    }

    pub fn websocket_url(&self) -> String {
        self.endpoints().running_url
    }

    pub fn websocket_auth_url(&self) -> String {
        self.endpoints().running_auth_url
    }

    pub fn proxy_address(&self) -> String {
        self.endpoints().proxy
    }

    pub fn traffic_timeout(&self) -> Duration {
        self.timing().traffic_timeout
    }

    pub fn connection_monitor_delay(&self) -> Duration {
        self.timing().connection_monitor_delay
    }

    pub fn can_use_authenticated_endpoints(&self) -> bool {
        self.status().can_use_auth
    }

    pub fn set_can_use_authenticated_endpoints(&self, allowed: bool) {
        self.update_status(|status| status.can_use_auth = allowed);
    }

    /// Whether a wrapper call may go over the authenticated socket instead of REST
    pub fn can_use_authenticated_websocket_for_wrapper(&self) -> bool {
        let status = self.status();
        if status.state != StreamState::Connected {
            return false;
        }
        if !status.can_use_auth {
            info!(
                exchange = %self.name(),
                "websocket not authenticated, using rest"
            );
        }
        status.can_use_auth
    }

    /// Sender half of the inbound queue, for venue-decoded events
    pub fn data_sink(&self) -> DataSink {
        self.inner.queues.inbound_tx.clone()
    }

    /// Hand the outbound queue to its single consumer. Returns `None` once taken.
    pub fn take_event_receiver(&self) -> Option<mpsc::Receiver<StreamEvent>> {
        take_slot(&self.inner.queues.outbound_rx)
    }

    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.inner
            .connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn auth_connection(&self) -> Option<Arc<dyn Connection>> {
        self.inner
            .auth_connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install a connection, closing the one of the same flavour it replaces
    pub fn set_connection(&self, connection: Arc<dyn Connection>) {
        let slot = if connection.is_authenticated() {
            &self.inner.auth_connection
        } else {
            &self.inner.connection
        };
        let installed = connection.id();
        let replaced = slot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(connection);

        let Some(replaced) = replaced.filter(|previous| previous.id() != installed) else {
            return;
        };
        let exchange = self.name();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(err) = replaced.shutdown().await {
                        debug!(exchange = %exchange, error = %err, "replaced connection close failed");
                    }
                });
            }
            Err(_) => {
                debug!(exchange = %exchange, "replaced connection dropped outside a runtime");
            }
        }
    }

    /// Build a websocket connection wired to this manager's queues and store it.
    ///
    /// The connection is not dialled.
    pub fn setup_new_connection(&self, setup: ConnectionSetup) -> Result<Arc<dyn Connection>> {
        let bindings = self.bindings()?;
        let endpoints = self.endpoints();

        let url = if setup.url.is_empty() {
            if setup.authenticated {
                endpoints.running_auth_url
            } else {
                endpoints.running_url
            }
        } else {
            setup.url.clone()
        };
        if url.is_empty() {
            return Err(ConfigError::RunningUrlEmpty.into());
        }
        check_websocket_url(&url)?;

        let links = ConnectionLinks {
            data: self.inner.queues.inbound_tx.clone(),
            traffic: self.inner.queues.traffic_tx.clone(),
            read_errors: self.inner.queues.read_errors_tx.clone(),
            shutdown: self.inner.shutdown.clone(),
            tracker: self.inner.tracker.clone(),
            matcher: self.inner.matcher.clone(),
        };
        let connection: Arc<dyn Connection> = Arc::new(WebsocketConnection::new(
            bindings.name.clone(),
            ConnectionSetup { url, ..setup },
            bindings.reporter.clone(),
            endpoints.proxy,
            links,
        ));
        self.set_connection(connection.clone());
        Ok(connection)
    }

    /// Establish the venue session and apply the generated subscriptions.
    ///
    /// A subscription failure is returned while the manager stays connected.
    pub async fn connect(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.connect_locked().await
    }

    pub(crate) async fn connect_locked(&self) -> Result<()> {
        let bindings = self.bindings()?;
        let exchange = bindings.name.clone();

        self.update_status(|status| match status.state {
            StreamState::Disabled => Err(StreamError::NotEnabled),
            StreamState::Connecting => Err(StreamError::AlreadyConnecting {
                exchange: exchange.clone(),
            }),
            StreamState::Connected => Err(StreamError::AlreadyConnected {
                exchange: exchange.clone(),
            }),
            StreamState::Enabled => {
                status.state = StreamState::Connecting;
                Ok(())
            }
        })?;

        self.start_data_relay();
        self.start_traffic_monitor();

        info!(exchange = %exchange, url = %self.websocket_url(), "websocket connecting");
        if let Err(err) = bindings.connector.connect(self).await {
            self.update_status(|status| {
                if status.state == StreamState::Connecting {
                    status.state = StreamState::Enabled;
                }
            });
            return Err(StreamError::Connect {
                exchange,
                source: Box::new(err),
            });
        }

        self.update_status(|status| {
            status.state = StreamState::Connected;
            status.initialized = true;
        });
        info!(exchange = %exchange, "websocket connected");
        // a dial slower than the traffic timeout outlives the first watchdog
        self.start_traffic_monitor();

        if let Err(err) = self.start_connection_monitor() {
            debug!(exchange = %exchange, error = %err, "connection monitor not started");
        }

        let subscriptions = self.generate_subscriptions().await?;
        if subscriptions.is_empty() {
            return Ok(());
        }
        self.subscribe_to_channels(&subscriptions).await
    }

    /// Close the session and wait for every per-session task to finish
    pub async fn shutdown(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.shutdown_locked().await
    }

    pub(crate) async fn shutdown_locked(&self) -> Result<()> {
        let bindings = self.bindings()?;
        let exchange = bindings.name.clone();
        match self.state() {
            StreamState::Connected => {}
            StreamState::Connecting => {
                return Err(StreamError::ShutdownWhileConnecting { exchange });
            }
            StreamState::Enabled | StreamState::Disabled => {
                return Err(StreamError::NotConnected { exchange });
            }
        }

        info!(exchange = %exchange, "websocket shutting down");
        let _flush = FlushOnDrop(bindings.orderbook.as_deref());

        for connection in [self.connection(), self.auth_connection()]
            .into_iter()
            .flatten()
        {
            connection.shutdown().await?;
        }

        self.inner.subscriptions.purge();

        self.inner.shutdown.current().cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
        self.inner.shutdown.renew();

        self.update_status(|status| {
            if matches!(
                status.state,
                StreamState::Connected | StreamState::Connecting
            ) {
                status.state = StreamState::Enabled;
            }
        });
        info!(exchange = %exchange, "websocket shutdown complete");
        Ok(())
    }

    /// Enable the stream and connect
    pub async fn enable(&self) -> Result<()> {
        let exchange = self.bindings()?.name.clone();
        self.update_status(|status| match status.state {
            StreamState::Connected => Err(StreamError::AlreadyConnected {
                exchange: exchange.clone(),
            }),
            StreamState::Enabled | StreamState::Connecting => Err(StreamError::AlreadyEnabled {
                exchange: exchange.clone(),
            }),
            StreamState::Disabled => {
                status.state = StreamState::Enabled;
                Ok(())
            }
        })?;
        info!(exchange = %exchange, "websocket enabled");
        self.connect().await
    }

    /// Disable the stream, shutting down a live session first
    pub async fn disable(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let exchange = self.bindings()?.name.clone();
        match self.state() {
            StreamState::Disabled => return Err(StreamError::AlreadyDisabled { exchange }),
            StreamState::Connected => self.shutdown_locked().await?,
            StreamState::Enabled | StreamState::Connecting => {}
        }
        self.update_status(|status| status.state = StreamState::Disabled);
        info!(exchange = %exchange, "websocket disabled");
        Ok(())
    }

    /// Change the running URL of one flavour.
    ///
    /// An empty URL or the non-default placeholder restores the venue default.
    pub async fn set_websocket_url(&self, url: &str, authenticated: bool, reconnect: bool) -> Result<()> {
        let exchange = self.name();
        let resolved = {
            let endpoints = self.endpoints();
            let default = if authenticated {
                endpoints.default_auth_url
            } else {
                endpoints.default_url
            };
            resolve_url(url, &default)
        };
        check_websocket_url(&resolved)?;

        {
            let mut endpoints = self.endpoints_mut();
            if authenticated {
                endpoints.running_auth_url = resolved.clone();
            } else {
                endpoints.running_url = resolved.clone();
            }
        }
        debug!(exchange = %exchange, url = %resolved, authenticated, "setting websocket url");

        let live = if authenticated {
            self.auth_connection()
        } else {
            self.connection()
        };
        if let Some(connection) = live {
            connection.set_url(&resolved);
        }

        if reconnect && self.is_connected() {
            debug!(exchange = %exchange, url = %resolved, "flushing websocket connection");
            return self.shutdown().await;
        }
        Ok(())
    }

    /// Route connections through `address`, or directly when empty.
    ///
    /// Setting the current address again is an error. A manager that has
    /// connected before reconnects to apply the change.
    pub async fn set_proxy_address(&self, address: &str) -> Result<()> {
        let exchange = self.name();
        if address.is_empty() {
            debug!(exchange = %exchange, "removing websocket proxy");
        } else {
            check_proxy_address(address)?;
            if self.proxy_address() == address {
                return Err(ConfigError::DuplicateProxy(address.to_string()).into());
            }
            debug!(exchange = %exchange, proxy = %address, "setting websocket proxy");
        }

        for connection in [self.connection(), self.auth_connection()]
            .into_iter()
            .flatten()
        {
            connection.set_proxy(address);
        }
        self.endpoints_mut().proxy = address.to_string();

        let status = self.status();
        if status.initialized && status.state.is_enabled() {
            let _lifecycle = self.inner.lifecycle.lock().await;
            if self.is_connected() {
                self.shutdown_locked().await?;
            }
            return self.connect_locked().await;
        }
        Ok(())
    }
}

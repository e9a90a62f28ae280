/*
[INPUT]:  Test configuration and mock venue requirements
[OUTPUT]: Shared test utilities: recording venue, local websocket server, fixtures
[POS]:    Test infrastructure - shared across all test modules
[UPDATE]: When adding new test patterns or fixtures
*/

//! Common test utilities for venue-stream tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use venue_stream::{
    ChannelSubscription, ConnectionManager, ConnectionSetup, Connector, Features, OrderbookBuffer,
    OrderbookBufferConfig, Reporter, Result, StreamError, StreamSettings, StreamSetup, Subscriber,
    SubscriptionGenerator, TradeNotifier, Unsubscriber,
};
use venue_stream::types::DataSink;

pub const DEFAULT_URL: &str = "ws://127.0.0.1:1/ws";

/// Install a tracing subscriber once; honours RUST_LOG
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn sub(channel: &str, instrument: &str) -> ChannelSubscription {
    ChannelSubscription::new(channel, instrument)
}

pub fn test_settings(name: &str) -> StreamSettings {
    let mut settings = StreamSettings::new(name);
    settings.websocket_url = DEFAULT_URL.to_string();
    settings
}

/// Venue double. Without a socket URL it connects without dialling; with one
/// it dials through the manager and commits subscriptions on ack.
#[derive(Debug, Default)]
pub struct TestVenue {
    dial: bool,
    /// Also dial an authenticated socket on the running auth URL
    dial_auth: bool,
    fail_connect: AtomicBool,
    connects: AtomicUsize,
    next_id: AtomicU64,
    pub generated: Mutex<Vec<ChannelSubscription>>,
    pub subscribe_calls: Mutex<Vec<Vec<ChannelSubscription>>>,
    pub unsubscribe_calls: Mutex<Vec<Vec<ChannelSubscription>>>,
}

impl TestVenue {
    pub fn offline() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn dialling() -> Arc<Self> {
        Arc::new(Self {
            dial: true,
            ..Self::default()
        })
    }

    pub fn dialling_with_auth() -> Arc<Self> {
        Arc::new(Self {
            dial: true,
            dial_auth: true,
            ..Self::default()
        })
    }

    pub fn generate(&self, subscriptions: Vec<ChannelSubscription>) {
        *self.generated.lock().unwrap() = subscriptions;
    }

    pub fn fail_next_connects(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> Vec<Vec<ChannelSubscription>> {
        self.subscribe_calls.lock().unwrap().clone()
    }

    pub fn unsubscribe_calls(&self) -> Vec<Vec<ChannelSubscription>> {
        self.unsubscribe_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for TestVenue {
    async fn connect(&self, manager: &ConnectionManager) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(StreamError::venue("connection refused"));
        }
        if self.dial {
            let connection = manager.setup_new_connection(ConnectionSetup {
                response_id_field: Some("id".to_string()),
                response_max_limit: Duration::from_secs(2),
                ..ConnectionSetup::default()
            })?;
            connection.dial().await?;
        }
        if self.dial_auth {
            let connection = manager.setup_new_connection(ConnectionSetup {
                authenticated: true,
                ..ConnectionSetup::default()
            })?;
            connection.dial().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Subscriber for TestVenue {
    async fn subscribe(
        &self,
        manager: &ConnectionManager,
        subscriptions: &[ChannelSubscription],
    ) -> Result<()> {
        self.subscribe_calls
            .lock()
            .unwrap()
            .push(subscriptions.to_vec());
        if !self.dial {
            return Ok(());
        }

        let connection = manager
            .connection()
            .ok_or_else(|| StreamError::venue("no connection"))?;
        for subscription in subscriptions {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
            let request = json!({
                "op": "subscribe",
                "id": id,
                "channel": subscription.channel,
                "instrument": subscription.instrument,
            });
            let reply = connection.send_request(&id, &request).await?;
            if reply["event"] == "subscribed" {
                manager.add_successful_subscriptions(std::slice::from_ref(subscription));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Unsubscriber for TestVenue {
    async fn unsubscribe(
        &self,
        _manager: &ConnectionManager,
        subscriptions: &[ChannelSubscription],
    ) -> Result<()> {
        self.unsubscribe_calls
            .lock()
            .unwrap()
            .push(subscriptions.to_vec());
        Ok(())
    }
}

#[async_trait]
impl SubscriptionGenerator for TestVenue {
    async fn generate_subscriptions(&self) -> Result<Vec<ChannelSubscription>> {
        Ok(self.generated.lock().unwrap().clone())
    }
}

/// Order book buffer double counting setup and flush calls
#[derive(Debug, Default)]
pub struct CountingOrderbook {
    pub setups: AtomicUsize,
    pub flushes: AtomicUsize,
}

impl OrderbookBuffer for CountingOrderbook {
    fn setup(&self, _config: &OrderbookBufferConfig, _sink: DataSink) -> Result<()> {
        self.setups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn flush_buffer(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
pub struct RecordingTrades {
    pub setup_with: Mutex<Option<(String, bool)>>,
}

impl TradeNotifier for RecordingTrades {
    fn setup(&self, exchange: &str, enabled: bool, _sink: DataSink) -> Result<()> {
        *self.setup_with.lock().unwrap() = Some((exchange.to_string(), enabled));
        Ok(())
    }
}

/// Reporter recording every latency sample
#[derive(Debug, Default)]
pub struct RecordingReporter {
    samples: Mutex<Vec<(String, String)>>,
}

impl RecordingReporter {
    /// `(exchange, message)` of every sample so far
    pub fn samples(&self) -> Vec<(String, String)> {
        self.samples.lock().unwrap().clone()
    }
}

impl Reporter for RecordingReporter {
    fn latency(&self, exchange: &str, message: &[u8], _duration: Duration) {
        self.samples.lock().unwrap().push((
            exchange.to_string(),
            String::from_utf8_lossy(message).into_owned(),
        ));
    }
}

/// Complete setup for `venue` with the given features
pub fn full_setup(venue: Arc<TestVenue>, settings: StreamSettings, features: Features) -> StreamSetup {
    StreamSetup::new(settings)
        .features(features)
        .venue(venue.clone())
        .unsubscriber(venue)
        .default_url(DEFAULT_URL)
}

/// Enabled manager bound to `venue`
pub fn manager_for(venue: Arc<TestVenue>, features: Features) -> ConnectionManager {
    init_tracing();
    let manager = ConnectionManager::new();
    manager
        .setup(full_setup(venue, test_settings("testex"), features))
        .unwrap();
    manager
}

/// Local websocket venue.
///
/// Acks `{"op":"subscribe","id":..}` with `{"id":..,"event":"subscribed"}`,
/// echoes `{"op":"echo","payload":..}` as a data frame, answers
/// `{"op":"garbage"}` with a non-JSON frame and closes the socket on
/// `{"op":"close"}`.
pub struct VenueServer {
    pub addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    open: Arc<AtomicUsize>,
    pings: Arc<AtomicUsize>,
}

/// Counts a socket as open until its handler returns
struct OpenSocket(Arc<AtomicUsize>);

impl OpenSocket {
    fn track(open: &Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::SeqCst);
        Self(open.clone())
    }
}

impl Drop for OpenSocket {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl VenueServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicUsize::new(0));
        let pings = Arc::new(AtomicUsize::new(0));

        let counter = accepted.clone();
        let open_sockets = open.clone();
        let ping_counter = pings.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let open_sockets = open_sockets.clone();
                let ping_counter = ping_counter.clone();
                tokio::spawn(async move {
                    let Ok(mut socket) = accept_async(stream).await else {
                        return;
                    };
                    let _open = OpenSocket::track(&open_sockets);
                    while let Some(Ok(message)) = socket.next().await {
                        let text = match message {
                            Message::Text(text) => text,
                            Message::Ping(_) => {
                                ping_counter.fetch_add(1, Ordering::SeqCst);
                                continue;
                            }
                            _ => continue,
                        };
                        let Ok(request) = serde_json::from_str::<Value>(text.as_str()) else {
                            continue;
                        };
                        let reply = match request["op"].as_str() {
                            Some("subscribe") => Message::Text(
                                json!({ "id": request["id"], "event": "subscribed" })
                                    .to_string()
                                    .into(),
                            ),
                            Some("echo") => Message::Text(
                                json!({ "channel": "echo", "data": request["payload"] })
                                    .to_string()
                                    .into(),
                            ),
                            Some("garbage") => Message::Text("not json {".to_string().into()),
                            Some("close") => {
                                let _ = socket
                                    .close(Some(CloseFrame {
                                        code: CloseCode::Away,
                                        reason: "maintenance".into(),
                                    }))
                                    .await;
                                return;
                            }
                            _ => continue,
                        };
                        if socket.send(reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        Self {
            addr,
            accepted,
            open,
            pings,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Sockets whose handler is still running
    pub fn open(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Ping control frames received across all sockets
    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

/// HTTP CONNECT proxy that pipes accepted tunnels to their target.
pub struct ConnectProxy {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
}

impl ConnectProxy {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let seen = requests.clone();
        tokio::spawn(async move {
            while let Ok((mut client, _)) = listener.accept().await {
                let seen = seen.clone();
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    while !head.ends_with(b"\r\n\r\n") {
                        let Ok(byte) = client.read_u8().await else {
                            return;
                        };
                        head.push(byte);
                    }
                    let head = String::from_utf8_lossy(&head).into_owned();
                    let request_line = head.lines().next().unwrap_or_default().to_string();
                    seen.lock().unwrap().push(request_line.clone());

                    let Some(target) = request_line.split_whitespace().nth(1) else {
                        return;
                    };
                    let Ok(mut upstream) = TcpStream::connect(target).await else {
                        let _ = client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
                        return;
                    };
                    if client
                        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                        .await
                        .is_err()
                    {
                        return;
                    }
                    let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
                });
            }
        });

        Self { addr, requests }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Request lines of every CONNECT received
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

/// Poll `check` every 10ms until it holds or `limit` passes
pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/*
[INPUT]:  Websocket URL, optional HTTP proxy, manager-owned queues and shutdown signal
[OUTPUT]: Decoded frames on the inbound queue, traffic pulses, read errors
[POS]:    WebSocket layer - one socket with serialized rate-limited writes
[UPDATE]: When changing dial, framing, keep-alive or read loop behaviour
*/

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, client_async_tls, connect_async};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::DEFAULT_RESPONSE_MAX_LIMIT;
use crate::error::{Result, TransportError};
use crate::manager::ShutdownSignal;
use crate::types::{DataSink, StreamEvent};
use crate::ws::matcher::{RequestMatcher, extract_id};
use crate::ws::reporter::Reporter;

const FRAME_SAMPLE_LIMIT: usize = 3;
const PARSE_FAIL_LOG_LIMIT: usize = 3;
const RAW_LOG_MAX_BYTES: usize = 1024;
const PROXY_RESPONSE_MAX_BYTES: usize = 8192;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

/// One streaming socket as seen by the manager and venue adapters.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    /// Open the socket and start its background readers
    async fn dial(&self) -> Result<()>;

    async fn send_json(&self, payload: &Value) -> Result<()>;

    async fn send_text(&self, text: String) -> Result<()>;

    /// Send a payload and wait for the frame carrying the same correlation id.
    async fn send_request(&self, id: &str, payload: &Value) -> Result<Value>;

    /// Close the socket. Closing an already closed socket is a no-op.
    async fn shutdown(&self) -> Result<()>;

    fn set_url(&self, url: &str);

    fn set_proxy(&self, proxy: &str);

    fn url(&self) -> String;

    fn proxy(&self) -> String;

    fn is_authenticated(&self) -> bool;

    fn id(&self) -> Uuid;
}

/// Keep-alive payload sent on a fixed interval
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PingMessage {
    /// Websocket control ping frame
    Frame,
    /// Venue-level ping sent as a text frame
    Text(String),
}

impl PingMessage {
    fn to_message(&self) -> WsMessage {
        match self {
            PingMessage::Frame => WsMessage::Ping(Vec::new().into()),
            PingMessage::Text(text) => WsMessage::Text(text.clone().into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingHandler {
    pub interval: Duration,
    pub message: PingMessage,
}

/// Parameters for a connection created through the manager
#[derive(Debug, Clone, Default)]
pub struct ConnectionSetup {
    /// Empty means the manager's running URL for this flavour
    pub url: String,
    pub authenticated: bool,
    /// Pause held after every write
    pub rate_limit: Duration,
    /// Zero means `DEFAULT_RESPONSE_MAX_LIMIT`
    pub response_max_limit: Duration,
    /// Field carrying the correlation id of request replies
    pub response_id_field: Option<String>,
    pub ping: Option<PingHandler>,
    /// Falls back to the manager-level reporter
    pub reporter: Option<Arc<dyn Reporter>>,
}

/// Manager-owned plumbing every connection reports into
#[derive(Debug, Clone)]
pub(crate) struct ConnectionLinks {
    pub data: DataSink,
    pub traffic: mpsc::Sender<()>,
    pub read_errors: mpsc::Sender<ReadError>,
    pub shutdown: ShutdownSignal,
    pub tracker: TaskTracker,
    pub matcher: Arc<RequestMatcher>,
}

/// Read failure tagged with the connection that saw it
#[derive(Debug)]
pub(crate) struct ReadError {
    pub connection_id: Uuid,
    pub error: TransportError,
}

/// Websocket connection over tokio-tungstenite
pub struct WebsocketConnection {
    id: Uuid,
    exchange: String,
    url: RwLock<String>,
    proxy: RwLock<String>,
    authenticated: bool,
    rate_limit: Duration,
    response_max_limit: Duration,
    response_id_field: Option<String>,
    ping: Option<PingHandler>,
    reporter: Arc<dyn Reporter>,
    writer: Arc<Mutex<Option<WsSink>>>,
    /// Set once this process closes the current session's socket
    closed: RwLock<Arc<AtomicBool>>,
    /// Stops the read and keep-alive tasks of the current session
    session: RwLock<CancellationToken>,
    links: ConnectionLinks,
}

impl fmt::Debug for WebsocketConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebsocketConnection")
            .field("id", &self.id)
            .field("exchange", &self.exchange)
            .field("url", &self.url())
            .field("authenticated", &self.authenticated)
            .field("rate_limit", &self.rate_limit)
            .finish_non_exhaustive()
    }
}

impl WebsocketConnection {
    pub(crate) fn new(
        exchange: impl Into<String>,
        setup: ConnectionSetup,
        reporter: Arc<dyn Reporter>,
        proxy: String,
        links: ConnectionLinks,
    ) -> Self {
        let response_max_limit = if setup.response_max_limit.is_zero() {
            DEFAULT_RESPONSE_MAX_LIMIT
        } else {
            setup.response_max_limit
        };

        Self {
            id: Uuid::new_v4(),
            exchange: exchange.into(),
            url: RwLock::new(setup.url),
            proxy: RwLock::new(proxy),
            authenticated: setup.authenticated,
            rate_limit: setup.rate_limit,
            response_max_limit,
            response_id_field: setup.response_id_field,
            ping: setup.ping,
            reporter: setup.reporter.unwrap_or(reporter),
            writer: Arc::new(Mutex::new(None)),
            closed: RwLock::new(Arc::new(AtomicBool::new(false))),
            session: RwLock::new(CancellationToken::new()),
            links,
        }
    }

    fn session_closed(&self) -> Arc<AtomicBool> {
        self.closed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn session(&self) -> CancellationToken {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install fresh session state and retire the previous session's tasks.
    fn begin_session(&self) -> (Arc<AtomicBool>, CancellationToken) {
        let closed = Arc::new(AtomicBool::new(false));
        let retired = std::mem::replace(
            &mut *self.closed.write().unwrap_or_else(PoisonError::into_inner),
            closed.clone(),
        );
        retired.store(true, Ordering::Release);

        let session = self.links.shutdown.current().child_token();
        let previous = std::mem::replace(
            &mut *self.session.write().unwrap_or_else(PoisonError::into_inner),
            session.clone(),
        );
        previous.cancel();

        (closed, session)
    }

    async fn open_stream(&self, url: &str, proxy: &str) -> Result<WsStream> {
        if proxy.is_empty() {
            let (stream, _response) = connect_async(url).await?;
            return Ok(stream);
        }

        let tunnel = open_proxy_tunnel(proxy, url).await?;
        let (stream, _response) = client_async_tls(url, tunnel).await?;
        Ok(stream)
    }

    async fn write(&self, message: WsMessage) -> Result<()> {
        if self.session_closed().load(Ordering::Acquire) {
            return Err(TransportError::ClosedConnection.into());
        }

        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(TransportError::NotConnected)?;
        sink.send(message).await.map_err(TransportError::from)?;
        if !self.rate_limit.is_zero() {
            tokio::time::sleep(self.rate_limit).await;
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for WebsocketConnection {
    async fn dial(&self) -> Result<()> {
        let url = self.url();
        let proxy = self.proxy();
        let stream = self.open_stream(&url, &proxy).await?;
        let (sink, source) = stream.split();

        let mut writer = self.writer.lock().await;
        let previous = writer.replace(sink);
        let (closed, session) = self.begin_session();
        drop(writer);

        if let Some(mut previous) = previous
            && let Err(err) = previous.close().await
        {
            debug!(
                exchange = %self.exchange,
                connection_id = %self.id,
                error = %err,
                "ws previous session close failed"
            );
        }

        let reader = ReadLoop {
            connection_id: self.id,
            exchange: self.exchange.clone(),
            response_id_field: self.response_id_field.clone(),
            links: self.links.clone(),
            closed,
            token: session.clone(),
            frames_logged: AtomicUsize::new(0),
            parse_failures_logged: AtomicUsize::new(0),
        };
        self.links.tracker.spawn(reader.run(source));

        if let Some(handler) = self.ping.clone()
            && !handler.interval.is_zero()
        {
            self.links.tracker.spawn(ping_loop(
                self.writer.clone(),
                handler,
                session,
                self.id,
            ));
        }

        info!(
            exchange = %self.exchange,
            connection_id = %self.id,
            url = %url,
            authenticated = self.authenticated,
            "ws connection established"
        );
        Ok(())
    }

    async fn send_json(&self, payload: &Value) -> Result<()> {
        let body = serde_json::to_string(payload)?;
        self.send_text(body).await
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.write(WsMessage::Text(text.into())).await
    }

    async fn send_request(&self, id: &str, payload: &Value) -> Result<Value> {
        let body = serde_json::to_string(payload)?;
        let reply = self.links.matcher.register(id);
        let started = Instant::now();

        if let Err(err) = self.write(WsMessage::Text(body.clone().into())).await {
            self.links.matcher.cancel(id);
            return Err(err);
        }

        match tokio::time::timeout(self.response_max_limit, reply).await {
            Ok(Ok(response)) => {
                self.reporter
                    .latency(&self.exchange, body.as_bytes(), started.elapsed());
                Ok(response)
            }
            Ok(Err(_)) => Err(TransportError::ResponseDropped { id: id.to_string() }.into()),
            Err(_) => {
                self.links.matcher.cancel(id);
                Err(TransportError::ResponseTimeout { id: id.to_string() }.into())
            }
        }
    }

    async fn shutdown(&self) -> Result<()> {
        if self.session_closed().swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut writer = self.writer.lock().await;
        if let Some(mut sink) = writer.take() {
            // peer may already be gone, nothing left to report
            if let Err(err) = sink.send(WsMessage::Close(None)).await {
                debug!(
                    exchange = %self.exchange,
                    connection_id = %self.id,
                    error = %err,
                    "ws close frame not delivered"
                );
            }
            if let Err(err) = sink.close().await {
                debug!(
                    exchange = %self.exchange,
                    connection_id = %self.id,
                    error = %err,
                    "ws sink close failed"
                );
            }
        }
        drop(writer);
        self.session().cancel();

        info!(exchange = %self.exchange, connection_id = %self.id, "ws connection closed");
        Ok(())
    }

    fn set_url(&self, url: &str) {
        *self.url.write().unwrap_or_else(PoisonError::into_inner) = url.to_string();
    }

    fn set_proxy(&self, proxy: &str) {
        *self.proxy.write().unwrap_or_else(PoisonError::into_inner) = proxy.to_string();
    }

    fn url(&self) -> String {
        self.url.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn proxy(&self) -> String {
        self.proxy.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for WebsocketConnection {
    fn drop(&mut self) {
        self.session
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }
}

/// Read side of one dialled session
struct ReadLoop {
    connection_id: Uuid,
    exchange: String,
    response_id_field: Option<String>,
    links: ConnectionLinks,
    closed: Arc<AtomicBool>,
    token: CancellationToken,
    frames_logged: AtomicUsize,
    parse_failures_logged: AtomicUsize,
}

impl ReadLoop {
    async fn run(self, mut source: WsSource) {
        loop {
            let frame = tokio::select! {
                _ = self.token.cancelled() => break,
                frame = source.next() => frame,
            };

            let message = match frame {
                Some(Ok(message)) => message,
                Some(Err(err)) => {
                    self.report(err.into()).await;
                    break;
                }
                None => {
                    self.report(TransportError::UnexpectedClose {
                        code: 1006,
                        reason: "stream ended".to_string(),
                    })
                    .await;
                    break;
                }
            };

            // a full pulse queue already carries the signal
            let _ = self.links.traffic.try_send(());

            match message {
                WsMessage::Text(text) => self.dispatch(text.as_bytes()).await,
                WsMessage::Binary(bytes) => self.dispatch(&bytes).await,
                WsMessage::Close(frame) => {
                    let (code, reason) = match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_string()),
                        None => (1005, String::new()),
                    };
                    self.report(TransportError::UnexpectedClose { code, reason })
                        .await;
                    break;
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
            }
        }

        debug!(
            exchange = %self.exchange,
            connection_id = %self.connection_id,
            "ws read loop stopped"
        );
    }

    async fn dispatch(&self, raw: &[u8]) {
        let payload: Value = match serde_json::from_slice(raw) {
            Ok(payload) => payload,
            Err(err) => {
                self.log_parse_fail(&err, raw);
                self.report(TransportError::Malformed(err.to_string())).await;
                return;
            }
        };
        self.log_frame_sample(raw);

        let event = match self
            .response_id_field
            .as_deref()
            .and_then(|field| extract_id(&payload, field))
        {
            Some(id) => match self.links.matcher.incoming(&id, payload) {
                Some(payload) => StreamEvent::Ack { id, payload },
                None => return,
            },
            None => StreamEvent::Data(payload),
        };

        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = self.links.data.send(event) => {}
        }
    }

    async fn report(&self, err: TransportError) {
        if self.closed.load(Ordering::Acquire) {
            debug!(
                exchange = %self.exchange,
                connection_id = %self.connection_id,
                error = %err,
                "ws read on locally closed socket"
            );
            return;
        }

        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = self.links.read_errors.send(ReadError {
                connection_id: self.connection_id,
                error: err,
            }) => {}
        }
    }

    fn log_frame_sample(&self, raw: &[u8]) {
        let count = self.frames_logged.fetch_add(1, Ordering::Relaxed);
        if count >= FRAME_SAMPLE_LIMIT {
            return;
        }
        let preview = truncate_for_log(&String::from_utf8_lossy(raw), RAW_LOG_MAX_BYTES);
        debug!(
            exchange = %self.exchange,
            connection_id = %self.connection_id,
            sample_index = count + 1,
            sample_limit = FRAME_SAMPLE_LIMIT,
            bytes = raw.len(),
            message = %preview,
            "ws frame sample"
        );
    }

    fn log_parse_fail(&self, err: &serde_json::Error, raw: &[u8]) {
        let count = self.parse_failures_logged.fetch_add(1, Ordering::Relaxed);
        if count >= PARSE_FAIL_LOG_LIMIT {
            return;
        }
        let preview = truncate_for_log(&String::from_utf8_lossy(raw), RAW_LOG_MAX_BYTES);
        warn!(
            exchange = %self.exchange,
            connection_id = %self.connection_id,
            sample_index = count + 1,
            sample_limit = PARSE_FAIL_LOG_LIMIT,
            error = %err,
            message = %preview,
            "ws frame parse failed"
        );
    }
}

async fn ping_loop(
    writer: Arc<Mutex<Option<WsSink>>>,
    handler: PingHandler,
    token: CancellationToken,
    connection_id: Uuid,
) {
    let mut ticker = tokio::time::interval(handler.interval);
    // first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let mut guard = writer.lock().await;
                let Some(sink) = guard.as_mut() else {
                    break;
                };
                if let Err(err) = sink.send(handler.message.to_message()).await {
                    debug!(connection_id = %connection_id, error = %err, "ws ping failed");
                    break;
                }
            }
        }
    }
}

/// Open a TCP stream to `target` through an HTTP CONNECT proxy.
async fn open_proxy_tunnel(proxy: &str, target: &str) -> Result<TcpStream> {
    let proxy_url =
        Url::parse(proxy).map_err(|err| TransportError::Proxy(format!("{proxy}: {err}")))?;
    let target_url =
        Url::parse(target).map_err(|err| TransportError::Proxy(format!("{target}: {err}")))?;

    let (proxy_host, proxy_port) = host_and_port(&proxy_url)?;
    let (target_host, target_port) = host_and_port(&target_url)?;

    let mut stream = TcpStream::connect((proxy_host.as_str(), proxy_port))
        .await
        .map_err(|err| TransportError::Proxy(format!("dial {proxy_host}:{proxy_port}: {err}")))?;

    let authority = format!("{target_host}:{target_port}");
    let request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|err| TransportError::Proxy(err.to_string()))?;

    let mut response = Vec::with_capacity(256);
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() >= PROXY_RESPONSE_MAX_BYTES {
            return Err(TransportError::Proxy("oversized CONNECT response".to_string()).into());
        }
        let byte = stream
            .read_u8()
            .await
            .map_err(|err| TransportError::Proxy(err.to_string()))?;
        response.push(byte);
    }

    let response = String::from_utf8_lossy(&response);
    let status_line = response.lines().next().unwrap_or_default();
    let accepted = status_line
        .split_whitespace()
        .nth(1)
        .is_some_and(|status| status == "200");
    if !accepted {
        return Err(TransportError::Proxy(format!("CONNECT rejected: {status_line}")).into());
    }

    Ok(stream)
}

fn host_and_port(url: &Url) -> Result<(String, u16)> {
    let host = url
        .host_str()
        .ok_or_else(|| TransportError::Proxy(format!("{url} has no host")))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| TransportError::Proxy(format!("{url} has no port")))?;
    Ok((host.to_string(), port))
}

fn truncate_for_log(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        return value.to_string();
    }
    let mut end = max_len;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = String::with_capacity(end + 3);
    out.push_str(&value[..end]);
    out.push_str("...");
    out
}

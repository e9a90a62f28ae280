/*
[INPUT]:  Traffic pulses, read errors, monitor timers
[OUTPUT]: Reconnects, traffic-timeout shutdowns, forwarded transport errors
[POS]:    Manager layer - background supervision loops
[UPDATE]: When changing reconnect or liveness policy
*/

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tracing::{debug, error, info, warn};

use crate::config::TRAFFIC_CHECK_PERIOD;
use crate::error::{Result, StreamError, is_disconnection_error};
use crate::manager::ConnectionManager;
use crate::manager::lifecycle::{restore_slot, take_slot};
use crate::types::{StreamEvent, StreamState};
use crate::ws::ReadError;

impl ConnectionManager {
    /// Start the long-lived connection monitor
    pub(crate) fn start_connection_monitor(&self) -> Result<()> {
        let started = self.update_status(|status| {
            if status.connection_monitor_running {
                return false;
            }
            status.connection_monitor_running = true;
            true
        });
        if !started {
            return Err(StreamError::MonitorAlreadyRunning);
        }

        let Some(errors) = take_slot(&self.inner.queues.read_errors_rx) else {
            self.update_status(|status| status.connection_monitor_running = false);
            return Err(StreamError::MonitorAlreadyRunning);
        };
        tokio::spawn(run_connection_monitor(self.clone(), errors));
        Ok(())
    }

    /// Start the traffic watchdog for this session unless one is already running
    pub(crate) fn start_traffic_monitor(&self) {
        let started = self.update_status(|status| {
            if status.traffic_monitor_running {
                return false;
            }
            status.traffic_monitor_running = true;
            true
        });
        if !started {
            return;
        }

        let Some(pulses) = take_slot(&self.inner.queues.traffic_rx) else {
            self.update_status(|status| status.traffic_monitor_running = false);
            return;
        };
        let token = self.inner.shutdown.current();
        let session = self.inner.tracker.token();
        tokio::spawn(run_traffic_monitor(self.clone(), pulses, token, session));
    }

    /// React to an error reported by a connection's read loop
    pub(crate) async fn handle_read_error(&self, report: ReadError) {
        let ReadError {
            connection_id,
            error: err,
        } = report;

        if is_disconnection_error(&err) {
            let live: Vec<_> = [self.connection(), self.auth_connection()]
                .into_iter()
                .flatten()
                .collect();
            if !live.is_empty() && live.iter().all(|connection| connection.id() != connection_id) {
                debug!(
                    exchange = %self.name(),
                    connection_id = %connection_id,
                    error = %err,
                    "disconnection of a retired connection ignored"
                );
                return;
            }

            warn!(
                exchange = %self.name(),
                connection_id = %connection_id,
                error = %err,
                "websocket disconnected"
            );
            // the reconnect dials fresh sockets for every flavour
            for connection in live {
                if let Err(err) = connection.shutdown().await {
                    debug!(exchange = %self.name(), error = %err, "surviving connection close failed");
                }
            }
            self.update_status(|status| {
                status.initialized = false;
                if status.state == StreamState::Connected {
                    status.state = StreamState::Enabled;
                }
            });
            // the venue forgot them along with the socket
            self.inner.subscriptions.purge();
            return;
        }

        if self
            .inner
            .queues
            .inbound_tx
            .send(StreamEvent::Error(err))
            .await
            .is_err()
        {
            debug!(exchange = %self.name(), "inbound queue closed, transport error dropped");
        }
    }

    /// Hand the error queue back and restart when re-enabled during exit
    fn release_connection_monitor(&self, errors: mpsc::Receiver<ReadError>) {
        restore_slot(&self.inner.queues.read_errors_rx, errors);
        self.update_status(|status| status.connection_monitor_running = false);
        info!(exchange = %self.name(), "connection monitor exiting");

        if self.is_enabled() && self.start_connection_monitor().is_ok() {
            info!(exchange = %self.name(), "connection monitor restarted");
        }
    }

    fn release_traffic_monitor(&self, pulses: mpsc::Receiver<()>) {
        restore_slot(&self.inner.queues.traffic_rx, pulses);
        self.update_status(|status| status.traffic_monitor_running = false);
    }
}

/// Reconnect on every tick while enabled, exit once disabled.
///
/// Boxed because the loop reconnects through `connect`, which may start
/// this monitor again.
pub(crate) fn run_connection_monitor(
    manager: ConnectionManager,
    mut errors: mpsc::Receiver<ReadError>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let exchange = manager.name();
        let delay = manager.connection_monitor_delay();
        let timer = sleep(delay);
        tokio::pin!(timer);

        loop {
            debug!(exchange = %exchange, "connection monitor cycle");
            if !manager.is_enabled() {
                if manager.is_connected()
                    && let Err(err) = manager.shutdown().await
                {
                    error!(exchange = %exchange, error = %err, "shutdown of disabled websocket failed");
                }
                break;
            }

            tokio::select! {
                err = errors.recv() => match err {
                    Some(err) => manager.handle_read_error(err).await,
                    None => break,
                },
                _ = &mut timer => {
                    if !manager.is_connecting()
                        && !manager.is_connected()
                        && let Err(err) = manager.connect().await
                    {
                        error!(exchange = %exchange, error = %err, "websocket reconnect failed");
                    }
                    timer.as_mut().reset(Instant::now() + delay);
                }
            }
        }

        manager.release_connection_monitor(errors);
    })
}

/// Shut the session down when no frame arrives within the traffic timeout.
async fn run_traffic_monitor(
    manager: ConnectionManager,
    mut pulses: mpsc::Receiver<()>,
    token: CancellationToken,
    session: TaskTrackerToken,
) {
    let exchange = manager.name();
    let traffic_timeout = manager.traffic_timeout();
    let timer = sleep(traffic_timeout);
    tokio::pin!(timer);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            pulse = pulses.recv() => {
                if pulse.is_none() {
                    break;
                }
                timer.as_mut().reset(Instant::now() + traffic_timeout);
                manager.update_status(|status| {
                    if status.state == StreamState::Enabled {
                        status.state = StreamState::Connected;
                    }
                });
            }
            _ = &mut timer => {
                warn!(
                    exchange = %exchange,
                    timeout_ms = traffic_timeout.as_millis() as u64,
                    "no traffic within timeout, reconnecting"
                );
                manager.release_traffic_monitor(pulses);
                // shutdown waits on every session task, this one included
                drop(session);
                if manager.is_connected()
                    && let Err(err) = manager.shutdown().await
                {
                    error!(exchange = %exchange, error = %err, "traffic monitor shutdown failed");
                }
                return;
            }
        }

        if manager.is_connected() {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = sleep(TRAFFIC_CHECK_PERIOD) => {}
            }
        }
    }

    debug!(exchange = %exchange, "traffic monitor stopped");
    manager.release_traffic_monitor(pulses);
    drop(session);
}

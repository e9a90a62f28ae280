/*
[INPUT]:  Inbound queue fed by connections and venue collaborators
[OUTPUT]: The same events, in order, on the outbound processing queue
[POS]:    Manager layer - per-session data relay with backpressure
[UPDATE]: When changing backlog or drain behaviour
*/

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::manager::ConnectionManager;
use crate::manager::lifecycle::{restore_slot, take_slot};
use crate::types::{DataSink, StreamEvent};

impl ConnectionManager {
    /// Start the relay for this session unless one is already running
    pub(crate) fn start_data_relay(&self) {
        let started = self.update_status(|status| {
            if status.data_relay_running {
                return false;
            }
            status.data_relay_running = true;
            true
        });
        if !started {
            return;
        }

        let Some(inbound) = take_slot(&self.inner.queues.inbound_rx) else {
            self.update_status(|status| status.data_relay_running = false);
            warn!(exchange = %self.name(), "inbound queue already in use, data relay not started");
            return;
        };

        let manager = self.clone();
        let token = self.inner.shutdown.current();
        self.inner.tracker.spawn(async move {
            let exchange = manager.name();
            let outbound = manager.inner.queues.outbound_tx.clone();
            let inbound = run_data_relay(&exchange, inbound, outbound, token).await;
            restore_slot(&manager.inner.queues.inbound_rx, inbound);
            manager.update_status(|status| status.data_relay_running = false);
            debug!(exchange = %exchange, "data relay stopped");
        });
    }
}

/// Move events from `inbound` to `outbound` until `token` fires.
///
/// A full outbound queue blocks the relay rather than dropping events. On
/// shutdown whatever is still queued is offered to `outbound` without waiting.
pub(crate) async fn run_data_relay(
    exchange: &str,
    mut inbound: mpsc::Receiver<StreamEvent>,
    outbound: DataSink,
    token: CancellationToken,
) -> mpsc::Receiver<StreamEvent> {
    let mut backlog_warned = false;
    let mut pending = None;

    loop {
        let event = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            event = inbound.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match outbound.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                if !backlog_warned {
                    warn!(
                        exchange,
                        capacity = outbound.max_capacity(),
                        "outbound queue full, processing backlog"
                    );
                    backlog_warned = true;
                }
                tokio::select! {
                    _ = token.cancelled() => {
                        pending = Some(event);
                        break;
                    }
                    permit = outbound.reserve() => match permit {
                        Ok(permit) => permit.send(event),
                        Err(_) => break,
                    },
                }
            }
            Err(TrySendError::Closed(_)) => {
                debug!(exchange, "outbound queue closed, stopping relay");
                break;
            }
        }
    }

    let mut discarded = 0usize;
    let remaining = pending
        .into_iter()
        .chain(std::iter::from_fn(|| inbound.try_recv().ok()));
    for event in remaining {
        if outbound.try_send(event).is_err() {
            discarded += 1;
        }
    }
    if discarded > 0 {
        warn!(exchange, discarded, "data relay discarded events on shutdown");
    }

    inbound
}

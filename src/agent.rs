//! Background sync agent: a context that outlives any page and drains the
//! durable store one record at a time.

use crate::db::DurableStore;
use crate::error::StoreError;
use crate::model::SendResult;
use crate::notifier::DeliveryNotifier;
use crate::scheduler::Scheduler;
use crate::transport::Transport;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

pub const DEFAULT_SYNC_TAG: &str = "sendJSON";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeSignal {
    /// Background-sync registration: runs once connectivity is available.
    Sync(String),
    /// Same-process message asking for an immediate drain.
    Message(String),
}

/// Cloneable sender half used by page contexts to wake the agent.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    tx: mpsc::UnboundedSender<WakeSignal>,
}

impl AgentHandle {
    /// Returns false once the agent has stopped.
    pub fn register_sync(&self, tag: &str) -> bool {
        self.tx.send(WakeSignal::Sync(tag.to_string())).is_ok()
    }

    pub fn post_message(&self, tag: &str) -> bool {
        self.tx.send(WakeSignal::Message(tag.to_string())).is_ok()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    /// Records dropped because their request can never be sent.
    pub rejected: usize,
    /// Record whose send failed at the network level, ending the drain.
    pub stalled_on: Option<i64>,
}

pub struct SyncAgent {
    store: Arc<dyn DurableStore>,
    transport: Arc<dyn Transport>,
    notifier: DeliveryNotifier,
    scheduler: Scheduler,
    sync_tag: String,
    rx: mpsc::UnboundedReceiver<WakeSignal>,
    sync_pending: bool,
}

impl SyncAgent {
    pub fn new(
        store: Arc<dyn DurableStore>,
        transport: Arc<dyn Transport>,
        notifier: DeliveryNotifier,
        scheduler: Scheduler,
        sync_tag: impl Into<String>,
    ) -> (Self, AgentHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let agent = Self {
            store,
            transport,
            notifier,
            scheduler,
            sync_tag: sync_tag.into(),
            rx,
            sync_pending: false,
        };
        (agent, AgentHandle { tx })
    }

    /// Serve wake signals until every [`AgentHandle`] is dropped.
    pub async fn run(mut self) {
        let mut connectivity = self.scheduler.connectivity();
        let mut was_online = *connectivity.borrow_and_update();
        loop {
            tokio::select! {
                signal = self.rx.recv() => match signal {
                    Some(signal) => self.on_signal(signal).await,
                    None => break,
                },
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *connectivity.borrow_and_update();
                    if online && !was_online && self.sync_pending {
                        self.sync_pending = false;
                        self.sync().await;
                    }
                    was_online = online;
                }
            }
        }
        debug!("sync agent stopped");
    }

    async fn on_signal(&mut self, signal: WakeSignal) {
        match signal {
            WakeSignal::Sync(tag) if tag == self.sync_tag => {
                if self.scheduler.is_online() {
                    self.sync().await;
                } else {
                    // Registrations coalesce until connectivity returns.
                    self.sync_pending = true;
                    debug!("sync registered while offline");
                }
            }
            WakeSignal::Message(tag) if tag == self.sync_tag => {
                if let Err(err) = self.drain().await {
                    error!(?err, "outbox drain failed");
                }
            }
            other => debug!(?other, "ignoring wake signal"),
        }
    }

    /// A sync that could not finish stays registered for the next restore.
    async fn sync(&mut self) {
        match self.drain().await {
            Ok(report) if report.stalled_on.is_some() => self.sync_pending = true,
            Ok(_) => {}
            Err(err) => {
                error!(?err, "outbox drain failed");
                self.sync_pending = true;
            }
        }
    }

    /// Send pending records oldest first, one in flight at a time, until the
    /// store is empty or a send gets no response. Records whose request can
    /// never be built are deleted and skipped.
    #[instrument(skip_all)]
    pub async fn drain(&self) -> Result<DrainReport, StoreError> {
        let mut report = DrainReport::default();
        while let Some(send) = self.store.next_oldest().await? {
            match self
                .transport
                .send_with_response(&send.endpoint, &send.json_string)
                .await
            {
                Ok(response) => {
                    self.store.delete(send.id).await?;
                    info!(
                        id = send.id,
                        status = response.status_code,
                        endpoint = %send.endpoint,
                        "outbox record delivered"
                    );
                    self.notifier.publish(&SendResult {
                        id: send.id,
                        result: response.result,
                        status_code: response.status_code,
                    });
                    report.delivered += 1;
                }
                Err(err) if !err.is_retryable() => {
                    error!(?err, id = send.id, endpoint = %send.endpoint, "unsendable record dropped");
                    self.store.delete(send.id).await?;
                    report.rejected += 1;
                }
                Err(err) => {
                    warn!(?err, id = send.id, "send failed; record kept for retry");
                    report.stalled_on = Some(send.id);
                    break;
                }
            }
        }
        Ok(report)
    }
}

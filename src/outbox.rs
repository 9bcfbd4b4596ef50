//! Outbox coordinator: the `post_json` entry point of one execution context and
//! the sweep that resends whatever is still pending.
//!
//! Every failure falls through to the next weaker tier:
//! durable + deferred commit, durable + immediate commit, flat list, and
//! finally a send that nobody retries. Nothing is surfaced to the caller.

use crate::agent::{AgentHandle, DEFAULT_SYNC_TAG};
use crate::db::DurableStore;
use crate::fallback::FlatList;
use crate::model::{Capabilities, CommitMode, ContextId, Lifecycle, PendingEntry, SendResult};
use crate::notifier::{
    Broadcast, DeliveryNotifier, NotifyMode, PendingCallbacks, SendCallback,
    DEFAULT_BROADCAST_KEY, DEFAULT_MESSAGE_TYPE,
};
use crate::scheduler::Scheduler;
use crate::transport::{SendResponse, Transport};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Collaborators supplied by the hosting environment.
pub struct OutboxEnv {
    pub store: Option<Arc<dyn DurableStore>>,
    pub fallback: Option<FlatList>,
    pub transport: Arc<dyn Transport>,
    pub agent: Option<AgentHandle>,
    pub broadcast: Arc<dyn Broadcast>,
    pub scheduler: Scheduler,
    /// Capabilities the configuration allows; intersected with what is present.
    pub allowed: Capabilities,
    pub sync_tag: String,
    pub message_type: String,
    pub broadcast_key: String,
}

impl OutboxEnv {
    pub fn new(
        transport: Arc<dyn Transport>,
        broadcast: Arc<dyn Broadcast>,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            store: None,
            fallback: None,
            transport,
            agent: None,
            broadcast,
            scheduler,
            allowed: Capabilities::default(),
            sync_tag: DEFAULT_SYNC_TAG.to_string(),
            message_type: DEFAULT_MESSAGE_TYPE.to_string(),
            broadcast_key: DEFAULT_BROADCAST_KEY.to_string(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_fallback(mut self, fallback: FlatList) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_agent(mut self, agent: AgentHandle) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn with_capabilities(mut self, allowed: Capabilities) -> Self {
        self.allowed = allowed;
        self
    }

    fn probe(&self) -> Capabilities {
        Capabilities {
            has_durable_store: self.store.is_some(),
            has_sync_commit: self
                .store
                .as_ref()
                .map(|s| s.supports_immediate_commit())
                .unwrap_or(false),
            has_background_agent: self.agent.is_some(),
            has_best_effort_transport: true,
            has_fallback_storage: self.fallback.is_some(),
        }
    }
}

pub struct OutboxCoordinator {
    context: ContextId,
    caps: Capabilities,
    store: Option<Arc<dyn DurableStore>>,
    fallback: Option<FlatList>,
    transport: Arc<dyn Transport>,
    agent: Option<AgentHandle>,
    notifier: DeliveryNotifier,
    scheduler: Scheduler,
    sync_tag: String,
    callbacks: Arc<PendingCallbacks>,
    lifecycle: Mutex<Lifecycle>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for OutboxCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxCoordinator")
            .field("context", &self.context)
            .field("caps", &self.caps)
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

impl OutboxCoordinator {
    pub fn new(env: OutboxEnv) -> Arc<Self> {
        let caps = env.probe().intersect(env.allowed);
        let context = ContextId::new();
        let mode = if caps.has_background_agent {
            NotifyMode::Direct
        } else {
            NotifyMode::Broadcast
        };
        let notifier = DeliveryNotifier::new(env.broadcast, mode, context)
            .with_topics(env.message_type, env.broadcast_key);
        debug!(%context, ?caps, "outbox coordinator created");
        Arc::new(Self {
            context,
            caps,
            store: env.store.filter(|_| caps.has_durable_store),
            fallback: env.fallback.filter(|_| caps.has_fallback_storage),
            transport: env.transport,
            agent: env.agent.filter(|_| caps.has_background_agent),
            notifier,
            scheduler: env.scheduler,
            sync_tag: env.sync_tag,
            callbacks: Arc::new(PendingCallbacks::new()),
            lifecycle: Mutex::new(Lifecycle::Active),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    pub fn pending_callbacks(&self) -> usize {
        self.callbacks.len()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_lifecycle(&self, lifecycle: Lifecycle) {
        *self.lifecycle.lock().unwrap_or_else(|p| p.into_inner()) = lifecycle;
    }

    /// Wire the context to its environment: open the store, listen for
    /// completions, and register the sweep triggers. Without a background
    /// agent this also performs the page-load sweep before returning.
    pub async fn install(self: &Arc<Self>) {
        self.open().await;

        let mut handles = vec![self.notifier.listen(self.callbacks.clone())];
        let weak = Arc::downgrade(self);
        handles.push(self.scheduler.on_wake(sweep_handler(weak.clone())));
        if !self.caps.has_background_agent {
            handles.push(
                self.scheduler
                    .on_connectivity_restored(sweep_handler(weak)),
            );
        }
        self.tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(handles);

        if !self.caps.has_background_agent {
            self.flush_outbox().await;
        }
    }

    /// Start opening the store early so it is ready if the page unloads.
    pub async fn open(&self) {
        if let Some(store) = &self.store {
            if let Err(err) = store.open().await {
                warn!(?err, context = %self.context, "durable store unavailable");
            }
        }
    }

    /// Release the store and stop every background task of this context.
    pub async fn close(&self) {
        for task in self.tasks.lock().unwrap_or_else(|p| p.into_inner()).drain(..) {
            task.abort();
        }
        if let Some(store) = &self.store {
            store.close().await;
        }
    }

    /// Page lifecycle transition reported by the host.
    pub async fn enter(&self, lifecycle: Lifecycle) {
        self.set_lifecycle(lifecycle);
        if lifecycle == Lifecycle::Frozen {
            if let Some(store) = &self.store {
                store.close().await;
            }
        }
        debug!(context = %self.context, lifecycle = lifecycle.as_str(), "lifecycle changed");
    }

    /// Thawed after a freeze, or a cancelled unload.
    pub async fn resume(&self) {
        self.set_lifecycle(Lifecycle::Active);
        self.open().await;
    }

    /// Convenience wrapper taking a closure as the completion callback.
    pub async fn post_json_with<F>(&self, endpoint: &str, json_string: &str, callback: F)
    where
        F: FnOnce(Option<Value>, u16) + Send + 'static,
    {
        self.post_json(endpoint, json_string, Some(Box::new(callback)))
            .await
    }

    /// Submit an already-serialized JSON body for eventual delivery.
    ///
    /// Returns once the submission is persisted and signalled, or once the
    /// immediate attempt has been made. The callback fires at most once, and
    /// only if the send completes while this context is alive.
    #[instrument(skip_all, fields(context = %self.context, endpoint = %endpoint))]
    pub async fn post_json(
        &self,
        endpoint: &str,
        json_string: &str,
        callback: Option<SendCallback>,
    ) {
        let unloading = self.lifecycle().is_unloading();
        match &self.store {
            None => self.try_send_json(endpoint, json_string, unloading, callback).await,
            Some(store) if unloading => self.save_immediate(store, endpoint, json_string).await,
            Some(store) => {
                self.save_deferred(store, endpoint, json_string, callback)
                    .await
            }
        }
    }

    /// Persist a submission without attempting to send it: the durable store
    /// first, then the flat list. Returns false if neither tier took it.
    #[instrument(skip_all, fields(context = %self.context, endpoint = %endpoint))]
    pub async fn queue_json(&self, endpoint: &str, json_string: &str) -> bool {
        if let Some(store) = &self.store {
            let mode = if self.caps.has_sync_commit {
                CommitMode::Immediate
            } else {
                CommitMode::Deferred
            };
            match store.add(endpoint, json_string, mode).await {
                Ok(id) => {
                    debug!(id, "submission queued");
                    if let Some(agent) = &self.agent {
                        agent.register_sync(&self.sync_tag);
                    }
                    return true;
                }
                Err(err) => warn!(?err, "cannot queue submission in store"),
            }
        }
        match &self.fallback {
            Some(fallback) => match fallback.push(PendingEntry::new(endpoint, json_string)) {
                Ok(()) => {
                    debug!("submission queued in fallback list");
                    true
                }
                Err(err) => {
                    warn!(?err, "cannot park submission in fallback list");
                    false
                }
            },
            None => false,
        }
    }

    async fn save_deferred(
        &self,
        store: &Arc<dyn DurableStore>,
        endpoint: &str,
        json_string: &str,
        callback: Option<SendCallback>,
    ) {
        let id = match store.add(endpoint, json_string, CommitMode::Deferred).await {
            Ok(id) => id,
            Err(err) => {
                warn!(?err, "cannot persist submission; sending now");
                return self.try_send_json(endpoint, json_string, false, callback).await;
            }
        };
        debug!(id, "submission persisted");
        if let Some(cb) = callback {
            self.callbacks.register(id, cb);
        }
        match &self.agent {
            Some(agent) if agent.register_sync(&self.sync_tag) => {}
            // Registration impossible: try to send it ourselves.
            _ => self.flush_outbox().await,
        }
    }

    async fn save_immediate(&self, store: &Arc<dyn DurableStore>, endpoint: &str, json_string: &str) {
        if !self.caps.has_sync_commit {
            return self.try_send_json(endpoint, json_string, true, None).await;
        }
        match store.add(endpoint, json_string, CommitMode::Immediate).await {
            Ok(id) => {
                debug!(id, "submission committed during unload");
                match &self.agent {
                    Some(agent) => {
                        agent.register_sync(&self.sync_tag);
                    }
                    // Nothing outlives this context: let a beacon carry the body
                    // now; the record stays for the next sweep to confirm.
                    None if self.caps.has_best_effort_transport => {
                        let scheduled = self.transport.send_best_effort(endpoint, json_string);
                        debug!(id, scheduled, "best-effort send during unload");
                    }
                    None => {}
                }
            }
            Err(err) => {
                warn!(?err, "cannot commit submission during unload");
                self.try_send_json(endpoint, json_string, true, None).await;
            }
        }
    }

    /// Send now, and park the body in the flat list if it cannot leave.
    async fn try_send_json(
        &self,
        endpoint: &str,
        json_string: &str,
        unloading: bool,
        callback: Option<SendCallback>,
    ) {
        if self.send_json(endpoint, json_string, unloading, callback).await {
            return;
        }
        match &self.fallback {
            Some(fallback) => {
                if let Err(err) = fallback.push(PendingEntry::new(endpoint, json_string)) {
                    warn!(?err, endpoint, "cannot park submission in fallback list");
                } else {
                    debug!(endpoint, "submission parked in fallback list");
                }
            }
            None => warn!(endpoint, "submission could not be sent or stored"),
        }
    }

    /// Returns false only when the send failed at the network level. A request
    /// that can never be built is logged and counts as done.
    async fn send_json(
        &self,
        endpoint: &str,
        json_string: &str,
        unloading: bool,
        callback: Option<SendCallback>,
    ) -> bool {
        if unloading
            && self.caps.has_best_effort_transport
            && self.transport.send_best_effort(endpoint, json_string)
        {
            return true;
        }
        match self.transport.send_with_response(endpoint, json_string).await {
            Ok(SendResponse {
                result,
                status_code,
            }) => {
                debug!(endpoint, status = status_code, "sent");
                if let Some(cb) = callback.filter(|_| !unloading) {
                    cb(result, status_code);
                }
                true
            }
            Err(err) if !err.is_retryable() => {
                error!(?err, endpoint, "unsendable submission dropped");
                true
            }
            Err(err) => {
                warn!(?err, endpoint, "send failed");
                false
            }
        }
    }

    /// Resend everything still pending. A no-op while offline.
    #[instrument(skip_all, fields(context = %self.context))]
    pub async fn flush_outbox(&self) {
        if !self.scheduler.is_online() {
            debug!("offline; sweep skipped");
            return;
        }
        self.reconcile_fallback().await;

        if let Some(agent) = &self.agent {
            // The agent avoids several contexts racing on the same records.
            if agent.post_message(&self.sync_tag) {
                return;
            }
            warn!("background agent gone; sweeping in this context");
        }

        let Some(store) = &self.store else {
            return;
        };
        let pending = match store.list().await {
            Ok(pending) => pending,
            Err(err) => {
                warn!(?err, "cannot list outbox");
                return;
            }
        };
        for send in pending {
            match self
                .transport
                .send_with_response(&send.endpoint, &send.json_string)
                .await
            {
                Ok(response) => self.confirm_record_sent(store, send.id, response).await,
                Err(err) if !err.is_retryable() => {
                    error!(?err, id = send.id, endpoint = %send.endpoint, "unsendable record dropped");
                    if let Err(err) = store.delete(send.id).await {
                        warn!(?err, id = send.id, "cannot delete unsendable record");
                    }
                }
                Err(err) => warn!(?err, id = send.id, "resend failed; record kept"),
            }
        }
    }

    /// Move fallback entries into the durable store, or send them directly
    /// when it cannot take them.
    async fn reconcile_fallback(&self) {
        let Some(fallback) = &self.fallback else {
            return;
        };
        let entries = match fallback.take_all() {
            Ok(entries) => entries,
            Err(err) => {
                warn!(?err, "cannot read fallback list");
                return;
            }
        };
        if entries.is_empty() {
            return;
        }
        info!(count = entries.len(), "reconciling fallback entries");
        for entry in entries {
            let stored = match &self.store {
                Some(store) => store
                    .add(&entry.endpoint, &entry.json_string, CommitMode::Deferred)
                    .await
                    .map_err(|err| warn!(?err, "cannot move fallback entry to store"))
                    .is_ok(),
                None => false,
            };
            if !stored {
                self.try_send_json(&entry.endpoint, &entry.json_string, false, None)
                    .await;
            }
        }
    }

    async fn confirm_record_sent(
        &self,
        store: &Arc<dyn DurableStore>,
        id: i64,
        response: SendResponse,
    ) {
        if let Err(err) = store.delete(id).await {
            warn!(?err, id, "cannot delete delivered record");
        }
        info!(id, status = response.status_code, "outbox record delivered");
        let result = SendResult {
            id,
            result: response.result,
            status_code: response.status_code,
        };
        self.notifier.publish(&result);
        self.handle_completion(result);
    }

    /// Fire the local callback for a completed send, if this context still has it.
    pub fn handle_completion(&self, result: SendResult) -> bool {
        self.callbacks
            .fire(result.id, result.result, result.status_code)
    }
}

impl Drop for OutboxCoordinator {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap_or_else(|p| p.into_inner()).drain(..) {
            task.abort();
        }
    }
}

type SweepFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn sweep_handler(weak: Weak<OutboxCoordinator>) -> impl Fn() -> SweepFuture + Send + Sync + 'static {
    move || {
        let weak = weak.clone();
        let sweep: SweepFuture = Box::pin(async move {
            if let Some(coordinator) = weak.upgrade() {
                coordinator.flush_outbox().await;
            }
        });
        sweep
    }
}

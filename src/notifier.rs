//! Delivery notifier: routes a completed send back to whichever context holds
//! the caller's callback.
//!
//! Two modes exist. With a background agent, the agent posts a
//! `syncCompleted` message to every context. Without one, the context that
//! confirmed the send publishes the bare [`SendResult`] on the broadcast key
//! and every *other* context reacts to it.

use crate::model::{ContextId, SendResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const DEFAULT_MESSAGE_TYPE: &str = "syncCompleted";
pub const DEFAULT_BROADCAST_KEY: &str = "sendJSON";

const CHANNEL_CAPACITY: usize = 256;

/// Caller-supplied completion callback: parsed response body and status code.
pub type SendCallback = Box<dyn FnOnce(Option<Value>, u16) + Send + 'static>;

/// One published message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub origin: ContextId,
    pub payload: Value,
}

pub trait Broadcast: Send + Sync {
    fn publish(&self, topic: &str, envelope: Envelope);
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<Envelope>;
}

/// In-process pub/sub: one tokio broadcast channel per topic, shared by every
/// context holding a clone.
#[derive(Debug, Clone, Default)]
pub struct ChannelBroadcast {
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<Envelope>>>>,
}

impl ChannelBroadcast {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Envelope> {
        let mut topics = self.topics.lock().unwrap_or_else(|p| p.into_inner());
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Broadcast for ChannelBroadcast {
    fn publish(&self, topic: &str, envelope: Envelope) {
        // No receivers is normal: nobody may be listening.
        let delivered = self.sender(topic).send(envelope).unwrap_or(0);
        debug!(topic, delivered, "published");
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<Envelope> {
        self.sender(topic).subscribe()
    }
}

/// In-memory map from record id to callback, owned by one context.
#[derive(Default)]
pub struct PendingCallbacks {
    inner: Mutex<HashMap<i64, SendCallback>>,
}

impl PendingCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: i64, callback: SendCallback) {
        self.lock().insert(id, callback);
    }

    /// Run and forget the callback for `id`. Returns whether one was found.
    pub fn fire(&self, id: i64, result: Option<Value>, status_code: u16) -> bool {
        let callback = self.lock().remove(&id);
        match callback {
            Some(cb) => {
                cb(result, status_code);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, SendCallback>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl std::fmt::Debug for PendingCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCallbacks")
            .field("pending", &self.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyMode {
    /// A background agent posts messages to every context.
    Direct,
    /// Contexts tell each other through the broadcast key.
    Broadcast,
}

#[derive(Debug, Serialize, Deserialize)]
struct SyncCompletedMessage {
    #[serde(rename = "type")]
    kind: String,
    id: i64,
    result: Option<Value>,
    #[serde(rename = "statusCode")]
    status_code: u16,
}

#[derive(Clone)]
pub struct DeliveryNotifier {
    channel: Arc<dyn Broadcast>,
    mode: NotifyMode,
    origin: ContextId,
    message_type: String,
    broadcast_key: String,
}

impl DeliveryNotifier {
    pub fn new(channel: Arc<dyn Broadcast>, mode: NotifyMode, origin: ContextId) -> Self {
        Self {
            channel,
            mode,
            origin,
            message_type: DEFAULT_MESSAGE_TYPE.to_string(),
            broadcast_key: DEFAULT_BROADCAST_KEY.to_string(),
        }
    }

    pub fn with_topics(
        mut self,
        message_type: impl Into<String>,
        broadcast_key: impl Into<String>,
    ) -> Self {
        self.message_type = message_type.into();
        self.broadcast_key = broadcast_key.into();
        self
    }

    fn topic(&self) -> &str {
        match self.mode {
            NotifyMode::Direct => &self.message_type,
            NotifyMode::Broadcast => &self.broadcast_key,
        }
    }

    pub fn publish(&self, result: &SendResult) {
        let payload = match self.mode {
            NotifyMode::Direct => serde_json::to_value(SyncCompletedMessage {
                kind: self.message_type.clone(),
                id: result.id,
                result: result.result.clone(),
                status_code: result.status_code,
            }),
            NotifyMode::Broadcast => serde_json::to_value(result),
        };
        match payload {
            Ok(payload) => self.channel.publish(
                self.topic(),
                Envelope {
                    origin: self.origin,
                    payload,
                },
            ),
            Err(err) => warn!(?err, id = result.id, "cannot encode completion"),
        }
    }

    /// Turn a received envelope into a result this context should act on.
    pub fn decode(&self, envelope: &Envelope) -> Option<SendResult> {
        match self.mode {
            NotifyMode::Direct => {
                let msg: SyncCompletedMessage =
                    serde_json::from_value(envelope.payload.clone()).ok()?;
                if msg.kind != self.message_type {
                    return None;
                }
                Some(SendResult {
                    id: msg.id,
                    result: msg.result,
                    status_code: msg.status_code,
                })
            }
            NotifyMode::Broadcast => {
                // The publisher already ran its own callback.
                if envelope.origin == self.origin {
                    return None;
                }
                serde_json::from_value(envelope.payload.clone()).ok()
            }
        }
    }

    /// Fire callbacks from `callbacks` for every completion heard on this
    /// notifier's topic until the channel closes.
    pub fn listen(&self, callbacks: Arc<PendingCallbacks>) -> JoinHandle<()> {
        let mut rx = self.channel.subscribe(self.topic());
        let notifier = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        if let Some(result) = notifier.decode(&envelope) {
                            let fired =
                                callbacks.fire(result.id, result.result, result.status_code);
                            debug!(id = result.id, fired, "completion received");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "completion notices dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

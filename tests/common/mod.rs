#![allow(dead_code)]

use async_trait::async_trait;
use json_outbox::db::{DurableStore, SqliteStore};
use json_outbox::error::{StoreError, TransportError};
use json_outbox::model::{CommitMode, PendingSend};
use json_outbox::scheduler::Scheduler;
use json_outbox::transport::{SendResponse, Transport};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub async fn setup_store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap())
}

#[derive(Debug, Clone)]
pub enum Reply {
    Respond(u16, Option<Value>),
    /// No response: the request never reached a server.
    Fail,
    /// The request cannot be built at all.
    Reject,
}

/// Transport double recording every attempt. Replies are consumed in order;
/// once exhausted every send answers 200 with an empty body.
#[derive(Clone)]
pub struct RecordingTransport {
    replies: Arc<Mutex<VecDeque<Reply>>>,
    calls: Arc<Mutex<Vec<(String, String)>>>,
    beacons: Arc<Mutex<Vec<(String, String)>>>,
    beacon_ok: Arc<AtomicBool>,
    delay: Duration,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    network: Option<Scheduler>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            replies: Arc::default(),
            calls: Arc::default(),
            beacons: Arc::default(),
            beacon_ok: Arc::new(AtomicBool::new(true)),
            delay: Duration::ZERO,
            in_flight: Arc::default(),
            max_in_flight: Arc::default(),
            network: None,
        }
    }

    pub fn with_replies(replies: Vec<Reply>) -> Self {
        let t = Self::new();
        t.replies.lock().unwrap().extend(replies);
        t
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail every send while `scheduler` reports offline.
    pub fn following(mut self, scheduler: &Scheduler) -> Self {
        self.network = Some(scheduler.clone());
        self
    }

    pub fn set_beacon_ok(&self, ok: bool) {
        self.beacon_ok.store(ok, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn beacons(&self) -> Vec<(String, String)> {
        self.beacons.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn offline(&self) -> bool {
        self.network.as_ref().map(|s| !s.is_online()).unwrap_or(false)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn send_best_effort(&self, endpoint: &str, json_string: &str) -> bool {
        self.beacons
            .lock()
            .unwrap()
            .push((endpoint.to_string(), json_string.to_string()));
        self.beacon_ok.load(Ordering::SeqCst) && !self.offline()
    }

    async fn send_with_response(
        &self,
        endpoint: &str,
        json_string: &str,
    ) -> Result<SendResponse, TransportError> {
        self.calls
            .lock()
            .unwrap()
            .push((endpoint.to_string(), json_string.to_string()));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.offline() {
            return Err(TransportError::Unreachable {
                endpoint: endpoint.to_string(),
                reason: "offline".into(),
            });
        }
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Reply::Respond(200, None));
        match reply {
            Reply::Respond(status_code, result) => Ok(SendResponse {
                result,
                status_code,
            }),
            Reply::Fail => Err(TransportError::Unreachable {
                endpoint: endpoint.to_string(),
                reason: "connection refused".into(),
            }),
            Reply::Reject => Err(TransportError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                reason: "relative URL without a base".into(),
            }),
        }
    }
}

/// A durable store that can never be opened or written.
#[derive(Debug, Default)]
pub struct UnavailableStore {
    pub attempts: AtomicUsize,
}

#[async_trait]
impl DurableStore for UnavailableStore {
    async fn open(&self) -> Result<(), StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Unavailable("private mode".into()))
    }

    async fn close(&self) {}

    fn supports_immediate_commit(&self) -> bool {
        true
    }

    async fn add(&self, _: &str, _: &str, _: CommitMode) -> Result<i64, StoreError> {
        self.open().await.map(|_| 0)
    }

    async fn list(&self) -> Result<Vec<PendingSend>, StoreError> {
        self.open().await.map(|_| Vec::new())
    }

    async fn next_oldest(&self) -> Result<Option<PendingSend>, StoreError> {
        self.open().await.map(|_| None)
    }

    async fn delete(&self, _: i64) -> Result<(), StoreError> {
        self.open().await
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F: Fn() -> bool>(check: F) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// One queued request as stored in the durable outbox table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSend {
    pub id: i64,
    pub endpoint: String,
    #[serde(rename = "jsonString")]
    pub json_string: String,
}

/// A record in the flat-list fallback. There is no id in this tier: nothing
/// in the page can reconnect a callback to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub endpoint: String,
    #[serde(rename = "jsonString")]
    pub json_string: String,
}

impl PendingEntry {
    pub fn new(endpoint: impl Into<String>, json_string: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            json_string: json_string.into(),
        }
    }
}

/// Outcome of a POST that received an HTTP response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendResult {
    pub id: i64,
    pub result: Option<Value>,
    #[serde(rename = "statusCode")]
    pub status_code: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    Active,
    /// unload, beforeunload or pagehide is being dispatched.
    Unloading,
    /// The context has been frozen; its store connection is closed.
    Frozen,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Active => "active",
            Lifecycle::Unloading => "unloading",
            Lifecycle::Frozen => "frozen",
        }
    }

    /// Whether further asynchronous work may be cut off at any moment.
    pub fn is_unloading(&self) -> bool {
        !matches!(self, Lifecycle::Active)
    }
}

/// How an insert into the durable store is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Normal page lifetime: a single autocommitted INSERT.
    Deferred,
    /// The page is unloading: the INSERT runs in an explicit transaction that
    /// is committed before `add` returns.
    Immediate,
}

/// What the hosting environment can offer, computed once per context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub has_durable_store: bool,
    pub has_sync_commit: bool,
    pub has_background_agent: bool,
    pub has_best_effort_transport: bool,
    pub has_fallback_storage: bool,
}

impl Capabilities {
    pub fn none() -> Self {
        Self {
            has_durable_store: false,
            has_sync_commit: false,
            has_background_agent: false,
            has_best_effort_transport: false,
            has_fallback_storage: false,
        }
    }

    /// Keep only what both sides allow.
    pub fn intersect(self, other: Capabilities) -> Self {
        Self {
            has_durable_store: self.has_durable_store && other.has_durable_store,
            has_sync_commit: self.has_sync_commit && other.has_sync_commit,
            has_background_agent: self.has_background_agent && other.has_background_agent,
            has_best_effort_transport: self.has_best_effort_transport
                && other.has_best_effort_transport,
            has_fallback_storage: self.has_fallback_storage && other.has_fallback_storage,
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            has_durable_store: true,
            has_sync_commit: true,
            has_background_agent: true,
            has_best_effort_transport: true,
            has_fallback_storage: true,
        }
    }
}

/// Identity of one execution context (a tab or a background agent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

//! Reliable delivery of JSON submissions: a durable outbox that gets every
//! POST to its server eventually, across unloads, offline periods and
//! several contexts sharing one store.

pub mod agent;
pub mod config;
pub mod db;
pub mod error;
pub mod fallback;
pub mod model;
pub mod notifier;
pub mod outbox;
pub mod scheduler;
pub mod transport;

pub use agent::{AgentHandle, SyncAgent};
pub use outbox::{OutboxCoordinator, OutboxEnv};

//! Durable store: the persistent table of pending outbound JSON requests.
//!
//! This module is split into two submodules:
//! - `model`: the row type read back from SQLite.
//! - `repo`: the SQLite implementation of [`DurableStore`].
//!
//! Every operation is atomic on a single record and no cross-record
//! transaction is ever taken, so several contexts may share one store.

pub mod model;
pub mod repo;

use crate::error::StoreError;
use crate::model::{CommitMode, PendingSend};
use async_trait::async_trait;

pub use repo::SqliteStore;

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Open (or create) the table. Failing here means the store is
    /// unavailable for now, and callers fall through to the next tier.
    async fn open(&self) -> Result<(), StoreError>;

    /// Release the connection. Later operations re-open lazily.
    async fn close(&self);

    /// Whether [`CommitMode::Immediate`] is honoured.
    fn supports_immediate_commit(&self) -> bool;

    async fn add(
        &self,
        endpoint: &str,
        json_string: &str,
        mode: CommitMode,
    ) -> Result<i64, StoreError>;

    /// All pending records in receipt order.
    async fn list(&self) -> Result<Vec<PendingSend>, StoreError>;

    /// The record with the lowest id, if any.
    async fn next_oldest(&self) -> Result<Option<PendingSend>, StoreError>;

    /// Remove one record. Deleting a missing id is not an error.
    async fn delete(&self, id: i64) -> Result<(), StoreError>;
}

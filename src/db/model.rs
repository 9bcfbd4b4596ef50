//! Row types returned by the outbox repository.

use crate::model::PendingSend;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxRow {
    pub id: i64,
    pub endpoint: String,
    pub json_string: String,
}

impl From<OutboxRow> for PendingSend {
    fn from(row: OutboxRow) -> Self {
        PendingSend {
            id: row.id,
            endpoint: row.endpoint,
            json_string: row.json_string,
        }
    }
}

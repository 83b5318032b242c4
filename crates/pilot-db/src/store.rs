//! A PostgreSQL-backed `ProcessedStore`.
//!
//! The schema is adapter-namespaced (each tracker gets its own logical
//! namespace in the same table) and stores ticket ids as text, so that
//! one store schema serves both integer-keyed trackers (GitHub/GitLab)
//! and string-keyed ones (Jira).

use std::collections::HashSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;

use pilot_core::{ProcessedStore, TicketId};

pub struct PgProcessedStore {
    pool: PgPool,
    namespace: String,
}

impl PgProcessedStore {
    pub fn new(pool: PgPool, namespace: impl Into<String>) -> Self {
        Self { pool, namespace: namespace.into() }
    }
}

/// Tickets round-trip through the store as text; an id that parses as
/// an integer is reconstructed as `TicketId::Int`, otherwise `Str`.
/// This loses no information the scheduler relies on, since `TicketId`
/// is only ever used as an opaque equality/hash/sort key.
fn ticket_id_from_text(s: &str) -> TicketId {
    match s.parse::<i64>() {
        Ok(n) => TicketId::Int(n),
        Err(_) => TicketId::Str(s.to_owned()),
    }
}

#[async_trait]
impl ProcessedStore for PgProcessedStore {
    async fn mark(&self, id: &TicketId, outcome_tag: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO processed_tickets (namespace, ticket_id, outcome_tag) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (namespace, ticket_id) \
             DO UPDATE SET outcome_tag = EXCLUDED.outcome_tag, processed_at = now()",
        )
        .bind(&self.namespace)
        .bind(id.to_string())
        .bind(outcome_tag)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to mark ticket {id} processed"))?;
        Ok(())
    }

    async fn unmark(&self, id: &TicketId) -> Result<()> {
        sqlx::query("DELETE FROM processed_tickets WHERE namespace = $1 AND ticket_id = $2")
            .bind(&self.namespace)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to clear processed ticket {id}"))?;
        Ok(())
    }

    async fn is_processed(&self, id: &TicketId) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM processed_tickets WHERE namespace = $1 AND ticket_id = $2)",
        )
        .bind(&self.namespace)
        .bind(id.to_string())
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to check processed state for {id}"))?;
        Ok(exists)
    }

    async fn load_all(&self) -> Result<HashSet<TicketId>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT ticket_id FROM processed_tickets WHERE namespace = $1")
                .bind(&self.namespace)
                .fetch_all(&self.pool)
                .await
                .context("failed to load processed tickets")?;
        Ok(rows.into_iter().map(|(id,)| ticket_id_from_text(&id)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_id_from_text_parses_integers() {
        assert_eq!(ticket_id_from_text("42"), TicketId::Int(42));
    }

    #[test]
    fn ticket_id_from_text_falls_back_to_string() {
        assert_eq!(ticket_id_from_text("PROJ-7"), TicketId::Str("PROJ-7".to_owned()));
    }
}

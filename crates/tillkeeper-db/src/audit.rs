//! # Audit Trail
//!
//! One `audit_log` row per committed state change, written on the same
//! connection as the change itself. A failed audit insert is logged and the
//! business transaction carries on.

use chrono::Utc;
use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::warn;

use tillkeeper_core::AuditRecord;

use crate::error::DbResult;

/// One change to record.
#[derive(Debug, Clone)]
pub struct AuditEntry<'a> {
    pub action: &'a str,
    pub entity_type: &'a str,
    pub entity_id: &'a str,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    /// Cart or invoice id the change belongs to.
    pub correlation_id: Option<&'a str>,
}

impl<'a> AuditEntry<'a> {
    pub fn new(action: &'a str, entity_type: &'a str, entity_id: &'a str) -> Self {
        AuditEntry {
            action,
            entity_type,
            entity_id,
            before: None,
            after: None,
            correlation_id: None,
        }
    }

    pub fn before(mut self, value: impl Serialize) -> Self {
        self.before = serde_json::to_value(value).ok();
        self
    }

    pub fn after(mut self, value: impl Serialize) -> Self {
        self.after = serde_json::to_value(value).ok();
        self
    }

    pub fn correlated(mut self, id: Option<&'a str>) -> Self {
        self.correlation_id = id;
        self
    }
}

/// Writes audit rows as a fixed actor.
#[derive(Debug, Clone)]
pub struct AuditLog {
    actor: String,
}

impl AuditLog {
    pub fn new(actor: impl Into<String>) -> Self {
        AuditLog {
            actor: actor.into(),
        }
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// Records `entry`. Never fails the caller.
    pub async fn record(&self, conn: &mut SqliteConnection, entry: AuditEntry<'_>) {
        let result = sqlx::query(
            r#"
            INSERT INTO audit_log (
                actor, action, entity_type, entity_id,
                before_state, after_state, correlation_id, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&self.actor)
        .bind(entry.action)
        .bind(entry.entity_type)
        .bind(entry.entity_id)
        .bind(entry.before.as_ref().map(|v| v.to_string()))
        .bind(entry.after.as_ref().map(|v| v.to_string()))
        .bind(entry.correlation_id)
        .bind(Utc::now())
        .execute(conn)
        .await;

        if let Err(e) = result {
            warn!(
                action = entry.action,
                entity_id = entry.entity_id,
                error = %e,
                "Audit write failed, continuing"
            );
        }
    }

    /// Audit rows for one entity, oldest first.
    pub async fn history(
        conn: &mut SqliteConnection,
        entity_type: &str,
        entity_id: &str,
    ) -> DbResult<Vec<AuditRecord>> {
        let rows = sqlx::query_as::<_, AuditRecord>(
            r#"
            SELECT id, actor, action, entity_type, entity_id,
                   before_state, after_state, correlation_id, created_at
            FROM audit_log
            WHERE entity_type = ?1 AND entity_id = ?2
            ORDER BY id
            "#,
        )
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(conn)
        .await?;
        Ok(rows)
    }
}

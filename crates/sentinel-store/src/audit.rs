//! Append-only audit log.
//!
//! Structured supplement to the tracing stream: every security-relevant
//! event lands in the `audit_log` table with its type, optional session,
//! and a JSON detail blob. Insert-only; there is no update or delete path.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use sentinel_types::errors::SentinelError;
use sentinel_types::traits::AuditLog;

use crate::db::SentinelDb;

/// One recorded audit event (in-memory backend).
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub event_type: String,
    pub session_id: Option<String>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// In-memory audit log for tests.
#[derive(Clone, Default)]
pub struct InMemoryAuditLog {
    records: Arc<RwLock<Vec<AuditRecord>>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn record(
        &self,
        event_type: &str,
        session_id: Option<&str>,
        details: serde_json::Value,
    ) -> Result<(), SentinelError> {
        self.records.write().await.push(AuditRecord {
            event_type: event_type.to_string(),
            session_id: session_id.map(String::from),
            details,
            created_at: Utc::now(),
        });
        Ok(())
    }
}

/// SQLite-backed audit log.
pub struct SqliteAuditLog {
    db: SentinelDb,
}

impl SqliteAuditLog {
    pub fn new(db: SentinelDb) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AuditLog for SqliteAuditLog {
    async fn record(
        &self,
        event_type: &str,
        session_id: Option<&str>,
        details: serde_json::Value,
    ) -> Result<(), SentinelError> {
        sqlx::query(
            "INSERT INTO audit_log (event_type, session_id, details, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(event_type)
        .bind(session_id)
        .bind(details.to_string())
        .bind(Utc::now())
        .execute(self.db.pool())
        .await
        .map_err(|e| SentinelError::Database(e.to_string()))?;
        Ok(())
    }
}

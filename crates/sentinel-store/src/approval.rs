//! Approval queue implementations.
//!
//! Pending plans keyed by unguessable ids, with a TTL. Expired entries are
//! reaped lazily on read — a stale entry can never report `pending` again.
//! A granted entry keeps the source key and original user request so the
//! orchestrator can record the turn after deferred execution.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use tokio::sync::RwLock;
use tracing::{info, warn};

use sentinel_types::errors::SentinelError;
use sentinel_types::models::{new_id, ApprovalCheck, ApprovalStatus, Plan};
use sentinel_types::traits::ApprovalQueue;

use crate::db::SentinelDb;

// ============================================================
// InMemoryApprovalQueue
// ============================================================

struct PendingEntry {
    plan: Plan,
    status: ApprovalStatus,
    source_key: String,
    user_request: String,
    session_id: String,
    reason: String,
    decided_by: String,
    expires_at: DateTime<Utc>,
}

/// In-memory approval queue for tests and degraded operation.
#[derive(Clone)]
pub struct InMemoryApprovalQueue {
    entries: Arc<RwLock<HashMap<String, PendingEntry>>>,
    ttl: Duration,
}

impl InMemoryApprovalQueue {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }
}

/// Transition a pending entry to expired when past its deadline.
fn reap(entry: &mut PendingEntry, now: DateTime<Utc>) {
    if entry.status == ApprovalStatus::Pending && now > entry.expires_at {
        entry.status = ApprovalStatus::Expired;
    }
}

#[async_trait]
impl ApprovalQueue for InMemoryApprovalQueue {
    async fn create(
        &self,
        plan: &Plan,
        source_key: &str,
        user_request: &str,
        session_id: &str,
    ) -> Result<String, SentinelError> {
        let approval_id = new_id();
        let entry = PendingEntry {
            plan: plan.clone(),
            status: ApprovalStatus::Pending,
            source_key: source_key.to_string(),
            user_request: user_request.to_string(),
            session_id: session_id.to_string(),
            reason: String::new(),
            decided_by: String::new(),
            expires_at: Utc::now()
                + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::zero()),
        };
        self.entries.write().await.insert(approval_id.clone(), entry);
        info!(
            event = "approval_requested",
            approval_id = %approval_id,
            plan_summary = %plan.plan_summary,
        );
        Ok(approval_id)
    }

    async fn check(&self, approval_id: &str) -> Result<ApprovalCheck, SentinelError> {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(approval_id) else {
            return Ok(ApprovalCheck::not_found());
        };
        reap(entry, Utc::now());

        Ok(ApprovalCheck {
            status: entry.status,
            plan: matches!(entry.status, ApprovalStatus::Pending | ApprovalStatus::Granted)
                .then(|| entry.plan.clone()),
            reason: entry.reason.clone(),
            decided_by: entry.decided_by.clone(),
            source_key: entry.source_key.clone(),
            user_request: entry.user_request.clone(),
            session_id: entry.session_id.clone(),
        })
    }

    async fn submit(
        &self,
        approval_id: &str,
        granted: bool,
        reason: &str,
        decided_by: &str,
    ) -> Result<bool, SentinelError> {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(approval_id) else {
            warn!(event = "approval_submit_not_found", approval_id = %approval_id);
            return Ok(false);
        };
        reap(entry, Utc::now());

        if entry.status != ApprovalStatus::Pending {
            warn!(
                event = "approval_submit_rejected",
                approval_id = %approval_id,
                status = ?entry.status,
            );
            return Ok(false);
        }

        entry.status = if granted {
            ApprovalStatus::Granted
        } else {
            ApprovalStatus::Denied
        };
        entry.reason = reason.to_string();
        entry.decided_by = decided_by.to_string();
        info!(
            event = "approval_submitted",
            approval_id = %approval_id,
            granted,
        );
        Ok(true)
    }
}

// ============================================================
// SqliteApprovalQueue
// ============================================================

/// SQLite-backed approval queue.
pub struct SqliteApprovalQueue {
    db: SentinelDb,
    ttl: Duration,
}

impl SqliteApprovalQueue {
    pub fn new(db: SentinelDb, ttl: Duration) -> Self {
        Self { db, ttl }
    }

    async fn reap_expired(&self) -> Result<(), SentinelError> {
        sqlx::query("UPDATE approvals SET status = 'expired' WHERE status = 'pending' AND expires_at < ?")
            .bind(Utc::now())
            .execute(self.db.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

fn db_err(e: impl std::fmt::Display) -> SentinelError {
    SentinelError::Database(e.to_string())
}

fn status_from_str(s: &str) -> ApprovalStatus {
    match s {
        "pending" => ApprovalStatus::Pending,
        "granted" => ApprovalStatus::Granted,
        "denied" => ApprovalStatus::Denied,
        "expired" => ApprovalStatus::Expired,
        _ => ApprovalStatus::NotFound,
    }
}

#[async_trait]
impl ApprovalQueue for SqliteApprovalQueue {
    async fn create(
        &self,
        plan: &Plan,
        source_key: &str,
        user_request: &str,
        session_id: &str,
    ) -> Result<String, SentinelError> {
        self.reap_expired().await?;

        let approval_id = new_id();
        let plan_json = serde_json::to_string(plan).map_err(|e| db_err(e.to_string()))?;
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::zero());

        sqlx::query(
            "INSERT INTO approvals \
             (approval_id, plan_json, status, source_key, user_request, session_id, expires_at, created_at) \
             VALUES (?, ?, 'pending', ?, ?, ?, ?, ?)",
        )
        .bind(&approval_id)
        .bind(plan_json)
        .bind(source_key)
        .bind(user_request)
        .bind(session_id)
        .bind(expires_at)
        .bind(Utc::now())
        .execute(self.db.pool())
        .await
        .map_err(db_err)?;

        info!(
            event = "approval_requested",
            approval_id = %approval_id,
            plan_summary = %plan.plan_summary,
        );
        Ok(approval_id)
    }

    async fn check(&self, approval_id: &str) -> Result<ApprovalCheck, SentinelError> {
        self.reap_expired().await?;

        let row = sqlx::query(
            "SELECT plan_json, status, source_key, user_request, session_id, decided_reason, \
             decided_by FROM approvals WHERE approval_id = ?",
        )
        .bind(approval_id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(ApprovalCheck::not_found());
        };

        let status = status_from_str(&row.try_get::<String, _>("status").map_err(db_err)?);
        let plan_json: String = row.try_get("plan_json").map_err(db_err)?;
        let plan = matches!(status, ApprovalStatus::Pending | ApprovalStatus::Granted)
            .then(|| serde_json::from_str(&plan_json))
            .transpose()
            .map_err(|e| db_err(format!("stored plan corrupt: {e}")))?;

        Ok(ApprovalCheck {
            status,
            plan,
            reason: row.try_get("decided_reason").map_err(db_err)?,
            decided_by: row.try_get("decided_by").map_err(db_err)?,
            source_key: row.try_get("source_key").map_err(db_err)?,
            user_request: row.try_get("user_request").map_err(db_err)?,
            session_id: row.try_get("session_id").map_err(db_err)?,
        })
    }

    async fn submit(
        &self,
        approval_id: &str,
        granted: bool,
        reason: &str,
        decided_by: &str,
    ) -> Result<bool, SentinelError> {
        self.reap_expired().await?;

        let new_status = if granted { "granted" } else { "denied" };
        let updated = sqlx::query(
            "UPDATE approvals SET status = ?, decided_reason = ?, decided_by = ?, decided_at = ? \
             WHERE approval_id = ? AND status = 'pending'",
        )
        .bind(new_status)
        .bind(reason)
        .bind(decided_by)
        .bind(Utc::now())
        .bind(approval_id)
        .execute(self.db.pool())
        .await
        .map_err(db_err)?;

        let accepted = updated.rows_affected() > 0;
        if accepted {
            info!(event = "approval_submitted", approval_id = %approval_id, granted);
        } else {
            warn!(event = "approval_submit_rejected", approval_id = %approval_id);
        }
        Ok(accepted)
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_types::models::{OutputFormat, PlanStep};

    fn sample_plan() -> Plan {
        Plan {
            plan_summary: "write a greeting".to_string(),
            steps: vec![PlanStep::LlmTask {
                id: "step_1".to_string(),
                description: "greet".to_string(),
                prompt: "Say hello".to_string(),
                input_vars: vec![],
                output_var: None,
                output_format: OutputFormat::None,
                expects_code: false,
            }],
        }
    }

    fn memory_queue() -> InMemoryApprovalQueue {
        InMemoryApprovalQueue::new(Duration::from_secs(300))
    }

    async fn sqlite_queue() -> SqliteApprovalQueue {
        SqliteApprovalQueue::new(SentinelDb::in_memory().await.unwrap(), Duration::from_secs(300))
    }

    // ----------------------------------------------------------
    // Lifecycle
    // ----------------------------------------------------------

    #[tokio::test]
    async fn test_create_and_check_pending() {
        for queue in [
            &memory_queue() as &dyn ApprovalQueue,
            &sqlite_queue().await as &dyn ApprovalQueue,
        ] {
            let id = queue
                .create(&sample_plan(), "api:1.2.3.4", "say hello", "sess-1")
                .await
                .unwrap();
            let check = queue.check(&id).await.unwrap();
            assert_eq!(check.status, ApprovalStatus::Pending);
            let plan = check.plan.expect("pending check exposes the plan");
            assert_eq!(plan.plan_summary, "write a greeting");
            assert_eq!(check.source_key, "api:1.2.3.4");
            assert_eq!(check.user_request, "say hello");
        }
    }

    #[tokio::test]
    async fn test_grant_roundtrip() {
        for queue in [
            &memory_queue() as &dyn ApprovalQueue,
            &sqlite_queue().await as &dyn ApprovalQueue,
        ] {
            let id = queue.create(&sample_plan(), "k", "req", "s").await.unwrap();
            assert!(queue.submit(&id, true, "looks fine", "operator").await.unwrap());

            let check = queue.check(&id).await.unwrap();
            assert_eq!(check.status, ApprovalStatus::Granted);
            assert_eq!(check.reason, "looks fine");
            assert_eq!(check.decided_by, "operator");
            assert!(check.plan.is_some(), "granted entries keep the plan");
        }
    }

    #[tokio::test]
    async fn test_deny_roundtrip() {
        for queue in [
            &memory_queue() as &dyn ApprovalQueue,
            &sqlite_queue().await as &dyn ApprovalQueue,
        ] {
            let id = queue.create(&sample_plan(), "k", "req", "s").await.unwrap();
            assert!(queue.submit(&id, false, "not today", "operator").await.unwrap());
            let check = queue.check(&id).await.unwrap();
            assert_eq!(check.status, ApprovalStatus::Denied);
            assert!(check.plan.is_none());
        }
    }

    #[tokio::test]
    async fn test_unknown_id_not_found() {
        for queue in [
            &memory_queue() as &dyn ApprovalQueue,
            &sqlite_queue().await as &dyn ApprovalQueue,
        ] {
            let check = queue.check("does-not-exist").await.unwrap();
            assert_eq!(check.status, ApprovalStatus::NotFound);
        }
    }

    // ----------------------------------------------------------
    // Atomicity
    // ----------------------------------------------------------

    #[tokio::test]
    async fn test_double_submit_rejected() {
        for queue in [
            &memory_queue() as &dyn ApprovalQueue,
            &sqlite_queue().await as &dyn ApprovalQueue,
        ] {
            let id = queue.create(&sample_plan(), "k", "req", "s").await.unwrap();
            assert!(queue.submit(&id, true, "", "op").await.unwrap());
            // A second decision never overwrites the first.
            assert!(!queue.submit(&id, false, "flip", "op").await.unwrap());
            let check = queue.check(&id).await.unwrap();
            assert_eq!(check.status, ApprovalStatus::Granted);
        }
    }

    #[tokio::test]
    async fn test_granted_stays_granted() {
        for queue in [
            &memory_queue() as &dyn ApprovalQueue,
            &sqlite_queue().await as &dyn ApprovalQueue,
        ] {
            let id = queue.create(&sample_plan(), "k", "req", "s").await.unwrap();
            queue.submit(&id, true, "", "op").await.unwrap();
            for _ in 0..3 {
                assert_eq!(queue.check(&id).await.unwrap().status, ApprovalStatus::Granted);
            }
        }
    }

    // ----------------------------------------------------------
    // Expiry
    // ----------------------------------------------------------

    #[tokio::test]
    async fn test_pending_expires() {
        let queue = InMemoryApprovalQueue::new(Duration::from_millis(10));
        let id = queue.create(&sample_plan(), "k", "req", "s").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let check = queue.check(&id).await.unwrap();
        assert_eq!(check.status, ApprovalStatus::Expired);
        assert!(check.plan.is_none());
    }

    #[tokio::test]
    async fn test_pending_expires_sqlite() {
        let queue = SqliteApprovalQueue::new(
            SentinelDb::in_memory().await.unwrap(),
            Duration::from_millis(10),
        );
        let id = queue.create(&sample_plan(), "k", "req", "s").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(queue.check(&id).await.unwrap().status, ApprovalStatus::Expired);
    }

    #[tokio::test]
    async fn test_submit_after_expiry_rejected() {
        let queue = InMemoryApprovalQueue::new(Duration::from_millis(10));
        let id = queue.create(&sample_plan(), "k", "req", "s").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!queue.submit(&id, true, "too late", "op").await.unwrap());
        assert_eq!(queue.check(&id).await.unwrap().status, ApprovalStatus::Expired);
    }

    #[tokio::test]
    async fn test_ids_unguessable_shape() {
        let queue = memory_queue();
        let a = queue.create(&sample_plan(), "k", "r", "s").await.unwrap();
        let b = queue.create(&sample_plan(), "k", "r", "s").await.unwrap();
        assert_ne!(a, b);
        // UUID v4 text form.
        assert_eq!(a.len(), 36);
    }
}

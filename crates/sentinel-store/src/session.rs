//! Session store implementations.
//!
//! Per-source rolling conversation state with TTL and capacity eviction,
//! enforced on every operation. Session keys are assigned server-side from
//! the source identity — a client-supplied session id is never accepted,
//! so identity rotation cannot shed accumulated risk.
//!
//! The lock bit is observed atomically with respect to new-turn
//! acceptance: `append_turn` on a locked session is rejected.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use tokio::sync::RwLock;
use tracing::{info, warn};

use sentinel_types::errors::SentinelError;
use sentinel_types::models::{Session, Turn, TurnOutcome};
use sentinel_types::traits::SessionStore;

use crate::db::SentinelDb;

// ============================================================
// InMemorySessionStore
// ============================================================

/// In-memory session store for tests and degraded operation.
#[derive(Clone)]
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    ttl: Duration,
    max_count: usize,
}

impl InMemorySessionStore {
    pub fn new(ttl: Duration, max_count: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            ttl,
            max_count,
        }
    }

    fn is_expired(&self, session: &Session, now: DateTime<Utc>) -> bool {
        (now - session.last_active).to_std().unwrap_or_default() > self.ttl
    }

    async fn evict_expired(&self) {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;

        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| self.is_expired(s, now))
            .map(|(id, _)| id.clone())
            .collect();
        if !expired.is_empty() {
            info!(event = "session_evict_ttl", count = expired.len());
        }
        for id in expired {
            sessions.remove(&id);
        }
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_or_create(&self, source_key: &str, source: &str) -> Result<Session, SentinelError> {
        self.evict_expired().await;
        let mut sessions = self.sessions.write().await;

        if let Some(session) = sessions.get_mut(source_key) {
            session.last_active = Utc::now();
            return Ok(session.clone());
        }

        // Capacity eviction only when a new session is about to be created.
        while sessions.len() >= self.max_count {
            let Some(oldest) = sessions
                .iter()
                .min_by_key(|(_, s)| s.last_active)
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            info!(event = "session_evict_capacity", evicted_session_id = %oldest);
            sessions.remove(&oldest);
        }

        let session = Session::new(source_key, source);
        sessions.insert(source_key.to_string(), session.clone());
        info!(event = "session_created", session_id = %source_key, source);
        Ok(session)
    }

    async fn get(&self, session_id: &str) -> Result<Option<Session>, SentinelError> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        match sessions.get(session_id) {
            Some(s) if self.is_expired(s, now) => {
                sessions.remove(session_id);
                Ok(None)
            }
            Some(s) => Ok(Some(s.clone())),
            None => Ok(None),
        }
    }

    async fn append_turn(&self, session_id: &str, turn: Turn) -> Result<(), SentinelError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SentinelError::Session(format!("no such session: {session_id}")))?;

        if session.locked {
            return Err(SentinelError::Session(format!(
                "session {session_id} is locked"
            )));
        }

        if turn.outcome == TurnOutcome::Blocked {
            session.violation_count += 1;
        }
        session.last_active = Utc::now();
        session.turns.push(turn);
        Ok(())
    }

    async fn raise_risk(&self, session_id: &str, risk: f64) -> Result<(), SentinelError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SentinelError::Session(format!("no such session: {session_id}")))?;
        if risk > session.cumulative_risk {
            session.cumulative_risk = risk;
        }
        Ok(())
    }

    async fn lock(&self, session_id: &str) -> Result<(), SentinelError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SentinelError::Session(format!("no such session: {session_id}")))?;
        session.locked = true;
        warn!(
            event = "session_locked",
            session_id = %session_id,
            violation_count = session.violation_count,
            cumulative_risk = session.cumulative_risk,
        );
        Ok(())
    }

    async fn unlock(&self, session_id: &str) -> Result<(), SentinelError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SentinelError::Session(format!("no such session: {session_id}")))?;
        session.locked = false;
        info!(event = "session_unlocked", session_id = %session_id);
        Ok(())
    }

    async fn count(&self) -> Result<usize, SentinelError> {
        Ok(self.sessions.read().await.len())
    }
}

// ============================================================
// SqliteSessionStore
// ============================================================

/// SQLite-backed session store.
pub struct SqliteSessionStore {
    db: SentinelDb,
    ttl: Duration,
    max_count: i64,
}

impl SqliteSessionStore {
    pub fn new(db: SentinelDb, ttl: Duration, max_count: usize) -> Self {
        Self {
            db,
            ttl,
            max_count: max_count as i64,
        }
    }

    fn ttl_cutoff(&self) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::zero())
    }

    async fn evict_expired(&self) -> Result<(), SentinelError> {
        let deleted = sqlx::query("DELETE FROM sessions WHERE last_active < ?")
            .bind(self.ttl_cutoff())
            .execute(self.db.pool())
            .await
            .map_err(db_err)?;
        if deleted.rows_affected() > 0 {
            info!(event = "session_evict_ttl", count = deleted.rows_affected());
        }
        Ok(())
    }

    async fn evict_to_capacity(&self) -> Result<(), SentinelError> {
        loop {
            let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sessions")
                .fetch_one(self.db.pool())
                .await
                .map_err(db_err)?;
            if count.0 < self.max_count {
                break;
            }
            let oldest: Option<(String,)> = sqlx::query_as(
                "SELECT session_id FROM sessions ORDER BY last_active ASC LIMIT 1",
            )
            .fetch_optional(self.db.pool())
            .await
            .map_err(db_err)?;
            let Some((oldest_id,)) = oldest else { break };
            sqlx::query("DELETE FROM sessions WHERE session_id = ?")
                .bind(&oldest_id)
                .execute(self.db.pool())
                .await
                .map_err(db_err)?;
            info!(event = "session_evict_capacity", evicted_session_id = %oldest_id);
        }
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<Session>, SentinelError> {
        let row = sqlx::query(
            "SELECT session_id, source, cumulative_risk, violation_count, is_locked, \
             created_at, last_active FROM sessions WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(db_err)?;

        let Some(row) = row else { return Ok(None) };

        let mut session = Session {
            session_id: row.try_get("session_id").map_err(db_err)?,
            source: row.try_get("source").map_err(db_err)?,
            turns: Vec::new(),
            cumulative_risk: row.try_get("cumulative_risk").map_err(db_err)?,
            violation_count: row.try_get::<i64, _>("violation_count").map_err(db_err)? as u32,
            locked: row.try_get::<i64, _>("is_locked").map_err(db_err)? != 0,
            created_at: row.try_get("created_at").map_err(db_err)?,
            last_active: row.try_get("last_active").map_err(db_err)?,
        };

        let turn_rows = sqlx::query(
            "SELECT request_text, outcome, blocked_by, rule_scores, risk_score, plan_summary, \
             created_at FROM conversation_turns WHERE session_id = ? ORDER BY id",
        )
        .bind(session_id)
        .fetch_all(self.db.pool())
        .await
        .map_err(db_err)?;

        for tr in turn_rows {
            let outcome: String = tr.try_get("outcome").map_err(db_err)?;
            let blocked_by: String = tr.try_get("blocked_by").map_err(db_err)?;
            let rule_scores: String = tr.try_get("rule_scores").map_err(db_err)?;
            session.turns.push(Turn {
                request_text: tr.try_get("request_text").map_err(db_err)?,
                outcome: outcome_from_str(&outcome)?,
                blocked_by: serde_json::from_str(&blocked_by).unwrap_or_default(),
                rule_scores: serde_json::from_str(&rule_scores).unwrap_or_default(),
                risk_score: tr.try_get("risk_score").map_err(db_err)?,
                plan_summary: tr.try_get("plan_summary").map_err(db_err)?,
                timestamp: tr.try_get("created_at").map_err(db_err)?,
            });
        }

        Ok(Some(session))
    }
}

fn db_err(e: impl std::fmt::Display) -> SentinelError {
    SentinelError::Database(e.to_string())
}

fn outcome_to_str(outcome: TurnOutcome) -> &'static str {
    match outcome {
        TurnOutcome::Allowed => "allowed",
        TurnOutcome::Warned => "warned",
        TurnOutcome::Blocked => "blocked",
        TurnOutcome::Refused => "refused",
        TurnOutcome::Executed => "executed",
        TurnOutcome::Failed => "failed",
    }
}

fn outcome_from_str(s: &str) -> Result<TurnOutcome, SentinelError> {
    match s {
        "allowed" => Ok(TurnOutcome::Allowed),
        "warned" => Ok(TurnOutcome::Warned),
        "blocked" => Ok(TurnOutcome::Blocked),
        "refused" => Ok(TurnOutcome::Refused),
        "executed" => Ok(TurnOutcome::Executed),
        "failed" => Ok(TurnOutcome::Failed),
        other => Err(SentinelError::Session(format!("unknown outcome: {other}"))),
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get_or_create(&self, source_key: &str, source: &str) -> Result<Session, SentinelError> {
        self.evict_expired().await?;

        if let Some(mut session) = self.load(source_key).await? {
            let now = Utc::now();
            sqlx::query("UPDATE sessions SET last_active = ? WHERE session_id = ?")
                .bind(now)
                .bind(source_key)
                .execute(self.db.pool())
                .await
                .map_err(db_err)?;
            session.last_active = now;
            return Ok(session);
        }

        self.evict_to_capacity().await?;

        let session = Session::new(source_key, source);
        sqlx::query(
            "INSERT INTO sessions (session_id, source, created_at, last_active) VALUES (?, ?, ?, ?)",
        )
        .bind(&session.session_id)
        .bind(&session.source)
        .bind(session.created_at)
        .bind(session.last_active)
        .execute(self.db.pool())
        .await
        .map_err(db_err)?;
        info!(event = "session_created", session_id = %source_key, source);
        Ok(session)
    }

    async fn get(&self, session_id: &str) -> Result<Option<Session>, SentinelError> {
        match self.load(session_id).await? {
            Some(session) if session.last_active < self.ttl_cutoff() => {
                sqlx::query("DELETE FROM sessions WHERE session_id = ?")
                    .bind(session_id)
                    .execute(self.db.pool())
                    .await
                    .map_err(db_err)?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn append_turn(&self, session_id: &str, turn: Turn) -> Result<(), SentinelError> {
        let session = self
            .load(session_id)
            .await?
            .ok_or_else(|| SentinelError::Session(format!("no such session: {session_id}")))?;

        if session.locked {
            return Err(SentinelError::Session(format!(
                "session {session_id} is locked"
            )));
        }

        sqlx::query(
            "INSERT INTO conversation_turns \
             (session_id, request_text, outcome, blocked_by, rule_scores, risk_score, plan_summary, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(&turn.request_text)
        .bind(outcome_to_str(turn.outcome))
        .bind(serde_json::to_string(&turn.blocked_by).unwrap_or_else(|_| "[]".to_string()))
        .bind(serde_json::to_string(&turn.rule_scores).unwrap_or_else(|_| "{}".to_string()))
        .bind(turn.risk_score)
        .bind(&turn.plan_summary)
        .bind(turn.timestamp)
        .execute(self.db.pool())
        .await
        .map_err(db_err)?;

        let violation_bump = i64::from(turn.outcome == TurnOutcome::Blocked);
        sqlx::query(
            "UPDATE sessions SET last_active = ?, violation_count = violation_count + ? \
             WHERE session_id = ?",
        )
        .bind(Utc::now())
        .bind(violation_bump)
        .bind(session_id)
        .execute(self.db.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn raise_risk(&self, session_id: &str, risk: f64) -> Result<(), SentinelError> {
        let updated = sqlx::query(
            "UPDATE sessions SET cumulative_risk = ? WHERE session_id = ? AND cumulative_risk < ?",
        )
        .bind(risk)
        .bind(session_id)
        .bind(risk)
        .execute(self.db.pool())
        .await
        .map_err(db_err)?;

        // Raising risk on a missing session is an error; a no-op update on
        // an existing one (risk not higher) is fine.
        if updated.rows_affected() == 0 {
            let exists: Option<(String,)> =
                sqlx::query_as("SELECT session_id FROM sessions WHERE session_id = ?")
                    .bind(session_id)
                    .fetch_optional(self.db.pool())
                    .await
                    .map_err(db_err)?;
            if exists.is_none() {
                return Err(SentinelError::Session(format!(
                    "no such session: {session_id}"
                )));
            }
        }
        Ok(())
    }

    async fn lock(&self, session_id: &str) -> Result<(), SentinelError> {
        let updated = sqlx::query("UPDATE sessions SET is_locked = 1 WHERE session_id = ?")
            .bind(session_id)
            .execute(self.db.pool())
            .await
            .map_err(db_err)?;
        if updated.rows_affected() == 0 {
            return Err(SentinelError::Session(format!(
                "no such session: {session_id}"
            )));
        }
        warn!(event = "session_locked", session_id = %session_id);
        Ok(())
    }

    async fn unlock(&self, session_id: &str) -> Result<(), SentinelError> {
        let updated = sqlx::query("UPDATE sessions SET is_locked = 0 WHERE session_id = ?")
            .bind(session_id)
            .execute(self.db.pool())
            .await
            .map_err(db_err)?;
        if updated.rows_affected() == 0 {
            return Err(SentinelError::Session(format!(
                "no such session: {session_id}"
            )));
        }
        info!(event = "session_unlocked", session_id = %session_id);
        Ok(())
    }

    async fn count(&self) -> Result<usize, SentinelError> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sessions")
            .fetch_one(self.db.pool())
            .await
            .map_err(db_err)?;
        Ok(count.0 as usize)
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_store() -> InMemorySessionStore {
        InMemorySessionStore::new(Duration::from_secs(3600), 100)
    }

    async fn sqlite_store() -> SqliteSessionStore {
        SqliteSessionStore::new(
            SentinelDb::in_memory().await.unwrap(),
            Duration::from_secs(3600),
            100,
        )
    }

    fn blocked_turn(text: &str) -> Turn {
        Turn::new(text, TurnOutcome::Blocked)
    }

    // ----------------------------------------------------------
    // Lifecycle
    // ----------------------------------------------------------

    #[tokio::test]
    async fn test_get_or_create_idempotent() {
        for store in [
            &memory_store() as &dyn SessionStore,
            &sqlite_store().await as &dyn SessionStore,
        ] {
            let a = store.get_or_create("api:10.0.0.1", "api").await.unwrap();
            let b = store.get_or_create("api:10.0.0.1", "api").await.unwrap();
            assert_eq!(a.session_id, b.session_id);
            assert_eq!(store.count().await.unwrap(), 1);
        }
    }

    #[tokio::test]
    async fn test_distinct_sources_distinct_sessions() {
        for store in [
            &memory_store() as &dyn SessionStore,
            &sqlite_store().await as &dyn SessionStore,
        ] {
            store.get_or_create("api:10.0.0.1", "api").await.unwrap();
            store.get_or_create("api:10.0.0.2", "api").await.unwrap();
            assert_eq!(store.count().await.unwrap(), 2);
        }
    }

    #[tokio::test]
    async fn test_get_missing_session() {
        for store in [
            &memory_store() as &dyn SessionStore,
            &sqlite_store().await as &dyn SessionStore,
        ] {
            assert!(store.get("never-seen").await.unwrap().is_none());
        }
    }

    // ----------------------------------------------------------
    // Turns & violations
    // ----------------------------------------------------------

    #[tokio::test]
    async fn test_append_turn_persists() {
        for store in [
            &memory_store() as &dyn SessionStore,
            &sqlite_store().await as &dyn SessionStore,
        ] {
            let s = store.get_or_create("key", "api").await.unwrap();
            store
                .append_turn(&s.session_id, Turn::new("list files", TurnOutcome::Executed))
                .await
                .unwrap();
            store
                .append_turn(&s.session_id, blocked_turn("cat /etc/shadow"))
                .await
                .unwrap();

            let loaded = store.get(&s.session_id).await.unwrap().unwrap();
            assert_eq!(loaded.turns.len(), 2);
            assert_eq!(loaded.turns[1].outcome, TurnOutcome::Blocked);
            assert_eq!(loaded.violation_count, 1);
        }
    }

    #[tokio::test]
    async fn test_turn_order_preserved() {
        for store in [
            &memory_store() as &dyn SessionStore,
            &sqlite_store().await as &dyn SessionStore,
        ] {
            let s = store.get_or_create("key", "api").await.unwrap();
            for i in 0..5 {
                store
                    .append_turn(
                        &s.session_id,
                        Turn::new(format!("turn {i}"), TurnOutcome::Executed),
                    )
                    .await
                    .unwrap();
            }
            let loaded = store.get(&s.session_id).await.unwrap().unwrap();
            let texts: Vec<&str> = loaded.turns.iter().map(|t| t.request_text.as_str()).collect();
            assert_eq!(texts, vec!["turn 0", "turn 1", "turn 2", "turn 3", "turn 4"]);
        }
    }

    // ----------------------------------------------------------
    // Locking
    // ----------------------------------------------------------

    #[tokio::test]
    async fn test_locked_session_rejects_turns() {
        for store in [
            &memory_store() as &dyn SessionStore,
            &sqlite_store().await as &dyn SessionStore,
        ] {
            let s = store.get_or_create("key", "api").await.unwrap();
            store.lock(&s.session_id).await.unwrap();

            let loaded = store.get(&s.session_id).await.unwrap().unwrap();
            assert!(loaded.locked);

            let err = store
                .append_turn(&s.session_id, Turn::new("more", TurnOutcome::Executed))
                .await
                .unwrap_err();
            assert!(err.to_string().contains("locked"));
        }
    }

    #[tokio::test]
    async fn test_unlock_restores_turn_acceptance() {
        for store in [
            &memory_store() as &dyn SessionStore,
            &sqlite_store().await as &dyn SessionStore,
        ] {
            let s = store.get_or_create("key", "api").await.unwrap();
            store.lock(&s.session_id).await.unwrap();
            store.unlock(&s.session_id).await.unwrap();
            store
                .append_turn(&s.session_id, Turn::new("back", TurnOutcome::Executed))
                .await
                .unwrap();
        }
    }

    // ----------------------------------------------------------
    // Risk monotonicity
    // ----------------------------------------------------------

    #[tokio::test]
    async fn test_risk_never_decreases() {
        for store in [
            &memory_store() as &dyn SessionStore,
            &sqlite_store().await as &dyn SessionStore,
        ] {
            let s = store.get_or_create("key", "api").await.unwrap();
            store.raise_risk(&s.session_id, 4.0).await.unwrap();
            store.raise_risk(&s.session_id, 2.0).await.unwrap();
            let loaded = store.get(&s.session_id).await.unwrap().unwrap();
            assert_eq!(loaded.cumulative_risk, 4.0);

            store.raise_risk(&s.session_id, 6.5).await.unwrap();
            let loaded = store.get(&s.session_id).await.unwrap().unwrap();
            assert_eq!(loaded.cumulative_risk, 6.5);
        }
    }

    #[tokio::test]
    async fn test_raise_risk_missing_session_errors() {
        for store in [
            &memory_store() as &dyn SessionStore,
            &sqlite_store().await as &dyn SessionStore,
        ] {
            assert!(store.raise_risk("ghost", 1.0).await.is_err());
        }
    }

    // ----------------------------------------------------------
    // TTL & capacity
    // ----------------------------------------------------------

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = InMemorySessionStore::new(Duration::from_millis(10), 100);
        let s = store.get_or_create("key", "api").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.get(&s.session_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ttl_expiry_sqlite() {
        let store = SqliteSessionStore::new(
            SentinelDb::in_memory().await.unwrap(),
            Duration::from_millis(10),
            100,
        );
        let s = store.get_or_create("key", "api").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.get(&s.session_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_active() {
        let store = InMemorySessionStore::new(Duration::from_secs(3600), 3);
        store.get_or_create("first", "api").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.get_or_create("second", "api").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.get_or_create("third", "api").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        // Creating a fourth evicts the least recently active session.
        store.get_or_create("fourth", "api").await.unwrap();
        assert!(store.get("first").await.unwrap().is_none());
        assert!(store.get("fourth").await.unwrap().is_some());
    }
}

//! SQLite database handle and schema.
//!
//! All durable state shares one database: sessions, conversation turns,
//! provenance (with a derived-from join table), file provenance,
//! approvals, and the audit log. Write-ahead logging and foreign keys are
//! enabled on every connection; migrations are constant SQL run from the
//! constructor.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use sentinel_types::errors::SentinelError;

const CREATE_SESSIONS: &str = "\
CREATE TABLE IF NOT EXISTS sessions (
    session_id      TEXT PRIMARY KEY,
    source          TEXT NOT NULL DEFAULT '',
    cumulative_risk REAL NOT NULL DEFAULT 0.0,
    violation_count INTEGER NOT NULL DEFAULT 0,
    is_locked       INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL,
    last_active     TEXT NOT NULL
)";

const CREATE_TURNS: &str = "\
CREATE TABLE IF NOT EXISTS conversation_turns (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id    TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
    request_text  TEXT NOT NULL,
    outcome       TEXT NOT NULL,
    blocked_by    TEXT NOT NULL DEFAULT '[]',
    rule_scores   TEXT NOT NULL DEFAULT '{}',
    risk_score    REAL NOT NULL DEFAULT 0.0,
    plan_summary  TEXT NOT NULL DEFAULT '',
    created_at    TEXT NOT NULL
)";

const CREATE_TURNS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_turns_session ON conversation_turns(session_id)";

const CREATE_PROVENANCE: &str = "\
CREATE TABLE IF NOT EXISTS provenance (
    data_id         TEXT PRIMARY KEY,
    content         TEXT NOT NULL,
    content_digest  TEXT NOT NULL,
    source          TEXT NOT NULL,
    trust_level     TEXT NOT NULL,
    originated_from TEXT NOT NULL DEFAULT '',
    scan_results    TEXT NOT NULL DEFAULT '{}',
    created_at      TEXT NOT NULL
)";

const CREATE_PROVENANCE_PARENTS: &str = "\
CREATE TABLE IF NOT EXISTS provenance_parents (
    child_id  TEXT NOT NULL REFERENCES provenance(data_id) ON DELETE CASCADE,
    parent_id TEXT NOT NULL,
    ord       INTEGER NOT NULL,
    PRIMARY KEY (child_id, ord)
)";

const CREATE_FILE_PROVENANCE: &str = "\
CREATE TABLE IF NOT EXISTS file_provenance (
    file_path      TEXT PRIMARY KEY,
    writer_data_id TEXT NOT NULL REFERENCES provenance(data_id) ON DELETE CASCADE,
    created_at     TEXT NOT NULL
)";

const CREATE_APPROVALS: &str = "\
CREATE TABLE IF NOT EXISTS approvals (
    approval_id    TEXT PRIMARY KEY,
    plan_json      TEXT NOT NULL,
    status         TEXT NOT NULL DEFAULT 'pending',
    source_key     TEXT NOT NULL DEFAULT '',
    user_request   TEXT NOT NULL DEFAULT '',
    session_id     TEXT NOT NULL DEFAULT '',
    decided_reason TEXT NOT NULL DEFAULT '',
    decided_by     TEXT NOT NULL DEFAULT '',
    decided_at     TEXT,
    expires_at     TEXT NOT NULL,
    created_at     TEXT NOT NULL
)";

const CREATE_APPROVALS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_approvals_status ON approvals(status)";

const CREATE_AUDIT_LOG: &str = "\
CREATE TABLE IF NOT EXISTS audit_log (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    session_id TEXT,
    details    TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
)";

const CREATE_AUDIT_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_audit_event_type ON audit_log(event_type)";

/// Shared SQLite handle for all durable stores.
#[derive(Clone)]
pub struct SentinelDb {
    pool: SqlitePool,
}

impl SentinelDb {
    /// Open (or create) the database at `db_path` and run migrations.
    /// `":memory:"` opens an in-memory database, used in tests.
    pub async fn connect(db_path: &str) -> Result<Self, SentinelError> {
        let in_memory = db_path == ":memory:";
        // WAL needs a real file; in-memory databases use the memory journal.
        let options = if in_memory {
            SqliteConnectOptions::new()
                .in_memory(true)
                .foreign_keys(true)
                .journal_mode(SqliteJournalMode::Memory)
        } else {
            SqliteConnectOptions::from_str(db_path)
                .map_err(|e| SentinelError::Database(format!("invalid database path: {e}")))?
                .create_if_missing(true)
                .foreign_keys(true)
                .journal_mode(SqliteJournalMode::Wal)
        };

        // An in-memory database exists per-connection; a pool larger than
        // one would see different databases.
        let max_connections = if in_memory { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| SentinelError::Database(format!("connection failed: {e}")))?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Open an in-memory database for tests.
    pub async fn in_memory() -> Result<Self, SentinelError> {
        Self::connect(":memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_migrations(&self) -> Result<(), SentinelError> {
        let migrations = [
            CREATE_SESSIONS,
            CREATE_TURNS,
            CREATE_TURNS_INDEX,
            CREATE_PROVENANCE,
            CREATE_PROVENANCE_PARENTS,
            CREATE_FILE_PROVENANCE,
            CREATE_APPROVALS,
            CREATE_APPROVALS_INDEX,
            CREATE_AUDIT_LOG,
            CREATE_AUDIT_INDEX,
        ];

        for sql in migrations {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| SentinelError::Database(format!("migration failed: {e}")))?;
        }

        info!(event = "db_migrations_applied");
        Ok(())
    }
}

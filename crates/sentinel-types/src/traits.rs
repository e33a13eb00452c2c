/// Trait contracts for the Sentinel subsystems.
///
/// The orchestrator holds these seams as trait objects instead of concrete
/// types, which breaks the cyclic dependencies of the original design
/// (orchestrator ↔ pipeline ↔ provenance) and lets every module be tested
/// against mocks. All traits are defined here in `sentinel-types` so that
/// every crate can depend on them without circular dependencies.
use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::errors::SentinelError;
use crate::models::*;

// ============================================================
// Scanning
// ============================================================

/// A text scanner over one trust boundary.
///
/// Scanners are pure functions of their input: no I/O, no shared state,
/// safe to run concurrently across tasks. `found == false` iff there are
/// zero findings.
pub trait Scanner: Send + Sync {
    /// Stable scanner name used in block attribution (e.g.
    /// "credential_scanner").
    fn name(&self) -> &'static str;

    /// Scan text in the given direction. Output mode may apply
    /// context-aware matching.
    fn scan(&self, text: &str, context: ScanContext) -> ScanResult;
}

// ============================================================
// LLM backends
// ============================================================

/// Request to the quarantined worker LLM.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    /// The fully assembled prompt (spotlighting already applied).
    pub prompt: String,
    /// The per-request spotlighting marker; the worker's system prompt must
    /// reference the same marker and structural tag names.
    pub marker: String,
    /// Optional model override.
    pub model: Option<String>,
}

/// Text-generation provider for the worker role.
///
/// The worker runs on an isolated network and only ever receives prompt
/// text. Implementations handle their own transport retries; the pipeline
/// adds one retry on empty responses on top.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn generate(
        &self,
        request: WorkerRequest,
        cancel: &CancellationToken,
    ) -> Result<String, SentinelError>;
}

/// A tool description surfaced to the planner.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolDescription {
    pub name: String,
    pub description: String,
    /// Argument name → type hint (e.g. "path" → "string").
    pub args: BTreeMap<String, String>,
}

/// One prior turn summarized for the planner's conversation context.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub turn: usize,
    /// Truncated request text (injection surface is limited upstream).
    pub request: String,
    pub outcome: String,
    pub summary: String,
}

/// Request to the planning provider.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub user_request: String,
    pub available_tools: Vec<ToolDescription>,
    pub conversation_history: Vec<HistoryEntry>,
}

/// Why the planner did not produce a plan.
///
/// A refusal is a security feature and a normal outcome, never an error.
#[derive(Debug)]
pub enum PlannerFailure {
    /// The planner explicitly declined the request.
    Refused(String),
    /// Transport or validation failure.
    Error(SentinelError),
}

impl std::fmt::Display for PlannerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlannerFailure::Refused(reason) => write!(f, "planner refused: {reason}"),
            PlannerFailure::Error(err) => write!(f, "{err}"),
        }
    }
}

/// Task-planning provider (the trusted remote LLM).
///
/// The planner is trusted but advisory; none of its output weakens the
/// deterministic gates downstream.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn create_plan(
        &self,
        request: PlanRequest,
        cancel: &CancellationToken,
    ) -> Result<Plan, PlannerFailure>;
}

// ============================================================
// Stores
// ============================================================

/// Provenance tracking with trust inheritance.
///
/// Implementations are shared across tasks and carry their own internal
/// locking; operations are short and non-blocking.
#[async_trait]
pub trait ProvenanceStore: Send + Sync {
    /// Create a new tagged data item. If any parent in `derived_from` is
    /// untrusted, the child is untrusted regardless of `trust_level`.
    async fn create_tagged_data(
        &self,
        content: &str,
        source: DataSource,
        trust_level: TrustLevel,
        originated_from: &str,
        derived_from: &[String],
    ) -> Result<TaggedData, SentinelError>;

    /// Fetch a tagged data item by id.
    async fn get(&self, data_id: &str) -> Result<Option<TaggedData>, SentinelError>;

    /// Attach a scan-result summary to a data item's record.
    async fn attach_scan_results(
        &self,
        data_id: &str,
        results: &BTreeMap<String, ScanResult>,
    ) -> Result<(), SentinelError>;

    /// Walk the transitive derivation closure of every id (breadth-first,
    /// cycle-protected) and return true iff every reachable ancestor is
    /// trusted. Trust is recomputed from the chain, never read from a
    /// cached field. Unknown ids are unsafe.
    async fn is_trust_safe_for_execution(
        &self,
        data_ids: &[String],
    ) -> Result<bool, SentinelError>;

    /// Record that `path` was last written by the given data item.
    async fn record_file_write(&self, path: &str, data_id: &str) -> Result<(), SentinelError>;

    /// The data id that last wrote `path`, if the write was tracked.
    async fn get_file_writer(&self, path: &str) -> Result<Option<String>, SentinelError>;
}

/// Per-source session storage with TTL and capacity eviction.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fetch the session for a source key, creating it if absent. Expired
    /// sessions are evicted first; at capacity the least-recently-active
    /// session is dropped.
    async fn get_or_create(
        &self,
        source_key: &str,
        source: &str,
    ) -> Result<Session, SentinelError>;

    /// Fetch a session without creating it. Returns None if absent or
    /// expired.
    async fn get(&self, session_id: &str) -> Result<Option<Session>, SentinelError>;

    /// Append a turn. A blocked turn increments the violation counter.
    async fn append_turn(&self, session_id: &str, turn: Turn) -> Result<(), SentinelError>;

    /// Raise the session's cumulative risk. Risk never decreases; a lower
    /// value than the current one is ignored.
    async fn raise_risk(&self, session_id: &str, risk: f64) -> Result<(), SentinelError>;

    /// Lock the session against all new turns.
    async fn lock(&self, session_id: &str) -> Result<(), SentinelError>;

    /// Operator action: unlock a locked session. Not exposed on the
    /// gateway surface.
    async fn unlock(&self, session_id: &str) -> Result<(), SentinelError>;

    /// Number of live sessions.
    async fn count(&self) -> Result<usize, SentinelError>;
}

/// Durable queue of pending plan approvals keyed by an unguessable id.
#[async_trait]
pub trait ApprovalQueue: Send + Sync {
    /// Create a pending approval and return its id.
    async fn create(
        &self,
        plan: &Plan,
        source_key: &str,
        user_request: &str,
        session_id: &str,
    ) -> Result<String, SentinelError>;

    /// Check an approval's status. Expired entries are reaped lazily here;
    /// a stale read never returns `pending`.
    async fn check(&self, approval_id: &str) -> Result<ApprovalCheck, SentinelError>;

    /// Submit a grant/deny decision. Returns false when the entry is
    /// missing, expired, or already decided.
    async fn submit(
        &self,
        approval_id: &str,
        granted: bool,
        reason: &str,
        decided_by: &str,
    ) -> Result<bool, SentinelError>;
}

/// Append-only audit trail. Events are never updated or deleted.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record(
        &self,
        event_type: &str,
        session_id: Option<&str>,
        details: serde_json::Value,
    ) -> Result<(), SentinelError>;
}

/// Convenience helper: cancellation token that never fires, for call sites
/// without a surrounding task scope (tests, one-shot scans).
pub fn never_cancelled() -> CancellationToken {
    CancellationToken::new()
}

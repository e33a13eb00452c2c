/// Unified error type for the Sentinel gateway.
///
/// All crates use this error type for propagation across crate boundaries.
/// Internal module errors should be converted into the appropriate variant.
///
/// Security *blocks* are not errors: a scanner finding, a policy denial, or
/// a trust-gate refusal travels as a [`BlockReason`] inside result types so
/// the orchestrator can map it to a structured task outcome. Only genuine
/// failures (I/O, malformed input, unreachable backends) use `SentinelError`.
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SentinelError {
    /// Error from the policy engine (file unreadable, malformed YAML, bad regex).
    #[error("policy error: {0}")]
    Policy(String),

    /// Error from a scanner (pattern compilation, classifier init).
    #[error("scanner error: {0}")]
    Scanner(String),

    /// Error from the scan pipeline.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Error from the provenance store.
    #[error("provenance error: {0}")]
    Provenance(String),

    /// Error from the session store.
    #[error("session error: {0}")]
    Session(String),

    /// Error from the approval queue.
    #[error("approval error: {0}")]
    Approval(String),

    /// Error from the planner backend (API call failures, invalid plans).
    #[error("planner error: {0}")]
    Planner(String),

    /// Error from the worker backend (connection, timeout, empty responses).
    #[error("worker error: {0}")]
    Worker(String),

    /// Error from the tool executor.
    #[error("tool error: {0}")]
    Tool(String),

    /// Error from the event bus.
    #[error("event bus error: {0}")]
    Bus(String),

    /// Malformed request or plan.
    #[error("validation error: {0}")]
    Validation(String),

    /// Missing or wrong credential.
    #[error("auth error: {0}")]
    Auth(String),

    /// Rate limit exceeded for a client identity.
    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Error from configuration loading or validation.
    #[error("config error: {0}")]
    Config(String),

    /// Database error (connection, query, migration).
    #[error("database error: {0}")]
    Database(String),

    /// Timeout waiting for an outbound call or tool execution.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The operation was cancelled.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A required subsystem is unavailable; the service must fail closed.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Generic internal error for unexpected conditions.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for SentinelError {
    fn from(err: serde_json::Error) -> Self {
        SentinelError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for SentinelError {
    fn from(err: serde_yaml::Error) -> Self {
        SentinelError::Serialization(err.to_string())
    }
}

/// Attribution for a block decision: which layer fired and on what.
///
/// Every block surfaced to a client carries one of these so an operator can
/// tell exactly which scanner or rule stopped the request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockReason {
    /// The layer that fired (e.g. "credential_scanner", "policy",
    /// "provenance_trust_gate").
    pub scanner: String,
    /// Matched pattern / rule ids (e.g. "policy:blocked_command:rm_recursive").
    pub rule_ids: Vec<String>,
    /// Human-readable detail for the task result.
    pub detail: String,
}

impl BlockReason {
    pub fn new(
        scanner: impl Into<String>,
        rule_ids: Vec<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            scanner: scanner.into(),
            rule_ids,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} — {}",
            self.scanner,
            self.rule_ids.join(", "),
            self.detail
        )
    }
}

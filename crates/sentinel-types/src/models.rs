/// Shared data types used across all Sentinel subsystems.
///
/// These types are the lingua franca of the gateway — every crate imports
/// from here. The plan step variants are a tagged enum so the orchestrator
/// can match exhaustively instead of dispatching on strings.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ============================================================
// Trust & provenance
// ============================================================

/// Trust classification for a data item.
///
/// Union rule: any derivation involving an untrusted parent is untrusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Trusted,
    Untrusted,
}

/// Where a data item entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    /// Direct user input (trusted — it is scanned, not quarantined).
    User,
    /// Output of the remote planner (trusted but advisory).
    Planner,
    /// Output of the local worker LLM (always untrusted).
    Worker,
    /// Content read from a file in the workspace.
    File,
    /// Output of a deterministic tool execution.
    Tool,
    /// Content fetched from the web.
    Web,
}

impl DataSource {
    /// The trust level a source starts with when there is no derivation
    /// history to consult. File reads override this with the recorded
    /// writer's trust.
    pub fn default_trust(self) -> TrustLevel {
        match self {
            DataSource::User | DataSource::Planner | DataSource::Tool => TrustLevel::Trusted,
            DataSource::Worker | DataSource::Web | DataSource::File => TrustLevel::Untrusted,
        }
    }
}

/// A provenance-tracked data item.
///
/// Stores a content digest rather than requiring the content itself; the
/// `content` field holds the working copy while the item is live. Records
/// are never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggedData {
    /// Stable identifier (UUID string).
    pub id: String,
    /// The data content.
    pub content: String,
    /// SHA-256 hex digest of the content at creation time.
    pub content_digest: String,
    /// Where this data entered the system.
    pub source: DataSource,
    /// Trust level after applying the union rule over parents.
    pub trust_level: TrustLevel,
    /// Free-form origin annotation (e.g. "file_read:/workspace/a.txt").
    pub originated_from: String,
    /// Scan-result summary keyed by scanner name.
    #[serde(default)]
    pub scan_results: BTreeMap<String, ScanResult>,
    /// Ordered parent data ids this item was derived from.
    #[serde(default)]
    pub derived_from: Vec<String>,
    /// When this item was created.
    pub created_at: DateTime<Utc>,
}

impl TaggedData {
    /// Hex SHA-256 digest of arbitrary content.
    pub fn digest(content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        hex_string(&hasher.finalize())
    }
}

fn hex_string(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{b:02x}");
    }
    s
}

// ============================================================
// Scanning
// ============================================================

/// Whether a scan runs on inbound text or on worker output.
///
/// Output mode enables context-aware matching (e.g. sensitive paths are
/// only flagged in operational contexts, not explanatory prose).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanContext {
    Input,
    Output,
}

/// Severity of a scan finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A single pattern match from a scanner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanMatch {
    /// Name of the pattern that matched (e.g. "aws_access_key").
    pub pattern_name: String,
    /// The matched text snippet (truncated for logging).
    pub matched_text: String,
    /// Byte offset in the scanned content.
    #[serde(default)]
    pub position: usize,
    /// For the encoding scanner: what the candidate decoded to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decoded_preview: Option<String>,
}

/// Result from a single scanner run. `found == false` iff zero matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    /// Name of the scanner that produced this result.
    pub scanner_name: String,
    /// Whether any pattern matched.
    pub found: bool,
    /// All matches with pattern ids and positions.
    #[serde(default)]
    pub matches: Vec<ScanMatch>,
    /// Severity of the worst finding.
    pub severity: Severity,
    /// Advisory message for operators.
    #[serde(default)]
    pub advisory: String,
}

impl ScanResult {
    /// A clean (no findings) result for the named scanner.
    pub fn clean(scanner_name: impl Into<String>) -> Self {
        Self {
            scanner_name: scanner_name.into(),
            found: false,
            matches: Vec::new(),
            severity: Severity::Low,
            advisory: String::new(),
        }
    }

    /// A result carrying the given matches; `found` follows from the list.
    pub fn with_matches(
        scanner_name: impl Into<String>,
        matches: Vec<ScanMatch>,
        severity: Severity,
    ) -> Self {
        Self {
            scanner_name: scanner_name.into(),
            found: !matches.is_empty(),
            matches,
            severity,
            advisory: String::new(),
        }
    }

    /// Pattern names of all matches, for block attribution.
    pub fn pattern_names(&self) -> Vec<String> {
        self.matches.iter().map(|m| m.pattern_name.clone()).collect()
    }
}

// ============================================================
// Policy
// ============================================================

/// File operation being checked against policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathOperation {
    Read,
    Write,
    Create,
}

impl std::fmt::Display for PathOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathOperation::Read => write!(f, "read"),
            PathOperation::Write => write!(f, "write"),
            PathOperation::Create => write!(f, "create"),
        }
    }
}

/// Outcome of a policy check. Deterministic and terminal — a denied
/// operation is never retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PolicyDecision {
    Allowed {
        /// Id of the rule that allowed the operation.
        rule_id: String,
    },
    Blocked {
        /// Id of the rule that fired (e.g. "policy:blocked_path:etc_shadow").
        rule_id: String,
        /// Human-readable reason.
        reason: String,
    },
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allowed { .. })
    }
}

// ============================================================
// Plans
// ============================================================

/// Output format constraint for an LLM task step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Freeform text, no enforcement.
    #[default]
    None,
    /// Response must parse as JSON.
    Json,
    /// Response must be wrapped in `<RESPONSE></RESPONSE>` tags.
    Tagged,
}

/// One step of an execution plan.
///
/// Internally tagged on `"type"` so planner JSON round-trips directly and
/// the orchestrator matches exhaustively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanStep {
    /// Send a prompt to the quarantined worker LLM through the scan pipeline.
    LlmTask {
        id: String,
        #[serde(default)]
        description: String,
        prompt: String,
        /// `$var` names this step's prompt references (declared by prior steps).
        #[serde(default)]
        input_vars: Vec<String>,
        /// `$var` name to bind this step's output to.
        #[serde(default)]
        output_var: Option<String>,
        #[serde(default)]
        output_format: OutputFormat,
        /// Hint that the response may contain code (tightens analysis).
        #[serde(default)]
        expects_code: bool,
    },
    /// Execute a tool through the policy check and provenance trust gate.
    ToolCall {
        id: String,
        #[serde(default)]
        description: String,
        tool: String,
        #[serde(default)]
        args: BTreeMap<String, serde_json::Value>,
        #[serde(default)]
        output_var: Option<String>,
    },
}

impl PlanStep {
    pub fn id(&self) -> &str {
        match self {
            PlanStep::LlmTask { id, .. } | PlanStep::ToolCall { id, .. } => id,
        }
    }

    pub fn description(&self) -> &str {
        match self {
            PlanStep::LlmTask { description, .. } | PlanStep::ToolCall { description, .. } => {
                description
            }
        }
    }

    pub fn output_var(&self) -> Option<&str> {
        match self {
            PlanStep::LlmTask { output_var, .. } | PlanStep::ToolCall { output_var, .. } => {
                output_var.as_deref()
            }
        }
    }
}

/// An ordered execution plan produced by the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Human-readable summary of what the plan does.
    pub plan_summary: String,
    pub steps: Vec<PlanStep>,
}

impl Plan {
    /// Validate plan structure: non-empty, unique ids, every variable
    /// reference resolves to a prior step's output variable, and every
    /// referenced tool is in `known_tools`.
    pub fn validate(&self, known_tools: &[String]) -> Result<(), String> {
        if self.steps.is_empty() {
            return Err("plan has no steps".to_string());
        }

        let mut seen_ids = std::collections::HashSet::new();
        let mut defined_vars = std::collections::HashSet::new();

        for step in &self.steps {
            if !seen_ids.insert(step.id().to_string()) {
                return Err(format!("duplicate step id: {}", step.id()));
            }

            match step {
                PlanStep::LlmTask {
                    id,
                    prompt,
                    input_vars,
                    ..
                } => {
                    if prompt.trim().is_empty() {
                        return Err(format!("step {id} has an empty prompt"));
                    }
                    for var in input_vars {
                        if !defined_vars.contains(var.as_str()) {
                            return Err(format!("step {id} references undefined variable: {var}"));
                        }
                    }
                    // The chained-step contract is defined by actual
                    // references, so the prompt text is checked too — the
                    // declared input_vars list alone cannot be trusted.
                    for var in referenced_vars(prompt) {
                        if !defined_vars.contains(var.as_str()) {
                            return Err(format!("step {id} references undefined variable: {var}"));
                        }
                    }
                }
                PlanStep::ToolCall { id, tool, args, .. } => {
                    if !known_tools.iter().any(|t| t == tool) {
                        return Err(format!("step {id} references unknown tool: {tool}"));
                    }
                    for value in args.values() {
                        if let serde_json::Value::String(s) = value {
                            for var in referenced_vars(s) {
                                if !defined_vars.contains(var.as_str()) {
                                    return Err(format!(
                                        "step {id} references undefined variable: {var}"
                                    ));
                                }
                            }
                        }
                    }
                }
            }

            if let Some(var) = step.output_var() {
                defined_vars.insert(var.to_string());
            }
        }

        Ok(())
    }
}

/// Extract `$var` references from a text fragment.
pub fn referenced_vars(text: &str) -> Vec<String> {
    let mut vars = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            let start = i;
            i += 1;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            if i > start + 1 {
                vars.push(text[start..i].to_string());
            }
        } else {
            i += 1;
        }
    }
    vars
}

// ============================================================
// Task execution
// ============================================================

/// Status of a single executed plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Blocked,
    Error,
    Skipped,
}

/// Result of a single plan step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    /// Provenance id of the step's output, when one was produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_id: Option<String>,
    /// Step output content (empty on block/error).
    #[serde(default)]
    pub content: String,
    /// Block or failure detail.
    #[serde(default)]
    pub error: String,
}

/// Terminal status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    Blocked,
    Refused,
    Denied,
    AwaitingApproval,
    Error,
}

/// Conversation-analysis snapshot attached to a task result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationInfo {
    pub session_id: String,
    pub turn_number: usize,
    pub risk_score: f64,
    pub action: ConversationAction,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Verdict from the multi-turn conversation analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationAction {
    Allow,
    Warn,
    Block,
}

/// Result of a full task through the CaMeL loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// UUID for event-bus correlation.
    #[serde(default)]
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub plan_summary: String,
    #[serde(default)]
    pub step_results: Vec<StepResult>,
    /// Block/refusal attribution, when the task did not succeed.
    #[serde(default)]
    pub reason: String,
    /// Set when status is `awaiting_approval`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<ConversationInfo>,
}

impl TaskResult {
    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            task_id: String::new(),
            status: TaskStatus::Blocked,
            plan_summary: String::new(),
            step_results: Vec::new(),
            reason: reason.into(),
            approval_id: None,
            conversation: None,
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            task_id: String::new(),
            status: TaskStatus::Error,
            plan_summary: String::new(),
            step_results: Vec::new(),
            reason: reason.into(),
            approval_id: None,
            conversation: None,
        }
    }
}

// ============================================================
// Sessions
// ============================================================

/// Outcome recorded for one conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnOutcome {
    Allowed,
    Warned,
    Blocked,
    Refused,
    Executed,
    Failed,
}

impl TurnOutcome {
    /// Map a terminal task status onto the turn record.
    pub fn from_task_status(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Success => TurnOutcome::Executed,
            TaskStatus::Blocked | TaskStatus::Denied => TurnOutcome::Blocked,
            TaskStatus::Refused => TurnOutcome::Refused,
            TaskStatus::AwaitingApproval => TurnOutcome::Allowed,
            TaskStatus::Error => TurnOutcome::Failed,
        }
    }
}

/// One user request + outcome within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub request_text: String,
    pub outcome: TurnOutcome,
    /// Which layers blocked the turn, when it was blocked.
    #[serde(default)]
    pub blocked_by: Vec<String>,
    /// Per-rule risk breakdown from the conversation analyzer.
    #[serde(default)]
    pub rule_scores: BTreeMap<String, f64>,
    #[serde(default)]
    pub risk_score: f64,
    /// What the turn did, for planner conversation history.
    #[serde(default)]
    pub plan_summary: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(request_text: impl Into<String>, outcome: TurnOutcome) -> Self {
        Self {
            request_text: request_text.into(),
            outcome,
            blocked_by: Vec::new(),
            rule_scores: BTreeMap::new(),
            risk_score: 0.0,
            plan_summary: String::new(),
            timestamp: Utc::now(),
        }
    }
}

/// Per-source rolling conversation state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    /// Channel the session arrived through (e.g. "api", "mcp").
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub turns: Vec<Turn>,
    /// Monotonically non-decreasing risk across turns.
    #[serde(default)]
    pub cumulative_risk: f64,
    /// Count of prior blocked turns.
    #[serde(default)]
    pub violation_count: u32,
    /// A locked session rejects all new turns until unlocked.
    #[serde(default)]
    pub locked: bool,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl Session {
    pub fn new(session_id: impl Into<String>, source: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            source: source.into(),
            turns: Vec::new(),
            cumulative_risk: 0.0,
            violation_count: 0,
            locked: false,
            created_at: now,
            last_active: now,
        }
    }
}

// ============================================================
// Approvals
// ============================================================

/// Lifecycle state of an approval entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Granted,
    Denied,
    Expired,
    NotFound,
}

/// Snapshot returned by `ApprovalQueue::check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalCheck {
    pub status: ApprovalStatus,
    /// The pending plan, present while status is `pending` or `granted`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    /// Decision reason, when decided.
    #[serde(default)]
    pub reason: String,
    /// Who submitted the decision.
    #[serde(default)]
    pub decided_by: String,
    /// Source key captured at creation, for deferred turn recording.
    #[serde(default)]
    pub source_key: String,
    /// Original user request captured at creation.
    #[serde(default)]
    pub user_request: String,
    /// Session the request belonged to.
    #[serde(default)]
    pub session_id: String,
}

impl ApprovalCheck {
    pub fn not_found() -> Self {
        Self {
            status: ApprovalStatus::NotFound,
            plan: None,
            reason: String::new(),
            decided_by: String::new(),
            source_key: String::new(),
            user_request: String::new(),
            session_id: String::new(),
        }
    }
}

/// New unguessable id for approvals and data items.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn llm_step(id: &str, prompt: &str, input_vars: &[&str], output_var: Option<&str>) -> PlanStep {
        PlanStep::LlmTask {
            id: id.to_string(),
            description: String::new(),
            prompt: prompt.to_string(),
            input_vars: input_vars.iter().map(|s| s.to_string()).collect(),
            output_var: output_var.map(String::from),
            output_format: OutputFormat::None,
            expects_code: false,
        }
    }

    // ----------------------------------------------------------
    // Plan validation
    // ----------------------------------------------------------

    #[test]
    fn test_valid_single_step_plan() {
        let plan = Plan {
            plan_summary: "say hello".to_string(),
            steps: vec![llm_step("step_1", "Say hello", &[], None)],
        };
        assert!(plan.validate(&[]).is_ok());
    }

    #[test]
    fn test_empty_plan_rejected() {
        let plan = Plan {
            plan_summary: "nothing".to_string(),
            steps: vec![],
        };
        assert!(plan.validate(&[]).is_err());
    }

    #[test]
    fn test_duplicate_step_ids_rejected() {
        let plan = Plan {
            plan_summary: "dup".to_string(),
            steps: vec![
                llm_step("step_1", "a", &[], None),
                llm_step("step_1", "b", &[], None),
            ],
        };
        let err = plan.validate(&[]).unwrap_err();
        assert!(err.contains("duplicate step id"));
    }

    #[test]
    fn test_undefined_input_var_rejected() {
        let plan = Plan {
            plan_summary: "bad ref".to_string(),
            steps: vec![llm_step("step_1", "use $missing", &["$missing"], None)],
        };
        let err = plan.validate(&[]).unwrap_err();
        assert!(err.contains("undefined variable"));
    }

    #[test]
    fn test_undeclared_prompt_reference_rejected() {
        // The undefined reference appears only in the prompt text, not in
        // input_vars — it must still be caught.
        let plan = Plan {
            plan_summary: "bad ref".to_string(),
            steps: vec![llm_step("step_1", "Summarize $leaked", &[], None)],
        };
        let err = plan.validate(&[]).unwrap_err();
        assert!(err.contains("undefined variable"));
    }

    #[test]
    fn test_undeclared_but_resolvable_prompt_reference_valid() {
        // Referencing a prior step's output variable without listing it in
        // input_vars is valid: the reference resolves.
        let plan = Plan {
            plan_summary: "chain".to_string(),
            steps: vec![
                llm_step("step_1", "produce", &[], Some("$draft")),
                llm_step("step_2", "refine $draft", &[], None),
            ],
        };
        assert!(plan.validate(&[]).is_ok());
    }

    #[test]
    fn test_forward_reference_rejected() {
        // A step may only reference variables from *prior* steps.
        let plan = Plan {
            plan_summary: "forward".to_string(),
            steps: vec![
                llm_step("step_1", "use $later", &["$later"], None),
                llm_step("step_2", "produce", &[], Some("$later")),
            ],
        };
        assert!(plan.validate(&[]).is_err());
    }

    #[test]
    fn test_chained_vars_resolve() {
        let plan = Plan {
            plan_summary: "chain".to_string(),
            steps: vec![
                llm_step("step_1", "produce", &[], Some("$draft")),
                llm_step("step_2", "refine $draft", &["$draft"], Some("$final")),
            ],
        };
        assert!(plan.validate(&[]).is_ok());
    }

    #[test]
    fn test_unknown_tool_rejected() {
        let plan = Plan {
            plan_summary: "tool".to_string(),
            steps: vec![PlanStep::ToolCall {
                id: "step_1".to_string(),
                description: String::new(),
                tool: "rm_everything".to_string(),
                args: BTreeMap::new(),
                output_var: None,
            }],
        };
        let err = plan.validate(&["file_write".to_string()]).unwrap_err();
        assert!(err.contains("unknown tool"));
    }

    #[test]
    fn test_tool_arg_var_refs_validated() {
        let mut args = BTreeMap::new();
        args.insert(
            "path".to_string(),
            serde_json::Value::String("$nonexistent".to_string()),
        );
        let plan = Plan {
            plan_summary: "tool".to_string(),
            steps: vec![PlanStep::ToolCall {
                id: "step_1".to_string(),
                description: String::new(),
                tool: "file_write".to_string(),
                args,
                output_var: None,
            }],
        };
        assert!(plan.validate(&["file_write".to_string()]).is_err());
    }

    // ----------------------------------------------------------
    // Plan JSON round-trip
    // ----------------------------------------------------------

    #[test]
    fn test_plan_step_json_tagging() {
        let json = serde_json::json!({
            "plan_summary": "write a file",
            "steps": [
                {
                    "type": "llm_task",
                    "id": "step_1",
                    "description": "draft",
                    "prompt": "Write a haiku",
                    "output_var": "$haiku"
                },
                {
                    "type": "tool_call",
                    "id": "step_2",
                    "description": "save",
                    "tool": "file_write",
                    "args": {"path": "/workspace/haiku.txt", "content": "$haiku"}
                }
            ]
        });
        let plan: Plan = serde_json::from_value(json).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert!(matches!(plan.steps[0], PlanStep::LlmTask { .. }));
        assert!(matches!(plan.steps[1], PlanStep::ToolCall { .. }));
        assert_eq!(plan.steps[1].id(), "step_2");
    }

    #[test]
    fn test_output_format_deserializes() {
        let json = serde_json::json!({
            "type": "llm_task",
            "id": "s",
            "prompt": "p",
            "output_format": "json"
        });
        let step: PlanStep = serde_json::from_value(json).unwrap();
        match step {
            PlanStep::LlmTask { output_format, .. } => {
                assert_eq!(output_format, OutputFormat::Json)
            }
            _ => panic!("expected llm_task"),
        }
    }

    // ----------------------------------------------------------
    // Variable reference extraction
    // ----------------------------------------------------------

    #[test]
    fn test_referenced_vars() {
        let vars = referenced_vars("use $a and $b_2, not $ alone");
        assert_eq!(vars, vec!["$a", "$b_2"]);
    }

    #[test]
    fn test_referenced_vars_none() {
        assert!(referenced_vars("plain text, 5 dollars: 5$").is_empty());
    }

    // ----------------------------------------------------------
    // Misc
    // ----------------------------------------------------------

    #[test]
    fn test_source_default_trust() {
        assert_eq!(DataSource::User.default_trust(), TrustLevel::Trusted);
        assert_eq!(DataSource::Planner.default_trust(), TrustLevel::Trusted);
        assert_eq!(DataSource::Tool.default_trust(), TrustLevel::Trusted);
        assert_eq!(DataSource::Worker.default_trust(), TrustLevel::Untrusted);
        assert_eq!(DataSource::Web.default_trust(), TrustLevel::Untrusted);
        assert_eq!(DataSource::File.default_trust(), TrustLevel::Untrusted);
    }

    #[test]
    fn test_digest_stable() {
        assert_eq!(TaggedData::digest("abc"), TaggedData::digest("abc"));
        assert_ne!(TaggedData::digest("abc"), TaggedData::digest("abd"));
        assert_eq!(TaggedData::digest("").len(), 64);
    }

    #[test]
    fn test_scan_result_clean() {
        let r = ScanResult::clean("credential_scanner");
        assert!(!r.found);
        assert!(r.matches.is_empty());
    }

    #[test]
    fn test_turn_outcome_mapping() {
        assert_eq!(
            TurnOutcome::from_task_status(TaskStatus::Success),
            TurnOutcome::Executed
        );
        assert_eq!(
            TurnOutcome::from_task_status(TaskStatus::Blocked),
            TurnOutcome::Blocked
        );
        assert_eq!(
            TurnOutcome::from_task_status(TaskStatus::Refused),
            TurnOutcome::Refused
        );
        assert_eq!(
            TurnOutcome::from_task_status(TaskStatus::Error),
            TurnOutcome::Failed
        );
    }
}

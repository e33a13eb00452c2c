/// Gateway configuration, read from `SENTINEL_`-prefixed environment
/// variables with sensible defaults.
///
/// Loaded once at startup into an immutable struct that is cloned into the
/// subsystems that need it; hot-reload is deliberately out of scope.
use std::time::Duration;

use crate::errors::SentinelError;

/// How plans are released for execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalMode {
    /// Execute immediately after planning.
    Auto,
    /// Every plan waits in the approval queue for an explicit grant.
    Full,
}

impl std::str::FromStr for ApprovalMode {
    type Err = SentinelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(ApprovalMode::Auto),
            "full" => Ok(ApprovalMode::Full),
            other => Err(SentinelError::Config(format!(
                "invalid approval mode '{other}' (expected 'auto' or 'full')"
            ))),
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone)]
pub struct SentinelConfig {
    // -- Controller --
    /// Path to the YAML policy file.
    pub policy_file: String,
    /// Workspace root all tool paths resolve against.
    pub workspace_path: String,
    /// SQLite database path; empty selects the in-memory stores.
    pub db_path: String,

    // -- Approval --
    pub approval_mode: ApprovalMode,
    /// TTL for pending approvals.
    pub approval_ttl: Duration,

    // -- Worker (local, air-gapped) --
    pub worker_url: String,
    pub worker_model: String,
    /// Worker calls are allowed to run long (code generation on CPU).
    pub worker_timeout: Duration,

    // -- Planner (remote) --
    pub planner_url: String,
    pub planner_model: String,
    pub planner_max_tokens: u32,
    pub planner_timeout: Duration,
    /// Bounded retry attempts for transient planner failures.
    pub planner_retries: u32,

    // -- Scanning --
    pub spotlighting_enabled: bool,
    pub injection_classifier_enabled: bool,
    /// Fail closed when the classifier cannot be initialized.
    pub require_injection_classifier: bool,
    pub injection_threshold: f64,
    pub require_code_analyzer: bool,
    /// Combined prompt + data ceiling for worker calls, in chars.
    pub max_prompt_chars: usize,

    // -- Conversation analysis --
    pub conversation_enabled: bool,
    pub conversation_warn_threshold: f64,
    pub conversation_block_threshold: f64,

    // -- Sessions --
    pub session_ttl: Duration,
    pub session_max_count: usize,

    // -- Provenance --
    pub provenance_max_entries: usize,

    // -- Auth --
    pub pin_required: bool,
    /// Path to the PIN secret file.
    pub pin_file: String,
    /// Consecutive auth failures before a client identity is locked out.
    pub auth_max_failures: u32,
    /// Lockout cooldown window.
    pub auth_lockout: Duration,
    /// Fixed-window request budget per client identity.
    pub rate_limit_per_minute: u32,
    /// Comma-separated allowed origins for CSRF checks at the transport.
    pub allowed_origins: String,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            policy_file: "/policies/sentinel-policy.yaml".to_string(),
            workspace_path: "/workspace".to_string(),
            db_path: "/data/sentinel.db".to_string(),
            approval_mode: ApprovalMode::Auto,
            approval_ttl: Duration::from_secs(300),
            worker_url: "http://sentinel-worker:11434".to_string(),
            worker_model: "qwen3:14b".to_string(),
            worker_timeout: Duration::from_secs(1200),
            planner_url: "https://api.anthropic.com".to_string(),
            planner_model: "claude-sonnet-4-5-20250929".to_string(),
            planner_max_tokens: 4096,
            planner_timeout: Duration::from_secs(60),
            planner_retries: 2,
            spotlighting_enabled: true,
            injection_classifier_enabled: true,
            require_injection_classifier: true,
            injection_threshold: 0.9,
            require_code_analyzer: true,
            max_prompt_chars: 100_000,
            conversation_enabled: true,
            conversation_warn_threshold: 3.0,
            conversation_block_threshold: 5.0,
            session_ttl: Duration::from_secs(3600),
            session_max_count: 1000,
            provenance_max_entries: 10_000,
            pin_required: true,
            pin_file: "/run/secrets/sentinel_pin".to_string(),
            auth_max_failures: 5,
            auth_lockout: Duration::from_secs(300),
            rate_limit_per_minute: 60,
            allowed_origins: "https://localhost:3001".to_string(),
        }
    }
}

impl SentinelConfig {
    /// Build a config from `SENTINEL_*` environment variables, falling back
    /// to defaults for unset variables. Malformed values are errors, not
    /// silent fallbacks.
    pub fn from_env() -> Result<Self, SentinelError> {
        let mut cfg = Self::default();

        if let Some(v) = var("SENTINEL_POLICY_FILE") {
            cfg.policy_file = v;
        }
        if let Some(v) = var("SENTINEL_WORKSPACE_PATH") {
            cfg.workspace_path = v;
        }
        if let Some(v) = var("SENTINEL_DB_PATH") {
            cfg.db_path = v;
        }
        if let Some(v) = var("SENTINEL_APPROVAL_MODE") {
            cfg.approval_mode = v.parse()?;
        }
        if let Some(v) = var("SENTINEL_APPROVAL_TTL") {
            cfg.approval_ttl = Duration::from_secs(parse(&v, "SENTINEL_APPROVAL_TTL")?);
        }
        if let Some(v) = var("SENTINEL_WORKER_URL") {
            cfg.worker_url = v;
        }
        if let Some(v) = var("SENTINEL_WORKER_MODEL") {
            cfg.worker_model = v;
        }
        if let Some(v) = var("SENTINEL_WORKER_TIMEOUT") {
            cfg.worker_timeout = Duration::from_secs(parse(&v, "SENTINEL_WORKER_TIMEOUT")?);
        }
        if let Some(v) = var("SENTINEL_PLANNER_URL") {
            cfg.planner_url = v;
        }
        if let Some(v) = var("SENTINEL_PLANNER_MODEL") {
            cfg.planner_model = v;
        }
        if let Some(v) = var("SENTINEL_PLANNER_MAX_TOKENS") {
            cfg.planner_max_tokens = parse(&v, "SENTINEL_PLANNER_MAX_TOKENS")?;
        }
        if let Some(v) = var("SENTINEL_PLANNER_TIMEOUT") {
            cfg.planner_timeout = Duration::from_secs(parse(&v, "SENTINEL_PLANNER_TIMEOUT")?);
        }
        if let Some(v) = var("SENTINEL_PLANNER_RETRIES") {
            cfg.planner_retries = parse(&v, "SENTINEL_PLANNER_RETRIES")?;
        }
        if let Some(v) = var("SENTINEL_SPOTLIGHTING_ENABLED") {
            cfg.spotlighting_enabled = parse_bool(&v, "SENTINEL_SPOTLIGHTING_ENABLED")?;
        }
        if let Some(v) = var("SENTINEL_INJECTION_CLASSIFIER_ENABLED") {
            cfg.injection_classifier_enabled =
                parse_bool(&v, "SENTINEL_INJECTION_CLASSIFIER_ENABLED")?;
        }
        if let Some(v) = var("SENTINEL_REQUIRE_INJECTION_CLASSIFIER") {
            cfg.require_injection_classifier =
                parse_bool(&v, "SENTINEL_REQUIRE_INJECTION_CLASSIFIER")?;
        }
        if let Some(v) = var("SENTINEL_INJECTION_THRESHOLD") {
            cfg.injection_threshold = parse(&v, "SENTINEL_INJECTION_THRESHOLD")?;
        }
        if let Some(v) = var("SENTINEL_REQUIRE_CODE_ANALYZER") {
            cfg.require_code_analyzer = parse_bool(&v, "SENTINEL_REQUIRE_CODE_ANALYZER")?;
        }
        if let Some(v) = var("SENTINEL_MAX_PROMPT_CHARS") {
            cfg.max_prompt_chars = parse(&v, "SENTINEL_MAX_PROMPT_CHARS")?;
        }
        if let Some(v) = var("SENTINEL_CONVERSATION_ENABLED") {
            cfg.conversation_enabled = parse_bool(&v, "SENTINEL_CONVERSATION_ENABLED")?;
        }
        if let Some(v) = var("SENTINEL_CONVERSATION_WARN_THRESHOLD") {
            cfg.conversation_warn_threshold = parse(&v, "SENTINEL_CONVERSATION_WARN_THRESHOLD")?;
        }
        if let Some(v) = var("SENTINEL_CONVERSATION_BLOCK_THRESHOLD") {
            cfg.conversation_block_threshold = parse(&v, "SENTINEL_CONVERSATION_BLOCK_THRESHOLD")?;
        }
        if let Some(v) = var("SENTINEL_SESSION_TTL") {
            cfg.session_ttl = Duration::from_secs(parse(&v, "SENTINEL_SESSION_TTL")?);
        }
        if let Some(v) = var("SENTINEL_SESSION_MAX_COUNT") {
            cfg.session_max_count = parse(&v, "SENTINEL_SESSION_MAX_COUNT")?;
        }
        if let Some(v) = var("SENTINEL_PROVENANCE_MAX_ENTRIES") {
            cfg.provenance_max_entries = parse(&v, "SENTINEL_PROVENANCE_MAX_ENTRIES")?;
        }
        if let Some(v) = var("SENTINEL_PIN_REQUIRED") {
            cfg.pin_required = parse_bool(&v, "SENTINEL_PIN_REQUIRED")?;
        }
        if let Some(v) = var("SENTINEL_PIN_FILE") {
            cfg.pin_file = v;
        }
        if let Some(v) = var("SENTINEL_AUTH_MAX_FAILURES") {
            cfg.auth_max_failures = parse(&v, "SENTINEL_AUTH_MAX_FAILURES")?;
        }
        if let Some(v) = var("SENTINEL_AUTH_LOCKOUT") {
            cfg.auth_lockout = Duration::from_secs(parse(&v, "SENTINEL_AUTH_LOCKOUT")?);
        }
        if let Some(v) = var("SENTINEL_RATE_LIMIT_PER_MINUTE") {
            cfg.rate_limit_per_minute = parse(&v, "SENTINEL_RATE_LIMIT_PER_MINUTE")?;
        }
        if let Some(v) = var("SENTINEL_ALLOWED_ORIGINS") {
            cfg.allowed_origins = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<(), SentinelError> {
        if self.conversation_block_threshold < self.conversation_warn_threshold {
            return Err(SentinelError::Config(
                "conversation block threshold must be >= warn threshold".to_string(),
            ));
        }
        if self.max_prompt_chars == 0 {
            return Err(SentinelError::Config(
                "max_prompt_chars must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.injection_threshold) {
            return Err(SentinelError::Config(
                "injection threshold must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse<T: std::str::FromStr>(value: &str, name: &str) -> Result<T, SentinelError> {
    value
        .parse()
        .map_err(|_| SentinelError::Config(format!("invalid value for {name}: '{value}'")))
}

fn parse_bool(value: &str, name: &str) -> Result<bool, SentinelError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(SentinelError::Config(format!(
            "invalid boolean for {name}: '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        SentinelConfig::default().validate().unwrap();
    }

    #[test]
    fn test_approval_mode_parse() {
        assert_eq!("auto".parse::<ApprovalMode>().unwrap(), ApprovalMode::Auto);
        assert_eq!("full".parse::<ApprovalMode>().unwrap(), ApprovalMode::Full);
        assert!("smart".parse::<ApprovalMode>().is_err());
    }

    #[test]
    fn test_threshold_ordering_enforced() {
        let cfg = SentinelConfig {
            conversation_warn_threshold: 5.0,
            conversation_block_threshold: 3.0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_injection_threshold_bounds() {
        let cfg = SentinelConfig {
            injection_threshold: 1.5,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_parse_bool_values() {
        assert!(parse_bool("true", "X").unwrap());
        assert!(parse_bool("1", "X").unwrap());
        assert!(!parse_bool("off", "X").unwrap());
        assert!(parse_bool("maybe", "X").is_err());
    }
}

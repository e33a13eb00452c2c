//! Multi-turn conversation analysis.
//!
//! Deterministic heuristic scoring over a session's turn history. Eight
//! rules detect patterns that span turns: retry-after-block, capability
//! escalation, sensitive-topic acceleration, instruction override,
//! violation accumulation, context building, reconnaissance, and topic
//! shift. Risk accumulates within a session and never decreases; crossing
//! the block threshold locks the session.
//!
//! Individually benign turns that escalate gradually enough can still slip
//! through — that is a stated non-goal.

use std::collections::BTreeMap;

use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, info};

use sentinel_types::models::{ConversationAction, Session, TurnOutcome};

/// Per-rule score cap.
const RULE_CAP: f64 = 5.0;

/// Capability tiers ordered by severity.
const CAPABILITY_TIERS: &[(&str, u8)] = &[
    ("observe", 0),
    ("read", 1),
    ("write", 2),
    ("execute", 3),
    ("persist", 4),
    ("exfiltrate", 5),
];

fn tier_value(tier: &str) -> u8 {
    CAPABILITY_TIERS
        .iter()
        .find(|(name, _)| *name == tier)
        .map(|(_, v)| *v)
        .unwrap_or(0)
}

/// Keywords that map request text to capability tiers.
const TIER_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "observe",
        &["list", "show", "display", "status", "check", "info", "describe", "what is"],
    ),
    (
        "read",
        &["read", "cat", "view", "open", "get contents", "print file", "head", "tail", "less"],
    ),
    (
        "write",
        &["write", "create", "edit", "modify", "append", "save", "update file", "overwrite"],
    ),
    (
        "execute",
        &["run", "execute", "bash", "shell", "script", "command", "invoke", "launch"],
    ),
    (
        "persist",
        &[
            "cron", "crontab", "systemd", "service", "startup", "autostart", "schedule",
            "daemon", "boot", "init.d", "rc.local", "persist", "backdoor",
        ],
    ),
    (
        "exfiltrate",
        &[
            "curl", "wget", "upload", "send to", "post to", "exfil", "transfer out",
            "base64 encode", "dns tunnel", "reverse shell", "nc -e", "netcat",
        ],
    ),
];

/// Sensitive topic keywords.
const SENSITIVE_TOPICS: &[&str] = &[
    "password", "secret", "credential", "api key", "token", "private key",
    "shadow", "passwd", "/etc/shadow", ".ssh", "authorized_keys",
    "root access", "sudo", "privilege", "escalat",
    "reverse shell", "backdoor", "exploit", "payload", "malware",
    "disable security", "disable firewall", "disable logging",
    "delete logs", "clear history", "cover tracks",
    "/root/", "/home/", "/var/log/", "bash_history", ".bashrc",
    "sudoers", "auth.log", "system access",
];

/// Escalation-framing phrases for the context-building rule.
const ESCALATION_LANGUAGE: &[&str] = &[
    "now that we have", "next step", "final step", "the real task",
    "what i actually need", "the important part",
];

fn override_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)\bfrom now on\b",
            r"(?i)\byou are now\b",
            r"(?i)\bforget (?:(?:your |all |previous |the )*)?(?:instructions|rules|constraints)\b",
            r"(?i)\bignore (?:(?:your |all |previous |the )*)?(?:instructions|rules|constraints|policies)\b",
            r"(?i)\byour new (?:role|persona|identity|instructions)\b",
            r"(?i)\byou (?:must|should|will) now\b",
            r"(?i)\bact as (?:if you are|a|an|my)\b",
            r"(?i)\bpretend (?:you are|to be|that)\b",
            r"(?i)\bswitch to (?:\w+ )?mode\b",
            r"(?i)\benable (?:developer|debug|admin|god|unrestricted) mode\b",
            r"(?i)\bjailbreak\b",
            r"\bDAN\b",
            r"(?i)\bsystem\s+override\b",
            r"(?i)\bsafety\s+mode\s+(?:is\s+)?off\b",
            r"(?i)\ball\s+restrictions?\s+(?:are\s+)?(?:now\s+)?(?:lifted|removed|disabled)\b",
            r"(?i)\bbypass\s+(?:all\s+)?(?:filters?|security|restrictions?|constraints?)\b",
            r"(?i)\b(?:new|updated)\s+directive\b",
            r"(?i)\bdisable\s+(?:content\s+)?filter(?:ing|s)?\b",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("override pattern"))
        .collect()
    })
}

fn context_reference_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)\bas (?:I|we) (?:mentioned|discussed|said|noted)\b",
            r"(?i)\byou (?:already|previously) (?:said|confirmed|agreed|told me)\b",
            r"(?i)\bremember (?:when|that|earlier)\b",
            r"(?i)\bbased on (?:our|the) (?:earlier|previous|prior) (?:conversation|discussion)\b",
            r"(?i)\bcontinuing (?:from|where|what)\b",
            r"(?i)\bso (?:now|next|then) (?:can you|let's|we can)\b",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("context reference pattern"))
        .collect()
    })
}

fn recon_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)\b(?:ls|list|dir)\s+",
            r"(?i)\blist\s+(?:files|directories|folders)\b",
            r"(?i)\bwhat(?:'s| is)\s+in\b",
            r"(?i)\bshow\s+(?:me\s+)?(?:the\s+)?(?:files|contents|directory|folder)\b",
            r"(?i)\bshow\s+me\s+/",
            r"(?i)\bcontents?\s+of\b",
            r"(?i)\btree\s+",
            r"(?i)\bfind\s+.*(?:/\w+)",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("recon pattern"))
        .collect()
    })
}

/// Topic categories for the topic-shift rule, checked in priority order
/// (system > file > code > text > question).
const TOPIC_CATEGORIES: &[(&str, &[&str])] = &[
    (
        "system",
        &["execute", "run", "bash", "shell", "command", "sudo", "process", "kill", "service"],
    ),
    (
        "file",
        &["file", "directory", "path", "read file", "list files", "contents of"],
    ),
    (
        "code",
        &["write code", "function", "class", "implement", "refactor", "debug", "algorithm", "variable"],
    ),
    (
        "text",
        &["write", "essay", "summarize", "translate", "explain", "describe", "poem", "story"],
    ),
    (
        "question",
        &["what is", "how does", "why", "can you explain", "tell me about", "help me understand"],
    ),
];

/// Result of analyzing one request against its session.
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub action: ConversationAction,
    pub total_score: f64,
    pub rule_scores: BTreeMap<String, f64>,
    pub warnings: Vec<String>,
}

impl AnalysisResult {
    fn allow() -> Self {
        Self {
            action: ConversationAction::Allow,
            total_score: 0.0,
            rule_scores: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }
}

/// Deterministic multi-turn attack detection via heuristic scoring.
pub struct ConversationAnalyzer {
    warn_threshold: f64,
    block_threshold: f64,
}

impl ConversationAnalyzer {
    pub fn new(warn_threshold: f64, block_threshold: f64) -> Self {
        Self {
            warn_threshold,
            block_threshold,
        }
    }

    fn action_for(&self, score: f64) -> ConversationAction {
        if score >= self.block_threshold {
            ConversationAction::Block
        } else if score >= self.warn_threshold {
            ConversationAction::Warn
        } else {
            ConversationAction::Allow
        }
    }

    /// Analyze a request in the context of its session history.
    ///
    /// The first turn only evaluates the stateless instruction-override
    /// rule; the history-dependent rules have nothing to compare against.
    pub fn analyze(&self, session: &Session, current_request: &str) -> AnalysisResult {
        if session.turns.is_empty() {
            let (score, warnings) = check_instruction_override(current_request);
            if score > 0.0 {
                let action = self.action_for(score);
                info!(
                    event = "conversation_first_turn_override",
                    session_id = %session.session_id,
                    score,
                    action = ?action,
                );
                let mut rule_scores = BTreeMap::new();
                rule_scores.insert("instruction_override".to_string(), score);
                return AnalysisResult {
                    action,
                    total_score: score,
                    rule_scores,
                    warnings,
                };
            }
            debug!(
                event = "conversation_first_turn",
                session_id = %session.session_id,
            );
            return AnalysisResult::allow();
        }

        let mut rule_scores = BTreeMap::new();
        let mut warnings = Vec::new();

        let rules: [(&str, (f64, Vec<String>)); 8] = [
            ("retry_after_block", check_retry_after_block(session, current_request)),
            ("escalation", check_escalation(session, current_request)),
            (
                "sensitive_topic_acceleration",
                check_sensitive_topic_acceleration(session, current_request),
            ),
            ("instruction_override", check_instruction_override(current_request)),
            ("violation_accumulation", check_violation_accumulation(session)),
            ("context_building", check_context_building(current_request)),
            ("reconnaissance", check_reconnaissance(session, current_request)),
            ("topic_shift", check_topic_shift(session, current_request)),
        ];

        for (name, (score, rule_warnings)) in rules {
            if score > 0.0 {
                rule_scores.insert(name.to_string(), score);
                warnings.extend(rule_warnings);
            }
        }

        // Cumulative risk carries forward: the total can only grow.
        let total: f64 = rule_scores.values().sum::<f64>() + session.cumulative_risk;
        let action = self.action_for(total);

        info!(
            event = "conversation_analysis",
            session_id = %session.session_id,
            turn = session.turns.len(),
            action = ?action,
            total_score = total,
        );

        AnalysisResult {
            action,
            total_score: total,
            rule_scores,
            warnings,
        }
    }
}

// ── Rule 1: retry after block ──────────────────────────────────

fn check_retry_after_block(session: &Session, current: &str) -> (f64, Vec<String>) {
    let current_lower = current.to_lowercase();
    let mut score: f64 = 0.0;
    let mut warnings = Vec::new();

    for turn in &session.turns {
        if turn.outcome != TurnOutcome::Blocked {
            continue;
        }
        let ratio = lcs_ratio(&current_lower, &turn.request_text.to_lowercase());
        if ratio > 0.45 {
            score += 3.0;
            warnings.push(format!(
                "request similar to a previously blocked request (similarity {:.0}%)",
                ratio * 100.0
            ));
        }
    }

    (score.min(RULE_CAP), warnings)
}

/// Longest-common-subsequence ratio: 2·LCS(a,b) / (|a| + |b|).
///
/// Inputs are truncated to bound the DP table; the ratio over a long
/// shared prefix still clears the threshold.
pub fn lcs_ratio(a: &str, b: &str) -> f64 {
    const MAX: usize = 400;
    let a: Vec<char> = a.chars().take(MAX).collect();
    let b: Vec<char> = b.chars().take(MAX).collect();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let mut prev = vec![0usize; b.len() + 1];
    let mut row = vec![0usize; b.len() + 1];
    for &ca in &a {
        for (j, &cb) in b.iter().enumerate() {
            row[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(row[j])
            };
        }
        std::mem::swap(&mut prev, &mut row);
        row[0] = 0;
    }
    let lcs = prev[b.len()];
    (2.0 * lcs as f64) / ((a.len() + b.len()) as f64)
}

// ── Rule 2: capability escalation ──────────────────────────────

fn classify_tier(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    let mut best: Option<&'static str> = None;
    let mut best_value = -1i16;

    for (tier, keywords) in TIER_KEYWORDS {
        for kw in *keywords {
            if contains_word(&lower, kw) {
                let value = tier_value(tier) as i16;
                if value > best_value {
                    best = Some(tier);
                    best_value = value;
                }
            }
        }
    }
    best
}

/// Word-boundary containment so "running" does not match "run".
fn contains_word(haystack: &str, needle: &str) -> bool {
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(needle) {
        let abs = start + pos;
        let before_ok = abs == 0
            || !haystack[..abs]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_alphanumeric());
        let after = abs + needle.len();
        let after_ok = after >= haystack.len()
            || !haystack[after..]
                .chars()
                .next()
                .is_some_and(|c| c.is_alphanumeric());
        if before_ok && after_ok {
            return true;
        }
        start = abs + 1;
    }
    false
}

fn check_escalation(session: &Session, current: &str) -> (f64, Vec<String>) {
    let Some(current_tier) = classify_tier(current) else {
        return (0.0, Vec::new());
    };
    let current_value = tier_value(current_tier);

    let prev_max = session
        .turns
        .iter()
        .filter_map(|t| classify_tier(&t.request_text))
        .map(tier_value)
        .max();

    let mut score = 0.0;
    let mut warnings = Vec::new();

    if let Some(prev_value) = prev_max {
        let jump = current_value as i16 - prev_value as i16;
        if jump >= 2 {
            score = (jump as f64).min(RULE_CAP);
            warnings.push(format!(
                "capability escalation: +{jump} tiers to {current_tier}"
            ));
        }
    }
    // Entering persist or exfiltrate is flagged, but only the first time —
    // a session already at that tier does not re-accrue the bonus on every
    // turn (same first-occurrence shape as the sensitive-topic rule).
    let already_high_risk = prev_max.is_some_and(|v| v >= tier_value("persist"));
    if matches!(current_tier, "persist" | "exfiltrate") && score == 0.0 && !already_high_risk {
        score = 3.0;
        warnings.push(format!("high-risk capability tier: {current_tier}"));
    }

    (score, warnings)
}

// ── Rule 3: sensitive topic acceleration ───────────────────────

fn mentions_sensitive_topic(text: &str) -> bool {
    let lower = text.to_lowercase();
    SENSITIVE_TOPICS.iter().any(|t| lower.contains(t))
}

fn check_sensitive_topic_acceleration(session: &Session, current: &str) -> (f64, Vec<String>) {
    if !mentions_sensitive_topic(current) {
        return (0.0, Vec::new());
    }
    // Only the *first* sensitive mention accelerates.
    if session.turns.iter().any(|t| mentions_sensitive_topic(&t.request_text)) {
        return (0.0, Vec::new());
    }

    let benign_count = session
        .turns
        .iter()
        .filter(|t| t.outcome != TurnOutcome::Blocked)
        .count();

    match benign_count {
        0 => (0.0, Vec::new()),
        1..=3 => (
            2.0,
            vec![format!("sensitive topic introduced after {benign_count} benign turns")],
        ),
        _ => (
            3.0,
            vec![format!("sensitive topic introduced after {benign_count} benign turns")],
        ),
    }
}

// ── Rule 4: instruction override ───────────────────────────────

fn check_instruction_override(current: &str) -> (f64, Vec<String>) {
    let mut score: f64 = 0.0;
    let mut warnings = Vec::new();

    for pattern in override_patterns() {
        if pattern.is_match(current) {
            score += 3.0;
            warnings.push(format!("instruction override attempt: '{}'", pattern.as_str()));
        }
    }

    (score.min(RULE_CAP), warnings)
}

// ── Rule 5: violation accumulation ─────────────────────────────

fn check_violation_accumulation(session: &Session) -> (f64, Vec<String>) {
    if session.violation_count == 0 {
        return (0.0, Vec::new());
    }
    let score = (session.violation_count as f64 * 1.5).min(RULE_CAP);
    (
        score,
        vec![format!(
            "session has {} prior violation(s)",
            session.violation_count
        )],
    )
}

// ── Rule 6: context building ───────────────────────────────────

fn check_context_building(current: &str) -> (f64, Vec<String>) {
    if !context_reference_patterns().iter().any(|p| p.is_match(current)) {
        return (0.0, Vec::new());
    }

    let lower = current.to_lowercase();
    let mut score: f64 = 0.0;
    let mut warnings = Vec::new();

    if mentions_sensitive_topic(current) {
        score += 2.0;
        warnings.push("context reference combined with sensitive topic".to_string());
    }
    if ESCALATION_LANGUAGE.iter().any(|p| lower.contains(p)) {
        score += 2.0;
        warnings.push("context reference combined with escalation language".to_string());
    }

    (score.min(4.0), warnings)
}

// ── Rule 7: reconnaissance ─────────────────────────────────────

fn is_recon(text: &str) -> bool {
    recon_patterns().iter().any(|p| p.is_match(text))
}

fn check_reconnaissance(session: &Session, current: &str) -> (f64, Vec<String>) {
    let mut recon_count = session
        .turns
        .iter()
        .filter(|t| is_recon(&t.request_text))
        .count();
    if is_recon(current) {
        recon_count += 1;
    }

    match recon_count {
        0 | 1 => (0.0, Vec::new()),
        2 => (
            2.0,
            vec![format!("reconnaissance pattern: {recon_count} exploration turns")],
        ),
        _ => (
            3.5,
            vec![format!("systematic reconnaissance: {recon_count} exploration turns")],
        ),
    }
}

// ── Rule 8: topic shift ────────────────────────────────────────

fn classify_topic(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    for (category, keywords) in TOPIC_CATEGORIES {
        if keywords.iter().any(|kw| lower.contains(kw)) {
            return Some(category);
        }
    }
    None
}

fn check_topic_shift(session: &Session, current: &str) -> (f64, Vec<String>) {
    if session.turns.len() < 2 {
        return (0.0, Vec::new());
    }

    let Some(current_cat) = classify_topic(current) else {
        return (0.0, Vec::new());
    };
    if !matches!(current_cat, "system" | "file") {
        return (0.0, Vec::new());
    }

    let early: Vec<&str> = session
        .turns
        .iter()
        .take(3)
        .filter_map(|t| classify_topic(&t.request_text))
        .collect();

    let benign_start = !early.is_empty()
        && early
            .iter()
            .all(|c| matches!(*c, "code" | "text" | "question"));
    if benign_start {
        return (
            1.5,
            vec![format!("topic shift from benign categories to {current_cat}")],
        );
    }

    (0.0, Vec::new())
}

// ============================================================
// Tests
// ============================================================

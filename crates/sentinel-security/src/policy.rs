//! Deterministic policy engine.
//!
//! Loads a YAML policy file once at startup into an immutable structure and
//! answers allow/deny for file paths and shell commands. Paths are
//! normalized *before* matching: iterative percent-decoding, NFC, null-byte
//! rejection, traversal detection on the raw input, resolution against the
//! workspace root, and symlink resolution bounded by the root. Decisions
//! are deterministic and terminal; a denied operation is never retried.

use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};

use glob::Pattern;
use serde::Deserialize;
use tracing::{debug, warn};
use unicode_normalization::UnicodeNormalization;

use sentinel_types::errors::SentinelError;
use sentinel_types::models::{PathOperation, PolicyDecision};

// ============================================================
// Policy file format
// ============================================================

/// Root of the YAML policy file. Unknown keys are rejected at load.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyFile {
    /// Globs where writes and creates are allowed.
    #[serde(default)]
    pub writable_paths: Vec<String>,
    /// Globs where reads are allowed.
    #[serde(default)]
    pub read_allowed_paths: Vec<String>,
    /// Globs that are always denied, checked before any allowlist.
    #[serde(default)]
    pub blocked_paths: Vec<String>,
    /// Command head → rule. Multi-word heads (e.g. "podman build") allowed.
    #[serde(default)]
    pub allowed_commands: BTreeMap<String, CommandRule>,
    /// Substrings that block a command outright.
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
    /// Extra credential regexes merged into the credential scanner.
    #[serde(default)]
    pub credential_patterns: Vec<CredentialPatternDef>,
    /// Extra sensitive paths merged into the sensitive-path scanner catalog.
    #[serde(default)]
    pub sensitive_paths: Vec<String>,
    /// Hosts outbound tools may reach (consumed by external transports).
    #[serde(default)]
    pub network_allowlist: Vec<String>,
}

/// Per-command policy flags.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandRule {
    /// Every path argument must pass a read check against the workspace.
    #[serde(default)]
    pub path_constrained: bool,
}

/// A policy-supplied credential pattern.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialPatternDef {
    pub id: String,
    pub regex: String,
    /// Substrings that suppress a match (placeholder values).
    #[serde(default)]
    pub allowlist_substrings: Vec<String>,
}

// ============================================================
// Engine
// ============================================================

/// A compiled path rule: the original glob text plus its pattern and id.
#[derive(Debug)]
struct PathRule {
    rule_id: String,
    pattern: Pattern,
    raw: String,
}

/// Deterministic YAML-driven allow/deny over paths and commands.
#[derive(Debug)]
pub struct PolicyEngine {
    workspace_root: PathBuf,
    blocked: Vec<PathRule>,
    write_allowed: Vec<PathRule>,
    read_allowed: Vec<PathRule>,
    allowed_commands: HashSet<String>,
    path_constrained: HashSet<String>,
    blocked_patterns: Vec<String>,
    policy: PolicyFile,
}

impl PolicyEngine {
    /// Load and compile a policy file. Fatal on unreadable files, malformed
    /// YAML, unknown keys, or invalid globs — the service must not start
    /// with a partial policy.
    pub fn from_file(path: &str, workspace_root: &str) -> Result<Self, SentinelError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SentinelError::Policy(format!("cannot read policy file {path}: {e}")))?;
        Self::from_yaml(&content, workspace_root)
    }

    /// Compile a policy from YAML text.
    pub fn from_yaml(yaml: &str, workspace_root: &str) -> Result<Self, SentinelError> {
        let policy: PolicyFile = serde_yaml::from_str(yaml)
            .map_err(|e| SentinelError::Policy(format!("malformed policy file: {e}")))?;
        Self::from_policy(policy, workspace_root)
    }

    /// Compile an already-parsed policy.
    pub fn from_policy(policy: PolicyFile, workspace_root: &str) -> Result<Self, SentinelError> {
        let compile = |globs: &[String], kind: &str| -> Result<Vec<PathRule>, SentinelError> {
            globs
                .iter()
                .map(|g| {
                    Ok(PathRule {
                        rule_id: format!("policy:{kind}:{}", slug(g)),
                        pattern: Pattern::new(g).map_err(|e| {
                            SentinelError::Policy(format!("invalid glob '{g}': {e}"))
                        })?,
                        raw: g.clone(),
                    })
                })
                .collect()
        };

        Ok(Self {
            workspace_root: PathBuf::from(workspace_root),
            blocked: compile(&policy.blocked_paths, "blocked_path")?,
            write_allowed: compile(&policy.writable_paths, "writable_path")?,
            read_allowed: compile(&policy.read_allowed_paths, "read_allowed_path")?,
            allowed_commands: policy.allowed_commands.keys().cloned().collect(),
            path_constrained: policy
                .allowed_commands
                .iter()
                .filter(|(_, rule)| rule.path_constrained)
                .map(|(name, _)| name.clone())
                .collect(),
            blocked_patterns: policy.blocked_patterns.clone(),
            policy,
        })
    }

    /// The parsed policy, for scanners that consume its catalogs.
    pub fn policy(&self) -> &PolicyFile {
        &self.policy
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    // ── Path checks ─────────────────────────────────────────────

    /// Check a file operation against policy. Match order: explicit
    /// denylist → operation-specific allowlist → default deny.
    pub fn check_path(&self, path: &str, operation: PathOperation) -> PolicyDecision {
        // Null bytes in any form are an attempted truncation attack.
        if path.contains('\0') || path.to_ascii_lowercase().contains("%00") {
            return blocked("policy:path_null_byte", "null byte in path");
        }

        let decoded = percent_decode_iterative(path);

        // Traversal is detected on the decoded input before normalization —
        // a `..` that lexically cancels out is still an attempt.
        if decoded.contains("..") || path.to_ascii_lowercase().contains("%2e%2e") {
            return blocked("policy:path_traversal", "path traversal detected");
        }

        let normalized: String = decoded.nfc().collect();
        let resolved = self.resolve(&normalized);

        // Symlink escape: a path lexically inside the workspace must not
        // resolve outside it.
        if let Some(real) = canonicalize_bounded(&resolved) {
            if resolved.starts_with(&self.workspace_root) && !real.starts_with(&self.workspace_root)
            {
                warn!(
                    event = "policy_symlink_escape",
                    path,
                    resolved = %real.display(),
                    "path escapes workspace through a symlink"
                );
                return blocked("policy:symlink_escape", "path escapes the workspace root");
            }
        }

        let candidate = resolved.to_string_lossy();

        for rule in &self.blocked {
            if glob_matches(&rule.pattern, &rule.raw, &candidate) {
                debug!(event = "policy_path_blocked", path = %candidate, rule = %rule.rule_id);
                return blocked(&rule.rule_id, format!("path matches blocked glob {}", rule.raw));
            }
        }

        let allowlist = match operation {
            PathOperation::Read => &self.read_allowed,
            PathOperation::Write | PathOperation::Create => &self.write_allowed,
        };
        for rule in allowlist {
            if glob_matches(&rule.pattern, &rule.raw, &candidate) {
                return PolicyDecision::Allowed {
                    rule_id: rule.rule_id.clone(),
                };
            }
        }

        blocked(
            "policy:path_default_deny",
            format!("path not in {operation} allowlist"),
        )
    }

    /// The canonical form of a path as used for policy matching: decoded,
    /// NFC-normalized, resolved against the workspace root. File
    /// provenance is keyed by this form so lookups agree with the checks.
    pub fn canonical_path(&self, path: &str) -> String {
        let decoded = percent_decode_iterative(path);
        let normalized: String = decoded.nfc().collect();
        self.resolve(&normalized).to_string_lossy().into_owned()
    }

    /// Resolve a path against the workspace root and collapse `.`
    /// components without touching the filesystem.
    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        let joined = if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.workspace_root.join(p)
        };

        let mut out = PathBuf::new();
        for comp in joined.components() {
            match comp {
                Component::CurDir => {}
                other => out.push(other.as_os_str()),
            }
        }
        out
    }

    // ── Command checks ──────────────────────────────────────────

    /// Check a shell command against policy: injection metacharacters,
    /// blocked substrings, head allowlist, and per-argument read checks for
    /// path-constrained commands.
    pub fn check_command(&self, command: &str) -> PolicyDecision {
        let stripped = command.trim();
        if stripped.is_empty() {
            return blocked("policy:empty_command", "empty command");
        }

        // Structural shell-injection patterns, checked on the raw string so
        // quoting tricks cannot hide them from the tokenizer.
        for (needle, rule) in [
            ("&&", "policy:shell_injection:and_chain"),
            ("||", "policy:shell_injection:or_chain"),
            (";", "policy:shell_injection:semicolon"),
            ("$(", "policy:shell_injection:command_substitution"),
            ("`", "policy:shell_injection:backtick"),
        ] {
            if stripped.contains(needle) {
                return blocked(rule, format!("injection pattern '{needle}'"));
            }
        }
        // `||` was already rejected above, so any remaining pipe is a bare
        // pipe.
        if stripped.contains('|') {
            return blocked("policy:shell_injection:pipe", "injection pattern '|'");
        }

        for pattern in &self.blocked_patterns {
            if stripped.contains(pattern.as_str()) {
                return blocked(
                    &format!("policy:blocked_command:{}", slug(pattern)),
                    format!("matches blocked pattern '{pattern}'"),
                );
            }
        }

        let Some(tokens) = shell_tokens(stripped) else {
            return blocked("policy:command_unparseable", "unbalanced quoting");
        };
        if tokens.is_empty() {
            return blocked("policy:empty_command", "empty command");
        }

        // find -exec spawns arbitrary commands and bypasses the head check.
        if tokens[0] == "find"
            && tokens
                .iter()
                .any(|t| t == "-exec" || t == "-execdir" || t == "-ok" || t == "-okdir")
        {
            return blocked("policy:shell_injection:find_exec", "find -exec is blocked");
        }

        let (head, arg_start) = self.base_command(&tokens);
        if !self.allowed_commands.contains(&head) {
            return blocked(
                &format!("policy:command_not_allowed:{}", slug(&head)),
                format!("command not in allowlist: {head}"),
            );
        }

        if self.path_constrained.contains(&head) {
            for arg in &tokens[arg_start..] {
                if arg.starts_with('-') || arg.contains(['*', '?', '[']) {
                    continue;
                }
                let resolved = if arg.starts_with('/') {
                    arg.clone()
                } else {
                    self.workspace_root.join(arg).to_string_lossy().into_owned()
                };
                if let PolicyDecision::Blocked { rule_id, .. } =
                    self.check_path(&resolved, PathOperation::Read)
                {
                    return blocked(
                        &rule_id,
                        format!("path-constrained command '{head}' used with blocked path {arg}"),
                    );
                }
            }
        }

        PolicyDecision::Allowed {
            rule_id: format!("policy:allowed_command:{}", slug(&head)),
        }
    }

    /// Extract the base command, preferring a two-word head when the
    /// allowlist contains one (e.g. "podman build").
    fn base_command(&self, tokens: &[String]) -> (String, usize) {
        if tokens.len() >= 2 {
            let two_word = format!("{} {}", tokens[0], tokens[1]);
            if self.allowed_commands.contains(&two_word) {
                return (two_word, 2);
            }
        }
        (tokens[0].clone(), 1)
    }
}

// ============================================================
// Helpers
// ============================================================

fn blocked(rule_id: &str, reason: impl Into<String>) -> PolicyDecision {
    PolicyDecision::Blocked {
        rule_id: rule_id.to_string(),
        reason: reason.into(),
    }
}

/// Stable rule-id fragment from arbitrary pattern text.
fn slug(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_us = false;
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_us = false;
        } else if !last_us && !out.is_empty() {
            out.push('_');
            last_us = true;
        }
    }
    out.trim_end_matches('_').to_string()
}

/// Iteratively percent-decode to defeat double/triple encoding. Bounded to
/// ten rounds.
fn percent_decode_iterative(input: &str) -> String {
    let mut current = input.to_string();
    for _ in 0..10 {
        let decoded = percent_decode_once(&current);
        if decoded == current {
            break;
        }
        current = decoded;
    }
    current
}

fn percent_decode_once(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                out.push(hi * 16 + lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Canonicalize the deepest existing prefix of a path and rejoin the
/// remainder, so symlinks resolve without requiring the leaf to exist.
fn canonicalize_bounded(path: &Path) -> Option<PathBuf> {
    let mut existing = path;
    let mut tail = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(real) => {
                let mut out = real;
                for comp in tail.iter().rev() {
                    out.push(comp);
                }
                return Some(out);
            }
            Err(_) => {
                tail.push(existing.file_name()?.to_os_string());
                existing = existing.parent()?;
            }
        }
    }
}

/// Glob match with the directory-itself special case: `/workspace/**` also
/// matches `/workspace`.
fn glob_matches(pattern: &Pattern, raw: &str, path: &str) -> bool {
    if pattern.matches(path) {
        return true;
    }
    if let Some(dir) = raw.strip_suffix("/**") {
        return path.trim_end_matches('/') == dir.trim_end_matches('/');
    }
    false
}

/// Quote-aware POSIX-style tokenizer. Returns None on unbalanced quoting.
pub fn shell_tokens(command: &str) -> Option<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = command.chars().peekable();
    let mut in_token = false;

    while let Some(ch) = chars.next() {
        match ch {
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return None,
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c) => current.push(c),
                            None => return None,
                        },
                        Some(c) => current.push(c),
                        None => return None,
                    }
                }
            }
            '\\' => {
                in_token = true;
                match chars.next() {
                    Some(c) => current.push(c),
                    None => return None,
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    Some(tokens)
}

// ============================================================
// Tests
// ============================================================

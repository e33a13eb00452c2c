//! Sensitive-path scanner.
//!
//! Substring scanner over a catalog of sensitive filesystem locations. In
//! input mode every occurrence is flagged. In output mode the scan is
//! context-aware: a path is only flagged when it appears in an operational
//! context — inside a fenced code block, on a shell-command line, or as a
//! standalone path-only line. Paths mentioned in explanatory prose,
//! markdown bullet lists, or YAML config context pass through, so the
//! worker can still *explain* what `/etc/shadow` is without tripping the
//! gate.

use regex::Regex;

use sentinel_types::models::{ScanContext, ScanMatch, ScanResult, Severity};
use sentinel_types::traits::Scanner;

/// Built-in catalog of sensitive locations. The policy file's
/// `sensitive_paths` list is appended to these.
const BUILTIN_CATALOG: &[&str] = &[
    "/etc/shadow",
    "/etc/passwd",
    "/etc/sudoers",
    "/etc/gshadow",
    "~/.ssh/",
    ".ssh/id_rsa",
    "id_rsa",
    "id_ed25519",
    ".pem",
    ".env",
    ".bitcoin/",
    "wallet.dat",
    "/var/log/auth.log",
    "/var/log/secure",
    "/root/",
    ".bash_history",
    ".kube/config",
    ".aws/credentials",
    ".netrc",
    ".gnupg/",
];

/// Substring scanner for sensitive path references.
pub struct SensitivePathScanner {
    catalog: Vec<String>,
    shell_prefix: Regex,
    fenced_block: Regex,
    bullet_line: Regex,
    yaml_key_line: Regex,
    explainer_after: Regex,
}

impl SensitivePathScanner {
    pub fn new() -> Self {
        Self::with_catalog(&[])
    }

    /// Build a scanner with the built-in catalog plus policy additions.
    pub fn with_catalog(extra: &[String]) -> Self {
        let mut catalog: Vec<String> = BUILTIN_CATALOG.iter().map(|s| s.to_string()).collect();
        for path in extra {
            if !catalog.contains(path) {
                catalog.push(path.clone());
            }
        }
        Self {
            catalog,
            shell_prefix: Regex::new(
                r"(?i)^\s*(?:\$|#|sudo|cat|rm|chmod|chown|ls|cp|mv|mkdir|touch|head|tail|less|more|grep|nano|vi|vim)\s",
            )
            .expect("shell prefix regex"),
            fenced_block: Regex::new(r"(?s)```[^\n]*\n(.*?)```").expect("fence regex"),
            bullet_line: Regex::new(r"^\s*[-*]\s+").expect("bullet regex"),
            yaml_key_line: Regex::new(r"^\s+\w[\w_-]*\s*:").expect("yaml key regex"),
            explainer_after: Regex::new(r"^[—–\-:]\s+\w").expect("explainer regex"),
        }
    }

    /// All occurrences of every catalog entry, with positions.
    fn find_all(&self, text: &str) -> Vec<(usize, &str)> {
        let mut hits = Vec::new();
        for pattern in &self.catalog {
            let mut idx = 0;
            while let Some(pos) = text[idx..].find(pattern.as_str()) {
                let absolute = idx + pos;
                hits.push((absolute, pattern.as_str()));
                idx = absolute + 1;
            }
        }
        hits.sort_by_key(|(pos, _)| *pos);
        hits
    }

    /// Output-mode context check: is this occurrence operational?
    fn is_operational(
        &self,
        text: &str,
        pos: usize,
        pattern: &str,
        code_ranges: &[(usize, usize)],
    ) -> bool {
        // 1. Inside a fenced code block.
        if code_ranges.iter().any(|(start, end)| *start <= pos && pos < *end) {
            return true;
        }

        let line_start = text[..pos].rfind('\n').map(|i| i + 1).unwrap_or(0);
        let line_end = text[pos..]
            .find('\n')
            .map(|i| pos + i)
            .unwrap_or(text.len());
        let line = &text[line_start..line_end];
        let stripped = line.trim();

        // 2. The line looks like a shell command.
        if self.shell_prefix.is_match(line) {
            return true;
        }

        // 3. Standalone path-only line.
        if stripped == pattern || stripped == pattern.trim_end_matches('/') {
            return true;
        }

        // 4. Markdown bullet with surrounding prose is educational.
        if self.bullet_line.is_match(line) && stripped.len() > pattern.len() + 5 {
            return false;
        }

        // 5. Path followed by explanatory text ("— stores ...").
        let path_end_in_line = pos + pattern.len() - line_start;
        if path_end_in_line < line.len() {
            let after = line[path_end_in_line..].trim_start();
            if self.explainer_after.is_match(after) {
                return false;
            }
        }

        // 6. YAML/config key context.
        if self.yaml_key_line.is_match(line) {
            return false;
        }

        // Prose context: educational, not operational.
        false
    }
}

impl Default for SensitivePathScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Scanner for SensitivePathScanner {
    fn name(&self) -> &'static str {
        "sensitive_path_scanner"
    }

    fn scan(&self, text: &str, context: ScanContext) -> ScanResult {
        let hits = self.find_all(text);

        let matches: Vec<ScanMatch> = match context {
            ScanContext::Input => hits
                .into_iter()
                .map(|(pos, pattern)| ScanMatch {
                    pattern_name: "sensitive_path".to_string(),
                    matched_text: pattern.to_string(),
                    position: pos,
                    decoded_preview: None,
                })
                .collect(),
            ScanContext::Output => {
                let code_ranges: Vec<(usize, usize)> = self
                    .fenced_block
                    .captures_iter(text)
                    .filter_map(|c| c.get(1).map(|m| (m.start(), m.end())))
                    .collect();
                hits.into_iter()
                    .filter(|(pos, pattern)| self.is_operational(text, *pos, pattern, &code_ranges))
                    .map(|(pos, pattern)| ScanMatch {
                        pattern_name: "sensitive_path".to_string(),
                        matched_text: pattern.to_string(),
                        position: pos,
                        decoded_preview: None,
                    })
                    .collect()
            }
        };

        ScanResult::with_matches("sensitive_path_scanner", matches, Severity::High)
    }
}

// ============================================================
// Tests
// ============================================================

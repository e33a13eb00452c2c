//! Vulnerability-echo scanner.
//!
//! When a user pastes vulnerable code and asks for help, the worker must
//! not hand the vulnerability back. This scanner fingerprints dangerous
//! constructs in the user's input and in the worker output's *code
//! regions* (fenced blocks and indented lines), and flags only the
//! intersection. A fingerprint present in the input but absent from the
//! output code means the worker fixed it; a fingerprint only mentioned in
//! output prose is education, not an echo.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;

use sentinel_types::models::{ScanMatch, ScanResult, Severity};

struct Fingerprint {
    name: &'static str,
    regex: Regex,
}

fn fingerprints() -> &'static Vec<Fingerprint> {
    static FPS: OnceLock<Vec<Fingerprint>> = OnceLock::new();
    FPS.get_or_init(|| {
        let fp = |name: &'static str, pattern: &str| Fingerprint {
            name,
            regex: Regex::new(pattern)
                .unwrap_or_else(|e| panic!("invalid echo fingerprint '{name}': {e}")),
        };
        vec![
            // Python
            fp("python_eval", r"\beval\s*\("),
            fp("python_exec", r"\bexec\s*\("),
            fp("python_os_system", r"\bos\.system\s*\("),
            fp("python_os_popen", r"\bos\.popen\s*\("),
            fp(
                "python_subprocess_shell",
                r"(?s)\bsubprocess\.\w+\([^)]*shell\s*=\s*True",
            ),
            fp("python_pickle", r"\bpickle\.loads?\s*\("),
            fp("python_yaml_unsafe", r"\byaml\.load\s*\("),
            fp("python_import", r"__import__\s*\("),
            // JavaScript
            fp("js_child_process", r"\bchild_process\.exec\s*\("),
            fp("js_innerhtml", r"\.innerHTML\s*="),
            // SQL
            fp("sql_tautology", r#"(?i)['"]?\s*(?:OR|AND)\s+\d+\s*=\s*\d+"#),
            fp("sql_union", r"(?i)\bUNION\s+SELECT\b"),
            fp("sql_drop", r"(?i);\s*DROP\s+TABLE\b"),
            // General
            fp("deserialization", r"\b(?:deserialize|unserialize)\s*\("),
        ]
    })
}

fn code_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```[^\n]*\n(.*?)```").expect("fence regex"))
}

fn indented_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^(?:    |\t).+").expect("indent regex"))
}

/// Compares vulnerability fingerprints between input and output.
pub struct VulnerabilityEchoScanner;

impl VulnerabilityEchoScanner {
    pub fn new() -> Self {
        Self
    }

    /// Concatenate the output's code regions: fenced blocks plus 4-space or
    /// tab indented lines.
    fn extract_code_regions(text: &str) -> String {
        let mut parts: Vec<&str> = Vec::new();
        for caps in code_block_re().captures_iter(text) {
            if let Some(m) = caps.get(1) {
                parts.push(m.as_str());
            }
        }
        for m in indented_line_re().find_iter(text) {
            parts.push(m.as_str());
        }
        parts.join("\n")
    }

    fn find_fingerprints(text: &str) -> BTreeSet<&'static str> {
        fingerprints()
            .iter()
            .filter(|fp| fp.regex.is_match(text))
            .map(|fp| fp.name)
            .collect()
    }

    /// Flag fingerprints present in both the input and the output's code
    /// regions.
    pub fn scan_pair(&self, input_text: &str, output_text: &str) -> ScanResult {
        let input_fps = Self::find_fingerprints(input_text);
        if input_fps.is_empty() {
            return ScanResult::clean("vulnerability_echo_scanner");
        }

        let output_code = Self::extract_code_regions(output_text);
        let output_fps = Self::find_fingerprints(&output_code);

        let echoed: Vec<&&str> = input_fps.intersection(&output_fps).collect();
        let matches = echoed
            .into_iter()
            .map(|fp| ScanMatch {
                pattern_name: format!("vuln_echo:{fp}"),
                matched_text: fp.to_string(),
                position: 0,
                decoded_preview: None,
            })
            .collect();

        ScanResult::with_matches("vulnerability_echo_scanner", matches, Severity::High)
    }
}

impl Default for VulnerabilityEchoScanner {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================
// Tests
// ============================================================

//! Static analysis of generated code.
//!
//! Per-language rule sets over extracted code blocks: each rule names an
//! insecure API or construct with a stable rule id. Rules with a language
//! hint only run against blocks detected as that language; language-free
//! rules run everywhere. The analyzer sits behind the same lazy-init +
//! required/fail-closed contract as the injection classifier so a
//! deployment can swap in an external analyzer without changing the
//! pipeline.

use std::sync::OnceLock;

use regex::Regex;

use sentinel_types::models::{ScanMatch, ScanResult, Severity};

use crate::code_extractor::{CodeBlock, Language};

/// One static-analysis rule.
struct CodeRule {
    /// Stable rule id (e.g. "py_eval").
    id: &'static str,
    regex: Regex,
    /// Restrict the rule to one language; None runs on every block.
    language: Option<Language>,
}

/// Regex-rule static analyzer for generated code.
pub struct CodeAnalyzer {
    rules: Vec<CodeRule>,
    state: OnceLock<Result<(), String>>,
    required: bool,
}

impl CodeAnalyzer {
    pub fn new(required: bool) -> Self {
        Self {
            rules: builtin_rules(),
            state: OnceLock::new(),
            required,
        }
    }

    /// Whether the analyzer is usable (forces initialization).
    pub fn is_ready(&self) -> bool {
        self.state.get_or_init(|| Ok(())).is_ok()
    }

    /// Whether an unusable analyzer must fail the request closed.
    pub fn required(&self) -> bool {
        self.required
    }

    /// Analyze one code block with its language hint.
    pub fn analyze_block(&self, block: &CodeBlock) -> Vec<ScanMatch> {
        let mut matches = Vec::new();
        for rule in &self.rules {
            if let (Some(rule_lang), Some(block_lang)) = (rule.language, block.language) {
                if rule_lang != block_lang {
                    continue;
                }
            }
            for mat in rule.regex.find_iter(&block.code) {
                matches.push(ScanMatch {
                    pattern_name: format!("code_analyzer_{}", rule.id),
                    matched_text: mat.as_str().to_string(),
                    position: mat.start(),
                    decoded_preview: None,
                });
            }
        }
        matches
    }

    /// Analyze all blocks and merge findings into one result.
    pub fn analyze(&self, blocks: &[CodeBlock]) -> ScanResult {
        if !self.is_ready() {
            if self.required {
                return ScanResult::with_matches(
                    "code_analyzer",
                    vec![ScanMatch {
                        pattern_name: "scanner_unavailable".to_string(),
                        matched_text: "code analyzer required but unavailable".to_string(),
                        position: 0,
                        decoded_preview: None,
                    }],
                    Severity::Critical,
                );
            }
            return ScanResult::clean("code_analyzer");
        }

        let mut matches = Vec::new();
        for block in blocks {
            matches.extend(self.analyze_block(block));
        }
        ScanResult::with_matches("code_analyzer", matches, Severity::High)
    }
}

fn builtin_rules() -> Vec<CodeRule> {
    let rule = |id: &'static str, language: Option<Language>, pattern: &str| CodeRule {
        id,
        language,
        regex: Regex::new(pattern).unwrap_or_else(|e| panic!("invalid code rule '{id}': {e}")),
    };

    vec![
        // Python
        rule("py_eval", Some(Language::Python), r"\beval\s*\("),
        rule("py_exec", Some(Language::Python), r"\bexec\s*\("),
        rule("py_os_system", Some(Language::Python), r"\bos\.system\s*\("),
        rule("py_os_popen", Some(Language::Python), r"\bos\.popen\s*\("),
        rule(
            "py_subprocess_shell",
            Some(Language::Python),
            r"(?s)\bsubprocess\.\w+\([^)]*shell\s*=\s*True",
        ),
        rule("py_pickle_load", Some(Language::Python), r"\bpickle\.loads?\s*\("),
        rule(
            "py_yaml_unsafe_load",
            Some(Language::Python),
            r"\byaml\.load\s*\((?:[^)]*)?\)",
        ),
        rule("py_dunder_import", Some(Language::Python), r"__import__\s*\("),
        // JavaScript
        rule(
            "js_child_process_exec",
            Some(Language::JavaScript),
            r"\bchild_process\.exec\s*\(|\bexecSync\s*\(",
        ),
        rule("js_eval", Some(Language::JavaScript), r"\beval\s*\("),
        rule("js_innerhtml", Some(Language::JavaScript), r"\.innerHTML\s*="),
        rule(
            "js_new_function",
            Some(Language::JavaScript),
            r"\bnew\s+Function\s*\(",
        ),
        // PHP
        rule("php_eval", Some(Language::Php), r"\beval\s*\("),
        rule(
            "php_shell_exec",
            Some(Language::Php),
            r"\b(shell_exec|passthru|system|proc_open)\s*\(",
        ),
        // SQL shapes, any language
        rule(
            "sql_string_interpolation",
            None,
            r"(?i)(SELECT|INSERT|UPDATE|DELETE)\s[^\n;]*(\+\s*\w+|%s|\{\w+\}|\$\{\w+\})",
        ),
        rule("sql_drop_chain", None, r"(?i);\s*DROP\s+TABLE\b"),
        // Generic
        rule("unsafe_deserialize", None, r"\b(?:unserialize|deserialize)\s*\("),
        rule(
            "hardcoded_tmp_exec",
            None,
            r"(?i)chmod\s*\(\s*['\x22]/tmp/",
        ),
    ]
}

// ============================================================
// Tests
// ============================================================

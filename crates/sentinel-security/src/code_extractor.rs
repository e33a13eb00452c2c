//! Extract fenced code blocks from markdown-formatted worker output.
//!
//! The static analyzer can only parse actual code, not mixed prose, so the
//! pipeline extracts fenced blocks first. The language comes from the
//! fence tag when present, otherwise from keyword heuristics. Emoji are
//! stripped from code blocks only — they break parsers — while prose keeps
//! its decoration.

use regex::Regex;
use std::sync::OnceLock;

/// Supported analysis languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Python,
    JavaScript,
    Rust,
    Java,
    C,
    Cpp,
    CSharp,
    Php,
}

/// A code block extracted from markdown text.
#[derive(Debug, Clone)]
pub struct CodeBlock {
    pub code: String,
    pub language: Option<Language>,
}

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(\w+)?[ \t]*\n(.*?)```").expect("fence regex"))
}

/// Map a fence tag to an analysis language.
fn map_tag(tag: &str) -> Option<Language> {
    match tag.to_ascii_lowercase().as_str() {
        "python" | "py" | "python3" => Some(Language::Python),
        "javascript" | "js" | "typescript" | "ts" => Some(Language::JavaScript),
        "rust" | "rs" => Some(Language::Rust),
        "java" => Some(Language::Java),
        "c" => Some(Language::C),
        "cpp" | "cxx" | "c++" => Some(Language::Cpp),
        "csharp" | "cs" => Some(Language::CSharp),
        "php" => Some(Language::Php),
        _ => None,
    }
}

/// Heuristic language detection for untagged blocks.
pub fn detect_language(code: &str) -> Option<Language> {
    static HINTS: OnceLock<Vec<(Language, Regex)>> = OnceLock::new();
    let hints = HINTS.get_or_init(|| {
        let rules: &[(Language, &str)] = &[
            (
                Language::Python,
                r"(?m)^\s*(?:import |from \w+ import |def |class \w+:|#!/usr/bin/env python)",
            ),
            // Rust before JavaScript: "let mut" is more specific than "let ".
            (
                Language::Rust,
                r"(?m)^\s*(?:fn |let mut |pub fn |use \w+::|impl )",
            ),
            (
                Language::JavaScript,
                r"(?m)^\s*(?:const |let |var |function |=>|require\(|import \{)",
            ),
            (
                Language::Java,
                r"(?m)^\s*(?:public class |private |protected |System\.)",
            ),
            (Language::C, r#"(?m)^\s*#include\s+[<"]"#),
            (Language::Php, r"<\?php|\$\w+\s*="),
        ];
        rules
            .iter()
            .map(|(lang, pattern)| (*lang, Regex::new(pattern).expect("hint regex")))
            .collect()
    });

    hints
        .iter()
        .find(|(_, re)| re.is_match(code))
        .map(|(lang, _)| *lang)
}

/// Emoji and symbol ranges that cause syntax errors in code.
fn emoji_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            "[\u{2600}-\u{27BF}\u{FE00}-\u{FE0F}\u{200D}\u{20E3}\u{1F000}-\u{1FAFF}]+",
        )
        .expect("emoji regex")
    })
}

/// Strip emoji from fenced code blocks, preserving prose outside fences.
pub fn strip_emoji_from_code_blocks(text: &str) -> String {
    fence_re()
        .replace_all(text, |caps: &regex::Captures| {
            let tag = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            let code = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            let cleaned = emoji_re().replace_all(code, "");
            if tag.is_empty() {
                format!("```\n{cleaned}```")
            } else {
                format!("```{tag}\n{cleaned}```")
            }
        })
        .into_owned()
}

/// Extract fenced code blocks with language hints.
///
/// With no fenced blocks, the full text is returned as a single block so
/// downstream analysis still sees everything.
pub fn extract_code_blocks(text: &str) -> Vec<CodeBlock> {
    let mut blocks = Vec::new();

    for caps in fence_re().captures_iter(text) {
        let code = caps
            .get(2)
            .map(|m| m.as_str().trim())
            .unwrap_or_default()
            .to_string();
        if code.is_empty() {
            continue;
        }

        let language = caps
            .get(1)
            .and_then(|m| map_tag(m.as_str()))
            .or_else(|| detect_language(&code));

        blocks.push(CodeBlock { code, language });
    }

    if blocks.is_empty() {
        blocks.push(CodeBlock {
            code: text.to_string(),
            language: detect_language(text),
        });
    }

    blocks
}

// ============================================================
// Tests
// ============================================================

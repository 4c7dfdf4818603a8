//! Best-effort failure analysis.
//!
//! Before a repair the pipeline asks an LLM for a short, user-facing summary
//! of the failure and whether it is a one-line quick fix (a missing import).
//! Analysis never fails the run: any error yields a fallback built from the
//! failure descriptor.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::adapter::prompts::{build_analysis_prompt, ANALYST_SYSTEM_PROMPT};
use crate::classifier::FailureDescriptor;
use crate::error::LlmError;
use crate::llm::{complete, LlmProvider};
use crate::utils::extract_json_object;

/// Default cap on summary length, in characters.
pub const DEFAULT_SUMMARY_MAX_CHARS: usize = 400;

/// How the analyst thinks the failure should be fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FixType {
    #[serde(rename = "QUICK_FIX", alias = "quick_fix")]
    QuickFix,
    #[serde(rename = "FULL_REPAIR", alias = "full_repair")]
    FullRepair,
}

/// Details of a locally applicable fix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuickFix {
    /// Only `add_import` is supported.
    pub action: String,
    pub library: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// Result of analysing one failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureAnalysis {
    pub summary: String,
    pub fix_type: FixType,
    #[serde(default, rename = "quick_fix_details", skip_serializing_if = "Option::is_none")]
    pub quick_fix: Option<QuickFix>,
}

impl FailureAnalysis {
    /// Analysis used when the LLM is unavailable or its answer is unusable.
    pub fn fallback(failure: &FailureDescriptor, max_chars: usize) -> Self {
        Self {
            summary: cap_summary(&failure.to_string(), max_chars),
            fix_type: FixType::FullRepair,
            quick_fix: None,
        }
    }

    /// The quick fix to apply, if the analysis proposes a usable one.
    pub fn applicable_quick_fix(&self) -> Option<&QuickFix> {
        if self.fix_type != FixType::QuickFix {
            return None;
        }
        self.quick_fix
            .as_ref()
            .filter(|fix| fix.action == "add_import" && is_module_path(&fix.library))
    }
}

/// Produces a [`FailureAnalysis`] for a failed attempt.
#[async_trait]
pub trait FailureAnalyst: Send + Sync {
    /// Never fails; falls back to the descriptor when analysis is impossible.
    async fn analyze(
        &self,
        code: &str,
        failure: &FailureDescriptor,
        stderr: &str,
        objective: Option<&str>,
    ) -> FailureAnalysis;
}

/// Analyst that asks an LLM.
pub struct LlmFailureAnalyst {
    provider: Arc<dyn LlmProvider>,
    model: String,
    max_chars: usize,
}

impl LlmFailureAnalyst {
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            max_chars: DEFAULT_SUMMARY_MAX_CHARS,
        }
    }

    /// Sets the summary cap.
    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }

    async fn request(
        &self,
        code: &str,
        failure: &FailureDescriptor,
        stderr: &str,
        objective: Option<&str>,
    ) -> Result<FailureAnalysis, LlmError> {
        let prompt = build_analysis_prompt(code, failure, stderr, objective);
        let response = complete(
            self.provider.as_ref(),
            &self.model,
            ANALYST_SYSTEM_PROMPT,
            prompt,
            0.0,
            512,
        )
        .await?;

        let json = extract_json_object(&response)
            .ok_or_else(|| LlmError::ParseError("no JSON object in analysis".to_string()))?;
        let mut analysis: FailureAnalysis =
            serde_json::from_str(&json).map_err(|e| LlmError::ParseError(e.to_string()))?;

        if analysis.summary.trim().is_empty() {
            return Err(LlmError::ParseError("empty summary".to_string()));
        }
        analysis.summary = cap_summary(analysis.summary.trim(), self.max_chars);
        Ok(analysis)
    }
}

#[async_trait]
impl FailureAnalyst for LlmFailureAnalyst {
    async fn analyze(
        &self,
        code: &str,
        failure: &FailureDescriptor,
        stderr: &str,
        objective: Option<&str>,
    ) -> FailureAnalysis {
        match self.request(code, failure, stderr, objective).await {
            Ok(analysis) => analysis,
            Err(e) => {
                tracing::warn!(error = %e, "Failure analysis unavailable, using descriptor");
                FailureAnalysis::fallback(failure, self.max_chars)
            }
        }
    }
}

/// Analyst that never calls out; used when summaries are disabled.
#[derive(Debug, Clone)]
pub struct DescriptorAnalyst {
    max_chars: usize,
}

impl DescriptorAnalyst {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

#[async_trait]
impl FailureAnalyst for DescriptorAnalyst {
    async fn analyze(
        &self,
        _code: &str,
        failure: &FailureDescriptor,
        _stderr: &str,
        _objective: Option<&str>,
    ) -> FailureAnalysis {
        FailureAnalysis::fallback(failure, self.max_chars)
    }
}

/// Caps a summary at `max_chars` characters, marking the cut with "...".
pub fn cap_summary(summary: &str, max_chars: usize) -> String {
    if summary.chars().count() <= max_chars {
        return summary.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let cut: String = summary.chars().take(keep).collect();
    format!("{}...", cut.trim_end())
}

fn module_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$")
            .expect("Invalid regex for module paths")
    })
}

fn is_module_path(name: &str) -> bool {
    module_regex().is_match(name)
}

fn is_identifier(name: &str) -> bool {
    is_module_path(name) && !name.contains('.')
}

/// Conventional aliases for libraries generated code uses without importing.
fn conventional_alias(library: &str) -> Option<&'static str> {
    match library {
        "numpy" => Some("np"),
        "pandas" => Some("pd"),
        "matplotlib.pyplot" => Some("plt"),
        "seaborn" => Some("sns"),
        _ => None,
    }
}

/// Index of the first line an import may go on: after the shebang, encoding
/// comment, module docstring and `from __future__` imports.
fn import_insertion_point(lines: &[&str]) -> usize {
    let mut insert_at = lines
        .iter()
        .take_while(|line| {
            let line = line.trim();
            line.starts_with("#!") || is_encoding_comment(line)
        })
        .count();

    let next = skip_trivia(lines, insert_at);
    if let Some(end) = docstring_end(lines, next) {
        insert_at = end + 1;
    }

    loop {
        let next = skip_trivia(lines, insert_at);
        match lines.get(next) {
            Some(line) if line.trim_start().starts_with("from __future__") => {
                insert_at = statement_end(lines, next) + 1;
            }
            _ => return insert_at,
        }
    }
}

fn is_encoding_comment(line: &str) -> bool {
    line.starts_with('#') && line.contains("coding") && (line.contains(':') || line.contains('='))
}

/// First line at or after `from` that is neither blank nor a comment.
fn skip_trivia(lines: &[&str], from: usize) -> usize {
    from + lines[from.min(lines.len())..]
        .iter()
        .take_while(|line| {
            let line = line.trim();
            line.is_empty() || line.starts_with('#')
        })
        .count()
}

/// Last line of a triple-quoted docstring starting on line `at`.
fn docstring_end(lines: &[&str], at: usize) -> Option<usize> {
    let line = lines.get(at)?.trim_start();
    let line = line.trim_start_matches(['r', 'R', 'u', 'U']);
    let quote = ["\"\"\"", "'''"].into_iter().find(|q| line.starts_with(q))?;

    if line[quote.len()..].contains(quote) {
        return Some(at);
    }
    lines[at + 1..]
        .iter()
        .position(|line| line.contains(quote))
        .map(|offset| at + 1 + offset)
}

/// Last line of a statement, following an open parenthesis.
fn statement_end(lines: &[&str], at: usize) -> usize {
    if !lines[at].contains('(') || lines[at].contains(')') {
        return at;
    }
    lines[at + 1..]
        .iter()
        .position(|line| line.contains(')'))
        .map(|offset| at + 1 + offset)
        .unwrap_or(at)
}

/// Applies an `add_import` quick fix to `code`.
///
/// Returns `None` when the fix is not applicable or the import is already
/// present, in which case the caller should fall back to a full repair.
pub fn apply_quick_fix(code: &str, fix: &QuickFix) -> Option<String> {
    if fix.action != "add_import" || !is_module_path(&fix.library) {
        return None;
    }

    let alias = match fix.alias.as_deref() {
        Some(alias) if is_identifier(alias) => Some(alias),
        Some(_) => return None,
        None => conventional_alias(&fix.library),
    };

    let statement = match alias {
        Some(alias) if alias != fix.library => format!("import {} as {}", fix.library, alias),
        _ => format!("import {}", fix.library),
    };

    if code.lines().any(|line| line.trim() == statement) {
        return None;
    }

    let lines: Vec<&str> = code.lines().collect();
    let insert_at = import_insertion_point(&lines);

    let mut patched: Vec<&str> = Vec::with_capacity(lines.len() + 1);
    patched.extend_from_slice(&lines[..insert_at]);
    patched.push(&statement);
    patched.extend_from_slice(&lines[insert_at..]);

    let mut result = patched.join("\n");
    if code.ends_with('\n') {
        result.push('\n');
    }
    Some(result)
}

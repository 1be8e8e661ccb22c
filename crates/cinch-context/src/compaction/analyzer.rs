//! Importance classification, critical-information extraction and
//! summarization of conversation rounds.
//!
//! [`HeuristicAnalyzer`] does all three with regular expressions and no
//! model call. Implement [`RoundAnalyzer`] to plug in something smarter.

use super::round::{RoundImportance, ToolCallRecord};
use super::summary::{CodeChangeRef, ExtractedInfo, RoundSummary};
use crate::budget::estimate_tokens;
use regex::Regex;
use std::sync::LazyLock;

/// Borrowed view of a full round.
#[derive(Debug, Clone, Copy)]
pub struct RoundView<'a> {
    pub user_message: &'a str,
    pub assistant_response: &'a str,
    pub tool_calls: &'a [ToolCallRecord],
}

/// Pluggable round analysis used by the compaction engine.
pub trait RoundAnalyzer: Send + Sync {
    fn importance(&self, round: RoundView<'_>) -> RoundImportance;

    /// Statements worth keeping for the rest of the session.
    fn extract(&self, round: RoundView<'_>) -> ExtractedInfo;

    /// Summarize a round. `summary_tokens` is the estimate of the rendered
    /// summary; the engine applies its own floor afterwards.
    fn summarize(&self, round: RoundView<'_>, brief_max_chars: usize) -> RoundSummary;
}

// ── Patterns ───────────────────────────────────────────────────────

static REQUIREMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(must|should|needs? to|required|requires?|ensure|make sure|has to|have to)\b",
    )
    .expect("valid requirement regex")
});

static DECISION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(decided|decide to|we will|we'll|let's|going to|chose|choose to|will use|instead of|opted|settled on)\b",
    )
    .expect("valid decision regex")
});

static URGENCY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(important|critical|urgent|asap|crucial)\b").expect("valid urgency regex")
});

static CODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(fn|function|class|def|const|let|impl|struct|enum|trait|interface|import)\s+\w+")
        .expect("valid code regex")
});

static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"!!|(?i:\[important\])|\b(IMPORTANT|CRITICAL|URGENT)\b")
        .expect("valid marker regex")
});

static FACT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(note that|remember|located in|defined in|lives in|runs on|is stored in)\b")
        .expect("valid fact regex")
});

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```([\w+#-]*)[^\n]*\n(.*?)```").expect("valid fence regex")
});

static PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:[\w.-]+/)*[\w-]+\.(?:rs|py|ts|tsx|js|jsx|go|java|kt|c|h|cpp|hpp|cs|rb|swift|toml|json|ya?ml|md|sql|sh)\b",
    )
    .expect("valid path regex")
});

/// How far before a code fence a path mention still names the fenced code.
const PATH_LOOKBACK_BYTES: usize = 200;

/// Tool names that write files.
const WRITE_TOOL_MARKERS: &[&str] = &["write", "edit", "create", "patch", "replace"];

// ── Heuristic analyzer ─────────────────────────────────────────────

/// Regex-based [`RoundAnalyzer`].
#[derive(Debug, Clone, Default)]
pub struct HeuristicAnalyzer;

impl HeuristicAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

impl RoundAnalyzer for HeuristicAnalyzer {
    fn importance(&self, round: RoundView<'_>) -> RoundImportance {
        let text = joined(round);
        let requirement_hits = REQUIREMENT_RE.find_iter(&text).count();
        let decision_hits = DECISION_RE.find_iter(&text).count();
        let urgency_hits = URGENCY_RE.find_iter(&text).count();
        let has_code = text.contains("```") || CODE_RE.is_match(&text) || !writes(round).is_empty();
        let is_marked_important = MARKER_RE.is_match(round.user_message);

        let auto_score = if is_marked_important {
            1.0
        } else {
            let score = 0.15 * requirement_hits.min(2) as f64
                + 0.15 * decision_hits.min(2) as f64
                + 0.15 * urgency_hits.min(2) as f64
                + if has_code { 0.2 } else { 0.0 };
            score.min(1.0)
        };

        RoundImportance {
            has_requirements: requirement_hits > 0,
            has_decisions: decision_hits > 0,
            has_code,
            is_marked_important,
            auto_score,
        }
    }

    fn extract(&self, round: RoundView<'_>) -> ExtractedInfo {
        let mut info = ExtractedInfo::default();
        for sentence in sentences(round.user_message).chain(sentences(round.assistant_response)) {
            if REQUIREMENT_RE.is_match(sentence) {
                push_unique(&mut info.requirements, sentence);
            }
            if DECISION_RE.is_match(sentence) {
                push_unique(&mut info.decisions, sentence);
            }
            if FACT_RE.is_match(sentence) {
                push_unique(&mut info.facts, sentence);
            }
        }
        info.code_changes = code_changes(round);
        info
    }

    fn summarize(&self, round: RoundView<'_>, brief_max_chars: usize) -> RoundSummary {
        let info = self.extract(round);
        let brief = sentences(round.user_message)
            .next()
            .map(|s| truncate_chars(s, brief_max_chars))
            .unwrap_or_default();
        let original_tokens = estimate_tokens(round.user_message)
            + estimate_tokens(round.assistant_response)
            + round
                .tool_calls
                .iter()
                .map(|c| {
                    estimate_tokens(&c.name)
                        + estimate_tokens(&c.arguments)
                        + c.output.as_deref().map_or(0, estimate_tokens)
                })
                .sum::<usize>();

        let mut summary = RoundSummary {
            brief,
            key_decisions: info.decisions,
            requirements: info.requirements,
            code_changes: info.code_changes,
            original_tokens,
            summary_tokens: 0,
        };
        summary.summary_tokens = estimate_tokens(&summary.render());
        summary
    }
}

// ── Helpers ────────────────────────────────────────────────────────

fn joined(round: RoundView<'_>) -> String {
    format!("{}\n{}", round.user_message, round.assistant_response)
}

fn push_unique(list: &mut Vec<String>, sentence: &str) {
    if !list.iter().any(|s| s == sentence) {
        list.push(sentence.to_string());
    }
}

/// Split on `.`, `!`, `?` followed by whitespace (or end of text), and on
/// newlines. Fenced code is skipped.
pub(crate) fn sentences(text: &str) -> impl Iterator<Item = &str> {
    let fences: Vec<(usize, usize)> = FENCE_RE
        .find_iter(text)
        .map(|m| (m.start(), m.end()))
        .collect();
    let in_fence = move |pos: usize| fences.iter().any(|(s, e)| pos >= *s && pos < *e);

    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        let end = match c {
            '\n' => Some(i),
            '.' | '!' | '?' => match chars.peek() {
                None => Some(i + 1),
                Some((_, next)) if next.is_whitespace() => Some(i + 1),
                _ => None,
            },
            _ => None,
        };
        if let Some(end) = end {
            if !in_fence(start)
                && let Some(sentence) = text.get(start..end)
            {
                out.push(sentence);
            }
            start = i + c.len_utf8();
        }
    }
    if start < text.len()
        && !in_fence(start)
        && let Some(rest) = text.get(start..)
    {
        out.push(rest);
    }
    out.into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.starts_with("```"))
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn code_changes(round: RoundView<'_>) -> Vec<CodeChangeRef> {
    let mut changes = Vec::new();
    for text in [round.user_message, round.assistant_response] {
        for fence in FENCE_RE.captures_iter(text) {
            let (Some(whole), Some(body)) = (fence.get(0), fence.get(2)) else {
                continue;
            };
            let language = fence
                .get(1)
                .map(|m| m.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            let path = PATH_RE
                .find_iter(text)
                .filter(|m| {
                    m.end() <= whole.start() && whole.start() - m.end() <= PATH_LOOKBACK_BYTES
                })
                .last()
                .map(|m| m.as_str().to_string());
            let change = CodeChangeRef {
                path,
                language,
                lines: body.as_str().lines().count(),
            };
            if !changes.contains(&change) {
                changes.push(change);
            }
        }
    }
    for change in writes(round) {
        if !changes.iter().any(|c| c.path == change.path) {
            changes.push(change);
        }
    }
    changes
}

/// File-writing tool calls.
fn writes(round: RoundView<'_>) -> Vec<CodeChangeRef> {
    round
        .tool_calls
        .iter()
        .filter(|call| {
            let name = call.name.to_lowercase();
            WRITE_TOOL_MARKERS.iter().any(|m| name.contains(m))
        })
        .filter_map(|call| {
            let path = extract_path(&call.arguments)?;
            Some(CodeChangeRef {
                path: Some(path),
                language: None,
                lines: written_lines(&call.arguments),
            })
        })
        .collect()
}

/// File path from JSON tool arguments.
fn extract_path(arguments: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(arguments).ok()?;
    let obj = value.as_object()?;

    for key in &["path", "file_path", "file", "filename"] {
        if let Some(v) = obj.get(*key).and_then(|v| v.as_str())
            && !v.is_empty()
        {
            return Some(v.to_string());
        }
    }
    None
}

fn written_lines(arguments: &str) -> usize {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(arguments) else {
        return 0;
    };
    ["content", "new_string", "new_text"]
        .iter()
        .find_map(|key| value.get(*key).and_then(|v| v.as_str()))
        .map_or(0, |s| s.lines().count())
}

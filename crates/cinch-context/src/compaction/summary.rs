//! Round summaries and the append-only critical information record.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Pointer to code touched in a round. The code itself is not retained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeChangeRef {
    pub path: Option<String>,
    pub language: Option<String>,
    pub lines: usize,
}

impl CodeChangeRef {
    fn describe(&self) -> String {
        let target = self.path.as_deref().unwrap_or("snippet");
        match (&self.language, self.lines) {
            (Some(lang), n) if n > 0 => format!("{target} ({lang}, {n} lines)"),
            (Some(lang), _) => format!("{target} ({lang})"),
            (None, n) if n > 0 => format!("{target} ({n} lines)"),
            (None, _) => target.to_string(),
        }
    }
}

/// Deterministic replacement for a compacted round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundSummary {
    pub brief: String,
    #[serde(default)]
    pub key_decisions: Vec<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub code_changes: Vec<CodeChangeRef>,
    pub original_tokens: usize,
    pub summary_tokens: usize,
}

impl RoundSummary {
    /// Whether the summary costs more tokens than the round it replaced.
    pub fn expands(&self) -> bool {
        self.summary_tokens > self.original_tokens
    }

    /// Prompt text of the summary.
    pub fn render(&self) -> String {
        let mut out = self.brief.clone();
        if !self.key_decisions.is_empty() {
            let _ = write!(out, "\nDecisions: {}", self.key_decisions.join("; "));
        }
        if !self.requirements.is_empty() {
            let _ = write!(out, "\nRequirements: {}", self.requirements.join("; "));
        }
        if !self.code_changes.is_empty() {
            let changes: Vec<String> =
                self.code_changes.iter().map(CodeChangeRef::describe).collect();
            let _ = write!(out, "\nCode: {}", changes.join(", "));
        }
        out
    }
}

/// One extracted statement, tagged with the round it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriticalEntry {
    pub round: usize,
    pub text: String,
}

/// A code change pointer, tagged with the round it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeChangeEntry {
    pub round: usize,
    pub change: CodeChangeRef,
}

/// What an analyzer pulled out of a single round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedInfo {
    pub requirements: Vec<String>,
    pub decisions: Vec<String>,
    pub code_changes: Vec<CodeChangeRef>,
    pub facts: Vec<String>,
}

/// Requirements, decisions, code changes and facts gathered from every
/// round at insertion time. Entries are only ever appended, so compaction
/// and round removal never lose them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CriticalInformation {
    pub requirements: Vec<CriticalEntry>,
    pub decisions: Vec<CriticalEntry>,
    pub code_changes: Vec<CodeChangeEntry>,
    pub facts: Vec<CriticalEntry>,
}

impl CriticalInformation {
    pub(crate) fn append(&mut self, round: usize, info: ExtractedInfo) {
        let tag = |text: String| CriticalEntry { round, text };
        self.requirements.extend(info.requirements.into_iter().map(tag));
        self.decisions.extend(info.decisions.into_iter().map(tag));
        self.facts.extend(info.facts.into_iter().map(tag));
        self.code_changes.extend(
            info.code_changes
                .into_iter()
                .map(|change| CodeChangeEntry { round, change }),
        );
    }

    pub fn len(&self) -> usize {
        self.requirements.len() + self.decisions.len() + self.code_changes.len() + self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Render as a prompt section. Empty when nothing was recorded.
    pub fn to_prompt_section(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        let mut out = String::from("## Critical context\n");
        let mut section = |title: &str, entries: &[CriticalEntry]| {
            if entries.is_empty() {
                return;
            }
            let _ = writeln!(out, "### {title}");
            for entry in entries {
                let _ = writeln!(out, "- {} (round {})", entry.text, entry.round);
            }
        };
        section("Requirements", &self.requirements);
        section("Decisions", &self.decisions);
        section("Facts", &self.facts);
        if !self.code_changes.is_empty() {
            let _ = writeln!(out, "### Code changes");
            for entry in &self.code_changes {
                let _ = writeln!(out, "- {} (round {})", entry.change.describe(), entry.round);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(original: usize, summary_tokens: usize) -> RoundSummary {
        RoundSummary {
            brief: "Fix the parser".into(),
            key_decisions: vec!["Use nom".into()],
            requirements: vec![],
            code_changes: vec![CodeChangeRef {
                path: Some("src/parse.rs".into()),
                language: Some("rust".into()),
                lines: 12,
            }],
            original_tokens: original,
            summary_tokens,
        }
    }

    #[test]
    fn render_lists_sections() {
        let text = summary(100, 20).render();
        assert!(text.starts_with("Fix the parser"));
        assert!(text.contains("Decisions: Use nom"));
        assert!(!text.contains("Requirements"));
        assert!(text.contains("src/parse.rs (rust, 12 lines)"));
    }

    #[test]
    fn expansion_is_detected() {
        assert!(!summary(100, 20).expands());
        assert!(!summary(50, 50).expands());
        assert!(summary(10, 50).expands());
    }

    #[test]
    fn critical_info_appends_with_round_tags() {
        let mut info = CriticalInformation::default();
        info.append(
            2,
            ExtractedInfo {
                requirements: vec!["Must support UTF-8.".into()],
                decisions: vec!["We will use tokio.".into()],
                ..Default::default()
            },
        );
        info.append(
            5,
            ExtractedInfo {
                requirements: vec!["Should log errors.".into()],
                ..Default::default()
            },
        );
        assert_eq!(info.len(), 3);
        assert_eq!(info.requirements[1].round, 5);

        let section = info.to_prompt_section();
        assert!(section.contains("- Must support UTF-8. (round 2)"));
        assert!(section.contains("### Decisions"));
        assert!(!section.contains("### Facts"));
    }

    #[test]
    fn empty_critical_info_renders_nothing() {
        assert_eq!(CriticalInformation::default().to_prompt_section(), "");
    }
}

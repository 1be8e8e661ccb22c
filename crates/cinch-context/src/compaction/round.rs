//! Conversation rounds and their importance flags.

use super::summary::RoundSummary;
use crate::budget::estimate_tokens;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Item id under which round `index` is tracked by a relevance ranking.
pub fn round_item_id(index: usize) -> String {
    format!("round-{index}")
}

/// A tool call made during a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    /// Raw JSON arguments.
    pub arguments: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl ToolCallRecord {
    pub fn new(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: arguments.into(),
            output: None,
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.name)
            + estimate_tokens(&self.arguments)
            + self.output.as_deref().map_or(0, estimate_tokens)
    }
}

/// Importance classification of a round, computed once at insertion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundImportance {
    pub has_requirements: bool,
    pub has_decisions: bool,
    pub has_code: bool,
    /// Explicit marker in the text, or set through
    /// [`CompactionEngine::mark_important`](super::CompactionEngine::mark_important).
    pub is_marked_important: bool,
    /// Heuristic score in `[0, 1]`.
    pub auto_score: f64,
}

impl RoundImportance {
    /// Whether compaction must leave this round alone.
    pub fn is_protected(&self, auto_threshold: f64) -> bool {
        self.is_marked_important || self.auto_score > auto_threshold
    }
}

/// Full text or summary. A round holds exactly one of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RoundContent {
    Full {
        user_message: String,
        assistant_response: String,
        #[serde(default)]
        tool_calls: Vec<ToolCallRecord>,
    },
    Compacted(RoundSummary),
}

/// One user message and the assistant's answer to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRound {
    /// Monotonic, never reused.
    pub index: usize,
    pub timestamp: DateTime<Utc>,
    pub content: RoundContent,
    pub importance: RoundImportance,
}

impl ConversationRound {
    pub fn is_compacted(&self) -> bool {
        matches!(self.content, RoundContent::Compacted(_))
    }

    pub fn summary(&self) -> Option<&RoundSummary> {
        match &self.content {
            RoundContent::Compacted(summary) => Some(summary),
            RoundContent::Full { .. } => None,
        }
    }

    pub fn user_message(&self) -> Option<&str> {
        match &self.content {
            RoundContent::Full { user_message, .. } => Some(user_message),
            RoundContent::Compacted(_) => None,
        }
    }

    pub fn item_id(&self) -> String {
        round_item_id(self.index)
    }

    /// Text that represents the round in the prompt right now.
    pub fn text(&self) -> String {
        match &self.content {
            RoundContent::Full {
                user_message,
                assistant_response,
                ..
            } => format!("{user_message}\n{assistant_response}"),
            RoundContent::Compacted(summary) => summary.render(),
        }
    }

    /// Tokens this round occupies in its current state.
    pub fn estimated_tokens(&self) -> usize {
        match &self.content {
            RoundContent::Full {
                user_message,
                assistant_response,
                tool_calls,
            } => {
                estimate_tokens(user_message)
                    + estimate_tokens(assistant_response)
                    + tool_calls
                        .iter()
                        .map(ToolCallRecord::estimated_tokens)
                        .sum::<usize>()
            }
            RoundContent::Compacted(summary) => summary.summary_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_round(user: &str, assistant: &str) -> ConversationRound {
        ConversationRound {
            index: 7,
            timestamp: Utc::now(),
            content: RoundContent::Full {
                user_message: user.into(),
                assistant_response: assistant.into(),
                tool_calls: vec![ToolCallRecord::new("read_file", r#"{"path":"a.rs"}"#)],
            },
            importance: RoundImportance::default(),
        }
    }

    #[test]
    fn full_round_tokens_include_tool_calls() {
        let round = full_round("abcd", "abcdefgh");
        // 1 + 2 + read_file (3) + args (4)
        assert_eq!(round.estimated_tokens(), 10);
        assert_eq!(round.item_id(), "round-7");
        assert!(!round.is_compacted());
        assert_eq!(round.user_message(), Some("abcd"));
    }

    #[test]
    fn protection_threshold_is_exclusive() {
        let mut importance = RoundImportance {
            auto_score: 0.8,
            ..Default::default()
        };
        assert!(!importance.is_protected(0.8));
        importance.auto_score = 0.81;
        assert!(importance.is_protected(0.8));
        importance.auto_score = 0.0;
        importance.is_marked_important = true;
        assert!(importance.is_protected(0.8));
    }

    #[test]
    fn content_serializes_with_state_tag() {
        let round = full_round("hi", "hello");
        let json = serde_json::to_value(&round).unwrap();
        assert_eq!(json["content"]["state"], "full");
        let back: ConversationRound = serde_json::from_value(json).unwrap();
        assert_eq!(back, round);
    }
}

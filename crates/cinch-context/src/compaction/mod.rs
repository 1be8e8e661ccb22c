//! History compaction: replace old, unimportant rounds with summaries.
//!
//! Rounds move one way, from full text to a compacted summary. A compaction
//! pass leaves three kinds of rounds untouched:
//!
//! - the most recent `max(full_rounds_retention, ceil(0.2 × total))` rounds,
//! - rounds explicitly marked important,
//! - rounds whose heuristic importance exceeds `important_threshold`.
//!
//! Everything else is summarized, least relevant first when a
//! [`RelevanceRanking`] is supplied. Requirements, decisions and code-change
//! pointers are extracted from every round when it is added, so they
//! survive compaction and removal in [`CriticalInformation`].
//!
//! The only destructive step is the retention ceiling: while more than
//! `max_rounds` rounds exist, the oldest compacted, unprotected round is
//! deleted.

pub mod analyzer;
pub mod round;
pub mod summary;

pub use analyzer::{HeuristicAnalyzer, RoundAnalyzer, RoundView};
pub use round::{ConversationRound, RoundContent, RoundImportance, ToolCallRecord, round_item_id};
pub use summary::{CodeChangeRef, CriticalEntry, CriticalInformation, ExtractedInfo, RoundSummary};

use crate::error::CompactionError;
use crate::events::{ContextEvent, EventSink, NoopSink};
use crate::relevance::RelevanceRanking;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Configuration for [`CompactionEngine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CompactionConfig {
    /// Estimated history tokens above which compaction is needed. Default: 80,000.
    pub compaction_threshold: usize,
    /// Most recent rounds always kept in full. Default: 15.
    pub full_rounds_retention: usize,
    /// Fraction of all rounds always kept in full, if larger. Default: 0.2.
    pub min_full_fraction: f64,
    /// Ceiling on stored rounds. Default: 100.
    pub max_rounds: usize,
    /// `auto_score` above which a round is never compacted. Default: 0.8.
    pub important_threshold: f64,
    /// Character limit of a summary's brief. Default: 100.
    pub brief_max_chars: usize,
    /// Lower bound on a summary's token estimate. Default: 50.
    pub min_summary_tokens: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            compaction_threshold: 80_000,
            full_rounds_retention: 15,
            min_full_fraction: 0.2,
            max_rounds: 100,
            important_threshold: 0.8,
            brief_max_chars: 100,
            min_summary_tokens: 50,
        }
    }
}

impl CompactionConfig {
    pub fn with_threshold(mut self, tokens: usize) -> Self {
        self.compaction_threshold = tokens;
        self
    }

    pub fn with_retention(mut self, rounds: usize) -> Self {
        self.full_rounds_retention = rounds;
        self
    }

    pub fn with_max_rounds(mut self, rounds: usize) -> Self {
        self.max_rounds = rounds;
        self
    }

    pub fn with_min_summary_tokens(mut self, tokens: usize) -> Self {
        self.min_summary_tokens = tokens;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.min_full_fraction) {
            return Err(format!(
                "min_full_fraction must be within [0, 1], got {}",
                self.min_full_fraction
            ));
        }
        if self.max_rounds == 0 {
            return Err("max_rounds must be positive".into());
        }
        if self.brief_max_chars == 0 {
            return Err("brief_max_chars must be positive".into());
        }
        Ok(())
    }

    /// Number of most recent rounds protected when `total` rounds exist.
    pub fn protected_recent(&self, total: usize) -> usize {
        let by_fraction = (self.min_full_fraction.max(0.0) * total as f64).ceil() as usize;
        self.full_rounds_retention.max(by_fraction)
    }
}

/// Result of one [`CompactionEngine::perform_compaction`] call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompactionReport {
    /// Indices compacted in this pass, in processing order.
    pub compacted: Vec<usize>,
    /// Indices deleted by the retention ceiling.
    pub removed: Vec<usize>,
    /// Compacted rounds whose summary is larger than the original.
    pub expanded: Vec<usize>,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

impl CompactionReport {
    pub fn tokens_saved(&self) -> isize {
        self.tokens_before as isize - self.tokens_after as isize
    }
}

/// History entry for a completed pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionRecord {
    pub timestamp: DateTime<Utc>,
    pub rounds_compacted: usize,
    pub rounds_removed: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

// ── Engine ─────────────────────────────────────────────────────────

struct EngineState {
    config: CompactionConfig,
    rounds: VecDeque<ConversationRound>,
    next_index: usize,
    critical: CriticalInformation,
    history: Vec<CompactionRecord>,
}

impl EngineState {
    fn total_tokens(&self) -> usize {
        self.rounds.iter().map(ConversationRound::estimated_tokens).sum()
    }

    /// Indices of the protected most-recent window.
    fn recent_window(&self) -> HashSet<usize> {
        let keep = self.config.protected_recent(self.rounds.len());
        self.rounds.iter().rev().take(keep).map(|r| r.index).collect()
    }

    /// Delete oldest compacted, unprotected rounds until within `max_rounds`.
    fn enforce_retention(&mut self) -> Vec<usize> {
        let mut removed = Vec::new();
        while self.rounds.len() > self.config.max_rounds {
            let recent = self.recent_window();
            let threshold = self.config.important_threshold;
            let victim = self.rounds.iter().position(|r| {
                r.is_compacted()
                    && !r.importance.is_protected(threshold)
                    && !recent.contains(&r.index)
            });
            match victim.and_then(|pos| self.rounds.remove(pos)) {
                Some(round) => removed.push(round.index),
                None => {
                    debug!(
                        rounds = self.rounds.len(),
                        max = self.config.max_rounds,
                        "no removable round left under retention ceiling"
                    );
                    break;
                }
            }
        }
        removed
    }
}

/// Clears the running flag when a pass ends, on every path.
pub(crate) struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Candidate {
    index: usize,
    user_message: String,
    assistant_response: String,
    tool_calls: Vec<ToolCallRecord>,
}

impl Candidate {
    fn view(&self) -> RoundView<'_> {
        RoundView {
            user_message: &self.user_message,
            assistant_response: &self.assistant_response,
            tool_calls: &self.tool_calls,
        }
    }
}

/// Ordered store of conversation rounds with summarizing compaction.
///
/// ```
/// use cinch_context::compaction::{CompactionConfig, CompactionEngine};
///
/// let engine = CompactionEngine::new(CompactionConfig::default().with_retention(1));
/// engine.add_round("Hello there", "Hi!", vec![]);
/// engine.add_round("Read the config", "Done.", vec![]);
/// let report = engine.perform_compaction(None).unwrap();
/// assert_eq!(report.compacted, vec![0]);
/// assert!(engine.round(0).unwrap().is_compacted());
/// ```
pub struct CompactionEngine {
    state: Mutex<EngineState>,
    analyzer: Arc<dyn RoundAnalyzer>,
    running: AtomicBool,
    events: Arc<dyn EventSink>,
}

impl CompactionEngine {
    pub fn new(config: CompactionConfig) -> Self {
        Self {
            state: Mutex::new(EngineState {
                config,
                rounds: VecDeque::new(),
                next_index: 0,
                critical: CriticalInformation::default(),
                history: Vec::new(),
            }),
            analyzer: Arc::new(HeuristicAnalyzer),
            running: AtomicBool::new(false),
            events: Arc::new(NoopSink),
        }
    }

    /// Replace the default [`HeuristicAnalyzer`].
    pub fn with_analyzer(mut self, analyzer: Arc<dyn RoundAnalyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    /// Append a round and return its index.
    ///
    /// Importance is classified and critical information extracted here,
    /// before the round can ever be compacted.
    pub fn add_round(
        &self,
        user_message: &str,
        assistant_response: &str,
        tool_calls: Vec<ToolCallRecord>,
    ) -> usize {
        let view = RoundView {
            user_message,
            assistant_response,
            tool_calls: &tool_calls,
        };
        let importance = self.analyzer.importance(view);
        let extracted = self.analyzer.extract(view);

        let mut state = crate::lock(&self.state);
        let index = state.next_index;
        state.next_index += 1;
        state.critical.append(index, extracted);
        debug!(
            index,
            auto_score = importance.auto_score,
            marked = importance.is_marked_important,
            "added round"
        );
        state.rounds.push_back(ConversationRound {
            index,
            timestamp: Utc::now(),
            content: RoundContent::Full {
                user_message: user_message.to_string(),
                assistant_response: assistant_response.to_string(),
                tool_calls,
            },
            importance,
        });
        index
    }

    /// Protect a round from compaction and removal. Returns `false` for an
    /// unknown index.
    pub fn mark_important(&self, index: usize) -> bool {
        let mut state = crate::lock(&self.state);
        match state.rounds.iter_mut().find(|r| r.index == index) {
            Some(round) => {
                round.importance.is_marked_important = true;
                true
            }
            None => {
                warn!(index, "mark_important on unknown round");
                false
            }
        }
    }

    /// Estimated tokens of all stored rounds in their current state.
    pub fn estimate_total_tokens(&self) -> usize {
        crate::lock(&self.state).total_tokens()
    }

    pub fn needs_compaction(&self) -> bool {
        let state = crate::lock(&self.state);
        state.total_tokens() > state.config.compaction_threshold
    }

    pub fn is_compacting(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn try_begin(&self) -> Result<RunGuard<'_>, CompactionError> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| RunGuard(&self.running))
            .map_err(|_| CompactionError::AlreadyRunning)
    }

    /// Summarize every unprotected full round, then apply the retention
    /// ceiling.
    ///
    /// Summaries are computed without holding the round lock, so rounds
    /// added meanwhile are unaffected. A second call while a pass is in
    /// flight fails with [`CompactionError::AlreadyRunning`].
    pub fn perform_compaction(
        &self,
        ranking: Option<&dyn RelevanceRanking>,
    ) -> Result<CompactionReport, CompactionError> {
        let _guard = self.try_begin()?;

        let (config, mut candidates, tokens_before) = {
            let state = crate::lock(&self.state);
            let recent = state.recent_window();
            let threshold = state.config.important_threshold;
            let candidates: Vec<Candidate> = state
                .rounds
                .iter()
                .filter(|r| !recent.contains(&r.index) && !r.importance.is_protected(threshold))
                .filter_map(|r| match &r.content {
                    RoundContent::Full {
                        user_message,
                        assistant_response,
                        tool_calls,
                    } => Some(Candidate {
                        index: r.index,
                        user_message: user_message.clone(),
                        assistant_response: assistant_response.clone(),
                        tool_calls: tool_calls.clone(),
                    }),
                    RoundContent::Compacted(_) => None,
                })
                .collect();
            (state.config.clone(), candidates, state.total_tokens())
        };

        self.events.emit(&ContextEvent::CompactionStarted {
            rounds: candidates.len(),
            estimated_tokens: tokens_before,
        });

        if let Some(ranking) = ranking {
            let mut keyed: Vec<(f64, Candidate)> = candidates
                .into_iter()
                .map(|c| (ranking.relevance(&round_item_id(c.index)).unwrap_or(0.0), c))
                .collect();
            keyed.sort_by(|(sa, a), (sb, b)| {
                sa.partial_cmp(sb)
                    .unwrap_or(CmpOrdering::Equal)
                    .then_with(|| a.index.cmp(&b.index))
            });
            candidates = keyed.into_iter().map(|(_, c)| c).collect();
        }

        let mut summaries = Vec::with_capacity(candidates.len());
        let mut expanded = Vec::new();
        for candidate in &candidates {
            let mut summary = self.analyzer.summarize(candidate.view(), config.brief_max_chars);
            summary.summary_tokens = summary.summary_tokens.max(config.min_summary_tokens);
            if summary.expands() {
                warn!(
                    index = candidate.index,
                    original = summary.original_tokens,
                    summary = summary.summary_tokens,
                    "summary is larger than the round it replaces"
                );
                expanded.push(candidate.index);
            }
            summaries.push((candidate.index, summary));
        }

        let report = {
            let mut state = crate::lock(&self.state);
            let mut compacted = Vec::with_capacity(summaries.len());
            for (index, summary) in summaries {
                if let Some(round) = state.rounds.iter_mut().find(|r| r.index == index)
                    && !round.is_compacted()
                {
                    round.content = RoundContent::Compacted(summary);
                    compacted.push(index);
                }
            }
            expanded.retain(|i| compacted.contains(i));
            let removed = state.enforce_retention();
            let tokens_after = state.total_tokens();
            state.history.push(CompactionRecord {
                timestamp: Utc::now(),
                rounds_compacted: compacted.len(),
                rounds_removed: removed.len(),
                tokens_before,
                tokens_after,
            });
            CompactionReport {
                compacted,
                removed,
                expanded,
                tokens_before,
                tokens_after,
            }
        };

        info!(
            compacted = report.compacted.len(),
            removed = report.removed.len(),
            tokens_before = report.tokens_before,
            tokens_after = report.tokens_after,
            "compaction pass finished"
        );
        self.events.emit(&ContextEvent::CompactionCompleted {
            rounds_compacted: report.compacted.len(),
            rounds_removed: report.removed.len(),
            tokens_before: report.tokens_before,
            tokens_after: report.tokens_after,
        });
        Ok(report)
    }

    pub fn round(&self, index: usize) -> Option<ConversationRound> {
        crate::lock(&self.state)
            .rounds
            .iter()
            .find(|r| r.index == index)
            .cloned()
    }

    /// All stored rounds, oldest first.
    pub fn rounds(&self) -> Vec<ConversationRound> {
        crate::lock(&self.state).rounds.iter().cloned().collect()
    }

    pub fn round_count(&self) -> usize {
        crate::lock(&self.state).rounds.len()
    }

    /// Index the next added round will get.
    pub fn next_index(&self) -> usize {
        crate::lock(&self.state).next_index
    }

    pub fn critical_info(&self) -> CriticalInformation {
        crate::lock(&self.state).critical.clone()
    }

    pub fn compaction_history(&self) -> Vec<CompactionRecord> {
        crate::lock(&self.state).history.clone()
    }

    /// Replace all state with previously saved rounds.
    ///
    /// Rounds are ordered by index and the next index continues after the
    /// highest restored one.
    pub fn restore(
        &self,
        mut rounds: Vec<ConversationRound>,
        critical: CriticalInformation,
        history: Vec<CompactionRecord>,
    ) {
        rounds.sort_by_key(|r| r.index);
        rounds.dedup_by_key(|r| r.index);
        let mut state = crate::lock(&self.state);
        state.next_index = rounds.last().map_or(0, |r| r.index + 1);
        state.rounds = rounds.into();
        state.critical = critical;
        state.history = history;
        debug!(rounds = state.rounds.len(), "restored compaction state");
    }

    pub fn update_config(&self, config: CompactionConfig) {
        crate::lock(&self.state).config = config;
    }

    pub fn config(&self) -> CompactionConfig {
        crate::lock(&self.state).config.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::FnSink;
    use std::collections::HashMap;

    fn engine(config: CompactionConfig) -> CompactionEngine {
        CompactionEngine::new(config)
    }

    fn add_plain(engine: &CompactionEngine, n: usize) {
        for i in 0..n {
            engine.add_round(
                &format!("question number {i} about the widget layout"),
                &format!("answer number {i} with a long explanation of the widget layout and more"),
                vec![],
            );
        }
    }

    #[test]
    fn indices_are_monotonic() {
        let engine = engine(CompactionConfig::default());
        assert_eq!(engine.add_round("a", "b", vec![]), 0);
        assert_eq!(engine.add_round("c", "d", vec![]), 1);
        assert_eq!(engine.next_index(), 2);
    }

    #[test]
    fn recent_window_uses_fraction_when_larger() {
        let config = CompactionConfig::default().with_retention(5);
        assert_eq!(config.protected_recent(20), 5);
        assert_eq!(config.protected_recent(40), 8);
        assert_eq!(config.protected_recent(41), 9);
    }

    #[test]
    fn protects_recent_and_important_rounds() {
        let engine = engine(CompactionConfig::default().with_retention(5));
        for i in 0..20 {
            let user = if i % 4 == 0 {
                format!("IMPORTANT: step {i}")
            } else {
                format!("step {i}")
            };
            engine.add_round(&user, "ok", vec![]);
        }
        let report = engine.perform_compaction(None).unwrap();

        let expected: Vec<usize> = (0..15).filter(|i| i % 4 != 0).collect();
        assert_eq!(report.compacted, expected);
        for i in 0..20 {
            let round = engine.round(i).unwrap();
            let should_be_full = i >= 15 || i % 4 == 0;
            assert_eq!(!round.is_compacted(), should_be_full, "round {i}");
        }
    }

    #[test]
    fn high_auto_score_protects() {
        let engine = engine(CompactionConfig::default().with_retention(0));
        engine.add_round(
            "This is critical and urgent: the service must never drop writes \
             and must ensure ordering.",
            "We will use a write-ahead log instead of buffering. Decided.",
            vec![],
        );
        engine.add_round("thanks", "sure", vec![]);
        let round = engine.round(0).unwrap();
        assert!(round.importance.auto_score > 0.8);
        let report = engine.perform_compaction(None).unwrap();
        assert!(!report.compacted.contains(&0));
    }

    #[test]
    fn compaction_is_idempotent() {
        let engine = engine(CompactionConfig::default().with_retention(2));
        add_plain(&engine, 6);
        let first = engine.perform_compaction(None).unwrap();
        assert_eq!(first.compacted, vec![0, 1, 2, 3]);
        let second = engine.perform_compaction(None).unwrap();
        assert!(second.compacted.is_empty());
        assert_eq!(second.tokens_before, second.tokens_after);
        assert_eq!(engine.compaction_history().len(), 2);
    }

    #[test]
    fn ranking_orders_candidates() {
        let engine = engine(CompactionConfig::default().with_retention(1));
        add_plain(&engine, 4);
        let scores: HashMap<String, f64> = [("round-0", 0.9), ("round-1", 0.2), ("round-2", 0.5)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let ranking = move |id: &str| scores.get(id).copied();
        let report = engine.perform_compaction(Some(&ranking)).unwrap();
        assert_eq!(report.compacted, vec![1, 2, 0]);
    }

    #[test]
    fn retention_ceiling_removes_oldest_compacted() {
        let engine = engine(CompactionConfig::default().with_retention(2).with_max_rounds(4));
        engine.add_round("IMPORTANT: keep", "ok", vec![]);
        add_plain(&engine, 5);
        let report = engine.perform_compaction(None).unwrap();
        assert_eq!(report.compacted, vec![1, 2, 3]);
        assert_eq!(report.removed, vec![1, 2]);
        assert_eq!(engine.round_count(), 4);

        // Full / compacted / absent.
        for i in 0..engine.next_index() {
            match engine.round(i) {
                None => assert!(report.removed.contains(&i)),
                Some(round) if round.is_compacted() => assert_eq!(i, 3),
                Some(_) => assert!(i == 0 || i >= 4),
            }
        }
    }

    #[test]
    fn summary_floor_reports_expansion() {
        let engine = engine(
            CompactionConfig::default()
                .with_retention(1)
                .with_min_summary_tokens(50),
        );
        engine.add_round("Short.", "Ok.", vec![]);
        engine.add_round("next", "next", vec![]);
        let report = engine.perform_compaction(None).unwrap();
        assert_eq!(report.expanded, vec![0]);
        let summary = engine.round(0).unwrap().summary().cloned().unwrap();
        assert_eq!(summary.summary_tokens, 50);
        assert!(summary.expands());
        assert!(report.tokens_after > report.tokens_before);
    }

    #[test]
    fn critical_info_survives_compaction_and_removal() {
        let engine = engine(CompactionConfig::default().with_retention(1).with_max_rounds(1));
        engine.add_round("The API must stay backwards compatible.", "Understood.", vec![]);
        engine.add_round("ok", "ok", vec![]);
        let report = engine.perform_compaction(None).unwrap();
        assert_eq!(report.removed, vec![0]);
        let critical = engine.critical_info();
        assert_eq!(critical.requirements.len(), 1);
        assert_eq!(critical.requirements[0].round, 0);
    }

    #[test]
    fn second_pass_while_running_is_rejected() {
        let engine = engine(CompactionConfig::default());
        let guard = engine.try_begin().unwrap();
        assert!(engine.is_compacting());
        assert_eq!(
            engine.perform_compaction(None).unwrap_err(),
            CompactionError::AlreadyRunning
        );
        drop(guard);
        assert!(!engine.is_compacting());
        assert!(engine.perform_compaction(None).is_ok());
    }

    #[test]
    fn needs_compaction_tracks_threshold() {
        let engine = engine(CompactionConfig::default().with_threshold(20));
        engine.add_round("short", "short", vec![]);
        assert!(!engine.needs_compaction());
        add_plain(&engine, 2);
        assert!(engine.needs_compaction());
    }

    #[test]
    fn emits_start_and_completion() {
        let names = Arc::new(Mutex::new(Vec::new()));
        let sink_names = names.clone();
        let engine = CompactionEngine::new(CompactionConfig::default().with_retention(1))
            .with_event_sink(Arc::new(FnSink::new(move |e: &ContextEvent| {
                sink_names.lock().unwrap().push(e.name())
            })));
        add_plain(&engine, 3);
        engine.perform_compaction(None).unwrap();
        assert_eq!(
            *names.lock().unwrap(),
            vec!["compaction_started", "compaction_completed"]
        );
    }

    #[test]
    fn mark_important_and_restore() {
        let engine = engine(CompactionConfig::default().with_retention(0));
        add_plain(&engine, 3);
        assert!(engine.mark_important(1));
        assert!(!engine.mark_important(42));
        let report = engine.perform_compaction(None).unwrap();
        // Round 2 is the protected most recent one.
        assert_eq!(report.compacted, vec![0]);

        let restored = CompactionEngine::new(CompactionConfig::default());
        restored.restore(
            engine.rounds(),
            engine.critical_info(),
            engine.compaction_history(),
        );
        assert_eq!(restored.rounds(), engine.rounds());
        assert_eq!(restored.next_index(), 3);
        assert_eq!(restored.add_round("again", "ok", vec![]), 3);
    }
}

//! Turn-by-turn orchestration of the four engines.
//!
//! [`ContextManager`] owns a [`TokenBudget`], a [`RelevanceScorer`], a
//! [`CompactionEngine`] and an [`IncrementalLoader`], and keeps them in step:
//!
//! 1. The user message (plus a few previous ones) becomes the scorer's query.
//! 2. The round is appended to the compaction engine and tracked by the scorer.
//! 3. History usage is reported to the budget.
//! 4. If the engine is over its threshold, or the budget is critical, a
//!    compaction pass runs, ranked by the scorer.
//! 5. If the budget is still critical it is rebalanced, and if that is not
//!    enough the least relevant included files are dropped.

use crate::budget::{BudgetWarning, TokenBudget, WarningLevel, components};
use crate::clock::Clock;
use crate::compaction::{
    CompactionEngine, CompactionReport, ConversationRound, RoundAnalyzer, ToolCallRecord,
};
use crate::config::ContextConfig;
use crate::error::{CompactionError, ConfigError, LoadError};
use crate::estimate_tokens;
use crate::events::EventSink;
use crate::loader::{ContentSource, IncrementalLoader, LoadRequest, LoadResult};
use crate::relevance::{ItemType, RelevanceScore, RelevanceScorer};
use crate::session::SessionSnapshot;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Previous user messages folded into the relevance query.
const RECENT_QUERY_MESSAGES: usize = 3;

/// One user/assistant exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub user_message: String,
    pub assistant_response: String,
    pub tool_calls: Vec<ToolCallRecord>,
}

impl Turn {
    pub fn new(user_message: impl Into<String>, assistant_response: impl Into<String>) -> Self {
        Self {
            user_message: user_message.into(),
            assistant_response: assistant_response.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCallRecord>) -> Self {
        self.tool_calls = tool_calls;
        self
    }
}

/// What [`ContextManager::process_turn`] did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnReport {
    pub round_index: usize,
    /// Present when a compaction pass ran.
    pub compaction: Option<CompactionReport>,
    /// Pressure level after the turn was processed.
    pub warning: Option<BudgetWarning>,
    /// Included files dropped to relieve critical pressure, in drop order.
    pub files_dropped: Vec<String>,
    pub usage_fraction: f64,
}

#[derive(Debug, Clone, Copy)]
struct IncludedFile {
    tokens: usize,
}

#[derive(Default)]
struct ManagerState {
    included: BTreeMap<String, IncludedFile>,
    recent_messages: VecDeque<String>,
    metadata: HashMap<String, String>,
}

impl ManagerState {
    fn file_tokens(&self) -> usize {
        self.included.values().map(|f| f.tokens).sum()
    }
}

/// Context window orchestrator.
pub struct ContextManager {
    budget: TokenBudget,
    scorer: RelevanceScorer,
    compaction: CompactionEngine,
    loader: IncrementalLoader,
    state: Mutex<ManagerState>,
}

impl ContextManager {
    pub fn new(config: ContextConfig, source: Arc<dyn ContentSource>) -> Self {
        Self {
            budget: TokenBudget::new(config.budget),
            scorer: RelevanceScorer::new(config.scorer),
            compaction: CompactionEngine::new(config.compaction),
            loader: IncrementalLoader::new(config.loader, source),
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// Time source for relevance decay and cache expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.scorer = self.scorer.with_clock(Arc::clone(&clock));
        self.loader = self.loader.with_clock(clock);
        self
    }

    /// Route events from every engine to `sink`.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.budget = self.budget.with_event_sink(Arc::clone(&sink));
        self.scorer = self.scorer.with_event_sink(Arc::clone(&sink));
        self.compaction = self.compaction.with_event_sink(Arc::clone(&sink));
        self.loader = self.loader.with_event_sink(sink);
        self
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn RoundAnalyzer>) -> Self {
        self.compaction = self.compaction.with_analyzer(analyzer);
        self
    }

    // ── Turns ──────────────────────────────────────────────────────

    /// Record a turn and bring the window back within budget.
    pub fn process_turn(&self, turn: Turn) -> TurnReport {
        let recent: Vec<String> =
            crate::lock(&self.state).recent_messages.iter().cloned().collect();
        self.scorer.update_query_context(&turn.user_message, &recent);

        let index = self
            .compaction
            .add_round(&turn.user_message, &turn.assistant_response, turn.tool_calls);
        if let Some(round) = self.compaction.round(index) {
            self.track_round(&round);
        }
        self.sync_history_usage();

        let mut compaction = None;
        if is_critical(&self.budget.check_budget()) || self.compaction.needs_compaction() {
            compaction = self.compact();
        }

        let mut warning = self.budget.check_budget();
        let mut files_dropped = Vec::new();
        if is_critical(&warning) {
            let rebalance = self.budget.rebalance(&[]);
            debug!(transfers = rebalance.transfers.len(), "rebalanced under critical pressure");
            warning = self.budget.check_budget();
            if is_critical(&warning) {
                files_dropped = self.shed_files();
                warning = self.budget.check_budget();
            }
        }

        {
            let mut state = crate::lock(&self.state);
            state.recent_messages.push_back(turn.user_message);
            while state.recent_messages.len() > RECENT_QUERY_MESSAGES {
                state.recent_messages.pop_front();
            }
        }

        TurnReport {
            round_index: index,
            compaction,
            warning,
            files_dropped,
            usage_fraction: self.budget.usage_fraction(),
        }
    }

    /// Run a compaction pass ranked by the scorer. Returns `None` if another
    /// pass is already running.
    pub fn compact(&self) -> Option<CompactionReport> {
        match self.compaction.perform_compaction(Some(&self.scorer)) {
            Ok(report) => {
                for index in &report.removed {
                    self.scorer.remove_item(&crate::compaction::round_item_id(*index));
                }
                for index in &report.compacted {
                    if let Some(round) = self.compaction.round(*index) {
                        self.refresh_round(&round);
                    }
                }
                self.sync_history_usage();
                Some(report)
            }
            Err(CompactionError::AlreadyRunning) => {
                debug!("compaction already running, skipping");
                None
            }
        }
    }

    fn track_round(&self, round: &ConversationRound) {
        self.scorer.track_item(
            &round.item_id(),
            ItemType::ConversationRound,
            &round.text(),
            round_metadata(round),
        );
    }

    /// Swap in a round's compacted text, keeping its recency.
    fn refresh_round(&self, round: &ConversationRound) {
        let updated = self
            .scorer
            .update_item(&round.item_id(), &round.text(), round_metadata(round));
        if updated.is_none() {
            self.track_round(round);
        }
    }

    fn sync_history_usage(&self) {
        self.budget
            .update_usage(components::HISTORY, self.compaction.estimate_total_tokens());
    }

    fn sync_file_usage(&self) {
        let tokens = crate::lock(&self.state).file_tokens();
        self.budget.update_usage(components::FILES, tokens);
    }

    /// Drop included files, least relevant first, until the budget is no
    /// longer critical.
    fn shed_files(&self) -> Vec<String> {
        let included: Vec<String> = crate::lock(&self.state).included.keys().cloned().collect();
        let mut candidates: Vec<(f64, String)> = included
            .into_iter()
            .map(|uri| {
                let score = self.scorer.score(&uri).map_or(0.0, |s| s.final_score);
                (score, uri)
            })
            .collect();
        candidates.sort_by(|(sa, a), (sb, b)| sa.total_cmp(sb).then_with(|| a.cmp(b)));

        let mut dropped = Vec::new();
        for (score, uri) in candidates {
            if !is_critical(&self.budget.check_budget()) {
                break;
            }
            if self.drop_file(&uri) {
                info!(uri = %uri, score, "dropped file under critical budget pressure");
                dropped.push(uri);
            }
        }
        if dropped.is_empty() {
            warn!("budget critical with no files left to drop");
        }
        dropped
    }

    // ── Files ──────────────────────────────────────────────────────

    /// Load a file into the context window and start tracking it.
    pub async fn include_file(&self, request: LoadRequest) -> Result<LoadResult, LoadError> {
        let result = self.loader.load_file(request).await?;
        let uri = result.file.uri.clone();
        let tokens = result.file.estimated_tokens();
        let metadata = HashMap::from([
            ("strategy".to_string(), result.file.strategy.to_string()),
            ("bytes".to_string(), result.file.content.len().to_string()),
        ]);
        self.scorer
            .track_item(&uri, ItemType::File, &result.file.text(), metadata);
        crate::lock(&self.state)
            .included
            .insert(uri.clone(), IncludedFile { tokens });
        self.sync_file_usage();
        debug!(uri = %uri, tokens, "included file");
        Ok(result)
    }

    /// Remove a file from the window. Returns `false` if it was not included.
    pub fn drop_file(&self, uri: &str) -> bool {
        let removed = crate::lock(&self.state).included.remove(uri).is_some();
        if !removed {
            return false;
        }
        self.scorer.remove_item(uri);
        self.sync_file_usage();
        true
    }

    /// Included file URIs, sorted.
    pub fn included_files(&self) -> Vec<String> {
        crate::lock(&self.state).included.keys().cloned().collect()
    }

    /// Count a use of `id` (a file URI or a round id).
    pub fn record_interaction(&self, id: &str) -> Option<RelevanceScore> {
        self.scorer.record_interaction(id, 1.0)
    }

    pub fn set_system_prompt(&self, prompt: &str) {
        self.budget
            .update_usage(components::SYSTEM_PROMPT, estimate_tokens(prompt));
    }

    /// The critical information section to append to the system prompt.
    pub fn critical_context(&self) -> String {
        self.compaction.critical_info().to_prompt_section()
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn budget(&self) -> &TokenBudget {
        &self.budget
    }

    pub fn scorer(&self) -> &RelevanceScorer {
        &self.scorer
    }

    pub fn compaction(&self) -> &CompactionEngine {
        &self.compaction
    }

    pub fn loader(&self) -> &IncrementalLoader {
        &self.loader
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        crate::lock(&self.state).metadata.insert(key.into(), value.into());
    }

    /// Apply a new configuration to every engine. An invalid config is
    /// rejected as a whole and the current one stays in effect.
    pub fn update_config(&self, config: ContextConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.loader.update_config(config.loader)?;
        self.budget.update_config(config.budget);
        self.scorer.update_config(config.scorer);
        self.compaction.update_config(config.compaction);
        self.sync_history_usage();
        self.sync_file_usage();
        Ok(())
    }

    // ── Sessions ───────────────────────────────────────────────────

    pub fn snapshot(&self) -> SessionSnapshot {
        let metadata = crate::lock(&self.state).metadata.clone();
        SessionSnapshot::new(
            self.compaction.rounds(),
            self.compaction.critical_info(),
            self.compaction.compaction_history(),
            metadata,
        )
    }

    /// Replace the conversation with a saved one. Rounds are re-registered
    /// with the scorer and the budget; included files are kept.
    pub fn restore(&self, snapshot: SessionSnapshot) {
        for round in self.compaction.rounds() {
            self.scorer.remove_item(&round.item_id());
        }
        let count = snapshot.rounds.len();
        self.compaction.restore(
            snapshot.rounds,
            snapshot.critical_info,
            snapshot.compaction_history,
        );
        for round in self.compaction.rounds() {
            self.track_round(&round);
        }
        self.sync_history_usage();
        {
            let mut state = crate::lock(&self.state);
            state.metadata = snapshot.metadata;
            state.recent_messages.clear();
        }
        info!(rounds = count, "restored session");
    }
}

fn is_critical(warning: &Option<BudgetWarning>) -> bool {
    warning.as_ref().is_some_and(|w| w.level == WarningLevel::Critical)
}

fn round_metadata(round: &ConversationRound) -> HashMap<String, String> {
    HashMap::from([
        ("round".to_string(), round.index.to_string()),
        ("compacted".to_string(), round.is_compacted().to_string()),
    ])
}

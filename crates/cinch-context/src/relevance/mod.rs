//! Relevance scoring for files, conversation rounds and tool output.
//!
//! Each tracked item gets a score in `[0, 1]` combining three signals:
//!
//! | Signal | Computation | Default weight |
//! |--------|-------------|----------------|
//! | temporal | `0.5 ^ (elapsed / half_life)` since last access | 0.3 |
//! | semantic | cosine similarity to the current query context | 0.4 |
//! | interaction | `min(interactions / 10, 1)` | 0.3 |
//!
//! The item type contributes a small prior (`base`) that only breaks ties
//! between otherwise equal scores. Other engines consume scores through the
//! [`RelevanceRanking`] trait.

pub mod similarity;

use crate::clock::{Clock, SystemClock};
use crate::events::{ContextEvent, EventSink, NoopSink};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use similarity::{TermVector, cosine_similarity, term_vector};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

// ── Types ──────────────────────────────────────────────────────────

/// Kind of tracked item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    File,
    ConversationRound,
    ToolOutput,
    Symbol,
    Other,
}

impl ItemType {
    /// Tie-breaking prior.
    pub fn base_prior(self) -> f64 {
        match self {
            ItemType::ConversationRound => 0.6,
            ItemType::File => 0.5,
            ItemType::Symbol => 0.4,
            ItemType::ToolOutput => 0.3,
            ItemType::Other => 0.2,
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemType::File => "file",
            ItemType::ConversationRound => "conversation_round",
            ItemType::ToolOutput => "tool_output",
            ItemType::Symbol => "symbol",
            ItemType::Other => "other",
        };
        f.write_str(name)
    }
}

/// Score breakdown of one item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelevanceScore {
    pub base: f64,
    pub temporal: f64,
    pub semantic: f64,
    pub interaction: f64,
    /// Weighted sum of the three signals, clamped to `[0, 1]`.
    pub final_score: f64,
    #[serde(skip)]
    pub last_updated: Instant,
}

/// An item id together with its type and score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredItem {
    pub id: String,
    pub item_type: ItemType,
    pub score: RelevanceScore,
}

/// Read-only access to relevance values, keyed by item id.
pub trait RelevanceRanking {
    /// Final score of `id`, or `None` if it is not tracked.
    fn relevance(&self, id: &str) -> Option<f64>;
}

impl<F> RelevanceRanking for F
where
    F: Fn(&str) -> Option<f64>,
{
    fn relevance(&self, id: &str) -> Option<f64> {
        self(id)
    }
}

/// Configuration for [`RelevanceScorer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ScorerConfig {
    pub temporal_weight: f64,
    pub semantic_weight: f64,
    pub interaction_weight: f64,
    /// Time for the temporal signal to halve. Default: 10 minutes.
    #[serde(with = "crate::config::duration_secs")]
    #[schemars(with = "f64")]
    pub half_life: Duration,
    /// Interaction count that saturates the interaction signal. Default: 10.
    pub interactions_for_max: f64,
    /// Tracked-item count that triggers eviction. Default: 1000.
    pub max_tracked_items: usize,
    /// Items scoring below this may be evicted. Default: 0.1.
    pub min_relevance_threshold: f64,
    /// Largest fraction of items evicted in one pass. Default: 0.1.
    pub eviction_fraction: f64,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            temporal_weight: 0.3,
            semantic_weight: 0.4,
            interaction_weight: 0.3,
            half_life: Duration::from_secs(600),
            interactions_for_max: 10.0,
            max_tracked_items: 1000,
            min_relevance_threshold: 0.1,
            eviction_fraction: 0.1,
        }
    }
}

impl ScorerConfig {
    pub fn with_weights(mut self, temporal: f64, semantic: f64, interaction: f64) -> Self {
        self.temporal_weight = temporal;
        self.semantic_weight = semantic;
        self.interaction_weight = interaction;
        self
    }

    pub fn with_half_life(mut self, half_life: Duration) -> Self {
        self.half_life = half_life;
        self
    }

    pub fn with_max_tracked_items(mut self, max: usize) -> Self {
        self.max_tracked_items = max;
        self
    }

    pub fn with_min_relevance_threshold(mut self, threshold: f64) -> Self {
        self.min_relevance_threshold = threshold;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        let weights = [
            self.temporal_weight,
            self.semantic_weight,
            self.interaction_weight,
        ];
        if weights.iter().any(|w| *w < 0.0 || !w.is_finite()) {
            return Err("scorer weights must be finite and non-negative".into());
        }
        if self.interactions_for_max <= 0.0 {
            return Err("interactions_for_max must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.eviction_fraction) {
            return Err("eviction_fraction must be in [0, 1]".into());
        }
        Ok(())
    }

    /// `0.5 ^ (elapsed / half_life)`.
    pub fn temporal_decay(&self, elapsed: Duration) -> f64 {
        let half_life = self.half_life.as_secs_f64();
        if half_life <= 0.0 {
            return if elapsed.is_zero() { 1.0 } else { 0.0 };
        }
        0.5f64.powf(elapsed.as_secs_f64() / half_life)
    }

    /// `min(count / interactions_for_max, 1)`.
    pub fn interaction_signal(&self, count: f64) -> f64 {
        (count / self.interactions_for_max).clamp(0.0, 1.0)
    }

    fn combine(&self, temporal: f64, semantic: f64, interaction: f64) -> f64 {
        (self.temporal_weight * temporal
            + self.semantic_weight * semantic
            + self.interaction_weight * interaction)
            .clamp(0.0, 1.0)
    }
}

// ── Scorer ─────────────────────────────────────────────────────────

struct TrackedItem {
    item_type: ItemType,
    terms: TermVector,
    metadata: HashMap<String, String>,
    interactions: f64,
    last_access: Instant,
    score: RelevanceScore,
}

struct ScorerState {
    config: ScorerConfig,
    items: HashMap<String, TrackedItem>,
    query: TermVector,
}

impl ScorerState {
    fn rescore(&mut self, id: &str, now: Instant) -> Option<RelevanceScore> {
        let config = &self.config;
        let query = &self.query;
        let item = self.items.get_mut(id)?;
        item.score = compute(config, query, item, now);
        Some(item.score.clone())
    }

    fn rescore_all(&mut self, now: Instant) -> usize {
        let config = &self.config;
        let query = &self.query;
        for item in self.items.values_mut() {
            item.score = compute(config, query, item, now);
        }
        self.items.len()
    }

    fn ranked(&self) -> Vec<ScoredItem> {
        let mut ranked: Vec<ScoredItem> = self
            .items
            .iter()
            .map(|(id, item)| ScoredItem {
                id: id.clone(),
                item_type: item.item_type,
                score: item.score.clone(),
            })
            .collect();
        ranked.sort_by(rank_order);
        ranked
    }

    /// Remove up to `eviction_fraction` of items scoring below the threshold.
    fn evict(&mut self) -> Vec<String> {
        let threshold = self.config.min_relevance_threshold;
        let budget =
            ((self.items.len() as f64 * self.config.eviction_fraction).ceil() as usize).max(1);
        let mut candidates: Vec<(&String, &TrackedItem)> = self
            .items
            .iter()
            .filter(|(_, item)| item.score.final_score < threshold)
            .collect();
        candidates.sort_by(|a, b| {
            a.1.score
                .final_score
                .partial_cmp(&b.1.score.final_score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });
        let victims: Vec<String> = candidates
            .into_iter()
            .take(budget)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &victims {
            self.items.remove(id);
        }
        victims
    }
}

/// Descending final score, then descending prior, then ascending id.
fn rank_order(a: &ScoredItem, b: &ScoredItem) -> Ordering {
    b.score
        .final_score
        .partial_cmp(&a.score.final_score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            b.score
                .base
                .partial_cmp(&a.score.base)
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| a.id.cmp(&b.id))
}

fn compute(
    config: &ScorerConfig,
    query: &TermVector,
    item: &TrackedItem,
    now: Instant,
) -> RelevanceScore {
    let temporal = config.temporal_decay(now.saturating_duration_since(item.last_access));
    let semantic = cosine_similarity(&item.terms, query);
    let interaction = config.interaction_signal(item.interactions);
    RelevanceScore {
        base: item.item_type.base_prior(),
        temporal,
        semantic,
        interaction,
        final_score: config.combine(temporal, semantic, interaction),
        last_updated: now,
    }
}

/// Tracks items and keeps their relevance scores current.
///
/// ```
/// use cinch_context::relevance::{ItemType, RelevanceScorer, ScorerConfig};
/// use std::collections::HashMap;
///
/// let scorer = RelevanceScorer::new(ScorerConfig::default());
/// scorer.track_item("a", ItemType::File, "apple banana", HashMap::new());
/// scorer.track_item("c", ItemType::File, "date", HashMap::new());
/// scorer.update_query_context("banana", &[]);
/// assert_eq!(scorer.most_relevant(1)[0].id, "a");
/// ```
pub struct RelevanceScorer {
    state: Mutex<ScorerState>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl RelevanceScorer {
    pub fn new(config: ScorerConfig) -> Self {
        Self {
            state: Mutex::new(ScorerState {
                config,
                items: HashMap::new(),
                query: TermVector::new(),
            }),
            clock: Arc::new(SystemClock),
            events: Arc::new(NoopSink),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    /// Start tracking `id`, or replace its content if already tracked.
    ///
    /// Re-tracking keeps the interaction count and counts as an access.
    /// When the tracked count has reached `max_tracked_items`, low scorers
    /// are evicted first.
    pub fn track_item(
        &self,
        id: &str,
        item_type: ItemType,
        content: &str,
        metadata: HashMap<String, String>,
    ) -> RelevanceScore {
        let now = self.clock.now();
        let (score, evicted) = {
            let mut state = crate::lock(&self.state);
            let mut evicted = Vec::new();
            let at_limit = state.items.len() >= state.config.max_tracked_items;
            if at_limit && !state.items.contains_key(id) {
                state.rescore_all(now);
                evicted = state.evict();
                if evicted.is_empty() {
                    debug!(
                        tracked = state.items.len(),
                        "tracking limit reached, nothing below threshold"
                    );
                }
            }
            let interactions = state.items.get(id).map_or(0.0, |i| i.interactions);
            let item = TrackedItem {
                item_type,
                terms: term_vector(content),
                metadata,
                interactions,
                last_access: now,
                score: RelevanceScore {
                    base: item_type.base_prior(),
                    temporal: 1.0,
                    semantic: 0.0,
                    interaction: 0.0,
                    final_score: 0.0,
                    last_updated: now,
                },
            };
            state.items.insert(id.to_string(), item);
            let score = state.rescore(id, now);
            (score, evicted)
        };
        trace!(id, %item_type, "tracking item");
        self.events.emit(&ContextEvent::ItemTracked {
            id: id.to_string(),
            item_type,
        });
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted low-relevance items");
            self.events.emit(&ContextEvent::ItemsEvicted { ids: evicted });
        }
        // The item was inserted under the lock above.
        score.unwrap_or_else(|| RelevanceScore {
            base: item_type.base_prior(),
            temporal: 1.0,
            semantic: 0.0,
            interaction: 0.0,
            final_score: 0.0,
            last_updated: now,
        })
    }

    /// Replace the content and metadata of a tracked item without touching
    /// its recency or interaction count. Returns `None` if `id` is untracked.
    pub fn update_item(
        &self,
        id: &str,
        content: &str,
        metadata: HashMap<String, String>,
    ) -> Option<RelevanceScore> {
        let now = self.clock.now();
        let mut state = crate::lock(&self.state);
        let item = state.items.get_mut(id)?;
        item.terms = term_vector(content);
        item.metadata = metadata;
        state.rescore(id, now)
    }

    /// Replace the query context and rescore every item.
    pub fn update_query_context(&self, query: &str, recent_messages: &[String]) {
        let mut text = String::from(query);
        for message in recent_messages {
            text.push('\n');
            text.push_str(message);
        }
        let now = self.clock.now();
        let rescored = {
            let mut state = crate::lock(&self.state);
            state.query = term_vector(&text);
            state.rescore_all(now)
        };
        debug!(items = rescored, "query context updated");
        self.events.emit(&ContextEvent::ContextUpdated {
            items_rescored: rescored,
        });
    }

    /// Count an interaction with `id` (weighted), refreshing its recency.
    pub fn record_interaction(&self, id: &str, weight: f64) -> Option<RelevanceScore> {
        let now = self.clock.now();
        let mut state = crate::lock(&self.state);
        let Some(item) = state.items.get_mut(id) else {
            warn!(id, "interaction recorded for untracked item");
            return None;
        };
        item.interactions += weight.max(0.0);
        item.last_access = now;
        state.rescore(id, now)
    }

    /// Recompute the temporal signal of every item against the clock.
    pub fn update_temporal_decay(&self) -> usize {
        let now = self.clock.now();
        crate::lock(&self.state).rescore_all(now)
    }

    pub fn score(&self, id: &str) -> Option<RelevanceScore> {
        crate::lock(&self.state).items.get(id).map(|i| i.score.clone())
    }

    pub fn metadata(&self, id: &str) -> Option<HashMap<String, String>> {
        crate::lock(&self.state).items.get(id).map(|i| i.metadata.clone())
    }

    /// Every item, highest score first.
    pub fn all_scores(&self) -> Vec<ScoredItem> {
        crate::lock(&self.state).ranked()
    }

    pub fn most_relevant(&self, n: usize) -> Vec<ScoredItem> {
        let mut ranked = self.all_scores();
        ranked.truncate(n);
        ranked
    }

    /// The `n` lowest-scoring items, lowest first.
    pub fn least_relevant(&self, n: usize) -> Vec<ScoredItem> {
        let mut ranked = self.all_scores();
        ranked.reverse();
        ranked.truncate(n);
        ranked
    }

    /// Ids scoring below `threshold`, lowest first.
    pub fn below_threshold(&self, threshold: f64) -> Vec<String> {
        let mut ranked = self.all_scores();
        ranked.reverse();
        ranked
            .into_iter()
            .take_while(|item| item.score.final_score < threshold)
            .map(|item| item.id)
            .collect()
    }

    pub fn remove_item(&self, id: &str) -> bool {
        crate::lock(&self.state).items.remove(id).is_some()
    }

    /// Replace the configuration and rescore everything.
    pub fn update_config(&self, config: ScorerConfig) {
        let now = self.clock.now();
        let mut state = crate::lock(&self.state);
        state.config = config;
        state.rescore_all(now);
    }

    pub fn config(&self) -> ScorerConfig {
        crate::lock(&self.state).config.clone()
    }

    pub fn contains(&self, id: &str) -> bool {
        crate::lock(&self.state).items.contains_key(id)
    }

    pub fn len(&self) -> usize {
        crate::lock(&self.state).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RelevanceRanking for RelevanceScorer {
    fn relevance(&self, id: &str) -> Option<f64> {
        crate::lock(&self.state)
            .items
            .get(id)
            .map(|i| i.score.final_score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::FnSink;

    fn scorer_with_clock(config: ScorerConfig) -> (RelevanceScorer, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (RelevanceScorer::new(config).with_clock(clock.clone()), clock)
    }

    fn track(scorer: &RelevanceScorer, id: &str, content: &str) -> RelevanceScore {
        scorer.track_item(id, ItemType::File, content, HashMap::new())
    }

    #[test]
    fn fresh_item_scores_temporal_weight_only() {
        let (scorer, _) = scorer_with_clock(ScorerConfig::default());
        let score = track(&scorer, "a", "apple");
        assert_eq!(score.temporal, 1.0);
        assert_eq!(score.semantic, 0.0);
        assert_eq!(score.interaction, 0.0);
        assert!((score.final_score - 0.3).abs() < 1e-12);
    }

    #[test]
    fn query_context_ranks_matching_items_first() {
        let (scorer, _) = scorer_with_clock(ScorerConfig::default());
        track(&scorer, "a", "apple banana");
        track(&scorer, "b", "banana cherry");
        track(&scorer, "c", "date");
        scorer.update_query_context("banana", &[]);

        let ranked = scorer.all_scores();
        let ids: Vec<&str> = ranked.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(ranked[1].score.final_score > ranked[2].score.final_score);
        assert_eq!(ranked[2].score.semantic, 0.0);
    }

    #[test]
    fn recent_messages_contribute_to_query() {
        let (scorer, _) = scorer_with_clock(ScorerConfig::default());
        track(&scorer, "cfg", "config loader");
        scorer.update_query_context("", &["please fix the config".to_string()]);
        assert!(scorer.score("cfg").unwrap().semantic > 0.0);
    }

    #[test]
    fn decay_is_half_at_one_half_life() {
        let (scorer, clock) = scorer_with_clock(ScorerConfig::default());
        track(&scorer, "a", "apple");
        clock.advance(Duration::from_secs(600));
        scorer.update_temporal_decay();
        assert_eq!(scorer.score("a").unwrap().temporal, 0.5);
    }

    #[test]
    fn decay_is_monotonic() {
        let (scorer, clock) = scorer_with_clock(ScorerConfig::default());
        track(&scorer, "a", "apple");
        let mut previous = scorer.score("a").unwrap().temporal;
        for _ in 0..10 {
            clock.advance(Duration::from_secs(97));
            scorer.update_temporal_decay();
            let current = scorer.score("a").unwrap().temporal;
            assert!(current <= previous);
            previous = current;
        }
    }

    #[test]
    fn interaction_refreshes_recency_and_saturates() {
        let (scorer, clock) = scorer_with_clock(ScorerConfig::default());
        track(&scorer, "a", "apple");
        clock.advance(Duration::from_secs(1200));
        for _ in 0..15 {
            scorer.record_interaction("a", 1.0);
        }
        let score = scorer.score("a").unwrap();
        assert_eq!(score.interaction, 1.0);
        assert_eq!(score.temporal, 1.0);
        assert!(scorer.record_interaction("missing", 1.0).is_none());
    }

    #[test]
    fn update_item_keeps_recency() {
        let (scorer, clock) = scorer_with_clock(ScorerConfig::default());
        track(&scorer, "a", "apple");
        scorer.record_interaction("a", 1.0);
        clock.advance(Duration::from_secs(600));
        let metadata = HashMap::from([("compacted".to_string(), "true".to_string())]);
        let score = scorer.update_item("a", "banana", metadata).unwrap();
        assert_eq!(score.temporal, 0.5);
        assert!(score.interaction > 0.0);
        assert_eq!(scorer.metadata("a").unwrap()["compacted"], "true");

        scorer.update_query_context("banana", &[]);
        assert!(scorer.score("a").unwrap().semantic > 0.0);
        assert!(scorer.update_item("missing", "x", HashMap::new()).is_none());
    }

    #[test]
    fn scores_stay_bounded() {
        let config = ScorerConfig::default().with_weights(1.0, 1.0, 1.0);
        let (scorer, clock) = scorer_with_clock(config);
        for i in 0..20 {
            track(&scorer, &format!("item-{i}"), "relevance budget loader");
            for _ in 0..i {
                scorer.record_interaction(&format!("item-{i}"), 2.0);
            }
            clock.advance(Duration::from_secs(37));
        }
        scorer.update_query_context("relevance budget loader", &[]);
        for item in scorer.all_scores() {
            let s = &item.score;
            for v in [s.temporal, s.semantic, s.interaction, s.final_score] {
                assert!((0.0..=1.0).contains(&v), "{} out of range: {v}", item.id);
            }
        }
    }

    #[test]
    fn prior_breaks_ties() {
        let (scorer, _) = scorer_with_clock(ScorerConfig::default());
        scorer.track_item("out", ItemType::ToolOutput, "same", HashMap::new());
        scorer.track_item("round", ItemType::ConversationRound, "same", HashMap::new());
        assert_eq!(scorer.most_relevant(1)[0].id, "round");
        assert_eq!(scorer.least_relevant(1)[0].id, "out");
    }

    #[test]
    fn eviction_removes_only_low_scorers() {
        let config = ScorerConfig::default().with_max_tracked_items(10);
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink_log = log.clone();
        let clock = Arc::new(ManualClock::new());
        let scorer = RelevanceScorer::new(config)
            .with_clock(clock.clone())
            .with_event_sink(Arc::new(FnSink::new(move |e: &ContextEvent| {
                if let ContextEvent::ItemsEvicted { ids } = e {
                    sink_log.lock().unwrap().extend(ids.clone());
                }
            })));

        for i in 0..5 {
            track(&scorer, &format!("old-{i}"), "stale");
        }
        // Old items decay far below the threshold.
        clock.advance(Duration::from_secs(6000));
        for i in 0..5 {
            track(&scorer, &format!("new-{i}"), "fresh");
        }
        track(&scorer, "trigger", "fresh");

        let evicted = log.lock().unwrap().clone();
        assert_eq!(evicted, vec!["old-0".to_string()]);
        assert_eq!(scorer.len(), 10);
        assert!(scorer.contains("new-0"));
    }

    #[test]
    fn eviction_never_touches_items_above_threshold() {
        let (scorer, _) = scorer_with_clock(ScorerConfig::default().with_max_tracked_items(3));
        for i in 0..5 {
            track(&scorer, &format!("item-{i}"), "fresh");
        }
        assert_eq!(scorer.len(), 5);
    }

    #[test]
    fn below_threshold_lists_lowest_first() {
        let (scorer, clock) = scorer_with_clock(ScorerConfig::default());
        track(&scorer, "oldest", "x");
        clock.advance(Duration::from_secs(3000));
        track(&scorer, "older", "y");
        clock.advance(Duration::from_secs(1200));
        track(&scorer, "fresh", "z");
        scorer.update_temporal_decay();
        assert_eq!(scorer.below_threshold(0.1), vec!["oldest".to_string(), "older".to_string()]);
    }

    #[test]
    fn remove_and_ranking_trait() {
        let (scorer, _) = scorer_with_clock(ScorerConfig::default());
        track(&scorer, "a", "apple");
        let ranking: &dyn RelevanceRanking = &scorer;
        assert!(ranking.relevance("a").is_some());
        assert!(scorer.remove_item("a"));
        assert!(!scorer.remove_item("a"));
        assert!(ranking.relevance("a").is_none());
        assert!(scorer.is_empty());
    }

    #[test]
    fn update_config_rescores() {
        let (scorer, _) = scorer_with_clock(ScorerConfig::default());
        track(&scorer, "a", "apple");
        scorer.update_config(ScorerConfig::default().with_weights(1.0, 0.0, 0.0));
        assert_eq!(scorer.score("a").unwrap().final_score, 1.0);
    }

    #[test]
    fn metadata_is_kept() {
        let (scorer, _) = scorer_with_clock(ScorerConfig::default());
        let mut meta = HashMap::new();
        meta.insert("language".to_string(), "rust".to_string());
        scorer.track_item("src/lib.rs", ItemType::File, "pub mod x;", meta);
        assert_eq!(scorer.metadata("src/lib.rs").unwrap()["language"], "rust");
    }
}

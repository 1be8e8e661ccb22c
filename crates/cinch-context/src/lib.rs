//! Context window management for LLM-backed coding assistants.
//!
//! `cinch-context` decides, under a hard token ceiling, which conversation
//! history, source files and tool output survive in the prompt, which get
//! summarized, and which get evicted. It is built from four engines and one
//! orchestrator:
//!
//! - [`TokenBudget`](budget::TokenBudget) splits the window into named
//!   components and compresses allocations when usage nears the ceiling.
//! - [`RelevanceScorer`](relevance::RelevanceScorer) ranks tracked items by
//!   recency, lexical similarity to the current query, and interaction count.
//! - [`CompactionEngine`](compaction::CompactionEngine) replaces old,
//!   unimportant conversation rounds with deterministic summaries while
//!   keeping an append-only record of requirements and decisions.
//! - [`IncrementalLoader`](loader::IncrementalLoader) loads files whole,
//!   by range, or in chunks depending on size, behind a TTL cache and a
//!   priority-ordered concurrency gate.
//! - [`ContextManager`](manager::ContextManager) wires them together turn
//!   by turn.
//!
//! # Getting started
//!
//! ```ignore
//! use cinch_context::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), String> {
//!     let manager = ContextManager::new(
//!         ContextConfig::default(),
//!         Arc::new(FsContentSource::new(".")),
//!     )
//!     .with_event_sink(Arc::new(LoggingSink));
//!
//!     manager.set_system_prompt("You are a careful coding assistant.");
//!     manager
//!         .include_file(LoadRequest::new("src/main.rs"))
//!         .await
//!         .map_err(|e| e.to_string())?;
//!
//!     let report = manager.process_turn(Turn::new(
//!         "The parser must reject empty input.",
//!         "Decided to return an error from parse() instead of panicking.",
//!     ));
//!     println!("{:?}", report.warning);
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Budget levels and compression:** [`budget`]. Thresholds and component
//!   shares live in [`BudgetConfig`](budget::BudgetConfig).
//! - **Ranking items:** [`relevance`], and the
//!   [`RelevanceRanking`](relevance::RelevanceRanking) trait for plugging a
//!   different ranking into compaction.
//! - **Summarizing history:** [`compaction`]. Implement
//!   [`RoundAnalyzer`](compaction::RoundAnalyzer) to replace the regex
//!   heuristics.
//! - **Loading content:** [`loader`], with
//!   [`ContentSource`](loader::ContentSource) as the storage seam.
//! - **Observing engines:** [`events`].
//! - **Configuration files:** [`config`].
//! - **Saving and restoring a session:** [`session`].

pub mod budget;
pub mod clock;
pub mod compaction;
pub mod config;
pub mod error;
pub mod events;
pub mod loader;
pub mod manager;
pub mod prelude;
pub mod relevance;
pub mod session;

pub use budget::{CHARS_PER_TOKEN, estimate_tokens};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock `mutex`, recovering the data if a previous holder panicked.
///
/// Every engine's state is left consistent between statements, so a poisoned
/// lock carries no torn data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

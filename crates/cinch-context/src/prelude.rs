//! Convenience re-exports for common cinch-context types.
//!
//! ```ignore
//! use cinch_context::prelude::*;
//! ```

// Budget
pub use crate::budget::{
    BudgetConfig, BudgetSnapshot, BudgetWarning, ComponentConfig, TokenAllocation, TokenBudget,
    WarningLevel, components,
};

// Relevance
pub use crate::relevance::{
    ItemType, RelevanceRanking, RelevanceScore, RelevanceScorer, ScoredItem, ScorerConfig,
};

// Compaction
pub use crate::compaction::{
    CompactionConfig, CompactionEngine, CompactionReport, ConversationRound, CriticalInformation,
    HeuristicAnalyzer, RoundAnalyzer, RoundSummary, ToolCallRecord,
};

// Loading
pub use crate::loader::{
    ByteRange, ContentSource, FsContentSource, InMemorySource, IncrementalLoader, LoadPriority,
    LoadRequest, LoadResult, LoadedFile, LoaderConfig,
};

// Orchestration
pub use crate::config::ContextConfig;
pub use crate::manager::{ContextManager, Turn, TurnReport};
pub use crate::session::SessionSnapshot;

// Ambient
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::error::{CompactionError, ConfigError, LoadError, SessionError};
pub use crate::events::{
    ChannelSink, CompositeSink, ContextEvent, EventSink, FnSink, LoggingSink, NoopSink,
};
pub use crate::estimate_tokens;

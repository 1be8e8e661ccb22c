//! Token budget allocation across the components of the context window.
//!
//! The window is a fixed ceiling (`max_context_tokens − safety_margin`) split
//! into named components: system prompt, history, files, tool output and a
//! reserve. Each component has a soft allocation, a priority, and a floor it
//! can be compressed down to. Callers report consumption with
//! [`TokenBudget::update_usage`] or reserve it with
//! [`TokenBudget::request_budget`]; the budget never rejects a write.
//! Instead it tracks overuse and reacts:
//!
//! - [`check_budget`](TokenBudget::check_budget) reports an info / warning /
//!   critical level and emits a [`ContextEvent::Warning`] when the level
//!   changes.
//! - [`rebalance`](TokenBudget::rebalance) moves slack to the components that
//!   need it and, when usage is still above the compression target, lowers
//!   allocations of compressible components, least important first.
//!
//! When lowering allocations cannot absorb the overflow a
//! [`ContextEvent::CriticalLimit`] is emitted so the orchestrator can shed
//! content instead of silently overflowing the model's window.

use crate::events::{ContextEvent, EventSink, NoopSink};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Characters per token used by every estimate in this crate.
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimate the token count of `text` (rounded up).
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

/// Well-known component names.
pub mod components {
    pub const SYSTEM_PROMPT: &str = "system_prompt";
    pub const HISTORY: &str = "history";
    pub const FILES: &str = "files";
    pub const TOOL_OUTPUT: &str = "tool_output";
    pub const RESERVE: &str = "reserve";
}

// ── Configuration ──────────────────────────────────────────────────

/// Static description of one budget component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ComponentConfig {
    /// Component name, e.g. `"history"`.
    pub name: String,
    /// Fraction of the effective limit allocated to this component.
    pub share: f64,
    /// 0–100. Higher priorities are compressed last.
    pub priority: u8,
    /// Whether [`TokenBudget::rebalance`] may lower this allocation.
    pub compressible: bool,
    /// Floor that compression never goes below.
    #[serde(default)]
    pub min_required: usize,
}

impl ComponentConfig {
    pub fn new(name: impl Into<String>, share: f64, priority: u8, compressible: bool) -> Self {
        Self {
            name: name.into(),
            share,
            priority,
            compressible,
            min_required: 0,
        }
    }

    /// Set the compression floor.
    pub fn with_min_required(mut self, tokens: usize) -> Self {
        self.min_required = tokens;
        self
    }
}

/// Configuration for [`TokenBudget`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct BudgetConfig {
    /// Model context window in tokens. Default: 128,000.
    pub max_context_tokens: usize,
    /// Tokens held back from the window entirely. Default: 2,000.
    pub safety_margin: usize,
    /// Usage fraction for an info-level notice. Default: 0.50.
    pub info_threshold: f64,
    /// Usage fraction for a warning. Default: 0.75.
    pub warning_threshold: f64,
    /// Usage fraction for a critical warning. Default: 0.90.
    pub critical_threshold: f64,
    /// Usage fraction that compression brings usage back to. Default: 0.90.
    pub compression_target: f64,
    /// Components and their shares of the effective limit.
    pub components: Vec<ComponentConfig>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        use components::*;
        Self {
            max_context_tokens: 128_000,
            safety_margin: 2_000,
            info_threshold: 0.50,
            warning_threshold: 0.75,
            critical_threshold: 0.90,
            compression_target: 0.90,
            components: vec![
                ComponentConfig::new(SYSTEM_PROMPT, 0.10, 100, true).with_min_required(2_000),
                ComponentConfig::new(HISTORY, 0.40, 80, true).with_min_required(4_000),
                ComponentConfig::new(FILES, 0.30, 50, true),
                ComponentConfig::new(TOOL_OUTPUT, 0.15, 30, true),
                ComponentConfig::new(RESERVE, 0.05, 90, false),
            ],
        }
    }
}

impl BudgetConfig {
    /// Override the context window size.
    pub fn with_max_context_tokens(mut self, tokens: usize) -> Self {
        self.max_context_tokens = tokens;
        self
    }

    /// Override the safety margin.
    pub fn with_safety_margin(mut self, tokens: usize) -> Self {
        self.safety_margin = tokens;
        self
    }

    /// Replace the component table.
    pub fn with_components(mut self, components: Vec<ComponentConfig>) -> Self {
        self.components = components;
        self
    }

    /// `max_context_tokens − safety_margin`, saturating at zero.
    pub fn effective_limit(&self) -> usize {
        self.max_context_tokens.saturating_sub(self.safety_margin)
    }

    /// Check thresholds are ordered and within `(0, 1]`.
    pub fn validate(&self) -> Result<(), String> {
        let thresholds = [
            self.info_threshold,
            self.warning_threshold,
            self.critical_threshold,
        ];
        if thresholds.iter().any(|t| !(*t > 0.0 && *t <= 1.0)) {
            return Err("budget thresholds must be in (0, 1]".into());
        }
        if !(self.info_threshold <= self.warning_threshold
            && self.warning_threshold <= self.critical_threshold)
        {
            return Err("budget thresholds must satisfy info <= warning <= critical".into());
        }
        if !(self.compression_target > 0.0 && self.compression_target <= 1.0) {
            return Err("compression_target must be in (0, 1]".into());
        }
        let total_share: f64 = self.components.iter().map(|c| c.share).sum();
        if total_share > 1.0 + 1e-9 {
            return Err(format!("component shares sum to {total_share:.2} (> 1.0)"));
        }
        Ok(())
    }
}

// ── Ledger types ───────────────────────────────────────────────────

/// Allocation and consumption of one component.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenAllocation {
    pub component: String,
    /// Soft ceiling.
    pub allocated: usize,
    /// Current consumption. May exceed `allocated`.
    pub used: usize,
    pub priority: u8,
    pub compressible: bool,
    pub min_required: usize,
}

impl TokenAllocation {
    fn from_config(component: &ComponentConfig, limit: usize) -> Self {
        Self {
            component: component.name.clone(),
            allocated: (component.share.max(0.0) * limit as f64).floor() as usize,
            used: 0,
            priority: component.priority,
            compressible: component.compressible,
            min_required: component.min_required,
        }
    }

    /// Tokens still available under this allocation.
    pub fn remaining(&self) -> usize {
        self.allocated.saturating_sub(self.used)
    }

    /// Lowest value compression may set `allocated` to.
    fn floor(&self) -> usize {
        self.min_required.min(self.allocated)
    }

    /// Allocation that can be given away without dropping below usage or floor.
    fn spare(&self) -> usize {
        self.allocated.saturating_sub(self.used.max(self.floor()))
    }
}

/// A change to one component's allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocationChange {
    pub component: String,
    pub from: usize,
    pub to: usize,
}

/// Severity of budget pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningLevel {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for WarningLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WarningLevel::Info => write!(f, "info"),
            WarningLevel::Warning => write!(f, "warning"),
            WarningLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Result of [`TokenBudget::check_budget`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetWarning {
    pub level: WarningLevel,
    pub usage_fraction: f64,
    pub used: usize,
    pub limit: usize,
    /// Advisory text suitable for injecting into the prompt.
    pub message: String,
}

/// Outcome of a compression pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompressionOutcome {
    /// `Σ used − target`, the amount that had to be absorbed.
    pub overflow: usize,
    /// How much of the overflow lowered allocations absorbed.
    pub reclaimed: usize,
    pub changes: Vec<AllocationChange>,
    /// Whether a [`ContextEvent::CriticalLimit`] was emitted.
    pub critical: bool,
}

impl CompressionOutcome {
    pub fn is_satisfied(&self) -> bool {
        !self.critical && self.reclaimed >= self.overflow
    }
}

/// Outcome of [`TokenBudget::rebalance`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RebalanceReport {
    /// Slack moved between components.
    pub transfers: Vec<AllocationChange>,
    /// Present when usage was above the compression target afterwards.
    pub compression: Option<CompressionOutcome>,
}

/// Point-in-time view of the whole ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetSnapshot {
    pub effective_limit: usize,
    pub total_allocated: usize,
    pub total_used: usize,
    pub usage_fraction: f64,
    pub allocations: Vec<TokenAllocation>,
}

impl BudgetSnapshot {
    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        format!(
            "budget: ~{} tokens ({:.0}% of {})",
            self.total_used,
            self.usage_fraction * 100.0,
            self.effective_limit,
        )
    }
}

// ── TokenBudget ────────────────────────────────────────────────────

struct BudgetState {
    config: BudgetConfig,
    allocations: BTreeMap<String, TokenAllocation>,
    last_level: Option<WarningLevel>,
}

impl BudgetState {
    fn new(config: BudgetConfig) -> Self {
        let limit = config.effective_limit();
        let allocations = config
            .components
            .iter()
            .map(|c| (c.name.clone(), TokenAllocation::from_config(c, limit)))
            .collect();
        Self {
            config,
            allocations,
            last_level: None,
        }
    }

    fn limit(&self) -> usize {
        self.config.effective_limit()
    }

    fn total_used(&self) -> usize {
        self.allocations.values().map(|a| a.used).sum()
    }

    fn total_allocated(&self) -> usize {
        self.allocations.values().map(|a| a.allocated).sum()
    }

    fn usage_fraction(&self) -> f64 {
        let limit = self.limit();
        if limit > 0 {
            self.total_used() as f64 / limit as f64
        } else {
            1.0
        }
    }

    fn compression_target(&self) -> usize {
        (self.config.compression_target * self.limit() as f64).floor() as usize
    }

    /// Greedy, priority-ordered shrink of compressible allocations.
    fn compress(&mut self, events: &mut Vec<ContextEvent>) -> Option<CompressionOutcome> {
        let used = self.total_used();
        let target = self.compression_target();
        if used <= target {
            return None;
        }
        let limit = self.limit();
        let overflow = used - target;
        let mut remaining = overflow;

        let mut order: Vec<(u8, String)> = self
            .allocations
            .values()
            .filter(|a| a.compressible)
            .map(|a| (a.priority, a.component.clone()))
            .collect();
        order.sort();

        let mut changes = Vec::new();
        for (_, name) in order {
            if remaining == 0 {
                break;
            }
            let Some(alloc) = self.allocations.get_mut(&name) else {
                continue;
            };
            let reducible = alloc.allocated - alloc.floor();
            let take = reducible.min(remaining);
            if take == 0 {
                continue;
            }
            let from = alloc.allocated;
            alloc.allocated -= take;
            remaining -= take;
            changes.push(AllocationChange {
                component: name,
                from,
                to: alloc.allocated,
            });
        }

        let reclaimed = overflow - remaining;
        let over_limit = used.saturating_sub(limit);
        let critical = remaining > 0 || over_limit > 0;

        if !changes.is_empty() {
            info!(overflow, reclaimed, "compressed token budget");
            events.push(ContextEvent::BudgetCompressed {
                overflow,
                reclaimed,
                changes: changes.clone(),
            });
        }
        if critical {
            warn!(
                used,
                limit,
                unabsorbed = remaining.max(over_limit),
                "token budget still critical after compression"
            );
            events.push(ContextEvent::CriticalLimit {
                used,
                limit,
                unabsorbed: remaining.max(over_limit),
            });
        }

        Some(CompressionOutcome {
            overflow,
            reclaimed,
            changes,
            critical,
        })
    }
}

/// Token ledger split across named components.
///
/// Thread-safe: every operation locks the ledger for its own bookkeeping and
/// emits events after the lock is released.
///
/// # Example
///
/// ```
/// use cinch_context::budget::{components, BudgetConfig, TokenBudget};
///
/// let budget = TokenBudget::new(BudgetConfig::default().with_max_context_tokens(10_000));
/// let granted = budget.request_budget(components::FILES, 500);
/// assert_eq!(granted, 500);
/// assert_eq!(budget.allocation(components::FILES).unwrap().used, 500);
/// ```
pub struct TokenBudget {
    state: Mutex<BudgetState>,
    events: Arc<dyn EventSink>,
}

impl TokenBudget {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            state: Mutex::new(BudgetState::new(config)),
            events: Arc::new(NoopSink),
        }
    }

    /// Route events to `sink`.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    fn emit_all(&self, events: Vec<ContextEvent>) {
        for event in &events {
            self.events.emit(event);
        }
    }

    /// `max_context_tokens − safety_margin`.
    pub fn effective_limit(&self) -> usize {
        crate::lock(&self.state).limit()
    }

    /// Reserve up to `amount` tokens for `component`.
    ///
    /// Returns the granted amount, which never exceeds the component's
    /// remaining allocation or the window's remaining capacity. The grant is
    /// added to the component's usage. Unknown components get zero.
    pub fn request_budget(&self, component: &str, amount: usize) -> usize {
        let mut state = crate::lock(&self.state);
        let available = state.limit().saturating_sub(state.total_used());
        let Some(alloc) = state.allocations.get_mut(component) else {
            warn!(component, "budget requested for unknown component");
            return 0;
        };
        let granted = amount.min(alloc.remaining()).min(available);
        alloc.used += granted;
        debug!(component, requested = amount, granted, "budget request");
        granted
    }

    /// Return up to `amount` tokens from `component`. Returns the amount released.
    pub fn release(&self, component: &str, amount: usize) -> usize {
        let mut state = crate::lock(&self.state);
        let Some(alloc) = state.allocations.get_mut(component) else {
            warn!(component, "budget released for unknown component");
            return 0;
        };
        let released = amount.min(alloc.used);
        alloc.used -= released;
        released
    }

    /// Set the current consumption of `component`.
    pub fn update_usage(&self, component: &str, used: usize) {
        let mut state = crate::lock(&self.state);
        match state.allocations.get_mut(component) {
            Some(alloc) => alloc.used = used,
            None => warn!(component, "usage reported for unknown component"),
        }
    }

    /// A copy of one component's allocation.
    pub fn allocation(&self, component: &str) -> Option<TokenAllocation> {
        crate::lock(&self.state).allocations.get(component).cloned()
    }

    /// Copies of all allocations, ordered by component name.
    pub fn allocations(&self) -> Vec<TokenAllocation> {
        crate::lock(&self.state).allocations.values().cloned().collect()
    }

    pub fn total_used(&self) -> usize {
        crate::lock(&self.state).total_used()
    }

    /// `Σ used / effective_limit`.
    pub fn usage_fraction(&self) -> f64 {
        crate::lock(&self.state).usage_fraction()
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let state = crate::lock(&self.state);
        BudgetSnapshot {
            effective_limit: state.limit(),
            total_allocated: state.total_allocated(),
            total_used: state.total_used(),
            usage_fraction: state.usage_fraction(),
            allocations: state.allocations.values().cloned().collect(),
        }
    }

    /// Report the current pressure level, if any.
    ///
    /// A [`ContextEvent::Warning`] is emitted only when the level differs
    /// from the previous check.
    pub fn check_budget(&self) -> Option<BudgetWarning> {
        let mut events = Vec::new();
        let warning = {
            let mut state = crate::lock(&self.state);
            let fraction = state.usage_fraction();
            let config = &state.config;
            let level = if fraction >= config.critical_threshold {
                Some(WarningLevel::Critical)
            } else if fraction >= config.warning_threshold {
                Some(WarningLevel::Warning)
            } else if fraction >= config.info_threshold {
                Some(WarningLevel::Info)
            } else {
                None
            };
            let used = state.total_used();
            let limit = state.limit();
            if level != state.last_level {
                state.last_level = level;
                if let Some(level) = level {
                    events.push(ContextEvent::Warning {
                        level,
                        usage_fraction: fraction,
                        used,
                        limit,
                    });
                }
            }
            level.map(|level| BudgetWarning {
                level,
                usage_fraction: fraction,
                used,
                limit,
                message: advisory(level, fraction, used, limit),
            })
        };
        self.emit_all(events);
        warning
    }

    /// Move slack toward `focus` (or, with an empty focus, toward components
    /// using more than their allocation), then compress if usage is still
    /// above the compression target.
    ///
    /// Slack is the unallocated headroom of the window plus the spare
    /// allocation of compressible components outside the focus, taken from
    /// the least important donor first.
    pub fn rebalance(&self, focus: &[&str]) -> RebalanceReport {
        let mut events = Vec::new();
        let report = {
            let mut state = crate::lock(&self.state);
            let transfers = redistribute(&mut state, focus);
            let compression = state.compress(&mut events);
            RebalanceReport {
                transfers,
                compression,
            }
        };
        self.emit_all(events);
        report
    }

    /// Run only the compression step of [`rebalance`](Self::rebalance).
    pub fn compress_budget(&self) -> Option<CompressionOutcome> {
        let mut events = Vec::new();
        let outcome = crate::lock(&self.state).compress(&mut events);
        self.emit_all(events);
        outcome
    }

    /// Replace the configuration. Allocations are re-derived from the new
    /// shares; usage of components that still exist is kept.
    pub fn update_config(&self, config: BudgetConfig) {
        let mut state = crate::lock(&self.state);
        let mut next = BudgetState::new(config);
        for (name, alloc) in &state.allocations {
            match next.allocations.get_mut(name) {
                Some(new_alloc) => new_alloc.used = alloc.used,
                None if alloc.used > 0 => {
                    warn!(
                        component = %name,
                        used = alloc.used,
                        "component removed by config update"
                    )
                }
                None => {}
            }
        }
        *state = next;
    }

    pub fn config(&self) -> BudgetConfig {
        crate::lock(&self.state).config.clone()
    }
}

/// Move slack from donors to recipients. Returns every allocation change.
fn redistribute(state: &mut BudgetState, focus: &[&str]) -> Vec<AllocationChange> {
    let focus: Vec<&str> = focus
        .iter()
        .copied()
        .filter(|name| {
            let known = state.allocations.contains_key(*name);
            if !known {
                warn!(component = *name, "rebalance focus names unknown component");
            }
            known
        })
        .collect();

    let is_recipient = |a: &TokenAllocation| {
        if focus.is_empty() {
            a.used > a.allocated
        } else {
            focus.contains(&a.component.as_str())
        }
    };

    let headroom = state.limit().saturating_sub(state.total_allocated());
    let mut donors: Vec<(u8, String, usize)> = state
        .allocations
        .values()
        .filter(|a| a.compressible && !is_recipient(a))
        .map(|a| (a.priority, a.component.clone(), a.spare()))
        .filter(|(_, _, spare)| *spare > 0)
        .collect();
    donors.sort();

    // Needs, in the order slack is handed out.
    let needs: Vec<(String, usize)> = if focus.is_empty() {
        let mut over: Vec<&TokenAllocation> =
            state.allocations.values().filter(|a| is_recipient(a)).collect();
        over.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.component.cmp(&b.component))
        });
        over.iter()
            .map(|a| (a.component.clone(), a.used - a.allocated))
            .collect()
    } else {
        let pool = headroom + donors.iter().map(|(_, _, s)| s).sum::<usize>();
        let n = focus.len();
        focus
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let extra = usize::from(i < pool % n);
                (name.to_string(), pool / n + extra)
            })
            .collect()
    };

    let total_need: usize = needs.iter().map(|(_, n)| n).sum();
    if total_need == 0 {
        return Vec::new();
    }

    let mut changes = Vec::new();
    let mut collected = headroom.min(total_need);
    for (_, name, spare) in donors {
        if collected >= total_need {
            break;
        }
        let take = spare.min(total_need - collected);
        if let Some(alloc) = state.allocations.get_mut(&name) {
            let from = alloc.allocated;
            alloc.allocated -= take;
            collected += take;
            changes.push(AllocationChange {
                component: name,
                from,
                to: alloc.allocated,
            });
        }
    }

    for (name, need) in needs {
        if collected == 0 {
            break;
        }
        let give = need.min(collected);
        if give == 0 {
            continue;
        }
        if let Some(alloc) = state.allocations.get_mut(&name) {
            let from = alloc.allocated;
            alloc.allocated += give;
            collected -= give;
            changes.push(AllocationChange {
                component: name,
                from,
                to: alloc.allocated,
            });
        }
    }

    if !changes.is_empty() {
        debug!(transfers = changes.len(), "rebalanced token budget");
    }
    changes
}

fn advisory(level: WarningLevel, fraction: f64, used: usize, limit: usize) -> String {
    match level {
        WarningLevel::Info => format!(
            "[Context notice: ~{:.0}% of context budget used ({used} est. tokens / {limit} max).]",
            fraction * 100.0
        ),
        WarningLevel::Warning => format!(
            "[Context notice: ~{:.0}% of context budget used. \
             Prefer summaries over loading additional files.]",
            fraction * 100.0
        ),
        WarningLevel::Critical => format!(
            "[Context notice: ~{:.0}% of context budget used ({used} est. tokens / {limit} max). \
             Older history will be compacted and low-relevance files dropped.]",
            fraction * 100.0
        ),
    }
}

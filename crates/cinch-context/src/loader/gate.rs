//! Priority-ordered admission gate for concurrent loads.
//!
//! At most `max_concurrent` slots are held at once. Extra requests wait in a
//! priority queue and are admitted highest priority first, FIFO within a
//! priority. Requests are never rejected, only delayed. A slot is released
//! when its [`SlotGuard`] drops, on every exit path.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{trace, warn};

/// Scheduling priority of a load. Declared lowest to highest.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum LoadPriority {
    Background,
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl fmt::Display for LoadPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadPriority::Background => "background",
            LoadPriority::Low => "low",
            LoadPriority::Normal => "normal",
            LoadPriority::High => "high",
            LoadPriority::Critical => "critical",
        };
        f.write_str(name)
    }
}

struct Waiter {
    priority: LoadPriority,
    seq: u64,
    tx: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    // Max-heap: higher priority first, then lower sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct GateState {
    active: usize,
    max_concurrent: usize,
    queue: BinaryHeap<Waiter>,
    next_seq: u64,
}

impl GateState {
    /// Hand free slots to waiters while capacity allows.
    fn admit(&mut self) {
        while self.active < self.max_concurrent {
            match self.queue.pop() {
                Some(waiter) => {
                    if waiter.tx.send(()).is_ok() {
                        self.active += 1;
                    }
                }
                None => break,
            }
        }
    }
}

/// Concurrency limiter with priority admission.
pub struct LoadGate {
    state: Mutex<GateState>,
}

impl LoadGate {
    pub fn new(max_concurrent: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GateState {
                active: 0,
                max_concurrent: max_concurrent.max(1),
                queue: BinaryHeap::new(),
                next_seq: 0,
            }),
        })
    }

    /// Wait for a slot.
    pub async fn acquire(self: &Arc<Self>, priority: LoadPriority) -> SlotGuard {
        let rx = {
            let mut state = crate::lock(&self.state);
            if state.active < state.max_concurrent && state.queue.is_empty() {
                state.active += 1;
                return SlotGuard {
                    gate: Arc::clone(self),
                };
            }
            let (tx, rx) = oneshot::channel();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.queue.push(Waiter { priority, seq, tx });
            trace!(%priority, queued = state.queue.len(), "load queued");
            rx
        };

        let mut pending = PendingSlot {
            gate: Arc::clone(self),
            rx,
            granted: false,
        };
        if (&mut pending.rx).await.is_err() {
            // The sender is only dropped after a successful hand-over or
            // when the gate itself goes away, which the Arc above prevents.
            warn!("load gate waiter lost its sender, taking a slot directly");
            crate::lock(&self.state).active += 1;
        }
        pending.granted = true;
        SlotGuard {
            gate: Arc::clone(self),
        }
    }

    fn release(&self) {
        let mut state = crate::lock(&self.state);
        state.active = state.active.saturating_sub(1);
        state.admit();
    }

    /// Slots currently held.
    pub fn active(&self) -> usize {
        crate::lock(&self.state).active
    }

    /// Requests waiting for a slot.
    pub fn queued(&self) -> usize {
        crate::lock(&self.state)
            .queue
            .iter()
            .filter(|w| !w.tx.is_closed())
            .count()
    }

    pub fn max_concurrent(&self) -> usize {
        crate::lock(&self.state).max_concurrent
    }

    /// Change the ceiling. Raising it admits waiters immediately.
    pub fn set_max_concurrent(&self, max_concurrent: usize) {
        let mut state = crate::lock(&self.state);
        state.max_concurrent = max_concurrent.max(1);
        state.admit();
    }
}

/// A held slot. Dropping it admits the next waiter.
pub struct SlotGuard {
    gate: Arc<LoadGate>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.gate.release();
    }
}

/// A queued request. If it is dropped after a slot was handed to it but
/// before it noticed, the slot is given back.
struct PendingSlot {
    gate: Arc<LoadGate>,
    rx: oneshot::Receiver<()>,
    granted: bool,
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            self.gate.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn wait_for_queue(gate: &LoadGate, n: usize) {
        while gate.queued() < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn admits_up_to_ceiling_immediately() {
        let gate = LoadGate::new(2);
        let a = gate.acquire(LoadPriority::Normal).await;
        let b = gate.acquire(LoadPriority::Normal).await;
        assert_eq!(gate.active(), 2);
        drop(a);
        drop(b);
        assert_eq!(gate.active(), 0);
    }

    #[tokio::test]
    async fn waiters_are_admitted_by_priority_then_fifo() {
        let gate = LoadGate::new(1);
        let held = gate.acquire(LoadPriority::Normal).await;
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for (name, priority) in [
            ("low", LoadPriority::Low),
            ("high-1", LoadPriority::High),
            ("background", LoadPriority::Background),
            ("high-2", LoadPriority::High),
            ("critical", LoadPriority::Critical),
        ] {
            let task_gate = Arc::clone(&gate);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _slot = task_gate.acquire(priority).await;
                order.lock().unwrap().push(name);
            }));
            // Enqueue in a known order.
            wait_for_queue(&gate, handles.len()).await;
        }

        assert_eq!(gate.active(), 1);
        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(
            *order.lock().unwrap(),
            vec!["critical", "high-1", "high-2", "low", "background"]
        );
        assert_eq!(gate.active(), 0);
        assert_eq!(gate.queued(), 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_leak_slot() {
        let gate = LoadGate::new(1);
        let held = gate.acquire(LoadPriority::Normal).await;

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                let _slot = gate.acquire(LoadPriority::High).await;
            })
        };
        wait_for_queue(&gate, 1).await;
        waiter.abort();
        let _ = waiter.await;

        drop(held);
        assert_eq!(gate.active(), 0);
        let _again = gate.acquire(LoadPriority::Low).await;
        assert_eq!(gate.active(), 1);
    }

    #[tokio::test]
    async fn raising_ceiling_admits_waiters() {
        let gate = LoadGate::new(1);
        let _held = gate.acquire(LoadPriority::Normal).await;
        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                let _slot = gate.acquire(LoadPriority::Normal).await;
            })
        };
        wait_for_queue(&gate, 1).await;
        gate.set_max_concurrent(2);
        waiter.await.unwrap();
        assert_eq!(gate.max_concurrent(), 2);
    }

    #[test]
    fn priority_order() {
        assert!(LoadPriority::Critical > LoadPriority::High);
        assert!(LoadPriority::High > LoadPriority::Normal);
        assert!(LoadPriority::Low > LoadPriority::Background);
        assert_eq!(LoadPriority::default(), LoadPriority::Normal);
    }
}

//! Event timers for the consensus event loops.
//!
//! Timers are keyed by `(kind, block_num)`. Each armed timer is a tokio task
//! that sleeps and then pushes a [`TimerFired`] into the owning engine's
//! inbound channel, so timeouts are processed in order with every other
//! message. A timer event may still be queued after its timer was cancelled;
//! engines re-check the event against their current round.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired<K> {
    pub kind: K,
    pub block_num: u32,
}

pub struct EventTimer<K, E>
where
    K: Copy + Eq + Hash + Debug + Send + 'static,
    E: From<TimerFired<K>> + Send + 'static,
{
    timers: HashMap<(K, u32), JoinHandle<()>>,
    event_tx: mpsc::Sender<E>,
}

impl<K, E> EventTimer<K, E>
where
    K: Copy + Eq + Hash + Debug + Send + 'static,
    E: From<TimerFired<K>> + Send + 'static,
{
    pub fn new(event_tx: mpsc::Sender<E>) -> Self {
        Self {
            timers: HashMap::new(),
            event_tx,
        }
    }

    /// Arm a timer. A no-op while a timer with the same key is pending.
    /// Returns whether a new timer was armed.
    pub fn start(&mut self, kind: K, block_num: u32, after: Duration) -> bool {
        if let Some(handle) = self.timers.get(&(kind, block_num)) {
            if !handle.is_finished() {
                return false;
            }
        }
        let event_tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = event_tx.send(E::from(TimerFired { kind, block_num })).await;
        });
        self.timers.insert((kind, block_num), handle);
        log::trace!("timer {:?}@{} armed for {:?}", kind, block_num, after);
        true
    }

    /// Cancel any pending timer with this key and arm a fresh one.
    pub fn restart(&mut self, kind: K, block_num: u32, after: Duration) {
        self.cancel(kind, block_num);
        self.start(kind, block_num, after);
    }

    pub fn cancel(&mut self, kind: K, block_num: u32) {
        if let Some(handle) = self.timers.remove(&(kind, block_num)) {
            handle.abort();
        }
    }

    /// Cancel every timer armed for a block below `block_num`.
    pub fn cancel_below(&mut self, block_num: u32) {
        self.timers.retain(|(_, num), handle| {
            if *num < block_num {
                handle.abort();
                false
            } else {
                true
            }
        });
    }

    pub fn cancel_all(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }

    pub fn active_count(&self) -> usize {
        self.timers.values().filter(|h| !h.is_finished()).count()
    }
}

impl<K, E> Drop for EventTimer<K, E>
where
    K: Copy + Eq + Hash + Debug + Send + 'static,
    E: From<TimerFired<K>> + Send + 'static,
{
    fn drop(&mut self) {
        self.cancel_all();
    }
}

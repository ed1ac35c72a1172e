//! In-process queue bus used by tests and the CLI's embedded mode.

use crate::bus::QueueBus;
use crate::error::CoreError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

#[derive(Default)]
struct BusState {
    queues: HashMap<String, VecDeque<String>>,
    counters: HashMap<String, i64>,
}

/// Tokio-native FIFO queues. Pops park on a shared [`Notify`] so a push on
/// any queue wakes the waiters, which re-check their own queue.
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
    notify: Arc<Notify>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages currently sitting in a queue. Test helper.
    pub async fn queue_len(&self, queue: &str) -> usize {
        let state = self.state.lock().await;
        state.queues.get(queue).map(|q| q.len()).unwrap_or(0)
    }

    /// Current value of a counter, if present. Test helper.
    pub async fn counter(&self, key: &str) -> Option<i64> {
        let state = self.state.lock().await;
        state.counters.get(key).copied()
    }
}

#[async_trait]
impl QueueBus for MemoryBus {
    async fn declare(&self, queue: &str) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn push(&self, queue: &str, payload: &str) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(payload.to_string());
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>, CoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register for wakeups before checking, so a push landing
            // between the check and the await still wakes us.
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if let Some(q) = state.queues.get_mut(queue) {
                    if let Some(payload) = q.pop_front() {
                        return Ok(Some(payload));
                    }
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(remaining) => return Ok(None),
            }
        }
    }

    async fn incr_counter(&self, key: &str, delta: i64) -> Result<i64, CoreError> {
        let mut state = self.state.lock().await;
        let value = state.counters.entry(key.to_string()).or_insert(0);
        *value += delta;
        Ok(*value)
    }

    async fn decr_counter(&self, key: &str) -> Result<i64, CoreError> {
        let mut state = self.state.lock().await;
        let value = state.counters.entry(key.to_string()).or_insert(0);
        *value -= 1;
        Ok(*value)
    }

    async fn clear_counter(&self, key: &str) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        state.counters.remove(key);
        Ok(())
    }
}

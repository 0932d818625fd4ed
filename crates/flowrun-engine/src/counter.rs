//! Atomic counter store port backing the budget controller.
//!
//! Any store offering compare-and-swap or transactions can implement this;
//! the contract is that `check_and_increment` performs read-compare-commit
//! as one indivisible operation, so concurrent consumers can never jointly
//! exceed a limit.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

/// Outcome of an atomic check-and-increment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CounterResult {
    /// Counter value after the operation (unchanged when rejected).
    pub value: f64,

    /// Whether the increment was committed.
    pub accepted: bool,
}

/// Atomic counter storage.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add `amount` to the counter at `key` unless the result
    /// would exceed `limit`. With no limit the increment always commits.
    async fn check_and_increment(
        &self,
        key: &str,
        amount: f64,
        limit: Option<f64>,
    ) -> CounterResult;

    /// Current counter value, 0.0 when absent.
    async fn get(&self, key: &str) -> f64;

    /// Reset one counter to zero.
    async fn reset(&self, key: &str);

    /// Remove every counter whose key starts with `prefix`.
    async fn remove_prefix(&self, prefix: &str);
}

/// In-memory counter store.
///
/// A single mutex around the map makes read-compare-commit indivisible,
/// which is all the atomicity contract asks for.
#[derive(Default)]
pub struct InMemoryCounterStore {
    counters: Mutex<HashMap<String, f64>>,
}

impl InMemoryCounterStore {
    /// Create an empty store wrapped in Arc.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn check_and_increment(
        &self,
        key: &str,
        amount: f64,
        limit: Option<f64>,
    ) -> CounterResult {
        let mut counters = self.counters.lock().await;
        let current = counters.get(key).copied().unwrap_or(0.0);
        let next = current + amount;
        if let Some(limit) = limit {
            if next > limit {
                return CounterResult {
                    value: current,
                    accepted: false,
                };
            }
        }
        counters.insert(key.to_string(), next);
        CounterResult {
            value: next,
            accepted: true,
        }
    }

    async fn get(&self, key: &str) -> f64 {
        self.counters.lock().await.get(key).copied().unwrap_or(0.0)
    }

    async fn reset(&self, key: &str) {
        self.counters.lock().await.remove(key);
    }

    async fn remove_prefix(&self, prefix: &str) {
        self.counters
            .lock()
            .await
            .retain(|k, _| !k.starts_with(prefix));
    }
}

//! Hierarchical budget controller.
//!
//! Consumption goes through the counter store's atomic check-and-increment
//! so concurrent consumers can never jointly exceed a hard limit: "read
//! current, compute new, compare against limit, commit" is one indivisible
//! operation. The parent/child hierarchy is a limit-ceiling check enforced
//! at child creation only; child consumption is not cascaded into parent
//! counters.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use flowrun_core::{BudgetConfig, BudgetId, CoreError, ResourceType, ResourceUsage};

use crate::counter::CounterStore;

/// Budget controller errors.
#[derive(Debug, Error)]
pub enum BudgetError {
    /// A hard limit would be breached; the counter is left unchanged.
    #[error("Budget exceeded for {resource_type}: limit {limit}, attempted {attempted}")]
    Exceeded {
        resource_type: ResourceType,
        limit: f64,
        attempted: f64,
    },

    #[error("Budget not found: {0}")]
    NotFound(BudgetId),

    #[error("Budget already exists: {0}")]
    AlreadyExists(BudgetId),

    #[error(transparent)]
    Validation(#[from] CoreError),
}

struct BudgetRecord {
    config: BudgetConfig,
    parent: Option<BudgetId>,
}

/// Tracks resource consumption against configured limits, scoped by an
/// arbitrary budget id (task, tenant, or agent).
pub struct BudgetController {
    counters: Arc<dyn CounterStore>,
    budgets: RwLock<HashMap<BudgetId, BudgetRecord>>,
}

impl BudgetController {
    /// Create a controller over the given counter store.
    pub fn new(counters: Arc<dyn CounterStore>) -> Arc<Self> {
        Arc::new(Self {
            counters,
            budgets: RwLock::new(HashMap::new()),
        })
    }

    fn counter_key(budget_id: &BudgetId, resource_type: &ResourceType) -> String {
        format!("budget:{}:{}", budget_id, resource_type.as_key())
    }

    /// Register a new root budget.
    pub async fn create_budget(
        &self,
        budget_id: BudgetId,
        config: BudgetConfig,
    ) -> Result<(), BudgetError> {
        let mut budgets = self.budgets.write().await;
        if budgets.contains_key(&budget_id) {
            return Err(BudgetError::AlreadyExists(budget_id));
        }
        info!(budget_id = %budget_id, name = %config.name, "Created budget");
        budgets.insert(
            budget_id,
            BudgetRecord {
                config,
                parent: None,
            },
        );
        Ok(())
    }

    /// Register a child budget under `parent_id`.
    ///
    /// Every limit in the child must be at or below the parent's configured
    /// limit for the same resource type. This is validated once, here; the
    /// hierarchy does not aggregate usage afterwards.
    pub async fn create_child_budget(
        &self,
        parent_id: &BudgetId,
        budget_id: BudgetId,
        config: BudgetConfig,
    ) -> Result<(), BudgetError> {
        let mut budgets = self.budgets.write().await;
        if budgets.contains_key(&budget_id) {
            return Err(BudgetError::AlreadyExists(budget_id));
        }
        let parent = budgets
            .get(parent_id)
            .ok_or_else(|| BudgetError::NotFound(parent_id.clone()))?;
        config.validate_child_of(&parent.config)?;

        info!(budget_id = %budget_id, parent_id = %parent_id, "Created child budget");
        budgets.insert(
            budget_id,
            BudgetRecord {
                config,
                parent: Some(parent_id.clone()),
            },
        );
        Ok(())
    }

    /// Remove a budget and its counters. Children keep their own counters;
    /// they only lose the ceiling reference.
    pub async fn delete_budget(&self, budget_id: &BudgetId) -> Result<(), BudgetError> {
        let mut budgets = self.budgets.write().await;
        budgets
            .remove(budget_id)
            .ok_or_else(|| BudgetError::NotFound(budget_id.clone()))?;
        for record in budgets.values_mut() {
            if record.parent.as_ref() == Some(budget_id) {
                record.parent = None;
            }
        }
        drop(budgets);
        self.counters
            .remove_prefix(&format!("budget:{budget_id}:"))
            .await;
        Ok(())
    }

    /// Consume `amount` of a resource under a budget.
    ///
    /// Hard limits reject consumption that would exceed them, leaving the
    /// counter unchanged. Soft limits always commit; the returned usage
    /// carries `exceeded = true` when over the limit, advisory only.
    pub async fn consume(
        &self,
        budget_id: &BudgetId,
        resource_type: &ResourceType,
        amount: f64,
    ) -> Result<ResourceUsage, BudgetError> {
        let (limit, hard) = {
            let budgets = self.budgets.read().await;
            let record = budgets
                .get(budget_id)
                .ok_or_else(|| BudgetError::NotFound(budget_id.clone()))?;
            match record.config.limit_for(resource_type) {
                Some(l) => (Some(l.limit), l.hard_limit),
                None => (None, false),
            }
        };

        let key = Self::counter_key(budget_id, resource_type);
        let enforce = if hard { limit } else { None };
        let result = self.counters.check_and_increment(&key, amount, enforce).await;

        if !result.accepted {
            let limit = limit.unwrap_or_default();
            warn!(
                budget_id = %budget_id,
                resource = %resource_type,
                limit,
                attempted = result.value + amount,
                "Hard budget limit breached; consumption rejected"
            );
            return Err(BudgetError::Exceeded {
                resource_type: resource_type.clone(),
                limit,
                attempted: result.value + amount,
            });
        }

        let usage = ResourceUsage::report(resource_type.clone(), result.value, limit);
        if usage.exceeded {
            warn!(
                budget_id = %budget_id,
                resource = %resource_type,
                current = usage.current,
                "Soft budget limit exceeded (advisory)"
            );
        } else {
            debug!(
                budget_id = %budget_id,
                resource = %resource_type,
                current = usage.current,
                "Consumed budget"
            );
        }
        Ok(usage)
    }

    /// Whether consuming `amount` would be allowed right now.
    ///
    /// Advisory: another consumer may take the headroom between this check
    /// and a later `consume`; only `consume` itself is atomic.
    pub async fn check(
        &self,
        budget_id: &BudgetId,
        resource_type: &ResourceType,
        amount: f64,
    ) -> Result<bool, BudgetError> {
        let budgets = self.budgets.read().await;
        let record = budgets
            .get(budget_id)
            .ok_or_else(|| BudgetError::NotFound(budget_id.clone()))?;
        let Some(limit) = record.config.limit_for(resource_type) else {
            return Ok(true);
        };
        if !limit.hard_limit {
            return Ok(true);
        }
        let key = Self::counter_key(budget_id, resource_type);
        let current = self.counters.get(&key).await;
        Ok(current + amount <= limit.limit)
    }

    /// Usage for one resource type, or every configured resource type.
    pub async fn get_usage(
        &self,
        budget_id: &BudgetId,
        resource_type: Option<&ResourceType>,
    ) -> Result<Vec<ResourceUsage>, BudgetError> {
        let resource_types: Vec<ResourceType> = {
            let budgets = self.budgets.read().await;
            let record = budgets
                .get(budget_id)
                .ok_or_else(|| BudgetError::NotFound(budget_id.clone()))?;
            match resource_type {
                Some(rt) => vec![rt.clone()],
                None => record
                    .config
                    .limits
                    .iter()
                    .map(|l| l.resource_type.clone())
                    .collect(),
            }
        };

        let mut usages = Vec::with_capacity(resource_types.len());
        for rt in resource_types {
            let limit = {
                let budgets = self.budgets.read().await;
                budgets
                    .get(budget_id)
                    .and_then(|r| r.config.limit_for(&rt))
                    .map(|l| l.limit)
            };
            let current = self
                .counters
                .get(&Self::counter_key(budget_id, &rt))
                .await;
            usages.push(ResourceUsage::report(rt, current, limit));
        }
        Ok(usages)
    }

    /// Zero one or all resource counters for a budget. Children are not
    /// affected.
    pub async fn reset(
        &self,
        budget_id: &BudgetId,
        resource_type: Option<&ResourceType>,
    ) -> Result<(), BudgetError> {
        match resource_type {
            Some(rt) => {
                self.counters
                    .reset(&Self::counter_key(budget_id, rt))
                    .await;
            }
            None => {
                self.counters
                    .remove_prefix(&format!("budget:{budget_id}:"))
                    .await;
            }
        }
        info!(budget_id = %budget_id, "Reset budget counters");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::InMemoryCounterStore;
    use flowrun_core::ResourceLimit;

    async fn controller_with(
        budget: &str,
        limits: Vec<ResourceLimit>,
    ) -> (Arc<BudgetController>, BudgetId) {
        let controller = BudgetController::new(InMemoryCounterStore::new());
        let id = BudgetId::new(budget);
        let mut config = BudgetConfig::new(budget);
        config.limits = limits;
        controller.create_budget(id.clone(), config).await.unwrap();
        (controller, id)
    }

    #[tokio::test]
    async fn test_hard_limit_enforced_exactly() {
        let (controller, id) =
            controller_with("t", vec![ResourceLimit::hard(ResourceType::LlmCalls, 20.0)]).await;

        for _ in 0..4 {
            let usage = controller
                .consume(&id, &ResourceType::LlmCalls, 5.0)
                .await
                .unwrap();
            assert!(!usage.exceeded);
        }
        let usage = controller
            .get_usage(&id, Some(&ResourceType::LlmCalls))
            .await
            .unwrap();
        assert_eq!(usage[0].current, 20.0);

        let err = controller
            .consume(&id, &ResourceType::LlmCalls, 5.0)
            .await
            .unwrap_err();
        match err {
            BudgetError::Exceeded {
                resource_type,
                limit,
                attempted,
            } => {
                assert_eq!(resource_type, ResourceType::LlmCalls);
                assert_eq!(limit, 20.0);
                assert_eq!(attempted, 25.0);
            }
            other => panic!("expected Exceeded, got {other:?}"),
        }

        // The rejected call left the counter unchanged.
        let usage = controller
            .get_usage(&id, Some(&ResourceType::LlmCalls))
            .await
            .unwrap();
        assert_eq!(usage[0].current, 20.0);
    }

    #[tokio::test]
    async fn test_soft_limit_is_advisory() {
        let (controller, id) =
            controller_with("t", vec![ResourceLimit::soft(ResourceType::CostUsd, 1.0)]).await;

        let usage = controller
            .consume(&id, &ResourceType::CostUsd, 1.5)
            .await
            .unwrap();
        assert!(usage.exceeded);
        assert_eq!(usage.current, 1.5);
    }

    #[tokio::test]
    async fn test_unconfigured_resource_unlimited() {
        let (controller, id) = controller_with("t", vec![]).await;
        let usage = controller
            .consume(&id, &ResourceType::LlmTokens, 1_000_000.0)
            .await
            .unwrap();
        assert!(!usage.exceeded);
        assert!(usage.limit.is_none());
    }

    #[tokio::test]
    async fn test_child_limit_above_parent_rejected() {
        let controller = BudgetController::new(InMemoryCounterStore::new());
        let parent = BudgetId::new("tenant");
        controller
            .create_budget(
                parent.clone(),
                BudgetConfig::new("tenant")
                    .with_limit(ResourceLimit::hard(ResourceType::CostUsd, 10.0)),
            )
            .await
            .unwrap();

        let err = controller
            .create_child_budget(
                &parent,
                BudgetId::new("task"),
                BudgetConfig::new("task")
                    .with_limit(ResourceLimit::hard(ResourceType::CostUsd, 20.0)),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceeds parent limit"));
    }

    #[tokio::test]
    async fn test_child_consumption_not_cascaded() {
        let controller = BudgetController::new(InMemoryCounterStore::new());
        let parent = BudgetId::new("tenant");
        let child = BudgetId::new("task");
        controller
            .create_budget(
                parent.clone(),
                BudgetConfig::new("tenant")
                    .with_limit(ResourceLimit::hard(ResourceType::LlmCalls, 100.0)),
            )
            .await
            .unwrap();
        controller
            .create_child_budget(
                &parent,
                child.clone(),
                BudgetConfig::new("task")
                    .with_limit(ResourceLimit::hard(ResourceType::LlmCalls, 10.0)),
            )
            .await
            .unwrap();

        controller
            .consume(&child, &ResourceType::LlmCalls, 5.0)
            .await
            .unwrap();
        let parent_usage = controller
            .get_usage(&parent, Some(&ResourceType::LlmCalls))
            .await
            .unwrap();
        assert_eq!(parent_usage[0].current, 0.0);
    }

    #[tokio::test]
    async fn test_reset_zeroes_counters() {
        let (controller, id) =
            controller_with("t", vec![ResourceLimit::hard(ResourceType::LlmCalls, 10.0)]).await;
        controller
            .consume(&id, &ResourceType::LlmCalls, 10.0)
            .await
            .unwrap();
        controller.reset(&id, None).await.unwrap();

        let usage = controller
            .get_usage(&id, Some(&ResourceType::LlmCalls))
            .await
            .unwrap();
        assert_eq!(usage[0].current, 0.0);
        // Headroom is back after the reset.
        assert!(controller
            .consume(&id, &ResourceType::LlmCalls, 10.0)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_consumers_respect_hard_limit() {
        let (controller, id) =
            controller_with("t", vec![ResourceLimit::hard(ResourceType::LlmCalls, 10.0)]).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let controller = controller.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                controller.consume(&id, &ResourceType::LlmCalls, 3.0).await
            }));
        }
        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                accepted += 1;
            }
        }
        // 3 * 3.0 = 9.0 fits, a fourth would breach 10.0.
        assert_eq!(accepted, 3);
        let usage = controller
            .get_usage(&id, Some(&ResourceType::LlmCalls))
            .await
            .unwrap();
        assert_eq!(usage[0].current, 9.0);
    }

    #[tokio::test]
    async fn test_check_is_advisory() {
        let (controller, id) =
            controller_with("t", vec![ResourceLimit::hard(ResourceType::LlmCalls, 10.0)]).await;
        assert!(controller
            .check(&id, &ResourceType::LlmCalls, 10.0)
            .await
            .unwrap());
        assert!(!controller
            .check(&id, &ResourceType::LlmCalls, 11.0)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_delete_budget_clears_counters() {
        let (controller, id) =
            controller_with("t", vec![ResourceLimit::hard(ResourceType::LlmCalls, 10.0)]).await;
        controller
            .consume(&id, &ResourceType::LlmCalls, 5.0)
            .await
            .unwrap();
        controller.delete_budget(&id).await.unwrap();
        assert!(matches!(
            controller.get_usage(&id, None).await,
            Err(BudgetError::NotFound(_))
        ));
    }
}

//! Budget configuration and usage types.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A resource type tracked by the budget controller.
///
/// Open-ended: well-known resources get variants, anything else rides in
/// `Other` so new capabilities can meter custom resources without a core
/// change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceType {
    /// Number of model invocations.
    LlmCalls,
    /// Tokens consumed across model invocations.
    LlmTokens,
    /// Monetary cost in USD.
    CostUsd,
    /// Number of step executions.
    StepExecutions,
    /// Any other metered resource.
    #[serde(untagged)]
    Other(String),
}

impl ResourceType {
    /// Stable key used for counter storage.
    pub fn as_key(&self) -> &str {
        match self {
            Self::LlmCalls => "LLM_CALLS",
            Self::LlmTokens => "LLM_TOKENS",
            Self::CostUsd => "COST_USD",
            Self::StepExecutions => "STEP_EXECUTIONS",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_key())
    }
}

/// Reset period for a resource limit.
///
/// The in-memory counter stores the period for reporting; rollover is the
/// backing store's concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BudgetPeriod {
    Daily,
    Weekly,
    Monthly,
}

/// One limit entry inside a budget configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimit {
    /// Resource this limit applies to.
    pub resource_type: ResourceType,

    /// Maximum allowed consumption.
    pub limit: f64,

    /// Optional reset period.
    pub period: Option<BudgetPeriod>,

    /// Hard limits reject consumption that would exceed them; soft limits
    /// only flag `exceeded` on the returned usage.
    pub hard_limit: bool,
}

impl ResourceLimit {
    /// A hard limit with no period.
    pub fn hard(resource_type: ResourceType, limit: f64) -> Self {
        Self {
            resource_type,
            limit,
            period: None,
            hard_limit: true,
        }
    }

    /// A soft (advisory) limit with no period.
    pub fn soft(resource_type: ResourceType, limit: f64) -> Self {
        Self {
            resource_type,
            limit,
            period: None,
            hard_limit: false,
        }
    }

    /// Builder method to set the period.
    pub fn with_period(mut self, period: BudgetPeriod) -> Self {
        self.period = Some(period);
        self
    }
}

/// A named set of resource limits owned by a budget id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Human-readable budget name.
    pub name: String,

    /// Limits, at most one per resource type.
    pub limits: Vec<ResourceLimit>,
}

impl BudgetConfig {
    /// Create an empty budget config.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            limits: Vec::new(),
        }
    }

    /// Builder method to add a limit.
    pub fn with_limit(mut self, limit: ResourceLimit) -> Self {
        self.limits.push(limit);
        self
    }

    /// Find the limit for a resource type, if configured.
    pub fn limit_for(&self, resource_type: &ResourceType) -> Option<&ResourceLimit> {
        self.limits.iter().find(|l| &l.resource_type == resource_type)
    }

    /// Validate this config as a child of `parent`.
    ///
    /// Every limit must be at or below the parent's configured limit for the
    /// same resource type. Enforced at creation time only; the hierarchy is
    /// a ceiling check, not cascading accounting.
    pub fn validate_child_of(&self, parent: &BudgetConfig) -> Result<(), CoreError> {
        for limit in &self.limits {
            if let Some(parent_limit) = parent.limit_for(&limit.resource_type) {
                if limit.limit > parent_limit.limit {
                    return Err(CoreError::Validation(format!(
                        "child limit {} for {} exceeds parent limit {}",
                        limit.limit, limit.resource_type, parent_limit.limit
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Live usage counter for one resource type under a budget id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Resource being reported.
    pub resource_type: ResourceType,

    /// Current consumption.
    pub current: f64,

    /// Configured limit, if any.
    pub limit: Option<f64>,

    /// Consumption as a fraction of the limit, 0.0 when unlimited.
    pub percentage: f64,

    /// True when current consumption is over the limit.
    pub exceeded: bool,
}

impl ResourceUsage {
    /// Build a usage report from a counter value and optional limit.
    pub fn report(resource_type: ResourceType, current: f64, limit: Option<f64>) -> Self {
        let percentage = match limit {
            Some(l) if l > 0.0 => current / l,
            _ => 0.0,
        };
        let exceeded = limit.is_some_and(|l| current > l);
        Self {
            resource_type,
            current,
            limit,
            percentage,
            exceeded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_limit_exceeds_parent() {
        let parent = BudgetConfig::new("tenant")
            .with_limit(ResourceLimit::hard(ResourceType::CostUsd, 10.0));
        let child = BudgetConfig::new("task")
            .with_limit(ResourceLimit::hard(ResourceType::CostUsd, 20.0));

        let err = child.validate_child_of(&parent).unwrap_err();
        assert!(err.to_string().contains("exceeds parent limit"));
    }

    #[test]
    fn test_child_within_parent_ok() {
        let parent = BudgetConfig::new("tenant")
            .with_limit(ResourceLimit::hard(ResourceType::LlmCalls, 100.0));
        let child = BudgetConfig::new("task")
            .with_limit(ResourceLimit::hard(ResourceType::LlmCalls, 100.0));
        assert!(child.validate_child_of(&parent).is_ok());
    }

    #[test]
    fn test_child_resource_absent_in_parent_ok() {
        // Parent does not constrain LLM_TOKENS, so the child may set any cap.
        let parent = BudgetConfig::new("tenant")
            .with_limit(ResourceLimit::hard(ResourceType::CostUsd, 10.0));
        let child = BudgetConfig::new("task")
            .with_limit(ResourceLimit::hard(ResourceType::LlmTokens, 1_000_000.0));
        assert!(child.validate_child_of(&parent).is_ok());
    }

    #[test]
    fn test_usage_report_percentage_and_exceeded() {
        let usage = ResourceUsage::report(ResourceType::CostUsd, 1.5, Some(1.0));
        assert!(usage.exceeded);
        assert!((usage.percentage - 1.5).abs() < f64::EPSILON);

        let usage = ResourceUsage::report(ResourceType::CostUsd, 0.5, None);
        assert!(!usage.exceeded);
        assert_eq!(usage.percentage, 0.0);
    }

    #[test]
    fn test_resource_type_keys() {
        assert_eq!(ResourceType::LlmCalls.as_key(), "LLM_CALLS");
        assert_eq!(ResourceType::Other("GPU_SECONDS".into()).as_key(), "GPU_SECONDS");
    }
}

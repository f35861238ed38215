//! Ordered, acyclic groups of dependent tasks.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::TaskData;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("plan has no steps")]
    Empty,

    #[error("step {step} depends on step {depends_on}, which does not come before it")]
    ForwardDependency { step: usize, depends_on: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub description: String,
    pub data: TaskData,
    /// Index of an earlier step that must finish first.
    pub depends_on: Option<usize>,
}

/// Steps in execution order. A step can only depend on an earlier one, so the
/// plan is acyclic by construction once validated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPlan {
    pub description: String,
    pub steps: Vec<PlannedStep>,
}

impl StepPlan {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            steps: Vec::new(),
        }
    }

    /// Appends a step that runs after the previously appended one.
    pub fn then(mut self, description: impl Into<String>, data: TaskData) -> Self {
        let depends_on = self.steps.len().checked_sub(1);
        self.steps.push(PlannedStep {
            description: description.into(),
            data,
            depends_on,
        });
        self
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        if self.steps.is_empty() {
            return Err(PlanError::Empty);
        }
        for (i, step) in self.steps.iter().enumerate() {
            if let Some(dep) = step.depends_on {
                if dep >= i {
                    return Err(PlanError::ForwardDependency {
                        step: i,
                        depends_on: dep,
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VpcOnly;

    fn data() -> TaskData {
        TaskData::DeleteUnusedResources(VpcOnly {
            region: "us-east-1".into(),
            vpc_id: "vpc-1".into(),
        })
    }

    #[test]
    fn test_then_chains_steps() {
        let plan = StepPlan::new("chain").then("one", data()).then("two", data());
        assert_eq!(plan.steps[0].depends_on, None);
        assert_eq!(plan.steps[1].depends_on, Some(0));
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_rejects_self_and_forward_dependencies() {
        let mut plan = StepPlan::new("bad").then("one", data());
        plan.steps[0].depends_on = Some(0);
        assert_eq!(
            plan.validate(),
            Err(PlanError::ForwardDependency {
                step: 0,
                depends_on: 0
            })
        );
        assert_eq!(StepPlan::new("empty").validate(), Err(PlanError::Empty));
    }
}

// ABOUTME: RollbackManager - ordered compensating actions run in strict reverse order.
// ABOUTME: Rebuilt fresh for every deployment attempt; never shared or persisted.

use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

use super::DeployError;
use crate::state::StateManager;

/// Fixed bound on each compensation and verification.
const STEP_TIMEOUT: Duration = Duration::from_secs(300);

pub type StepFuture = BoxFuture<'static, Result<(), DeployError>>;

type StepFn = Box<dyn FnOnce() -> StepFuture + Send>;

/// One registered compensating action with an optional post-condition check.
struct RollbackStep {
    name: String,
    compensate: StepFn,
    verify: Option<StepFn>,
}

/// Collects compensating actions during the forward deployment and executes
/// them in strict reverse order on failure.
///
/// Steps are registered in the order decisions were made, so reversing the
/// list reverses causality. A failing compensation is recorded but never
/// stops the logically prior steps: partial rollback beats no rollback.
pub struct RollbackManager {
    steps: Vec<RollbackStep>,
    state: Arc<StateManager>,
}

impl RollbackManager {
    pub fn new(state: Arc<StateManager>) -> Self {
        Self {
            steps: Vec::new(),
            state,
        }
    }

    /// Register a compensating action.
    pub fn add_step<C>(&mut self, name: impl Into<String>, compensate: C)
    where
        C: FnOnce() -> StepFuture + Send + 'static,
    {
        self.steps.push(RollbackStep {
            name: name.into(),
            compensate: Box::new(compensate),
            verify: None,
        });
    }

    /// Register a compensating action with a post-condition verifier.
    pub fn add_verified_step<C, V>(&mut self, name: impl Into<String>, compensate: C, verify: V)
    where
        C: FnOnce() -> StepFuture + Send + 'static,
        V: FnOnce() -> StepFuture + Send + 'static,
    {
        self.steps.push(RollbackStep {
            name: name.into(),
            compensate: Box::new(compensate),
            verify: Some(Box::new(verify)),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Execute every registered compensation in reverse registration order,
    /// then every verifier, then compare the persisted ledger against its
    /// pre-rollback capture. All failures are aggregated into one error.
    pub async fn rollback(&mut self) -> Result<(), DeployError> {
        tracing::info!("rolling back deployment");
        let mut failures: Vec<String> = Vec::new();

        let initial = self.state.load().await.unwrap_or_default();

        let mut verifiers = Vec::new();
        for step in self.steps.drain(..).rev() {
            tracing::debug!(step = %step.name, "running rollback step");
            match tokio::time::timeout(STEP_TIMEOUT, (step.compensate)()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failures.push(format!("rollback step '{}' failed: {}", step.name, err));
                }
                Err(_) => {
                    failures.push(format!(
                        "rollback step '{}' timed out after {:?}",
                        step.name, STEP_TIMEOUT
                    ));
                }
            }
            if let Some(verify) = step.verify {
                verifiers.push((step.name, verify));
            }
        }

        for (name, verify) in verifiers {
            match tokio::time::timeout(STEP_TIMEOUT, verify()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failures.push(format!("rollback verification '{}' failed: {}", name, err));
                }
                Err(_) => {
                    failures.push(format!(
                        "rollback verification '{}' timed out after {:?}",
                        name, STEP_TIMEOUT
                    ));
                }
            }
        }

        match self.state.load().await {
            Ok(finished) => {
                if finished != initial {
                    failures.push(
                        "state after rollback does not match state before deployment".to_string(),
                    );
                }
            }
            Err(err) => failures.push(format!("failed to load state after rollback: {}", err)),
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DeployError::RollbackFailed { failures })
        }
    }
}

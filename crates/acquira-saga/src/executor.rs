use async_trait::async_trait;
use tracing::{info, warn};

use acquira_core::error::GatewayError;

/// Implemented by saga contexts so the executor can tell the compensation
/// phase which step failed and why.
pub trait SagaContext {
    fn record_failure(&mut self, _step: &str, _reason: &str) {}
}

/// One compensable step. `execute` moves the work forward; `compensate`
/// undoes it. Compensation is only ever invoked on steps that executed.
#[async_trait]
pub trait SagaStep<C: SagaContext + Send>: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &mut C) -> Result<(), GatewayError>;

    async fn compensate(&self, ctx: &mut C) -> Result<(), GatewayError>;
}

/// Outcome of one saga run.
#[derive(Debug)]
pub struct SagaResult {
    pub success: bool,
    pub failed_step: Option<String>,
    pub failure: Option<GatewayError>,
    /// Step names that executed successfully, in order.
    pub executed: Vec<String>,
    /// Step names compensated, in reverse execution order.
    pub compensated: Vec<String>,
    /// Compensations that themselves failed; these need manual review but do
    /// not change the caller-visible outcome.
    pub failed_compensations: Vec<String>,
}

impl SagaResult {
    pub fn needs_manual_review(&self) -> bool {
        !self.failed_compensations.is_empty()
    }
}

/// Ordered-step runner with reverse-order compensation.
///
/// Steps run strictly sequentially. On the first failure, every step that
/// executed is compensated in reverse order; compensation failures are
/// collected rather than halting the remaining compensations.
pub struct SagaExecutor<C: SagaContext + Send> {
    name: &'static str,
    steps: Vec<Box<dyn SagaStep<C>>>,
}

impl<C: SagaContext + Send> SagaExecutor<C> {
    pub fn new(name: &'static str, steps: Vec<Box<dyn SagaStep<C>>>) -> Self {
        Self { name, steps }
    }

    pub async fn run(&self, ctx: &mut C) -> SagaResult {
        let mut executed: Vec<usize> = Vec::with_capacity(self.steps.len());

        for (index, step) in self.steps.iter().enumerate() {
            match step.execute(ctx).await {
                Ok(()) => {
                    executed.push(index);
                }
                Err(err) => {
                    warn!(
                        saga = self.name,
                        step = step.name(),
                        error = %err,
                        "saga step failed; compensating"
                    );
                    ctx.record_failure(step.name(), &err.to_string());
                    let (compensated, failed_compensations) =
                        self.compensate_executed(ctx, &executed).await;
                    return SagaResult {
                        success: false,
                        failed_step: Some(step.name().to_string()),
                        failure: Some(err),
                        executed: self.names(&executed),
                        compensated,
                        failed_compensations,
                    };
                }
            }
        }

        info!(saga = self.name, steps = executed.len(), "saga completed");
        SagaResult {
            success: true,
            failed_step: None,
            failure: None,
            executed: self.names(&executed),
            compensated: Vec::new(),
            failed_compensations: Vec::new(),
        }
    }

    async fn compensate_executed(
        &self,
        ctx: &mut C,
        executed: &[usize],
    ) -> (Vec<String>, Vec<String>) {
        let mut compensated = Vec::new();
        let mut failed = Vec::new();
        for &index in executed.iter().rev() {
            let step = &self.steps[index];
            match step.compensate(ctx).await {
                Ok(()) => compensated.push(step.name().to_string()),
                Err(err) => {
                    warn!(
                        saga = self.name,
                        step = step.name(),
                        error = %err,
                        "compensation failed"
                    );
                    failed.push(step.name().to_string());
                }
            }
        }
        (compensated, failed)
    }

    fn names(&self, indices: &[usize]) -> Vec<String> {
        indices.iter().map(|&i| self.steps[i].name().to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct TestCtx {
        trail: Vec<String>,
        failed_step: Option<String>,
    }

    impl SagaContext for TestCtx {
        fn record_failure(&mut self, step: &str, _reason: &str) {
            self.failed_step = Some(step.to_string());
        }
    }

    struct Step {
        name: &'static str,
        fail_execute: bool,
        fail_compensate: bool,
        executions: Arc<AtomicU32>,
    }

    impl Step {
        fn ok(name: &'static str) -> Box<Self> {
            Box::new(Self {
                name,
                fail_execute: false,
                fail_compensate: false,
                executions: Arc::new(AtomicU32::new(0)),
            })
        }

        fn failing(name: &'static str) -> Box<Self> {
            Box::new(Self {
                name,
                fail_execute: true,
                fail_compensate: false,
                executions: Arc::new(AtomicU32::new(0)),
            })
        }

        fn bad_compensation(name: &'static str) -> Box<Self> {
            Box::new(Self {
                name,
                fail_execute: false,
                fail_compensate: true,
                executions: Arc::new(AtomicU32::new(0)),
            })
        }
    }

    #[async_trait]
    impl SagaStep<TestCtx> for Step {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn execute(&self, ctx: &mut TestCtx) -> Result<(), GatewayError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            if self.fail_execute {
                return Err(GatewayError::Internal(format!("{} exploded", self.name)));
            }
            ctx.trail.push(format!("exec:{}", self.name));
            Ok(())
        }

        async fn compensate(&self, ctx: &mut TestCtx) -> Result<(), GatewayError> {
            if self.fail_compensate {
                return Err(GatewayError::Internal(format!("{} uncompensatable", self.name)));
            }
            ctx.trail.push(format!("comp:{}", self.name));
            Ok(())
        }
    }

    #[tokio::test]
    async fn all_steps_run_in_order_on_success() {
        let executor = SagaExecutor::new("test", vec![Step::ok("a"), Step::ok("b"), Step::ok("c")]);
        let mut ctx = TestCtx::default();
        let result = executor.run(&mut ctx).await;

        assert!(result.success);
        assert_eq!(result.executed, vec!["a", "b", "c"]);
        assert!(result.compensated.is_empty());
        assert_eq!(ctx.trail, vec!["exec:a", "exec:b", "exec:c"]);
    }

    #[tokio::test]
    async fn failure_compensates_executed_steps_in_reverse() {
        let executor = SagaExecutor::new(
            "test",
            vec![Step::ok("a"), Step::ok("b"), Step::failing("c"), Step::ok("d")],
        );
        let mut ctx = TestCtx::default();
        let result = executor.run(&mut ctx).await;

        assert!(!result.success);
        assert_eq!(result.failed_step.as_deref(), Some("c"));
        assert_eq!(result.executed, vec!["a", "b"]);
        assert_eq!(result.compensated, vec!["b", "a"]);
        assert_eq!(ctx.failed_step.as_deref(), Some("c"));
        assert_eq!(
            ctx.trail,
            vec!["exec:a", "exec:b", "comp:b", "comp:a"],
            "step d must never run and compensation must be reversed"
        );
    }

    #[tokio::test]
    async fn compensation_failures_are_collected_not_fatal() {
        let executor = SagaExecutor::new(
            "test",
            vec![Step::ok("a"), Step::bad_compensation("b"), Step::failing("c")],
        );
        let mut ctx = TestCtx::default();
        let result = executor.run(&mut ctx).await;

        assert!(!result.success);
        assert_eq!(result.failed_compensations, vec!["b"]);
        assert_eq!(result.compensated, vec!["a"], "a must still compensate after b fails");
        assert!(result.needs_manual_review());
    }

    #[tokio::test]
    async fn first_step_failure_compensates_nothing() {
        let step = Step::failing("a");
        let executions = Arc::clone(&step.executions);
        let executor = SagaExecutor::new("test", vec![step, Step::ok("b")]);
        let mut ctx = TestCtx::default();
        let result = executor.run(&mut ctx).await;

        assert!(!result.success);
        assert!(result.compensated.is_empty());
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert!(ctx.trail.is_empty());
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::db::Db;
use crate::types::{Plan, PlanStatus, PlanStep, StepStatus, ToolOutcome};

/// A tool dispatchable by name from a `PlanStep`. Built-in tools
/// (`RAG_SEARCH`, `GIT_LOG_SEARCH`, `DIALOG_ASK`) each implement this.
#[async_trait]
pub trait PlanTool: Send + Sync {
    async fn execute(&self, context: &str, plan: &Plan, instruction: &str, step: &PlanStep) -> ToolOutcome;
}

/// Renders a terminal plan's `finalAnswer` in `plan.originalLanguage` (C9).
#[async_trait]
pub trait AnswerRenderer: Send + Sync {
    async fn render_final_answer(&self, plan: &Plan) -> Result<String>;
}

#[derive(Debug, Clone)]
pub enum PlanEvent {
    StepCompleted { plan_id: i64, step_id: i64, status: StepStatus },
    PlanStatusChanged { plan_id: i64, status: PlanStatus },
}

/// Dispatches a flat, strictly-ordered plan to registered tools, persisting
/// progress after every step (C10).
pub struct PlanExecutor {
    db: Arc<Db>,
    tools: HashMap<String, Arc<dyn PlanTool>>,
    events: broadcast::Sender<PlanEvent>,
}

fn build_step_context(plan: &Plan) -> String {
    plan.steps
        .iter()
        .filter(|s| s.status == StepStatus::Done)
        .map(|s| format!("[{}] {}", s.tool_name, s.tool_result.as_deref().unwrap_or("")))
        .collect::<Vec<_>>()
        .join("\n")
}

impl PlanExecutor {
    pub fn new(db: Arc<Db>, tools: HashMap<String, Arc<dyn PlanTool>>) -> Self {
        let (events, _rx) = broadcast::channel(256);
        Self { db, tools, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlanEvent> {
        self.events.subscribe()
    }

    /// Runs every non-terminal plan in `context_id`, sequentially.
    pub async fn run_context(&self, context_id: i64) -> Result<()> {
        let plan_ids = self.db.list_pending_plans(context_id).context("list_pending_plans")?;
        for plan_id in plan_ids {
            self.run_plan(plan_id).await?;
        }
        Ok(())
    }

    /// Runs one plan's remaining steps strictly in `order`, persisting after
    /// every step, until it reaches a terminal status or runs out of steps.
    pub async fn run_plan(&self, plan_id: i64) -> Result<()> {
        loop {
            let plan = self
                .db
                .get_plan(plan_id)
                .context("get_plan")?
                .with_context(|| format!("plan {plan_id} not found"))?;

            if plan.status.is_terminal() {
                return Ok(());
            }

            let Some(step) = plan.next_pending_step().cloned() else {
                self.db
                    .update_plan_status(plan_id, PlanStatus::Completed, None)
                    .context("update_plan_status completed")?;
                let _ = self.events.send(PlanEvent::PlanStatusChanged { plan_id, status: PlanStatus::Completed });
                return Ok(());
            };

            let context_str = build_step_context(&plan);

            let Some(tool) = self.tools.get(&step.tool_name).cloned() else {
                warn!(plan_id, tool_name = %step.tool_name, "unknown tool in plan step");
                self.fail_plan(plan_id, step.id, &format!("unknown tool {}", step.tool_name)).await?;
                return Ok(());
            };

            let outcome = tool.execute(&context_str, &plan, &step.instruction, &step).await;
            match outcome {
                ToolOutcome::Ok(output) => {
                    self.db
                        .update_plan_step(step.id, StepStatus::Done, Some(&output))
                        .context("update_plan_step ok")?;
                    let _ = self.events.send(PlanEvent::StepCompleted { plan_id, step_id: step.id, status: StepStatus::Done });
                }
                ToolOutcome::Ask(output) => {
                    self.db
                        .update_plan_step(step.id, StepStatus::Done, Some(&output))
                        .context("update_plan_step ask")?;
                    let _ = self.events.send(PlanEvent::StepCompleted { plan_id, step_id: step.id, status: StepStatus::Done });
                }
                ToolOutcome::Error(msg) => {
                    self.fail_plan(plan_id, step.id, &msg).await?;
                    return Ok(());
                }
                ToolOutcome::Stop(reason) => {
                    self.db
                        .update_plan_step(step.id, StepStatus::Failed, Some(&reason))
                        .context("update_plan_step stop")?;
                    self.db
                        .update_plan_status(plan_id, PlanStatus::Failed, Some(&reason))
                        .context("update_plan_status stop")?;
                    let _ = self.events.send(PlanEvent::PlanStatusChanged { plan_id, status: PlanStatus::Failed });
                    return Ok(());
                }
            }
        }
    }

    async fn fail_plan(&self, plan_id: i64, step_id: i64, msg: &str) -> Result<()> {
        self.db
            .update_plan_step(step_id, StepStatus::Failed, Some(msg))
            .context("update_plan_step failed")?;
        let final_answer = format!("Step failed: {msg}");
        self.db
            .update_plan_status(plan_id, PlanStatus::Failed, Some(&final_answer))
            .context("update_plan_status failed")?;
        let _ = self.events.send(PlanEvent::StepCompleted { plan_id, step_id, status: StepStatus::Failed });
        let _ = self.events.send(PlanEvent::PlanStatusChanged { plan_id, status: PlanStatus::Failed });
        Ok(())
    }

    /// Separate pass over `{COMPLETED, FAILED}` plans: renders a
    /// user-facing answer via `renderer` and marks each `FINALIZED`.
    pub async fn finalize_pending(&self, renderer: &dyn AnswerRenderer) -> Result<usize> {
        let plan_ids = self.db.list_terminal_unfinalized_plans().context("list_terminal_unfinalized_plans")?;
        let mut finalized = 0;
        for plan_id in plan_ids {
            let Some(plan) = self.db.get_plan(plan_id).context("get_plan")? else {
                continue;
            };
            match renderer.render_final_answer(&plan).await {
                Ok(answer) => {
                    self.db
                        .update_plan_status(plan_id, PlanStatus::Finalized, Some(&answer))
                        .context("update_plan_status finalized")?;
                    let _ = self.events.send(PlanEvent::PlanStatusChanged { plan_id, status: PlanStatus::Finalized });
                    finalized += 1;
                    info!(plan_id, "plan finalized");
                }
                Err(e) => {
                    warn!(plan_id, error = %e, "finalization failed, plan left terminal for retry");
                }
            }
        }
        Ok(finalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl PlanTool for EchoTool {
        async fn execute(&self, _context: &str, _plan: &Plan, instruction: &str, _step: &PlanStep) -> ToolOutcome {
            ToolOutcome::Ok(format!("echo: {instruction}"))
        }
    }

    struct FailingTool;

    #[async_trait]
    impl PlanTool for FailingTool {
        async fn execute(&self, _context: &str, _plan: &Plan, _instruction: &str, _step: &PlanStep) -> ToolOutcome {
            ToolOutcome::Error("boom".to_string())
        }
    }

    struct StaticRenderer;

    #[async_trait]
    impl AnswerRenderer for StaticRenderer {
        async fn render_final_answer(&self, plan: &Plan) -> Result<String> {
            Ok(format!("Answer for: {}", plan.original_question))
        }
    }

    fn tools_with(name: &str, tool: Arc<dyn PlanTool>) -> HashMap<String, Arc<dyn PlanTool>> {
        let mut map = HashMap::new();
        map.insert(name.to_string(), tool);
        map
    }

    #[tokio::test]
    async fn plan_completes_when_all_steps_succeed() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let client_id = db.upsert_client("Acme", "acme").unwrap();
        let context_id = db.insert_context(client_id, None).unwrap();
        let plan_id = db.insert_plan(context_id, "q", "q", "en").unwrap();
        db.insert_plan_step(plan_id, 1, "ECHO", "step one").unwrap();
        db.insert_plan_step(plan_id, 2, "ECHO", "step two").unwrap();

        let executor = PlanExecutor::new(db.clone(), tools_with("ECHO", Arc::new(EchoTool)));
        executor.run_plan(plan_id).await.unwrap();

        let plan = db.get_plan(plan_id).unwrap().unwrap();
        assert_eq!(plan.status, PlanStatus::Completed);
        assert!(plan.steps.iter().all(|s| s.status == StepStatus::Done));
    }

    #[tokio::test]
    async fn step_error_fails_the_plan_and_stops_execution() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let client_id = db.upsert_client("Acme", "acme").unwrap();
        let context_id = db.insert_context(client_id, None).unwrap();
        let plan_id = db.insert_plan(context_id, "q", "q", "en").unwrap();
        db.insert_plan_step(plan_id, 1, "FAIL", "step one").unwrap();
        db.insert_plan_step(plan_id, 2, "ECHO", "step two").unwrap();

        let mut tools: HashMap<String, Arc<dyn PlanTool>> = HashMap::new();
        tools.insert("FAIL".to_string(), Arc::new(FailingTool));
        tools.insert("ECHO".to_string(), Arc::new(EchoTool));
        let executor = PlanExecutor::new(db.clone(), tools);
        executor.run_plan(plan_id).await.unwrap();

        let plan = db.get_plan(plan_id).unwrap().unwrap();
        assert_eq!(plan.status, PlanStatus::Failed);
        assert_eq!(plan.final_answer.as_deref(), Some("Step failed: boom"));
        assert_eq!(plan.steps[1].status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn finalize_pending_renders_answer_and_marks_finalized() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let client_id = db.upsert_client("Acme", "acme").unwrap();
        let context_id = db.insert_context(client_id, None).unwrap();
        let plan_id = db.insert_plan(context_id, "what is X?", "what is X?", "en").unwrap();
        db.update_plan_status(plan_id, PlanStatus::Completed, None).unwrap();

        let executor = PlanExecutor::new(db.clone(), HashMap::new());
        let count = executor.finalize_pending(&StaticRenderer).await.unwrap();
        assert_eq!(count, 1);

        let plan = db.get_plan(plan_id).unwrap().unwrap();
        assert_eq!(plan.status, PlanStatus::Finalized);
        assert_eq!(plan.final_answer.as_deref(), Some("Answer for: what is X?"));
    }
}

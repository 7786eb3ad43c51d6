use std::sync::Arc;

use async_trait::async_trait;
use jervis_core::db::Db;
use jervis_core::dialog::DialogCoordinator;
use jervis_core::pipeline::EmbeddingGateway;
use jervis_core::plan::{AnswerRenderer, PlanTool};
use jervis_core::types::{ModelType, Plan, PlanStep, ToolOutcome};
use jervis_gateway::llm::LlmGateway;
use jervis_gateway::vector_store::VectorStoreGateway;
use std::collections::HashMap;

/// Looks up the project a plan's context is scoped to. `RAG_SEARCH` and
/// `GIT_LOG_SEARCH` both need this — a `Plan` only carries `context_id`.
fn project_id_for(db: &Db, context_id: i64) -> Result<i64, String> {
    match db.get_context(context_id) {
        Ok(Some((_, Some(project_id)))) => Ok(project_id),
        Ok(Some((_, None))) => Err("context has no associated project".to_string()),
        Ok(None) => Err(format!("context {context_id} not found")),
        Err(e) => Err(e.to_string()),
    }
}

/// `RAG_SEARCH`: embeds the instruction as a query and searches C8 for the
/// plan's project, rendering the top hits as plain text for the next step's
/// context.
pub struct RagSearchTool {
    db: Arc<Db>,
    embeddings: Arc<dyn EmbeddingGateway>,
    vector_store: Arc<dyn VectorStoreGateway>,
    limit: usize,
    min_score: f32,
}

impl RagSearchTool {
    pub fn new(db: Arc<Db>, embeddings: Arc<dyn EmbeddingGateway>, vector_store: Arc<dyn VectorStoreGateway>) -> Self {
        Self { db, embeddings, vector_store, limit: 5, min_score: 0.2 }
    }
}

#[async_trait]
impl PlanTool for RagSearchTool {
    async fn execute(&self, _context: &str, plan: &Plan, instruction: &str, _step: &PlanStep) -> ToolOutcome {
        let project_id = match project_id_for(&self.db, plan.context_id) {
            Ok(id) => id,
            Err(msg) => return ToolOutcome::Error(msg),
        };

        let vector = match self.embeddings.embed(ModelType::Text, instruction).await {
            Ok(v) => v,
            Err(e) => return ToolOutcome::Error(e.to_string()),
        };
        let model_name = self.embeddings.model_name(ModelType::Text).to_string();

        match self.vector_store.search(&model_name, &vector, project_id, self.limit, self.min_score).await {
            Ok(hits) if hits.is_empty() => ToolOutcome::Ok("no matching knowledge found".to_string()),
            Ok(hits) => {
                let rendered = hits
                    .iter()
                    .map(|hit| format!("- ({:.3}) {}", hit.score, hit.document.text))
                    .collect::<Vec<_>>()
                    .join("\n");
                ToolOutcome::Ok(rendered)
            }
            Err(e) => ToolOutcome::Error(e.to_string()),
        }
    }
}

/// `GIT_LOG_SEARCH`: a crude case-insensitive substring match over the
/// project's stored commit history. No full-text index backs this; it's a
/// small-scale convenience over the same table the Git poller populates.
pub struct GitLogSearchTool {
    db: Arc<Db>,
    max_results: usize,
}

impl GitLogSearchTool {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db, max_results: 10 }
    }
}

#[async_trait]
impl PlanTool for GitLogSearchTool {
    async fn execute(&self, _context: &str, plan: &Plan, instruction: &str, _step: &PlanStep) -> ToolOutcome {
        let project_id = match project_id_for(&self.db, plan.context_id) {
            Ok(id) => id,
            Err(msg) => return ToolOutcome::Error(msg),
        };

        let commits = match self.db.list_git_commits_for_project(project_id) {
            Ok(commits) => commits,
            Err(e) => return ToolOutcome::Error(e.to_string()),
        };

        let needle = instruction.to_lowercase();
        let matches: Vec<String> = commits
            .iter()
            .filter(|c| c.message.to_lowercase().contains(&needle) || c.author.to_lowercase().contains(&needle))
            .take(self.max_results)
            .map(|c| format!("{} {} — {}", &c.hash[..c.hash.len().min(8)], c.author, c.message))
            .collect();

        if matches.is_empty() {
            ToolOutcome::Ok("no matching commits found".to_string())
        } else {
            ToolOutcome::Ok(matches.join("\n"))
        }
    }
}

/// `DIALOG_ASK`: hands the instruction to C12 as a proposed-answer prompt
/// and surfaces whatever the user decides as an `Ask` outcome, continuing
/// the plan either way.
pub struct DialogAskTool {
    coordinator: Arc<DialogCoordinator>,
    db: Arc<Db>,
}

impl DialogAskTool {
    pub fn new(coordinator: Arc<DialogCoordinator>, db: Arc<Db>) -> Self {
        Self { coordinator, db }
    }
}

#[async_trait]
impl PlanTool for DialogAskTool {
    async fn execute(&self, _context: &str, plan: &Plan, instruction: &str, step: &PlanStep) -> ToolOutcome {
        let (client_id, project_id) = match self.db.get_context(plan.context_id) {
            Ok(Some(pair)) => pair,
            Ok(None) => return ToolOutcome::Error(format!("context {} not found", plan.context_id)),
            Err(e) => return ToolOutcome::Error(e.to_string()),
        };

        let correlation_id = format!("plan-{}-step-{}", plan.id, step.id);
        let result = self.coordinator.request_dialog(client_id, project_id, &correlation_id, instruction, None).await;

        if result.closed_by_user {
            ToolOutcome::Ask("dialog closed by user without an answer".to_string())
        } else {
            ToolOutcome::Ask(result.answer.unwrap_or_default())
        }
    }
}

/// `FINALIZER`: renders a terminal plan's answer via the LLM gateway in
/// `plan.original_language`, folding in every completed step's result.
pub struct LlmAnswerRenderer<G: LlmGateway> {
    gateway: G,
}

impl<G: LlmGateway> LlmAnswerRenderer<G> {
    pub fn new(gateway: G) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl<G: LlmGateway> AnswerRenderer for LlmAnswerRenderer<G> {
    async fn render_final_answer(&self, plan: &Plan) -> anyhow::Result<String> {
        let step_results = plan
            .steps
            .iter()
            .map(|s| format!("[{}] {}", s.tool_name, s.tool_result.as_deref().unwrap_or("")))
            .collect::<Vec<_>>()
            .join("\n");

        let mut mapping_values = HashMap::new();
        mapping_values.insert("language".to_string(), plan.original_language.clone());
        mapping_values.insert(
            "code".to_string(),
            format!("Question: {}\n\nStep results:\n{step_results}", plan.english_question),
        );

        let schema = serde_json::json!({
            "type": "object",
            "required": ["summary"],
            "properties": { "summary": { "type": "string" } }
        });

        let result = self
            .gateway
            .call_llm("finalize_answer", &schema, false, &mapping_values, Some(&plan.original_language), false)
            .await?;
        let answer = result
            .get("summary")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("finalizer response missing \"summary\""))?;
        Ok(answer.to_string())
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Connection & Credential Store (C1) ───────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    Basic,
    Bearer,
    Oauth2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Valid,
    Invalid,
}

/// Source kind a `Connection` speaks to. Drives which polling handler (C5)
/// and external source client (C2) are paired with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    Git,
    IssueTracker,
    Wiki,
    Mail,
    Chat,
}

/// `{id, kind, baseUrl, authType, credentials…, state}`.
///
/// Invariant: any authentication failure observed by C2 transitions
/// `state -> Invalid`; subsequent polls skip the connection until an
/// out-of-band action restores it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: i64,
    pub client_id: i64,
    pub kind: ConnectionKind,
    pub base_url: String,
    pub auth_type: AuthType,
    /// Basic: "user:pass". Bearer/OAuth2: the token. Never logged verbatim.
    pub credentials: String,
    pub state: ConnectionState,
}

// ── PollingState ──────────────────────────────────────────────────────────

/// `{connectionId, tool, lastSeenUpdatedAt, lastPolledAt}`, keyed by
/// `(connectionId, tool)`. Updated only after a successful poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingState {
    pub connection_id: i64,
    pub tool: String,
    pub last_seen_updated_at: Option<DateTime<Utc>>,
    pub last_polled_at: Option<DateTime<Utc>>,
}

// ── Durable Work Queue (C3) ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemState {
    New,
    InProgress,
    Indexed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemKind {
    GitCommit,
    Issue,
    WikiPage,
    MailMessage,
    ChatMessage,
    LinkedUrl,
}

/// `{taskId, sourceUrn (unique), clientId, projectId?, kind, state, attempts,
/// priority, createdAt, lastAttemptAt, workerId?, error?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub task_id: i64,
    /// Globally unique within a source; the idempotency key for `enqueue`.
    pub source_urn: String,
    pub client_id: i64,
    pub project_id: Option<i64>,
    pub kind: WorkItemKind,
    pub state: WorkItemState,
    pub attempts: i64,
    pub max_attempts: i64,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub error: Option<String>,
    /// Raw payload carried with the item (issue JSON, commit line, etc.).
    pub payload: String,
}

// ── Git source (C2/C5) ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitCommitState {
    New,
    Indexed,
    Failed,
}

/// `{clientId, projectId, branch, hash (unique per project+branch), author,
/// message, commitDate, state, attempts}`. Branches never mix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitCommitRecord {
    pub client_id: i64,
    pub project_id: i64,
    pub branch: String,
    pub hash: String,
    pub author: String,
    pub message: String,
    pub commit_date: DateTime<Utc>,
    pub state: GitCommitState,
    pub attempts: i64,
}

// ── Indexing-Status Ledger (C7) ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexingState {
    Indexed,
    Failed,
    InProgress,
}

/// One vector written for a file, tracked so a later re-index can delete
/// exactly the stale set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorContentEntry {
    pub vector_id: String,
    pub content_hash: String,
    pub len: usize,
    pub description: String,
}

/// `{projectId, filePath, gitCommitHash, vectorIds[], contents[], state,
/// updatedAt}`. Exactly one record per `(projectId, filePath)`; a successful
/// re-index replaces `contents[]` atomically (see C7 §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingStatus {
    pub project_id: i64,
    pub file_path: String,
    pub git_commit_hash: String,
    pub contents: Vec<VectorContentEntry>,
    pub state: IndexingState,
    pub updated_at: DateTime<Utc>,
}

impl IndexingStatus {
    pub fn vector_ids(&self) -> Vec<&str> {
        self.contents.iter().map(|c| c.vector_id.as_str()).collect()
    }
}

// ── Symbols / Analysis (C6 stage P1-P2) ───────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolType {
    Namespace,
    Class,
    Method,
    Function,
    Field,
    Variable,
    Parameter,
    Call,
    Import,
    File,
    Module,
    Package,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Symbol {
    pub symbol_type: SymbolType,
    pub full_name: String,
    pub signature: Option<String>,
    pub line_start: u32,
    pub line_end: u32,
    pub node_id: String,
    pub language: String,
    pub code: Option<String>,
    pub parent_class: Option<String>,
}

impl Symbol {
    /// `(filePath, type, name, lineStart, lineEnd)` identity used for
    /// skip/replace decisions (§4.4 Idempotence).
    pub fn identity_key(&self, file_path: &str) -> String {
        format!(
            "{file_path}::{:?}::{}::{}::{}",
            self.symbol_type, self.full_name, self.line_start, self.line_end
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisItem {
    pub file_path: String,
    pub symbol: Symbol,
    pub project_id: i64,
    pub worker_id: String,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Code,
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingItem {
    pub analysis_item: AnalysisItem,
    pub content: String,
    pub vector: Vec<f32>,
    pub model_type: ModelType,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub processing_ms: u64,
}

/// Closed enumeration of pipeline progress steps (§9 open question: the
/// original reports everything under a fixed "code_files" step; this
/// enumeration replaces that with a real closed set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    Discovery,
    CodeFiles,
    TextSummary,
    ClassAnalysis,
    Embedding,
    Storage,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    Progress { project_id: i64, step: PipelineStep, message: String },
    FileCompleted { project_id: i64, file_path: String, vector_count: usize },
    RunCompleted { project_id: i64, files_indexed: usize },
    RunFailed { project_id: i64, error: String },
}

// ── RagDocument (vector store payload) ────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Joern,
    FileDescription,
    Commit,
    Wiki,
    Email,
    Rule,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeMeta {
    pub id: String,
    #[serde(rename = "type")]
    pub knowledge_type: String,
    pub severity: String,
    pub tags: Vec<String>,
}

/// The payload written to the vector store. `(projectId, path, symbolKey)`
/// together form the logical identity used for idempotent replacement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagDocument {
    pub client_id: i64,
    pub project_id: i64,
    pub source_type: SourceType,
    pub text: String,
    pub path: Option<String>,
    pub language: Option<String>,
    pub class_name: Option<String>,
    pub method_name: Option<String>,
    pub symbol_type: Option<SymbolType>,
    pub line_start: Option<u32>,
    pub line_end: Option<u32>,
    pub knowledge: Option<KnowledgeMeta>,
    pub git_commit_hash: Option<String>,
    pub chunk_id: Option<u32>,
    pub chunk_of: Option<u32>,
}

// ── Plan / PlanStep (C10) ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Finalized,
}

impl PlanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PlanStatus::Completed | PlanStatus::Failed | PlanStatus::Finalized)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: i64,
    pub order: u32,
    pub tool_name: String,
    pub instruction: String,
    pub status: StepStatus,
    pub tool_result: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: i64,
    pub context_id: i64,
    pub status: PlanStatus,
    pub original_question: String,
    pub english_question: String,
    pub original_language: String,
    pub steps: Vec<PlanStep>,
    pub context_summary: Option<String>,
    pub final_answer: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    pub fn next_pending_step(&self) -> Option<&PlanStep> {
        let mut pending: Vec<&PlanStep> = self.steps.iter().filter(|s| s.status == StepStatus::Pending).collect();
        pending.sort_by_key(|s| s.order);
        pending.into_iter().next()
    }
}

/// Result a plan tool returns for one step (§4.8).
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    Ok(String),
    Ask(String),
    Error(String),
    Stop(String),
}

// ── User-Dialog Coordinator (C12) ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogResult {
    pub accepted: bool,
    pub answer: Option<String>,
    pub closed_by_user: bool,
}

// ── Cross-Indexer Link Queue (C11) ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkQueueEntry {
    pub url: String,
    pub client_id: i64,
    pub project_id: Option<i64>,
    pub source_indexer: String,
    pub source_ref: String,
    pub attempts: u32,
    pub first_seen_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_status_terminal_classification() {
        assert!(PlanStatus::Completed.is_terminal());
        assert!(PlanStatus::Failed.is_terminal());
        assert!(PlanStatus::Finalized.is_terminal());
        assert!(!PlanStatus::Pending.is_terminal());
        assert!(!PlanStatus::Running.is_terminal());
    }

    #[test]
    fn plan_next_pending_step_respects_order() {
        let plan = Plan {
            id: 1,
            context_id: 1,
            status: PlanStatus::Running,
            original_question: String::new(),
            english_question: String::new(),
            original_language: "en".into(),
            steps: vec![
                PlanStep { id: 2, order: 2, tool_name: "b".into(), instruction: String::new(), status: StepStatus::Pending, tool_result: None },
                PlanStep { id: 1, order: 1, tool_name: "a".into(), instruction: String::new(), status: StepStatus::Done, tool_result: Some("ok".into()) },
            ],
            context_summary: None,
            final_answer: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let next = plan.next_pending_step().unwrap();
        assert_eq!(next.order, 2);
    }

    #[test]
    fn symbol_identity_key_includes_line_range() {
        let s = Symbol {
            symbol_type: SymbolType::Method,
            full_name: "Foo.bar".into(),
            signature: None,
            line_start: 10,
            line_end: 20,
            node_id: "n1".into(),
            language: "kotlin".into(),
            code: Some("fun bar() {}".into()),
            parent_class: Some("Foo".into()),
        };
        let key = s.identity_key("src/Foo.kt");
        assert!(key.contains("src/Foo.kt"));
        assert!(key.contains("Foo.bar"));
        assert!(key.contains("10"));
        assert!(key.contains("20"));
    }
}

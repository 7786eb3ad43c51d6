mod logging;
mod routes;
mod tools;

use std::{collections::VecDeque, sync::Arc, time::Duration, time::Instant};

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use jervis_core::analyzer::GitSymbolExtractor;
use jervis_core::config::Config;
use jervis_core::db::Db;
use jervis_core::dialog::DialogCoordinator;
use jervis_core::link_queue::LinkQueue;
use jervis_core::pipeline::{IndexingPipeline, PipelineConfig};
use jervis_core::plan::{AnswerRenderer, PlanExecutor, PlanTool};
use jervis_core::poller::{run_poller, PollerConfig};
use jervis_core::stream::IndexEventStreamManager;
use jervis_gateway::embeddings::{EmbeddingModelConfig, HttpEmbeddingGateway};
use jervis_gateway::llm::{ApiKind, HttpLlmGateway, LlmCandidate, PipelineSummarizer};
use jervis_gateway::vector_store::HttpVectorStoreGateway;
use jervis_sources::chat::ChatHandler;
use jervis_sources::git::GitHandler;
use jervis_sources::issue_tracker::IssueTrackerHandler;
use jervis_sources::mail::MailHandler;
use jervis_sources::wiki::WikiHandler;
use std::collections::HashMap;
use tokio::sync::{broadcast, Notify};
use tower_http::cors::CorsLayer;
use tracing::info;

use tools::{DialogAskTool, GitLogSearchTool, LlmAnswerRenderer, RagSearchTool};

/// Maps `Config::tools_enabled` keys (operator-facing names) onto the
/// tool-registry keys the plan executor dispatches on.
const TOOL_NAME_MAP: &[(&str, &str)] = &[
    ("search_knowledge_base", "RAG_SEARCH"),
    ("search_git_log", "GIT_LOG_SEARCH"),
    ("ask_user", "DIALOG_ASK"),
];

fn convert_llm_candidate(c: &jervis_core::config::LlmCandidate) -> LlmCandidate {
    let api_kind = if c.api_kind.eq_ignore_ascii_case("ollama") {
        ApiKind::Ollama
    } else {
        ApiKind::OpenAiCompatible
    };
    LlmCandidate {
        name: c.name.clone(),
        base_url: c.base_url.clone(),
        context_window: c.context_window as usize,
        api_kind,
    }
}

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub db: Arc<Db>,
    pub config: Arc<Config>,
    pub start_time: Instant,
    pub log_tx: broadcast::Sender<String>,
    pub log_ring: Arc<std::sync::Mutex<VecDeque<String>>>,
    pub index_events: Arc<IndexEventStreamManager>,
    pub pipeline: Arc<IndexingPipeline>,
    pub plan_executor: Arc<PlanExecutor>,
    pub answer_renderer: Arc<dyn AnswerRenderer>,
    pub llm: Arc<HttpLlmGateway>,
    pub embeddings: Arc<HttpEmbeddingGateway>,
    pub dialog: Arc<DialogCoordinator>,
    pub link_queue: Arc<LinkQueue>,
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let (log_tx, _log_rx) = broadcast::channel::<String>(1024);
    let log_ring: Arc<std::sync::Mutex<VecDeque<String>>> =
        Arc::new(std::sync::Mutex::new(VecDeque::with_capacity(500)));

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "jervis_server=info,jervis_core=info,jervis_gateway=info,jervis_sources=info,tower_http=warn".into()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(logging::BroadcastLayer {
            tx: log_tx.clone(),
            ring: Arc::clone(&log_ring),
        })
        .init();

    let config = Config::from_env()?;

    std::fs::create_dir_all(&config.data_dir)?;
    let mut db = Db::open(&config.sqlite_path)?;
    db.migrate()?;
    let db = Arc::new(db);
    let config = Arc::new(config);

    let link_queue = Arc::new(LinkQueue::new(3));
    let (dialog, mut dialog_request_rx, mut dialog_closed_rx) =
        DialogCoordinator::new(Duration::from_secs(config.dialog_timeout_s));

    // Forward dialog-coordinator traffic onto the log stream so the UI has a
    // single place to see a dialog go active and then close.
    {
        let log_tx = log_tx.clone();
        tokio::spawn(async move {
            while let Some(req) = dialog_request_rx.recv().await {
                let data = serde_json::json!({
                    "type": "dialog_request",
                    "dialog_id": req.dialog_id,
                    "correlation_id": req.correlation_id,
                    "question": req.question,
                })
                .to_string();
                let _ = log_tx.send(data);
            }
        });
    }
    {
        let log_tx = log_tx.clone();
        tokio::spawn(async move {
            while let Some(closed) = dialog_closed_rx.recv().await {
                let data = serde_json::json!({
                    "type": "dialog_closed",
                    "dialog_id": closed.dialog_id,
                    "correlation_id": closed.correlation_id,
                })
                .to_string();
                let _ = log_tx.send(data);
            }
        });
    }

    let llm_candidates: Vec<LlmCandidate> = config.llm_candidates.iter().map(convert_llm_candidate).collect();
    let llm = Arc::new(HttpLlmGateway::new(llm_candidates));

    let embeddings = Arc::new(HttpEmbeddingGateway::new(
        EmbeddingModelConfig { model_name: config.code_embedding_model.clone(), base_url: config.code_embedding_base_url.clone() },
        EmbeddingModelConfig { model_name: config.text_embedding_model.clone(), base_url: config.text_embedding_base_url.clone() },
    ));

    let vector_store = Arc::new(HttpVectorStoreGateway::new(config.vector_store_base_url.clone()));

    let summarizer = Arc::new(PipelineSummarizer::new(Arc::clone(&llm), 2_000));

    let extractor = Arc::new(GitSymbolExtractor::new(config.data_dir.clone(), "pipeline-worker-0"));

    let pipeline = Arc::new(IndexingPipeline::new(
        Arc::clone(&db),
        extractor,
        Arc::clone(&embeddings) as Arc<dyn jervis_core::pipeline::EmbeddingGateway>,
        summarizer,
        Arc::clone(&vector_store) as Arc<dyn jervis_core::pipeline::VectorStoreGateway>,
        PipelineConfig {
            channel_capacity: config.pipeline_channel_capacity,
            storage_workers: config.pipeline_storage_workers,
        },
    ));

    let index_events = IndexEventStreamManager::new();
    {
        let index_events = Arc::clone(&index_events);
        let mut rx = pipeline.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => index_events.publish(event).await,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
        });
    }

    // C4 poller-framework tasks — one per connection kind. The cancel
    // notify is retained for a future graceful-shutdown path; nothing
    // triggers it today, matching the teacher's run-until-killed model.
    let cancel = Arc::new(Notify::new());
    {
        let handler = Arc::new(GitHandler::new(Arc::clone(&db), config.data_dir.clone(), Arc::clone(&link_queue)));
        let poller_config = PollerConfig {
            polling_interval_ms: config.git_poller.polling_interval_ms,
            initial_delay_ms: config.git_poller.initial_delay_ms,
            cycle_delay_ms: config.git_poller.cycle_delay_ms,
        };
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move { run_poller(handler, poller_config, cancel).await });
    }
    {
        let handler = Arc::new(IssueTrackerHandler::new(Arc::clone(&db)));
        let poller_config = PollerConfig {
            polling_interval_ms: config.issue_tracker_poller.polling_interval_ms,
            initial_delay_ms: config.issue_tracker_poller.initial_delay_ms,
            cycle_delay_ms: config.issue_tracker_poller.cycle_delay_ms,
        };
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move { run_poller(handler, poller_config, cancel).await });
    }
    {
        let handler = Arc::new(WikiHandler::new(Arc::clone(&db)));
        let poller_config = PollerConfig {
            polling_interval_ms: config.wiki_poller.polling_interval_ms,
            initial_delay_ms: config.wiki_poller.initial_delay_ms,
            cycle_delay_ms: config.wiki_poller.cycle_delay_ms,
        };
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move { run_poller(handler, poller_config, cancel).await });
    }
    {
        let handler = Arc::new(MailHandler::new(Arc::clone(&db)));
        let poller_config = PollerConfig {
            polling_interval_ms: config.mail_poller.polling_interval_ms,
            initial_delay_ms: config.mail_poller.initial_delay_ms,
            cycle_delay_ms: config.mail_poller.cycle_delay_ms,
        };
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move { run_poller(handler, poller_config, cancel).await });
    }
    {
        let handler = Arc::new(ChatHandler::new(Arc::clone(&db)));
        let poller_config = PollerConfig {
            polling_interval_ms: config.chat_poller.polling_interval_ms,
            initial_delay_ms: config.chat_poller.initial_delay_ms,
            cycle_delay_ms: config.chat_poller.cycle_delay_ms,
        };
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move { run_poller(handler, poller_config, cancel).await });
    }

    // C10 tool registry, gated by Config::tools_enabled.
    let mut tools: HashMap<String, Arc<dyn PlanTool>> = HashMap::new();
    let tool_enabled = |operator_name: &str| config.tools_enabled.get(operator_name).copied().unwrap_or(true);
    for (operator_name, registry_key) in TOOL_NAME_MAP {
        if !tool_enabled(operator_name) {
            continue;
        }
        match *registry_key {
            "RAG_SEARCH" => {
                tools.insert(
                    "RAG_SEARCH".to_string(),
                    Arc::new(RagSearchTool::new(
                        Arc::clone(&db),
                        Arc::clone(&embeddings) as Arc<dyn jervis_core::pipeline::EmbeddingGateway>,
                        Arc::clone(&vector_store) as Arc<dyn jervis_gateway::vector_store::VectorStoreGateway>,
                    )),
                );
            }
            "GIT_LOG_SEARCH" => {
                tools.insert("GIT_LOG_SEARCH".to_string(), Arc::new(GitLogSearchTool::new(Arc::clone(&db))));
            }
            "DIALOG_ASK" => {
                tools.insert("DIALOG_ASK".to_string(), Arc::new(DialogAskTool::new(Arc::clone(&dialog), Arc::clone(&db))));
            }
            _ => {}
        }
    }

    let plan_executor = Arc::new(PlanExecutor::new(Arc::clone(&db), tools));
    let answer_renderer: Arc<dyn AnswerRenderer> = Arc::new(LlmAnswerRenderer::new(Arc::clone(&llm)));

    // Finalization sweep: renders terminal plans' answers on a short tick,
    // independent of the pipeline tick.
    {
        let plan_executor = Arc::clone(&plan_executor);
        let answer_renderer = Arc::clone(&answer_renderer);
        tokio::spawn(async move {
            loop {
                let executor = Arc::clone(&plan_executor);
                let renderer = Arc::clone(&answer_renderer);
                let handle = tokio::spawn(async move { executor.finalize_pending(renderer.as_ref()).await });
                match handle.await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::error!("finalize_pending error: {e}"),
                    Err(join_err) => tracing::error!("finalize_pending panicked: {join_err}"),
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
    }

    // Indexing-pipeline supervisor: sweeps every known project on a fixed
    // tick, in addition to the on-demand `/index/reindex` path. A project
    // with no local working copy yet (no clone has landed under
    // `{data_dir}/repos/{id}`) is skipped for this tick and picked up once
    // the Git poller (C5) has cloned it.
    {
        let db = Arc::clone(&db);
        let pipeline = Arc::clone(&pipeline);
        let data_dir = config.data_dir.clone();
        let tick = Duration::from_secs(config.pipeline_tick_s);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(tick).await;
                let projects = match db.list_projects() {
                    Ok(projects) => projects,
                    Err(e) => {
                        tracing::error!("pipeline supervisor: list_projects failed: {e}");
                        continue;
                    }
                };
                for (project_id, client_id) in projects {
                    let repo_dir = jervis_core::git::project_repo_dir(&data_dir, project_id);
                    let git = jervis_core::git::Git::new(repo_dir);
                    let commit_hash = match git.default_branch().and_then(|b| git.rev_parse_head(&b)) {
                        Ok(hash) => hash,
                        Err(_) => continue,
                    };
                    if let Err(e) = pipeline.run(client_id, project_id, &commit_hash).await {
                        tracing::error!(project_id, "pipeline supervisor tick failed: {e}");
                    }
                }
            }
        });
    }

    let state = Arc::new(AppState {
        db,
        config: Arc::clone(&config),
        start_time: Instant::now(),
        log_tx,
        log_ring,
        index_events,
        pipeline,
        plan_executor,
        answer_renderer,
        llm,
        embeddings,
        dialog,
        link_queue,
    });

    let app = Router::new()
        .route("/health", get(routes::health))
        .route("/completions", post(routes::completions))
        .route("/chat/completions", post(routes::chat_completions))
        .route("/embeddings", post(routes::embeddings))
        .route("/api/projects/:id/index/reindex", post(routes::reindex_project))
        .route("/api/clients/:id/projects", post(routes::create_project))
        .route(
            "/api/internal/kb-progress",
            post(routes::kb_progress).layer(DefaultBodyLimit::max(10 * 1024 * 1024)),
        )
        .route("/api/logs/stream", get(routes::sse_logs))
        .route("/api/index/events", get(routes::sse_index_events))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let bind = config.web_bind.clone();
    let port = config.web_port;
    let addr = format!("{bind}:{port}");

    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

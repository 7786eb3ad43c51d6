use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{info, warn};

use crate::db::Db;
use crate::types::{
    AnalysisItem, EmbeddingItem, ModelType, PipelineEvent, PipelineStep, RagDocument, SourceType,
    Symbol, SymbolType, VectorContentEntry,
};

/// Stage P1 hook: streams `AnalysisItem`s for a project's working tree as
/// they are parsed, one static-analyzer pass per language, never
/// materializing the full symbol tree in memory.
#[async_trait]
pub trait SymbolExtractor: Send + Sync {
    async fn discover(&self, project_id: i64, tx: mpsc::Sender<AnalysisItem>) -> Result<()>;
}

/// Stage P3 code/text embedding hook (C9-backed).
#[async_trait]
pub trait EmbeddingGateway: Send + Sync {
    async fn embed(&self, model_type: ModelType, text: &str) -> Result<Vec<f32>>;
    /// Model name feeding the C8 collection-naming convention
    /// (`jervis_{modelName}_dim{N}`).
    fn model_name(&self, model_type: ModelType) -> &str;
}

/// Stage P3 class-analysis hook: an LLM call (C9) that renders a class (or
/// method) summary, pre-split into embeddable chunks.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, prompt_type: &str, symbol: &Symbol) -> Result<Vec<String>>;
}

/// Stage P4 hook (C8). Collection identity is `(modelName, dimension)`; the
/// gateway owns creating/naming it on demand.
#[async_trait]
pub trait VectorStoreGateway: Send + Sync {
    async fn upsert(&self, model_name: &str, document: &RagDocument, vector: &[f32]) -> Result<String>;
    async fn delete_by_filter(&self, project_id: i64, path: &str) -> Result<usize>;
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub channel_capacity: usize,
    pub storage_workers: usize,
}

fn symbol_content_hash(symbol: &Symbol) -> String {
    let basis = symbol.code.as_deref().unwrap_or(&symbol.full_name);
    let mut hasher = Sha256::new();
    hasher.update(basis.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// By `symbol.type`, which downstream lanes (code-embedding, text-summary,
/// class-analysis) a symbol is routed to (§4.4 Stage P2 routing table).
fn route(symbol_type: SymbolType) -> (bool, bool, bool) {
    match symbol_type {
        SymbolType::Method | SymbolType::Function => (true, true, false),
        SymbolType::Class => (false, false, true),
        SymbolType::Field | SymbolType::Variable | SymbolType::Parameter => (true, false, false),
        _ => (false, false, false),
    }
}

struct RoutedItem {
    analysis_item: AnalysisItem,
}

/// Per-file bookkeeping while a run is in flight: how many units were
/// dispatched for this file and how many have reported back, so C7 is only
/// marked `INDEXED` once every vector for the file has been written (§5
/// ordering guarantee ii).
struct FileAccumulator {
    project_id: i64,
    expected_units: usize,
    completed_units: usize,
    contents: Vec<VectorContentEntry>,
}

type Accumulators = Arc<Mutex<HashMap<String, FileAccumulator>>>;

/// Builds the `RagDocument` payload for a symbol (§4.6 C8 payload shape).
fn build_document(client_id: i64, item: &AnalysisItem, content: &str, chunk_index: u32, total_chunks: u32, commit_hash: &str) -> RagDocument {
    RagDocument {
        client_id,
        project_id: item.project_id,
        source_type: SourceType::Joern,
        text: content.to_string(),
        path: Some(item.file_path.clone()),
        language: Some(item.symbol.language.clone()),
        class_name: item.symbol.parent_class.clone(),
        method_name: Some(item.symbol.full_name.clone()),
        symbol_type: Some(item.symbol.symbol_type),
        line_start: Some(item.symbol.line_start),
        line_end: Some(item.symbol.line_end),
        knowledge: None,
        git_commit_hash: Some(commit_hash.to_string()),
        chunk_id: if total_chunks > 1 { Some(chunk_index) } else { None },
        chunk_of: if total_chunks > 1 { Some(total_chunks) } else { None },
    }
}

/// A bounded producer-consumer graph over four stages: discovery /
/// symbol-extraction, splitting (with the C7 skip/replace decision),
/// parallel embedding lanes, and a fixed storage-worker pool (§4.4 C6).
pub struct IndexingPipeline {
    db: Arc<Db>,
    extractor: Arc<dyn SymbolExtractor>,
    embeddings: Arc<dyn EmbeddingGateway>,
    summarizer: Arc<dyn Summarizer>,
    vector_store: Arc<dyn VectorStoreGateway>,
    config: PipelineConfig,
    events: broadcast::Sender<PipelineEvent>,
}

impl IndexingPipeline {
    pub fn new(
        db: Arc<Db>,
        extractor: Arc<dyn SymbolExtractor>,
        embeddings: Arc<dyn EmbeddingGateway>,
        summarizer: Arc<dyn Summarizer>,
        vector_store: Arc<dyn VectorStoreGateway>,
        config: PipelineConfig,
    ) -> Self {
        let (events, _rx) = broadcast::channel(512);
        Self { db, extractor, embeddings, summarizer, vector_store, config, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: PipelineEvent) {
        let _ = self.events.send(event);
    }

    /// Runs one full pass for `project_id` at `commit_hash`: discover,
    /// split, embed, store. Cancellation-safe: dropping the returned future
    /// stops every stage at its next channel operation (§5).
    pub async fn run(&self, client_id: i64, project_id: i64, commit_hash: &str) -> Result<()> {
        self.emit(PipelineEvent::Progress { project_id, step: PipelineStep::Discovery, message: "starting discovery".into() });

        let (discover_tx, discover_rx) = mpsc::channel::<AnalysisItem>(self.config.channel_capacity);
        let (code_tx, code_rx) = mpsc::channel::<RoutedItem>(self.config.channel_capacity);
        let (text_tx, text_rx) = mpsc::channel::<RoutedItem>(self.config.channel_capacity);
        let (class_tx, class_rx) = mpsc::channel::<RoutedItem>(self.config.channel_capacity);
        let (embed_tx, embed_rx) = mpsc::channel::<EmbeddingItem>(self.config.channel_capacity);

        let accumulators: Accumulators = Arc::new(Mutex::new(HashMap::new()));

        let extractor = self.extractor.clone();
        let discovery_task = tokio::spawn(async move { extractor.discover(project_id, discover_tx).await });

        let split_task = {
            let db = self.db.clone();
            let accumulators = accumulators.clone();
            let events = self.events.clone();
            let vector_store = self.vector_store.clone();
            tokio::spawn(async move {
                split_stage(db, vector_store, events, discover_rx, code_tx, text_tx, class_tx, accumulators, project_id).await
            })
        };

        let code_lane = {
            let embeddings = self.embeddings.clone();
            let embed_tx = embed_tx.clone();
            tokio::spawn(async move { code_lane(embeddings, code_rx, embed_tx).await })
        };
        let text_lane = {
            let embeddings = self.embeddings.clone();
            let summarizer = self.summarizer.clone();
            let embed_tx = embed_tx.clone();
            tokio::spawn(async move { text_lane(embeddings, summarizer, text_rx, embed_tx, "method_summary").await })
        };
        let class_lane = {
            let embeddings = self.embeddings.clone();
            let summarizer = self.summarizer.clone();
            tokio::spawn(async move { text_lane(embeddings, summarizer, class_rx, embed_tx, "class_summary").await })
        };

        let storage_rx = Arc::new(Mutex::new(embed_rx));
        let mut storage_workers = Vec::with_capacity(self.config.storage_workers);
        for _ in 0..self.config.storage_workers {
            let vector_store = self.vector_store.clone();
            let db = self.db.clone();
            let events = self.events.clone();
            let accumulators = accumulators.clone();
            let rx = storage_rx.clone();
            let client_id = client_id;
            let commit_hash = commit_hash.to_string();
            storage_workers.push(tokio::spawn(async move {
                storage_worker(client_id, vector_store, db, events, rx, accumulators, &commit_hash).await
            }));
        }

        discovery_task.await.context("discovery task panicked")??;
        split_task.await.context("split task panicked")??;
        code_lane.await.context("code lane panicked")??;
        text_lane.await.context("text lane panicked")??;
        class_lane.await.context("class lane panicked")??;
        for worker in storage_workers {
            worker.await.context("storage worker panicked")??;
        }

        let files_indexed = accumulators.lock().await.len();
        self.emit(PipelineEvent::RunCompleted { project_id, files_indexed });
        info!(project_id, files_indexed, "indexing pipeline run completed");
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn split_stage(
    db: Arc<Db>,
    vector_store: Arc<dyn VectorStoreGateway>,
    events: broadcast::Sender<PipelineEvent>,
    mut rx: mpsc::Receiver<AnalysisItem>,
    code_tx: mpsc::Sender<RoutedItem>,
    text_tx: mpsc::Sender<RoutedItem>,
    class_tx: mpsc::Sender<RoutedItem>,
    accumulators: Accumulators,
    project_id: i64,
) -> Result<()> {
    let mut deleted_files: HashSet<String> = HashSet::new();

    while let Some(item) = rx.recv().await {
        let (wants_code, wants_text, wants_class) = route(item.symbol.symbol_type);
        if !wants_code && !wants_text && !wants_class {
            continue;
        }

        let existing = db.get_indexing_status(item.project_id, &item.file_path).ok().flatten();
        let symbol_key = item.symbol.identity_key(&item.file_path);
        let content_hash = symbol_content_hash(&item.symbol);
        let unchanged = existing
            .as_ref()
            .and_then(|status| status.contents.iter().find(|c| c.description == symbol_key))
            .is_some_and(|entry| entry.content_hash == content_hash);

        {
            let mut acc = accumulators.lock().await;
            let entry = acc.entry(item.file_path.clone()).or_insert_with(|| FileAccumulator {
                project_id: item.project_id,
                expected_units: 0,
                completed_units: 0,
                contents: Vec::new(),
            });

            if unchanged {
                // Carry the untouched vector forward without re-embedding.
                if let Some(prior) = existing
                    .as_ref()
                    .and_then(|status| status.contents.iter().find(|c| c.description == symbol_key))
                {
                    entry.contents.push(prior.clone());
                }
                continue;
            }
        }

        // First new/changed symbol seen for this file this run: clear the
        // prior vector set exactly once, right before the first write. An
        // all-unchanged file never reaches this line, so it never deletes
        // vectors the ledger still claims to own.
        if deleted_files.insert(item.file_path.clone()) {
            if let Err(e) = db.start_indexing(item.project_id, &item.file_path) {
                warn!(file_path = %item.file_path, error = %e, "failed to mark file as indexing in progress");
            }
            if let Err(e) = vector_store.delete_by_filter(item.project_id, &item.file_path).await {
                warn!(file_path = %item.file_path, error = %e, "failed to clear prior vectors before reindex");
            }
        }

        // A symbol may fan out to more than one lane (a METHOD/FUNCTION
        // needs both a code-embedding vector and a text-summary vector), so
        // each applicable lane gets its own dispatch and its own unit of
        // `expected_units` rather than a single either/or send.
        let mut units_dispatched = 0usize;
        if wants_code && code_tx.send(RoutedItem { analysis_item: item.clone() }).await.is_ok() {
            units_dispatched += 1;
        }
        if wants_text && text_tx.send(RoutedItem { analysis_item: item.clone() }).await.is_ok() {
            units_dispatched += 1;
        }
        if wants_class && class_tx.send(RoutedItem { analysis_item: item.clone() }).await.is_ok() {
            units_dispatched += 1;
        }

        let mut acc = accumulators.lock().await;
        if let Some(entry) = acc.get_mut(&item.file_path) {
            entry.expected_units += units_dispatched;
        }
        drop(acc);

        let _ = events.send(PipelineEvent::Progress {
            project_id,
            step: PipelineStep::CodeFiles,
            message: format!("routed {}", symbol_key),
        });
    }
    Ok(())
}

async fn code_lane(
    embeddings: Arc<dyn EmbeddingGateway>,
    mut rx: mpsc::Receiver<RoutedItem>,
    tx: mpsc::Sender<EmbeddingItem>,
) -> Result<()> {
    while let Some(routed) = rx.recv().await {
        let Some(code) = routed.analysis_item.symbol.code.clone().filter(|c| !c.is_empty()) else {
            continue;
        };
        let started = std::time::Instant::now();
        let vector = match embeddings.embed(ModelType::Code, &code).await {
            Ok(v) => v,
            Err(e) => {
                warn!(file_path = %routed.analysis_item.file_path, error = %e, "code embedding failed, symbol skipped");
                continue;
            }
        };
        let _ = tx
            .send(EmbeddingItem {
                analysis_item: routed.analysis_item,
                content: code,
                vector,
                model_type: ModelType::Code,
                chunk_index: 0,
                total_chunks: 1,
                processing_ms: started.elapsed().as_millis() as u64,
            })
            .await;
    }
    Ok(())
}

/// Shared shape for the text-summary and class-analysis lanes: call the LLM
/// gateway for summary chunks, then embed each chunk.
async fn text_lane(
    embeddings: Arc<dyn EmbeddingGateway>,
    summarizer: Arc<dyn Summarizer>,
    mut rx: mpsc::Receiver<RoutedItem>,
    tx: mpsc::Sender<EmbeddingItem>,
    prompt_type: &'static str,
) -> Result<()> {
    while let Some(routed) = rx.recv().await {
        let started = std::time::Instant::now();
        let chunks = match summarizer.summarize(prompt_type, &routed.analysis_item.symbol).await {
            Ok(chunks) if !chunks.is_empty() => chunks,
            Ok(_) => continue,
            Err(e) => {
                warn!(file_path = %routed.analysis_item.file_path, error = %e, "{prompt_type} summarization failed, symbol skipped");
                continue;
            }
        };
        let total = chunks.len() as u32;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let vector = match embeddings.embed(ModelType::Text, &chunk).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(file_path = %routed.analysis_item.file_path, error = %e, "text embedding failed, chunk skipped");
                    continue;
                }
            };
            let _ = tx
                .send(EmbeddingItem {
                    analysis_item: routed.analysis_item.clone(),
                    content: chunk,
                    vector,
                    model_type: ModelType::Text,
                    chunk_index: i as u32,
                    total_chunks: total,
                    processing_ms: started.elapsed().as_millis() as u64,
                })
                .await;
        }
    }
    Ok(())
}

/// Stage P4: the fixed storage-worker pool. Workers share one receiver
/// (guarded by a mutex) so the pool behaves as a true work queue instead of
/// round-robin fan-out, matching the bounded-channel backpressure model of
/// §4.4.
async fn storage_worker(
    client_id: i64,
    vector_store: Arc<dyn VectorStoreGateway>,
    db: Arc<Db>,
    events: broadcast::Sender<PipelineEvent>,
    rx: Arc<Mutex<mpsc::Receiver<EmbeddingItem>>>,
    accumulators: Accumulators,
    commit_hash: &str,
) -> Result<()> {
    loop {
        let item = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        let Some(item) = item else { break };

        let project_id = item.analysis_item.project_id;
        let file_path = item.analysis_item.file_path.clone();
        let symbol_key = item.analysis_item.symbol.identity_key(&file_path);
        let content_hash = symbol_content_hash(&item.analysis_item.symbol);
        let model_name = match item.model_type {
            ModelType::Code => "code-embed",
            ModelType::Text => "text-embed",
        };

        let document = build_document(client_id, &item.analysis_item, &item.content, item.chunk_index, item.total_chunks, commit_hash);
        let upsert_result = vector_store.upsert(model_name, &document, &item.vector).await;

        let is_last_chunk = item.chunk_index + 1 >= item.total_chunks;
        match upsert_result {
            Ok(vector_id) => {
                let mut acc = accumulators.lock().await;
                if let Some(entry) = acc.get_mut(&file_path) {
                    entry.contents.push(VectorContentEntry {
                        vector_id,
                        content_hash: content_hash.clone(),
                        len: item.content.len(),
                        description: symbol_key.clone(),
                    });
                    if is_last_chunk {
                        entry.completed_units += 1;
                        maybe_finalize_file(&db, &events, &mut acc, &file_path, commit_hash).await;
                    }
                }
            }
            Err(e) => {
                warn!(file_path = %file_path, error = %e, "vector store upsert failed");
                if is_last_chunk {
                    let mut acc = accumulators.lock().await;
                    if let Some(entry) = acc.get_mut(&file_path) {
                        entry.completed_units += 1;
                        maybe_finalize_file(&db, &events, &mut acc, &file_path, commit_hash).await;
                    }
                }
            }
        }
        let _ = project_id;
    }
    Ok(())
}

async fn maybe_finalize_file(
    db: &Arc<Db>,
    events: &broadcast::Sender<PipelineEvent>,
    acc: &mut HashMap<String, FileAccumulator>,
    file_path: &str,
    commit_hash: &str,
) {
    let done = acc.get(file_path).is_some_and(|e| e.completed_units >= e.expected_units);
    if !done {
        return;
    }
    let Some(entry) = acc.remove(file_path) else { return };
    if let Err(e) = db.complete_indexing(entry.project_id, file_path, commit_hash, &entry.contents) {
        warn!(file_path, error = %e, "complete_indexing failed");
        return;
    }
    let _ = events.send(PipelineEvent::FileCompleted {
        project_id: entry.project_id,
        file_path: file_path.to_string(),
        vector_count: entry.contents.len(),
    });
    let _ = Utc::now();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IndexingState, Symbol};
    use tokio::sync::Notify;

    struct OneFileExtractor {
        project_id: i64,
    }

    #[async_trait]
    impl SymbolExtractor for OneFileExtractor {
        async fn discover(&self, project_id: i64, tx: mpsc::Sender<AnalysisItem>) -> Result<()> {
            let method = Symbol {
                symbol_type: SymbolType::Method,
                full_name: "Foo.bar".into(),
                signature: None,
                line_start: 1,
                line_end: 5,
                node_id: "n1".into(),
                language: "rust".into(),
                code: Some("fn bar() {}".into()),
                parent_class: Some("Foo".into()),
            };
            tx.send(AnalysisItem {
                file_path: "src/foo.rs".into(),
                symbol: method,
                project_id,
                worker_id: "w1".into(),
                ts: Utc::now(),
            })
            .await
            .ok();
            Ok(())
        }
    }

    struct FakeEmbeddings;

    #[async_trait]
    impl EmbeddingGateway for FakeEmbeddings {
        async fn embed(&self, _model_type: ModelType, text: &str) -> Result<Vec<f32>> {
            Ok(vec![text.len() as f32])
        }
        fn model_name(&self, model_type: ModelType) -> &str {
            match model_type {
                ModelType::Code => "fake-code",
                ModelType::Text => "fake-text",
            }
        }
    }

    struct FakeSummarizer;

    #[async_trait]
    impl Summarizer for FakeSummarizer {
        async fn summarize(&self, _prompt_type: &str, symbol: &Symbol) -> Result<Vec<String>> {
            Ok(vec![format!("summary of {}", symbol.full_name)])
        }
    }

    struct FakeVectorStore {
        deletes: std::sync::atomic::AtomicUsize,
        upserts: std::sync::Mutex<Vec<String>>,
        notify: Notify,
    }

    impl FakeVectorStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                deletes: std::sync::atomic::AtomicUsize::new(0),
                upserts: std::sync::Mutex::new(Vec::new()),
                notify: Notify::new(),
            })
        }
    }

    #[async_trait]
    impl VectorStoreGateway for FakeVectorStore {
        async fn upsert(&self, _model_name: &str, document: &RagDocument, _vector: &[f32]) -> Result<String> {
            let id = format!("vec-{}", self.upserts.lock().unwrap().len());
            self.upserts.lock().unwrap().push(document.text.clone());
            self.notify.notify_waiters();
            Ok(id)
        }
        async fn delete_by_filter(&self, _project_id: i64, _path: &str) -> Result<usize> {
            self.deletes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(0)
        }
    }

    #[tokio::test]
    async fn a_method_symbol_produces_code_and_text_vectors_and_completes_the_file() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let client_id = db.upsert_client("Acme", "acme").unwrap();
        let project_id = db.upsert_project(client_id, "app", "app").unwrap();

        let vector_store = FakeVectorStore::new();
        let pipeline = IndexingPipeline::new(
            db.clone(),
            Arc::new(OneFileExtractor { project_id }),
            Arc::new(FakeEmbeddings),
            Arc::new(FakeSummarizer),
            vector_store.clone(),
            PipelineConfig { channel_capacity: 16, storage_workers: 2 },
        );

        pipeline.run(client_id, project_id, "deadbeef").await.unwrap();

        let status = db.get_indexing_status(project_id, "src/foo.rs").unwrap().unwrap();
        // One code-embedding vector + one text-summary vector for the method.
        assert_eq!(status.contents.len(), 2);
        assert_eq!(vector_store.deletes.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_rerun_with_no_changed_symbols_deletes_nothing_and_keeps_the_ledger() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let client_id = db.upsert_client("Acme", "acme").unwrap();
        let project_id = db.upsert_project(client_id, "app", "app").unwrap();

        let vector_store = FakeVectorStore::new();
        let pipeline = IndexingPipeline::new(
            db.clone(),
            Arc::new(OneFileExtractor { project_id }),
            Arc::new(FakeEmbeddings),
            Arc::new(FakeSummarizer),
            vector_store.clone(),
            PipelineConfig { channel_capacity: 16, storage_workers: 2 },
        );
        pipeline.run(client_id, project_id, "deadbeef").await.unwrap();
        let first_run_status = db.get_indexing_status(project_id, "src/foo.rs").unwrap().unwrap();
        assert_eq!(vector_store.deletes.load(std::sync::atomic::Ordering::SeqCst), 1);

        // Same file, same symbol content: nothing changed, so a second run
        // must neither delete the store's vectors nor touch the ledger.
        let pipeline = IndexingPipeline::new(
            db.clone(),
            Arc::new(OneFileExtractor { project_id }),
            Arc::new(FakeEmbeddings),
            Arc::new(FakeSummarizer),
            vector_store.clone(),
            PipelineConfig { channel_capacity: 16, storage_workers: 2 },
        );
        pipeline.run(client_id, project_id, "deadbeef").await.unwrap();

        assert_eq!(vector_store.deletes.load(std::sync::atomic::Ordering::SeqCst), 1);
        let second_run_status = db.get_indexing_status(project_id, "src/foo.rs").unwrap().unwrap();
        assert_eq!(second_run_status.vector_ids(), first_run_status.vector_ids());
        assert_eq!(second_run_status.state, IndexingState::Indexed);
    }
}

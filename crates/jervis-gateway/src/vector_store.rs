use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use jervis_core::error::JervisError;
use jervis_core::types::RagDocument;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::circuit_breaker::CircuitBreaker;

/// One hit returned by `search` (§4.6 C8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub vector_id: String,
    pub score: f32,
    pub document: RagDocument,
}

#[derive(Serialize)]
struct UpsertPoint<'a> {
    id: &'a str,
    vector: &'a [f32],
    payload: &'a RagDocument,
}

#[derive(Serialize)]
struct UpsertRequest<'a> {
    points: Vec<UpsertPoint<'a>>,
}

#[derive(Serialize)]
struct DeleteByFilterRequest<'a> {
    filter: DeleteFilter<'a>,
}

#[derive(Serialize)]
struct DeleteFilter<'a> {
    project_id: i64,
    path: Option<&'a str>,
    knowledge_id: Option<&'a str>,
}

#[derive(Deserialize, Default)]
struct DeleteResponse {
    #[serde(default)]
    deleted: usize,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    vector: &'a [f32],
    project_id: i64,
    limit: usize,
    min_score: f32,
}

#[derive(Serialize)]
struct CreateCollectionRequest {
    dimension: usize,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    hits: Vec<SearchHit>,
}

/// The full C8 contract: upsert, filtered delete, similarity search,
/// delete-by-knowledge-id (used when a curated knowledge item is retired),
/// and the dimension/model-change rebuild notification.
#[async_trait]
pub trait VectorStoreGateway: Send + Sync {
    async fn upsert(&self, model_name: &str, document: &RagDocument, vector: &[f32]) -> Result<String>;
    async fn delete_by_filter(&self, project_id: i64, path: &str) -> Result<usize>;
    async fn search(
        &self,
        model_name: &str,
        vector: &[f32],
        project_id: i64,
        limit: usize,
        min_score: f32,
    ) -> Result<Vec<SearchHit>>;
    async fn delete_by_knowledge_id(&self, model_name: &str, knowledge_id: &str) -> Result<usize>;
    /// Called whenever the embedding model/dimension settings change.
    /// Rebuilds the collection iff `(model_name, dimension)` actually
    /// differs from what was last seen (§4.6).
    async fn on_settings_changed(&self, model_name: &str, dimension: usize) -> Result<()>;
}

/// Collections are named `jervis_{modelName}_dim{N}` and created on demand
/// by the downstream store; this gateway only ever addresses them by name.
fn collection_name(model_name: &str, dimension: usize) -> String {
    format!("jervis_{model_name}_dim{dimension}")
}

/// Deterministic point id so repeated upserts of the same symbol/chunk
/// replace rather than duplicate (§4.4 Idempotence).
fn vector_id_for(document: &RagDocument, chunk_id: Option<u32>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document.project_id.to_le_bytes());
    hasher.update(document.path.as_deref().unwrap_or_default().as_bytes());
    hasher.update(document.method_name.as_deref().unwrap_or_default().as_bytes());
    hasher.update(document.line_start.unwrap_or(0).to_le_bytes());
    hasher.update(document.line_end.unwrap_or(0).to_le_bytes());
    hasher.update(chunk_id.unwrap_or(0).to_le_bytes());
    format!("{:x}", hasher.finalize())
}

/// REST client over a vector-store microservice fronting the actual ANN
/// index (Qdrant/Weaviate-shaped). Every call is guarded by a circuit
/// breaker so a degraded store fails fast instead of stalling the whole
/// indexing pipeline (C6) behind a hung HTTP call.
pub struct HttpVectorStoreGateway {
    http: reqwest::Client,
    base_url: String,
    breaker: CircuitBreaker,
    last_known: std::sync::Mutex<Option<(String, usize)>>,
}

impl HttpVectorStoreGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
            breaker: CircuitBreaker::new(5, Duration::from_secs(60)),
            last_known: std::sync::Mutex::new(None),
        }
    }

    fn guard(&self) -> Result<()> {
        if !self.breaker.allow() {
            return Err(anyhow!(JervisError::Gateway("vector store circuit open".into())));
        }
        Ok(())
    }
}

#[async_trait]
impl VectorStoreGateway for HttpVectorStoreGateway {
    async fn upsert(&self, model_name: &str, document: &RagDocument, vector: &[f32]) -> Result<String> {
        self.guard()?;
        // Every write observes the model/dimension it was embedded with;
        // this is the settings-change notification in practice (§4.6).
        self.on_settings_changed(model_name, vector.len()).await?;
        let collection = collection_name(model_name, vector.len());
        let id = vector_id_for(document, document.chunk_id);

        let result = self
            .http
            .put(format!("{}/collections/{collection}/points", self.base_url))
            .json(&UpsertRequest { points: vec![UpsertPoint { id: &id, vector, payload: document }] })
            .send()
            .await
            .context("vector store upsert request");

        match result.and_then(|r| r.error_for_status().context("vector store upsert status")) {
            Ok(_) => {
                self.breaker.record_success();
                Ok(id)
            }
            Err(e) => {
                self.breaker.record_failure();
                warn!(collection = %collection, error = %e, "vector store upsert failed");
                Err(e)
            }
        }
    }

    async fn delete_by_filter(&self, project_id: i64, path: &str) -> Result<usize> {
        self.guard()?;
        let result = self
            .http
            .post(format!("{}/points/delete", self.base_url))
            .json(&DeleteByFilterRequest { filter: DeleteFilter { project_id, path: Some(path), knowledge_id: None } })
            .send()
            .await
            .context("vector store delete request");

        match result {
            Ok(r) => match r.error_for_status() {
                Ok(r) => {
                    self.breaker.record_success();
                    let body: DeleteResponse = r.json().await.unwrap_or_default();
                    Ok(body.deleted)
                }
                Err(e) => {
                    self.breaker.record_failure();
                    Err(e.into())
                }
            },
            Err(e) => {
                self.breaker.record_failure();
                Err(e)
            }
        }
    }

    async fn search(
        &self,
        model_name: &str,
        vector: &[f32],
        project_id: i64,
        limit: usize,
        min_score: f32,
    ) -> Result<Vec<SearchHit>> {
        self.guard()?;
        let collection = collection_name(model_name, vector.len());
        let result = self
            .http
            .post(format!("{}/collections/{collection}/search", self.base_url))
            .json(&SearchRequest { vector, project_id, limit, min_score })
            .send()
            .await
            .context("vector store search request");

        match result.and_then(|r| r.error_for_status().context("vector store search status")) {
            Ok(r) => {
                self.breaker.record_success();
                let body: SearchResponse = r.json().await.context("parse search response")?;
                // Filter again client-side: the store is trusted to honor
                // `min_score`, but a low-score hit slipping through must
                // never reach a caller (§4.6).
                Ok(body.hits.into_iter().filter(|hit| hit.score >= min_score).collect())
            }
            Err(e) => {
                self.breaker.record_failure();
                warn!(collection = %collection, error = %e, "vector store search failed");
                Err(e)
            }
        }
    }

    async fn delete_by_knowledge_id(&self, model_name: &str, knowledge_id: &str) -> Result<usize> {
        self.guard()?;
        // Knowledge entries may be embedded under either model family; the
        // caller passes whichever collection it knows the item lives in.
        let _ = model_name;
        let result = self
            .http
            .post(format!("{}/points/delete", self.base_url))
            .json(&DeleteByFilterRequest { filter: DeleteFilter { project_id: 0, path: None, knowledge_id: Some(knowledge_id) } })
            .send()
            .await
            .context("vector store delete-by-knowledge-id request");

        match result.and_then(|r| r.error_for_status().context("vector store delete status")) {
            Ok(r) => {
                self.breaker.record_success();
                let body: DeleteResponse = r.json().await.unwrap_or_default();
                info!(knowledge_id, deleted = body.deleted, "deleted vectors for retired knowledge item");
                Ok(body.deleted)
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(e)
            }
        }
    }

    async fn on_settings_changed(&self, model_name: &str, dimension: usize) -> Result<()> {
        let previous = {
            let mut guard = self.last_known.lock().unwrap_or_else(|e| e.into_inner());
            let previous = guard.clone();
            *guard = Some((model_name.to_string(), dimension));
            previous
        };

        let Some((prev_model, prev_dim)) = previous else {
            // First settings observed this process: nothing to rebuild from.
            return Ok(());
        };
        if prev_model == model_name && prev_dim == dimension {
            return Ok(());
        }

        self.guard()?;
        let new_collection = collection_name(model_name, dimension);
        let old_collection = collection_name(&prev_model, prev_dim);

        let create = self
            .http
            .put(format!("{}/collections/{new_collection}", self.base_url))
            .json(&CreateCollectionRequest { dimension })
            .send()
            .await
            .context("create rebuilt collection request");
        match create.and_then(|r| r.error_for_status().context("create rebuilt collection status")) {
            Ok(_) => self.breaker.record_success(),
            Err(e) => {
                self.breaker.record_failure();
                return Err(e);
            }
        }

        let delete = self
            .http
            .delete(format!("{}/collections/{old_collection}", self.base_url))
            .send()
            .await
            .context("delete stale collection request");
        match delete.and_then(|r| r.error_for_status().context("delete stale collection status")) {
            Ok(_) => {
                self.breaker.record_success();
                info!(old_collection = %old_collection, new_collection = %new_collection, "rebuilt vector collection after model/dimension change");
                Ok(())
            }
            Err(e) => {
                self.breaker.record_failure();
                warn!(old_collection = %old_collection, error = %e, "failed to delete stale collection after rebuild");
                Err(e)
            }
        }
    }
}

/// Adapter exposing the narrow `upsert`/`delete_by_filter` surface the
/// indexing pipeline (C6) needs, without pulling the rest of the C8
/// contract into `jervis-core`.
#[async_trait]
impl jervis_core::pipeline::VectorStoreGateway for HttpVectorStoreGateway {
    async fn upsert(&self, model_name: &str, document: &RagDocument, vector: &[f32]) -> Result<String> {
        VectorStoreGateway::upsert(self, model_name, document, vector).await
    }

    async fn delete_by_filter(&self, project_id: i64, path: &str) -> Result<usize> {
        VectorStoreGateway::delete_by_filter(self, project_id, path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jervis_core::types::SourceType;

    fn sample_document() -> RagDocument {
        RagDocument {
            client_id: 1,
            project_id: 1,
            source_type: SourceType::Joern,
            text: "fn bar() {}".into(),
            path: Some("src/foo.rs".into()),
            language: Some("rust".into()),
            class_name: None,
            method_name: Some("bar".into()),
            symbol_type: None,
            line_start: Some(1),
            line_end: Some(5),
            knowledge: None,
            git_commit_hash: Some("deadbeef".into()),
            chunk_id: None,
            chunk_of: None,
        }
    }

    #[test]
    fn collection_name_embeds_model_and_dimension() {
        assert_eq!(collection_name("text-embed-3", 1536), "jervis_text-embed-3_dim1536");
    }

    #[test]
    fn vector_id_is_stable_for_the_same_symbol() {
        let doc = sample_document();
        let a = vector_id_for(&doc, None);
        let b = vector_id_for(&doc, None);
        assert_eq!(a, b);
    }

    #[test]
    fn vector_id_differs_per_chunk() {
        let doc = sample_document();
        let a = vector_id_for(&doc, Some(0));
        let b = vector_id_for(&doc, Some(1));
        assert_ne!(a, b);
    }

    #[test]
    fn search_hits_below_min_score_are_dropped() {
        let hits = vec![
            SearchHit { vector_id: "a".into(), score: 0.9, document: sample_document() },
            SearchHit { vector_id: "b".into(), score: 0.1, document: sample_document() },
        ];
        let filtered: Vec<_> = hits.into_iter().filter(|h| h.score >= 0.5).collect();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].vector_id, "a");
    }
}

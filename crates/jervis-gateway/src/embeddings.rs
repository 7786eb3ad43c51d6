use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use jervis_core::error::JervisError;
use jervis_core::types::ModelType;
use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreaker;

/// One embedding model config: a code-oriented model and a general text
/// model, each with its own endpoint (they're frequently different
/// providers entirely).
#[derive(Debug, Clone)]
pub struct EmbeddingModelConfig {
    pub model_name: String,
    pub base_url: String,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

/// OpenAI-compatible `/embeddings` REST client, configured with one model
/// per `ModelType` (code vs. text), each behind its own circuit breaker.
pub struct HttpEmbeddingGateway {
    http: reqwest::Client,
    code: EmbeddingModelConfig,
    text: EmbeddingModelConfig,
    code_breaker: CircuitBreaker,
    text_breaker: CircuitBreaker,
}

impl HttpEmbeddingGateway {
    pub fn new(code: EmbeddingModelConfig, text: EmbeddingModelConfig) -> Self {
        Self {
            http: reqwest::Client::builder().timeout(Duration::from_secs(30)).build().unwrap_or_default(),
            code,
            text,
            code_breaker: CircuitBreaker::new(5, Duration::from_secs(60)),
            text_breaker: CircuitBreaker::new(5, Duration::from_secs(60)),
        }
    }

    fn config_for(&self, model_type: ModelType) -> (&EmbeddingModelConfig, &CircuitBreaker) {
        match model_type {
            ModelType::Code => (&self.code, &self.code_breaker),
            ModelType::Text => (&self.text, &self.text_breaker),
        }
    }
}

#[async_trait]
impl jervis_core::pipeline::EmbeddingGateway for HttpEmbeddingGateway {
    async fn embed(&self, model_type: ModelType, text: &str) -> Result<Vec<f32>> {
        let (config, breaker) = self.config_for(model_type);
        if !breaker.allow() {
            return Err(anyhow!(JervisError::Gateway(format!("{} embedding circuit open", config.model_name))));
        }

        let result = self
            .http
            .post(format!("{}/embeddings", config.base_url.trim_end_matches('/')))
            .json(&EmbeddingRequest { model: &config.model_name, input: text })
            .send()
            .await
            .context("embedding request")
            .and_then(|r| r.error_for_status().context("embedding status"));

        match result {
            Ok(response) => match response.json::<EmbeddingResponse>().await.context("parse embedding response") {
                Ok(mut body) if !body.data.is_empty() => {
                    breaker.record_success();
                    Ok(std::mem::take(&mut body.data[0].embedding))
                }
                Ok(_) => {
                    breaker.record_failure();
                    Err(anyhow!(JervisError::Gateway("embedding response had no data".into())))
                }
                Err(e) => {
                    breaker.record_failure();
                    Err(e)
                }
            },
            Err(e) => {
                breaker.record_failure();
                Err(e)
            }
        }
    }

    fn model_name(&self, model_type: ModelType) -> &str {
        &self.config_for(model_type).0.model_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_for_routes_by_model_type() {
        let gateway = HttpEmbeddingGateway::new(
            EmbeddingModelConfig { model_name: "code-embed".into(), base_url: "http://code".into() },
            EmbeddingModelConfig { model_name: "text-embed".into(), base_url: "http://text".into() },
        );
        assert_eq!(jervis_core::pipeline::EmbeddingGateway::model_name(&gateway, ModelType::Code), "code-embed");
        assert_eq!(jervis_core::pipeline::EmbeddingGateway::model_name(&gateway, ModelType::Text), "text-embed");
    }
}

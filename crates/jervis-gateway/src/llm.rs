use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use jervis_core::error::JervisError;
use jervis_core::types::Symbol;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::circuit_breaker::CircuitBreaker;

/// Wire protocol a candidate speaks. `OpenAiCompatible` covers hosted and
/// self-hosted gateways that implement the `/chat/completions` shape;
/// `Ollama` covers a locally-hosted model reachable over its native API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKind {
    OpenAiCompatible,
    Ollama,
}

/// One entry in the ordered candidate list C9 walks until a call succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCandidate {
    pub name: String,
    pub base_url: String,
    pub context_window: usize,
    pub api_kind: ApiKind,
}

/// A crude `chars / 4` heuristic (no tokenizer dependency) used both to
/// pick a candidate and to decide whether selective/chunked processing is
/// needed (§4.7).
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Splits `text` on line boundaries into chunks that each fit within
/// `max_tokens`, never splitting a line across chunks.
pub fn chunk_text(text: &str, max_tokens: usize) -> Vec<String> {
    let max_chars = max_tokens.saturating_mul(4).max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if !current.is_empty() && current.len() + line.len() + 1 > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    if chunks.is_empty() {
        chunks.push(text.to_string());
    }
    chunks
}

/// Strips a leading `<think>...</think>` reasoning preamble some models
/// emit before their actual answer.
fn strip_think_preamble(text: &str) -> &str {
    let trimmed = text.trim_start();
    if let Some(rest) = trimmed.strip_prefix("<think>") {
        if let Some(end) = rest.find("</think>") {
            return rest[end + "</think>".len()..].trim_start();
        }
    }
    trimmed
}

/// Structural (not full JSON-Schema) validation: every required top-level
/// field in `schema.properties` marked required must be present in
/// `value`, with a matching JSON type.
fn validate_structure(value: &Value, schema: &Value) -> Result<()> {
    let Value::Object(schema_obj) = schema else { return Ok(()) };
    let Some(Value::Array(required)) = schema_obj.get("required") else { return Ok(()) };
    let Some(Value::Object(properties)) = schema_obj.get("properties") else { return Ok(()) };
    let Value::Object(value_obj) = value else {
        return Err(anyhow!(JervisError::Data("LLM response is not a JSON object".into())));
    };

    for field in required {
        let Some(field_name) = field.as_str() else { continue };
        let Some(actual) = value_obj.get(field_name) else {
            return Err(anyhow!(JervisError::Data(format!("LLM response missing required field \"{field_name}\""))));
        };
        if let Some(expected_type) = properties.get(field_name).and_then(|p| p.get("type")).and_then(Value::as_str) {
            if !json_type_matches(actual, expected_type) {
                return Err(anyhow!(JervisError::Data(format!(
                    "LLM response field \"{field_name}\" has wrong type (expected {expected_type})"
                ))));
            }
        }
    }
    Ok(())
}

/// Merges one chunk's parsed response into the running accumulator per the
/// selective processor's recombination rule (§4.7 step 3): `array` fields
/// concatenate across chunks, `string` fields concatenate with a blank-line
/// separator, everything else keeps the first chunk's value.
fn merge_chunk_values(acc: Value, next: Value, schema: &Value) -> Value {
    let Value::Object(mut acc_map) = acc else { return next };
    let Value::Object(next_map) = next else { return Value::Object(acc_map) };
    let properties = schema.get("properties").and_then(Value::as_object);

    for (key, next_val) in next_map {
        let expected_type = properties
            .and_then(|p| p.get(&key))
            .and_then(|p| p.get("type"))
            .and_then(Value::as_str);

        match (expected_type, acc_map.get_mut(&key)) {
            (Some("array"), Some(Value::Array(existing))) => {
                if let Value::Array(mut more) = next_val {
                    existing.append(&mut more);
                }
            }
            (Some("string"), Some(Value::String(existing))) => {
                if let Value::String(more) = next_val {
                    if !more.is_empty() {
                        if !existing.is_empty() {
                            existing.push_str("\n\n");
                        }
                        existing.push_str(&more);
                    }
                }
            }
            (_, Some(_)) => {
                // Already populated by an earlier chunk and not a mergeable
                // type; keep the first chunk's value.
            }
            (_, None) => {
                acc_map.insert(key, next_val);
            }
        }
    }
    Value::Object(acc_map)
}

fn json_type_matches(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

/// Renders `{{key}}` placeholders in a prompt template from `mapping_values`.
fn render_template(template: &str, mapping_values: &HashMap<String, String>) -> String {
    let mut rendered = template.to_string();
    for (key, value) in mapping_values {
        rendered = rendered.replace(&format!("{{{{{key}}}}}"), value);
    }
    rendered
}

fn prompt_template(prompt_type: &str) -> &'static str {
    match prompt_type {
        "method_summary" => "Summarize what the following {{language}} method does in one or two sentences, for a developer searching a knowledge base:\n\n{{code}}",
        "class_summary" => "Summarize the responsibility of the following {{language}} class in two to four sentences:\n\n{{code}}",
        "finalize_answer" => "Write the final answer to the user's question in {{language}}, using the plan's step results below. Be direct and only state what the results support:\n\n{{code}}",
        _ => "{{code}}",
    }
}

/// The single C9 entry point: resolve a prompt template, pick a candidate,
/// call it, validate the response shape, retry across candidates with no
/// silent fallback (§4.7).
#[async_trait]
pub trait LlmGateway: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn call_llm(
        &self,
        prompt_type: &str,
        response_schema: &Value,
        quick: bool,
        mapping_values: &HashMap<String, String>,
        output_language: Option<&str>,
        background_mode: bool,
    ) -> Result<Value>;
}

/// Lets a single gateway instance be shared (via `Arc`) across the
/// `/completions` HTTP handler, the pipeline's `PipelineSummarizer`, and
/// plan tools, none of which need more than a shared reference.
#[async_trait]
impl<T: LlmGateway + ?Sized> LlmGateway for Arc<T> {
    async fn call_llm(
        &self,
        prompt_type: &str,
        response_schema: &Value,
        quick: bool,
        mapping_values: &HashMap<String, String>,
        output_language: Option<&str>,
        background_mode: bool,
    ) -> Result<Value> {
        (**self).call_llm(prompt_type, response_schema, quick, mapping_values, output_language, background_mode).await
    }
}

#[derive(Serialize)]
struct OpenAiChatRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage<'a>>,
}

#[derive(Serialize)]
struct OpenAiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
}

#[derive(Deserialize)]
struct OpenAiResponseMessage {
    content: String,
}

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage<'a>>,
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: OpenAiResponseMessage,
}

/// REST client walking an ordered candidate list (small local models first
/// when `quick`, the most capable candidate first otherwise), each guarded
/// by its own circuit breaker.
pub struct HttpLlmGateway {
    http: reqwest::Client,
    candidates: Vec<LlmCandidate>,
    breakers: Vec<CircuitBreaker>,
}

impl HttpLlmGateway {
    pub fn new(candidates: Vec<LlmCandidate>) -> Self {
        let breakers = candidates.iter().map(|_| CircuitBreaker::new(5, Duration::from_secs(60))).collect();
        Self {
            http: reqwest::Client::builder().timeout(Duration::from_secs(120)).build().unwrap_or_default(),
            candidates,
            breakers,
        }
    }

    fn ordering(&self, quick: bool) -> Vec<usize> {
        let mut idx: Vec<usize> = (0..self.candidates.len()).collect();
        idx.sort_by(|&a, &b| {
            let wa = self.candidates[a].context_window;
            let wb = self.candidates[b].context_window;
            if quick { wa.cmp(&wb) } else { wb.cmp(&wa) }
        });
        idx
    }

    async fn call_one(&self, index: usize, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let candidate = &self.candidates[index];
        let breaker = &self.breakers[index];
        if !breaker.allow() {
            return Err(anyhow!(JervisError::Gateway(format!("{} circuit open", candidate.name))));
        }

        let messages = vec![
            OpenAiMessage { role: "system", content: system_prompt },
            OpenAiMessage { role: "user", content: user_prompt },
        ];

        let result = match candidate.api_kind {
            ApiKind::OpenAiCompatible => {
                self.http
                    .post(format!("{}/chat/completions", candidate.base_url.trim_end_matches('/')))
                    .json(&OpenAiChatRequest { model: &candidate.name, messages })
                    .send()
                    .await
                    .context("LLM chat request")
                    .and_then(|r| r.error_for_status().context("LLM chat status"))
            }
            ApiKind::Ollama => {
                self.http
                    .post(format!("{}/api/chat", candidate.base_url.trim_end_matches('/')))
                    .json(&OllamaChatRequest { model: &candidate.name, messages, stream: false })
                    .send()
                    .await
                    .context("ollama chat request")
                    .and_then(|r| r.error_for_status().context("ollama chat status"))
            }
        };

        let response = match result {
            Ok(r) => r,
            Err(e) => {
                breaker.record_failure();
                warn!(candidate = %candidate.name, error = %e, "LLM candidate call failed");
                return Err(e);
            }
        };

        let content = match candidate.api_kind {
            ApiKind::OpenAiCompatible => response
                .json::<OpenAiChatResponse>()
                .await
                .context("parse LLM chat response")?
                .choices
                .into_iter()
                .next()
                .map(|c| c.message.content)
                .unwrap_or_default(),
            ApiKind::Ollama => response.json::<OllamaChatResponse>().await.context("parse ollama response")?.message.content,
        };

        breaker.record_success();
        Ok(content)
    }

    /// Walks `order`, calling each candidate in turn until one returns valid
    /// JSON that satisfies `response_schema`. No silent fallback: on
    /// exhaustion, returns the last candidate's error.
    async fn try_candidates(
        &self,
        order: &[usize],
        system_prompt: &str,
        user_prompt: &str,
        response_schema: &Value,
    ) -> Result<Value> {
        let mut last_error = None;
        for &index in order {
            match self.call_one(index, system_prompt, user_prompt).await {
                Ok(raw) => {
                    let stripped = strip_think_preamble(&raw);
                    let value: Value = match serde_json::from_str(stripped) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(candidate = %self.candidates[index].name, error = %e, "LLM response was not valid JSON");
                            last_error = Some(anyhow!(JervisError::Data(format!("invalid JSON from {}: {e}", self.candidates[index].name))));
                            continue;
                        }
                    };
                    if let Err(e) = validate_structure(&value, response_schema) {
                        warn!(candidate = %self.candidates[index].name, error = %e, "LLM response failed schema validation");
                        last_error = Some(e);
                        continue;
                    }
                    info!(candidate = %self.candidates[index].name, "LLM call succeeded");
                    return Ok(value);
                }
                Err(e) => {
                    last_error = Some(e);
                    continue;
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow!(JervisError::Gateway("all LLM candidates exhausted".into()))))
    }
}

#[async_trait]
impl LlmGateway for HttpLlmGateway {
    async fn call_llm(
        &self,
        prompt_type: &str,
        response_schema: &Value,
        quick: bool,
        mapping_values: &HashMap<String, String>,
        output_language: Option<&str>,
        background_mode: bool,
    ) -> Result<Value> {
        if self.candidates.is_empty() {
            return Err(anyhow!(JervisError::Gateway("no LLM candidates configured".into())));
        }

        let user_prompt = render_template(prompt_template(prompt_type), mapping_values);
        let mut system_prompt =
            "You are Jervis, an engineering-knowledge assistant. Respond with JSON matching the requested schema only.".to_string();
        if let Some(language) = output_language {
            system_prompt.push_str(&format!(" Respond in {language}."));
        }

        let estimate = estimate_tokens(&user_prompt);
        let largest_window = self.candidates.iter().map(|c| c.context_window).max().unwrap_or(0);
        let order = self.ordering(quick);

        if estimate > largest_window && largest_window > 0 {
            // Selective processor (§4.7 step 3): chunk the prompt, call the
            // candidate list per chunk, and recombine per the schema rather
            // than keeping only the first chunk.
            let chunks = chunk_text(&user_prompt, largest_window);
            info!(estimated_tokens = estimate, largest_window, chunks = chunks.len(), "prompt exceeds largest candidate window, invoking selective processor");

            let mut merged: Option<Value> = None;
            let mut failures = Vec::new();
            for (i, chunk) in chunks.iter().enumerate() {
                match self.try_candidates(&order, &system_prompt, chunk, response_schema).await {
                    Ok(value) => {
                        merged = Some(match merged {
                            None => value,
                            Some(acc) => merge_chunk_values(acc, value, response_schema),
                        });
                    }
                    Err(e) => {
                        warn!(chunk = i, error = %e, "selective processor: chunk failed on every candidate");
                        failures.push(format!("chunk {i}: {e}"));
                    }
                }
            }

            let Some(mut value) = merged else {
                // No silent fallback: every chunk failed, so the call fails
                // with all of their errors attached rather than returning
                // an empty or partial shape.
                return Err(anyhow!(JervisError::Gateway(format!(
                    "selective processor: all chunks failed: {}",
                    failures.join("; ")
                ))));
            };
            if !failures.is_empty() {
                // Partial failures are reported on the response rather than
                // silently dropped, per §8's boundary behavior.
                if let Value::Object(ref mut map) = value {
                    map.insert("_partial_failures".to_string(), Value::Array(failures.into_iter().map(Value::String).collect()));
                }
            }
            info!(quick, background_mode, "LLM call succeeded via selective processor");
            return Ok(value);
        }

        let value = self.try_candidates(&order, &system_prompt, &user_prompt, response_schema).await?;
        info!(quick, background_mode, "LLM call succeeded");
        Ok(value)
    }
}

/// Adapts the full C9 surface to the narrow per-symbol summarization hook
/// the indexing pipeline (C6) needs.
pub struct PipelineSummarizer<G: LlmGateway> {
    gateway: G,
    chunk_target_tokens: usize,
}

impl<G: LlmGateway> PipelineSummarizer<G> {
    pub fn new(gateway: G, chunk_target_tokens: usize) -> Self {
        Self { gateway, chunk_target_tokens }
    }
}

#[async_trait]
impl<G: LlmGateway> jervis_core::pipeline::Summarizer for PipelineSummarizer<G> {
    async fn summarize(&self, prompt_type: &str, symbol: &Symbol) -> Result<Vec<String>> {
        let code = symbol.code.as_deref().unwrap_or(&symbol.full_name);
        let mut mapping_values = HashMap::new();
        mapping_values.insert("language".to_string(), symbol.language.clone());
        mapping_values.insert("code".to_string(), code.to_string());

        let schema = serde_json::json!({
            "type": "object",
            "required": ["summary"],
            "properties": { "summary": { "type": "string" } }
        });

        let result = self.gateway.call_llm(prompt_type, &schema, true, &mapping_values, None, true).await?;
        let summary = result
            .get("summary")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!(JervisError::Data("summarizer response missing \"summary\"".into())))?;
        Ok(chunk_text(summary, self.chunk_target_tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_tokens_uses_chars_over_four() {
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn chunk_text_never_splits_a_line() {
        let text = "line one\nline two\nline three";
        let chunks = chunk_text(text, 2);
        for chunk in &chunks {
            for line in chunk.lines() {
                assert!(text.contains(line));
            }
        }
    }

    #[test]
    fn strip_think_preamble_removes_reasoning_block() {
        let raw = "<think>reasoning here</think>\n{\"summary\":\"ok\"}";
        assert_eq!(strip_think_preamble(raw), "{\"summary\":\"ok\"}");
    }

    #[test]
    fn strip_think_preamble_is_noop_without_a_block() {
        assert_eq!(strip_think_preamble("{\"summary\":\"ok\"}"), "{\"summary\":\"ok\"}");
    }

    #[test]
    fn validate_structure_rejects_missing_required_field() {
        let schema = serde_json::json!({"type":"object","required":["summary"],"properties":{"summary":{"type":"string"}}});
        let value = serde_json::json!({"other": 1});
        assert!(validate_structure(&value, &schema).is_err());
    }

    #[test]
    fn validate_structure_rejects_wrong_type() {
        let schema = serde_json::json!({"type":"object","required":["summary"],"properties":{"summary":{"type":"string"}}});
        let value = serde_json::json!({"summary": 5});
        assert!(validate_structure(&value, &schema).is_err());
    }

    #[test]
    fn merge_chunk_values_concatenates_strings_and_arrays() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "summary": { "type": "string" },
                "tags": { "type": "array" }
            }
        });
        let acc = serde_json::json!({"summary": "first part", "tags": ["a"]});
        let next = serde_json::json!({"summary": "second part", "tags": ["b"]});
        let merged = merge_chunk_values(acc, next, &schema);
        assert_eq!(merged["summary"], "first part\n\nsecond part");
        assert_eq!(merged["tags"], serde_json::json!(["a", "b"]));
    }

    #[test]
    fn merge_chunk_values_keeps_first_value_for_non_mergeable_fields() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": { "confidence": { "type": "number" } }
        });
        let acc = serde_json::json!({"confidence": 0.9});
        let next = serde_json::json!({"confidence": 0.5});
        let merged = merge_chunk_values(acc, next, &schema);
        assert_eq!(merged["confidence"], 0.9);
    }

    #[test]
    fn ordering_prefers_smallest_window_when_quick() {
        let gateway = HttpLlmGateway::new(vec![
            LlmCandidate { name: "big".into(), base_url: "http://big".into(), context_window: 100_000, api_kind: ApiKind::OpenAiCompatible },
            LlmCandidate { name: "small".into(), base_url: "http://small".into(), context_window: 8_000, api_kind: ApiKind::Ollama },
        ]);
        let order = gateway.ordering(true);
        assert_eq!(gateway.candidates[order[0]].name, "small");
    }
}

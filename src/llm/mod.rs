//! Client for the remote text-analysis service.
//!
//! [`AnalysisClient::generate_structured`] is the only path to the backend:
//! request-level cache lookup first, then a bounded retry loop around the
//! remote call plus schema validation, with every outcome written to the
//! audit ledger by content hash.

pub mod backend;
pub mod prompts;
pub mod retry;
pub mod schema;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

pub use backend::{
    CompletionBackend, CompletionRequest, CompletionResponse, HttpBackend, Message, TokenUsage,
};

use crate::audit::AuditLedger;
use crate::cache::{CacheRecord, CacheStore, LLM_NAMESPACE};
use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::hash::{hash_json, hash_text, short};
use retry::RetryPolicy;
use schema::ResponseSchema;

/// One structured-completion request.
#[derive(Debug, Clone)]
pub struct StructuredRequest<'a> {
    pub prompt: &'a str,
    pub instructions: &'a str,
    /// Falls back to the client default when unset.
    pub temperature: Option<f32>,
    pub schema: &'a ResponseSchema,
}

#[derive(Debug, Clone)]
pub struct StructuredResponse {
    pub content: Value,
    pub tokens_used: Option<TokenUsage>,
    /// Served from the request cache without a remote call.
    pub cached: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedCompletion {
    content: Value,
    tokens_used: Option<TokenUsage>,
}

/// Request cache key over everything that affects the completion.
pub fn cache_key(prompt: &str, instructions: &str, temperature: f32, model: &str) -> String {
    hash_json(&json!({
        "prompt": prompt,
        "instructions": instructions,
        // formatted so float noise cannot split keys
        "temperature": format!("{:.3}", temperature),
        "model": model,
    }))
}

pub struct AnalysisClient {
    backend: Arc<dyn CompletionBackend>,
    cache: Arc<dyn CacheStore>,
    audit: Arc<dyn AuditLedger>,
    retry: RetryPolicy,
    default_temperature: f32,
    max_tokens: u32,
}

impl AnalysisClient {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        cache: Arc<dyn CacheStore>,
        audit: Arc<dyn AuditLedger>,
    ) -> Self {
        Self {
            backend,
            cache,
            audit,
            retry: RetryPolicy::default(),
            default_temperature: 0.3,
            max_tokens: 2000,
        }
    }

    /// HTTP backend chosen by `config`.
    pub fn from_config(
        config: &LlmConfig,
        cache: Arc<dyn CacheStore>,
        audit: Arc<dyn AuditLedger>,
    ) -> Result<Self, LlmError> {
        let backend = Arc::new(HttpBackend::new(config)?);
        info!(
            provider = config.backend.provider(),
            model = config.backend.model_identity(),
            "Analysis client ready"
        );
        Ok(Self {
            retry: config.retry.clone(),
            default_temperature: config.default_temperature,
            max_tokens: config.max_tokens,
            ..Self::new(backend, cache, audit)
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn model(&self) -> &str {
        self.backend.model()
    }

    pub fn cache(&self) -> Arc<dyn CacheStore> {
        self.cache.clone()
    }

    pub fn audit(&self) -> Arc<dyn AuditLedger> {
        self.audit.clone()
    }

    /// Cached, retried, schema-checked completion.
    ///
    /// Transport and schema failures are retried under the client's policy;
    /// the final failure is audited and returned to the caller, which decides
    /// whether a missing result is skippable.
    pub async fn generate_structured(
        &self,
        request: StructuredRequest<'_>,
    ) -> Result<StructuredResponse, LlmError> {
        let schema = request.schema;
        let temperature = request.temperature.unwrap_or(self.default_temperature);
        let prompt = format!("{}\n\n{}", request.prompt, schema.describe());
        let model = self.model().to_string();
        let key = cache_key(&prompt, request.instructions, temperature, &model);
        let prompt_hash = hash_text(&prompt);

        if let Some(hit) = self.cached(&key, schema) {
            debug!(cache_key = short(&key), schema = schema.name, "llm cache hit");
            self.audit.record(
                "llm_cache_hit",
                json!({
                    "model": model,
                    "cache_key": key,
                    "prompt_hash": prompt_hash,
                    "schema": schema.name,
                }),
            );
            return Ok(StructuredResponse {
                content: hit.content,
                tokens_used: hit.tokens_used,
                cached: true,
            });
        }

        let completion = CompletionRequest {
            messages: vec![Message::system(request.instructions), Message::user(&prompt)],
            temperature,
            max_tokens: self.max_tokens,
            json_mode: true,
        };
        let completion = &completion;
        let backend = self.backend.as_ref();
        let audit = self.audit.as_ref();
        let key_ref = key.as_str();

        let outcome = self
            .retry
            .run(schema.name, |attempt| async move {
                let result = async {
                    let response = backend.complete(completion).await?;
                    let content = schema.parse(&response.content)?;
                    Ok::<_, LlmError>((content, response, attempt))
                }
                .await;
                if let Err(e) = &result {
                    audit.record(
                        "llm_attempt_failed",
                        json!({
                            "cache_key": key_ref,
                            "attempt": attempt,
                            "error_kind": e.kind(),
                            "message": e.to_string(),
                        }),
                    );
                }
                result
            })
            .await;

        let (content, response, attempts) = match outcome {
            Ok(v) => v,
            Err(e) => {
                warn!(schema = schema.name, error = %e, "Structured generation failed");
                self.audit.record_llm_error(
                    "llm_generate",
                    &e,
                    json!({ "model": model, "cache_key": key, "prompt_hash": prompt_hash }),
                );
                return Err(e);
            }
        };

        let tokens = response.usage.clone().unwrap_or_default();
        self.audit.record(
            "llm_call",
            json!({
                "model": model,
                "cache_key": key,
                "prompt_hash": prompt_hash,
                "response_hash": hash_text(&response.content),
                "temperature": temperature,
                "attempts": attempts,
                "schema": schema.name,
                "tokens_used": {
                    "input": tokens.input,
                    "output": tokens.output,
                    "total": tokens.total,
                },
            }),
        );

        let record = CacheRecord::new(
            &key,
            &model,
            schema.version,
            CachedCompletion {
                content: content.clone(),
                tokens_used: response.usage.clone(),
            },
        );
        if let Err(e) = record.store(self.cache.as_ref(), LLM_NAMESPACE) {
            warn!(cache_key = short(&key), error = %e, "Failed to cache completion");
        }

        Ok(StructuredResponse {
            content,
            tokens_used: response.usage,
            cached: false,
        })
    }

    fn cached(&self, key: &str, schema: &ResponseSchema) -> Option<CachedCompletion> {
        let record = CacheRecord::<CachedCompletion>::load(
            self.cache.as_ref(),
            self.audit.as_ref(),
            "llm_cache_invalid",
            LLM_NAMESPACE,
            key,
        )?;
        if record.schema_version != schema.version {
            return None;
        }
        match schema.validate(&record.payload.content) {
            Ok(()) => Some(record.payload),
            Err(e) => {
                warn!(cache_key = short(key), error = %e, "Cached completion no longer validates");
                self.audit.record(
                    "llm_cache_invalid",
                    json!({ "cache_key": key, "reason": e.to_string() }),
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLog;
    use crate::cache::MemoryCache;
    use crate::llm::schema::{FieldKind, FieldSpec};
    use crate::testing::ScriptedBackend;

    fn schema() -> ResponseSchema {
        ResponseSchema {
            name: "summary",
            version: "1",
            fields: vec![FieldSpec::required("points", FieldKind::TextList, "points")],
        }
    }

    fn client(
        backend: Arc<ScriptedBackend>,
    ) -> (AnalysisClient, Arc<MemoryCache>, Arc<MemoryAuditLog>) {
        let cache = Arc::new(MemoryCache::new());
        let audit = Arc::new(MemoryAuditLog::new());
        let client = AnalysisClient::new(backend, cache.clone(), audit.clone())
            .with_retry(RetryPolicy::immediate(3));
        (client, cache, audit)
    }

    fn request<'a>(schema: &'a ResponseSchema, temperature: Option<f32>) -> StructuredRequest<'a> {
        StructuredRequest {
            prompt: "Summarize",
            instructions: "You summarize.",
            temperature,
            schema,
        }
    }

    #[test]
    fn test_cache_key_covers_temperature_and_model() {
        let base = cache_key("p", "i", 0.3, "gpt-4.1");
        assert_eq!(base, cache_key("p", "i", 0.3, "gpt-4.1"));
        assert_ne!(base, cache_key("p", "i", 0.5, "gpt-4.1"));
        assert_ne!(base, cache_key("p", "i", 0.3, "gpt-4-1"));
        assert_ne!(base, cache_key("p2", "i", 0.3, "gpt-4.1"));
    }

    #[tokio::test]
    async fn test_second_call_is_served_from_cache() {
        let backend = Arc::new(ScriptedBackend::fixed(json!({"points": ["a"]})));
        let (client, _cache, audit) = client(backend.clone());
        let schema = schema();

        let first = client.generate_structured(request(&schema, None)).await.unwrap();
        let second = client.generate_structured(request(&schema, None)).await.unwrap();

        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.content, second.content);
        assert_eq!(backend.calls(), 1);
        assert_eq!(audit.with_operation("llm_call").len(), 1);
        assert_eq!(audit.with_operation("llm_cache_hit").len(), 1);
        assert_eq!(
            audit.with_operation("llm_call")[0].data["tokens_used"]["total"],
            json!(30)
        );
    }

    #[tokio::test]
    async fn test_temperature_change_misses_cache() {
        let backend = Arc::new(ScriptedBackend::fixed(json!({"points": []})));
        let (client, _cache, _audit) = client(backend.clone());
        let schema = schema();

        client.generate_structured(request(&schema, Some(0.3))).await.unwrap();
        client.generate_structured(request(&schema, Some(0.7))).await.unwrap();
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn test_malformed_output_is_retried_then_accepted() {
        let backend = Arc::new(ScriptedBackend::new("gpt-4.1", |_, call| {
            if call == 0 {
                Ok("Sure! Here are the points.".to_string())
            } else {
                Ok("```json\n{\"points\": [\"x\"]}\n```".to_string())
            }
        }));
        let (client, _cache, audit) = client(backend.clone());
        let schema = schema();

        let resp = client.generate_structured(request(&schema, None)).await.unwrap();
        assert_eq!(resp.content["points"][0], "x");
        assert_eq!(backend.calls(), 2);

        let failed = audit.with_operation("llm_attempt_failed");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].data["error_kind"], "schema_validation_error");
        assert_eq!(audit.with_operation("llm_call")[0].data["attempts"], json!(2));
    }

    #[tokio::test]
    async fn test_exhaustion_is_audited_and_propagated() {
        let backend = Arc::new(ScriptedBackend::new("gpt-4.1", |_, _| {
            Err(LlmError::Transport {
                status: Some(429),
                message: "rate limited".into(),
            })
        }));
        let (client, cache, audit) = client(backend.clone());
        let schema = schema();

        let err = client
            .generate_structured(request(&schema, None))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::ExhaustedRetries { attempts: 3, .. }));
        assert_eq!(backend.calls(), 3);
        assert_eq!(audit.with_operation("llm_attempt_failed").len(), 3);

        let errors = audit.errors_for("llm_generate");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].data["error_type"], "exhausted_retry_error");
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_cached_payload_is_rederived() {
        let backend = Arc::new(ScriptedBackend::fixed(json!({"points": ["fresh"]})));
        let (client, cache, audit) = client(backend.clone());
        let schema = schema();

        let prompt = format!("Summarize\n\n{}", schema.describe());
        let key = cache_key(&prompt, "You summarize.", 0.3, "gpt-4.1");
        CacheRecord::new(
            &key,
            "gpt-4.1",
            "1",
            CachedCompletion {
                content: json!({"points": "not a list"}),
                tokens_used: None,
            },
        )
        .store(cache.as_ref(), LLM_NAMESPACE)
        .unwrap();

        let resp = client.generate_structured(request(&schema, None)).await.unwrap();
        assert!(!resp.cached);
        assert_eq!(resp.content["points"][0], "fresh");
        assert_eq!(audit.with_operation("llm_cache_invalid").len(), 1);
    }

    #[tokio::test]
    async fn test_audit_holds_hashes_not_text() {
        let backend = Arc::new(ScriptedBackend::fixed(json!({"points": ["a"]})));
        let (client, _cache, audit) = client(backend);
        let schema = schema();
        client.generate_structured(request(&schema, None)).await.unwrap();

        let call = &audit.with_operation("llm_call")[0];
        assert!(!call.data.to_string().contains("Summarize"));
        assert_eq!(call.data["prompt_hash"].as_str().unwrap().len(), 64);
    }
}

use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::audit::AuditLedger;
use crate::cache::{feature_namespace, CacheRecord, CacheStore};
use crate::error::LlmError;
use crate::hash::{hash_json, short};
use crate::llm::prompts::{feature_prompt, FEATURE_INSTRUCTIONS};
use crate::llm::schema::ResponseSchema;
use crate::llm::{AnalysisClient, StructuredRequest};

use super::types::{
    feature_schema, ExtractedResponse, ExtractionReport, RawResponse, ResponseFeatures,
    FEATURE_SCHEMA_VERSION,
};

const EXTRACTION_TEMPERATURE: f32 = 0.3;

/// Feature cache key. The response id is deliberately absent.
pub fn feature_cache_key(response_text: &str, question_text: &str, model: &str) -> String {
    hash_json(&json!({
        "response": response_text,
        "question": question_text,
        "model": model,
        "extractor_version": FEATURE_SCHEMA_VERSION,
    }))
}

/// Derives one [`ResponseFeatures`] per response, at most once per
/// (text, question, model, schema version).
pub struct ResponseFeatureExtractor {
    client: Arc<AnalysisClient>,
    cache: Arc<dyn CacheStore>,
    audit: Arc<dyn AuditLedger>,
    schema: ResponseSchema,
    concurrency: usize,
}

impl ResponseFeatureExtractor {
    pub fn new(client: Arc<AnalysisClient>) -> Self {
        Self {
            cache: client.cache(),
            audit: client.audit(),
            client,
            schema: feature_schema(),
            concurrency: 1,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn model(&self) -> &str {
        self.client.model()
    }

    /// Features for one response, or `None` when extraction failed. Failures
    /// are audited here and never abort the caller's batch.
    pub async fn extract(
        &self,
        response_text: &str,
        question_text: &str,
        response_id: &str,
        question_id: &str,
    ) -> Option<ResponseFeatures> {
        let key = feature_cache_key(response_text, question_text, self.model());
        let namespace = feature_namespace(question_id);

        if let Some(features) = self.load_cached(&namespace, &key) {
            debug!(response_id, cache_key = short(&key), "feature cache hit");
            self.audit.record(
                "feature_cache_hit",
                json!({ "response_id": response_id, "question_id": question_id, "cache_key": key }),
            );
            return Some(features);
        }

        let prompt = feature_prompt(question_text, response_text);
        let result = self
            .client
            .generate_structured(StructuredRequest {
                prompt: &prompt,
                instructions: FEATURE_INSTRUCTIONS,
                temperature: Some(EXTRACTION_TEMPERATURE),
                schema: &self.schema,
            })
            .await
            .and_then(|resp| {
                let features = serde_json::from_value::<ResponseFeatures>(resp.content)
                    .map_err(|e| LlmError::schema(self.schema.name, e.to_string()))?;
                Ok((features, resp.tokens_used))
            });

        let (features, tokens) = match result {
            Ok(v) => v,
            Err(e) => {
                warn!(response_id, question_id, error = %e, "Feature extraction failed");
                self.audit.record_llm_error(
                    "feature_extraction",
                    &e,
                    json!({
                        "response_id": response_id,
                        "question_id": question_id,
                        "cache_key": key,
                    }),
                );
                return None;
            }
        };

        let record = CacheRecord::new(&key, self.model(), FEATURE_SCHEMA_VERSION, features.clone());
        if let Err(e) = record.store(self.cache.as_ref(), &namespace) {
            warn!(response_id, error = %e, "Failed to cache features");
        }

        self.audit.record(
            "feature_extraction_success",
            json!({
                "response_id": response_id,
                "question_id": question_id,
                "cache_key": key,
                "themes_count": features.themes.len(),
                "sentiment": features.sentiment,
                "urgency": features.urgency,
                "tokens_used": tokens,
            }),
        );

        Some(features)
    }

    /// Cached features that still satisfy the current model and schema.
    fn load_cached(&self, namespace: &str, key: &str) -> Option<ResponseFeatures> {
        let record = CacheRecord::<serde_json::Value>::load(
            self.cache.as_ref(),
            self.audit.as_ref(),
            "feature_cache_invalid",
            namespace,
            key,
        )?;

        let reason = if record.model != self.model() {
            format!("model {} != {}", record.model, self.model())
        } else if record.schema_version != FEATURE_SCHEMA_VERSION {
            format!("schema version {} != {}", record.schema_version, FEATURE_SCHEMA_VERSION)
        } else if let Err(e) = self.schema.validate(&record.payload) {
            e.to_string()
        } else {
            match serde_json::from_value::<ResponseFeatures>(record.payload) {
                Ok(features) => return Some(features),
                Err(e) => e.to_string(),
            }
        };

        warn!(cache_key = short(key), reason = %reason, "Cached features invalid, re-extracting");
        self.audit.record(
            "feature_cache_invalid",
            json!({ "namespace": namespace, "cache_key": key, "reason": reason }),
        );
        None
    }

    /// Extract a batch with bounded concurrency. Output keeps input order;
    /// failed items carry `features: None`.
    pub async fn extract_batch(
        &self,
        responses: &[RawResponse],
    ) -> (Vec<ExtractedResponse>, ExtractionReport) {
        let mut results: Vec<(usize, ExtractedResponse)> = futures::stream::iter(
            responses.iter().enumerate(),
        )
        .map(|(idx, response)| async move {
            let features = self
                .extract(
                    &response.text,
                    &response.question_text,
                    &response.id,
                    &response.question_id,
                )
                .await;
            (
                idx,
                ExtractedResponse {
                    response: response.clone(),
                    features,
                },
            )
        })
        .buffer_unordered(self.concurrency)
        .collect()
        .await;
        results.sort_by_key(|(idx, _)| *idx);

        let extracted: Vec<ExtractedResponse> = results.into_iter().map(|(_, r)| r).collect();
        let succeeded = extracted.iter().filter(|r| r.features.is_some()).count();
        let report = ExtractionReport {
            attempted: extracted.len(),
            succeeded,
            failed: extracted.len() - succeeded,
        };

        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            success_rate = format!("{:.1}%", report.success_rate() * 100.0),
            "Feature extraction batch complete"
        );
        self.audit.record(
            "feature_batch_complete",
            json!({
                "attempted": report.attempted,
                "succeeded": report.succeeded,
                "failed": report.failed,
                "success_rate": report.success_rate(),
            }),
        );

        (extracted, report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLog;
    use crate::cache::MemoryCache;
    use crate::llm::retry::RetryPolicy;
    use crate::testing::{features_json, raw, response_text, ScriptedBackend};

    fn extractor(
        backend: Arc<ScriptedBackend>,
    ) -> (ResponseFeatureExtractor, Arc<MemoryCache>, Arc<MemoryAuditLog>) {
        let cache = Arc::new(MemoryCache::new());
        let audit = Arc::new(MemoryAuditLog::new());
        let client = AnalysisClient::new(backend, cache.clone(), audit.clone())
            .with_retry(RetryPolicy::immediate(3));
        (
            ResponseFeatureExtractor::new(Arc::new(client)).with_concurrency(4),
            cache,
            audit,
        )
    }

    #[tokio::test]
    async fn test_extract_is_idempotent() {
        let backend = Arc::new(ScriptedBackend::survey());
        let (extractor, _cache, audit) = extractor(backend.clone());
        let text = response_text("themes=access|venues;urgency=high", "Hard to find space.");

        let first = extractor.extract(&text, "What barriers?", "r1", "q1").await.unwrap();
        let second = extractor.extract(&text, "What barriers?", "r1", "q1").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(backend.calls(), 1);
        assert_eq!(audit.with_operation("feature_cache_hit").len(), 1);
    }

    #[tokio::test]
    async fn test_response_id_does_not_affect_cache() {
        let backend = Arc::new(ScriptedBackend::survey());
        let (extractor, _cache, _audit) = extractor(backend.clone());
        let text = response_text("themes=access", "Same words.");

        extractor.extract(&text, "Q?", "r1", "q1").await.unwrap();
        extractor.extract(&text, "Q?", "r2", "q1").await.unwrap();
        assert_eq!(backend.calls(), 1);

        assert_eq!(
            feature_cache_key("a", "q", "m"),
            feature_cache_key("a", "q", "m")
        );
        assert_ne!(feature_cache_key("a", "q", "m"), feature_cache_key("a", "q", "m2"));
    }

    #[tokio::test]
    async fn test_cache_is_partitioned_by_question() {
        let backend = Arc::new(ScriptedBackend::survey());
        let (extractor, cache, _audit) = extractor(backend);
        extractor.extract("[themes=a] x", "Q?", "r1", "q1").await.unwrap();
        extractor.extract("[themes=b] y", "Q?", "r2", "q2").await.unwrap();

        assert_eq!(cache.keys("features/q1").len(), 1);
        assert_eq!(cache.keys("features/q2").len(), 1);
    }

    #[tokio::test]
    async fn test_stale_cached_record_is_reextracted() {
        let backend = Arc::new(ScriptedBackend::survey());
        let (extractor, cache, audit) = extractor(backend.clone());
        let text = "[themes=access] words";
        let key = feature_cache_key(text, "Q?", "gpt-4.1");

        let mut stale = features_json("positive", &["access"], "low", "artist");
        stale["urgency"] = json!("critical");
        CacheRecord::new(&key, "gpt-4.1", FEATURE_SCHEMA_VERSION, stale)
            .store(cache.as_ref(), &feature_namespace("q1"))
            .unwrap();

        let features = extractor.extract(text, "Q?", "r1", "q1").await.unwrap();
        assert_eq!(features.themes, vec!["access".to_string()]);
        assert_eq!(backend.calls(), 1);
        assert_eq!(audit.with_operation("feature_cache_invalid").len(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_cached_record_is_audited() {
        let backend = Arc::new(ScriptedBackend::survey());
        let (extractor, cache, audit) = extractor(backend.clone());
        let text = "[themes=access] words";
        let key = feature_cache_key(text, "Q?", "gpt-4.1");
        cache
            .put(&feature_namespace("q1"), &key, &json!({ "garbage": true }))
            .unwrap();

        let features = extractor.extract(text, "Q?", "r1", "q1").await.unwrap();

        assert_eq!(features.themes, vec!["access".to_string()]);
        assert_eq!(backend.calls(), 1);
        let invalid = audit.with_operation("feature_cache_invalid");
        assert_eq!(invalid.len(), 1);
        assert_eq!(invalid[0].data["cache_key"], key.as_str());
        assert!(audit.with_operation("feature_cache_hit").is_empty());
    }

    #[tokio::test]
    async fn test_batch_absorbs_failures() {
        let backend = Arc::new(ScriptedBackend::survey());
        let (extractor, _cache, audit) = extractor(backend.clone());
        let responses: Vec<RawResponse> = (0..10)
            .map(|i| {
                let directives = if i % 5 == 0 { "fail" } else { "themes=access" };
                raw(
                    &format!("r{}", i),
                    "q1",
                    "Q?",
                    &response_text(directives, &format!("response {}", i)),
                )
            })
            .collect();

        let (extracted, report) = extractor.extract_batch(&responses).await;

        assert_eq!(extracted.len(), 10);
        assert_eq!(report.attempted, 10);
        assert_eq!(report.succeeded, 8);
        assert_eq!(report.failed, 2);
        assert!((report.success_rate() - 0.8).abs() < 1e-9);
        assert!(extracted[0].features.is_none());
        assert_eq!(extracted[1].response.id, "r1");
        // 3 attempts for each failing response
        assert_eq!(backend.calls(), 8 + 2 * 3);

        let errors = audit.errors_for("feature_extraction");
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.data["error_type"] == "exhausted_retry_error"));
        assert_eq!(audit.with_operation("feature_batch_complete")[0].data["failed"], json!(2));
    }
}

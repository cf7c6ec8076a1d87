//! Program-level feedback: responses re-sliced by program mention.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use regex::Regex;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::audit::AuditLedger;
use crate::cache::{CacheRecord, CacheStore, PROGRAM_NAMESPACE};
use crate::config::{ProgramConfig, ProgramDefinition};
use crate::llm::prompts::program_instructions;
use crate::llm::schema::{FieldKind, FieldSpec, ResponseSchema};
use crate::llm::{AnalysisClient, StructuredRequest};

use super::extractor::ResponseFeatureExtractor;
use super::question::string_list;
use super::types::{ExtractedResponse, ProgramFeedback, RawResponse};

const PROGRAM_SCHEMA_VERSION: &str = "program-1.0";
const PROGRAM_TEMPERATURE: f32 = 0.4;

/// Initials of the capitalized words of a multi-word name.
pub fn acronym(name: &str) -> Option<String> {
    let words: Vec<&str> = name.split_whitespace().collect();
    if words.len() < 2 {
        return None;
    }
    let initials: String = words
        .iter()
        .filter_map(|w| w.chars().next())
        .filter(|c| c.is_uppercase())
        .collect();
    (initials.chars().count() >= 2).then_some(initials)
}

/// Cache key for a program: lowercase words joined by underscores.
pub fn program_slug(name: &str) -> String {
    name.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join("_")
}

/// Case-insensitive, word-bounded matcher over a program's spellings.
#[derive(Debug, Clone)]
pub struct ProgramMatcher {
    pub name: String,
    pub slug: String,
    pattern: Regex,
}

impl ProgramMatcher {
    pub fn new(def: &ProgramDefinition) -> Result<Self> {
        let mut spellings = vec![def.name.clone()];
        spellings.extend(acronym(&def.name));
        spellings.extend(def.variants.iter().cloned());
        spellings.retain(|s| !s.trim().is_empty());
        // longest first so a full name wins over its prefix
        spellings.sort_by_key(|s| std::cmp::Reverse(s.len()));
        let mut seen = HashSet::new();
        spellings.retain(|s| seen.insert(s.trim().to_lowercase()));

        let alternation = spellings
            .iter()
            .map(|s| regex::escape(s.trim()))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = Regex::new(&format!(r"(?i)\b(?:{})\b", alternation))
            .with_context(|| format!("Invalid pattern for program {}", def.name))?;

        Ok(Self {
            name: def.name.clone(),
            slug: program_slug(&def.name),
            pattern,
        })
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }
}

fn program_schema() -> ResponseSchema {
    ResponseSchema {
        name: "program_analysis",
        version: "1.0",
        fields: vec![
            FieldSpec::required(
                "strengths",
                FieldKind::TextList,
                "program strengths and successes",
            ),
            FieldSpec::required(
                "improvement_areas",
                FieldKind::TextList,
                "areas needing improvement",
            ),
            FieldSpec::required(
                "specific_requests",
                FieldKind::TextList,
                "specific requests or suggestions",
            ),
            FieldSpec::required(
                "impact_statements",
                FieldKind::TextList,
                "impact statements from beneficiaries",
            ),
            FieldSpec::optional(
                "accessibility_issues",
                FieldKind::TextList,
                "accessibility or barrier issues",
            ),
        ],
    }
}

#[derive(Debug, Default)]
struct ProgramThemes {
    strengths: Vec<String>,
    improvement_areas: Vec<String>,
    specific_requests: Vec<String>,
    impact_statements: Vec<String>,
    accessibility_issues: Vec<String>,
}

pub struct ProgramAnalyzer {
    client: Arc<AnalysisClient>,
    extractor: Arc<ResponseFeatureExtractor>,
    cache: Arc<dyn CacheStore>,
    audit: Arc<dyn AuditLedger>,
    config: ProgramConfig,
    matchers: Vec<ProgramMatcher>,
}

impl ProgramAnalyzer {
    pub fn new(
        client: Arc<AnalysisClient>,
        extractor: Arc<ResponseFeatureExtractor>,
        config: ProgramConfig,
    ) -> Result<Self> {
        let matchers = config
            .catalog
            .iter()
            .map(ProgramMatcher::new)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            cache: client.cache(),
            audit: client.audit(),
            client,
            extractor,
            config,
            matchers,
        })
    }

    /// Programs whose patterns match `text`.
    pub fn mentions(&self, text: &str) -> Vec<&str> {
        self.matchers
            .iter()
            .filter(|m| m.is_match(text))
            .map(|m| m.name.as_str())
            .collect()
    }

    /// Feedback for every catalog program mentioned at least once. Each
    /// matching response is extracted once, however many programs it names.
    pub async fn analyze_all_programs(
        &self,
        all_responses: &[RawResponse],
    ) -> BTreeMap<String, ProgramFeedback> {
        let mut results = BTreeMap::new();
        let mut pending: Vec<&ProgramMatcher> = Vec::new();

        for matcher in &self.matchers {
            match CacheRecord::<ProgramFeedback>::load(
                self.cache.as_ref(),
                self.audit.as_ref(),
                "program_cache_invalid",
                PROGRAM_NAMESPACE,
                &matcher.slug,
            ) {
                Some(record)
                    if record.model == self.client.model()
                        && record.schema_version == PROGRAM_SCHEMA_VERSION =>
                {
                    debug!(program = %matcher.name, "program cache hit");
                    self.audit.record(
                        "program_cache_hit",
                        json!({ "program": matcher.name, "slug": matcher.slug }),
                    );
                    results.insert(matcher.name.clone(), record.payload);
                }
                Some(record) => {
                    debug!(
                        program = %matcher.name,
                        model = %record.model,
                        "Stale program feedback"
                    );
                    self.audit.record(
                        "program_cache_stale",
                        json!({
                            "program": matcher.name,
                            "slug": matcher.slug,
                            "cached_model": record.model,
                            "cached_schema_version": record.schema_version,
                        }),
                    );
                    pending.push(matcher);
                }
                None => pending.push(matcher),
            }
        }
        if pending.is_empty() {
            return results;
        }

        let matched: Vec<RawResponse> = all_responses
            .iter()
            .filter(|r| !r.text.trim().is_empty() && pending.iter().any(|m| m.is_match(&r.text)))
            .cloned()
            .collect();
        info!(
            programs = pending.len(),
            matching_responses = matched.len(),
            "Analyzing program mentions"
        );
        let (extracted, _report) = self.extractor.extract_batch(&matched).await;

        for matcher in pending {
            let program_responses: Vec<&ExtractedResponse> = extracted
                .iter()
                .filter(|r| matcher.is_match(&r.response.text))
                .collect();
            if program_responses.is_empty() {
                debug!(program = %matcher.name, "No mentions");
                continue;
            }

            let feedback = self.analyze_program(matcher, &program_responses).await;
            let record = CacheRecord::new(
                &matcher.slug,
                self.client.model(),
                PROGRAM_SCHEMA_VERSION,
                feedback.clone(),
            );
            if let Err(e) = record.store(self.cache.as_ref(), PROGRAM_NAMESPACE) {
                warn!(program = %matcher.name, error = %e, "Failed to cache program feedback");
            }
            self.audit.record(
                "program_analysis_complete",
                json!({
                    "program": feedback.program_name,
                    "slug": matcher.slug,
                    "mention_count": feedback.mention_count,
                    "analyzed_count": feedback.analyzed_count,
                }),
            );
            results.insert(matcher.name.clone(), feedback);
        }

        results
    }

    async fn analyze_program(
        &self,
        matcher: &ProgramMatcher,
        responses: &[&ExtractedResponse],
    ) -> ProgramFeedback {
        let mut sentiment_summary = BTreeMap::new();
        let mut stakeholder_reach = BTreeMap::new();
        let mut analyzed_count = 0;
        for f in responses.iter().filter_map(|r| r.features.as_ref()) {
            analyzed_count += 1;
            *sentiment_summary.entry(f.sentiment).or_insert(0) += 1;
            *stakeholder_reach.entry(f.stakeholder_type).or_insert(0) += 1;
        }

        let texts: Vec<&str> = responses.iter().map(|r| r.response.text.as_str()).collect();
        let themes = self.program_themes(&matcher.name, &texts).await;
        let representative_quotes = extract_quotes(matcher, &texts, &self.config);

        info!(
            program = %matcher.name,
            mentions = responses.len(),
            quotes = representative_quotes.len(),
            "Program analysis complete"
        );

        ProgramFeedback {
            program_name: matcher.name.clone(),
            mention_count: responses.len(),
            analyzed_count,
            sentiment_summary,
            strengths: themes.strengths,
            improvement_areas: themes.improvement_areas,
            specific_requests: themes.specific_requests,
            representative_quotes,
            impact_statements: themes.impact_statements,
            accessibility_issues: themes.accessibility_issues,
            stakeholder_reach,
            analyzed_at: Utc::now(),
        }
    }

    /// One client call over a bounded sample; failure yields empty lists.
    async fn program_themes(&self, program: &str, texts: &[&str]) -> ProgramThemes {
        let samples: Vec<String> = texts
            .iter()
            .take(self.config.sample_cap)
            .enumerate()
            .map(|(i, t)| {
                let clipped: String = t.chars().take(self.config.sample_chars).collect();
                if clipped.len() < t.len() {
                    format!("{}. {}...", i + 1, clipped)
                } else {
                    format!("{}. {}", i + 1, clipped)
                }
            })
            .collect();
        let prompt = format!(
            "Program: {}\nTotal Mentions: {}\n\nSample Feedback:\n{}\n\nAnalyze this feedback and provide structured insights about the program.",
            program,
            texts.len(),
            samples.join("\n")
        );
        let instructions = program_instructions(program);
        let schema = program_schema();

        match self
            .client
            .generate_structured(StructuredRequest {
                prompt: &prompt,
                instructions: &instructions,
                temperature: Some(PROGRAM_TEMPERATURE),
                schema: &schema,
            })
            .await
        {
            Ok(resp) => ProgramThemes {
                strengths: string_list(&resp.content["strengths"]),
                improvement_areas: string_list(&resp.content["improvement_areas"]),
                specific_requests: string_list(&resp.content["specific_requests"]),
                impact_statements: string_list(&resp.content["impact_statements"]),
                accessibility_issues: string_list(&resp.content["accessibility_issues"]),
            },
            Err(e) => {
                warn!(program, error = %e, "Program theme analysis failed");
                self.audit
                    .record_llm_error("analyze_program_themes", &e, json!({ "program": program }));
                ProgramThemes::default()
            }
        }
    }
}

/// Verbatim sentences naming the program, in input order, deduplicated.
pub fn extract_quotes(
    matcher: &ProgramMatcher,
    texts: &[&str],
    config: &ProgramConfig,
) -> Vec<String> {
    let mut quotes: Vec<String> = Vec::new();
    if config.max_quotes == 0 {
        return quotes;
    }
    for text in texts {
        for sentence in text.split(['.', '!', '?']).map(str::trim) {
            let len = sentence.chars().count();
            if len <= config.quote_min_chars || len >= config.quote_max_chars {
                continue;
            }
            if matcher.is_match(sentence) && !quotes.iter().any(|q| q == sentence) {
                quotes.push(sentence.to_string());
                if quotes.len() == config.max_quotes {
                    return quotes;
                }
            }
        }
    }
    quotes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLog;
    use crate::cache::MemoryCache;
    use crate::error::LlmError;
    use crate::llm::retry::RetryPolicy;
    use crate::testing::{features_json, raw, ScriptedBackend};

    fn matcher(name: &str) -> ProgramMatcher {
        ProgramMatcher::new(&ProgramDefinition::new(name)).unwrap()
    }

    fn analyzer(backend: Arc<ScriptedBackend>) -> (ProgramAnalyzer, Arc<MemoryAuditLog>) {
        let audit = Arc::new(MemoryAuditLog::new());
        let analyzer = analyzer_with(backend, Arc::new(MemoryCache::new()), audit.clone());
        (analyzer, audit)
    }

    fn analyzer_with(
        backend: Arc<ScriptedBackend>,
        cache: Arc<MemoryCache>,
        audit: Arc<MemoryAuditLog>,
    ) -> ProgramAnalyzer {
        let client = Arc::new(
            AnalysisClient::new(backend, cache, audit).with_retry(RetryPolicy::immediate(1)),
        );
        let extractor = Arc::new(ResponseFeatureExtractor::new(client.clone()));
        ProgramAnalyzer::new(client, extractor, ProgramConfig::default()).unwrap()
    }

    #[test]
    fn test_acronym_and_slug() {
        assert_eq!(acronym("Austin Live Music Fund").as_deref(), Some("ALMF"));
        assert_eq!(acronym("Art in Public Places").as_deref(), Some("APP"));
        assert_eq!(acronym("Nexus"), None);
        assert_eq!(
            program_slug("Creative Space Assistance Program"),
            "creative_space_assistance_program"
        );
    }

    #[test]
    fn test_matcher_spellings() {
        let almf = matcher("Austin Live Music Fund");
        assert!(almf.is_match("we got an almf grant"));
        assert!(almf.is_match("The AUSTIN LIVE MUSIC FUND helped"));

        let csap = matcher("Creative Space Assistance Program");
        assert!(csap.is_match("the Creative Space Assist Program was slow"));
        assert!(csap.is_match("creative space assistance rules"));
        assert!(csap.is_match("CSAP"));

        let nexus = matcher("Nexus");
        assert!(nexus.is_match("Nexus, mostly"));
        assert!(!nexus.is_match("nexusworld"));
    }

    #[test]
    fn test_quotes_are_deterministic_and_bounded() {
        let m = matcher("Nexus");
        let config = ProgramConfig::default();
        let texts = [
            "I love Nexus. The Nexus grant paid our rent this year! Thrive staff were kind.",
            "The Nexus grant paid our rent this year. Nexus should open earlier in spring?",
        ];

        let quotes = extract_quotes(&m, &texts, &config);
        assert_eq!(
            quotes,
            vec![
                "The Nexus grant paid our rent this year".to_string(),
                "Nexus should open earlier in spring".to_string(),
            ]
        );
        assert_eq!(quotes, extract_quotes(&m, &texts, &config));
    }

    #[tokio::test]
    async fn test_response_naming_two_programs_is_extracted_once() {
        let backend = Arc::new(ScriptedBackend::survey());
        let (analyzer, audit) = analyzer(backend.clone());
        let responses = vec![
            raw("r1", "q1", "Programs?", "Nexus and Thrive both helped our collective grow."),
            raw("r2", "q1", "Programs?", "No programs named here at all."),
        ];

        let feedback = analyzer.analyze_all_programs(&responses).await;

        assert_eq!(feedback.len(), 2);
        assert_eq!(audit.with_operation("feature_extraction_success").len(), 1);
        for name in ["Nexus", "Thrive"] {
            let f = &feedback[name];
            assert_eq!(f.mention_count, 1);
            assert_eq!(f.analyzed_count, 1);
            assert_eq!(f.strengths, vec!["Responsive staff".to_string()]);
        }
        assert_eq!(
            feedback["Nexus"].representative_quotes,
            vec!["Nexus and Thrive both helped our collective grow".to_string()]
        );
        assert_eq!(analyzer.mentions("Thrive and nexus"), vec!["Nexus", "Thrive"]);
    }

    #[tokio::test]
    async fn test_program_feedback_cached_by_slug() {
        let backend = Arc::new(ScriptedBackend::survey());
        let (analyzer, audit) = analyzer(backend.clone());
        let responses = vec![raw("r1", "q1", "Q?", "Elevate funded my first mural downtown.")];

        analyzer.analyze_all_programs(&responses).await;
        let calls = backend.calls();
        let again = analyzer.analyze_all_programs(&responses).await;

        assert_eq!(backend.calls(), calls);
        assert!(again.contains_key("Elevate"));
        assert_eq!(audit.with_operation("program_cache_hit").len(), 1);
    }

    #[tokio::test]
    async fn test_program_feedback_from_another_model_is_rederived() {
        let cache = Arc::new(MemoryCache::new());
        let audit = Arc::new(MemoryAuditLog::new());
        let responses = vec![raw("r1", "q1", "Q?", "Elevate funded my first mural downtown.")];

        let old = Arc::new(ScriptedBackend::survey_with_model("gpt-4o"));
        analyzer_with(old.clone(), cache.clone(), audit.clone())
            .analyze_all_programs(&responses)
            .await;
        assert_eq!(old.calls(), 2);

        let new = Arc::new(ScriptedBackend::survey_with_model("gpt-4.1"));
        let feedback = analyzer_with(new.clone(), cache.clone(), audit.clone())
            .analyze_all_programs(&responses)
            .await;

        // features and program themes are both re-derived under the new model
        assert_eq!(new.calls(), 2);
        assert!(audit.with_operation("program_cache_hit").is_empty());
        let stale = audit.with_operation("program_cache_stale");
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].data["cached_model"], "gpt-4o");
        assert_eq!(feedback["Elevate"].mention_count, 1);

        let record = CacheRecord::<ProgramFeedback>::load(
            cache.as_ref(),
            audit.as_ref(),
            "program_cache_invalid",
            PROGRAM_NAMESPACE,
            "elevate",
        )
        .unwrap();
        assert_eq!(record.model, "gpt-4.1");
    }

    #[tokio::test]
    async fn test_program_llm_failure_keeps_quotes() {
        let backend = Arc::new(ScriptedBackend::new("gpt-4.1", |req, _| {
            if ScriptedBackend::is_feature_request(req) {
                Ok(features_json("positive", &["murals"], "low", "artist").to_string())
            } else {
                Err(LlmError::transport("unavailable"))
            }
        }));
        let (analyzer, audit) = analyzer(backend);
        let responses = vec![raw(
            "r1",
            "q1",
            "Q?",
            "Art in Public Places brought murals to our block.",
        )];

        let feedback = analyzer.analyze_all_programs(&responses).await;
        let app = &feedback["Art in Public Places"];
        assert!(app.strengths.is_empty());
        assert_eq!(app.representative_quotes.len(), 1);
        assert_eq!(app.stakeholder_reach.len(), 1);
        assert_eq!(audit.errors_for("analyze_program_themes").len(), 1);
    }
}

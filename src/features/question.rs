//! Per-question roll-up of response features.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::audit::AuditLedger;
use crate::cache::{CacheRecord, CacheStore, QUESTION_NAMESPACE};
use crate::config::{AggregationConfig, SentimentSplitThresholds};
use crate::llm::prompts::QUESTION_INSIGHT_INSTRUCTIONS;
use crate::llm::schema::{FieldKind, FieldSpec, ResponseSchema};
use crate::llm::{AnalysisClient, StructuredRequest};

use super::extractor::ResponseFeatureExtractor;
use super::types::{
    QuestionAnalysis, QuestionTheme, RawResponse, ResponseFeatures, Sentiment, StakeholderType,
    ThemeSignal, Urgency,
};

const ANALYSIS_SCHEMA_VERSION: &str = "question-1.0";
const INSIGHT_TEMPERATURE: f32 = 0.4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    NotStarted,
    Extracting,
    Aggregating,
    InsightGeneration,
    Cached,
}

fn insight_schema() -> ResponseSchema {
    ResponseSchema {
        name: "question_insights",
        version: "1.0",
        fields: vec![
            FieldSpec::required("key_insights", FieldKind::TextList, "3-5 key insights"),
            FieldSpec::required(
                "recommendations",
                FieldKind::TextList,
                "3-5 actionable recommendations",
            ),
        ],
    }
}

pub struct QuestionAggregator {
    client: Arc<AnalysisClient>,
    extractor: Arc<ResponseFeatureExtractor>,
    cache: Arc<dyn CacheStore>,
    audit: Arc<dyn AuditLedger>,
    config: AggregationConfig,
}

impl QuestionAggregator {
    pub fn new(
        client: Arc<AnalysisClient>,
        extractor: Arc<ResponseFeatureExtractor>,
        config: AggregationConfig,
    ) -> Self {
        Self {
            cache: client.cache(),
            audit: client.audit(),
            client,
            extractor,
            config,
        }
    }

    fn enter(&self, question_id: &str, stage: Stage) {
        debug!(question_id, ?stage, "question stage");
        self.audit
            .record("question_stage", json!({ "question_id": question_id, "stage": stage }));
    }

    /// Full analysis of one question, or `None` when it has no responses or
    /// no response could be extracted. A cached analysis skips every stage.
    pub async fn analyze(
        &self,
        question_id: &str,
        question_text: &str,
        all_responses: &[RawResponse],
    ) -> Option<QuestionAnalysis> {
        if let Some(record) = CacheRecord::<QuestionAnalysis>::load(
            self.cache.as_ref(),
            self.audit.as_ref(),
            "question_cache_invalid",
            QUESTION_NAMESPACE,
            question_id,
        ) {
            if record.model == self.client.model()
                && record.schema_version == ANALYSIS_SCHEMA_VERSION
            {
                info!(question_id, "Loaded cached question analysis");
                self.enter(question_id, Stage::Cached);
                self.audit
                    .record("question_cache_hit", json!({ "question_id": question_id }));
                return Some(record.payload);
            }
            debug!(question_id, model = %record.model, "Stale question analysis, re-deriving");
            self.audit.record(
                "question_cache_stale",
                json!({
                    "question_id": question_id,
                    "cached_model": record.model,
                    "cached_schema_version": record.schema_version,
                }),
            );
        }
        self.enter(question_id, Stage::NotStarted);

        let slice: Vec<RawResponse> = all_responses
            .iter()
            .filter(|r| r.question_id == question_id && !r.text.trim().is_empty())
            .cloned()
            .collect();
        if slice.is_empty() {
            warn!(question_id, "No responses for question");
            return None;
        }
        info!(question_id, responses = slice.len(), "Analyzing question");

        self.enter(question_id, Stage::Extracting);
        let (extracted, report) = self.extractor.extract_batch(&slice).await;
        let features: Vec<ResponseFeatures> =
            extracted.into_iter().filter_map(|r| r.features).collect();
        if features.is_empty() {
            self.audit.record_error(
                "question_analysis",
                "no_features",
                "no response could be extracted",
                json!({ "question_id": question_id, "attempted": report.attempted }),
            );
            return None;
        }

        self.enter(question_id, Stage::Aggregating);
        let themes = aggregate_themes(&features, self.config.quotes_per_theme);
        let (contradictions, consensus_points) =
            detect_sentiment_splits(&themes, &self.config.split);

        let mut sentiment_distribution = BTreeMap::new();
        let mut urgency_distribution = BTreeMap::new();
        let mut stakeholder_distribution = BTreeMap::new();
        for f in &features {
            *sentiment_distribution.entry(f.sentiment).or_insert(0) += 1;
            *urgency_distribution.entry(f.urgency).or_insert(0) += 1;
            *stakeholder_distribution.entry(f.stakeholder_type).or_insert(0) += 1;
        }
        let high_urgency_count = features.iter().filter(|f| f.urgency == Urgency::High).count();
        let actionable_count = features
            .iter()
            .filter(|f| f.contains_actionable_feedback)
            .count();

        self.enter(question_id, Stage::InsightGeneration);
        let (key_insights, recommendations) = if themes.is_empty() {
            (vec![], vec![])
        } else {
            let prompt = insight_prompt(
                question_text,
                features.len(),
                high_urgency_count,
                actionable_count,
                &themes[..themes.len().min(self.config.insight_themes)],
            );
            self.generate_insights(question_id, &prompt).await
        };

        let mut themes = themes;
        themes.truncate(self.config.reported_themes);

        let analysis = QuestionAnalysis {
            question_id: question_id.to_string(),
            question_text: question_text.to_string(),
            expected_responses: slice.len(),
            response_count: features.len(),
            failed_extractions: report.failed,
            themes,
            sentiment_distribution,
            urgency_distribution,
            stakeholder_distribution,
            high_urgency_count,
            actionable_count,
            key_insights,
            recommendations,
            contradictions,
            consensus_points,
            model: self.client.model().to_string(),
            analyzed_at: Utc::now(),
        };

        let record = CacheRecord::new(
            question_id,
            self.client.model(),
            ANALYSIS_SCHEMA_VERSION,
            analysis.clone(),
        );
        if let Err(e) = record.store(self.cache.as_ref(), QUESTION_NAMESPACE) {
            warn!(question_id, error = %e, "Failed to cache question analysis");
        }

        self.audit.record(
            "question_analysis_complete",
            json!({
                "question_id": question_id,
                "expected_responses": analysis.expected_responses,
                "response_count": analysis.response_count,
                "failed_extractions": analysis.failed_extractions,
                "theme_count": analysis.themes.len(),
            }),
        );
        info!(
            question_id,
            response_count = analysis.response_count,
            themes = analysis.themes.len(),
            "Question analysis complete"
        );

        Some(analysis)
    }

    async fn generate_insights(
        &self,
        question_id: &str,
        prompt: &str,
    ) -> (Vec<String>, Vec<String>) {
        let schema = insight_schema();
        let result = self
            .client
            .generate_structured(StructuredRequest {
                prompt,
                instructions: QUESTION_INSIGHT_INSTRUCTIONS,
                temperature: Some(INSIGHT_TEMPERATURE),
                schema: &schema,
            })
            .await;

        match result {
            Ok(resp) => (
                string_list(&resp.content["key_insights"]),
                string_list(&resp.content["recommendations"]),
            ),
            Err(e) => {
                warn!(
                    question_id,
                    error = %e,
                    "Insight generation failed, continuing without insights"
                );
                self.audit.record_llm_error(
                    "generate_insights",
                    &e,
                    json!({ "question_id": question_id }),
                );
                (vec![], vec![])
            }
        }
    }
}

pub(crate) fn string_list(value: &serde_json::Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Default)]
struct ThemeAccumulator {
    count: usize,
    sentiments: BTreeMap<Sentiment, usize>,
    urgency_total: f64,
    stakeholders: BTreeMap<StakeholderType, usize>,
    quotes: Vec<String>,
}

/// Count each theme once per record. Percentages are over `features.len()`.
/// Ranked by count, ties by name.
pub fn aggregate_themes(
    features: &[ResponseFeatures],
    quotes_per_theme: usize,
) -> Vec<QuestionTheme> {
    let mut acc: HashMap<&str, ThemeAccumulator> = HashMap::new();

    for f in features {
        let mut seen: Vec<&str> = Vec::with_capacity(f.themes.len());
        for theme in f.themes.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
            if seen.contains(&theme) {
                continue;
            }
            seen.push(theme);

            let entry = acc.entry(theme).or_default();
            entry.count += 1;
            *entry.sentiments.entry(f.sentiment).or_insert(0) += 1;
            entry.urgency_total += f.urgency.score();
            *entry.stakeholders.entry(f.stakeholder_type).or_insert(0) += 1;

            let needle = theme.to_lowercase();
            for phrase in &f.key_phrases {
                if phrase.to_lowercase().contains(&needle) && !entry.quotes.contains(phrase) {
                    entry.quotes.push(phrase.clone());
                }
            }
        }
    }

    let total = features.len();
    let mut themes: Vec<QuestionTheme> = acc
        .into_iter()
        .map(|(theme, a)| QuestionTheme {
            theme: theme.to_string(),
            count: a.count,
            percentage: if total > 0 {
                a.count as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            representative_quotes: a.quotes.into_iter().take(quotes_per_theme).collect(),
            sentiment_distribution: a.sentiments,
            urgency_score: a.urgency_total / a.count as f64,
            stakeholder_breakdown: a.stakeholders,
        })
        .collect();

    themes.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.theme.cmp(&b.theme)));
    themes
}

/// Contradictions and consensus among the top themes. Comparisons are
/// strict: a share exactly at a bound does not qualify.
pub fn detect_sentiment_splits(
    themes: &[QuestionTheme],
    thresholds: &SentimentSplitThresholds,
) -> (Vec<ThemeSignal>, Vec<ThemeSignal>) {
    let mut contradictions = Vec::new();
    let mut consensus = Vec::new();

    for theme in themes.iter().take(thresholds.top_themes) {
        let mentions: usize = theme.sentiment_distribution.values().sum();
        if mentions < thresholds.min_mentions || mentions == 0 {
            continue;
        }
        let share = |s: Sentiment| {
            let count = theme.sentiment_distribution.get(&s).copied().unwrap_or(0);
            count as f64 / mentions as f64 * 100.0
        };
        let positive_pct = share(Sentiment::Positive);
        let negative_pct = share(Sentiment::Negative);
        let signal = |summary: String| ThemeSignal {
            theme: theme.theme.clone(),
            mentions,
            positive_pct,
            negative_pct,
            summary,
        };

        if positive_pct > thresholds.contradiction_pct
            && negative_pct > thresholds.contradiction_pct
        {
            contradictions.push(signal(format!(
                "{}: {:.0}% positive vs {:.0}% negative views",
                theme.theme, positive_pct, negative_pct
            )));
        } else if positive_pct > thresholds.consensus_pct {
            consensus.push(signal(format!(
                "Strong positive consensus on {} ({:.0}% positive)",
                theme.theme, positive_pct
            )));
        } else if negative_pct > thresholds.consensus_pct {
            consensus.push(signal(format!(
                "Strong negative consensus on {} ({:.0}% negative)",
                theme.theme, negative_pct
            )));
        }
    }

    (contradictions, consensus)
}

fn insight_prompt(
    question_text: &str,
    total: usize,
    high_urgency: usize,
    actionable: usize,
    themes: &[QuestionTheme],
) -> String {
    let pct = |n: usize| n as f64 / total.max(1) as f64 * 100.0;
    let theme_summary: Vec<String> = themes
        .iter()
        .map(|t| {
            format!(
                "- {}: {} mentions ({:.1}%), urgency score: {:.2}",
                t.theme, t.count, t.percentage, t.urgency_score
            )
        })
        .collect();

    format!(
        "Question: {}\n\nTotal Responses Analyzed: {}\nHigh Urgency Issues: {} ({:.1}%)\nActionable Feedback: {} ({:.1}%)\n\nTop Themes:\n{}\n\nGenerate key insights and actionable recommendations based on this analysis.",
        question_text,
        total,
        high_urgency,
        pct(high_urgency),
        actionable,
        pct(actionable),
        theme_summary.join("\n")
    )
}

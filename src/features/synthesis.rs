//! Cross-question synthesis: recurring themes, stakeholder perspectives,
//! systemic issues, sentiment outliers and strategic insights.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::audit::AuditLedger;
use crate::cache::{CacheRecord, CacheStore, SYNTHESIS_NAMESPACE};
use crate::config::SynthesisThresholds;
use crate::hash::{hash_serialized, short};
use crate::llm::prompts::STRATEGIC_INSTRUCTIONS;
use crate::llm::schema::{FieldKind, FieldSpec, ResponseSchema};
use crate::llm::{AnalysisClient, StructuredRequest};

use super::question::string_list;
use super::types::{
    CrossQuestionInsight, EstimatedConcern, InsightType, QuestionAnalysis, QuestionTheme,
    RecurringTheme, Sentiment, SentimentOutlier, SentimentPatterns, StakeholderPerspective,
    StakeholderType, SynthesisMetadata, SynthesisResult, Urgency, APPORTIONED_BY_QUESTION_SHARE,
};

const SYNTHESIS_SCHEMA_VERSION: &str = "synthesis-1.0";
const STRATEGIC_TEMPERATURE: f32 = 0.4;
const MAX_CONCERNS: usize = 10;

/// The parts of a question analysis that synthesis reads.
#[derive(Serialize)]
struct SynthesisInput<'a> {
    question_id: &'a str,
    question_text: &'a str,
    expected_responses: usize,
    response_count: usize,
    themes: &'a [QuestionTheme],
    sentiment_distribution: &'a BTreeMap<Sentiment, usize>,
    urgency_distribution: &'a BTreeMap<Urgency, usize>,
    stakeholder_distribution: &'a BTreeMap<StakeholderType, usize>,
    key_insights: &'a [String],
}

impl<'a> From<&'a QuestionAnalysis> for SynthesisInput<'a> {
    fn from(a: &'a QuestionAnalysis) -> Self {
        Self {
            question_id: &a.question_id,
            question_text: &a.question_text,
            expected_responses: a.expected_responses,
            response_count: a.response_count,
            themes: &a.themes,
            sentiment_distribution: &a.sentiment_distribution,
            urgency_distribution: &a.urgency_distribution,
            stakeholder_distribution: &a.stakeholder_distribution,
            key_insights: &a.key_insights,
        }
    }
}

pub struct CrossQuestionSynthesizer {
    client: Arc<AnalysisClient>,
    cache: Arc<dyn CacheStore>,
    audit: Arc<dyn AuditLedger>,
    thresholds: SynthesisThresholds,
}

impl CrossQuestionSynthesizer {
    pub fn new(client: Arc<AnalysisClient>, thresholds: SynthesisThresholds) -> Self {
        Self {
            cache: client.cache(),
            audit: client.audit(),
            client,
            thresholds,
        }
    }

    /// Synthesis cache key: the model, the thresholds and every analysis
    /// field synthesis reads. Analysis timestamps are left out.
    pub fn fingerprint(&self, analyses: &[QuestionAnalysis]) -> serde_json::Result<String> {
        let inputs: Vec<SynthesisInput<'_>> = analyses.iter().map(SynthesisInput::from).collect();
        hash_serialized(&(
            self.client.model(),
            SYNTHESIS_SCHEMA_VERSION,
            &self.thresholds,
            inputs,
        ))
    }

    pub async fn synthesize(&self, analyses: &[QuestionAnalysis]) -> SynthesisResult {
        let fingerprint = match self.fingerprint(analyses) {
            Ok(f) => Some(f),
            Err(e) => {
                warn!(error = %e, "Cannot fingerprint synthesis inputs, skipping cache");
                self.audit.record_error(
                    "synthesis_fingerprint",
                    "serialization_error",
                    &e.to_string(),
                    json!({ "questions": analyses.len() }),
                );
                None
            }
        };

        if let Some(fp) = &fingerprint {
            if let Some(record) = CacheRecord::<SynthesisResult>::load(
                self.cache.as_ref(),
                self.audit.as_ref(),
                "synthesis_cache_invalid",
                SYNTHESIS_NAMESPACE,
                fp,
            ) {
                if record.model == self.client.model()
                    && record.schema_version == SYNTHESIS_SCHEMA_VERSION
                {
                    info!(fingerprint = short(fp), "Loaded cached synthesis");
                    self.audit
                        .record("synthesis_cache_hit", json!({ "fingerprint": fp }));
                    return record.payload;
                }
            }
        }

        info!(questions = analyses.len(), "Synthesizing across questions");
        let t = &self.thresholds;
        let recurring_themes = identify_recurring_themes(analyses, t.min_recurring_questions);
        let stakeholder_perspectives =
            analyze_stakeholder_perspectives(analyses, t.stakeholder_theme_window);
        let systemic_issues =
            identify_systemic_issues(&recurring_themes, &stakeholder_perspectives, t);
        let sentiment_patterns = analyze_sentiment_patterns(analyses, t.outlier_margin_pct);
        let strategic_insights = self
            .generate_strategic_insights(analyses, &recurring_themes, &systemic_issues)
            .await;

        let result = SynthesisResult {
            metadata: SynthesisMetadata {
                synthesized_at: Utc::now(),
                fingerprint: fingerprint.clone().unwrap_or_default(),
                questions_analyzed: analyses.len(),
                expected_responses: analyses.iter().map(|a| a.expected_responses).sum(),
                analyzed_responses: analyses.iter().map(|a| a.response_count).sum(),
            },
            recurring_themes,
            stakeholder_perspectives,
            systemic_issues,
            sentiment_patterns,
            strategic_insights,
        };

        if let Some(fp) = &fingerprint {
            let record =
                CacheRecord::new(fp, self.client.model(), SYNTHESIS_SCHEMA_VERSION, result.clone());
            if let Err(e) = record.store(self.cache.as_ref(), SYNTHESIS_NAMESPACE) {
                warn!(error = %e, "Failed to cache synthesis");
            }
        }

        self.audit.record(
            "synthesis_complete",
            json!({
                "fingerprint": fingerprint,
                "recurring_themes": result.recurring_themes.len(),
                "systemic_issues": result.systemic_issues.len(),
                "strategic_insights": result.strategic_insights.len(),
                "outlier_questions": result.sentiment_patterns.outlier_questions.len(),
            }),
        );
        info!(
            recurring = result.recurring_themes.len(),
            systemic = result.systemic_issues.len(),
            "Synthesis complete"
        );

        result
    }

    async fn generate_strategic_insights(
        &self,
        analyses: &[QuestionAnalysis],
        recurring: &[RecurringTheme],
        systemic: &[CrossQuestionInsight],
    ) -> Vec<String> {
        if analyses.is_empty() {
            return vec![];
        }

        let theme_summary: Vec<String> = recurring
            .iter()
            .take(self.thresholds.strategic_themes)
            .map(|r| {
                format!(
                    "- {}: {} mentions across {} questions (urgency: {:.2})",
                    r.theme, r.total_mentions, r.question_count, r.average_urgency
                )
            })
            .collect();
        let systemic_summary: Vec<String> = systemic
            .iter()
            .take(self.thresholds.strategic_issues)
            .map(|i| format!("- {} (confidence: {:.2})", i.description, i.confidence))
            .collect();
        let prompt = format!(
            "Cross-Question Analysis Summary:\n\nTotal Survey Responses: {}\nQuestions Analyzed: {}\n\nTop Recurring Themes:\n{}\n\nIdentified Systemic Issues:\n{}\n\nGenerate strategic insights that address these cross-cutting concerns.",
            analyses.iter().map(|a| a.response_count).sum::<usize>(),
            analyses.len(),
            theme_summary.join("\n"),
            systemic_summary.join("\n"),
        );

        let schema = ResponseSchema {
            name: "strategic_insights",
            version: "1.0",
            fields: vec![FieldSpec::required(
                "strategic_insights",
                FieldKind::TextList,
                "5-7 strategic insights",
            )],
        };
        match self
            .client
            .generate_structured(StructuredRequest {
                prompt: &prompt,
                instructions: STRATEGIC_INSTRUCTIONS,
                temperature: Some(STRATEGIC_TEMPERATURE),
                schema: &schema,
            })
            .await
        {
            Ok(resp) => string_list(&resp.content["strategic_insights"]),
            Err(e) => {
                warn!(error = %e, "Strategic insight generation failed");
                self.audit
                    .record_llm_error("generate_strategic_insights", &e, json!({}));
                vec![]
            }
        }
    }
}

/// Case-fold and collapse punctuation and whitespace runs to single spaces.
pub fn normalize_theme(theme: &str) -> String {
    theme
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Default)]
struct RecurringAccumulator {
    labels: Vec<String>,
    question_ids: Vec<String>,
    total_mentions: usize,
    urgencies: Vec<f64>,
    sentiments: BTreeMap<Sentiment, usize>,
}

/// Themes present in at least `min_questions` distinct questions, ranked by
/// total mentions.
pub fn identify_recurring_themes(
    analyses: &[QuestionAnalysis],
    min_questions: usize,
) -> Vec<RecurringTheme> {
    let mut acc: BTreeMap<String, RecurringAccumulator> = BTreeMap::new();

    for analysis in analyses {
        for theme in &analysis.themes {
            let key = normalize_theme(&theme.theme);
            if key.is_empty() {
                continue;
            }
            let entry = acc.entry(key).or_default();
            if !entry.labels.contains(&theme.theme) {
                entry.labels.push(theme.theme.clone());
            }
            if !entry.question_ids.contains(&analysis.question_id) {
                entry.question_ids.push(analysis.question_id.clone());
            }
            entry.total_mentions += theme.count;
            entry.urgencies.push(theme.urgency_score);
            for (sentiment, count) in &theme.sentiment_distribution {
                *entry.sentiments.entry(*sentiment).or_insert(0) += count;
            }
        }
    }

    let mut recurring: Vec<RecurringTheme> = acc
        .into_iter()
        .filter(|(_, a)| a.question_ids.len() >= min_questions)
        .map(|(theme, a)| RecurringTheme {
            theme,
            labels: a.labels,
            question_count: a.question_ids.len(),
            total_mentions: a.total_mentions,
            question_ids: a.question_ids,
            average_urgency: a.urgencies.iter().sum::<f64>() / a.urgencies.len() as f64,
            sentiment_distribution: a.sentiments,
        })
        .collect();

    recurring.sort_by(|a, b| {
        b.total_mentions
            .cmp(&a.total_mentions)
            .then_with(|| a.theme.cmp(&b.theme))
    });
    recurring
}

/// Per-stakeholder theme concerns, estimated by apportioning each question's
/// top themes by that stakeholder's share of the question's respondents.
pub fn analyze_stakeholder_perspectives(
    analyses: &[QuestionAnalysis],
    theme_window: usize,
) -> Vec<StakeholderPerspective> {
    struct Acc {
        responses: usize,
        questions: Vec<String>,
        concerns: BTreeMap<String, f64>,
    }
    let mut acc: BTreeMap<StakeholderType, Acc> = BTreeMap::new();

    for analysis in analyses {
        for (stakeholder, count) in &analysis.stakeholder_distribution {
            let entry = acc.entry(*stakeholder).or_insert_with(|| Acc {
                responses: 0,
                questions: vec![],
                concerns: BTreeMap::new(),
            });
            entry.responses += count;
            if !entry.questions.contains(&analysis.question_id) {
                entry.questions.push(analysis.question_id.clone());
            }
            if analysis.response_count == 0 {
                continue;
            }
            let share = *count as f64 / analysis.response_count as f64;
            for theme in analysis.themes.iter().take(theme_window) {
                let estimate = theme.count as f64 * share;
                if estimate > 0.0 {
                    *entry.concerns.entry(normalize_theme(&theme.theme)).or_insert(0.0) += estimate;
                }
            }
        }
    }

    acc.into_iter()
        .map(|(stakeholder, a)| {
            let mut concerns: Vec<EstimatedConcern> = a
                .concerns
                .into_iter()
                .map(|(theme, estimated_mentions)| EstimatedConcern {
                    theme,
                    estimated_mentions,
                })
                .collect();
            concerns.sort_by(|x, y| {
                y.estimated_mentions
                    .total_cmp(&x.estimated_mentions)
                    .then_with(|| x.theme.cmp(&y.theme))
            });
            concerns.truncate(MAX_CONCERNS);

            StakeholderPerspective {
                stakeholder,
                total_responses: a.responses,
                questions_engaged: a.questions.len(),
                engagement_rate: a.questions.len() as f64 / analyses.len().max(1) as f64 * 100.0,
                estimated_concerns: concerns,
                attribution: APPORTIONED_BY_QUESTION_SHARE.to_string(),
            }
        })
        .collect()
}

/// Recurring themes whose mean urgency and breadth both reach the
/// thresholds (inclusive).
pub fn identify_systemic_issues(
    recurring: &[RecurringTheme],
    perspectives: &[StakeholderPerspective],
    t: &SynthesisThresholds,
) -> Vec<CrossQuestionInsight> {
    recurring
        .iter()
        .filter(|r| {
            r.average_urgency >= t.systemic_min_urgency
                && r.question_count >= t.systemic_min_questions
        })
        .map(|r| {
            let affected: Vec<StakeholderType> = perspectives
                .iter()
                .filter(|p| {
                    p.estimated_concerns
                        .iter()
                        .take(t.affected_concern_window)
                        .any(|c| c.theme == r.theme)
                })
                .map(|p| p.stakeholder)
                .collect();

            CrossQuestionInsight {
                insight_type: InsightType::SystemicIssue,
                theme: r.theme.clone(),
                description: format!(
                    "{} identified as a persistent barrier across {} questions",
                    title_case(&r.theme),
                    r.question_count
                ),
                supporting_questions: r.question_ids.clone(),
                evidence_count: r.total_mentions,
                confidence: (r.average_urgency + t.confidence_boost).min(t.confidence_cap),
                implications: vec![
                    format!("Affects {} stakeholder groups", affected.len()),
                    format!("Mentioned {} times across survey", r.total_mentions),
                    "Requires coordinated policy response".to_string(),
                ],
                affected_stakeholders: affected,
                severity_score: r.average_urgency,
            }
        })
        .collect()
}

/// Corpus sentiment shares and the questions whose negative share exceeds
/// the corpus share by more than `margin_pct` points.
pub fn analyze_sentiment_patterns(
    analyses: &[QuestionAnalysis],
    margin_pct: f64,
) -> SentimentPatterns {
    let mut overall: BTreeMap<Sentiment, usize> = BTreeMap::new();
    for analysis in analyses {
        for (sentiment, count) in &analysis.sentiment_distribution {
            *overall.entry(*sentiment).or_insert(0) += count;
        }
    }
    let total: usize = overall.values().sum();
    let overall_sentiment: BTreeMap<Sentiment, f64> = overall
        .iter()
        .map(|(s, c)| (*s, if total > 0 { *c as f64 / total as f64 * 100.0 } else { 0.0 }))
        .collect();
    let overall_negative = overall_sentiment
        .get(&Sentiment::Negative)
        .copied()
        .unwrap_or(0.0);

    let mut outlier_questions: Vec<SentimentOutlier> = analyses
        .iter()
        .filter_map(|a| {
            let question_total: usize = a.sentiment_distribution.values().sum();
            if question_total == 0 {
                return None;
            }
            let negative = a
                .sentiment_distribution
                .get(&Sentiment::Negative)
                .copied()
                .unwrap_or(0) as f64
                / question_total as f64
                * 100.0;
            (negative > overall_negative + margin_pct).then(|| SentimentOutlier {
                question_id: a.question_id.clone(),
                question_text: truncate_chars(&a.question_text, 100),
                negative_percentage: negative,
                difference: negative - overall_negative,
            })
        })
        .collect();
    outlier_questions.sort_by(|a, b| b.difference.total_cmp(&a.difference));

    SentimentPatterns {
        overall_sentiment,
        total_responses_analyzed: total,
        outlier_questions,
    }
}

fn title_case(s: &str) -> String {
    s.split(' ')
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max).collect::<String>())
    }
}

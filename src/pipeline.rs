use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::audit::{AuditLedger, LineageReport};
use crate::config::PipelineConfig;
use crate::features::types::{ProgramFeedback, QuestionAnalysis, RawResponse, SynthesisResult};
use crate::features::{
    CrossQuestionSynthesizer, ProgramAnalyzer, QuestionAggregator, ResponseFeatureExtractor,
};
use crate::llm::AnalysisClient;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    /// Non-blank responses handed to the pipeline.
    pub expected_responses: usize,
    /// Responses whose features fed the question analyses.
    pub analyzed_responses: usize,
    pub questions_analyzed: usize,
    /// Questions that produced no analysis.
    pub skipped_questions: Vec<String>,
    pub programs_analyzed: usize,
    pub model: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub metadata: ReportMetadata,
    pub questions: Vec<QuestionAnalysis>,
    pub synthesis: SynthesisResult,
    pub programs: BTreeMap<String, ProgramFeedback>,
    pub lineage: LineageReport,
}

/// Question ids and texts in first-seen order.
pub fn discover_questions(responses: &[RawResponse]) -> Vec<(String, String)> {
    let mut questions: Vec<(String, String)> = Vec::new();
    for r in responses {
        if !questions.iter().any(|(id, _)| id == &r.question_id) {
            questions.push((r.question_id.clone(), r.question_text.clone()));
        }
    }
    questions
}

pub struct SurveyPipeline {
    client: Arc<AnalysisClient>,
    audit: Arc<dyn AuditLedger>,
    aggregator: QuestionAggregator,
    synthesizer: CrossQuestionSynthesizer,
    programs: ProgramAnalyzer,
}

impl SurveyPipeline {
    pub fn new(client: Arc<AnalysisClient>, config: &PipelineConfig) -> Result<Self> {
        let extractor = Arc::new(
            ResponseFeatureExtractor::new(client.clone())
                .with_concurrency(config.extraction_concurrency),
        );
        Ok(Self {
            audit: client.audit(),
            aggregator: QuestionAggregator::new(
                client.clone(),
                extractor.clone(),
                config.aggregation.clone(),
            ),
            synthesizer: CrossQuestionSynthesizer::new(client.clone(), config.synthesis.clone()),
            programs: ProgramAnalyzer::new(client.clone(), extractor, config.programs.clone())
                .context("Failed to build program matchers")?,
            client,
        })
    }

    /// Question analyses, then synthesis, then program feedback. Every
    /// completed unit is cached before the next begins, so a rerun only
    /// processes what is still missing.
    pub async fn run(&self, responses: &[RawResponse]) -> Result<PipelineReport> {
        let started_at = Utc::now();
        let questions = discover_questions(responses);
        let expected_responses = responses.iter().filter(|r| !r.text.trim().is_empty()).count();

        info!(
            responses = responses.len(),
            questions = questions.len(),
            model = self.client.model(),
            "Pipeline starting"
        );
        self.audit.record(
            "pipeline_start",
            json!({
                "responses": responses.len(),
                "expected_responses": expected_responses,
                "questions": questions.len(),
                "model": self.client.model(),
            }),
        );

        let mut analyses = Vec::with_capacity(questions.len());
        let mut skipped_questions = Vec::new();
        for (question_id, question_text) in &questions {
            match self.aggregator.analyze(question_id, question_text, responses).await {
                Some(analysis) => analyses.push(analysis),
                None => {
                    warn!(question_id = %question_id, "Question produced no analysis");
                    skipped_questions.push(question_id.clone());
                }
            }
        }

        let synthesis = self.synthesizer.synthesize(&analyses).await;
        let programs = self.programs.analyze_all_programs(responses).await;

        let metadata = ReportMetadata {
            expected_responses,
            analyzed_responses: analyses.iter().map(|a| a.response_count).sum(),
            questions_analyzed: analyses.len(),
            skipped_questions,
            programs_analyzed: programs.len(),
            model: self.client.model().to_string(),
            started_at,
            finished_at: Utc::now(),
        };
        self.audit.record(
            "pipeline_complete",
            json!({
                "expected_responses": metadata.expected_responses,
                "analyzed_responses": metadata.analyzed_responses,
                "questions_analyzed": metadata.questions_analyzed,
                "skipped_questions": metadata.skipped_questions,
                "programs_analyzed": metadata.programs_analyzed,
            }),
        );
        info!(
            analyzed = metadata.analyzed_responses,
            expected = metadata.expected_responses,
            questions = metadata.questions_analyzed,
            programs = metadata.programs_analyzed,
            "Pipeline complete"
        );

        let lineage = LineageReport::from_ledger(self.audit.as_ref())
            .context("Failed to read audit ledger")?;

        Ok(PipelineReport {
            metadata,
            questions: analyses,
            synthesis,
            programs,
            lineage,
        })
    }
}

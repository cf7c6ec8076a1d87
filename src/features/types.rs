use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::schema::{FieldKind, FieldSpec, ResponseSchema};

pub const FEATURE_SCHEMA_VERSION: &str = "1.0";

/// One respondent's free-text answer to one question, as delivered by the
/// external loader.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawResponse {
    pub id: String,
    pub text: String,
    pub question_id: String,
    pub question_text: String,
    #[serde(default)]
    pub source: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
    Mixed,
}

impl Sentiment {
    pub const ALL: &'static [&'static str] = &["positive", "negative", "neutral", "mixed"];
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    High,
    Medium,
    Low,
}

impl Urgency {
    pub const ALL: &'static [&'static str] = &["high", "medium", "low"];

    pub fn score(self) -> f64 {
        match self {
            Urgency::High => 1.0,
            Urgency::Medium => 0.5,
            Urgency::Low => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StakeholderType {
    Artist,
    Organization,
    Resident,
    Educator,
    BusinessOwner,
    Funder,
    VenueOperator,
    Unknown,
}

impl StakeholderType {
    pub const ALL: &'static [&'static str] = &[
        "artist",
        "organization",
        "resident",
        "educator",
        "business_owner",
        "funder",
        "venue_operator",
        "unknown",
    ];
}

/// Structured judgment about one response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseFeatures {
    pub sentiment: Sentiment,
    pub sentiment_confidence: f64,
    pub themes: Vec<String>,
    pub urgency: Urgency,
    pub stakeholder_type: StakeholderType,
    pub stakeholder_confidence: f64,
    pub key_phrases: Vec<String>,
    pub intent: String,
    pub contains_actionable_feedback: bool,
    #[serde(default)]
    pub mentioned_programs: Vec<String>,
    #[serde(default)]
    pub barriers_identified: Vec<String>,
    #[serde(default)]
    pub solutions_proposed: Vec<String>,
}

const UNIT: FieldKind = FieldKind::Number {
    min: Some(0.0),
    max: Some(1.0),
};

pub fn feature_schema() -> ResponseSchema {
    ResponseSchema {
        name: "response_features",
        version: FEATURE_SCHEMA_VERSION,
        fields: vec![
            FieldSpec::required("sentiment", FieldKind::Enum(Sentiment::ALL), "overall sentiment"),
            FieldSpec::required("sentiment_confidence", UNIT, "confidence in the sentiment"),
            FieldSpec::required("themes", FieldKind::TextList, "3-7 specific themes"),
            FieldSpec::required(
                "urgency",
                FieldKind::Enum(Urgency::ALL),
                "urgency of the issues raised",
            ),
            FieldSpec::required(
                "stakeholder_type",
                FieldKind::Enum(StakeholderType::ALL),
                "type of respondent",
            ),
            FieldSpec::required(
                "stakeholder_confidence",
                UNIT,
                "confidence in the stakeholder type",
            ),
            FieldSpec::required(
                "key_phrases",
                FieldKind::TextList,
                "verbatim phrases capturing key ideas",
            ),
            FieldSpec::required("intent", FieldKind::Text, "primary intent of the response"),
            FieldSpec::required(
                "contains_actionable_feedback",
                FieldKind::Boolean,
                "whether specific actions are requested",
            ),
            FieldSpec::optional(
                "mentioned_programs",
                FieldKind::TextList,
                "programs mentioned by name",
            ),
            FieldSpec::optional(
                "barriers_identified",
                FieldKind::TextList,
                "obstacles to access or participation",
            ),
            FieldSpec::optional(
                "solutions_proposed",
                FieldKind::TextList,
                "improvements suggested",
            ),
        ],
    }
}

/// A response paired with its features, when extraction succeeded.
#[derive(Debug, Clone)]
pub struct ExtractedResponse {
    pub response: RawResponse,
    pub features: Option<ResponseFeatures>,
}

/// Outcome counts for one batch extraction.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ExtractionReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl ExtractionReport {
    /// Fraction in `[0, 1]`; an empty batch counts as fully successful.
    pub fn success_rate(&self) -> f64 {
        if self.attempted == 0 {
            1.0
        } else {
            self.succeeded as f64 / self.attempted as f64
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionTheme {
    pub theme: String,
    pub count: usize,
    /// 0-100, over the question's successfully extracted responses.
    pub percentage: f64,
    pub representative_quotes: Vec<String>,
    pub sentiment_distribution: BTreeMap<Sentiment, usize>,
    pub urgency_score: f64,
    pub stakeholder_breakdown: BTreeMap<StakeholderType, usize>,
}

/// Sentiment split observed for one theme.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThemeSignal {
    pub theme: String,
    pub mentions: usize,
    pub positive_pct: f64,
    pub negative_pct: f64,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionAnalysis {
    pub question_id: String,
    pub question_text: String,
    /// Responses found for the question.
    pub expected_responses: usize,
    /// Responses whose features were extracted; the denominator for every percentage.
    pub response_count: usize,
    pub failed_extractions: usize,
    pub themes: Vec<QuestionTheme>,
    pub sentiment_distribution: BTreeMap<Sentiment, usize>,
    pub urgency_distribution: BTreeMap<Urgency, usize>,
    pub stakeholder_distribution: BTreeMap<StakeholderType, usize>,
    pub high_urgency_count: usize,
    pub actionable_count: usize,
    pub key_insights: Vec<String>,
    pub recommendations: Vec<String>,
    pub contradictions: Vec<ThemeSignal>,
    pub consensus_points: Vec<ThemeSignal>,
    pub model: String,
    pub analyzed_at: DateTime<Utc>,
}

/// Only systemic issues are reported as cross-question insights.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InsightType {
    SystemicIssue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrossQuestionInsight {
    pub insight_type: InsightType,
    pub theme: String,
    pub description: String,
    pub supporting_questions: Vec<String>,
    pub evidence_count: usize,
    pub confidence: f64,
    pub implications: Vec<String>,
    pub affected_stakeholders: Vec<StakeholderType>,
    pub severity_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecurringTheme {
    /// Normalized label.
    pub theme: String,
    /// Labels as the service emitted them.
    pub labels: Vec<String>,
    pub question_count: usize,
    pub total_mentions: usize,
    pub question_ids: Vec<String>,
    pub average_urgency: f64,
    pub sentiment_distribution: BTreeMap<Sentiment, usize>,
}

pub const APPORTIONED_BY_QUESTION_SHARE: &str = "apportioned_by_question_share";

/// Theme concern estimated for a stakeholder group. Not a count of
/// individual responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EstimatedConcern {
    pub theme: String,
    pub estimated_mentions: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StakeholderPerspective {
    pub stakeholder: StakeholderType,
    pub total_responses: usize,
    pub questions_engaged: usize,
    /// 0-100, share of analyzed questions this group answered.
    pub engagement_rate: f64,
    pub estimated_concerns: Vec<EstimatedConcern>,
    /// How `estimated_concerns` was derived.
    pub attribution: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SentimentOutlier {
    pub question_id: String,
    pub question_text: String,
    pub negative_percentage: f64,
    /// Points above the corpus-wide negative share.
    pub difference: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SentimentPatterns {
    pub overall_sentiment: BTreeMap<Sentiment, f64>,
    pub total_responses_analyzed: usize,
    pub outlier_questions: Vec<SentimentOutlier>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SynthesisMetadata {
    pub synthesized_at: DateTime<Utc>,
    pub fingerprint: String,
    pub questions_analyzed: usize,
    pub expected_responses: usize,
    pub analyzed_responses: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SynthesisResult {
    pub metadata: SynthesisMetadata,
    pub recurring_themes: Vec<RecurringTheme>,
    pub stakeholder_perspectives: Vec<StakeholderPerspective>,
    pub systemic_issues: Vec<CrossQuestionInsight>,
    pub sentiment_patterns: SentimentPatterns,
    pub strategic_insights: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgramFeedback {
    pub program_name: String,
    /// Responses matching the program's patterns.
    pub mention_count: usize,
    /// Matching responses with extracted features.
    pub analyzed_count: usize,
    pub sentiment_summary: BTreeMap<Sentiment, usize>,
    pub strengths: Vec<String>,
    pub improvement_areas: Vec<String>,
    pub specific_requests: Vec<String>,
    pub representative_quotes: Vec<String>,
    pub impact_statements: Vec<String>,
    pub accessibility_issues: Vec<String>,
    pub stakeholder_reach: BTreeMap<StakeholderType, usize>,
    pub analyzed_at: DateTime<Utc>,
}

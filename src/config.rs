use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::error::LlmError;
use crate::llm::retry::RetryPolicy;

// Contradiction / consensus heuristic
pub const SPLIT_TOP_THEMES: usize = 10;
pub const SPLIT_MIN_MENTIONS: usize = 10;
pub const CONTRADICTION_PCT: f64 = 30.0;
pub const CONSENSUS_PCT: f64 = 70.0;

// Cross-question heuristics
pub const MIN_RECURRING_QUESTIONS: usize = 2;
pub const SYSTEMIC_MIN_URGENCY: f64 = 0.7;
pub const SYSTEMIC_MIN_QUESTIONS: usize = 3;
pub const SYSTEMIC_CONFIDENCE_BOOST: f64 = 0.2;
pub const SYSTEMIC_CONFIDENCE_CAP: f64 = 0.9;
pub const OUTLIER_MARGIN_PCT: f64 = 20.0;

pub const DEFAULT_PROGRAMS: &[&str] = &[
    "Nexus",
    "Thrive",
    "Elevate",
    "Austin Live Music Fund",
    "Art in Public Places",
    "Creative Space Assistance Program",
    "Cultural Arts Division",
    "Economic Development Department",
];

/// Which completion endpoint family to talk to.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendConfig {
    /// Multi-tenant OpenAI-compatible endpoint, bearer auth.
    OpenAiCompatible {
        base_url: String,
        api_key: String,
        model: String,
    },
    /// Dedicated deployment endpoint, `api-key` header auth.
    AzureDeployment {
        endpoint: String,
        api_key: String,
        deployment: String,
        api_version: String,
    },
}

impl BackendConfig {
    /// Model identity used in every cache key.
    pub fn model_identity(&self) -> &str {
        match self {
            Self::OpenAiCompatible { model, .. } => model,
            Self::AzureDeployment { deployment, .. } => deployment,
        }
    }

    pub fn provider(&self) -> &'static str {
        match self {
            Self::OpenAiCompatible { .. } => "openai",
            Self::AzureDeployment { .. } => "azure",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: BackendConfig,
    pub default_temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl LlmConfig {
    /// Read backend settings from the environment (`.env` honoured).
    /// A dedicated deployment wins when both of its settings are present.
    pub fn from_env() -> Result<Self, LlmError> {
        let var = |name: &str| dotenv::var(name).ok().filter(|v| !v.trim().is_empty());

        let backend = match (var("AZURE_OPENAI_ENDPOINT"), var("AZURE_OPENAI_API_KEY")) {
            (Some(endpoint), Some(api_key)) => BackendConfig::AzureDeployment {
                endpoint,
                api_key,
                deployment: var("AZURE_OPENAI_DEPLOYMENT").unwrap_or_else(|| "gpt-4-1".to_string()),
                api_version: var("AZURE_OPENAI_API_VERSION")
                    .unwrap_or_else(|| "2024-02-15-preview".to_string()),
            },
            _ => {
                let api_key = var("LLM_API_KEY").ok_or_else(|| {
                    LlmError::MissingCredentials(
                        "set AZURE_OPENAI_ENDPOINT + AZURE_OPENAI_API_KEY or LLM_API_KEY"
                            .to_string(),
                    )
                })?;
                BackendConfig::OpenAiCompatible {
                    base_url: var("LLM_BASE_URL")
                        .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
                    api_key,
                    model: var("LLM_MODEL").unwrap_or_else(|| "gpt-4.1".to_string()),
                }
            }
        };

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: parse_or(var("LLM_RETRY_ATTEMPTS"), defaults.max_attempts),
            base_delay: Duration::from_millis(parse_or(
                var("LLM_RETRY_BASE_MS"),
                defaults.base_delay.as_millis() as u64,
            )),
            max_delay: Duration::from_millis(parse_or(
                var("LLM_RETRY_MAX_MS"),
                defaults.max_delay.as_millis() as u64,
            )),
        };

        Ok(Self {
            backend,
            default_temperature: parse_or(var("LLM_TEMPERATURE"), 0.3),
            max_tokens: parse_or(var("LLM_MAX_TOKENS"), 2000),
            timeout: Duration::from_secs(parse_or(var("LLM_TIMEOUT_SECS"), 120)),
            retry,
        })
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

/// Contradiction and consensus bounds, applied with strict `>`.
#[derive(Debug, Clone)]
pub struct SentimentSplitThresholds {
    pub top_themes: usize,
    pub min_mentions: usize,
    pub contradiction_pct: f64,
    pub consensus_pct: f64,
}

impl Default for SentimentSplitThresholds {
    fn default() -> Self {
        Self {
            top_themes: SPLIT_TOP_THEMES,
            min_mentions: SPLIT_MIN_MENTIONS,
            contradiction_pct: CONTRADICTION_PCT,
            consensus_pct: CONSENSUS_PCT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggregationConfig {
    /// Ranked themes kept on a QuestionAnalysis.
    pub reported_themes: usize,
    /// Themes summarized in the insight prompt.
    pub insight_themes: usize,
    pub quotes_per_theme: usize,
    pub split: SentimentSplitThresholds,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            reported_themes: 20,
            insight_themes: 15,
            quotes_per_theme: 5,
            split: SentimentSplitThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SynthesisThresholds {
    pub min_recurring_questions: usize,
    pub systemic_min_urgency: f64,
    pub systemic_min_questions: usize,
    pub confidence_boost: f64,
    pub confidence_cap: f64,
    pub outlier_margin_pct: f64,
    /// Top themes per question apportioned to stakeholders.
    pub stakeholder_theme_window: usize,
    /// Top concerns per stakeholder checked for systemic-issue impact.
    pub affected_concern_window: usize,
    pub strategic_themes: usize,
    pub strategic_issues: usize,
}

impl Default for SynthesisThresholds {
    fn default() -> Self {
        Self {
            min_recurring_questions: MIN_RECURRING_QUESTIONS,
            systemic_min_urgency: SYSTEMIC_MIN_URGENCY,
            systemic_min_questions: SYSTEMIC_MIN_QUESTIONS,
            confidence_boost: SYSTEMIC_CONFIDENCE_BOOST,
            confidence_cap: SYSTEMIC_CONFIDENCE_CAP,
            outlier_margin_pct: OUTLIER_MARGIN_PCT,
            stakeholder_theme_window: 10,
            affected_concern_window: 5,
            strategic_themes: 10,
            strategic_issues: 5,
        }
    }
}

/// A known program and the hand-picked spellings respondents use for it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramDefinition {
    pub name: String,
    pub variants: Vec<String>,
}

impl ProgramDefinition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            variants: default_variants(name),
        }
    }

    pub fn with_variants(name: &str, variants: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            variants: variants.iter().map(|v| v.to_string()).collect(),
        }
    }
}

fn default_variants(name: &str) -> Vec<String> {
    let mut variants = Vec::new();
    if name.contains("Assistance") {
        variants.push(name.replace("Assistance", "Assist"));
    }
    if name.contains(" Program") {
        variants.push(name.replace(" Program", ""));
    }
    variants
}

#[derive(Debug, Clone)]
pub struct ProgramConfig {
    pub catalog: Vec<ProgramDefinition>,
    pub sample_cap: usize,
    pub sample_chars: usize,
    pub max_quotes: usize,
    pub quote_min_chars: usize,
    pub quote_max_chars: usize,
}

impl Default for ProgramConfig {
    fn default() -> Self {
        Self {
            catalog: DEFAULT_PROGRAMS
                .iter()
                .map(|name| ProgramDefinition::new(name))
                .collect(),
            sample_cap: 50,
            sample_chars: 300,
            max_quotes: 10,
            quote_min_chars: 20,
            quote_max_chars: 200,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub audit_dir: PathBuf,
    pub extraction_concurrency: usize,
    pub aggregation: AggregationConfig,
    pub synthesis: SynthesisThresholds,
    pub programs: ProgramConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from("./data");
        Self {
            audit_dir: data_dir.join("audit"),
            data_dir,
            extraction_concurrency: 4,
            aggregation: AggregationConfig::default(),
            synthesis: SynthesisThresholds::default(),
            programs: ProgramConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = dotenv::var("SURVEY_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
            config.audit_dir = config.data_dir.join("audit");
        }
        if let Ok(dir) = dotenv::var("SURVEY_AUDIT_DIR") {
            config.audit_dir = PathBuf::from(dir);
        }
        config.extraction_concurrency = parse_or(
            dotenv::var("EXTRACTION_CONCURRENCY").ok(),
            config.extraction_concurrency,
        )
        .max(1);

        let programs: Vec<ProgramDefinition> = dotenv::var("SURVEY_PROGRAMS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ProgramDefinition::new)
            .collect();
        if !programs.is_empty() {
            config.programs.catalog = programs;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_thresholds_are_named_constants() {
        let split = SentimentSplitThresholds::default();
        assert_eq!(split.contradiction_pct, CONTRADICTION_PCT);
        assert_eq!(split.consensus_pct, CONSENSUS_PCT);
        assert_eq!(split.top_themes, 10);
        assert_eq!(split.min_mentions, 10);

        let synth = SynthesisThresholds::default();
        assert_eq!(synth.systemic_min_urgency, 0.7);
        assert_eq!(synth.systemic_min_questions, 3);
        assert_eq!(synth.outlier_margin_pct, 20.0);
    }

    #[test]
    fn test_program_variants() {
        let def = ProgramDefinition::new("Creative Space Assistance Program");
        assert_eq!(
            def.variants,
            vec![
                "Creative Space Assist Program".to_string(),
                "Creative Space Assistance".to_string()
            ]
        );
        assert!(ProgramDefinition::new("Nexus").variants.is_empty());
    }

    #[test]
    fn test_default_catalog_includes_city_departments() {
        let names: Vec<String> = ProgramConfig::default()
            .catalog
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names.len(), 8);
        assert!(names.contains(&"Cultural Arts Division".to_string()));
        assert!(names.contains(&"Economic Development Department".to_string()));
    }

    #[test]
    fn test_model_identity_per_backend() {
        let azure = BackendConfig::AzureDeployment {
            endpoint: "https://x.openai.azure.com".into(),
            api_key: "k".into(),
            deployment: "gpt-4-1".into(),
            api_version: "2024-02-15-preview".into(),
        };
        assert_eq!(azure.model_identity(), "gpt-4-1");
        assert_eq!(azure.provider(), "azure");
    }
}

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, Level};

use survey_insights::audit::JsonlAuditLog;
use survey_insights::cache::FileCache;
use survey_insights::config::{LlmConfig, PipelineConfig};
use survey_insights::features::types::RawResponse;
use survey_insights::llm::AnalysisClient;
use survey_insights::SurveyPipeline;

/// Layered insight analysis of free-text survey responses.
#[derive(Parser, Debug)]
#[command(name = "survey-insights", version, about, long_about = None)]
struct Cli {
    /// JSON array of raw responses produced by the survey loader
    input: PathBuf,

    /// Where to write the report (stdout when omitted)
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load env
    let _ = dotenv::dotenv();

    let level = dotenv::var("LOG_LEVEL")
        .ok()
        .and_then(|s| s.parse::<Level>().ok())
        .unwrap_or(Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    let raw = tokio::fs::read_to_string(&cli.input)
        .await
        .with_context(|| format!("Failed to read {}", cli.input.display()))?;
    let responses: Vec<RawResponse> = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse {}", cli.input.display()))?;
    info!(count = responses.len(), path = %cli.input.display(), "Responses loaded");

    let config = PipelineConfig::from_env();
    let llm_config = LlmConfig::from_env()?;
    info!(
        provider = llm_config.backend.provider(),
        model = llm_config.backend.model_identity(),
        "LLM backend configured"
    );

    // Init storage
    let cache = Arc::new(FileCache::new(&config.data_dir)?);
    let audit = Arc::new(JsonlAuditLog::open(&config.audit_dir, None)?);
    info!(cache = ?config.data_dir, audit = ?audit.path(), "Storage initialized");

    audit
        .close_after(async {
            let client = AnalysisClient::from_config(&llm_config, cache, audit.clone())?;
            let pipeline = SurveyPipeline::new(Arc::new(client), &config)?;

            let report = pipeline.run(&responses).await?;
            let rendered = serde_json::to_string_pretty(&report)?;
            match &cli.output {
                Some(path) => {
                    tokio::fs::write(path, rendered)
                        .await
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    info!(path = %path.display(), "Report written");
                }
                None => println!("{}", rendered),
            }
            Ok::<(), anyhow::Error>(())
        })
        .await
}

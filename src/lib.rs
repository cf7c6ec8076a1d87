pub mod audit;
pub mod cache;
pub mod config;
pub mod error;
pub mod features;
pub mod hash;
pub mod llm;
pub mod pipeline;

#[cfg(test)]
mod testing;

pub use error::LlmError;
pub use pipeline::{PipelineReport, SurveyPipeline};

//! The four aggregation levels: response, question, cross-question, program.

pub mod extractor;
pub mod programs;
pub mod question;
pub mod synthesis;
pub mod types;

pub use extractor::ResponseFeatureExtractor;
pub use programs::ProgramAnalyzer;
pub use question::QuestionAggregator;
pub use synthesis::CrossQuestionSynthesizer;

//! Language-model enrichment of ontology entities

pub mod llm;
pub mod parse;
pub mod pipeline;
pub mod prompt;
pub mod questions;

pub use llm::{HttpLlmClient, LlmClient};
pub use pipeline::{EnrichmentPipeline, EnrichmentSummary};
pub use questions::{OpenQuestion, QuestionQueue};

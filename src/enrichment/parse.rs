//! Parsing of enrichment responses

use crate::error::AppError;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EnrichedEntity {
    pub table_name: String,
    pub entity_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub key_columns: Vec<String>,
    #[serde(default)]
    pub alternative_names: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EnrichmentResponse {
    pub entities: Vec<EnrichedEntity>,
    #[serde(default)]
    pub questions: Vec<String>,
}

/// Parse a model reply, tolerating a markdown code fence around the JSON
pub fn parse_response(content: &str) -> Result<EnrichmentResponse, AppError> {
    let body = strip_code_fence(content.trim());
    serde_json::from_str(body).map_err(|e| AppError::EnrichmentParse(e.to_string()))
}

fn strip_code_fence(content: &str) -> &str {
    let Some(rest) = content.strip_prefix("```") else {
        return content;
    };
    // Drop the info string (`json`) on the opening line
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

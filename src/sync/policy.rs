//! Auto-select policy
//!
//! Decides whether a newly discovered table joins the effective schema
//! without review. Patterns come from configuration.

use crate::config::SyncConfig;
use crate::error::AppError;
use regex::{Regex, RegexBuilder};

#[derive(Debug, Clone)]
pub struct AutoSelectPolicy {
    exclusions: Vec<Regex>,
}

impl AutoSelectPolicy {
    /// Compile case-insensitive exclusion patterns
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, AppError> {
        let exclusions = patterns
            .iter()
            .map(|p| {
                RegexBuilder::new(p.as_ref())
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| {
                        AppError::Config(format!("Invalid exclusion pattern '{}': {}", p.as_ref(), e))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { exclusions })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self, AppError> {
        Self::new(config.exclude_patterns.as_slice())
    }

    /// Bare table name matches an exclusion pattern
    pub fn is_excluded(&self, table_name: &str) -> bool {
        self.exclusions.iter().any(|re| re.is_match(table_name))
    }

    pub fn should_select(&self, table_name: &str) -> bool {
        !self.is_excluded(table_name)
    }

    /// Lowercased table name with every exclusion decoration stripped, so
    /// `s1_customers`, `customers_backup` and `customers` share one name
    pub fn canonical_name(&self, table_name: &str) -> String {
        let mut name = table_name.to_lowercase();
        for re in &self.exclusions {
            let stripped = re.replace(&name, "").into_owned();
            if !stripped.is_empty() {
                name = stripped;
            }
        }
        name
    }
}

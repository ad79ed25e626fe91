//! Enrichment prompts

use crate::models::{qualify, OntologyEntity, SchemaColumn};
use std::fmt::Write;

pub const SYSTEM_MESSAGE: &str = "You are a data modeling assistant. You name the business \
concepts behind database tables and describe them for analysts. Answer with JSON only.";

/// An entity plus the live columns of its primary table
#[derive(Debug, Clone)]
pub struct EntityContext {
    pub entity: OntologyEntity,
    pub columns: Vec<SchemaColumn>,
}

impl EntityContext {
    /// `schema.table`, the key the model must echo back
    pub fn table_key(&self) -> String {
        qualify(&self.entity.primary_schema, &self.entity.primary_table)
    }
}

pub fn build_prompt(batch: &[EntityContext]) -> String {
    let mut prompt = String::from(
        "For each table below, propose a business entity.\n\
         Respond with a JSON object of this shape:\n\
         {\"entities\": [{\"table_name\": \"schema.table\", \"entity_name\": \"...\", \
         \"description\": \"...\", \"domain\": \"...\", \"key_columns\": [\"...\"], \
         \"alternative_names\": [\"...\"]}], \"questions\": [\"...\"]}\n\
         Return exactly one entry per table and copy table_name verbatim. \
         Use questions for anything you could not decide from the schema alone.\n\nTables:\n",
    );

    for context in batch {
        let _ = writeln!(prompt, "\n- {}", context.table_key());
        for column in &context.columns {
            let _ = writeln!(
                prompt,
                "    {} {}{}{}",
                column.column_name,
                column.data_type,
                if column.is_primary_key { " PRIMARY KEY" } else { "" },
                if column.is_nullable { "" } else { " NOT NULL" },
            );
        }
    }
    prompt
}

//! Change classifier
//!
//! Turns a refresh result into pending change records. Destructive deltas
//! are already true at the source and are recorded as `auto_applied`;
//! everything else waits for review.

use crate::db::ChangeStore;
use crate::error::AppError;
use crate::models::{split_qualified, ChangeStatus, PendingChange, SchemaDelta, SuggestedAction};
use crate::sync::RefreshResult;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

static IRREGULAR_PLURALS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("people", "person"),
        ("children", "child"),
        ("men", "man"),
        ("women", "woman"),
        ("mice", "mouse"),
        ("geese", "goose"),
        ("feet", "foot"),
        ("teeth", "tooth"),
        ("indices", "index"),
        ("matrices", "matrix"),
        ("vertices", "vertex"),
        ("criteria", "criterion"),
        ("data", "data"),
        ("media", "media"),
        ("series", "series"),
        ("news", "news"),
        ("uses", "use"),
    ])
});

/// Singular form of one lowercase English word
pub fn singularize(word: &str) -> String {
    let lower = word.to_lowercase();
    if let Some(singular) = IRREGULAR_PLURALS.get(lower.as_str()) {
        return singular.to_string();
    }
    if lower.len() <= 2 || ["ss", "us", "is"].iter().any(|s| lower.ends_with(s)) {
        return lower;
    }
    if let Some(stem) = lower.strip_suffix("ies") {
        if stem.len() > 1 {
            return format!("{}y", stem);
        }
    }
    // statuses, buses, campuses; but not houses or causes
    if lower.ends_with("uses") && !lower.ends_with("ouses") && !lower.ends_with("auses") {
        return lower[..lower.len() - 2].to_string();
    }
    for suffix in ["sses", "shes", "ches", "xes", "zes"] {
        if lower.ends_with(suffix) {
            return lower[..lower.len() - 2].to_string();
        }
    }
    match lower.strip_suffix('s') {
        Some(stem) => stem.to_string(),
        None => lower,
    }
}

/// Display name for a table: schema stripped, last word singularized,
/// words title-cased. `public.order_items` becomes `Order Item`.
pub fn suggested_entity_name(table_name: &str) -> String {
    let (_, bare) = split_qualified(table_name);
    let mut words: Vec<String> = bare
        .split(|c: char| c == '_' || c == '-' || c == ' ')
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();
    if let Some(last) = words.pop() {
        words.push(singularize(&last));
    }
    words
        .iter()
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Status a freshly detected delta starts in
fn initial_status(delta: &SchemaDelta) -> ChangeStatus {
    match delta {
        SchemaDelta::DroppedTable { .. } | SchemaDelta::DroppedColumn { .. } => {
            ChangeStatus::AutoApplied
        }
        SchemaDelta::NewTable { .. }
        | SchemaDelta::NewColumn { .. }
        | SchemaDelta::ModifiedColumn { .. } => ChangeStatus::Pending,
    }
}

fn suggestion(delta: &SchemaDelta) -> Option<SuggestedAction> {
    match delta {
        SchemaDelta::NewTable { table_name } => Some(SuggestedAction::CreateEntity {
            name: suggested_entity_name(table_name),
        }),
        SchemaDelta::DroppedTable { .. }
        | SchemaDelta::NewColumn { .. }
        | SchemaDelta::DroppedColumn { .. }
        | SchemaDelta::ModifiedColumn { .. } => None,
    }
}

pub struct ChangeClassifier;

impl ChangeClassifier {
    /// One change per delta: tables first, then columns
    pub fn classify(project_id: Uuid, result: &RefreshResult) -> Vec<PendingChange> {
        let deltas = result
            .new_table_names
            .iter()
            .map(|t| SchemaDelta::NewTable { table_name: t.clone() })
            .chain(
                result
                    .removed_table_names
                    .iter()
                    .map(|t| SchemaDelta::DroppedTable { table_name: t.clone() }),
            )
            .chain(result.new_columns.iter().map(|c| SchemaDelta::NewColumn {
                table_name: c.table_name.clone(),
                column_name: c.column_name.clone(),
                data_type: c.data_type.clone(),
            }))
            .chain(result.removed_columns.iter().map(|c| SchemaDelta::DroppedColumn {
                table_name: c.table_name.clone(),
                column_name: c.column_name.clone(),
                data_type: c.data_type.clone(),
            }))
            .chain(result.modified_columns.iter().map(|c| SchemaDelta::ModifiedColumn {
                table_name: c.table_name.clone(),
                column_name: c.column_name.clone(),
                old_type: c.old_type.clone(),
                new_type: c.new_type.clone(),
            }));

        deltas
            .map(|delta| {
                let status = initial_status(&delta);
                let suggestion = suggestion(&delta);
                let change = PendingChange::new(project_id, result.datasource_id, delta, status);
                match suggestion {
                    Some(action) => change.with_suggestion(action),
                    None => change,
                }
            })
            .collect()
    }

    /// Classify and persist as one batch
    pub async fn record(
        store: &dyn ChangeStore,
        project_id: Uuid,
        result: &RefreshResult,
    ) -> Result<Vec<PendingChange>, AppError> {
        let changes = Self::classify(project_id, result);
        if changes.is_empty() {
            return Ok(changes);
        }
        store.create_changes(&changes).await?;
        debug!(
            "Recorded {} changes for project {} ({} pending)",
            changes.len(),
            project_id,
            changes.iter().filter(|c| c.is_pending()).count()
        );
        Ok(changes)
    }
}

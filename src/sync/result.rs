//! Refresh result: counts plus the itemized deltas the classifier consumes

use serde::Serialize;
use uuid::Uuid;

/// A column that appeared or disappeared. `table_name` is schema-qualified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnChange {
    pub table_name: String,
    pub column_name: String,
    pub data_type: String,
}

/// A column whose declared type changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnModification {
    pub table_name: String,
    pub column_name: String,
    pub old_type: String,
    pub new_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResult {
    pub datasource_id: Uuid,
    pub tables_upserted: usize,
    pub tables_deleted: usize,
    pub columns_upserted: usize,
    pub columns_deleted: usize,
    pub relationships_created: usize,
    pub relationships_deleted: u64,
    /// Foreign keys whose endpoints could not be resolved
    pub foreign_keys_skipped: usize,
    /// Foreign keys left alone because a human or agent owns the relationship
    pub relationships_protected: usize,

    pub new_table_names: Vec<String>,
    pub removed_table_names: Vec<String>,
    pub new_columns: Vec<ColumnChange>,
    pub removed_columns: Vec<ColumnChange>,
    pub modified_columns: Vec<ColumnModification>,

    /// SHA-256 of the discovered schema
    pub fingerprint: String,
}

impl RefreshResult {
    /// Any delta worth a pending change
    pub fn has_deltas(&self) -> bool {
        !(self.new_table_names.is_empty()
            && self.removed_table_names.is_empty()
            && self.new_columns.is_empty()
            && self.removed_columns.is_empty()
            && self.modified_columns.is_empty())
    }
}

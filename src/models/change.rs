//! Pending change records
//!
//! One record per detected schema delta. The delta itself is a closed enum so
//! classification and resolution both have to match every variant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Flat discriminant of [`SchemaDelta`], used for filtering and storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    NewTable,
    DroppedTable,
    NewColumn,
    DroppedColumn,
    ModifiedColumn,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::NewTable => "new_table",
            ChangeType::DroppedTable => "dropped_table",
            ChangeType::NewColumn => "new_column",
            ChangeType::DroppedColumn => "dropped_column",
            ChangeType::ModifiedColumn => "modified_column",
        }
    }
}

impl FromStr for ChangeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new_table" => Ok(ChangeType::NewTable),
            "dropped_table" => Ok(ChangeType::DroppedTable),
            "new_column" => Ok(ChangeType::NewColumn),
            "dropped_column" => Ok(ChangeType::DroppedColumn),
            "modified_column" => Ok(ChangeType::ModifiedColumn),
            other => Err(format!("unknown change type '{}'", other)),
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected delta between the live schema and the mirror.
/// Table names are schema-qualified (`public.orders`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "changeType", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SchemaDelta {
    NewTable {
        table_name: String,
    },
    DroppedTable {
        table_name: String,
    },
    NewColumn {
        table_name: String,
        column_name: String,
        data_type: String,
    },
    DroppedColumn {
        table_name: String,
        column_name: String,
        data_type: String,
    },
    ModifiedColumn {
        table_name: String,
        column_name: String,
        old_type: String,
        new_type: String,
    },
}

impl SchemaDelta {
    pub fn change_type(&self) -> ChangeType {
        match self {
            SchemaDelta::NewTable { .. } => ChangeType::NewTable,
            SchemaDelta::DroppedTable { .. } => ChangeType::DroppedTable,
            SchemaDelta::NewColumn { .. } => ChangeType::NewColumn,
            SchemaDelta::DroppedColumn { .. } => ChangeType::DroppedColumn,
            SchemaDelta::ModifiedColumn { .. } => ChangeType::ModifiedColumn,
        }
    }

    pub fn table_name(&self) -> &str {
        match self {
            SchemaDelta::NewTable { table_name }
            | SchemaDelta::DroppedTable { table_name }
            | SchemaDelta::NewColumn { table_name, .. }
            | SchemaDelta::DroppedColumn { table_name, .. }
            | SchemaDelta::ModifiedColumn { table_name, .. } => table_name,
        }
    }

    pub fn column_name(&self) -> Option<&str> {
        match self {
            SchemaDelta::NewTable { .. } | SchemaDelta::DroppedTable { .. } => None,
            SchemaDelta::NewColumn { column_name, .. }
            | SchemaDelta::DroppedColumn { column_name, .. }
            | SchemaDelta::ModifiedColumn { column_name, .. } => Some(column_name),
        }
    }

    /// Value before the change, `{type: <dataType>}` for columns
    pub fn old_value(&self) -> Option<Value> {
        match self {
            SchemaDelta::DroppedColumn { data_type, .. } => Some(json!({ "type": data_type })),
            SchemaDelta::ModifiedColumn { old_type, .. } => Some(json!({ "type": old_type })),
            SchemaDelta::NewTable { .. }
            | SchemaDelta::DroppedTable { .. }
            | SchemaDelta::NewColumn { .. } => None,
        }
    }

    /// Value after the change, `{type: <dataType>}` for columns
    pub fn new_value(&self) -> Option<Value> {
        match self {
            SchemaDelta::NewColumn { data_type, .. } => Some(json!({ "type": data_type })),
            SchemaDelta::ModifiedColumn { new_type, .. } => Some(json!({ "type": new_type })),
            SchemaDelta::NewTable { .. }
            | SchemaDelta::DroppedTable { .. }
            | SchemaDelta::DroppedColumn { .. } => None,
        }
    }

    /// Rebuild a delta from its stored columns
    pub fn from_parts(
        change_type: ChangeType,
        table_name: String,
        column_name: Option<String>,
        old_value: Option<&Value>,
        new_value: Option<&Value>,
    ) -> Result<Self, String> {
        let type_of = |v: Option<&Value>| {
            v.and_then(|v| v.get("type"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let column = || {
            column_name
                .clone()
                .ok_or_else(|| format!("{} change on {} has no column", change_type, table_name))
        };

        Ok(match change_type {
            ChangeType::NewTable => SchemaDelta::NewTable { table_name },
            ChangeType::DroppedTable => SchemaDelta::DroppedTable { table_name },
            ChangeType::NewColumn => SchemaDelta::NewColumn {
                column_name: column()?,
                data_type: type_of(new_value),
                table_name,
            },
            ChangeType::DroppedColumn => SchemaDelta::DroppedColumn {
                column_name: column()?,
                data_type: type_of(old_value),
                table_name,
            },
            ChangeType::ModifiedColumn => SchemaDelta::ModifiedColumn {
                column_name: column()?,
                old_type: type_of(old_value),
                new_type: type_of(new_value),
                table_name,
            },
        })
    }
}

/// Review state of a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    /// Waiting for a decision
    Pending,
    Approved,
    Rejected,
    /// No review gate: the source already removed the element
    AutoApplied,
}

impl ChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeStatus::Pending => "pending",
            ChangeStatus::Approved => "approved",
            ChangeStatus::Rejected => "rejected",
            ChangeStatus::AutoApplied => "auto_applied",
        }
    }
}

impl FromStr for ChangeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ChangeStatus::Pending),
            "approved" => Ok(ChangeStatus::Approved),
            "rejected" => Ok(ChangeStatus::Rejected),
            "auto_applied" => Ok(ChangeStatus::AutoApplied),
            other => Err(format!("unknown change status '{}'", other)),
        }
    }
}

/// Where a change was detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSource {
    SchemaRefresh,
}

impl ChangeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeSource::SchemaRefresh => "schema_refresh",
        }
    }
}

/// Follow-up the reviewer is offered when approving a change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "snake_case")]
pub enum SuggestedAction {
    /// Create a domain entity for a newly discovered table
    CreateEntity { name: String },
}

impl SuggestedAction {
    pub fn tag(&self) -> &'static str {
        match self {
            SuggestedAction::CreateEntity { .. } => "create_entity",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            SuggestedAction::CreateEntity { name } => json!({ "name": name }),
        }
    }

    pub fn from_parts(tag: &str, payload: Option<&Value>) -> Option<Self> {
        match tag {
            "create_entity" => payload
                .and_then(|p| p.get("name"))
                .and_then(Value::as_str)
                .map(|name| SuggestedAction::CreateEntity { name: name.to_string() }),
            _ => None,
        }
    }
}

/// A reviewable unit for one schema delta
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
    pub id: Uuid,
    pub project_id: Uuid,
    /// Datasource whose refresh produced the delta
    pub datasource_id: Uuid,
    #[serde(flatten)]
    pub delta: SchemaDelta,
    pub source: ChangeSource,
    pub status: ChangeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<SuggestedAction>,
    pub reviewed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

impl PendingChange {
    pub fn new(project_id: Uuid, datasource_id: Uuid, delta: SchemaDelta, status: ChangeStatus) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            datasource_id,
            delta,
            source: ChangeSource::SchemaRefresh,
            status,
            suggestion: None,
            reviewed_by: None,
            created_at: now,
            updated_at: now,
            reviewed_at: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: SuggestedAction) -> Self {
        self.suggestion = Some(suggestion);
        self
    }

    pub fn change_type(&self) -> ChangeType {
        self.delta.change_type()
    }

    pub fn is_pending(&self) -> bool {
        self.status == ChangeStatus::Pending
    }
}

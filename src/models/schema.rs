//! Schema mirror rows
//!
//! Durable copies of the tables, columns and relationships discovered in a
//! datasource. Rows are never physically deleted: disappearing from the live
//! schema only stamps `removed_at`.

use crate::provenance::Provenance;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A mirrored table. Natural key: (datasource, schema, table)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaTable {
    pub id: Uuid,
    pub project_id: Uuid,
    pub datasource_id: Uuid,
    pub schema_name: String,
    pub table_name: String,
    pub row_count: Option<i64>,
    pub is_selected: bool,
    pub removed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SchemaTable {
    /// `schema.table`
    pub fn qualified_name(&self) -> String {
        qualify(&self.schema_name, &self.table_name)
    }

    pub fn is_removed(&self) -> bool {
        self.removed_at.is_some()
    }
}

/// A mirrored column. Natural key: (table, column)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaColumn {
    pub id: Uuid,
    pub table_id: Uuid,
    pub column_name: String,
    pub data_type: String,
    pub is_nullable: bool,
    pub is_primary_key: bool,
    pub is_unique: bool,
    pub ordinal_position: i32,
    pub default_value: Option<String>,
    pub is_selected: bool,
    pub removed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SchemaColumn {
    pub fn is_removed(&self) -> bool {
        self.removed_at.is_some()
    }
}

/// How a relationship came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    /// Declared as a foreign key in the datasource
    ForeignKey,
    /// Created by a user
    Manual,
    /// Guessed from naming or data
    Inferred,
}

impl RelationshipKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipKind::ForeignKey => "foreign_key",
            RelationshipKind::Manual => "manual",
            RelationshipKind::Inferred => "inferred",
        }
    }
}

impl FromStr for RelationshipKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "foreign_key" | "fk" => Ok(RelationshipKind::ForeignKey),
            "manual" => Ok(RelationshipKind::Manual),
            "inferred" => Ok(RelationshipKind::Inferred),
            other => Err(format!("unknown relationship kind '{}'", other)),
        }
    }
}

/// Relationship cardinality, source side first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

impl Cardinality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cardinality::OneToOne => "one_to_one",
            Cardinality::OneToMany => "one_to_many",
            Cardinality::ManyToOne => "many_to_one",
            Cardinality::ManyToMany => "many_to_many",
        }
    }
}

impl FromStr for Cardinality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "one_to_one" | "1:1" => Ok(Cardinality::OneToOne),
            "one_to_many" | "1:N" => Ok(Cardinality::OneToMany),
            "many_to_one" | "N:1" => Ok(Cardinality::ManyToOne),
            "many_to_many" | "N:M" => Ok(Cardinality::ManyToMany),
            other => Err(format!("unknown cardinality '{}'", other)),
        }
    }
}

impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A relationship between two mirrored columns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaRelationship {
    pub id: Uuid,
    pub project_id: Uuid,
    pub source_table_id: Uuid,
    pub source_column_id: Uuid,
    pub target_table_id: Uuid,
    pub target_column_id: Uuid,
    pub kind: RelationshipKind,
    pub cardinality: Cardinality,
    /// In [0, 1]
    pub confidence: f64,
    pub is_approved: bool,
    pub created_by: Provenance,
    pub updated_by: Option<Provenance>,
    pub removed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SchemaRelationship {
    pub fn is_removed(&self) -> bool {
        self.removed_at.is_some()
    }
}

/// Insert-or-update request for a table, keyed by its natural key
#[derive(Debug, Clone)]
pub struct TableUpsert {
    pub project_id: Uuid,
    pub datasource_id: Uuid,
    pub schema_name: String,
    pub table_name: String,
    pub row_count: Option<i64>,
    /// `Some` overwrites the selection flag, `None` leaves it alone
    pub select: Option<bool>,
}

/// Insert-or-update request for a column, keyed by (table, name)
#[derive(Debug, Clone)]
pub struct ColumnUpsert {
    pub table_id: Uuid,
    pub column_name: String,
    pub data_type: String,
    pub is_nullable: bool,
    pub is_primary_key: bool,
    pub is_unique: bool,
    pub ordinal_position: i32,
    pub default_value: Option<String>,
    /// `Some` overwrites the selection flag, `None` leaves it alone
    pub select: Option<bool>,
}

/// Insert-or-update request for a relationship, keyed by
/// (source column, target column, kind)
#[derive(Debug, Clone)]
pub struct RelationshipUpsert {
    pub project_id: Uuid,
    pub source_table_id: Uuid,
    pub source_column_id: Uuid,
    pub target_table_id: Uuid,
    pub target_column_id: Uuid,
    pub kind: RelationshipKind,
    pub cardinality: Cardinality,
    pub confidence: f64,
    pub is_approved: bool,
    pub created_by: Provenance,
}

/// What a relationship upsert did to the stored row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No live row existed; one was inserted or a removed one revived
    Created,
    Updated,
    /// The existing row is owned by a higher-precedence source and was left alone
    Protected,
}

/// `schema.name`
pub fn qualify(schema: &str, name: &str) -> String {
    format!("{}.{}", schema, name)
}

/// Split `schema.table` into its parts; a bare name has no schema
pub fn split_qualified(name: &str) -> (Option<&str>, &str) {
    match name.split_once('.') {
        Some((schema, table)) if !schema.is_empty() && !table.is_empty() => (Some(schema), table),
        _ => (None, name),
    }
}

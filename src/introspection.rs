//! Schema Introspection Module
//!
//! The discovery adapter: reads tables, columns and foreign keys from a
//! live datasource. The synchronizer only sees the [`SchemaDiscoverer`]
//! trait, so tests drive it with a scripted `fixtures::StaticDiscoverer`.

use crate::error::AppError;
use async_trait::async_trait;
use deadpool_postgres::Pool;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

/// A table reported by the datasource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredTable {
    pub schema: String,
    pub table: String,
    /// Planner estimate, not an exact count
    pub row_count: Option<i64>,
}

/// A column reported by the datasource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredColumn {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub primary_key: bool,
    pub unique: bool,
    pub ordinal: i32,
    pub default: Option<String>,
}

/// One foreign-key column pair. Composite keys yield one row per position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredForeignKey {
    pub constraint_name: String,
    pub source_schema: String,
    pub source_table: String,
    pub source_column: String,
    pub target_schema: String,
    pub target_table: String,
    pub target_column: String,
}

/// Discovery adapter consumed by the synchronizer. Any call may fail.
#[async_trait]
pub trait SchemaDiscoverer: Send + Sync {
    async fn discover_tables(&self) -> Result<Vec<DiscoveredTable>, AppError>;

    async fn discover_columns(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<Vec<DiscoveredColumn>, AppError>;

    async fn discover_foreign_keys(&self) -> Result<Vec<DiscoveredForeignKey>, AppError>;

    fn supports_foreign_keys(&self) -> bool;
}

/// Stable digest of a discovered schema: sorted table keys plus column types
pub fn fingerprint(tables: &[(DiscoveredTable, Vec<DiscoveredColumn>)]) -> String {
    let mut entries: Vec<String> = Vec::new();
    for (table, columns) in tables {
        entries.push(format!("{}.{}", table.schema, table.table));
        for column in columns {
            entries.push(format!(
                "{}.{}.{}:{}",
                table.schema, table.table, column.name, column.data_type
            ));
        }
    }
    entries.sort();

    let mut hasher = Sha256::new();
    for entry in &entries {
        hasher.update(entry.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Schema introspector for PostgreSQL
pub struct PgDiscoverer {
    pool: Pool,
}

impl PgDiscoverer {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SchemaDiscoverer for PgDiscoverer {
    async fn discover_tables(&self) -> Result<Vec<DiscoveredTable>, AppError> {
        let client = self.pool.get().await.map_err(discovery_error)?;

        let query = r#"
            SELECT
                n.nspname AS table_schema,
                c.relname AS table_name,
                CASE WHEN c.reltuples < 0 THEN NULL ELSE c.reltuples::BIGINT END AS row_estimate
            FROM pg_catalog.pg_class c
            JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
            WHERE c.relkind IN ('r', 'p')
              AND n.nspname NOT IN ('pg_catalog', 'information_schema')
              AND n.nspname !~ '^pg_toast'
              AND NOT c.relispartition
            ORDER BY n.nspname, c.relname
        "#;

        let rows = client.query(query, &[]).await.map_err(discovery_error)?;
        let tables: Vec<DiscoveredTable> = rows
            .iter()
            .map(|row| DiscoveredTable {
                schema: row.get("table_schema"),
                table: row.get("table_name"),
                row_count: row.get("row_estimate"),
            })
            .collect();

        debug!("Discovered {} tables", tables.len());
        Ok(tables)
    }

    async fn discover_columns(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<Vec<DiscoveredColumn>, AppError> {
        let client = self.pool.get().await.map_err(discovery_error)?;

        let query = r#"
            SELECT
                c.column_name,
                c.data_type,
                c.is_nullable,
                c.column_default,
                c.ordinal_position::INTEGER AS ordinal_position,
                COALESCE(
                    (SELECT true FROM information_schema.table_constraints tc
                     JOIN information_schema.key_column_usage kcu
                        ON tc.constraint_name = kcu.constraint_name
                        AND tc.table_schema = kcu.table_schema
                     WHERE tc.constraint_type = 'PRIMARY KEY'
                        AND tc.table_schema = c.table_schema
                        AND tc.table_name = c.table_name
                        AND kcu.column_name = c.column_name
                     LIMIT 1),
                    false
                ) as is_primary_key,
                COALESCE(
                    (SELECT true FROM information_schema.table_constraints tc
                     JOIN information_schema.key_column_usage kcu
                        ON tc.constraint_name = kcu.constraint_name
                        AND tc.table_schema = kcu.table_schema
                     WHERE tc.constraint_type = 'UNIQUE'
                        AND tc.table_schema = c.table_schema
                        AND tc.table_name = c.table_name
                        AND kcu.column_name = c.column_name
                     LIMIT 1),
                    false
                ) as is_unique
            FROM information_schema.columns c
            WHERE c.table_schema = $1 AND c.table_name = $2
            ORDER BY c.ordinal_position
        "#;

        let rows = client
            .query(query, &[&schema, &table])
            .await
            .map_err(discovery_error)?;

        Ok(rows
            .iter()
            .map(|row| DiscoveredColumn {
                name: row.get("column_name"),
                data_type: row.get("data_type"),
                nullable: row.get::<_, String>("is_nullable") == "YES",
                primary_key: row.get("is_primary_key"),
                unique: row.get("is_unique"),
                ordinal: row.get("ordinal_position"),
                default: row.get("column_default"),
            })
            .collect())
    }

    async fn discover_foreign_keys(&self) -> Result<Vec<DiscoveredForeignKey>, AppError> {
        let client = self.pool.get().await.map_err(discovery_error)?;

        // pg_constraint keeps column positions paired, information_schema does not
        let query = r#"
            SELECT
                con.conname AS constraint_name,
                sn.nspname AS source_schema,
                st.relname AS source_table,
                sa.attname AS source_column,
                tn.nspname AS target_schema,
                tt.relname AS target_table,
                ta.attname AS target_column
            FROM pg_catalog.pg_constraint con
            CROSS JOIN LATERAL UNNEST(con.conkey, con.confkey) WITH ORDINALITY AS k(src, tgt, pos)
            JOIN pg_catalog.pg_class st ON st.oid = con.conrelid
            JOIN pg_catalog.pg_namespace sn ON sn.oid = st.relnamespace
            JOIN pg_catalog.pg_attribute sa ON sa.attrelid = con.conrelid AND sa.attnum = k.src
            JOIN pg_catalog.pg_class tt ON tt.oid = con.confrelid
            JOIN pg_catalog.pg_namespace tn ON tn.oid = tt.relnamespace
            JOIN pg_catalog.pg_attribute ta ON ta.attrelid = con.confrelid AND ta.attnum = k.tgt
            WHERE con.contype = 'f'
              AND sn.nspname NOT IN ('pg_catalog', 'information_schema')
            ORDER BY sn.nspname, st.relname, con.conname, k.pos
        "#;

        let rows = client.query(query, &[]).await.map_err(discovery_error)?;
        let foreign_keys: Vec<DiscoveredForeignKey> = rows
            .iter()
            .map(|row| DiscoveredForeignKey {
                constraint_name: row.get("constraint_name"),
                source_schema: row.get("source_schema"),
                source_table: row.get("source_table"),
                source_column: row.get("source_column"),
                target_schema: row.get("target_schema"),
                target_table: row.get("target_table"),
                target_column: row.get("target_column"),
            })
            .collect();

        debug!("Discovered {} foreign key columns", foreign_keys.len());
        Ok(foreign_keys)
    }

    fn supports_foreign_keys(&self) -> bool {
        true
    }
}

fn discovery_error(e: impl std::fmt::Display) -> AppError {
    AppError::Discovery(e.to_string())
}

/// Scripted discovery for tests
#[cfg(test)]
pub mod fixtures {
    use super::*;
    use std::collections::HashMap;

    /// Discoverer over a fixed, in-memory schema
    #[derive(Debug, Clone, Default)]
    pub struct StaticDiscoverer {
        tables: Vec<DiscoveredTable>,
        columns: HashMap<(String, String), Vec<DiscoveredColumn>>,
        foreign_keys: Option<Vec<DiscoveredForeignKey>>,
    }

    impl StaticDiscoverer {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_table(
            mut self,
            schema: &str,
            table: &str,
            columns: Vec<DiscoveredColumn>,
        ) -> Self {
            self.tables.push(DiscoveredTable {
                schema: schema.to_string(),
                table: table.to_string(),
                row_count: None,
            });
            self.columns
                .insert((schema.to_string(), table.to_string()), columns);
            self
        }

        /// Enables foreign-key support
        pub fn with_foreign_key(mut self, foreign_key: DiscoveredForeignKey) -> Self {
            self.foreign_keys.get_or_insert_with(Vec::new).push(foreign_key);
            self
        }
    }

    #[async_trait]
    impl SchemaDiscoverer for StaticDiscoverer {
        async fn discover_tables(&self) -> Result<Vec<DiscoveredTable>, AppError> {
            Ok(self.tables.clone())
        }

        async fn discover_columns(
            &self,
            schema: &str,
            table: &str,
        ) -> Result<Vec<DiscoveredColumn>, AppError> {
            self.columns
                .get(&(schema.to_string(), table.to_string()))
                .cloned()
                .ok_or_else(|| AppError::Discovery(format!("No such table {}.{}", schema, table)))
        }

        async fn discover_foreign_keys(&self) -> Result<Vec<DiscoveredForeignKey>, AppError> {
            Ok(self.foreign_keys.clone().unwrap_or_default())
        }

        fn supports_foreign_keys(&self) -> bool {
            self.foreign_keys.is_some()
        }
    }

    /// Shorthand for building discovered columns
    pub fn column(name: &str, data_type: &str, ordinal: i32) -> DiscoveredColumn {
        DiscoveredColumn {
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable: name != "id",
            primary_key: name == "id",
            unique: name == "id",
            ordinal,
            default: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{column, StaticDiscoverer};
    use super::*;

    fn snapshot(types: &[(&str, &str)]) -> Vec<(DiscoveredTable, Vec<DiscoveredColumn>)> {
        let columns = types
            .iter()
            .enumerate()
            .map(|(i, (name, ty))| column(name, ty, i as i32 + 1))
            .collect();
        vec![(
            DiscoveredTable {
                schema: "public".to_string(),
                table: "users".to_string(),
                row_count: Some(3),
            },
            columns,
        )]
    }

    #[test]
    fn test_fingerprint_consistency() {
        let a = snapshot(&[("id", "integer"), ("email", "text")]);
        let b = snapshot(&[("email", "text"), ("id", "integer")]);
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_tracks_column_types() {
        let a = snapshot(&[("id", "integer")]);
        let b = snapshot(&[("id", "bigint")]);
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[tokio::test]
    async fn test_static_discoverer_foreign_key_support() {
        let plain = StaticDiscoverer::new().with_table("public", "users", vec![column("id", "integer", 1)]);
        assert!(!plain.supports_foreign_keys());
        assert!(plain.discover_columns("public", "missing").await.is_err());

        let with_fk = plain.with_foreign_key(DiscoveredForeignKey {
            constraint_name: "fk".to_string(),
            source_schema: "public".to_string(),
            source_table: "users".to_string(),
            source_column: "id".to_string(),
            target_schema: "public".to_string(),
            target_table: "users".to_string(),
            target_column: "id".to_string(),
        });
        assert!(with_fk.supports_foreign_keys());
        assert_eq!(with_fk.discover_foreign_keys().await.unwrap().len(), 1);
    }
}

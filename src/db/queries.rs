//! SQL query constants
//!
//! Contains the metadata DDL and every statement [`super::PgStore`] issues.

/// Metadata tables, created at startup
pub const CREATE_METADATA_TABLES: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_tables (
        id UUID PRIMARY KEY,
        project_id UUID NOT NULL,
        datasource_id UUID NOT NULL,
        schema_name TEXT NOT NULL,
        table_name TEXT NOT NULL,
        row_count BIGINT,
        is_selected BOOLEAN NOT NULL DEFAULT false,
        removed_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (datasource_id, schema_name, table_name)
    );
    CREATE INDEX IF NOT EXISTS idx_schema_tables_project ON schema_tables(project_id);

    CREATE TABLE IF NOT EXISTS schema_columns (
        id UUID PRIMARY KEY,
        table_id UUID NOT NULL REFERENCES schema_tables(id),
        column_name TEXT NOT NULL,
        data_type TEXT NOT NULL,
        is_nullable BOOLEAN NOT NULL DEFAULT true,
        is_primary_key BOOLEAN NOT NULL DEFAULT false,
        is_unique BOOLEAN NOT NULL DEFAULT false,
        ordinal_position INTEGER NOT NULL,
        default_value TEXT,
        is_selected BOOLEAN NOT NULL DEFAULT false,
        removed_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (table_id, column_name)
    );

    CREATE TABLE IF NOT EXISTS schema_relationships (
        id UUID PRIMARY KEY,
        project_id UUID NOT NULL,
        source_table_id UUID NOT NULL,
        source_column_id UUID NOT NULL,
        target_table_id UUID NOT NULL,
        target_column_id UUID NOT NULL,
        kind TEXT NOT NULL,
        cardinality TEXT NOT NULL,
        confidence DOUBLE PRECISION NOT NULL,
        is_approved BOOLEAN NOT NULL DEFAULT false,
        created_by TEXT NOT NULL DEFAULT '',
        updated_by TEXT,
        removed_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (source_column_id, target_column_id, kind)
    );
    CREATE INDEX IF NOT EXISTS idx_schema_relationships_project ON schema_relationships(project_id);

    CREATE TABLE IF NOT EXISTS pending_changes (
        id UUID PRIMARY KEY,
        project_id UUID NOT NULL,
        datasource_id UUID NOT NULL,
        change_type TEXT NOT NULL,
        change_source TEXT NOT NULL,
        table_name TEXT NOT NULL,
        column_name TEXT,
        old_value JSONB,
        new_value JSONB,
        suggested_action TEXT,
        suggested_payload JSONB,
        status TEXT NOT NULL,
        reviewed_by TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        reviewed_at TIMESTAMPTZ
    );
    CREATE INDEX IF NOT EXISTS idx_pending_changes_project ON pending_changes(project_id, status);

    CREATE TABLE IF NOT EXISTS ontology_entities (
        id UUID PRIMARY KEY,
        project_id UUID NOT NULL,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        domain TEXT,
        primary_schema TEXT NOT NULL,
        primary_table TEXT NOT NULL,
        primary_column TEXT NOT NULL,
        confidence DOUBLE PRECISION NOT NULL,
        created_by TEXT NOT NULL DEFAULT '',
        updated_by TEXT,
        is_stale BOOLEAN NOT NULL DEFAULT false,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );
    CREATE INDEX IF NOT EXISTS idx_ontology_entities_project ON ontology_entities(project_id);

    CREATE TABLE IF NOT EXISTS ontology_entity_aliases (
        id UUID PRIMARY KEY,
        entity_id UUID NOT NULL REFERENCES ontology_entities(id) ON DELETE CASCADE,
        alias TEXT NOT NULL,
        source TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (entity_id, alias)
    );
"#;

// ---- tables ----

const TABLE_COLUMNS: &str = "id, project_id, datasource_id, schema_name, table_name, row_count, \
                             is_selected, removed_at, created_at, updated_at";

pub fn list_tables() -> String {
    format!(
        "SELECT {} FROM schema_tables WHERE datasource_id = $1 AND removed_at IS NULL \
         ORDER BY schema_name, table_name",
        TABLE_COLUMNS
    )
}

pub fn list_project_tables() -> String {
    format!(
        "SELECT {} FROM schema_tables WHERE project_id = $1 AND removed_at IS NULL \
         ORDER BY schema_name, table_name",
        TABLE_COLUMNS
    )
}

pub fn get_table() -> String {
    format!(
        "SELECT {} FROM schema_tables WHERE id = $1 AND removed_at IS NULL",
        TABLE_COLUMNS
    )
}

/// `$2` may be NULL to match any schema
pub fn find_table() -> String {
    format!(
        "SELECT {} FROM schema_tables \
         WHERE project_id = $1 AND ($2::TEXT IS NULL OR schema_name = $2) AND table_name = $3 \
           AND removed_at IS NULL \
         ORDER BY schema_name LIMIT 1",
        TABLE_COLUMNS
    )
}

/// Same as [`find_table`] but scoped to one datasource
pub fn find_datasource_table() -> String {
    format!(
        "SELECT {} FROM schema_tables \
         WHERE datasource_id = $1 AND ($2::TEXT IS NULL OR schema_name = $2) AND table_name = $3 \
           AND removed_at IS NULL \
         ORDER BY schema_name LIMIT 1",
        TABLE_COLUMNS
    )
}

/// `$7` NULL keeps the stored selection
pub fn upsert_table() -> String {
    format!(
        "INSERT INTO schema_tables (id, project_id, datasource_id, schema_name, table_name, row_count, is_selected) \
         VALUES ($1, $2, $3, $4, $5, $6, COALESCE($7::BOOLEAN, false)) \
         ON CONFLICT (datasource_id, schema_name, table_name) DO UPDATE SET \
             project_id = EXCLUDED.project_id, \
             row_count = EXCLUDED.row_count, \
             is_selected = COALESCE($7::BOOLEAN, schema_tables.is_selected), \
             removed_at = NULL, \
             updated_at = NOW() \
         RETURNING {}",
        TABLE_COLUMNS
    )
}

/// Keys arrive as two parallel arrays (schemas, names)
pub fn soft_delete_tables_except() -> String {
    format!(
        "UPDATE schema_tables SET removed_at = NOW(), updated_at = NOW() \
         WHERE datasource_id = $1 AND removed_at IS NULL \
           AND (schema_name, table_name) NOT IN ( \
               SELECT s, t FROM UNNEST($2::TEXT[], $3::TEXT[]) AS active(s, t)) \
         RETURNING {}",
        TABLE_COLUMNS
    )
}

pub const SOFT_DELETE_COLUMNS_OF_TABLES: &str = r#"
    UPDATE schema_columns SET removed_at = NOW(), updated_at = NOW()
    WHERE table_id = ANY($1) AND removed_at IS NULL
"#;

pub const SET_TABLE_SELECTED: &str = r#"
    UPDATE schema_tables SET is_selected = $2, updated_at = NOW() WHERE id = $1
"#;

pub const DESELECT_TABLE_COLUMNS: &str = r#"
    UPDATE schema_columns SET is_selected = false, updated_at = NOW() WHERE table_id = $1
"#;

// ---- columns ----

const COLUMN_COLUMNS: &str = "id, table_id, column_name, data_type, is_nullable, is_primary_key, \
                              is_unique, ordinal_position, default_value, is_selected, removed_at, \
                              created_at, updated_at";

pub fn list_columns() -> String {
    format!(
        "SELECT {} FROM schema_columns WHERE table_id = $1 AND removed_at IS NULL \
         ORDER BY ordinal_position, column_name",
        COLUMN_COLUMNS
    )
}

pub fn get_column() -> String {
    format!(
        "SELECT {} FROM schema_columns WHERE id = $1 AND removed_at IS NULL",
        COLUMN_COLUMNS
    )
}

pub fn find_column() -> String {
    format!(
        "SELECT {} FROM schema_columns \
         WHERE table_id = $1 AND column_name = $2 AND removed_at IS NULL",
        COLUMN_COLUMNS
    )
}

/// `$10` NULL keeps the stored selection
pub fn upsert_column() -> String {
    format!(
        "INSERT INTO schema_columns (id, table_id, column_name, data_type, is_nullable, is_primary_key, \
                                     is_unique, ordinal_position, default_value, is_selected) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, COALESCE($10::BOOLEAN, false)) \
         ON CONFLICT (table_id, column_name) DO UPDATE SET \
             data_type = EXCLUDED.data_type, \
             is_nullable = EXCLUDED.is_nullable, \
             is_primary_key = EXCLUDED.is_primary_key, \
             is_unique = EXCLUDED.is_unique, \
             ordinal_position = EXCLUDED.ordinal_position, \
             default_value = EXCLUDED.default_value, \
             is_selected = COALESCE($10::BOOLEAN, schema_columns.is_selected), \
             removed_at = NULL, \
             updated_at = NOW() \
         RETURNING {}",
        COLUMN_COLUMNS
    )
}

pub fn soft_delete_columns_except() -> String {
    format!(
        "UPDATE schema_columns SET removed_at = NOW(), updated_at = NOW() \
         WHERE table_id = $1 AND removed_at IS NULL AND NOT (column_name = ANY($2)) \
         RETURNING {}",
        COLUMN_COLUMNS
    )
}

pub const SET_COLUMN_SELECTED: &str = r#"
    UPDATE schema_columns SET is_selected = $2, updated_at = NOW() WHERE id = $1
    RETURNING table_id
"#;

pub const SELECT_TABLE_OF_COLUMN: &str = r#"
    UPDATE schema_tables SET is_selected = true, updated_at = NOW() WHERE id = $1
"#;

// ---- relationships ----

const RELATIONSHIP_COLUMNS: &str = "id, project_id, source_table_id, source_column_id, target_table_id, \
                                    target_column_id, kind, cardinality, confidence, is_approved, \
                                    created_by, updated_by, removed_at, created_at, updated_at";

pub fn list_relationships() -> String {
    format!(
        "SELECT {} FROM schema_relationships WHERE project_id = $1 AND removed_at IS NULL \
         ORDER BY created_at",
        RELATIONSHIP_COLUMNS
    )
}

pub fn get_relationship() -> String {
    format!(
        "SELECT {} FROM schema_relationships WHERE id = $1 AND removed_at IS NULL",
        RELATIONSHIP_COLUMNS
    )
}

pub fn find_relationship() -> String {
    format!(
        "SELECT {} FROM schema_relationships \
         WHERE source_column_id = $1 AND target_column_id = $2 AND kind = $3 AND removed_at IS NULL",
        RELATIONSHIP_COLUMNS
    )
}

/// Includes removed rows
pub fn find_relationship_any() -> String {
    format!(
        "SELECT {} FROM schema_relationships \
         WHERE source_column_id = $1 AND target_column_id = $2 AND kind = $3",
        RELATIONSHIP_COLUMNS
    )
}

/// Precedence rung of a provenance string; unknown values rank lowest
fn precedence_rank(expr: &str) -> String {
    format!(
        "(CASE {} WHEN 'manual' THEN 3 WHEN 'mcp' THEN 2 WHEN 'inferred' THEN 1 ELSE 0 END)",
        expr
    )
}

/// Rank of the source that currently owns a row of `table`
fn owner_rank(table: &str) -> String {
    precedence_rank(&format!(
        "COALESCE(NULLIF({t}.updated_by, ''), {t}.created_by)",
        t = table
    ))
}

/// The trailing `created` column is true unless a live row existed before
/// this statement ran; every sub-statement sees the same snapshot. No row
/// comes back when the existing row is owned by a higher-precedence source.
pub fn upsert_relationship() -> String {
    format!(
        "WITH prior AS ( \
             SELECT 1 FROM schema_relationships \
             WHERE source_column_id = $4 AND target_column_id = $6 AND kind = $7 AND removed_at IS NULL \
         ), upserted AS ( \
             INSERT INTO schema_relationships (id, project_id, source_table_id, source_column_id, \
                 target_table_id, target_column_id, kind, cardinality, confidence, is_approved, created_by) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (source_column_id, target_column_id, kind) DO UPDATE SET \
                 cardinality = EXCLUDED.cardinality, \
                 confidence = EXCLUDED.confidence, \
                 removed_at = NULL, \
                 updated_at = NOW() \
             WHERE {} <= {} \
             RETURNING {} \
         ) \
         SELECT upserted.*, NOT EXISTS (SELECT 1 FROM prior) AS created FROM upserted",
        owner_rank("schema_relationships"),
        precedence_rank("$11::TEXT"),
        RELATIONSHIP_COLUMNS
    )
}

pub const UPDATE_RELATIONSHIP: &str = r#"
    UPDATE schema_relationships
    SET cardinality = $2, confidence = $3, is_approved = $4, updated_by = $5,
        removed_at = $6, updated_at = NOW()
    WHERE id = $1
"#;

pub const SOFT_DELETE_ORPHAN_RELATIONSHIPS: &str = r#"
    UPDATE schema_relationships r SET removed_at = NOW(), updated_at = NOW()
    WHERE r.project_id = $1 AND r.removed_at IS NULL
      AND (
          NOT EXISTS (SELECT 1 FROM schema_columns c WHERE c.id = r.source_column_id AND c.removed_at IS NULL)
          OR NOT EXISTS (SELECT 1 FROM schema_columns c WHERE c.id = r.target_column_id AND c.removed_at IS NULL)
      )
"#;

// ---- pending changes ----

pub const INSERT_CHANGE: &str = r#"
    INSERT INTO pending_changes (id, project_id, change_type, change_source, table_name, column_name,
        old_value, new_value, suggested_action, suggested_payload, status, reviewed_by,
        created_at, updated_at, reviewed_at, datasource_id)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
"#;

/// `$2` may be NULL to list every status
pub const LIST_CHANGES: &str = r#"
    SELECT id, project_id, change_type, change_source, table_name, column_name, old_value, new_value,
        suggested_action, suggested_payload, status, reviewed_by, created_at, updated_at, reviewed_at,
        datasource_id
    FROM pending_changes
    WHERE project_id = $1 AND ($2::TEXT IS NULL OR status = $2)
    ORDER BY created_at, id
"#;

pub const UPDATE_CHANGE_STATUS: &str = r#"
    UPDATE pending_changes
    SET status = $2, reviewed_by = $3,
        reviewed_at = CASE WHEN $2 = 'pending' THEN NULL ELSE NOW() END,
        updated_at = NOW()
    WHERE id = $1
"#;

// ---- ontology ----

const ENTITY_COLUMNS: &str = "id, project_id, name, description, domain, primary_schema, primary_table, \
                              primary_column, confidence, created_by, updated_by, is_stale, \
                              created_at, updated_at";

pub fn list_entities() -> String {
    format!(
        "SELECT {} FROM ontology_entities WHERE project_id = $1 ORDER BY name",
        ENTITY_COLUMNS
    )
}

pub fn get_entity() -> String {
    format!("SELECT {} FROM ontology_entities WHERE id = $1", ENTITY_COLUMNS)
}

pub const INSERT_ENTITY: &str = r#"
    INSERT INTO ontology_entities (id, project_id, name, description, domain, primary_schema,
        primary_table, primary_column, confidence, created_by, updated_by, is_stale, created_at, updated_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
"#;

pub const UPDATE_ENTITY: &str = r#"
    UPDATE ontology_entities
    SET name = $2, description = $3, domain = $4, confidence = $5, updated_by = $6,
        is_stale = $7, updated_at = NOW()
    WHERE id = $1
"#;

/// Touches nothing when the entity is owned by a source that outranks `$7`
pub fn enrich_entity() -> String {
    format!(
        "UPDATE ontology_entities \
         SET name = $3, description = $4, domain = $5, confidence = $6, updated_by = $7, updated_at = NOW() \
         WHERE id = $1 AND project_id = $2 AND {} <= {}",
        owner_rank("ontology_entities"),
        precedence_rank("$7::TEXT")
    )
}

pub const ENTITY_IN_PROJECT: &str = "SELECT 1 FROM ontology_entities WHERE id = $1 AND project_id = $2";

pub const LIST_ALIASES: &str = r#"
    SELECT id, entity_id, alias, source, created_at
    FROM ontology_entity_aliases
    WHERE entity_id = $1
    ORDER BY created_at, alias
"#;

pub const INSERT_ALIAS: &str = r#"
    INSERT INTO ontology_entity_aliases (id, entity_id, alias, source, created_at)
    VALUES ($1, $2, $3, $4, $5)
"#;

/// Zero rows affected means the alias already existed
pub const INSERT_ALIAS_IF_ABSENT: &str = r#"
    INSERT INTO ontology_entity_aliases (id, entity_id, alias, source)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (entity_id, alias) DO NOTHING
"#;

pub const MARK_ENTITIES_STALE: &str = r#"
    UPDATE ontology_entities SET is_stale = true, updated_at = NOW()
    WHERE project_id = $1 AND is_stale = false
      AND (primary_schema, primary_table) IN (
          SELECT s, t FROM UNNEST($2::TEXT[], $3::TEXT[]) AS removed(s, t))
"#;

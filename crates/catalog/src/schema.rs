//! Schema manager: maps tag definitions onto their storage shape.
//!
//! This is the only place DDL is generated. Each tag gets one relation; the
//! fixed relations (subjects, change tracking) are created once at startup.
//! The reverse "tags present" index is the reserved `tags` tag's own
//! relation, so it needs no special storage.

use crate::error::CatalogResult;
use curio_core::{DbType, TagDef};
use curio_query::{quote_ident, tag_table};
use sqlx::PgConnection;

/// Fixed relations, created before any tag exists.
const CORE_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS subjects (
        id BIGSERIAL PRIMARY KEY
    )",
    "CREATE TABLE IF NOT EXISTS tag_last_modified (
        tagname TEXT PRIMARY KEY,
        txid BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS subject_last_tagged (
        subject BIGINT PRIMARY KEY REFERENCES subjects(id) ON DELETE CASCADE,
        txid BIGINT NOT NULL
    )",
];

/// Create the fixed relations.
pub async fn deploy_core(conn: &mut PgConnection) -> CatalogResult<()> {
    for statement in CORE_SCHEMA {
        sqlx::query(statement).execute(&mut *conn).await?;
    }
    Ok(())
}

/// Render the CREATE TABLE statement for a tag's storage relation.
///
/// Shape per definition: a `subject` column always; a typed `value` column
/// unless presence-only; uniqueness constraints reflecting multivalue and
/// unique flags; a plain foreign key (no cascade) for hard references so a
/// referenced value cannot be removed while referents remain.
pub fn tag_table_ddl(td: &TagDef) -> String {
    let table = tag_table(&td.name);
    let mut parts: Vec<String> =
        vec!["subject BIGINT NOT NULL REFERENCES subjects(id) ON DELETE CASCADE".to_string()];

    if let Some(value_type) = td.dbtype.sql_type() {
        parts.push(format!("value {value_type} NOT NULL"));
        if td.multivalue {
            parts.push("UNIQUE (subject, value)".to_string());
        } else {
            parts.push("UNIQUE (subject)".to_string());
        }
        if td.unique {
            parts.push("UNIQUE (value)".to_string());
        }
        if let Some(tagref) = &td.tagref
            && !tagref.soft
        {
            parts.push(format!(
                "FOREIGN KEY (value) REFERENCES {}(value)",
                tag_table(&tagref.target)
            ));
        }
    } else {
        parts.push("UNIQUE (subject)".to_string());
    }

    format!("CREATE TABLE IF NOT EXISTS {table} ({})", parts.join(", "))
}

/// Render the secondary index statement for a tag, if it needs one.
pub fn tag_index_ddl(td: &TagDef) -> Option<String> {
    let index = quote_ident(&format!("t_{}_value_idx", td.name));
    let table = tag_table(&td.name);
    match td.dbtype {
        DbType::Empty => None,
        DbType::Tsvector => Some(format!(
            "CREATE INDEX IF NOT EXISTS {index} ON {table} USING GIN (value)"
        )),
        // Unique tags already carry a btree index via their constraint.
        _ if td.unique => None,
        _ => Some(format!(
            "CREATE INDEX IF NOT EXISTS {index} ON {table} (value)"
        )),
    }
}

/// Provision one tag's storage unit.
pub async fn deploy_tag(conn: &mut PgConnection, td: &TagDef) -> CatalogResult<()> {
    sqlx::query(&tag_table_ddl(td)).execute(&mut *conn).await?;
    if let Some(index) = tag_index_ddl(td) {
        sqlx::query(&index).execute(&mut *conn).await?;
    }
    tracing::debug!(tag = %td.name, dbtype = %td.dbtype, "deployed tag storage");
    Ok(())
}

/// Drop one tag's storage unit.
pub async fn drop_tag(conn: &mut PgConnection, name: &str) -> CatalogResult<()> {
    sqlx::query(&format!("DROP TABLE IF EXISTS {}", tag_table(name)))
        .execute(&mut *conn)
        .await?;
    tracing::debug!(tag = %name, "dropped tag storage");
    Ok(())
}

/// The SQL expression that turns a bound parameter into the stored value.
/// Search documents are parsed on the way in; everything else binds as-is.
pub fn value_write_expr(dbtype: DbType, placeholder: &str) -> String {
    match dbtype {
        DbType::Tsvector => format!("to_tsvector('simple', {placeholder})"),
        _ => placeholder.to_string(),
    }
}

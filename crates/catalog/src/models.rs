//! Result row model and dynamic value decoding.
//!
//! Compiled queries project runtime-defined tag columns, so rows cannot be
//! mapped onto fixed structs; each cell is decoded from the column's
//! database type into the tag value model.

use crate::error::{CatalogError, CatalogResult};
use curio_core::TagValue;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row, TypeInfo};
use time::OffsetDateTime;

/// One decoded result cell.
#[derive(Clone, Debug, PartialEq)]
pub enum CellValue {
    /// A single tag value (presence-only projections read as booleans).
    Value(TagValue),
    /// An aggregated multivalue projection.
    Values(Vec<TagValue>),
}

impl CellValue {
    pub fn as_value(&self) -> Option<&TagValue> {
        match self {
            Self::Value(v) => Some(v),
            Self::Values(_) => None,
        }
    }

    /// Render for display: single values verbatim, sets comma-joined.
    pub fn render(&self) -> String {
        match self {
            Self::Value(v) => v.render(),
            Self::Values(vs) => vs
                .iter()
                .map(TagValue::render)
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

/// One query result row: an ordered name → typed-value mapping.
#[derive(Clone, Debug, Default)]
pub struct ResultRow {
    columns: Vec<(String, Option<CellValue>)>,
}

impl ResultRow {
    pub fn columns(&self) -> &[(String, Option<CellValue>)] {
        &self.columns
    }

    pub fn get(&self, name: &str) -> Option<&CellValue> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_ref())
    }

    /// The subject id column, present on every triples-shaped row.
    pub fn id(&self) -> Option<i64> {
        match self.get("id") {
            Some(CellValue::Value(TagValue::Int8(id))) => Some(*id),
            _ => None,
        }
    }
}

/// Decode one database row into the tag value model.
pub fn decode_row(row: &PgRow) -> CatalogResult<ResultRow> {
    let mut columns = Vec::with_capacity(row.len());
    for (i, column) in row.columns().iter().enumerate() {
        let name = column.name().to_string();
        let value = decode_cell(row, i, column.type_info().name())?;
        columns.push((name, value));
    }
    Ok(ResultRow { columns })
}

fn decode_cell(row: &PgRow, i: usize, type_name: &str) -> CatalogResult<Option<CellValue>> {
    let cell = match type_name {
        "INT8" | "INT4" | "INT2" => row
            .try_get::<Option<i64>, _>(i)?
            .map(|v| CellValue::Value(TagValue::Int8(v))),
        "FLOAT8" | "FLOAT4" | "NUMERIC" => row
            .try_get::<Option<f64>, _>(i)?
            .map(|v| CellValue::Value(TagValue::Float8(v))),
        "TEXT" | "VARCHAR" | "NAME" | "BPCHAR" => row
            .try_get::<Option<String>, _>(i)?
            .map(|v| CellValue::Value(TagValue::Text(v))),
        "BOOL" => row
            .try_get::<Option<bool>, _>(i)?
            .map(|v| CellValue::Value(TagValue::Boolean(v))),
        "DATE" => row
            .try_get::<Option<time::Date>, _>(i)?
            .map(|v| CellValue::Value(TagValue::Date(v))),
        "TIMESTAMPTZ" => row
            .try_get::<Option<OffsetDateTime>, _>(i)?
            .map(|v| CellValue::Value(TagValue::Timestamptz(v))),
        "INT8[]" | "INT4[]" => row
            .try_get::<Option<Vec<i64>>, _>(i)?
            .map(|vs| CellValue::Values(vs.into_iter().map(TagValue::Int8).collect())),
        "FLOAT8[]" => row
            .try_get::<Option<Vec<f64>>, _>(i)?
            .map(|vs| CellValue::Values(vs.into_iter().map(TagValue::Float8).collect())),
        "TEXT[]" | "VARCHAR[]" => row
            .try_get::<Option<Vec<String>>, _>(i)?
            .map(|vs| CellValue::Values(vs.into_iter().map(TagValue::Text).collect())),
        "BOOL[]" => row
            .try_get::<Option<Vec<bool>>, _>(i)?
            .map(|vs| CellValue::Values(vs.into_iter().map(TagValue::Boolean).collect())),
        "DATE[]" => row
            .try_get::<Option<Vec<time::Date>>, _>(i)?
            .map(|vs| CellValue::Values(vs.into_iter().map(TagValue::Date).collect())),
        "TIMESTAMPTZ[]" => row
            .try_get::<Option<Vec<OffsetDateTime>>, _>(i)?
            .map(|vs| CellValue::Values(vs.into_iter().map(TagValue::Timestamptz).collect())),
        other => {
            return Err(CatalogError::Internal(format!(
                "unsupported result column type: {other}"
            )));
        }
    };
    Ok(cell)
}

/// Bind one tag value to the next query placeholder.
pub fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &TagValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        TagValue::Boolean(b) => query.bind(*b),
        TagValue::Int8(i) => query.bind(*i),
        TagValue::Float8(f) => query.bind(*f),
        TagValue::Text(s) => query.bind(s.clone()),
        TagValue::Date(d) => query.bind(*d),
        TagValue::Timestamptz(t) => query.bind(*t),
    }
}

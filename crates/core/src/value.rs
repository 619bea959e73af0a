//! Tag value types and the dbtype vocabulary.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime};

/// Storage type of a tag's value column.
///
/// `Empty` tags are presence-only flags with no value column at all.
/// `Tsvector` tags accept text input; the stored column is a parsed
/// text-search document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbType {
    Empty,
    Boolean,
    Int8,
    Float8,
    Text,
    Date,
    Timestamptz,
    Tsvector,
}

impl DbType {
    /// Parse from the stored vocabulary string.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "empty" => Ok(Self::Empty),
            "boolean" => Ok(Self::Boolean),
            "int8" => Ok(Self::Int8),
            "float8" => Ok(Self::Float8),
            "text" => Ok(Self::Text),
            "date" => Ok(Self::Date),
            "timestamptz" => Ok(Self::Timestamptz),
            "tsvector" => Ok(Self::Tsvector),
            _ => Err(Error::UnknownDbType(s.to_string())),
        }
    }

    /// Get the vocabulary string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Boolean => "boolean",
            Self::Int8 => "int8",
            Self::Float8 => "float8",
            Self::Text => "text",
            Self::Date => "date",
            Self::Timestamptz => "timestamptz",
            Self::Tsvector => "tsvector",
        }
    }

    /// SQL column type for the value column, or `None` for presence-only tags.
    pub fn sql_type(&self) -> Option<&'static str> {
        match self {
            Self::Empty => None,
            Self::Boolean => Some("BOOLEAN"),
            Self::Int8 => Some("BIGINT"),
            Self::Float8 => Some("DOUBLE PRECISION"),
            Self::Text => Some("TEXT"),
            Self::Date => Some("DATE"),
            Self::Timestamptz => Some("TIMESTAMPTZ"),
            Self::Tsvector => Some("TSVECTOR"),
        }
    }

    /// Whether values of this type carry a total order usable for `ORDER BY`
    /// and range comparisons.
    pub fn is_ordered(&self) -> bool {
        matches!(
            self,
            Self::Int8 | Self::Float8 | Self::Text | Self::Date | Self::Timestamptz
        )
    }

    /// Whether this type can act as a path-bridging scalar: a plain value
    /// that one element can produce and the next can be keyed by.
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            Self::Boolean | Self::Int8 | Self::Float8 | Self::Text | Self::Date | Self::Timestamptz
        )
    }

    /// Whether uniqueness constraints make sense for this type.
    pub fn supports_unique(&self) -> bool {
        self.is_scalar()
    }
}

impl fmt::Display for DbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const DATE_FORMAT: &[time::format_description::BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]");

/// One typed tag value.
///
/// Presence-only (`empty`) tags have no value at all and are represented by
/// `Option<TagValue>::None` at triple level. `Tsvector` tags carry their raw
/// text input as `Text`; parsing into a search document happens in SQL.
#[derive(Clone, Debug, PartialEq)]
pub enum TagValue {
    Boolean(bool),
    Int8(i64),
    Float8(f64),
    Text(String),
    Date(Date),
    Timestamptz(OffsetDateTime),
}

impl TagValue {
    /// Parse a raw client string into a value of the given dbtype.
    ///
    /// `Empty` tags accept no value; callers must pass absence explicitly.
    pub fn parse(dbtype: DbType, raw: &str) -> Result<Self> {
        let invalid = |detail: String| Error::InvalidValue {
            dbtype: dbtype.as_str(),
            raw: raw.to_string(),
            detail,
        };
        match dbtype {
            DbType::Empty => Err(invalid("presence-only tag takes no value".to_string())),
            DbType::Boolean => match raw {
                "true" | "t" | "1" => Ok(Self::Boolean(true)),
                "false" | "f" | "0" => Ok(Self::Boolean(false)),
                _ => Err(invalid("expected true/false".to_string())),
            },
            DbType::Int8 => raw
                .parse::<i64>()
                .map(Self::Int8)
                .map_err(|e| invalid(e.to_string())),
            DbType::Float8 => raw
                .parse::<f64>()
                .map(Self::Float8)
                .map_err(|e| invalid(e.to_string())),
            DbType::Text | DbType::Tsvector => Ok(Self::Text(raw.to_string())),
            DbType::Date => Date::parse(raw, DATE_FORMAT)
                .map(Self::Date)
                .map_err(|e| invalid(e.to_string())),
            DbType::Timestamptz => OffsetDateTime::parse(raw, &Rfc3339)
                .map(Self::Timestamptz)
                .map_err(|e| invalid(e.to_string())),
        }
    }

    /// Render back to the canonical client string.
    pub fn render(&self) -> String {
        match self {
            Self::Boolean(b) => b.to_string(),
            Self::Int8(i) => i.to_string(),
            Self::Float8(f) => f.to_string(),
            Self::Text(s) => s.clone(),
            Self::Date(d) => d
                .format(DATE_FORMAT)
                .unwrap_or_else(|_| d.to_string()),
            Self::Timestamptz(t) => t
                .format(&Rfc3339)
                .unwrap_or_else(|_| t.to_string()),
        }
    }

    /// Name of the carried variant, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Boolean(_) => "boolean",
            Self::Int8(_) => "int8",
            Self::Float8(_) => "float8",
            Self::Text(_) => "text",
            Self::Date(_) => "date",
            Self::Timestamptz(_) => "timestamptz",
        }
    }

    /// Whether this value is bindable to a column of the given dbtype.
    pub fn matches(&self, dbtype: DbType) -> bool {
        matches!(
            (self, dbtype),
            (Self::Boolean(_), DbType::Boolean)
                | (Self::Int8(_), DbType::Int8)
                | (Self::Float8(_), DbType::Float8)
                | (Self::Text(_), DbType::Text)
                | (Self::Text(_), DbType::Tsvector)
                | (Self::Date(_), DbType::Date)
                | (Self::Timestamptz(_), DbType::Timestamptz)
        )
    }

    /// Borrow the text content, if this is a text-like value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

//! Parameterized SQL assembly.
//!
//! Values are never interpolated into SQL text: every value flows through
//! [`SqlParams`], which hands back a positional `$n` placeholder, and the
//! catalog binds the accumulated values in order at execution time.

use curio_core::TagValue;

/// Positional parameter accumulator shared across a whole compilation,
/// including nested sub-queries.
#[derive(Debug, Default)]
pub struct SqlParams {
    values: Vec<TagValue>,
}

impl SqlParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value and get its `$n` placeholder.
    pub fn push(&mut self, value: TagValue) -> String {
        self.values.push(value);
        format!("${}", self.values.len())
    }

    /// Register a list of values and get a parenthesized `($n, $m, ...)`
    /// placeholder list, for `IN` expressions.
    pub fn push_list(&mut self, values: impl IntoIterator<Item = TagValue>) -> String {
        let placeholders: Vec<String> = values.into_iter().map(|v| self.push(v)).collect();
        format!("({})", placeholders.join(", "))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_values(self) -> Vec<TagValue> {
        self.values
    }
}

/// Quote an SQL identifier, escaping embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// The storage relation for a tag, as a quoted identifier.
///
/// Every tag's relation carries a `t_` prefix so dynamic tag names can never
/// collide with the catalog's fixed relations.
pub fn tag_table(name: &str) -> String {
    quote_ident(&format!("t_{name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders_are_positional() {
        let mut params = SqlParams::new();
        assert_eq!(params.push(TagValue::Int8(1)), "$1");
        assert_eq!(params.push(TagValue::Text("x".into())), "$2");
        assert_eq!(
            params.push_list([TagValue::Int8(2), TagValue::Int8(3)]),
            "($3, $4)"
        );
        assert_eq!(params.into_values().len(), 4);
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_tag_table_prefix() {
        assert_eq!(tag_table("name"), "\"t_name\"");
        assert_eq!(tag_table("subjects"), "\"t_subjects\"");
    }
}

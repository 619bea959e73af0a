//! Path query language for the Curio metadata catalog.
//!
//! This crate owns the query surface: the predicate/path abstract syntax
//! (`ast`), the URL-safe surface-syntax parser (`parse`), the parameterized
//! SQL fragment machinery (`sql`), and the compiler that turns a parsed path
//! into one relational query honoring read authorization and reference
//! semantics (`compile`).
//!
//! Nothing here touches a database; compilation produces SQL text plus an
//! ordered parameter list for the catalog crate to execute.

pub mod ast;
pub mod compile;
pub mod parse;
pub mod sql;

pub use ast::{Direction, OrderTag, Path, PathElem, Predicate, PredicateOp, PredValue};
pub use compile::{
    CompileError, CompileOptions, CompiledQuery, QueryShape, SchemaView, compile,
    is_unique_identifying,
};
pub use parse::{ParseError, parse_path};
pub use sql::{SqlParams, quote_ident, tag_table};

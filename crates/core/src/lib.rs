//! Core domain types and shared logic for the Curio metadata catalog.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Subject identifiers
//! - Tag values and database types
//! - Tag definitions and reserved system tags
//! - Authorization policy vocabulary and the three-valued evaluator
//! - Principal context
//! - Configuration types

pub mod config;
pub mod error;
pub mod policy;
pub mod tagdef;
pub mod value;

pub use error::{Error, Result};
pub use policy::{
    AccessMode, Decision, Policy, PolicyInputs, PolicyName, PrincipalContext, SubjectAccess,
};
pub use tagdef::{TagDef, TagRef, reserved};
pub use value::{DbType, TagValue};

/// Opaque identity of one catalog resource.
pub type SubjectId = i64;

/// Maximum length of a tag name.
pub const MAX_TAG_NAME_LEN: usize = 64;

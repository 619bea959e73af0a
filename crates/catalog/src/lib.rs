//! Tag-graph store and mutation engine for the Curio metadata catalog.
//!
//! This crate owns everything that touches the database:
//! - The schema manager mapping tag definitions onto per-tag relations
//! - The triple store with its authorization-blind primitives and checked
//!   wrappers, reverse "tags present" index, and change-tracking txids
//! - Dynamic policy resolution (object readability, subject ACLs)
//! - The bulk mutation engine
//! - txid-keyed result caches

pub mod authz;
pub mod bulk;
pub mod cache;
pub mod error;
pub mod models;
pub mod schema;
pub mod store;

pub use authz::{TagdefEntry, TagdefSnapshot};
pub use bulk::{BulkOutcome, InputRow, OnExisting, OnMissing};
pub use cache::TxCache;
pub use error::{CatalogError, CatalogResult};
pub use models::{CellValue, ResultRow};
pub use store::{CatalogStore, QueryOptions};

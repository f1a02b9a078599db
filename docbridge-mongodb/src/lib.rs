//! # docbridge-mongodb
//!
//! A convention-driven access layer for MongoDB-compatible document stores.
//!
//! This crate provides:
//! - Lazy, single-flight connection management with shared database handles
//! - Identifier and timestamp coercion driven by field-naming conventions
//! - A verb-per-operation store API whose store failures fold into empty results
//! - Automatic and manual joins (`populate`) inferred from foreign-key names
//! - Soft delete that frees values held by unique indexes
//!
//! ## Example
//!
//! ```rust,no_run
//! use docbridge_mongodb::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> DocbridgeResult<()> {
//!     let store = DocStore::builder()
//!         .uri("mongodb://localhost:27017")
//!         .database("billing")
//!         .build();
//!
//!     // `customer_id` is stored as an ObjectId, `created_datetime` as a date.
//!     store
//!         .save(
//!             doc! {
//!                 "customer_id": "507f1f77bcf86cd799439011",
//!                 "created_datetime": "2024-03-01T10:00:00Z",
//!             },
//!             "orders",
//!             None,
//!         )
//!         .await?;
//!
//!     // Each order comes back with a `customer` array joined in.
//!     let orders = store.populate_auto(doc! {}, "orders", None).await?;
//!     println!("{orders:?}");
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Errors
//!
//! Misconfiguration, use after `close`, and values that cannot be coerced
//! are returned as [`DocbridgeError`]. Everything the store itself rejects
//! is logged and replaced by the verb's empty value.

pub mod coerce;
pub mod config;
pub mod connection;
pub mod document;
pub mod driver;
pub mod error;
pub mod executor;
pub mod filter;
pub mod logging;
pub mod naming;
pub mod populate;
pub mod soft_delete;
pub mod stages;
pub mod store;

pub use bson::oid::ObjectId;
pub use bson::{Bson, Document, doc};
pub use coerce::{Coercer, Coercion};
pub use config::{DocbridgeConfig, MongoConfig, MongoConfigBuilder, ReadPreference, WriteConcern};
pub use connection::{ConnectionManager, ConnectionState, DatabaseHandle};
pub use document::DocumentExt;
pub use driver::memory::{MemoryConnector, MemoryStore};
pub use driver::mongo::MongoConnector;
pub use driver::{Command, Connector, DatabaseBackend, FindOptions, Reply, Session};
pub use error::{DocbridgeError, DocbridgeResult, StoreError, StoreResult};
pub use executor::{CoercionPolicy, CommandExecutor};
pub use filter::FilterBuilder;
pub use naming::{IdMatch, NamingConvention};
pub use populate::{
    JoinMode, KeyUnionScanProbe, PopulateOptions, SampleOrScanProbe, SampleProbe, SchemaProbe,
    StaticSchemaProbe,
};
pub use soft_delete::{SoftDeleteReport, Tombstone};
pub use store::{DocStore, DocStoreBuilder};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::{DocbridgeConfig, MongoConfig};
    pub use crate::document::DocumentExt;
    pub use crate::error::{DocbridgeError, DocbridgeResult};
    pub use crate::filter::FilterBuilder;
    pub use crate::naming::NamingConvention;
    pub use crate::populate::PopulateOptions;
    pub use crate::soft_delete::SoftDeleteReport;
    pub use crate::store::{DocStore, DocStoreBuilder};
    pub use bson::oid::ObjectId;
    pub use bson::{Bson, Document, doc};
}

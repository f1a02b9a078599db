//! # Docbridge
//!
//! A convention-driven access layer for MongoDB-compatible document stores.
//!
//! Docbridge provides:
//! - One async method per store verb, addressed by collection and database name
//! - Lazy connection with a single shared session
//! - Identifier and timestamp coercion inferred from field names
//! - Joins across collections inferred from foreign-key names
//! - Soft delete that keeps unique indexes usable
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docbridge::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> DocbridgeResult<()> {
//!     let store = DocStore::from_env();
//!
//!     let customer = store
//!         .find_id_one("507f1f77bcf86cd799439011", "customer", Some("billing"))
//!         .await?;
//!     println!("{customer:?}");
//!
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

/// The MongoDB access layer.
pub mod mongodb {
    pub use docbridge_mongodb::*;
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use docbridge_mongodb::prelude::*;
}

pub use docbridge_mongodb::{
    DocStore, DocStoreBuilder, DocbridgeConfig, DocbridgeError, DocbridgeResult, NamingConvention,
    logging,
};

//! The lower-level store seam.
//!
//! The access layer never talks to a wire protocol. It is handed a
//! [`Connector`] that opens one [`Session`] per manager; a session hands out
//! lightweight [`DatabaseBackend`] views; a backend executes one [`Command`]
//! against a named collection and answers with a [`Reply`].
//!
//! Two connectors ship with the crate: [`mongo::MongoConnector`] over the
//! official driver and [`memory::MemoryConnector`], an in-process store.

pub mod memory;
pub mod mongo;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bson::{Bson, Document};

use crate::error::{StoreError, StoreResult};

/// Name of the implicit primary-key index.
pub const ID_INDEX_NAME: &str = "_id_";

/// Opens sessions against a store.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a session for `uri`.
    async fn connect(&self, uri: &str) -> StoreResult<Arc<dyn Session>>;
}

/// One live client session shared by every database handle.
#[async_trait]
pub trait Session: Send + Sync {
    /// A view over database `name`. Views share the session.
    fn database(&self, name: &str) -> Arc<dyn DatabaseBackend>;

    /// Whether the session is still usable.
    fn is_alive(&self) -> bool;

    /// Release the session.
    async fn close(&self);
}

/// A database view able to run commands.
#[async_trait]
pub trait DatabaseBackend: Send + Sync {
    /// Database name.
    fn name(&self) -> &str;

    /// Run one command against `collection`.
    async fn execute(&self, collection: &str, command: Command) -> StoreResult<Reply>;
}

/// Sort, window and deadline options of a read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    /// Sort specification (`{ field: 1 | -1 }`).
    pub sort: Option<Document>,
    /// Maximum number of documents.
    pub limit: Option<i64>,
    /// Number of documents to skip.
    pub skip: Option<u64>,
    /// Server-side deadline, passed through uninterpreted.
    pub max_time: Option<Duration>,
}

impl FindOptions {
    /// Create empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sort specification.
    pub fn sort(mut self, sort: Document) -> Self {
        self.sort = Some(sort);
        self
    }

    /// Set the limit.
    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the skip.
    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Set the server-side deadline.
    pub fn max_time(mut self, max_time: Duration) -> Self {
        self.max_time = Some(max_time);
        self
    }
}

/// One store operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Multi-document read.
    Find {
        /// Query filter.
        filter: Document,
        /// Read options.
        options: FindOptions,
    },
    /// Single-document read.
    FindOne {
        /// Query filter.
        filter: Document,
        /// Read options (sort and skip are honoured).
        options: FindOptions,
    },
    /// Insert one document.
    InsertOne {
        /// The document.
        document: Document,
    },
    /// Insert a batch.
    InsertMany {
        /// The documents.
        documents: Vec<Document>,
    },
    /// Update the first matching document.
    UpdateOne {
        /// Query filter.
        filter: Document,
        /// Update document (operators or a replacement).
        update: Document,
        /// Insert when nothing matches.
        upsert: bool,
    },
    /// Update every matching document.
    UpdateMany {
        /// Query filter.
        filter: Document,
        /// Update document.
        update: Document,
        /// Insert when nothing matches.
        upsert: bool,
    },
    /// Update one document and return its post-image.
    FindOneAndUpdate {
        /// Query filter.
        filter: Document,
        /// Update document.
        update: Document,
        /// Insert when nothing matches.
        upsert: bool,
    },
    /// Delete the first matching document.
    DeleteOne {
        /// Query filter.
        filter: Document,
    },
    /// Delete every matching document.
    DeleteMany {
        /// Query filter.
        filter: Document,
    },
    /// Drop the collection.
    Drop,
    /// Create an index.
    CreateIndex {
        /// Index keys.
        keys: Document,
        /// Enforce uniqueness.
        unique: bool,
    },
    /// List the collection's indexes.
    ListIndexes,
    /// Run an aggregation pipeline.
    Aggregate {
        /// Pipeline stages.
        pipeline: Vec<Document>,
        /// Allow spilling to disk.
        allow_disk_use: bool,
    },
    /// Distinct values of a field.
    Distinct {
        /// Field name.
        field: String,
        /// Query filter.
        filter: Document,
    },
    /// Count matching documents.
    Count {
        /// Query filter.
        filter: Document,
    },
}

impl Command {
    /// Operation name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Find { .. } => "find",
            Self::FindOne { .. } => "findOne",
            Self::InsertOne { .. } => "insertOne",
            Self::InsertMany { .. } => "insertMany",
            Self::UpdateOne { .. } => "updateOne",
            Self::UpdateMany { .. } => "updateMany",
            Self::FindOneAndUpdate { .. } => "findOneAndUpdate",
            Self::DeleteOne { .. } => "deleteOne",
            Self::DeleteMany { .. } => "deleteMany",
            Self::Drop => "drop",
            Self::CreateIndex { .. } => "createIndex",
            Self::ListIndexes => "listIndexes",
            Self::Aggregate { .. } => "aggregate",
            Self::Distinct { .. } => "distinct",
            Self::Count { .. } => "count",
        }
    }
}

/// Outcome of an insert.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertSummary {
    /// Identifiers of the inserted documents, in input order.
    pub inserted_ids: Vec<Bson>,
}

/// Outcome of an update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateSummary {
    /// Documents matched by the filter.
    pub matched_count: u64,
    /// Documents actually changed.
    pub modified_count: u64,
    /// Identifier of an upserted document.
    pub upserted_id: Option<Bson>,
}

/// Outcome of a delete.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteSummary {
    /// Documents removed.
    pub deleted_count: u64,
}

/// A declared index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpec {
    /// Index name.
    pub name: String,
    /// Index keys in declaration order.
    pub keys: Document,
    /// Whether the index enforces uniqueness.
    pub unique: bool,
}

impl IndexSpec {
    /// Field names covered by the index.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    /// Generate the default index name (`field_1_other_-1`).
    pub fn default_name(keys: &Document) -> String {
        keys.iter()
            .map(|(field, direction)| match direction {
                Bson::Int32(n) => format!("{field}_{n}"),
                Bson::Int64(n) => format!("{field}_{n}"),
                Bson::Double(n) => format!("{field}_{n}"),
                Bson::String(s) => format!("{field}_{s}"),
                _ => format!("{field}_1"),
            })
            .collect::<Vec<_>>()
            .join("_")
    }
}

/// Answer to a [`Command`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Documents of a read or aggregation.
    Documents(Vec<Document>),
    /// Single-document read.
    Document(Option<Document>),
    /// Insert outcome.
    Inserted(InsertSummary),
    /// Update outcome.
    Updated(UpdateSummary),
    /// Delete outcome.
    Deleted(DeleteSummary),
    /// Declared indexes.
    Indexes(Vec<IndexSpec>),
    /// Created index name.
    IndexName(String),
    /// Distinct values.
    Values(Vec<Bson>),
    /// Document count.
    Count(u64),
    /// No payload.
    Unit,
}

macro_rules! reply_accessor {
    ($fn:ident, $variant:ident, $ty:ty) => {
        /// Unwrap the expected variant, or fail with an internal error.
        pub fn $fn(self) -> StoreResult<$ty> {
            match self {
                Self::$variant(value) => Ok(value),
                other => Err(StoreError::internal(format!(
                    concat!("expected ", stringify!($variant), " reply, got {:?}"),
                    other
                ))),
            }
        }
    };
}

impl Reply {
    reply_accessor!(into_documents, Documents, Vec<Document>);
    reply_accessor!(into_document, Document, Option<Document>);
    reply_accessor!(into_inserted, Inserted, InsertSummary);
    reply_accessor!(into_updated, Updated, UpdateSummary);
    reply_accessor!(into_deleted, Deleted, DeleteSummary);
    reply_accessor!(into_indexes, Indexes, Vec<IndexSpec>);
    reply_accessor!(into_index_name, IndexName, String);
    reply_accessor!(into_values, Values, Vec<Bson>);
    reply_accessor!(into_count, Count, u64);
}

//! The public verb layer.
//!
//! [`DocStore`] exposes one async method per store verb. Every verb goes
//! through the [`CommandExecutor`]; store failures are logged and replaced
//! by the verb's empty sentinel (an empty `Vec`, an empty [`Document`] or
//! `None`), while configuration, connection-state and coercion errors are
//! returned to the caller.
//!
//! ```rust,no_run
//! use docbridge_mongodb::prelude::*;
//!
//! # async fn run() -> DocbridgeResult<()> {
//! let store = DocStore::builder()
//!     .uri("mongodb://localhost:27017")
//!     .database("billing")
//!     .build();
//!
//! let order = doc! { "name": "Ana", "customer_id": "507f1f77bcf86cd799439011" };
//! store.save(order, "orders", None).await?;
//! let orders = store.populate_auto(doc! {}, "orders", None).await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use bson::{Bson, Document, doc};

use crate::coerce::{Coercer, parse_object_id};
use crate::config::{DocbridgeConfig, MongoConfig};
use crate::connection::ConnectionManager;
use crate::driver::mongo::MongoConnector;
use crate::driver::{Command, Connector, DeleteSummary, FindOptions, IndexSpec, UpdateSummary};
use crate::error::{DocbridgeError, DocbridgeResult};
use crate::executor::{CoercionPolicy, CommandExecutor, settle};
use crate::filter;
use crate::naming::NamingConvention;
use crate::populate::{KeyUnionScanProbe, PopulateOptions, Resolver, SampleOrScanProbe, SchemaProbe};
use crate::soft_delete::{SoftDeleteGuard, SoftDeleteReport};

/// Field incremented by [`DocStore::next_sequence_value`].
pub const SEQUENCE_FIELD: &str = "sequence_value";

/// Document store access layer.
///
/// Cheap to clone; clones share the connection manager.
#[derive(Clone)]
pub struct DocStore {
    executor: Arc<CommandExecutor>,
    probe: Arc<dyn SchemaProbe>,
}

impl DocStore {
    /// Create a builder.
    pub fn builder() -> DocStoreBuilder {
        DocStoreBuilder::new()
    }

    /// Build a store from a loaded configuration file.
    pub fn from_config(config: DocbridgeConfig) -> Self {
        Self::builder()
            .config(config.mongo_config())
            .naming(config.naming)
            .build()
    }

    /// Build a store from `DOCBRIDGE_URI` / `DOCBRIDGE_DATABASE`.
    pub fn from_env() -> Self {
        Self::builder().config(MongoConfig::from_env()).build()
    }

    /// The executor.
    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    /// The connection manager.
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        self.executor.manager()
    }

    /// The naming convention.
    pub fn naming(&self) -> &NamingConvention {
        self.executor.naming()
    }

    /// Connect now instead of on first use.
    pub async fn connect(&self) -> DocbridgeResult<()> {
        self.manager().connect(self.executor.uri()).await?;
        Ok(())
    }

    /// Whether a live session is open.
    pub fn is_connected(&self) -> bool {
        self.manager().is_connected()
    }

    /// Drop every database handle and release the session.
    pub async fn close(&self) {
        self.manager().close_all().await;
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// The document with primary key `id`.
    pub async fn find_id_one(
        &self,
        id: impl Into<Bson>,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Document> {
        let filter = filter::by_id(self.naming(), id);
        let result = self
            .read_one(
                "find_id_one",
                filter,
                FindOptions::new(),
                CoercionPolicy::FILTER_IDS,
                collection,
                database,
            )
            .await;
        settle("find_id_one", result, Document::new())
    }

    /// The first document matching `filter`.
    pub async fn find_one(
        &self,
        filter: Document,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Document> {
        let result = self
            .read_one(
                "find_one",
                filter,
                FindOptions::new(),
                CoercionPolicy::RAW,
                collection,
                database,
            )
            .await;
        settle("find_one", result, Document::new())
    }

    /// Every document matching `filter`.
    pub async fn find_many(
        &self,
        filter: Document,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Vec<Document>> {
        let result = self
            .read(
                "find_many",
                filter,
                FindOptions::new(),
                CoercionPolicy::RAW,
                collection,
                database,
            )
            .await;
        settle("find_many", result, Vec::new())
    }

    /// At most `limit` documents matching `filter`.
    pub async fn find_many_limit(
        &self,
        filter: Document,
        limit: i64,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Vec<Document>> {
        let options = FindOptions::new().limit(limit);
        let result = self
            .read("find_many_limit", filter, options, CoercionPolicy::RAW, collection, database)
            .await;
        settle("find_many_limit", result, Vec::new())
    }

    /// Documents matching `filter` read with caller-supplied options.
    ///
    /// This is the verb for a server-side deadline
    /// ([`FindOptions::max_time`]) or any sort/skip/limit combination the
    /// other reads do not cover.
    pub async fn find_many_with(
        &self,
        filter: Document,
        options: FindOptions,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Vec<Document>> {
        let result = self
            .read("find_many_with", filter, options, CoercionPolicy::RAW, collection, database)
            .await;
        settle("find_many_with", result, Vec::new())
    }

    /// The first document matching `filter` under `sort`.
    pub async fn find_one_last(
        &self,
        filter: Document,
        sort: Document,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Document> {
        let options = FindOptions::new().sort(sort);
        let result = self
            .read_one("find_one_last", filter, options, CoercionPolicy::RAW, collection, database)
            .await;
        settle("find_one_last", result, Document::new())
    }

    /// The newest `limit` documents matching `filter`, identifiers coerced.
    pub async fn find_limit_last(
        &self,
        filter: Document,
        limit: i64,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Vec<Document>> {
        let options = FindOptions::new().sort(self.id_order(-1)).limit(limit);
        let result = self
            .read(
                "find_limit_last",
                filter,
                options,
                CoercionPolicy::FILTER_IDS,
                collection,
                database,
            )
            .await;
        settle("find_limit_last", result, Vec::new())
    }

    /// Every document, oldest first.
    pub async fn get_all(
        &self,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Vec<Document>> {
        let options = FindOptions::new().sort(self.id_order(1));
        let result = self
            .read("get_all", Document::new(), options, CoercionPolicy::RAW, collection, database)
            .await;
        settle("get_all", result, Vec::new())
    }

    /// The newest `limit` documents.
    pub async fn get_last(
        &self,
        limit: i64,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Vec<Document>> {
        let options = FindOptions::new().sort(self.id_order(-1)).limit(limit);
        let result = self
            .read("get_last", Document::new(), options, CoercionPolicy::RAW, collection, database)
            .await;
        settle("get_last", result, Vec::new())
    }

    /// Page `page` (zero-based) of `per_page` documents, oldest first.
    pub async fn find_paginated(
        &self,
        filter: Document,
        page: u64,
        per_page: u64,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Vec<Document>> {
        let options = self.page(page, per_page);
        let result = self
            .read("find_paginated", filter, options, CoercionPolicy::RAW, collection, database)
            .await;
        settle("find_paginated", result, Vec::new())
    }

    /// Number of documents matching `filter`.
    pub async fn count(
        &self,
        filter: Document,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Option<u64>> {
        let result = async {
            let reply = self
                .executor
                .execute(
                    "count",
                    collection,
                    database,
                    CoercionPolicy::RAW,
                    Command::Count { filter },
                )
                .await?;
            Ok::<_, DocbridgeError>(Some(reply.into_count()?))
        }
        .await;
        settle("count", result, None)
    }

    /// Distinct values of `field` among documents matching `filter`.
    pub async fn distinct(
        &self,
        field: &str,
        filter: Document,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Vec<Bson>> {
        let command = Command::Distinct {
            field: field.to_string(),
            filter,
        };
        let result = async {
            let reply = self
                .executor
                .execute("distinct", collection, database, CoercionPolicy::RAW, command)
                .await?;
            Ok::<_, DocbridgeError>(reply.into_values()?)
        }
        .await;
        settle("distinct", result, Vec::new())
    }

    // ------------------------------------------------------------------
    // Reads that skip soft-deleted documents
    // ------------------------------------------------------------------

    /// [`find_one`](Self::find_one) over documents that are not deleted.
    pub async fn nd_find_one(
        &self,
        filter: Document,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Document> {
        let filter = filter::not_deleted(self.naming(), filter);
        let result = self
            .read_one(
                "nd_find_one",
                filter,
                FindOptions::new(),
                CoercionPolicy::RAW,
                collection,
                database,
            )
            .await;
        settle("nd_find_one", result, Document::new())
    }

    /// Documents that are not deleted, sorted by `order` (oldest first by
    /// default).
    pub async fn nd_find_many(
        &self,
        filter: Document,
        order: Option<Document>,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Vec<Document>> {
        let filter = filter::not_deleted(self.naming(), filter);
        let options = FindOptions::new().sort(order.unwrap_or_else(|| self.id_order(1)));
        let result = self
            .read("nd_find_many", filter, options, CoercionPolicy::RAW, collection, database)
            .await;
        settle("nd_find_many", result, Vec::new())
    }

    /// [`find_paginated`](Self::find_paginated) over documents that are
    /// not deleted.
    pub async fn nd_find_paginated(
        &self,
        filter: Document,
        page: u64,
        per_page: u64,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Vec<Document>> {
        let filter = filter::not_deleted(self.naming(), filter);
        let options = self.page(page, per_page);
        let result = self
            .read("nd_find_paginated", filter, options, CoercionPolicy::RAW, collection, database)
            .await;
        settle("nd_find_paginated", result, Vec::new())
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Insert one document. Returns its primary key.
    pub async fn save(
        &self,
        document: Document,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Option<Bson>> {
        let result = async {
            let summary = self
                .executor
                .execute(
                    "save",
                    collection,
                    database,
                    CoercionPolicy::WRITE,
                    Command::InsertOne { document },
                )
                .await?
                .into_inserted()?;
            Ok::<_, DocbridgeError>(summary.inserted_ids.into_iter().next())
        }
        .await;
        settle("save", result, None)
    }

    /// Insert a batch. Returns the primary keys in input order.
    pub async fn save_many(
        &self,
        documents: Vec<Document>,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Option<Vec<Bson>>> {
        let result = async {
            let summary = self
                .executor
                .execute(
                    "save_many",
                    collection,
                    database,
                    CoercionPolicy::WRITE,
                    Command::InsertMany { documents },
                )
                .await?
                .into_inserted()?;
            Ok::<_, DocbridgeError>(Some(summary.inserted_ids))
        }
        .await;
        settle("save_many", result, None)
    }

    /// `$set` `fields` on the first document matching `filter`.
    pub async fn update(
        &self,
        filter: Document,
        fields: Document,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Option<UpdateSummary>> {
        let command = Command::UpdateOne {
            filter,
            update: doc! { "$set": fields },
            upsert: false,
        };
        self.write("update", command, CoercionPolicy::WRITE, collection, database)
            .await
    }

    /// `$set` `fields` on the document with primary key `id`.
    pub async fn update_by_id(
        &self,
        id: impl Into<Bson>,
        fields: Document,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Option<UpdateSummary>> {
        let command = Command::UpdateOne {
            filter: filter::by_id(self.naming(), id),
            update: doc! { "$set": fields },
            upsert: false,
        };
        self.write("update_by_id", command, CoercionPolicy::FILTERED_WRITE, collection, database)
            .await
    }

    /// `$set` `fields` on every document matching `filter`.
    pub async fn update_many(
        &self,
        filter: Document,
        fields: Document,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Option<UpdateSummary>> {
        let command = Command::UpdateMany {
            filter,
            update: doc! { "$set": fields },
            upsert: false,
        };
        self.write("update_many", command, CoercionPolicy::FILTERED_WRITE, collection, database)
            .await
    }

    /// Apply a caller-built update document to the first match.
    pub async fn update_one_raw(
        &self,
        filter: Document,
        update: Document,
        upsert: bool,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Option<UpdateSummary>> {
        let command = Command::UpdateOne {
            filter,
            update,
            upsert,
        };
        self.write("update_one_raw", command, CoercionPolicy::FILTERED_WRITE, collection, database)
            .await
    }

    /// `$set` `fields` on the first match, inserting when nothing matches.
    pub async fn upsert(
        &self,
        filter: Document,
        fields: Document,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Option<UpdateSummary>> {
        let command = Command::UpdateOne {
            filter,
            update: doc! { "$set": fields },
            upsert: true,
        };
        self.write("upsert", command, CoercionPolicy::WRITE, collection, database)
            .await
    }

    /// Update the first match and return it as it is after the update.
    pub async fn find_one_and_update(
        &self,
        filter: Document,
        update: Document,
        upsert: bool,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Document> {
        let command = Command::FindOneAndUpdate {
            filter,
            update,
            upsert,
        };
        let result = async {
            let post_image = self
                .executor
                .execute(
                    "find_one_and_update",
                    collection,
                    database,
                    CoercionPolicy::FILTERED_WRITE,
                    command,
                )
                .await?
                .into_document()?;
            Ok::<_, DocbridgeError>(post_image.unwrap_or_default())
        }
        .await;
        settle("find_one_and_update", result, Document::new())
    }

    /// Increment the counter document matching `filter` by `increment`,
    /// creating it when missing.
    ///
    /// Returns the value *after* the increment, so the first call on a new
    /// counter yields `increment` rather than `None`. Callers that want the
    /// previous value subtract `increment`.
    pub async fn next_sequence_value(
        &self,
        filter: Document,
        increment: i64,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Option<i64>> {
        let command = Command::FindOneAndUpdate {
            filter,
            update: doc! { "$inc": { SEQUENCE_FIELD: increment } },
            upsert: true,
        };
        let result = async {
            let post_image = self
                .executor
                .execute("next_sequence_value", collection, database, CoercionPolicy::RAW, command)
                .await?
                .into_document()?;
            Ok::<_, DocbridgeError>(post_image.and_then(|doc| match doc.get(SEQUENCE_FIELD) {
                Some(Bson::Int32(n)) => Some(i64::from(*n)),
                Some(Bson::Int64(n)) => Some(*n),
                Some(Bson::Double(n)) => Some(*n as i64),
                _ => None,
            }))
        }
        .await;
        settle("next_sequence_value", result, None)
    }

    // ------------------------------------------------------------------
    // Array and field modifiers
    // ------------------------------------------------------------------

    /// `$push` `fields` on the document with primary key `id`.
    pub async fn push_by_id(
        &self,
        id: impl Into<Bson>,
        fields: Document,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Option<UpdateSummary>> {
        let command = Command::UpdateOne {
            filter: filter::by_id(self.naming(), id),
            update: doc! { "$push": fields },
            upsert: false,
        };
        self.write("push_by_id", command, CoercionPolicy::FILTER_IDS, collection, database)
            .await
    }

    /// `$push` `fields` on every document whose primary key is in `ids`.
    pub async fn push_many_by_ids(
        &self,
        ids: Vec<Bson>,
        fields: Document,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Option<UpdateSummary>> {
        self.modify_many_by_ids("push_many_by_ids", "$push", ids, fields, collection, database)
            .await
    }

    /// `$addToSet` `fields` on every document whose primary key is in `ids`.
    pub async fn add_to_set_many_by_ids(
        &self,
        ids: Vec<Bson>,
        fields: Document,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Option<UpdateSummary>> {
        self.modify_many_by_ids(
            "add_to_set_many_by_ids",
            "$addToSet",
            ids,
            fields,
            collection,
            database,
        )
        .await
    }

    /// `$pull` `fields` on every document whose primary key is in `ids`.
    pub async fn pull_many_by_ids(
        &self,
        ids: Vec<Bson>,
        fields: Document,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Option<UpdateSummary>> {
        self.modify_many_by_ids("pull_many_by_ids", "$pull", ids, fields, collection, database)
            .await
    }

    /// `$pull` `fields` on every document matching `filter`.
    pub async fn pull_many(
        &self,
        filter: Document,
        fields: Document,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Option<UpdateSummary>> {
        let command = Command::UpdateMany {
            filter,
            update: doc! { "$pull": fields },
            upsert: false,
        };
        self.write("pull_many", command, CoercionPolicy::RAW, collection, database)
            .await
    }

    /// Pull the values named by `filter` out of every document matching it,
    /// e.g. detach an event id from every document that lists it.
    pub async fn pull_matching(
        &self,
        filter: Document,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Option<UpdateSummary>> {
        let command = Command::UpdateMany {
            filter: filter.clone(),
            update: doc! { "$pull": filter },
            upsert: false,
        };
        self.write("pull_matching", command, CoercionPolicy::RAW, collection, database)
            .await
    }

    /// `$push` the identifier `value` onto array `field` of the document
    /// with primary key `id`.
    pub async fn push_object_id_by_id(
        &self,
        id: impl Into<Bson>,
        field: &str,
        value: impl Into<Bson>,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Option<UpdateSummary>> {
        let value = match value.into() {
            Bson::String(s) => Bson::ObjectId(parse_object_id(field, &s)?),
            Bson::ObjectId(oid) => Bson::ObjectId(oid),
            other => {
                return Err(DocbridgeError::coercion(
                    field,
                    format!("expected an identifier, found {:?}", other.element_type()),
                ));
            }
        };
        let mut push = Document::new();
        push.insert(field, value);
        let command = Command::UpdateOne {
            filter: filter::by_id(self.naming(), id),
            update: doc! { "$push": push },
            upsert: false,
        };
        self.write(
            "push_object_id_by_id",
            command,
            CoercionPolicy::FILTER_IDS,
            collection,
            database,
        )
        .await
    }

    /// `$unset` `property` on the document with primary key `id`.
    pub async fn remove_property_by_id(
        &self,
        id: impl Into<Bson>,
        property: &str,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Option<UpdateSummary>> {
        let mut unset = Document::new();
        unset.insert(property, "");
        let command = Command::UpdateOne {
            filter: filter::by_id(self.naming(), id),
            update: doc! { "$unset": unset },
            upsert: false,
        };
        self.write(
            "remove_property_by_id",
            command,
            CoercionPolicy::FILTER_IDS,
            collection,
            database,
        )
        .await
    }

    /// `$rename` fields (`{ old: "new" }`) on every document matching
    /// `filter`.
    pub async fn rename_many(
        &self,
        filter: Document,
        renames: Document,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Option<UpdateSummary>> {
        let command = Command::UpdateMany {
            filter,
            update: doc! { "$rename": renames },
            upsert: false,
        };
        self.write("rename_many", command, CoercionPolicy::RAW, collection, database)
            .await
    }

    // ------------------------------------------------------------------
    // Deletes
    // ------------------------------------------------------------------

    /// Delete the document with primary key `id`.
    pub async fn delete_by_id(
        &self,
        id: impl Into<Bson>,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Option<DeleteSummary>> {
        let command = Command::DeleteOne {
            filter: filter::by_id(self.naming(), id),
        };
        self.delete("delete_by_id", command, CoercionPolicy::FILTER_IDS, collection, database)
            .await
    }

    /// Delete every document matching `filter`.
    pub async fn delete_many(
        &self,
        filter: Document,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Option<DeleteSummary>> {
        self.delete(
            "delete_many",
            Command::DeleteMany { filter },
            CoercionPolicy::RAW,
            collection,
            database,
        )
        .await
    }

    /// Drop the collection.
    pub async fn drop_collection(
        &self,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Option<()>> {
        let result = self
            .executor
            .execute("drop_collection", collection, database, CoercionPolicy::RAW, Command::Drop)
            .await
            .map(|_| Some(()));
        settle("drop_collection", result, None)
    }

    /// Mark the document with primary key `id` deleted and tombstone its
    /// uniquely indexed fields.
    pub async fn soft_delete(
        &self,
        id: impl Into<Bson>,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Option<SoftDeleteReport>> {
        let result = SoftDeleteGuard::new(&self.executor)
            .soft_delete(id.into(), collection, database)
            .await
            .map(Some);
        settle("soft_delete", result, None)
    }

    /// Finish soft deletes that stopped before tombstoning. Returns the
    /// number of repaired documents.
    pub async fn repair_tombstones(
        &self,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Option<u64>> {
        let result = SoftDeleteGuard::new(&self.executor)
            .repair(collection, database)
            .await
            .map(Some);
        settle("repair_tombstones", result, None)
    }

    // ------------------------------------------------------------------
    // Indexes and aggregation
    // ------------------------------------------------------------------

    /// Create a unique index over `keys`. Returns the index name.
    pub async fn create_unique_index(
        &self,
        keys: Document,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Option<String>> {
        let command = Command::CreateIndex { keys, unique: true };
        let result = async {
            let name = self
                .executor
                .execute("create_unique_index", collection, database, CoercionPolicy::RAW, command)
                .await?
                .into_index_name()?;
            Ok::<_, DocbridgeError>(Some(name))
        }
        .await;
        settle("create_unique_index", result, None)
    }

    /// The collection's declared indexes.
    pub async fn indexes(
        &self,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Vec<IndexSpec>> {
        let result = async {
            let indexes = self
                .executor
                .execute("indexes", collection, database, CoercionPolicy::RAW, Command::ListIndexes)
                .await?
                .into_indexes()?;
            Ok::<_, DocbridgeError>(indexes)
        }
        .await;
        settle("indexes", result, Vec::new())
    }

    /// Run an aggregation pipeline (disk use allowed).
    pub async fn aggregate(
        &self,
        pipeline: Vec<Document>,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Vec<Document>> {
        let command = Command::Aggregate {
            pipeline,
            allow_disk_use: true,
        };
        let result = async {
            let docs = self
                .executor
                .execute("aggregate", collection, database, CoercionPolicy::RAW, command)
                .await?
                .into_documents()?;
            Ok::<_, DocbridgeError>(docs)
        }
        .await;
        settle("aggregate", result, Vec::new())
    }

    // ------------------------------------------------------------------
    // Populate
    // ------------------------------------------------------------------

    /// Join each of `collections` through its foreign-key field.
    pub async fn populate(
        &self,
        filter: Document,
        collections: &[&str],
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Vec<Document>> {
        let options = PopulateOptions::manual(collections.iter().copied());
        self.populate_with("populate", filter, &options, self.probe.as_ref(), collection, database)
            .await
    }

    /// Join every foreign key found on documents matching `filter`.
    pub async fn populate_auto(
        &self,
        filter: Document,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Vec<Document>> {
        self.populate_with(
            "populate_auto",
            filter,
            &PopulateOptions::auto(),
            self.probe.as_ref(),
            collection,
            database,
        )
        .await
    }

    /// [`populate_auto`](Self::populate_auto) over documents that are not
    /// deleted, probing the keys of the whole collection.
    pub async fn nd_populate_auto(
        &self,
        filter: Document,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Vec<Document>> {
        self.populate_with(
            "nd_populate_auto",
            filter,
            &PopulateOptions::auto().exclude_deleted(),
            &KeyUnionScanProbe,
            collection,
            database,
        )
        .await
    }

    /// The document with primary key `id`, with its foreign keys joined.
    pub async fn find_id_one_populated(
        &self,
        id: impl Into<Bson>,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Document> {
        let filter = filter::by_id(self.naming(), id);
        let docs = self
            .populate_with(
                "find_id_one_populated",
                filter,
                &PopulateOptions::auto(),
                self.probe.as_ref(),
                collection,
                database,
            )
            .await?;
        Ok(docs.into_iter().next().unwrap_or_default())
    }

    /// [`find_id_one_populated`](Self::find_id_one_populated) unless the
    /// document is deleted.
    pub async fn nd_find_id_one_populated(
        &self,
        id: impl Into<Bson>,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Document> {
        let filter = filter::by_id(self.naming(), id);
        let docs = self
            .populate_with(
                "nd_find_id_one_populated",
                filter,
                &PopulateOptions::auto().exclude_deleted(),
                self.probe.as_ref(),
                collection,
                database,
            )
            .await?;
        Ok(docs.into_iter().next().unwrap_or_default())
    }

    /// Populate with explicit options and probe.
    pub async fn populate_with(
        &self,
        operation: &str,
        filter: Document,
        options: &PopulateOptions,
        probe: &dyn SchemaProbe,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Vec<Document>> {
        let result = Resolver::new(&self.executor, probe)
            .resolve(filter, collection, database, options)
            .await;
        settle(operation, result, Vec::new())
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn id_order(&self, direction: i32) -> Document {
        let mut sort = Document::new();
        sort.insert(self.naming().primary_key.as_str(), direction);
        sort
    }

    fn page(&self, page: u64, per_page: u64) -> FindOptions {
        FindOptions::new()
            .sort(self.id_order(1))
            .skip(page.saturating_mul(per_page))
            .limit(i64::try_from(per_page).unwrap_or(i64::MAX))
    }

    async fn read(
        &self,
        operation: &str,
        filter: Document,
        options: FindOptions,
        policy: CoercionPolicy,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Vec<Document>> {
        let command = Command::Find { filter, options };
        let docs = self
            .executor
            .execute(operation, collection, database, policy, command)
            .await?
            .into_documents()?;
        Ok(docs)
    }

    async fn read_one(
        &self,
        operation: &str,
        filter: Document,
        options: FindOptions,
        policy: CoercionPolicy,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Document> {
        let command = Command::FindOne { filter, options };
        let doc = self
            .executor
            .execute(operation, collection, database, policy, command)
            .await?
            .into_document()?;
        Ok(doc.unwrap_or_default())
    }

    async fn write(
        &self,
        operation: &str,
        command: Command,
        policy: CoercionPolicy,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Option<UpdateSummary>> {
        let result = async {
            let summary = self
                .executor
                .execute(operation, collection, database, policy, command)
                .await?
                .into_updated()?;
            Ok::<_, DocbridgeError>(Some(summary))
        }
        .await;
        settle(operation, result, None)
    }

    async fn modify_many_by_ids(
        &self,
        operation: &str,
        operator: &str,
        ids: Vec<Bson>,
        fields: Document,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Option<UpdateSummary>> {
        let mut update = Document::new();
        update.insert(operator, fields);
        let command = Command::UpdateMany {
            filter: filter::by_ids(self.naming(), ids),
            update,
            upsert: false,
        };
        self.write(operation, command, CoercionPolicy::FILTER_IDS, collection, database)
            .await
    }

    async fn delete(
        &self,
        operation: &str,
        command: Command,
        policy: CoercionPolicy,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Option<DeleteSummary>> {
        let result = async {
            let summary = self
                .executor
                .execute(operation, collection, database, policy, command)
                .await?
                .into_deleted()?;
            Ok::<_, DocbridgeError>(Some(summary))
        }
        .await;
        settle(operation, result, None)
    }
}

impl fmt::Debug for DocStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocStore")
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

/// Builder for [`DocStore`].
#[derive(Default)]
pub struct DocStoreBuilder {
    uri: Option<String>,
    database: Option<String>,
    naming: NamingConvention,
    config: MongoConfig,
    connector: Option<Arc<dyn Connector>>,
    manager: Option<Arc<ConnectionManager>>,
    probe: Option<Arc<dyn SchemaProbe>>,
}

impl DocStoreBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection URI.
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Set the default database.
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the naming convention.
    pub fn naming(mut self, naming: NamingConvention) -> Self {
        self.naming = naming;
        self
    }

    /// Set the driver configuration. Its URI and database are used unless
    /// overridden.
    pub fn config(mut self, config: MongoConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom connector instead of the MongoDB driver.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Share an existing connection manager. Takes precedence over
    /// [`connector`](Self::connector).
    pub fn manager(mut self, manager: Arc<ConnectionManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Set the schema probe used by automatic populates.
    pub fn probe(mut self, probe: Arc<dyn SchemaProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Build the store. Nothing connects until the first verb runs.
    pub fn build(self) -> DocStore {
        let uri = self.uri.unwrap_or_else(|| self.config.uri.clone());
        let database = self.database.or_else(|| self.config.database.clone());
        let manager = match self.manager {
            Some(manager) => manager,
            None => {
                let connector = self
                    .connector
                    .unwrap_or_else(|| Arc::new(MongoConnector::new(self.config)));
                Arc::new(ConnectionManager::new(connector))
            }
        };
        let executor = CommandExecutor::new(manager, uri, database, Coercer::new(self.naming));
        DocStore {
            executor: Arc::new(executor),
            probe: self.probe.unwrap_or_else(|| Arc::new(SampleOrScanProbe)),
        }
    }
}

impl fmt::Debug for DocStoreBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocStoreBuilder")
            .field("uri", &self.uri)
            .field("database", &self.database)
            .field("naming", &self.naming)
            .finish_non_exhaustive()
    }
}

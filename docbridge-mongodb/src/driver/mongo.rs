//! Store seam over the official MongoDB driver.
//!
//! The driver pools connections internally, so one [`MongoSession`] wraps a
//! single [`Client`] and every [`MongoDatabase`] view shares it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bson::{Bson, Document, doc};
use futures::TryStreamExt;
use mongodb::error::ErrorKind;
use mongodb::options::{
    AggregateOptions, FindOneAndReplaceOptions, FindOneAndUpdateOptions, FindOneOptions,
    IndexOptions, ReplaceOptions, ReturnDocument, UpdateOptions,
};
use mongodb::{Client, Collection, Database, IndexModel};
use tracing::{debug, info};

use super::{
    Command, Connector, DatabaseBackend, DeleteSummary, FindOptions, ID_INDEX_NAME, IndexSpec,
    InsertSummary, Reply, Session, UpdateSummary,
};
use crate::config::MongoConfig;
use crate::error::{StoreError, StoreResult};

/// Server code for a namespace that does not exist.
const NAMESPACE_NOT_FOUND: i32 = 26;

/// Opens driver sessions using a [`MongoConfig`] for pool and timeout
/// settings. The URI passed to [`Connector::connect`] wins over the
/// configured one.
#[derive(Debug, Clone, Default)]
pub struct MongoConnector {
    config: MongoConfig,
}

impl MongoConnector {
    /// Create a connector.
    pub fn new(config: MongoConfig) -> Self {
        Self { config }
    }

    /// Get the configuration.
    pub fn config(&self) -> &MongoConfig {
        &self.config
    }
}

#[async_trait]
impl Connector for MongoConnector {
    async fn connect(&self, uri: &str) -> StoreResult<Arc<dyn Session>> {
        let options = self.config.to_client_options(uri).await?;
        let client = Client::with_options(options)
            .map_err(|e| StoreError::connection(format!("failed to create client: {}", e)))?;

        // The driver connects lazily; ping so an unreachable server fails here.
        client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| StoreError::connection(format!("ping failed: {}", e)))?;

        info!(uri = %uri, "MongoDB client created");
        Ok(Arc::new(MongoSession {
            client,
            alive: AtomicBool::new(true),
        }))
    }
}

/// A live driver client.
#[derive(Debug)]
pub struct MongoSession {
    client: Client,
    alive: AtomicBool,
}

impl MongoSession {
    /// Get the underlying MongoDB client.
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl Session for MongoSession {
    fn database(&self, name: &str) -> Arc<dyn DatabaseBackend> {
        Arc::new(MongoDatabase {
            database: self.client.database(name),
        })
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            self.client.clone().shutdown().await;
            debug!("MongoDB client shut down");
        }
    }
}

/// A database view over a driver client.
#[derive(Debug, Clone)]
pub struct MongoDatabase {
    database: Database,
}

impl MongoDatabase {
    /// Get the underlying database.
    pub fn inner(&self) -> &Database {
        &self.database
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.database.collection(name)
    }
}

#[async_trait]
impl DatabaseBackend for MongoDatabase {
    fn name(&self) -> &str {
        self.database.name()
    }

    async fn execute(&self, collection: &str, command: Command) -> StoreResult<Reply> {
        let coll = self.collection(collection);
        let reply = match command {
            Command::Find { filter, options } => {
                let cursor = coll.find(filter, find_options(options)).await?;
                Reply::Documents(cursor.try_collect().await?)
            }
            Command::FindOne { filter, options } => {
                let mut opts = FindOneOptions::default();
                opts.sort = options.sort;
                opts.skip = options.skip;
                opts.max_time = options.max_time;
                Reply::Document(coll.find_one(filter, opts).await?)
            }
            Command::InsertOne { document } => {
                let result = coll.insert_one(document, None).await?;
                Reply::Inserted(InsertSummary {
                    inserted_ids: vec![result.inserted_id],
                })
            }
            Command::InsertMany { documents } => {
                let result = coll.insert_many(documents, None).await?;
                let mut ids: Vec<(usize, Bson)> = result.inserted_ids.into_iter().collect();
                ids.sort_by_key(|(index, _)| *index);
                Reply::Inserted(InsertSummary {
                    inserted_ids: ids.into_iter().map(|(_, id)| id).collect(),
                })
            }
            Command::UpdateOne {
                filter,
                update,
                upsert,
            } => {
                let result = if is_operator_update(&update) {
                    let mut opts = UpdateOptions::default();
                    opts.upsert = Some(upsert);
                    coll.update_one(filter, update, opts).await?
                } else {
                    let mut opts = ReplaceOptions::default();
                    opts.upsert = Some(upsert);
                    coll.replace_one(filter, update, opts).await?
                };
                Reply::Updated(UpdateSummary {
                    matched_count: result.matched_count,
                    modified_count: result.modified_count,
                    upserted_id: result.upserted_id,
                })
            }
            Command::UpdateMany {
                filter,
                update,
                upsert,
            } => {
                let mut opts = UpdateOptions::default();
                opts.upsert = Some(upsert);
                let result = coll.update_many(filter, update, opts).await?;
                Reply::Updated(UpdateSummary {
                    matched_count: result.matched_count,
                    modified_count: result.modified_count,
                    upserted_id: result.upserted_id,
                })
            }
            Command::FindOneAndUpdate {
                filter,
                update,
                upsert,
            } => {
                let post_image = if is_operator_update(&update) {
                    let mut opts = FindOneAndUpdateOptions::default();
                    opts.upsert = Some(upsert);
                    opts.return_document = Some(ReturnDocument::After);
                    coll.find_one_and_update(filter, update, opts).await?
                } else {
                    let mut opts = FindOneAndReplaceOptions::default();
                    opts.upsert = Some(upsert);
                    opts.return_document = Some(ReturnDocument::After);
                    coll.find_one_and_replace(filter, update, opts).await?
                };
                Reply::Document(post_image)
            }
            Command::DeleteOne { filter } => {
                let result = coll.delete_one(filter, None).await?;
                Reply::Deleted(DeleteSummary {
                    deleted_count: result.deleted_count,
                })
            }
            Command::DeleteMany { filter } => {
                let result = coll.delete_many(filter, None).await?;
                Reply::Deleted(DeleteSummary {
                    deleted_count: result.deleted_count,
                })
            }
            Command::Drop => {
                debug!(collection = %collection, "Dropping collection");
                coll.drop(None).await?;
                Reply::Unit
            }
            Command::CreateIndex { keys, unique } => {
                let options = IndexOptions::builder().unique(unique).build();
                let model = IndexModel::builder().keys(keys).options(options).build();
                let result = coll.create_index(model, None).await?;
                Reply::IndexName(result.index_name)
            }
            Command::ListIndexes => Reply::Indexes(list_indexes(&coll).await?),
            Command::Aggregate {
                pipeline,
                allow_disk_use,
            } => {
                let mut opts = AggregateOptions::default();
                opts.allow_disk_use = Some(allow_disk_use);
                let cursor = coll.aggregate(pipeline, opts).await?;
                Reply::Documents(cursor.try_collect().await?)
            }
            Command::Distinct { field, filter } => {
                Reply::Values(coll.distinct(field, filter, None).await?)
            }
            Command::Count { filter } => Reply::Count(coll.count_documents(filter, None).await?),
        };
        Ok(reply)
    }
}

fn find_options(options: FindOptions) -> mongodb::options::FindOptions {
    let mut opts = mongodb::options::FindOptions::default();
    opts.sort = options.sort;
    opts.limit = options.limit;
    opts.skip = options.skip;
    opts.max_time = options.max_time;
    opts
}

fn is_operator_update(update: &Document) -> bool {
    update.keys().next().is_some_and(|k| k.starts_with('$'))
}

async fn list_indexes(coll: &Collection<Document>) -> StoreResult<Vec<IndexSpec>> {
    let cursor = match coll.list_indexes(None).await {
        Ok(cursor) => cursor,
        Err(e) if matches!(*e.kind, ErrorKind::Command(ref c) if c.code == NAMESPACE_NOT_FOUND) => {
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };
    let models: Vec<IndexModel> = cursor.try_collect().await?;
    Ok(models.into_iter().map(index_spec).collect())
}

fn index_spec(model: IndexModel) -> IndexSpec {
    let options = model.options.unwrap_or_default();
    let name = options
        .name
        .unwrap_or_else(|| IndexSpec::default_name(&model.keys));
    // The primary-key index is unique even though the server omits the flag.
    let unique = options.unique.unwrap_or(false) || name == ID_INDEX_NAME;
    IndexSpec {
        name,
        keys: model.keys,
        unique,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_find_options_mapping() {
        let opts = find_options(
            FindOptions::new()
                .sort(doc! { "created": -1 })
                .limit(5)
                .skip(10),
        );
        assert_eq!(opts.sort, Some(doc! { "created": -1 }));
        assert_eq!(opts.limit, Some(5));
        assert_eq!(opts.skip, Some(10));
    }

    #[test]
    fn test_index_spec_from_model() {
        let model = IndexModel::builder()
            .keys(doc! { "code": 1 })
            .options(IndexOptions::builder().unique(true).name("code_1".to_string()).build())
            .build();
        let spec = index_spec(model);
        assert_eq!(spec.name, "code_1");
        assert!(spec.unique);

        let id = index_spec(
            IndexModel::builder()
                .keys(doc! { "_id": 1 })
                .options(IndexOptions::builder().name(ID_INDEX_NAME.to_string()).build())
                .build(),
        );
        assert!(id.unique);
    }

    #[test]
    fn test_operator_detection() {
        assert!(is_operator_update(&doc! { "$set": { "a": 1 } }));
        assert!(!is_operator_update(&doc! { "a": 1 }));
    }
}

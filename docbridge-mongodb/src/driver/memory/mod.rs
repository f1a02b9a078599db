//! In-process store.
//!
//! [`MemoryConnector`] implements the store seam without a server. It keeps
//! every database in a shared [`MemoryStore`], enforces unique indexes and
//! understands the filter, update and pipeline subset the access layer
//! emits. It also counts connects and can simulate an unreachable or
//! failing server.

mod matcher;
mod pipeline;
mod update;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bson::{Bson, Document, doc, oid::ObjectId};
use parking_lot::RwLock;
use tracing::{debug, trace};

use super::{
    Command, Connector, DatabaseBackend, DeleteSummary, FindOptions, ID_INDEX_NAME, IndexSpec,
    InsertSummary, Reply, Session, UpdateSummary,
};
use crate::document::DocumentExt;
use crate::error::{StoreError, StoreResult};

use matcher::matches;

#[derive(Debug, Clone)]
struct MemoryCollection {
    documents: Vec<Document>,
    indexes: Vec<IndexSpec>,
}

impl MemoryCollection {
    fn new() -> Self {
        Self {
            documents: Vec::new(),
            indexes: vec![IndexSpec {
                name: ID_INDEX_NAME.to_string(),
                keys: doc! { "_id": 1 },
                unique: true,
            }],
        }
    }

    fn positions(&self, filter: &Document) -> StoreResult<Vec<usize>> {
        let mut found = Vec::new();
        for (pos, doc) in self.documents.iter().enumerate() {
            if matches(doc, filter)? {
                found.push(pos);
            }
        }
        Ok(found)
    }

    /// Reject `candidate` if it collides with another document on a unique
    /// index. `replacing` is the position the candidate will occupy.
    fn check_unique(&self, candidate: &Document, replacing: Option<usize>) -> StoreResult<()> {
        for index in self.indexes.iter().filter(|i| i.unique) {
            let key = index_key(index, candidate);
            let collides = self
                .documents
                .iter()
                .enumerate()
                .filter(|(pos, _)| Some(*pos) != replacing)
                .any(|(_, other)| keys_equal(&key, &index_key(index, other)));
            if collides {
                return Err(duplicate(index, &key));
            }
        }
        Ok(())
    }

    fn insert(&mut self, document: Document) -> StoreResult<Bson> {
        let document = if document.contains_key("_id") {
            document
        } else {
            let mut with_id = doc! { "_id": ObjectId::new() };
            with_id.extend(document);
            with_id
        };
        self.check_unique(&document, None)?;
        let id = document.get("_id").cloned().unwrap_or(Bson::Null);
        self.documents.push(document);
        Ok(id)
    }

    fn update(
        &mut self,
        filter: &Document,
        update: &Document,
        upsert: bool,
        multi: bool,
    ) -> StoreResult<(UpdateSummary, Option<Document>)> {
        let mut positions = self.positions(filter)?;
        if !multi {
            positions.truncate(1);
        }

        let mut summary = UpdateSummary::default();
        let mut post_image = None;
        for pos in positions {
            let mut next = self.documents[pos].clone();
            let changed = update::apply(&mut next, update, false)?;
            self.check_unique(&next, Some(pos))?;
            summary.matched_count += 1;
            if changed {
                summary.modified_count += 1;
            }
            self.documents[pos] = next.clone();
            post_image = Some(next);
        }

        if summary.matched_count == 0 && upsert {
            let document = update::upsert_document(filter, update)?;
            let id = self.insert(document.clone())?;
            summary.upserted_id = Some(id);
            post_image = Some(document);
        }
        Ok((summary, post_image))
    }

    fn delete(&mut self, filter: &Document, multi: bool) -> StoreResult<DeleteSummary> {
        let mut positions = self.positions(filter)?;
        if !multi {
            positions.truncate(1);
        }
        for pos in positions.iter().rev() {
            self.documents.remove(*pos);
        }
        Ok(DeleteSummary {
            deleted_count: positions.len() as u64,
        })
    }

    fn create_index(&mut self, keys: Document, unique: bool) -> StoreResult<String> {
        if keys.is_empty() {
            return Err(StoreError::invalid_command("index keys cannot be empty"));
        }
        let name = IndexSpec::default_name(&keys);
        if let Some(existing) = self.indexes.iter().find(|i| i.name == name) {
            if existing.unique == unique {
                return Ok(name);
            }
            return Err(StoreError::invalid_command(format!(
                "index '{name}' already exists with different options"
            )));
        }

        let spec = IndexSpec {
            name: name.clone(),
            keys,
            unique,
        };
        if unique {
            let keys: Vec<Vec<Bson>> = self.documents.iter().map(|d| index_key(&spec, d)).collect();
            for (i, key) in keys.iter().enumerate() {
                if keys[i + 1..].iter().any(|other| keys_equal(key, other)) {
                    return Err(duplicate(&spec, key));
                }
            }
        }
        self.indexes.push(spec);
        Ok(name)
    }

    fn find(&self, filter: &Document, options: &FindOptions) -> StoreResult<Vec<Document>> {
        let mut docs: Vec<Document> = self
            .positions(filter)?
            .into_iter()
            .map(|pos| self.documents[pos].clone())
            .collect();
        if let Some(sort) = &options.sort {
            pipeline::sort(&mut docs, sort);
        }
        let skip = options.skip.unwrap_or(0) as usize;
        let limit = match options.limit {
            Some(0) | None => usize::MAX,
            Some(n) => n.unsigned_abs() as usize,
        };
        Ok(docs.into_iter().skip(skip).take(limit).collect())
    }

    fn distinct(&self, field: &str, filter: &Document) -> StoreResult<Vec<Bson>> {
        let mut values: Vec<Bson> = Vec::new();
        for pos in self.positions(filter)? {
            let found = match self.documents[pos].get_path(field) {
                Some(Bson::Array(items)) => items.clone(),
                Some(value) => vec![value.clone()],
                None => continue,
            };
            for value in found {
                if !values.iter().any(|v| matcher::bson_eq(v, &value)) {
                    values.push(value);
                }
            }
        }
        Ok(values)
    }
}

fn index_key(index: &IndexSpec, doc: &Document) -> Vec<Bson> {
    index
        .fields()
        .map(|field| doc.get_path(field).cloned().unwrap_or(Bson::Null))
        .collect()
}

fn keys_equal(a: &[Bson], b: &[Bson]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| matcher::bson_eq(x, y))
}

fn duplicate(index: &IndexSpec, key: &[Bson]) -> StoreError {
    let mut rendered = Document::new();
    for (field, value) in index.fields().zip(key) {
        rendered.insert(field, value.clone());
    }
    StoreError::DuplicateKey {
        index: index.name.clone(),
        key: rendered.to_string(),
    }
}

type Databases = HashMap<String, HashMap<String, MemoryCollection>>;

/// Shared state of the in-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    databases: RwLock<Databases>,
    offline: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every command fail with a connection error while `offline`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Insert documents directly, enforcing unique indexes.
    pub fn seed(
        &self,
        database: &str,
        collection: &str,
        documents: Vec<Document>,
    ) -> StoreResult<()> {
        let mut databases = self.databases.write();
        let coll = databases
            .entry(database.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_insert_with(MemoryCollection::new);
        for document in documents {
            coll.insert(document)?;
        }
        Ok(())
    }

    /// Snapshot of a collection's documents in insertion order.
    pub fn documents(&self, database: &str, collection: &str) -> Vec<Document> {
        self.databases
            .read()
            .get(database)
            .and_then(|colls| colls.get(collection))
            .map(|coll| coll.documents.clone())
            .unwrap_or_default()
    }

    /// Number of documents in a collection.
    pub fn document_count(&self, database: &str, collection: &str) -> usize {
        self.databases
            .read()
            .get(database)
            .and_then(|colls| colls.get(collection))
            .map_or(0, |coll| coll.documents.len())
    }

    /// Sorted collection names of a database.
    pub fn collection_names(&self, database: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .databases
            .read()
            .get(database)
            .map(|colls| colls.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Sorted database names.
    pub fn database_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.databases.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Execute `command` against `database.collection`.
    pub fn execute(
        &self,
        database: &str,
        collection: &str,
        command: Command,
    ) -> StoreResult<Reply> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::connection("store is offline"));
        }
        trace!(database, collection, command = command.name(), "memory command");

        match command {
            Command::Find { filter, options } => {
                let docs = self.read(database, collection, |coll| coll.find(&filter, &options))?;
                Ok(Reply::Documents(docs.unwrap_or_default()))
            }
            Command::FindOne { filter, options } => {
                let docs = self.read(database, collection, |coll| {
                    coll.find(&filter, &options.limit(1))
                })?;
                Ok(Reply::Document(docs.and_then(|d| d.into_iter().next())))
            }
            Command::InsertOne { document } => {
                let id = self.write(database, collection, |coll| coll.insert(document))?;
                Ok(Reply::Inserted(InsertSummary {
                    inserted_ids: vec![id],
                }))
            }
            Command::InsertMany { documents } => {
                let ids = self.write(database, collection, |coll| {
                    documents
                        .into_iter()
                        .map(|document| coll.insert(document))
                        .collect::<StoreResult<Vec<_>>>()
                })?;
                Ok(Reply::Inserted(InsertSummary { inserted_ids: ids }))
            }
            Command::UpdateOne {
                filter,
                update,
                upsert,
            } => self.update(database, collection, &filter, &update, upsert, false),
            Command::UpdateMany {
                filter,
                update,
                upsert,
            } => self.update(database, collection, &filter, &update, upsert, true),
            Command::FindOneAndUpdate {
                filter,
                update,
                upsert,
            } => {
                let (_, post_image) = self.write(database, collection, |coll| {
                    coll.update(&filter, &update, upsert, false)
                })?;
                Ok(Reply::Document(post_image))
            }
            Command::DeleteOne { filter } => {
                let summary = self.write(database, collection, |coll| coll.delete(&filter, false))?;
                Ok(Reply::Deleted(summary))
            }
            Command::DeleteMany { filter } => {
                let summary = self.write(database, collection, |coll| coll.delete(&filter, true))?;
                Ok(Reply::Deleted(summary))
            }
            Command::Drop => {
                if let Some(colls) = self.databases.write().get_mut(database) {
                    colls.remove(collection);
                }
                Ok(Reply::Unit)
            }
            Command::CreateIndex { keys, unique } => {
                let name = self.write(
                    database,
                    collection,
                    |coll| coll.create_index(keys, unique),
                )?;
                Ok(Reply::IndexName(name))
            }
            Command::ListIndexes => {
                let indexes = self.read(database, collection, |coll| Ok(coll.indexes.clone()))?;
                Ok(Reply::Indexes(indexes.unwrap_or_default()))
            }
            Command::Aggregate { pipeline, .. } => {
                let databases = self.databases.read();
                let colls = databases.get(database);
                let input = colls
                    .and_then(|c| c.get(collection))
                    .map(|coll| coll.documents.clone())
                    .unwrap_or_default();
                let source = |name: &str| {
                    colls
                        .and_then(|c| c.get(name))
                        .map(|coll| coll.documents.clone())
                        .unwrap_or_default()
                };
                Ok(Reply::Documents(pipeline::run(input, &pipeline, &source)?))
            }
            Command::Distinct { field, filter } => {
                let values = self.read(
                    database,
                    collection,
                    |coll| coll.distinct(&field, &filter),
                )?;
                Ok(Reply::Values(values.unwrap_or_default()))
            }
            Command::Count { filter } => {
                let count = self.read(database, collection, |coll| {
                    Ok(coll.positions(&filter)?.len() as u64)
                })?;
                Ok(Reply::Count(count.unwrap_or(0)))
            }
        }
    }

    /// Run `f` on an existing collection; `None` if it does not exist.
    fn read<T>(
        &self,
        database: &str,
        collection: &str,
        f: impl FnOnce(&MemoryCollection) -> StoreResult<T>,
    ) -> StoreResult<Option<T>> {
        let databases = self.databases.read();
        databases
            .get(database)
            .and_then(|colls| colls.get(collection))
            .map(f)
            .transpose()
    }

    /// Run `f` on a collection, creating it first when missing.
    fn write<T>(
        &self,
        database: &str,
        collection: &str,
        f: impl FnOnce(&mut MemoryCollection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut databases = self.databases.write();
        let coll = databases
            .entry(database.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_insert_with(MemoryCollection::new);
        f(coll)
    }

    fn update(
        &self,
        database: &str,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
        multi: bool,
    ) -> StoreResult<Reply> {
        let (summary, _) = self.write(database, collection, |coll| {
            coll.update(filter, update, upsert, multi)
        })?;
        Ok(Reply::Updated(summary))
    }
}

/// Connector for the in-process store.
#[derive(Debug)]
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
    connects: AtomicUsize,
    unreachable: AtomicBool,
    delay: Option<Duration>,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    /// Create a connector over a fresh store.
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    /// Create a connector over an existing store.
    pub fn with_store(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            connects: AtomicUsize::new(0),
            unreachable: AtomicBool::new(false),
            delay: None,
        }
    }

    /// Wait this long in every connect.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make connects fail while `unreachable`.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of connect attempts so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// The shared store.
    pub fn store(&self) -> Arc<MemoryStore> {
        Arc::clone(&self.store)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, uri: &str) -> StoreResult<Arc<dyn Session>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::connection(format!("cannot reach {uri}")));
        }
        debug!(uri, "memory session opened");
        Ok(Arc::new(MemorySession {
            store: Arc::clone(&self.store),
            alive: Arc::new(AtomicBool::new(true)),
        }))
    }
}

/// Session over the in-process store.
#[derive(Debug)]
pub struct MemorySession {
    store: Arc<MemoryStore>,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl Session for MemorySession {
    fn database(&self, name: &str) -> Arc<dyn DatabaseBackend> {
        Arc::new(MemoryDatabase {
            name: name.to_string(),
            store: Arc::clone(&self.store),
            alive: Arc::clone(&self.alive),
        })
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// A database view over the in-process store.
#[derive(Debug)]
pub struct MemoryDatabase {
    name: String,
    store: Arc<MemoryStore>,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl DatabaseBackend for MemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, collection: &str, command: Command) -> StoreResult<Reply> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(StoreError::connection("session is closed"));
        }
        self.store.execute(&self.name, collection, command)
    }
}

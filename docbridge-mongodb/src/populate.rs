//! Relationship resolution ("populate").
//!
//! Foreign keys are inferred from field names: with the default
//! convention a field `customer_id` joins the `customer` collection on its
//! primary key and the joined documents land in a `customer` array.
//!
//! Planning is pure ([`plan_auto`], [`plan_manual`]); the [`Resolver`] asks a
//! [`SchemaProbe`] which fields are in play, plans, and runs either a plain
//! filtered read or an aggregation pipeline.

use async_trait::async_trait;
use bson::Document;
use indexmap::IndexSet;
use tracing::{debug, warn};

use crate::coerce::Coercion;
use crate::driver::{Command, FindOptions};
use crate::error::DocbridgeResult;
use crate::executor::{CoercionPolicy, CommandExecutor};
use crate::filter;
use crate::naming::NamingConvention;
use crate::stages::{lookup_stage, match_stage};

/// Discovers which field names are in play for an automatic populate.
#[async_trait]
pub trait SchemaProbe: Send + Sync {
    /// Field names to consider, or `None` when no document exists to
    /// inspect. `filter` is already coerced.
    async fn field_names(
        &self,
        executor: &CommandExecutor,
        collection: &str,
        database: Option<&str>,
        filter: &Document,
    ) -> DocbridgeResult<Option<Vec<String>>>;
}

/// Reads the keys of the first document matching the filter.
#[derive(Debug, Clone, Copy, Default)]
pub struct SampleProbe;

#[async_trait]
impl SchemaProbe for SampleProbe {
    async fn field_names(
        &self,
        executor: &CommandExecutor,
        collection: &str,
        database: Option<&str>,
        filter: &Document,
    ) -> DocbridgeResult<Option<Vec<String>>> {
        let sample = executor
            .execute(
                "populate_probe",
                collection,
                database,
                CoercionPolicy::RAW,
                Command::FindOne {
                    filter: filter.clone(),
                    options: FindOptions::new(),
                },
            )
            .await?
            .into_document()?;
        Ok(sample.map(|doc| doc.keys().cloned().collect()))
    }
}

/// Unions the keys of every document in the collection.
///
/// Reads the whole collection; use on small collections only.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyUnionScanProbe;

#[async_trait]
impl SchemaProbe for KeyUnionScanProbe {
    async fn field_names(
        &self,
        executor: &CommandExecutor,
        collection: &str,
        database: Option<&str>,
        _filter: &Document,
    ) -> DocbridgeResult<Option<Vec<String>>> {
        let docs = executor
            .execute(
                "populate_scan",
                collection,
                database,
                CoercionPolicy::RAW,
                Command::Find {
                    filter: Document::new(),
                    options: FindOptions::new(),
                },
            )
            .await?
            .into_documents()?;
        warn!(
            collection,
            documents = docs.len(),
            "populate is scanning the whole collection for field names"
        );
        if docs.is_empty() {
            return Ok(None);
        }
        let keys: IndexSet<String> = docs
            .into_iter()
            .flat_map(|doc| doc.into_iter().map(|(k, _)| k))
            .collect();
        Ok(Some(keys.into_iter().collect()))
    }
}

/// Samples one matching document; falls back to a key-union scan when
/// nothing matches.
#[derive(Debug, Clone, Copy, Default)]
pub struct SampleOrScanProbe;

#[async_trait]
impl SchemaProbe for SampleOrScanProbe {
    async fn field_names(
        &self,
        executor: &CommandExecutor,
        collection: &str,
        database: Option<&str>,
        filter: &Document,
    ) -> DocbridgeResult<Option<Vec<String>>> {
        match SampleProbe.field_names(executor, collection, database, filter).await? {
            Some(fields) => Ok(Some(fields)),
            None => {
                KeyUnionScanProbe
                    .field_names(executor, collection, database, filter)
                    .await
            }
        }
    }
}

/// A declared field list; never touches the store.
#[derive(Debug, Clone, Default)]
pub struct StaticSchemaProbe {
    fields: Vec<String>,
}

impl StaticSchemaProbe {
    /// Declare the field names.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl SchemaProbe for StaticSchemaProbe {
    async fn field_names(
        &self,
        _executor: &CommandExecutor,
        _collection: &str,
        _database: Option<&str>,
        _filter: &Document,
    ) -> DocbridgeResult<Option<Vec<String>>> {
        Ok(Some(self.fields.clone()))
    }
}

/// How joins are chosen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum JoinMode {
    /// Infer joins from the probed field names.
    #[default]
    Auto,
    /// Join exactly these collections.
    Manual(Vec<String>),
}

/// Options of a populate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PopulateOptions {
    /// Join selection.
    pub mode: JoinMode,
    /// Skip soft-deleted documents.
    pub exclude_deleted: bool,
}

impl PopulateOptions {
    /// Automatic joins.
    pub fn auto() -> Self {
        Self::default()
    }

    /// Joins on the named collections.
    pub fn manual<I, S>(collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mode: JoinMode::Manual(collections.into_iter().map(Into::into).collect()),
            exclude_deleted: false,
        }
    }

    /// Skip soft-deleted documents.
    pub fn exclude_deleted(mut self) -> Self {
        self.exclude_deleted = true;
        self
    }
}

/// How a populate reads.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadPlan {
    /// A plain filtered read; no joins apply.
    Filtered(Document),
    /// An aggregation pipeline.
    Pipeline(Vec<Document>),
}

/// Plan an automatic populate over `fields`.
///
/// Every identifier field other than the primary key becomes a `$lookup`
/// after a leading `$match`. Without such fields the plan is a plain read.
pub fn plan_auto(naming: &NamingConvention, filter: Document, fields: &[String]) -> ReadPlan {
    let lookups: Vec<Document> = fields
        .iter()
        .filter_map(|field| {
            naming.related_collection(field).map(|target| {
                lookup_stage(&target, field, naming.primary_key.as_str(), &target)
            })
        })
        .collect();
    if lookups.is_empty() {
        return ReadPlan::Filtered(filter);
    }
    let mut pipeline = Vec::with_capacity(lookups.len() + 1);
    pipeline.push(match_stage(filter));
    pipeline.extend(lookups);
    ReadPlan::Pipeline(pipeline)
}

/// Plan a populate joining `collections`.
///
/// The filter leads as `$match` only when it is non-empty.
pub fn plan_manual(
    naming: &NamingConvention,
    filter: Document,
    collections: &[String],
) -> ReadPlan {
    if collections.is_empty() {
        return ReadPlan::Filtered(filter);
    }
    let mut pipeline = Vec::with_capacity(collections.len() + 1);
    if !filter.is_empty() {
        pipeline.push(match_stage(filter));
    }
    pipeline.extend(collections.iter().map(|name| {
        lookup_stage(
            name,
            &naming.foreign_key_for(name),
            naming.primary_key.as_str(),
            name,
        )
    }));
    ReadPlan::Pipeline(pipeline)
}

/// Runs populates through a [`CommandExecutor`].
pub struct Resolver<'a> {
    executor: &'a CommandExecutor,
    probe: &'a dyn SchemaProbe,
}

impl<'a> Resolver<'a> {
    /// Create a resolver.
    pub fn new(executor: &'a CommandExecutor, probe: &'a dyn SchemaProbe) -> Self {
        Self { executor, probe }
    }

    /// Resolve `filter` over `collection` with joins.
    pub async fn resolve(
        &self,
        filter: Document,
        collection: &str,
        database: Option<&str>,
        options: &PopulateOptions,
    ) -> DocbridgeResult<Vec<Document>> {
        let naming = self.executor.naming();
        let mut filter = self.executor.coercer().apply(filter, Coercion::Ids)?;
        if options.exclude_deleted {
            filter = filter::not_deleted(naming, filter);
        }

        let plan = match &options.mode {
            JoinMode::Manual(collections) => plan_manual(naming, filter, collections),
            JoinMode::Auto => {
                let fields = self
                    .probe
                    .field_names(self.executor, collection, database, &filter)
                    .await?;
                match fields {
                    Some(fields) => plan_auto(naming, filter, &fields),
                    None => {
                        debug!(collection, "populate found no document to probe");
                        return Ok(Vec::new());
                    }
                }
            }
        };

        let command = match plan {
            ReadPlan::Filtered(filter) => Command::Find {
                filter,
                options: FindOptions::new(),
            },
            ReadPlan::Pipeline(pipeline) => {
                debug!(collection, stages = pipeline.len(), "populate pipeline");
                Command::Aggregate {
                    pipeline,
                    allow_disk_use: true,
                }
            }
        };
        let docs = self
            .executor
            .execute("populate", collection, database, CoercionPolicy::RAW, command)
            .await?
            .into_documents()?;
        Ok(docs)
    }
}

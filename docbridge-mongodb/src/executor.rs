//! Command dispatch.
//!
//! The [`CommandExecutor`] is the single path to the store: it resolves the
//! target database, connects lazily, coerces the command and runs it. It
//! never swallows errors; [`settle`] is where the public verbs turn store
//! failures into their empty sentinels.

use std::sync::Arc;

use bson::Document;
use tracing::{debug, error};

use crate::coerce::{Coercer, Coercion};
use crate::connection::{ConnectionManager, ConnectionState, DatabaseHandle};
use crate::driver::{Command, Reply};
use crate::error::{DocbridgeError, DocbridgeResult};
use crate::naming::NamingConvention;

/// Coercions applied to the two sides of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoercionPolicy {
    /// Applied to filters and pipeline stages.
    pub filter: Coercion,
    /// Applied to inserted documents and update documents.
    pub payload: Coercion,
}

impl CoercionPolicy {
    /// No coercion.
    pub const RAW: Self = Self::new(Coercion::None, Coercion::None);
    /// Identifier coercion of the filter.
    pub const FILTER_IDS: Self = Self::new(Coercion::Ids, Coercion::None);
    /// Identifier and date coercion of the payload.
    pub const WRITE: Self = Self::new(Coercion::None, Coercion::IdsAndDates);
    /// Identifier coercion of the filter, identifiers and dates in the payload.
    pub const FILTERED_WRITE: Self = Self::new(Coercion::Ids, Coercion::IdsAndDates);

    /// Create a policy.
    pub const fn new(filter: Coercion, payload: Coercion) -> Self {
        Self { filter, payload }
    }
}

/// Resolves databases, connects lazily and dispatches commands.
#[derive(Debug)]
pub struct CommandExecutor {
    manager: Arc<ConnectionManager>,
    uri: String,
    default_database: Option<String>,
    coercer: Coercer,
}

impl CommandExecutor {
    /// Create an executor.
    pub fn new(
        manager: Arc<ConnectionManager>,
        uri: impl Into<String>,
        default_database: Option<String>,
        coercer: Coercer,
    ) -> Self {
        Self {
            manager,
            uri: uri.into(),
            default_database: default_database.filter(|name| !name.is_empty()),
            coercer,
        }
    }

    /// The connection manager.
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// The coercer.
    pub fn coercer(&self) -> &Coercer {
        &self.coercer
    }

    /// The naming convention.
    pub fn naming(&self) -> &NamingConvention {
        self.coercer.naming()
    }

    /// The configured URI.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The default database, if any.
    pub fn default_database(&self) -> Option<&str> {
        self.default_database.as_deref()
    }

    /// The override if non-empty, else the default.
    pub fn resolve_database(&self, database: Option<&str>) -> DocbridgeResult<String> {
        database
            .filter(|name| !name.is_empty())
            .or(self.default_database.as_deref())
            .map(str::to_string)
            .ok_or_else(|| {
                DocbridgeError::config("no database given and no default database configured")
            })
    }

    /// A handle for the resolved database, connecting first if needed.
    ///
    /// A manager closed with `close_all` stays closed until reconnected
    /// explicitly.
    pub async fn handle(&self, database: Option<&str>) -> DocbridgeResult<DatabaseHandle> {
        let name = self.resolve_database(database)?;
        self.ensure_connected().await?;
        self.manager.get_database(&name)
    }

    async fn ensure_connected(&self) -> DocbridgeResult<()> {
        if self.manager.is_connected() {
            return Ok(());
        }
        if self.manager.state() == ConnectionState::Closed {
            return Err(DocbridgeError::not_connected("the connection manager was closed"));
        }
        self.manager.connect(&self.uri).await?;
        Ok(())
    }

    /// Run `command` against `collection`.
    ///
    /// Coercion happens before anything touches the store, so a malformed
    /// identifier never costs a connect.
    pub async fn execute(
        &self,
        operation: &str,
        collection: &str,
        database: Option<&str>,
        policy: CoercionPolicy,
        command: Command,
    ) -> DocbridgeResult<Reply> {
        let name = self.resolve_database(database)?;
        let command = self.prepare(command, policy)?;
        self.ensure_connected().await?;
        let handle = self.manager.get_database(&name)?;

        debug!(
            operation,
            database = %name,
            collection,
            command = command.name(),
            "dispatching command"
        );
        Ok(handle.execute(collection, command).await?)
    }

    /// Apply `policy` to the filter and payload sides of `command`.
    pub fn prepare(&self, command: Command, policy: CoercionPolicy) -> DocbridgeResult<Command> {
        let filter = |doc: Document| self.coercer.apply(doc, policy.filter);
        let payload = |doc: Document| self.coercer.apply(doc, policy.payload);

        Ok(match command {
            Command::Find { filter: f, options } => Command::Find {
                filter: filter(f)?,
                options,
            },
            Command::FindOne { filter: f, options } => Command::FindOne {
                filter: filter(f)?,
                options,
            },
            Command::InsertOne { document } => Command::InsertOne {
                document: payload(document)?,
            },
            Command::InsertMany { documents } => Command::InsertMany {
                documents: self.coercer.apply_all(documents, policy.payload)?,
            },
            Command::UpdateOne {
                filter: f,
                update,
                upsert,
            } => Command::UpdateOne {
                filter: filter(f)?,
                update: payload(update)?,
                upsert,
            },
            Command::UpdateMany {
                filter: f,
                update,
                upsert,
            } => Command::UpdateMany {
                filter: filter(f)?,
                update: payload(update)?,
                upsert,
            },
            Command::FindOneAndUpdate {
                filter: f,
                update,
                upsert,
            } => Command::FindOneAndUpdate {
                filter: filter(f)?,
                update: payload(update)?,
                upsert,
            },
            Command::DeleteOne { filter: f } => Command::DeleteOne { filter: filter(f)? },
            Command::DeleteMany { filter: f } => Command::DeleteMany { filter: filter(f)? },
            Command::Aggregate {
                pipeline,
                allow_disk_use,
            } => Command::Aggregate {
                pipeline: self.coercer.apply_all(pipeline, policy.filter)?,
                allow_disk_use,
            },
            Command::Distinct { field, filter: f } => Command::Distinct {
                field,
                filter: filter(f)?,
            },
            Command::Count { filter: f } => Command::Count { filter: filter(f)? },
            other @ (Command::Drop | Command::CreateIndex { .. } | Command::ListIndexes) => other,
        })
    }
}

/// Fold a store failure into `sentinel`, logging it under `operation`.
///
/// Configuration, connection-state and coercion errors pass through.
pub fn settle<T>(operation: &str, result: DocbridgeResult<T>, sentinel: T) -> DocbridgeResult<T> {
    match result {
        Ok(value) => Ok(value),
        Err(DocbridgeError::Store(e)) => {
            error!(operation, error = %e, "store operation failed");
            Ok(sentinel)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::FindOptions;
    use crate::driver::memory::MemoryConnector;
    use crate::error::StoreError;
    use bson::{Bson, doc, oid::ObjectId};
    use pretty_assertions::assert_eq;

    const HEX: &str = "507f1f77bcf86cd799439011";

    fn executor(default_database: Option<&str>) -> (Arc<MemoryConnector>, CommandExecutor) {
        let connector = Arc::new(MemoryConnector::new());
        let manager = Arc::new(ConnectionManager::new(connector.clone()));
        let executor = CommandExecutor::new(
            manager,
            "memory://local",
            default_database.map(str::to_string),
            Coercer::default(),
        );
        (connector, executor)
    }

    #[test]
    fn test_resolve_database() {
        let (_, exec) = executor(Some("main"));
        assert_eq!(exec.resolve_database(Some("other")).unwrap(), "other");
        assert_eq!(exec.resolve_database(Some("")).unwrap(), "main");
        assert_eq!(exec.resolve_database(None).unwrap(), "main");

        let (_, exec) = executor(None);
        assert!(exec.resolve_database(None).unwrap_err().is_config());
        let (_, exec) = executor(Some(""));
        assert!(exec.resolve_database(Some("")).unwrap_err().is_config());
    }

    #[test]
    fn test_prepare_coerces_sides() {
        let (_, exec) = executor(Some("main"));
        let command = Command::UpdateOne {
            filter: doc! { "owner_id": HEX },
            update: doc! { "$set": { "parent_id": HEX, "seen_datetime": "2024-03-01" } },
            upsert: false,
        };
        let prepared = exec.prepare(command, CoercionPolicy::FILTERED_WRITE).unwrap();
        let Command::UpdateOne { filter, update, .. } = prepared else {
            panic!("variant changed");
        };
        let oid = ObjectId::parse_str(HEX).unwrap();
        assert_eq!(filter, doc! { "owner_id": oid });
        let set = update.get_document("$set").unwrap();
        assert_eq!(set.get("parent_id"), Some(&Bson::ObjectId(oid)));
        assert!(matches!(set.get("seen_datetime"), Some(Bson::DateTime(_))));

        // The raw policy leaves everything alone.
        let command = Command::Find {
            filter: doc! { "owner_id": HEX },
            options: FindOptions::new(),
        };
        assert_eq!(exec.prepare(command.clone(), CoercionPolicy::RAW).unwrap(), command);
    }

    #[tokio::test]
    async fn test_lazy_connect_once() {
        let (connector, exec) = executor(Some("main"));
        for _ in 0..3 {
            exec.execute(
                "count",
                "c",
                None,
                CoercionPolicy::RAW,
                Command::Count { filter: doc! {} },
            )
            .await
            .unwrap();
        }
        assert_eq!(connector.connect_count(), 1);
        assert_eq!(exec.manager().cached_databases(), vec!["main"]);
    }

    #[tokio::test]
    async fn test_coercion_error_precedes_connect() {
        let (connector, exec) = executor(Some("main"));
        let err = exec
            .execute(
                "find",
                "c",
                None,
                CoercionPolicy::FILTER_IDS,
                Command::Find {
                    filter: doc! { "owner_id": "nope" },
                    options: FindOptions::new(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.field(), Some("owner_id"));
        assert_eq!(connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_manager_is_not_connected() {
        let (_, exec) = executor(Some("main"));
        exec.handle(None).await.unwrap();
        exec.manager().close_all().await;
        let err = exec.handle(None).await.unwrap_err();
        assert!(err.is_not_connected());
    }

    #[tokio::test]
    async fn test_unreachable_is_store_error() {
        let (connector, exec) = executor(Some("main"));
        connector.set_unreachable(true);
        let err = exec.handle(None).await.unwrap_err();
        assert!(err.is_store());
    }

    #[test]
    fn test_settle() {
        let store: DocbridgeResult<Vec<u8>> = Err(StoreError::connection("refused").into());
        assert_eq!(settle("find", store, Vec::new()).unwrap(), Vec::<u8>::new());

        let config: DocbridgeResult<Vec<u8>> = Err(DocbridgeError::config("no database"));
        assert!(settle("find", config, Vec::new()).unwrap_err().is_config());

        assert_eq!(settle("find", Ok(vec![1]), Vec::new()).unwrap(), vec![1]);
    }
}

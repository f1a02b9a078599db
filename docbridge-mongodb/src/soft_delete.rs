//! Logical deletion that keeps unique indexes usable.
//!
//! Soft-deleting a document sets its status field to the deleted marker
//! and rewrites every field covered by a unique index (other than the
//! primary key) to a tombstone of the form `Deleted<unixMillis>-<original>`.
//! A logically new document may then reuse the natural key.

use bson::{Bson, Document, doc};
use indexmap::IndexSet;
use tracing::{debug, warn};

use crate::coerce::Coercion;
use crate::document::{DocumentExt, plain_string};
use crate::driver::{Command, FindOptions};
use crate::executor::{CoercionPolicy, CommandExecutor};
use crate::error::DocbridgeResult;

/// Tombstone value format.
pub struct Tombstone;

impl Tombstone {
    /// Prefix of every tombstoned value.
    pub const PREFIX: &'static str = "Deleted";

    /// Tombstone `value` at `millis` since the epoch.
    pub fn mark(value: &Bson, millis: i64) -> String {
        format!("{}{}-{}", Self::PREFIX, millis, plain_string(value))
    }

    /// Whether `value` already carries a tombstone.
    pub fn is_tombstoned(value: &Bson) -> bool {
        matches!(value, Bson::String(s) if Self::split(s).is_some())
    }

    /// The original value of a tombstone, as text.
    pub fn original(value: &str) -> Option<&str> {
        Self::split(value).map(|(_, original)| original)
    }

    /// The deletion time of a tombstone, in milliseconds.
    pub fn deleted_at(value: &str) -> Option<i64> {
        Self::split(value).and_then(|(millis, _)| millis.parse().ok())
    }

    fn split(value: &str) -> Option<(&str, &str)> {
        let rest = value.strip_prefix(Self::PREFIX)?;
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            return None;
        }
        let (millis, tail) = rest.split_at(digits);
        tail.strip_prefix('-').map(|original| (millis, original))
    }
}

/// Outcome of a soft delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SoftDeleteReport {
    /// Documents matched by the identifier (0 or 1).
    pub matched_count: u64,
    /// Fields rewritten to tombstones in this call.
    pub tombstoned: Vec<String>,
}

/// Runs soft deletes through a [`CommandExecutor`].
pub struct SoftDeleteGuard<'a> {
    executor: &'a CommandExecutor,
}

impl<'a> SoftDeleteGuard<'a> {
    /// Create a guard.
    pub fn new(executor: &'a CommandExecutor) -> Self {
        Self { executor }
    }

    /// Fields covered by unique indexes other than the primary key.
    pub async fn unique_fields(
        &self,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Vec<String>> {
        let naming = self.executor.naming();
        let indexes = self
            .executor
            .execute("indexes", collection, database, CoercionPolicy::RAW, Command::ListIndexes)
            .await?
            .into_indexes()?;

        let mut fields = IndexSet::new();
        for index in indexes.iter().filter(|index| index.unique) {
            if index.fields().all(|field| naming.is_primary_key(field)) {
                continue;
            }
            fields.extend(
                index
                    .fields()
                    .filter(|field| !naming.is_primary_key(field))
                    .map(str::to_string),
            );
        }
        Ok(fields.into_iter().collect())
    }

    /// Mark the document with primary key `id` deleted and tombstone its
    /// unique fields.
    pub async fn soft_delete(
        &self,
        id: Bson,
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<SoftDeleteReport> {
        let naming = self.executor.naming();
        let filter = self
            .executor
            .coercer()
            .apply(doc! { naming.primary_key.as_str(): id }, Coercion::Ids)?;

        let status = doc! {
            "$set": { naming.status_field.as_str(): naming.deleted_marker.as_str() }
        };
        let summary = self
            .executor
            .execute(
                "soft_delete",
                collection,
                database,
                CoercionPolicy::RAW,
                Command::UpdateOne {
                    filter: filter.clone(),
                    update: status,
                    upsert: false,
                },
            )
            .await?
            .into_updated()?;

        let mut report = SoftDeleteReport {
            matched_count: summary.matched_count,
            tombstoned: Vec::new(),
        };
        if summary.matched_count == 0 {
            return Ok(report);
        }

        let fields = self.unique_fields(collection, database).await?;
        if fields.is_empty() {
            return Ok(report);
        }
        let current = self
            .executor
            .execute(
                "soft_delete",
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
        if let Some(current) = current {
            report.tombstoned = self
                .tombstone(&current, filter, &fields, collection, database)
                .await?;
        }
        debug!(collection, fields = ?report.tombstoned, "soft delete applied");
        Ok(report)
    }

    /// Tombstone the unique fields of deleted documents that a partial
    /// soft delete left untouched. Returns the number of repaired documents.
    pub async fn repair(&self, collection: &str, database: Option<&str>) -> DocbridgeResult<u64> {
        let fields = self.unique_fields(collection, database).await?;
        if fields.is_empty() {
            return Ok(0);
        }
        let naming = self.executor.naming();
        let deleted = self
            .executor
            .execute(
                "repair_tombstones",
                collection,
                database,
                CoercionPolicy::RAW,
                Command::Find {
                    filter: doc! { naming.status_field.as_str(): naming.deleted_marker.as_str() },
                    options: FindOptions::new(),
                },
            )
            .await?
            .into_documents()?;

        let mut repaired = 0;
        for document in deleted {
            let Some(id) = document.get(naming.primary_key.as_str()).cloned() else {
                continue;
            };
            let filter = doc! { naming.primary_key.as_str(): id };
            let rewritten = self
                .tombstone(&document, filter, &fields, collection, database)
                .await?;
            if !rewritten.is_empty() {
                warn!(collection, fields = ?rewritten, "repaired partial soft delete");
                repaired += 1;
            }
        }
        Ok(repaired)
    }

    async fn tombstone(
        &self,
        current: &Document,
        filter: Document,
        fields: &[String],
        collection: &str,
        database: Option<&str>,
    ) -> DocbridgeResult<Vec<String>> {
        let millis = chrono::Utc::now().timestamp_millis();
        let mut set = Document::new();
        for field in fields {
            match current.get_path(field) {
                Some(value) if !Tombstone::is_tombstoned(value) => {
                    set.insert(field.as_str(), Tombstone::mark(value, millis));
                }
                _ => {}
            }
        }
        if set.is_empty() {
            return Ok(Vec::new());
        }

        let rewritten: Vec<String> = set.keys().cloned().collect();
        self.executor
            .execute(
                "soft_delete",
                collection,
                database,
                CoercionPolicy::RAW,
                Command::UpdateOne {
                    filter,
                    update: doc! { "$set": set },
                    upsert: false,
                },
            )
            .await?;
        Ok(rewritten)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coerce::Coercer;
    use crate::connection::ConnectionManager;
    use crate::driver::memory::MemoryConnector;
    use bson::oid::ObjectId;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    const PEN: &str = "65e1a3c0f1d2c3b4a5968778";

    #[test]
    fn test_tombstone_format() {
        let marked = Tombstone::mark(&Bson::from("SKU-1"), 1_709_287_200_000);
        assert_eq!(marked, "Deleted1709287200000-SKU-1");
        assert!(Tombstone::is_tombstoned(&Bson::from(marked.as_str())));
        assert_eq!(Tombstone::original(&marked), Some("SKU-1"));
        assert_eq!(Tombstone::deleted_at(&marked), Some(1_709_287_200_000));

        assert!(!Tombstone::is_tombstoned(&Bson::from("Deleted-x")));
        assert!(!Tombstone::is_tombstoned(&Bson::from("Deletedabc-x")));
        assert!(!Tombstone::is_tombstoned(&Bson::from(42)));
        assert_eq!(Tombstone::mark(&Bson::from(42), 5), "Deleted5-42");
    }

    async fn setup() -> (Arc<MemoryConnector>, CommandExecutor) {
        let connector = Arc::new(MemoryConnector::new());
        let manager = Arc::new(ConnectionManager::new(connector.clone()));
        let executor = CommandExecutor::new(
            manager,
            "memory://local",
            Some("shop".into()),
            Coercer::default(),
        );
        executor
            .execute(
                "create_unique_index",
                "product",
                None,
                CoercionPolicy::RAW,
                Command::CreateIndex {
                    keys: doc! { "code": 1 },
                    unique: true,
                },
            )
            .await
            .unwrap();
        connector
            .store()
            .seed(
                "shop",
                "product",
                vec![doc! { "_id": ObjectId::parse_str(PEN).unwrap(), "code": "A", "name": "pen" }],
            )
            .unwrap();
        (connector, executor)
    }

    #[tokio::test]
    async fn test_unique_fields_skip_primary_key() {
        let (_, executor) = setup().await;
        let guard = SoftDeleteGuard::new(&executor);
        assert_eq!(guard.unique_fields("product", None).await.unwrap(), vec!["code"]);
    }

    #[tokio::test]
    async fn test_soft_delete_is_idempotent() {
        let (connector, executor) = setup().await;
        let guard = SoftDeleteGuard::new(&executor);

        let report = guard.soft_delete(Bson::from(PEN), "product", None).await.unwrap();
        assert_eq!(report.matched_count, 1);
        assert_eq!(report.tombstoned, vec!["code"]);
        let first = connector.store().documents("shop", "product").remove(0);

        let report = guard.soft_delete(Bson::from(PEN), "product", None).await.unwrap();
        assert!(report.tombstoned.is_empty());
        let second = connector.store().documents("shop", "product").remove(0);

        assert_eq!(first, second);
        assert_eq!(second.get_str("status").unwrap(), "deleted");
        assert_eq!(Tombstone::original(second.get_str("code").unwrap()), Some("A"));
    }

    #[tokio::test]
    async fn test_missing_document() {
        let (_, executor) = setup().await;
        let guard = SoftDeleteGuard::new(&executor);
        let report = guard
            .soft_delete(Bson::from("65e1a3c0f1d2c3b4a5968779"), "product", None)
            .await
            .unwrap();
        assert_eq!(report, SoftDeleteReport::default());
    }

    #[tokio::test]
    async fn test_repair_partial_delete() {
        let (connector, executor) = setup().await;
        connector
            .store()
            .seed("shop", "product", vec![doc! { "_id": 2, "code": "B", "status": "deleted" }])
            .unwrap();
        let guard = SoftDeleteGuard::new(&executor);
        assert_eq!(guard.repair("product", None).await.unwrap(), 1);
        assert_eq!(guard.repair("product", None).await.unwrap(), 0);

        let docs = connector.store().documents("shop", "product");
        assert!(Tombstone::is_tombstoned(docs[1].get("code").unwrap()));
        assert_eq!(docs[0].get_str("code").unwrap(), "A");
    }
}
